use super::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use domain::{BranchName, DeliveryId, RepositoryId, Timestamp};

struct RecordingHandler {
    calls: AtomicUsize,
    fail: bool,
    delay: Duration,
}

impl RecordingHandler {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            fail: false,
            delay: Duration::ZERO,
        })
    }

    fn failing() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            fail: true,
            delay: Duration::ZERO,
        })
    }

    fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            fail: false,
            delay,
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BranchEventHandler for RecordingHandler {
    async fn handle(&self, _event: &BranchEvent) -> Result<(), ControllerError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            Err(ControllerError::transient("create_stack", "throttled"))
        } else {
            Ok(())
        }
    }
}

fn event(kind: EventKind, delivery: Option<&str>) -> BranchEvent {
    BranchEvent {
        kind,
        branch_name: BranchName::parse("feat-1").unwrap(),
        repository: RepositoryId::parse("octo-org/widgets").unwrap(),
        delivery_id: delivery.and_then(DeliveryId::new),
        sender: None,
        received_at: Timestamp::now(),
    }
}

fn bus_with(
    router: EventRouter,
) -> (Arc<InProcessEventBus>, tokio::task::JoinHandle<()>) {
    let (bus, worker) = InProcessEventBus::new(
        router,
        BusSettings::default(),
        DeliveryWindow::new(Duration::from_secs(60), 100),
    );
    (Arc::new(bus), tokio::spawn(worker.run()))
}

async fn wait_for(condition: impl Fn() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_route_selects_handler_by_kind() {
    let created = RecordingHandler::new();
    let deleted = RecordingHandler::new();
    let router = EventRouter::new()
        .subscribe(EventKind::Created, created.clone())
        .subscribe(EventKind::Deleted, deleted.clone());

    router.route(&event(EventKind::Deleted, None)).await.unwrap();

    assert_eq!(created.calls(), 0);
    assert_eq!(deleted.calls(), 1);
}

#[tokio::test]
async fn test_route_without_handler_fails() {
    let router = EventRouter::new();
    let err = router.route(&event(EventKind::Created, None)).await.unwrap_err();
    assert_eq!(err.reason_code(), "fatal");
}

// ---------------------------------------------------------------------------
// Bus
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_publish_without_subscriber_is_rejected() {
    let (bus, _worker) = bus_with(EventRouter::new());

    assert_eq!(
        bus.publish(event(EventKind::Created, None)).await,
        Err(BusError::NoSubscriber {
            kind: EventKind::Created
        })
    );
}

#[tokio::test]
async fn test_published_event_reaches_handler() {
    let handler = RecordingHandler::new();
    let (bus, _worker) = bus_with(EventRouter::new().subscribe(EventKind::Created, handler.clone()));

    bus.publish(event(EventKind::Created, Some("d-1"))).await.unwrap();

    wait_for(|| handler.calls() == 1).await;
}

#[tokio::test]
async fn test_duplicate_delivery_is_dispatched_once() {
    let handler = RecordingHandler::new();
    let (bus, worker) = bus_with(EventRouter::new().subscribe(EventKind::Created, handler.clone()));

    bus.publish(event(EventKind::Created, Some("d-1"))).await.unwrap();
    bus.publish(event(EventKind::Created, Some("d-1"))).await.unwrap();
    drop(bus);
    worker.await.unwrap();

    assert_eq!(handler.calls(), 1);
}

#[tokio::test]
async fn test_events_without_delivery_id_are_always_dispatched() {
    let handler = RecordingHandler::new();
    let (bus, worker) = bus_with(EventRouter::new().subscribe(EventKind::Created, handler.clone()));

    bus.publish(event(EventKind::Created, None)).await.unwrap();
    bus.publish(event(EventKind::Created, None)).await.unwrap();
    drop(bus);
    worker.await.unwrap();

    assert_eq!(handler.calls(), 2);
}

#[tokio::test]
async fn test_failed_delivery_runs_again_when_redelivered() {
    let handler = RecordingHandler::failing();
    let (bus, _worker) = bus_with(EventRouter::new().subscribe(EventKind::Created, handler.clone()));

    bus.publish(event(EventKind::Created, Some("d-1"))).await.unwrap();
    wait_for(|| bus.window.lock().unwrap().is_empty()).await;

    bus.publish(event(EventKind::Created, Some("d-1"))).await.unwrap();
    wait_for(|| handler.calls() == 2).await;
}

#[tokio::test]
async fn test_publish_after_worker_stopped_reports_closed() {
    let handler = RecordingHandler::new();
    let (bus, worker) = InProcessEventBus::new(
        EventRouter::new().subscribe(EventKind::Deleted, handler),
        BusSettings::default(),
        DeliveryWindow::disabled(),
    );
    drop(worker);

    assert_eq!(
        bus.publish(event(EventKind::Deleted, Some("d-9"))).await,
        Err(BusError::Closed)
    );
}

#[tokio::test]
async fn test_worker_drains_in_flight_handlers_on_close() {
    let handler = RecordingHandler::slow(Duration::from_millis(20));
    let (bus, worker) = bus_with(EventRouter::new().subscribe(EventKind::Created, handler.clone()));

    for id in ["d-1", "d-2", "d-3"] {
        bus.publish(event(EventKind::Created, Some(id))).await.unwrap();
    }
    drop(bus);
    worker.await.unwrap();

    assert_eq!(handler.calls(), 3);
}

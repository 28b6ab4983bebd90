use super::*;

fn id(value: &str) -> DeliveryId {
    DeliveryId::new(value).unwrap()
}

#[test]
fn test_repeated_delivery_is_rejected_within_window() {
    let mut window = DeliveryWindow::new(Duration::from_secs(60), 10);
    let now = Instant::now();

    assert!(window.insert(id("a"), now));
    assert!(!window.insert(id("a"), now + Duration::from_secs(59)));
}

#[test]
fn test_delivery_is_accepted_again_after_window() {
    let mut window = DeliveryWindow::new(Duration::from_secs(60), 10);
    let now = Instant::now();

    assert!(window.insert(id("a"), now));
    assert!(window.insert(id("a"), now + Duration::from_secs(60)));
}

#[test]
fn test_oldest_entries_are_evicted_at_capacity() {
    let mut window = DeliveryWindow::new(Duration::from_secs(60), 2);
    let now = Instant::now();

    window.insert(id("a"), now);
    window.insert(id("b"), now);
    window.insert(id("c"), now);

    assert_eq!(window.len(), 2);
    assert!(window.insert(id("a"), now));
}

#[test]
fn test_removed_delivery_is_accepted_again() {
    let mut window = DeliveryWindow::new(Duration::from_secs(60), 10);
    let now = Instant::now();

    window.insert(id("a"), now);
    window.remove(&id("a"));

    assert!(window.insert(id("a"), now));
    assert_eq!(window.len(), 1);
}

#[test]
fn test_disabled_window_accepts_everything() {
    let mut window = DeliveryWindow::disabled();
    let now = Instant::now();

    assert!(window.insert(id("a"), now));
    assert!(window.insert(id("a"), now));
    assert!(window.is_empty());
}

#[test]
fn test_forgotten_ids_do_not_accumulate() {
    let mut window = DeliveryWindow::new(Duration::from_secs(3600), 4);
    let now = Instant::now();
    window.insert(id("kept"), now);

    for attempt in 0..100 {
        let at = now + Duration::from_millis(attempt);
        assert!(window.insert(id("retried"), at));
        window.remove(&id("retried"));
    }

    assert_eq!(window.len(), 1);
    assert_eq!(window.order.len(), 1);
    assert!(!window.insert(id("kept"), now + Duration::from_secs(1)));
}

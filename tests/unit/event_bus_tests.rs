use std::sync::{Arc, Mutex};

use serde_json::json;

use agent_conductor::events::EventBus;
use agent_conductor::models::event::{Event, EventType};
use agent_conductor::AppError;

type Seen = Arc<Mutex<Vec<Event>>>;

fn recorder() -> (
    Seen,
    impl Fn(&Event) -> agent_conductor::Result<()> + Send + Sync + 'static,
) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    (seen, move |event: &Event| {
        sink.lock().unwrap().push(event.clone());
        Ok(())
    })
}

#[test]
fn handler_receives_only_its_project() {
    let bus = EventBus::new();
    let (seen, handler) = recorder();
    let _sub = bus.subscribe("p1", handler);

    let event = Event::new(
        EventType::SessionCompleted,
        "p1",
        json!({ "sessionId": "s1" }),
    );
    assert_eq!(bus.emit(&event), 1);
    assert_eq!(
        bus.emit(&Event::new(EventType::SessionCompleted, "p2", json!({}))),
        0
    );

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0], event);
}

#[test]
fn delivery_follows_subscription_order() {
    let bus = EventBus::new();
    let order = Arc::new(Mutex::new(Vec::new()));

    let first = Arc::clone(&order);
    let _a = bus.subscribe("p1", move |_: &Event| {
        first.lock().unwrap().push("a");
        Ok(())
    });
    let second = Arc::clone(&order);
    let _b = bus.subscribe("p1", move |_: &Event| {
        second.lock().unwrap().push("b");
        Ok(())
    });

    bus.emit(&Event::new(EventType::TicketMoved, "p1", json!({})));
    assert_eq!(*order.lock().unwrap(), vec!["a", "b"]);
}

#[test]
fn failing_and_panicking_handlers_do_not_block_others() {
    let bus = EventBus::new();
    let _err = bus.subscribe("p1", |_: &Event| Err(AppError::Http("closed".into())));
    let _panic = bus.subscribe("p1", |_: &Event| -> agent_conductor::Result<()> {
        panic!("handler bug")
    });
    let (seen, handler) = recorder();
    let _ok = bus.subscribe("p1", handler);

    let delivered = bus.emit(&Event::new(EventType::TicketMoved, "p1", json!({})));
    assert_eq!(delivered, 1);
    assert_eq!(seen.lock().unwrap().len(), 1);
}

#[test]
fn dropping_subscription_unsubscribes() {
    let bus = EventBus::new();
    let (seen, handler) = recorder();
    let sub = bus.subscribe("p1", handler);
    assert_eq!(bus.subscriber_count("p1"), 1);

    drop(sub);
    assert_eq!(bus.subscriber_count("p1"), 0);
    bus.emit(&Event::new(EventType::TicketMoved, "p1", json!({})));
    assert!(seen.lock().unwrap().is_empty());
}

#[test]
fn unsubscribe_is_idempotent() {
    let bus = EventBus::new();
    let (_seen, handler) = recorder();
    let (_other_seen, other) = recorder();
    let sub = bus.subscribe("p1", handler);
    let _other = bus.subscribe("p1", other);

    sub.unsubscribe();
    sub.unsubscribe();
    assert!(!sub.is_active());
    drop(sub);

    assert_eq!(bus.subscriber_count("p1"), 1);
}

#[test]
fn late_subscriber_sees_no_replay() {
    let bus = EventBus::new();
    bus.emit(&Event::new(EventType::TicketMoved, "p1", json!({})));

    let (seen, handler) = recorder();
    let _sub = bus.subscribe("p1", handler);
    assert!(seen.lock().unwrap().is_empty());
}

#[test]
fn handler_may_unsubscribe_during_emit() {
    let bus = EventBus::new();
    let slot: Arc<Mutex<Option<agent_conductor::events::Subscription>>> =
        Arc::new(Mutex::new(None));
    let inner = Arc::clone(&slot);
    let sub = bus.subscribe("p1", move |_: &Event| {
        if let Some(sub) = inner.lock().unwrap().take() {
            sub.unsubscribe();
        }
        Ok(())
    });
    *slot.lock().unwrap() = Some(sub);

    assert_eq!(
        bus.emit(&Event::new(EventType::TicketMoved, "p1", json!({}))),
        1
    );
    assert_eq!(bus.subscriber_count("p1"), 0);
}

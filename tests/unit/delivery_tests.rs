use std::time::Duration;

use futures_util::StreamExt;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use agent_conductor::delivery::sse::{event_stream, DELIVERY_BUFFER};
use agent_conductor::events::EventBus;
use agent_conductor::models::event::{Event, EventType};

#[tokio::test]
async fn stalled_stream_buffers_at_most_the_delivery_limit() {
    let bus = EventBus::new();
    let mut stream = Box::pin(event_stream(&bus, "p1".into(), CancellationToken::new()));

    for n in 0..DELIVERY_BUFFER + 50 {
        let delivered = bus.emit(&Event::new(EventType::TicketMoved, "p1", json!({ "n": n })));
        assert_eq!(delivered, 1, "a full queue drops without failing the handler");
    }

    let mut received = 0;
    while let Ok(Some(frame)) = tokio::time::timeout(Duration::from_millis(100), stream.next()).await
    {
        assert!(frame.is_ok());
        received += 1;
    }
    // `connected` plus the events that fit behind it.
    assert_eq!(received, DELIVERY_BUFFER);

    // Once drained, new events flow again.
    bus.emit(&Event::new(EventType::TicketMoved, "p1", json!({ "n": "late" })));
    let next = tokio::time::timeout(Duration::from_secs(1), stream.next())
        .await
        .expect("event in time");
    assert!(next.is_some());
}

#[tokio::test]
async fn dropping_stream_unsubscribes() {
    let bus = EventBus::new();
    let stream = event_stream(&bus, "p1".into(), CancellationToken::new());
    assert_eq!(bus.subscriber_count("p1"), 1);

    drop(stream);
    assert_eq!(bus.subscriber_count("p1"), 0);
    assert_eq!(
        bus.emit(&Event::new(EventType::TicketMoved, "p1", json!({}))),
        0
    );
}

//! Server side of the push channel.
//!
//! Each connection gets a synthetic `connected` event first, then every bus
//! event for its project, plus keepalive comments. Dropping the response
//! stream (client disconnect) drops the bus subscription exactly once.

use std::convert::Infallible;
use std::time::Duration;

use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use futures_util::stream::{self, Stream};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::events::{EventBus, Subscription};
use crate::models::event::Event;
use crate::AppError;

/// Events a connection may hold for a client that is not reading.
pub const DELIVERY_BUFFER: usize = 256;

/// One live push connection.
struct DeliveryConnection {
    project_id: String,
    events: mpsc::Receiver<Event>,
    subscription: Subscription,
    shutdown: CancellationToken,
}

impl Drop for DeliveryConnection {
    fn drop(&mut self) {
        self.subscription.unsubscribe();
        info!(project_id = self.project_id, "event stream closed");
    }
}

/// Encode a bus event as an SSE frame named after its type.
#[must_use]
pub fn encode(event: &Event) -> SseEvent {
    let frame = SseEvent::default().event(event.event_type.as_str());
    match serde_json::to_string(event) {
        Ok(json) => frame.data(json),
        Err(err) => frame.comment(format!("unserializable event: {err}")),
    }
}

/// Open a push stream for `project_id`. The stream ends when `shutdown`
/// fires.
pub fn event_stream(
    bus: &EventBus,
    project_id: String,
    shutdown: CancellationToken,
) -> impl Stream<Item = Result<SseEvent, Infallible>> + Send + 'static {
    let (tx, rx) = mpsc::channel(DELIVERY_BUFFER);

    // Queued before subscribing so it is always the first frame.
    let _ = tx.try_send(Event::connected(&project_id));

    let subscription = bus.subscribe(project_id.clone(), move |event: &Event| {
        match tx.try_send(event.clone()) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(dropped)) => {
                warn!(
                    project_id = dropped.project_id,
                    event_type = dropped.event_type.as_str(),
                    "event stream backlogged, dropping event"
                );
                Ok(())
            }
            Err(TrySendError::Closed(_)) => {
                Err(AppError::Http("event stream receiver closed".into()))
            }
        }
    });
    info!(project_id, "event stream opened");

    let connection = DeliveryConnection {
        project_id,
        events: rx,
        subscription,
        shutdown,
    };

    stream::unfold(connection, |mut connection| async move {
        let event = tokio::select! {
            () = connection.shutdown.cancelled() => None,
            event = connection.events.recv() => event,
        }?;
        debug!(
            project_id = connection.project_id,
            event_type = event.event_type.as_str(),
            "forwarding event"
        );
        Some((Ok(encode(&event)), connection))
    })
}

/// Wrap [`event_stream`] in an SSE response with periodic keepalives.
pub fn sse_response(
    bus: &EventBus,
    project_id: String,
    keepalive: Duration,
    shutdown: CancellationToken,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>> + Send + 'static> {
    Sse::new(event_stream(bus, project_id, shutdown)).keep_alive(
        KeepAlive::new()
            .interval(keepalive)
            .text("keepalive"),
    )
}

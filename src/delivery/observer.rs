//! Reconnecting observer for the push channel.
//!
//! While the stream is up, decoded events are forwarded as they arrive.
//! When it drops, the observer reports itself degraded and polls the
//! session listing between reconnect attempts, so a consumer always has
//! current state even without push.

use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::backoff::Backoff;
use super::decoder::SseDecoder;
use crate::models::event::Event;
use crate::models::session::Session;
use crate::Result;

/// Default interval between fallback polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Default silence after which a live stream is treated as dead. Three
/// server keepalive intervals at the default configuration.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(45);

/// Push channel health.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Events are streaming.
    Live,
    /// Stream is down; state comes from polling.
    Degraded,
}

/// What the observer hands to its consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum ObserverUpdate {
    /// An event received over the push channel.
    Event(Event),
    /// Session listing fetched while degraded.
    Snapshot(Vec<Session>),
    /// The push channel changed state.
    Connection(ConnectionState),
}

enum StreamEnd {
    Disconnected,
    ConsumerGone,
}

/// Client side of `/events` with polling fallback.
pub struct EventObserver {
    client: reqwest::Client,
    base_url: String,
    project_id: String,
    poll_interval: Duration,
    idle_timeout: Duration,
    backoff: Backoff,
    state: Option<ConnectionState>,
}

impl EventObserver {
    /// Observer for `project_id` on the server at `base_url`.
    #[must_use]
    pub fn new(base_url: impl Into<String>, project_id: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            project_id: project_id.into(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            backoff: Backoff::default(),
            state: None,
        }
    }

    /// Override the fallback poll interval.
    #[must_use]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Override how long the stream may stay silent, keepalives included,
    /// before it is dropped and reconnected.
    #[must_use]
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Override the reconnect schedule.
    #[must_use]
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Run until `cancel` fires or the receiving side of `updates` closes.
    ///
    /// # Errors
    ///
    /// Connection and polling failures are handled internally; this only
    /// returns once the observer stops.
    pub async fn run(
        mut self,
        updates: mpsc::Sender<ObserverUpdate>,
        cancel: CancellationToken,
    ) -> Result<()> {
        loop {
            if cancel.is_cancelled() {
                break;
            }

            match self.connect().await {
                Ok(response) => {
                    self.backoff.reset();
                    if !self.set_state(ConnectionState::Live, &updates).await {
                        break;
                    }
                    let end = tokio::select! {
                        () = cancel.cancelled() => break,
                        end = Self::pump(response, self.idle_timeout, &updates) => end,
                    };
                    if matches!(end, StreamEnd::ConsumerGone) {
                        break;
                    }
                    warn!(project_id = self.project_id, "event stream disconnected");
                }
                Err(err) => {
                    warn!(project_id = self.project_id, %err, "event stream connect failed");
                }
            }

            if !self.set_state(ConnectionState::Degraded, &updates).await {
                break;
            }
            let delay = self.backoff.next_delay();
            debug!(
                attempt = self.backoff.attempts(),
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "waiting before reconnect"
            );
            if !self.poll_until(Instant::now() + delay, &updates, &cancel).await {
                break;
            }
        }
        info!(project_id = self.project_id, "observer stopped");
        Ok(())
    }

    /// Fetch the current session listing for the project.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Http` on transport failure or a non-success status.
    pub async fn snapshot(&self) -> Result<Vec<Session>> {
        let sessions = self
            .client
            .get(format!("{}/sessions", self.base_url))
            .query(&[("project_id", self.project_id.as_str())])
            .send()
            .await?
            .error_for_status()?
            .json::<Vec<Session>>()
            .await?;
        Ok(sessions)
    }

    async fn connect(&self) -> Result<reqwest::Response> {
        let response = self
            .client
            .get(format!("{}/events", self.base_url))
            .query(&[("project_id", self.project_id.as_str())])
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await?
            .error_for_status()?;
        Ok(response)
    }

    async fn pump(
        response: reqwest::Response,
        idle_timeout: Duration,
        updates: &mpsc::Sender<ObserverUpdate>,
    ) -> StreamEnd {
        let mut decoder = SseDecoder::new();
        let mut body = response.bytes_stream();

        loop {
            let chunk = match tokio::time::timeout(idle_timeout, body.next()).await {
                Ok(Some(Ok(chunk))) => chunk,
                Ok(Some(Err(err))) => {
                    debug!(%err, "event stream read failed");
                    return StreamEnd::Disconnected;
                }
                Ok(None) => return StreamEnd::Disconnected,
                Err(_) => {
                    warn!(
                        idle_ms = u64::try_from(idle_timeout.as_millis()).unwrap_or(u64::MAX),
                        "event stream silent past idle timeout"
                    );
                    return StreamEnd::Disconnected;
                }
            };
            for frame in decoder.push(&chunk) {
                let event = match serde_json::from_str::<Event>(&frame.data) {
                    Ok(event) => event,
                    Err(err) => {
                        warn!(%err, event = frame.event, "skipping undecodable event");
                        continue;
                    }
                };
                if updates.send(ObserverUpdate::Event(event)).await.is_err() {
                    return StreamEnd::ConsumerGone;
                }
            }
        }
    }

    /// Poll the listing until `deadline`. Returns `false` once the observer
    /// should stop.
    async fn poll_until(
        &self,
        deadline: Instant,
        updates: &mpsc::Sender<ObserverUpdate>,
        cancel: &CancellationToken,
    ) -> bool {
        loop {
            match self.snapshot().await {
                Ok(sessions) => {
                    if updates.send(ObserverUpdate::Snapshot(sessions)).await.is_err() {
                        return false;
                    }
                }
                Err(err) => debug!(%err, "fallback poll failed"),
            }

            let next_poll = (Instant::now() + self.poll_interval).min(deadline);
            tokio::select! {
                () = cancel.cancelled() => return false,
                () = tokio::time::sleep_until(next_poll) => {}
            }
            if Instant::now() >= deadline {
                return true;
            }
        }
    }

    async fn set_state(
        &mut self,
        state: ConnectionState,
        updates: &mpsc::Sender<ObserverUpdate>,
    ) -> bool {
        if self.state == Some(state) {
            return true;
        }
        self.state = Some(state);
        info!(project_id = self.project_id, ?state, "event stream state changed");
        updates.send(ObserverUpdate::Connection(state)).await.is_ok()
    }
}

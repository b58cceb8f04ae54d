//! Push delivery of bus events over Server-Sent Events.
//!
//! The server half (`sse`) streams bus events to remote observers. The
//! client half (`observer`, `decoder`, `backoff`) reconnects with backoff
//! and falls back to polling while the stream is down.

pub mod backoff;
pub mod decoder;
pub mod observer;
pub mod sse;

pub use backoff::Backoff;
pub use decoder::{SseDecoder, SseFrame};
pub use observer::{ConnectionState, EventObserver, ObserverUpdate};

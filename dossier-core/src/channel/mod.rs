//! Event channel between the server-side producers and the live projector
//!
//! Producers (the phase ledger and the step loop) only see the [`EventSink`]
//! trait. The default transport is an in-process tokio queue per session:
//!
//! - Events are wrapped in an [`EventEnvelope`](crate::events::EventEnvelope)
//!   carrying a content hash
//! - Delivery is at-least-once; consumers must not assume ordering
//! - Retransmits are counted for telemetry only, merge correctness never
//!   depends on the hash
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use dossier_core::channel::{self, EventSink};
//! use dossier_core::events::ChannelEvent;
//! use dossier_core::registry::SessionRegistry;
//!
//! # async fn demo() {
//! let registry = Arc::new(SessionRegistry::default());
//! let (publisher, receiver) = channel::session_channel("session-1");
//! publisher.emit(ChannelEvent::SessionResumed { revision: 1 });
//! drop(publisher);
//! receiver.pump(&registry).await;
//! # }
//! ```

mod publisher;

use std::sync::Mutex;

use crate::events::ChannelEvent;

pub use publisher::{session_channel, ChannelPublisher, ChannelReceiver, PublishStats, ReceiveStats};

/// Destination for events produced by the ledger and the step loop.
///
/// Emitting never fails from the producer's point of view; a closed or lossy
/// transport is the consumer's problem, which the idempotent fold absorbs.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: ChannelEvent);
}

/// Sink that keeps every event in memory, in emit order.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<ChannelEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything emitted so far
    pub fn events(&self) -> Vec<ChannelEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Remove and return everything emitted so far
    pub fn take(&self) -> Vec<ChannelEvent> {
        match self.events.lock() {
            Ok(mut events) => std::mem::take(&mut *events),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        }
    }

    pub fn len(&self) -> usize {
        self.events.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: ChannelEvent) {
        match self.events.lock() {
            Ok(mut events) => events.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
    }
}

/// Sink that drops everything, for read-only tooling.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: ChannelEvent) {}
}

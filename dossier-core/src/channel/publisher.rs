//! Per-session publisher and receiver over a tokio queue

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::events::{ChannelEvent, EventEnvelope};
use crate::registry::SessionRegistry;

use super::EventSink;

/// Create the two ends of one session's channel.
pub fn session_channel(session_id: impl Into<String>) -> (ChannelPublisher, ChannelReceiver) {
    let session_id = session_id.into();
    let (tx, rx) = mpsc::unbounded_channel();
    let stats = Arc::new(PublishCounters::default());
    (
        ChannelPublisher {
            session_id: session_id.clone(),
            tx,
            stats: stats.clone(),
        },
        ChannelReceiver {
            session_id,
            rx,
            seen: SeenWindow::new(SEEN_WINDOW),
            stats: ReceiveStats::default(),
            publish_stats: stats,
        },
    )
}

#[derive(Debug, Default)]
struct PublishCounters {
    sent: AtomicUsize,
    dropped: AtomicUsize,
}

/// Publishing statistics
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PublishStats {
    /// Events handed to the queue
    pub events_sent: usize,
    /// Events lost because the receiver was gone
    pub events_dropped: usize,
}

/// Producer end of a session channel.
///
/// Cheap to clone; every step worker gets its own handle.
#[derive(Debug, Clone)]
pub struct ChannelPublisher {
    session_id: String,
    tx: mpsc::UnboundedSender<EventEnvelope>,
    stats: Arc<PublishCounters>,
}

impl ChannelPublisher {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Send one event, failing when the receiver is gone.
    pub fn try_emit(&self, event: ChannelEvent) -> Result<()> {
        let kind = event.kind();
        let envelope = EventEnvelope::new(self.session_id.clone(), event);
        match self.tx.send(envelope) {
            Ok(()) => {
                self.stats.sent.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(_) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                Err(Error::Channel(format!(
                    "receiver of session {} is closed, dropped {}",
                    self.session_id, kind
                )))
            }
        }
    }

    /// Send an event more than once, the way a reconnecting transport would.
    pub fn emit_repeated(&self, event: ChannelEvent, times: usize) -> Result<()> {
        for _ in 0..times {
            self.try_emit(event.clone())?;
        }
        Ok(())
    }

    pub fn stats(&self) -> PublishStats {
        PublishStats {
            events_sent: self.stats.sent.load(Ordering::Relaxed),
            events_dropped: self.stats.dropped.load(Ordering::Relaxed),
        }
    }
}

impl EventSink for ChannelPublisher {
    fn emit(&self, event: ChannelEvent) {
        // Don't fail the producer - the ledger is the source of truth
        if let Err(e) = self.try_emit(event) {
            tracing::debug!(session_id = %self.session_id, error = %e, "Dropping event");
        }
    }
}

/// Retransmit hashes remembered per connection
const SEEN_WINDOW: usize = 4096;

/// The most recent event hashes, oldest forgotten first.
#[derive(Debug)]
struct SeenWindow {
    order: VecDeque<String>,
    hashes: HashSet<String>,
    cap: usize,
}

impl SeenWindow {
    fn new(cap: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(cap.min(SEEN_WINDOW)),
            hashes: HashSet::new(),
            cap: cap.max(1),
        }
    }

    /// True when `hash` was not in the window.
    fn insert(&mut self, hash: &str) -> bool {
        if self.hashes.contains(hash) {
            return false;
        }
        if self.order.len() == self.cap {
            if let Some(oldest) = self.order.pop_front() {
                self.hashes.remove(&oldest);
            }
        }
        self.order.push_back(hash.to_string());
        self.hashes.insert(hash.to_string());
        true
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.order.len()
    }
}

/// Receiving statistics
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReceiveStats {
    pub events_received: usize,
    /// Envelopes whose hash was seen among the recent ones of this connection
    pub duplicates: usize,
}

/// Consumer end of a session channel.
#[derive(Debug)]
pub struct ChannelReceiver {
    session_id: String,
    rx: mpsc::UnboundedReceiver<EventEnvelope>,
    seen: SeenWindow,
    stats: ReceiveStats,
    publish_stats: Arc<PublishCounters>,
}

impl ChannelReceiver {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Wait for the next envelope; `None` once every publisher is dropped.
    pub async fn recv(&mut self) -> Option<EventEnvelope> {
        let envelope = self.rx.recv().await?;
        self.observe(&envelope);
        Some(envelope)
    }

    /// Next envelope if one is already queued.
    pub fn try_recv(&mut self) -> Option<EventEnvelope> {
        let envelope = self.rx.try_recv().ok()?;
        self.observe(&envelope);
        Some(envelope)
    }

    fn observe(&mut self, envelope: &EventEnvelope) {
        self.stats.events_received += 1;
        if !self.seen.insert(&envelope.event_hash) {
            self.stats.duplicates += 1;
            tracing::trace!(
                session_id = %self.session_id,
                event = envelope.event.kind(),
                hash = %envelope.event_hash,
                "Retransmitted event"
            );
        }
    }

    /// Apply every event to the registry until the channel closes.
    ///
    /// Being the only consumer of the queue, the pump is the single logical
    /// owner that serializes application for this session.
    pub async fn pump(mut self, registry: &SessionRegistry) -> ReceiveStats {
        while let Some(envelope) = self.recv().await {
            registry.apply(&envelope.session_id, envelope.event);
        }
        tracing::debug!(
            session_id = %self.session_id,
            received = self.stats.events_received,
            duplicates = self.stats.duplicates,
            sent = self.publish_stats.sent.load(Ordering::Relaxed),
            "Channel drained"
        );
        self.stats
    }

    pub fn stats(&self) -> &ReceiveStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_duplicates_are_counted_not_dropped() {
        let (publisher, mut receiver) = session_channel("s1");
        publisher
            .emit_repeated(ChannelEvent::SessionResumed { revision: 3 }, 2)
            .unwrap();
        publisher.emit(ChannelEvent::SessionResumed { revision: 4 });
        drop(publisher);

        let mut delivered = 0;
        while receiver.recv().await.is_some() {
            delivered += 1;
        }
        assert_eq!(delivered, 3);
        assert_eq!(receiver.stats().duplicates, 1);
    }

    #[test]
    fn test_emit_after_receiver_dropped_is_counted() {
        let (publisher, receiver) = session_channel("s1");
        drop(receiver);
        publisher.emit(ChannelEvent::SessionResumed { revision: 1 });
        assert_eq!(publisher.stats().events_dropped, 1);
        assert_eq!(publisher.stats().events_sent, 0);
    }

    #[test]
    fn test_try_emit_reports_closed_channel() {
        let (publisher, receiver) = session_channel("s1");
        drop(receiver);
        let err = publisher
            .try_emit(ChannelEvent::SessionResumed { revision: 1 })
            .unwrap_err();
        assert!(matches!(err, Error::Channel(_)));
        assert!(publisher
            .emit_repeated(ChannelEvent::SessionResumed { revision: 2 }, 3)
            .is_err());
        assert_eq!(publisher.stats().events_dropped, 2);
    }

    #[test]
    fn test_seen_window_forgets_oldest() {
        let mut window = SeenWindow::new(2);
        assert!(window.insert("a"));
        assert!(window.insert("b"));
        assert!(!window.insert("a"));
        assert!(window.insert("c"));
        assert_eq!(window.len(), 2);
        // "a" fell out of the window
        assert!(window.insert("a"));
        assert!(!window.insert("c"));
    }

    #[test]
    fn test_receiver_memory_is_bounded() {
        let (publisher, mut receiver) = session_channel("s1");
        for revision in 0..(SEEN_WINDOW as u64 + 10) {
            publisher.emit(ChannelEvent::SessionResumed { revision });
        }
        drop(publisher);
        while receiver.try_recv().is_some() {}
        assert_eq!(receiver.seen.len(), SEEN_WINDOW);
        assert_eq!(receiver.stats().duplicates, 0);
    }
}

//! Stream buffers and foreground selection

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::events::{CompletionStatus, StreamComplete, StreamError, StreamStart, StreamToken};
use crate::types::{Phase, StreamBuffer, StreamStatus};

use super::merge::{advance, earliest, latest};

/// Internal state of one stream.
///
/// Indexed tokens are keyed by position so a retransmitted token lands on the
/// same slot. Tokens without an index are appended as they come: a
/// retransmitted one is appended again and reordering changes the text. The
/// step loop always sends an index; unindexed tokens exist for producers that
/// cannot, and their buffers are best effort.
#[derive(Debug, Clone, Default)]
struct StreamState {
    phase: Option<Phase>,
    indexed: BTreeMap<u64, String>,
    unindexed: Vec<String>,
    status: Option<StreamStatus>,
    error: Option<String>,
    pinned: bool,
    metadata: serde_json::Map<String, serde_json::Value>,
    started_at: Option<DateTime<Utc>>,
    last_token_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
}

impl StreamState {
    fn merge_metadata(&mut self, incoming: Option<serde_json::Map<String, serde_json::Value>>) {
        for (key, value) in incoming.into_iter().flatten() {
            let replace = match self.metadata.get(&key) {
                Some(current) => value.to_string() > current.to_string(),
                None => true,
            };
            if replace {
                self.metadata.insert(key, value);
            }
        }
    }

    fn render(&self, id: &str) -> StreamBuffer {
        let mut text = String::new();
        for token in self.indexed.values().chain(self.unindexed.iter()) {
            text.push_str(token);
        }
        StreamBuffer {
            id: id.to_string(),
            phase: self.phase,
            text,
            token_count: (self.indexed.len() + self.unindexed.len()) as u64,
            status: self.status.unwrap_or_default(),
            error: self.error.clone(),
            pinned: self.pinned,
            metadata: self.metadata.clone(),
            started_at: self.started_at,
            last_token_at: self.last_token_at,
            ended_at: self.ended_at,
        }
    }
}

/// All stream buffers of one session plus the UI's foreground choice.
///
/// Only indexed tokens merge idempotently; unindexed ones append.
#[derive(Debug, Clone, Default)]
pub struct StreamTable {
    streams: BTreeMap<String, StreamState>,
    foreground: Option<String>,
}

impl StreamTable {
    fn entry(&mut self, id: &str) -> &mut StreamState {
        if self.foreground.is_none() {
            self.foreground = Some(id.to_string());
        }
        self.streams.entry(id.to_string()).or_default()
    }

    pub fn start(&mut self, event: StreamStart) {
        let state = self.entry(&event.stream_id);
        if event.phase > state.phase {
            state.phase = event.phase;
        }
        state.merge_metadata(event.metadata);
        earliest(&mut state.started_at, event.at);
        advance(&mut state.status, Some(StreamStatus::Active), StreamStatus::rank);
    }

    pub fn token(&mut self, event: StreamToken) {
        let state = self.entry(&event.stream_id);
        match event.index {
            Some(index) => {
                state.indexed.insert(index, event.token);
            }
            None => state.unindexed.push(event.token),
        }
        latest(&mut state.last_token_at, event.at);
        advance(&mut state.status, Some(StreamStatus::Active), StreamStatus::rank);
    }

    pub fn complete(&mut self, event: StreamComplete) {
        let state = self.entry(&event.stream_id);
        let status = match event.status {
            CompletionStatus::Completed => StreamStatus::Completed,
            CompletionStatus::Error => StreamStatus::Error,
        };
        advance(&mut state.status, Some(status), StreamStatus::rank);
        state.merge_metadata(event.metadata);
        latest(&mut state.ended_at, event.at);
    }

    pub fn error(&mut self, event: StreamError) {
        let state = self.entry(&event.stream_id);
        advance(&mut state.status, Some(StreamStatus::Error), StreamStatus::rank);
        if state.error.as_ref().map_or(true, |current| event.error > *current) {
            state.error = Some(event.error);
        }
        latest(&mut state.ended_at, event.at);
    }

    /// Make `id` the foreground buffer. Unknown ids are ignored.
    pub fn select_foreground(&mut self, id: &str) -> bool {
        if self.streams.contains_key(id) {
            self.foreground = Some(id.to_string());
            true
        } else {
            false
        }
    }

    pub fn set_pinned(&mut self, id: &str, pinned: bool) -> bool {
        match self.streams.get_mut(id) {
            Some(state) => {
                state.pinned = pinned;
                true
            }
            None => false,
        }
    }

    pub fn foreground(&self) -> Option<&str> {
        self.foreground.as_deref()
    }

    /// Streams still receiving tokens
    pub fn active_ids(&self) -> Vec<String> {
        self.streams
            .iter()
            .filter(|(_, s)| s.status.unwrap_or_default() == StreamStatus::Active)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<StreamBuffer> {
        self.streams.get(id).map(|state| state.render(id))
    }

    /// Buffers sorted by id
    pub fn buffers(&self) -> Vec<StreamBuffer> {
        self.streams
            .iter()
            .map(|(id, state)| state.render(id))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(id: &str, index: u64, text: &str) -> StreamToken {
        StreamToken {
            stream_id: id.to_string(),
            token: text.to_string(),
            index: Some(index),
            at: None,
        }
    }

    #[test]
    fn test_indexed_tokens_are_idempotent() {
        let mut table = StreamTable::default();
        table.token(token("s", 1, "lo"));
        table.token(token("s", 0, "hel"));
        table.token(token("s", 1, "lo"));

        let buffer = table.get("s").unwrap();
        assert_eq!(buffer.text, "hello");
        assert_eq!(buffer.token_count, 2);
        assert_eq!(buffer.status, StreamStatus::Active);
    }

    #[test]
    fn test_unindexed_tokens_append_in_arrival_order() {
        let unindexed = |text: &str| StreamToken {
            stream_id: "s".into(),
            token: text.to_string(),
            index: None,
            at: None,
        };
        let mut table = StreamTable::default();
        table.token(token("s", 0, "a"));
        table.token(token("s", 0, "a"));
        table.token(unindexed("b"));
        table.token(unindexed("b"));

        // the indexed retransmit collapses, the unindexed one does not
        let buffer = table.get("s").unwrap();
        assert_eq!(buffer.text, "abb");
        assert_eq!(buffer.token_count, 3);
    }

    #[test]
    fn test_late_start_does_not_reopen_completed_stream() {
        let mut table = StreamTable::default();
        table.complete(StreamComplete {
            stream_id: "s".into(),
            status: CompletionStatus::Completed,
            metadata: None,
            at: None,
        });
        table.start(StreamStart {
            stream_id: "s".into(),
            phase: Some(Phase::StepExecution),
            metadata: None,
            at: None,
        });

        let buffer = table.get("s").unwrap();
        assert_eq!(buffer.status, StreamStatus::Completed);
        assert_eq!(buffer.phase, Some(Phase::StepExecution));
    }

    #[test]
    fn test_foreground_selection_is_local() {
        let mut table = StreamTable::default();
        table.token(token("a", 0, "x"));
        table.token(token("b", 0, "y"));
        assert_eq!(table.foreground(), Some("a"));

        assert!(table.select_foreground("b"));
        assert!(!table.select_foreground("missing"));
        assert_eq!(table.foreground(), Some("b"));
        assert_eq!(table.active_ids(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_timestamps_from_payloads() {
        let t0 = Utc::now();
        let t1 = t0 + chrono::Duration::milliseconds(40);
        let mut table = StreamTable::default();
        table.token(StreamToken {
            at: Some(t1),
            ..token("s", 1, "b")
        });
        table.token(StreamToken {
            at: Some(t0),
            ..token("s", 0, "a")
        });
        table.start(StreamStart {
            stream_id: "s".into(),
            phase: None,
            metadata: None,
            at: Some(t0),
        });

        let buffer = table.get("s").unwrap();
        assert_eq!(buffer.started_at, Some(t0));
        assert_eq!(buffer.last_token_at, Some(t1));
    }
}

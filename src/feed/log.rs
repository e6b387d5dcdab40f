//! Bounded console log of everything the feed saw.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;

/// Default number of entries kept.
pub const DEFAULT_LOG_CAPACITY: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogKind {
    /// A well-formed event that was applied to the graph.
    Event,
    /// Anything else the server sent.
    Opaque,
    /// Connection lifecycle lines produced locally.
    System,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogEntry {
    pub seq: u64,
    pub received_at: DateTime<Utc>,
    pub kind: LogKind,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

/// Ring of recent log entries, published on every change.
pub struct RawLog {
    entries: VecDeque<LogEntry>,
    capacity: usize,
    next_seq: u64,
    tx: watch::Sender<Arc<[LogEntry]>>,
}

impl Default for RawLog {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY)
    }
}

impl RawLog {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = watch::channel(Arc::from(Vec::new()));
        Self {
            entries: VecDeque::with_capacity(capacity.min(DEFAULT_LOG_CAPACITY)),
            capacity: capacity.max(1),
            next_seq: 0,
            tx,
        }
    }

    /// Append one entry and publish. Returns its sequence number.
    pub fn push(&mut self, kind: LogKind, text: impl Into<String>, payload: Option<Value>) -> u64 {
        let seq = self.append(kind, text.into(), payload);
        self.publish();
        seq
    }

    /// Append several entries with a single publication.
    pub fn extend(&mut self, items: impl IntoIterator<Item = (LogKind, String, Option<Value>)>) {
        let mut any = false;
        for (kind, text, payload) in items {
            self.append(kind, text, payload);
            any = true;
        }
        if any {
            self.publish();
        }
    }

    /// The latest published entries, oldest first.
    pub fn entries(&self) -> Arc<[LogEntry]> {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<[LogEntry]>> {
        self.tx.subscribe()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn append(&mut self, kind: LogKind, text: String, payload: Option<Value>) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;

        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(LogEntry {
            seq,
            received_at: Utc::now(),
            kind,
            text,
            payload,
        });
        seq
    }

    fn publish(&self) {
        self.tx.send_replace(self.entries.iter().cloned().collect());
    }
}

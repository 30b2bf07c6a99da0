use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

const DEFAULT_CAPACITY: usize = 4000;

/// One captured stderr line from a stdio backend.
#[derive(Debug, Clone)]
pub struct StderrLine {
    pub server_uuid: String,
    pub line: String,
    pub timestamp: DateTime<Utc>,
}

/// Process-wide bounded ring buffer of backend stderr output.
///
/// Writers drop the oldest line when full and never wait on readers.
pub struct StderrLogStore {
    capacity: usize,
    inner: Mutex<VecDeque<StderrLine>>,
}

impl StderrLogStore {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity: capacity.max(1),
            inner: Mutex::new(VecDeque::new()),
        })
    }

    pub fn with_default_capacity() -> Arc<Self> {
        Self::new(DEFAULT_CAPACITY)
    }

    pub fn push(&self, server_uuid: &str, line: impl Into<String>) {
        let entry = StderrLine {
            server_uuid: server_uuid.to_string(),
            line: line.into(),
            timestamp: Utc::now(),
        };
        let mut buffer = self.inner.lock().expect("stderr log store poisoned");
        if buffer.len() == self.capacity {
            buffer.pop_front();
        }
        buffer.push_back(entry);
    }

    /// Last `n` lines, optionally filtered to one backend.
    pub fn tail(&self, server_uuid: Option<&str>, n: usize) -> Vec<StderrLine> {
        let buffer = self.inner.lock().expect("stderr log store poisoned");
        let mut lines: Vec<StderrLine> = buffer
            .iter()
            .filter(|entry| server_uuid.is_none_or(|uuid| entry.server_uuid == uuid))
            .cloned()
            .collect();
        if lines.len() > n {
            lines.drain(..lines.len() - n);
        }
        lines
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("stderr log store poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

//! Ring buffer of recently received device lines.

use chrono::{DateTime, Local};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

/// A line received from the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsoleLine {
    /// Arrival time
    pub timestamp: DateTime<Local>,
    /// Line text without terminator
    pub text: String,
}

/// Thread-safe, fixed-capacity console buffer.
///
/// The monitor pushes every line it reads and clears the buffer on a fixed
/// interval; anyone holding a clone can take a snapshot for diagnostics.
#[derive(Debug, Clone)]
pub struct ConsoleBuffer {
    lines: Arc<Mutex<VecDeque<ConsoleLine>>>,
    capacity: usize,
}

impl ConsoleBuffer {
    /// Create a buffer holding at most `capacity` lines (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            lines: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<ConsoleLine>> {
        self.lines
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append a line, evicting the oldest when full.
    pub fn push(&self, text: impl Into<String>) {
        let mut lines = self.lock();
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(ConsoleLine {
            timestamp: Local::now(),
            text: text.into(),
        });
    }

    /// Copy of the current contents, oldest first.
    pub fn snapshot(&self) -> Vec<ConsoleLine> {
        self.lock().iter().cloned().collect()
    }

    /// Whether any buffered line contains `needle`.
    pub fn contains(&self, needle: &str) -> bool {
        self.lock().iter().any(|line| line.text.contains(needle))
    }

    /// Drop all buffered lines.
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Number of buffered lines.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

impl Default for ConsoleBuffer {
    fn default() -> Self {
        Self::new(200)
    }
}

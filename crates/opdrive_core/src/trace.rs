//! Per-operation lifecycle trace.

use crate::clock::duration_micros;
use parking_lot::Mutex;
use std::fmt::Write as _;
use std::time::{Duration, Instant};

/// One recorded trace message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceEntry {
    /// Time since the trace was created.
    pub elapsed: Duration,
    /// The message.
    pub message: String,
}

/// Append-only diagnostic record of an operation's lifecycle.
///
/// A trace is shared (`Arc<Trace>`) between the driver and any subsystem that
/// wants to log into it. Every message is also emitted as a `tracing` event at
/// trace level.
#[derive(Debug)]
pub struct Trace {
    created: Instant,
    entries: Mutex<Vec<TraceEntry>>,
}

impl Trace {
    /// Creates an empty trace.
    pub fn new() -> Self {
        Self {
            created: Instant::now(),
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Appends a message.
    pub fn message(&self, message: impl Into<String>) {
        let entry = TraceEntry {
            elapsed: self.created.elapsed(),
            message: message.into(),
        };
        tracing::trace!(elapsed_us = duration_micros(entry.elapsed), "{}", entry.message);
        self.entries.lock().push(entry);
    }

    /// Returns a copy of all entries, in order.
    pub fn entries(&self) -> Vec<TraceEntry> {
        self.entries.lock().clone()
    }

    /// Returns the number of entries.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns true if nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Returns true if any entry contains `needle`.
    pub fn contains(&self, needle: &str) -> bool {
        self.entries.lock().iter().any(|e| e.message.contains(needle))
    }

    /// Renders the trace, one entry per line.
    pub fn dump(&self) -> String {
        let entries = self.entries.lock();
        let mut out = String::new();
        for entry in entries.iter() {
            let _ = writeln!(out, "{:>8}us {}", entry.elapsed.as_micros(), entry.message);
        }
        out
    }
}

impl Default for Trace {
    fn default() -> Self {
        Self::new()
    }
}

//! Persistence-facing capabilities: the recognition log and the blacklist.

use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};
use thiserror::Error;

use crate::types::LogEntry;

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("write failed: {0}")]
    Write(String),
    #[error("query failed: {0}")]
    Query(String),
}

/// Append-only destination for recognition decisions.
///
/// Implementations must serialize concurrent writers.
pub trait LogSink: Send + Sync {
    fn append(&self, entry: &LogEntry) -> Result<(), SinkError>;
}

/// Lookup of currently-active blacklist entries.
pub trait Blacklist: Send + Sync {
    fn is_blacklisted(&self, name: &str) -> Result<bool, SinkError>;
}

/// In-process log, kept in submission order.
#[derive(Default)]
pub struct MemoryLog {
    entries: Mutex<Vec<LogEntry>>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl LogSink for MemoryLog {
    fn append(&self, entry: &LogEntry) -> Result<(), SinkError> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry.clone());
        Ok(())
    }
}

/// Fixed set of blacklisted names. Matching is exact (case-sensitive).
#[derive(Default)]
pub struct StaticBlacklist {
    names: HashSet<String>,
}

impl StaticBlacklist {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }
}

impl Blacklist for StaticBlacklist {
    fn is_blacklisted(&self, name: &str) -> Result<bool, SinkError> {
        Ok(self.names.contains(name))
    }
}

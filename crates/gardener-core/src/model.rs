// SPDX-License-Identifier: Apache-2.0

//! Data model shared by every component: `Job`, `ArchiveDescriptor`,
//! `TestEntry`, `RowBatch` and the counters a `Sink` session tracks.

use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// A unit of work handed out by the coordinator. `(experiment, datatype,
/// date)` uniquely identifies the warehouse destination for every row this
/// job's archives produce.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Opaque identifier, round-tripped back to the coordinator unmodified.
    pub id: String,
    pub experiment: String,
    pub datatype: String,
    pub date: NaiveDate,
    pub bucket: String,
    pub prefix: String,
    /// Regex source filtering archive keys under `prefix`.
    pub key_filter: String,
}

/// Coordinator-visible job lifecycle state, posted via `update`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Parsing,
    ParseComplete,
    ParseError,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Parsing => "Parsing",
            JobState::ParseComplete => "ParseComplete",
            JobState::ParseError => "ParseError",
        };
        f.write_str(s)
    }
}

/// Metadata for one archive object. Created by `ArchiveListing`, consumed
/// exactly once by a `TaskRunner`, never mutated.
#[derive(Debug, Clone)]
pub struct ArchiveDescriptor {
    pub bucket: String,
    pub key: String,
    pub size: u64,
    pub last_modified: chrono::DateTime<chrono::Utc>,
}

/// One file inside an archive. Transient: lives only from
/// `ArchiveReader::next_test` until the parser returns.
#[derive(Debug, Clone)]
pub struct TestEntry {
    pub name: String,
    pub content: bytes::Bytes,
    /// Set when `content` was dropped because it exceeded `maxBytes`.
    pub oversize: bool,
    /// Set for directories, symlinks, and other non-regular tar entries.
    /// `content` is always empty alongside this; the caller must skip the
    /// entry rather than parse it.
    pub non_regular: bool,
}

/// An append-only buffer of parser-produced rows, opaque to the core. Rows
/// are appended in parser emission order; draining to a `Sink` hands the
/// caller a fresh empty batch in exchange.
#[derive(Debug, Default)]
pub struct RowBatch {
    rows: Vec<serde_json::Value>,
    soft_capacity: usize,
}

impl RowBatch {
    pub fn new(soft_capacity: usize) -> Self {
        Self {
            rows: Vec::with_capacity(soft_capacity.min(1024)),
            soft_capacity,
        }
    }

    pub fn push(&mut self, row: serde_json::Value) {
        self.rows.push(row);
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.rows.len() >= self.soft_capacity
    }

    /// Atomically swaps in a fresh empty batch of the same capacity and
    /// returns the drained rows.
    pub fn drain(&mut self) -> Vec<serde_json::Value> {
        std::mem::take(&mut self.rows)
    }
}

/// Running counters a `Sink` session tracks across its lifetime, named after
/// the quantities spec.md's invariants are stated in terms of: `accepted =
/// committed + bad` after every `Commit` returns.
#[derive(Debug, Default, Clone, Copy)]
pub struct SinkCounters {
    pub accepted: u64,
    pub committed: u64,
    pub bad: u64,
    pub failed: u64,
}

/// Per-archive or per-job label identifying a `Sink` session's destination:
/// a warehouse table or an object-store key. Opaque to the core beyond
/// display/metrics purposes.
#[derive(Debug, Clone)]
pub struct SinkLabel(pub String);

impl fmt::Display for SinkLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

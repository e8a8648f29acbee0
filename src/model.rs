//! Core data model.
//!
//! A queue item is one inbound event waiting for its kind's worker. Stats
//! snapshots and memory usage reports are the values the periodic loop
//! produces.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A JSON document as held by the store: always a top-level object.
pub type Document = serde_json::Map<String, serde_json::Value>;

/// Opaque event payload handed from the ingestion adapter to a handler.
pub type Payload = serde_json::Map<String, serde_json::Value>;

// ---------------------------------------------------------------------------
// Kind
// ---------------------------------------------------------------------------

/// Which queue an event belongs to. Each kind has its own bounded queue
/// and its own worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Kind {
    /// Inbound chat message.
    Message,
    /// Button callback.
    Callback,
    /// File upload.
    File,
}

impl Kind {
    pub const ALL: [Kind; 3] = [Kind::Message, Kind::Callback, Kind::File];

    pub fn as_str(self) -> &'static str {
        match self {
            Kind::Message => "message",
            Kind::Callback => "callback",
            Kind::File => "file",
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            Kind::Message => 0,
            Kind::Callback => 1,
            Kind::File => 2,
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Kind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "message" => Ok(Kind::Message),
            "callback" => Ok(Kind::Callback),
            "file" => Ok(Kind::File),
            other => Err(format!("unknown kind: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Queue Item
// ---------------------------------------------------------------------------

/// Newtype for queue item IDs. Used only for log correlation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ItemId(pub Uuid);

impl ItemId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ItemId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short display: first 8 chars of UUID
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// An event owned by the dispatcher until exactly one worker claims it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: ItemId,
    pub kind: Kind,
    pub payload: Payload,
    pub enqueued_at: DateTime<Utc>,
}

impl QueueItem {
    pub fn new(kind: Kind, payload: Payload) -> Self {
        Self {
            id: ItemId::new(),
            kind,
            payload,
            enqueued_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Stats Snapshot
// ---------------------------------------------------------------------------

/// Throughput and queue state at one collection tick.
///
/// Serialized with camelCase keys; this is the persisted stats document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub uptime_seconds: f64,
    pub processed_by_kind: BTreeMap<String, u64>,
    pub error_count: u64,
    pub queue_depths: BTreeMap<String, usize>,
    pub rejected_by_kind: BTreeMap<String, u64>,
    pub items_per_second: f64,
    pub timestamp: DateTime<Utc>,
}

impl StatsSnapshot {
    /// Convert into a store document.
    pub fn to_document(&self) -> serde_json::Result<Document> {
        match serde_json::to_value(self)? {
            serde_json::Value::Object(map) => Ok(map),
            // A struct always serializes to an object.
            _ => Ok(Document::new()),
        }
    }
}

// ---------------------------------------------------------------------------
// Memory Usage
// ---------------------------------------------------------------------------

/// System memory usage as sampled by a probe.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryUsage {
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub percent_used: f64,
}

impl MemoryUsage {
    pub fn new(total_bytes: u64, used_bytes: u64) -> Self {
        let percent_used = if total_bytes > 0 {
            used_bytes as f64 / total_bytes as f64 * 100.0
        } else {
            0.0
        };
        Self {
            total_bytes,
            used_bytes,
            percent_used,
        }
    }
}

/// Space on the filesystem holding the root mount.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskUsage {
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub percent_used: f64,
}

impl DiskUsage {
    pub fn new(total_bytes: u64, available_bytes: u64) -> Self {
        let used_bytes = total_bytes.saturating_sub(available_bytes);
        let percent_used = if total_bytes > 0 {
            used_bytes as f64 / total_bytes as f64 * 100.0
        } else {
            0.0
        };
        Self {
            total_bytes,
            used_bytes,
            percent_used,
        }
    }
}

/// Host load overview for operators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemReport {
    pub cpu_cores: usize,
    pub cpu_usage_percent: f32,
    pub memory: MemoryUsage,
    pub disk: DiskUsage,
    pub processes: usize,
}

//! tally-core: fundamental types, traits and shared services for the tally engine.
//!
//! Goal: provide the essential abstractions for an event-time aggregation pipeline:
//! - `EventTime`, `Watermark`, `PartitionId`, `RawMessage`
//! - Traits: `Source`, `PartitionReader`, `Sink`, `CheckpointStore`
//! - Invoice record decoding, window/key/totals data types
//! - Checkpointing, pipeline configuration and prometheus metrics
//!
//! Quick example:
//! ```no_run
//! use tally_core::{Fetch, PartitionId, PartitionReader, RawMessage, Sink, WindowResult};
//! # fn main() {}
//! struct OneShot { partition: PartitionId, done: bool }
//!
//! #[async_trait::async_trait]
//! impl PartitionReader for OneShot {
//!     fn partition(&self) -> &PartitionId { &self.partition }
//!     async fn poll(&mut self) -> tally_core::Result<Fetch> {
//!         if self.done { return Ok(Fetch::End); }
//!         self.done = true;
//!         Ok(Fetch::Message(RawMessage::new(self.partition.clone(), 0, b"{}".to_vec())))
//!     }
//! }
//!
//! struct Stdout;
//! #[async_trait::async_trait]
//! impl Sink for Stdout {
//!     async fn emit(&self, result: &WindowResult) -> tally_core::Result<()> {
//!         println!("{}", result.to_json());
//!         Ok(())
//!     }
//! }
//! ```

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

pub mod checkpoint;
pub mod config;
pub mod metrics;
pub mod record;
pub mod window;

pub use checkpoint::{Checkpoint, CheckpointId, CheckpointManager, CheckpointStore, StateEntry};
pub use record::{InvoiceRecord, Rejection};
pub use window::{GroupKey, Totals, Window, WindowKey, WindowResult};

/// Event time in milliseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct EventTime(pub i64);

impl EventTime {
    pub const MIN: EventTime = EventTime(i64::MIN);
    pub const MAX: EventTime = EventTime(i64::MAX);

    pub fn from_millis(ms: i64) -> Self {
        EventTime(ms)
    }

    pub fn as_millis(self) -> i64 {
        self.0
    }

    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        EventTime(dt.timestamp_millis())
    }

    pub fn to_datetime(self) -> Option<DateTime<Utc>> {
        DateTime::<Utc>::from_timestamp_millis(self.0)
    }

    pub fn saturating_sub_ms(self, ms: i64) -> Self {
        EventTime(self.0.saturating_sub(ms))
    }

    pub fn saturating_add_ms(self, ms: i64) -> Self {
        EventTime(self.0.saturating_add(ms))
    }
}

impl fmt::Display for EventTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_datetime() {
            Some(dt) => f.write_str(&dt.to_rfc3339_opts(SecondsFormat::Millis, true)),
            None => write!(f, "{}ms", self.0),
        }
    }
}

/// Global event-time progress: no window ending at or before this instant will receive more data.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(transparent)]
pub struct Watermark(pub EventTime);

impl Watermark {
    pub fn timestamp(self) -> EventTime {
        self.0
    }
}

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A single ordered partition of the message bus (a Kafka topic-partition, or one input file).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PartitionId {
    pub topic: String,
    pub partition: i32,
}

impl PartitionId {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self { topic: topic.into(), partition }
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.topic, self.partition)
    }
}

/// Raw bus message: where it came from and its undecoded payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub partition: PartitionId,
    /// Offset within the partition (Kafka offset, or line number for files).
    pub position: i64,
    pub payload: Vec<u8>,
}

impl RawMessage {
    pub fn new(partition: PartitionId, position: i64, payload: Vec<u8>) -> Self {
        Self { partition, position, payload }
    }
}

/// Result of a single pull from a partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fetch {
    Message(RawMessage),
    /// The partition has nothing to deliver right now; it must not hold back the watermark.
    Idle,
    /// Finite input is exhausted; the reader will not produce again.
    End,
}

/// Event-time progress of one partition, as carried across restarts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PartitionClock {
    #[serde(flatten)]
    pub partition: PartitionId,
    pub max_observed: EventTime,
    pub idle: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PartitionPosition {
    #[serde(flatten)]
    pub partition: PartitionId,
    pub position: i64,
}

/// Last consumed position per partition. Serialized as a list so it survives JSON.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<PartitionPosition>", into = "Vec<PartitionPosition>")]
pub struct SourcePositions(BTreeMap<PartitionId, i64>);

impl SourcePositions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, partition: &PartitionId) -> Option<i64> {
        self.0.get(partition).copied()
    }

    /// Records `position` for `partition`; positions only move forward.
    pub fn advance(&mut self, partition: &PartitionId, position: i64) {
        match self.0.get_mut(partition) {
            Some(current) if *current >= position => {}
            Some(current) => *current = position,
            None => {
                self.0.insert(partition.clone(), position);
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PartitionId, i64)> {
        self.0.iter().map(|(p, pos)| (p, *pos))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<PartitionPosition>> for SourcePositions {
    fn from(v: Vec<PartitionPosition>) -> Self {
        Self(v.into_iter().map(|p| (p.partition, p.position)).collect())
    }
}

impl From<SourcePositions> for Vec<PartitionPosition> {
    fn from(p: SourcePositions) -> Self {
        p.0.into_iter()
            .map(|(partition, position)| PartitionPosition { partition, position })
            .collect()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("checkpoint failed: {0}")]
    Checkpoint(String),
    #[error("sink failed: {0}")]
    Sink(String),
    #[error("source read failed on {partition}: {message}")]
    Source { partition: PartitionId, message: String },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Pull-based reader over one partition. Implementations must be resumable from a position.
#[async_trait::async_trait]
pub trait PartitionReader: Send {
    fn partition(&self) -> &PartitionId;
    async fn poll(&mut self) -> Result<Fetch>;
}

/// A message bus that can be opened at previously committed positions.
///
/// `resume` holds the last position already reflected in durable state for each
/// partition; readers start right after it, or at the beginning when absent.
#[async_trait::async_trait]
pub trait Source: Send {
    async fn open(&mut self, resume: &SourcePositions) -> Result<Vec<Box<dyn PartitionReader>>>;
}

/// Durable output for finalized windows. `Ok` is an acknowledgment; `Err` leaves the window open.
#[async_trait::async_trait]
pub trait Sink: Send + Sync {
    async fn emit(&self, result: &WindowResult) -> Result<()>;
    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

pub mod prelude {
    pub use super::{
        EventTime, Fetch, PartitionId, PartitionReader, RawMessage, Result, Sink, Source, SourcePositions,
        Watermark,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positions_only_move_forward() {
        let p = PartitionId::new("low_quantity", 0);
        let mut positions = SourcePositions::new();
        positions.advance(&p, 10);
        positions.advance(&p, 4);
        assert_eq!(positions.get(&p), Some(10));
        positions.advance(&p, 11);
        assert_eq!(positions.get(&p), Some(11));
    }

    #[test]
    fn positions_serialize_as_list() {
        let mut positions = SourcePositions::new();
        positions.advance(&PartitionId::new("high_quantity", 2), 7);
        let s = serde_json::to_string(&positions).unwrap();
        assert_eq!(s, r#"[{"topic":"high_quantity","partition":2,"position":7}]"#);
        let back: SourcePositions = serde_json::from_str(&s).unwrap();
        assert_eq!(back, positions);
    }

    #[test]
    fn event_time_displays_rfc3339() {
        let t = EventTime::from_millis(1_291_191_960_000);
        assert_eq!(t.to_string(), "2010-12-01T08:26:00.000Z");
    }
}

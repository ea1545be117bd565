use std::collections::HashMap;

use chrono::Duration;
use tally_core::{EventTime, PartitionClock, PartitionId, Watermark};

/// Policy that defines how to compute watermarks.
/// watermark = min over partitions of max_observed_event_time - allowed_lateness
#[derive(Debug, Clone, Copy)]
pub struct WatermarkPolicy {
    pub allowed_lateness: Duration,
}

impl WatermarkPolicy {
    pub fn new(allowed_lateness: Duration) -> Self {
        Self { allowed_lateness }
    }

    fn bound(&self, max_observed: EventTime) -> EventTime {
        max_observed.saturating_sub_ms(self.allowed_lateness.num_milliseconds())
    }
}

impl Default for WatermarkPolicy {
    fn default() -> Self {
        Self::new(Duration::minutes(10))
    }
}

#[derive(Debug, Clone, Copy)]
struct Clock {
    max_observed: EventTime,
    idle: bool,
}

/// Tracks event-time progress per partition and derives the global watermark.
///
/// A partition only bounds the global watermark once it has delivered a record, and
/// stops bounding it while marked idle. The global watermark never regresses, even
/// when a new or re-awakened partition reports older event times.
#[derive(Debug, Clone, Default)]
pub struct WatermarkTracker {
    policy: WatermarkPolicy,
    partitions: HashMap<PartitionId, Clock>,
    current: Option<Watermark>,
}

impl WatermarkTracker {
    pub fn new(policy: WatermarkPolicy) -> Self {
        Self { policy, partitions: HashMap::new(), current: None }
    }

    /// Observes a record's event time on `partition`.
    ///
    /// Returns `Some(watermark)` when the global watermark advanced.
    pub fn advance(&mut self, partition: &PartitionId, event_time: EventTime) -> Option<Watermark> {
        match self.partitions.get_mut(partition) {
            Some(clock) => {
                clock.max_observed = clock.max_observed.max(event_time);
                clock.idle = false;
            }
            None => {
                self.partitions
                    .insert(partition.clone(), Clock { max_observed: event_time, idle: false });
            }
        }
        self.recompute()
    }

    /// Excludes `partition` from the minimum until its next record.
    pub fn mark_idle(&mut self, partition: &PartitionId) -> Option<Watermark> {
        match self.partitions.get_mut(partition) {
            Some(clock) if !clock.idle => clock.idle = true,
            _ => return None,
        }
        self.recompute()
    }

    pub fn is_idle(&self, partition: &PartitionId) -> bool {
        self.partitions.get(partition).map(|c| c.idle).unwrap_or(false)
    }

    /// Current global watermark; `None` until some partition has bounded it.
    pub fn current(&self) -> Option<Watermark> {
        self.current
    }

    pub fn partition_max(&self, partition: &PartitionId) -> Option<EventTime> {
        self.partitions.get(partition).map(|c| c.max_observed)
    }

    /// Per-partition clocks, ordered by partition.
    pub fn clocks(&self) -> Vec<PartitionClock> {
        let mut out: Vec<PartitionClock> = self
            .partitions
            .iter()
            .map(|(partition, c)| PartitionClock {
                partition: partition.clone(),
                max_observed: c.max_observed,
                idle: c.idle,
            })
            .collect();
        out.sort_by(|a, b| a.partition.cmp(&b.partition));
        out
    }

    /// Seeds the global watermark and the per-partition clocks from a checkpoint.
    pub fn restore(&mut self, watermark: Option<Watermark>, clocks: Vec<PartitionClock>) {
        for c in clocks {
            let clock = self
                .partitions
                .entry(c.partition)
                .or_insert(Clock { max_observed: c.max_observed, idle: c.idle });
            clock.max_observed = clock.max_observed.max(c.max_observed);
        }
        self.current = self.current.max(watermark);
    }

    fn recompute(&mut self) -> Option<Watermark> {
        let min = self
            .partitions
            .values()
            .filter(|c| !c.idle)
            .map(|c| c.max_observed)
            .min()?;
        let candidate = Watermark(self.policy.bound(min));
        match self.current {
            Some(current) if candidate <= current => None,
            _ => {
                self.current = Some(candidate);
                Some(candidate)
            }
        }
    }
}

//! tally-state: aggregation state layer.
//!
//! `AggregationStore` holds the running totals for every open (grouping key, window)
//! bucket. It is a sharded concurrent map: records for different keys are applied
//! in parallel, while updates to the same key are serialized by its shard lock so
//! every read-modify-write is atomic.

use dashmap::DashMap;
use tally_core::{StateEntry, Totals, Watermark, WindowKey};
use tracing::debug;

#[derive(Default)]
pub struct AggregationStore {
    map: DashMap<WindowKey, Totals>,
}

impl AggregationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one record to `key`, creating zeroed totals if the key is new.
    pub fn apply(&self, key: WindowKey, quantity: i64, unit_price: f64) {
        self.map.entry(key).or_default().add(quantity, unit_price);
    }

    pub fn get(&self, key: &WindowKey) -> Option<Totals> {
        self.map.get(key).map(|t| *t)
    }

    /// Drops a bucket. Only the finalizer calls this, after the sink acknowledged it.
    pub fn remove(&self, key: &WindowKey) -> Option<Totals> {
        self.map.remove(key).map(|(_, t)| t)
    }

    /// Buckets whose window the watermark has closed, ordered by window then key.
    pub fn closed(&self, watermark: Watermark) -> Vec<(WindowKey, Totals)> {
        let mut out: Vec<_> = self
            .map
            .iter()
            .filter(|e| e.key().window.is_closed_by(watermark))
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        out.sort_by(|a, b| (a.0.window, &a.0.group).cmp(&(b.0.window, &b.0.group)));
        out
    }

    /// Point-in-time copy for checkpointing, in deterministic key order.
    pub fn snapshot(&self) -> Vec<StateEntry> {
        let mut out: Vec<_> = self
            .map
            .iter()
            .map(|e| StateEntry { key: e.key().clone(), totals: *e.value() })
            .collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }

    /// Replaces the whole store with checkpointed state.
    pub fn restore(&self, entries: Vec<StateEntry>) {
        self.map.clear();
        let n = entries.len();
        for e in entries {
            self.map.insert(e.key, e.totals);
        }
        debug!(open_windows = n, "aggregation state restored");
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

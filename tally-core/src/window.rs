use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::{EventTime, Watermark};

/// Half-open event-time interval `[start, end)`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Window {
    pub start: EventTime,
    pub end: EventTime,
}

impl Window {
    pub fn new(start: EventTime, end: EventTime) -> Self {
        Self { start, end }
    }

    pub fn duration_ms(&self) -> i64 {
        self.end.0 - self.start.0
    }

    pub fn contains(&self, t: EventTime) -> bool {
        self.start <= t && t < self.end
    }

    /// A window is closed once the watermark has reached its (exclusive) end.
    pub fn is_closed_by(&self, wm: Watermark) -> bool {
        self.end <= wm.0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupKey {
    pub invoice_no: String,
    pub customer_id: String,
    pub country: String,
}

/// One aggregation bucket: a grouping key within one window.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WindowKey {
    pub group: GroupKey,
    pub window: Window,
}

impl WindowKey {
    pub fn new(group: GroupKey, window: Window) -> Self {
        Self { group, window }
    }
}

/// Running sums for one [`WindowKey`].
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Totals {
    pub total_quantity: i64,
    pub total_price: f64,
    pub record_count: u64,
}

impl Totals {
    /// Sums saturate rather than wrap.
    pub fn add(&mut self, quantity: i64, unit_price: f64) {
        self.total_quantity = self.total_quantity.saturating_add(quantity);
        self.total_price += quantity as f64 * unit_price;
        self.record_count = self.record_count.saturating_add(1);
    }
}

/// A finalized window, as handed to a [`Sink`](crate::Sink).
#[derive(Debug, Clone, PartialEq)]
pub struct WindowResult {
    pub key: WindowKey,
    pub totals: Totals,
}

impl WindowResult {
    pub fn new(key: WindowKey, totals: Totals) -> Self {
        Self { key, totals }
    }

    /// Output row layout: grouping columns, a `window` struct, then the aggregates.
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "InvoiceNo": self.key.group.invoice_no,
            "CustomerID": self.key.group.customer_id,
            "Country": self.key.group.country,
            "window": {
                "start": self.key.window.start.to_string(),
                "end": self.key.window.end.to_string(),
            },
            "TotalQuantity": self.totals.total_quantity,
            "TotalPrice": self.totals.total_price,
            "RecordCount": self.totals.record_count,
        })
    }
}

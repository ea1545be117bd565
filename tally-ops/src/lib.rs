//! tally-ops: the processing stages built on top of tally-core.
//!
//! Included:
//! - `CountryFilter`: keeps records whose country is in an allow-set
//! - `WatermarkTracker`: per-partition event-time progress and the global watermark
//! - `WindowAssigner` / `WindowFinalizer`: tumbling windows and their exactly-once emission
//! - `Engine`: partition ingestion tasks, the finalization loop and checkpointing

use std::collections::HashSet;

use tally_core::InvoiceRecord;

pub mod engine;
pub mod time;
pub mod window;

pub use engine::{Engine, EngineOptions, Ingested, RunReport};
pub use time::{WatermarkPolicy, WatermarkTracker};
pub use window::{FinalizePass, WindowAssigner, WindowFinalizer};

/// Filter stage: keeps records whose `Country` is in the allow-set.
///
/// Example
/// ```no_run
/// use tally_ops::CountryFilter;
/// let filter = CountryFilter::new(["United Kingdom", "France", "Spain"]);
/// # let _ = filter;
/// ```
#[derive(Debug, Clone)]
pub struct CountryFilter {
    allowed: HashSet<String>,
}

impl CountryFilter {
    pub fn new<I, S>(countries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { allowed: countries.into_iter().map(Into::into).collect() }
    }

    pub fn allows(&self, record: &InvoiceRecord) -> bool {
        self.allowed.contains(&record.country)
    }
}

pub mod prelude {
    pub use super::{
        CountryFilter, Engine, EngineOptions, Ingested, RunReport, WatermarkPolicy, WatermarkTracker,
        WindowAssigner, WindowFinalizer,
    };
}

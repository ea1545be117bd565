use std::sync::Arc;
use std::time::Instant;

use chrono::Duration;
use tally_core::{EventTime, Sink, Totals, Window, WindowKey, WindowResult};
use tally_state::AggregationStore;
use tracing::{debug, warn};

/// Maps event times onto fixed-size, epoch-aligned tumbling windows.
#[derive(Debug, Clone, Copy)]
pub struct WindowAssigner {
    size_ms: i64,
}

impl WindowAssigner {
    /// Non-positive sizes are clamped to one millisecond.
    pub fn tumbling(size: Duration) -> Self {
        Self { size_ms: size.num_milliseconds().max(1) }
    }

    pub fn size_ms(&self) -> i64 {
        self.size_ms
    }

    pub fn assign(&self, ts: EventTime) -> Window {
        let start = ts.0.div_euclid(self.size_ms) * self.size_ms;
        Window::new(EventTime(start), EventTime(start).saturating_add_ms(self.size_ms))
    }
}

/// Outcome of one emission pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FinalizePass {
    pub emitted: usize,
    pub failed: usize,
}

/// Hands closed windows to the sink and forgets them once acknowledged.
///
/// A window whose emission fails stays in the store and is offered again on the
/// next pass; nothing is removed before the sink has acknowledged it.
pub struct WindowFinalizer {
    sink: Arc<dyn Sink>,
}

impl WindowFinalizer {
    pub fn new(sink: Arc<dyn Sink>) -> Self {
        Self { sink }
    }

    pub async fn emit_closed(&self, store: &AggregationStore, closed: Vec<(WindowKey, Totals)>) -> FinalizePass {
        let mut pass = FinalizePass::default();
        for (key, totals) in closed {
            let result = WindowResult::new(key, totals);
            let started = Instant::now();
            match self.sink.emit(&result).await {
                Ok(()) => {
                    tally_core::metrics::SINK_LATENCY_MS.observe(started.elapsed().as_secs_f64() * 1_000.0);
                    tally_core::metrics::WINDOWS_EMITTED.inc();
                    store.remove(&result.key);
                    pass.emitted += 1;
                    debug!(
                        invoice = %result.key.group.invoice_no,
                        window_start = %result.key.window.start,
                        total_quantity = result.totals.total_quantity,
                        "window emitted"
                    );
                }
                Err(e) => {
                    tally_core::metrics::SINK_FAILURES.inc();
                    pass.failed += 1;
                    warn!(
                        invoice = %result.key.group.invoice_no,
                        window_start = %result.key.window.start,
                        error = %e,
                        "sink did not acknowledge window; will retry"
                    );
                }
            }
        }
        if pass.emitted > 0 {
            if let Err(e) = self.sink.flush().await {
                warn!(error = %e, "sink flush failed");
            }
        }
        pass
    }
}

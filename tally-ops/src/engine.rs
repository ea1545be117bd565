//! Engine driver: one ingestion task per partition, a single finalization loop.
//!
//! Every record's late check, state update, watermark advance and position update
//! happen under the read side of an ingest gate. Finalization (reading the watermark
//! and collecting closed windows) and checkpoint snapshots take the write side, so
//! they always observe a consistent cut: no record lands in a window after that
//! window was selected for emission, and a checkpoint's state matches its positions.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tally_core::config::{parse_duration, parse_duration_ms, EngineConfig};
use tally_core::{
    CheckpointId, CheckpointManager, CheckpointStore, Error, Fetch, InvoiceRecord, PartitionId, PartitionReader,
    RawMessage, Rejection, Result, Sink, Source, SourcePositions, Watermark, WindowKey,
};
use tally_state::AggregationStore;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use crate::time::{WatermarkPolicy, WatermarkTracker};
use crate::window::{WindowAssigner, WindowFinalizer};
use crate::CountryFilter;

/// Pause after a reader reports `Fetch::Idle`, so an idle reader is not spun.
const IDLE_PAUSE: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub window_size: chrono::Duration,
    pub allowed_lateness: chrono::Duration,
    /// A partition producing nothing for this long is marked idle.
    pub idle_timeout: Duration,
    pub checkpoint_interval: Duration,
    /// Stop admitting input after this long; `None` runs until every partition ends.
    pub max_run: Option<Duration>,
    pub countries: Vec<String>,
    pub retry_backoff_min: Duration,
    pub retry_backoff_max: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            window_size: chrono::Duration::minutes(10),
            allowed_lateness: chrono::Duration::minutes(10),
            idle_timeout: Duration::from_secs(30),
            checkpoint_interval: Duration::from_secs(30),
            max_run: Some(Duration::from_secs(600)),
            countries: vec!["United Kingdom".into(), "France".into(), "Spain".into()],
            retry_backoff_min: Duration::from_millis(100),
            retry_backoff_max: Duration::from_secs(5),
        }
    }
}

impl TryFrom<&EngineConfig> for EngineOptions {
    type Error = anyhow::Error;

    fn try_from(cfg: &EngineConfig) -> anyhow::Result<Self> {
        cfg.validate()?;
        // "0s" disables the deadline
        let max_run = match &cfg.run.max_duration {
            Some(d) => Some(parse_duration(d).context("run.max_duration")?).filter(|d| !d.is_zero()),
            None => None,
        };
        Ok(Self {
            window_size: chrono::Duration::milliseconds(parse_duration_ms(&cfg.window.size).context("window.size")?),
            allowed_lateness: chrono::Duration::milliseconds(
                parse_duration_ms(&cfg.time.allowed_lateness).context("time.allowed_lateness")?,
            ),
            idle_timeout: parse_duration(&cfg.time.idle_timeout).context("time.idle_timeout")?,
            checkpoint_interval: parse_duration(&cfg.checkpoint.interval).context("checkpoint.interval")?,
            max_run,
            countries: cfg.filter.countries.clone(),
            ..Self::default()
        })
    }
}

/// What happened to one bus message.
#[derive(Debug, Clone, PartialEq)]
pub enum Ingested {
    Applied,
    Rejected(Rejection),
    Filtered,
    /// Its window had already closed; dropped without touching state.
    Late,
    /// Position already reflected in state (redelivery or replay after restart).
    Replayed,
}

impl Ingested {
    fn label(&self) -> &'static str {
        match self {
            Ingested::Applied => "applied",
            Ingested::Rejected(_) => "rejected",
            Ingested::Filtered => "filtered",
            Ingested::Late => "late",
            Ingested::Replayed => "replayed",
        }
    }
}

#[derive(Default)]
struct EngineStats {
    ingested: AtomicU64,
    applied: AtomicU64,
    filtered: AtomicU64,
    late: AtomicU64,
    replayed: AtomicU64,
    rejected: Mutex<BTreeMap<&'static str, u64>>,
    emitted: AtomicU64,
    sink_failures: AtomicU64,
    checkpoints: AtomicU64,
    source_errors: AtomicU64,
}

/// Counters for one engine instance plus its final position.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunReport {
    pub ingested: u64,
    pub applied: u64,
    pub rejected: BTreeMap<&'static str, u64>,
    pub filtered: u64,
    pub late: u64,
    pub replayed: u64,
    pub emitted: u64,
    pub sink_failures: u64,
    pub checkpoints: u64,
    pub source_errors: u64,
    pub last_checkpoint: Option<CheckpointId>,
    pub watermark: Option<Watermark>,
    pub open_windows: usize,
}

impl RunReport {
    pub fn rejected_total(&self) -> u64 {
        self.rejected.values().sum()
    }
}

pub struct Engine {
    opts: EngineOptions,
    assigner: WindowAssigner,
    filter: CountryFilter,
    store: AggregationStore,
    tracker: Mutex<WatermarkTracker>,
    positions: Mutex<SourcePositions>,
    gate: RwLock<()>,
    finalizer: WindowFinalizer,
    finalizing: tokio::sync::Mutex<()>,
    checkpoints: CheckpointManager,
    last_checkpoint: Mutex<Option<CheckpointId>>,
    stats: EngineStats,
    wm_tx: watch::Sender<Option<Watermark>>,
}

impl Engine {
    pub fn new(opts: EngineOptions, sink: Arc<dyn Sink>, checkpoints: Arc<dyn CheckpointStore>) -> Self {
        let (wm_tx, _) = watch::channel(None);
        Self {
            assigner: WindowAssigner::tumbling(opts.window_size),
            filter: CountryFilter::new(opts.countries.iter().cloned()),
            store: AggregationStore::new(),
            tracker: Mutex::new(WatermarkTracker::new(WatermarkPolicy::new(opts.allowed_lateness))),
            positions: Mutex::new(SourcePositions::new()),
            gate: RwLock::new(()),
            finalizer: WindowFinalizer::new(sink),
            finalizing: tokio::sync::Mutex::new(()),
            checkpoints: CheckpointManager::new(checkpoints),
            last_checkpoint: Mutex::new(None),
            stats: EngineStats::default(),
            wm_tx,
            opts,
        }
    }

    pub fn store(&self) -> &AggregationStore {
        &self.store
    }

    pub fn watermark(&self) -> Option<Watermark> {
        self.tracker.lock().current()
    }

    pub fn positions(&self) -> SourcePositions {
        self.positions.lock().clone()
    }

    /// Restores state, watermark and positions from the latest checkpoint, if any.
    pub async fn recover(&self) -> Result<Option<CheckpointId>> {
        let Some(cp) = self.checkpoints.recover().await? else {
            return Ok(None);
        };
        let _gate = self.gate.write();
        self.store.restore(cp.state);
        self.tracker.lock().restore(cp.watermark, cp.clocks);
        *self.positions.lock() = cp.positions;
        *self.last_checkpoint.lock() = Some(cp.id);
        tally_core::metrics::OPEN_WINDOWS.set(self.store.len() as i64);
        Ok(Some(cp.id))
    }

    /// Applies one bus message. Never fails: bad input is counted and dropped.
    pub fn ingest(&self, msg: &RawMessage) -> Ingested {
        self.stats.ingested.fetch_add(1, Ordering::Relaxed);
        let (outcome, advanced) = self.ingest_inner(msg);
        tally_core::metrics::RECORDS.with_label_values(&[outcome.label()]).inc();
        match &outcome {
            Ingested::Applied => {
                self.stats.applied.fetch_add(1, Ordering::Relaxed);
            }
            Ingested::Rejected(r) => {
                *self.stats.rejected.lock().entry(r.reason()).or_default() += 1;
                tally_core::metrics::REJECTED_RECORDS.with_label_values(&[r.reason()]).inc();
                debug!(partition = %msg.partition, position = msg.position, reason = %r, "record rejected");
            }
            Ingested::Filtered => {
                self.stats.filtered.fetch_add(1, Ordering::Relaxed);
            }
            Ingested::Late => {
                self.stats.late.fetch_add(1, Ordering::Relaxed);
                debug!(partition = %msg.partition, position = msg.position, "late record dropped");
            }
            Ingested::Replayed => {
                self.stats.replayed.fetch_add(1, Ordering::Relaxed);
            }
        }
        if let Some(wm) = advanced {
            self.publish_watermark(wm);
        }
        outcome
    }

    fn ingest_inner(&self, msg: &RawMessage) -> (Ingested, Option<Watermark>) {
        let _gate = self.gate.read();
        if self.positions.lock().get(&msg.partition).is_some_and(|p| msg.position <= p) {
            return (Ingested::Replayed, None);
        }
        let outcome = match InvoiceRecord::decode(&msg.payload) {
            Err(rejection) => (Ingested::Rejected(rejection), None),
            Ok(rec) if !self.filter.allows(&rec) => (Ingested::Filtered, None),
            Ok(rec) => self.apply(&msg.partition, rec),
        };
        self.positions.lock().advance(&msg.partition, msg.position);
        outcome
    }

    fn apply(&self, partition: &PartitionId, rec: InvoiceRecord) -> (Ingested, Option<Watermark>) {
        let window = self.assigner.assign(rec.invoice_date);
        let closed = self.tracker.lock().current().is_some_and(|wm| window.is_closed_by(wm));
        let outcome = if closed {
            Ingested::Late
        } else {
            self.store.apply(WindowKey::new(rec.group_key(), window), rec.quantity, rec.unit_price);
            Ingested::Applied
        };
        let advanced = self.tracker.lock().advance(partition, rec.invoice_date);
        (outcome, advanced)
    }

    /// Explicit idle signal for `partition`.
    pub fn mark_idle(&self, partition: &PartitionId) {
        let advanced = {
            let _gate = self.gate.read();
            self.tracker.lock().mark_idle(partition)
        };
        debug!(%partition, "partition idle");
        if let Some(wm) = advanced {
            self.publish_watermark(wm);
        }
    }

    fn publish_watermark(&self, wm: Watermark) {
        tally_core::metrics::WATERMARK_MS.set(wm.0.as_millis());
        tally_core::metrics::LAG_WATERMARK_MS
            .set(chrono::Utc::now().timestamp_millis().saturating_sub(wm.0.as_millis()));
        self.wm_tx.send_replace(Some(wm));
    }

    /// Emits every window the current watermark has closed, then checkpoints if any
    /// were acknowledged. Returns the number of windows emitted.
    #[instrument(name = "finalize", skip_all)]
    pub async fn finalize(&self) -> Result<usize> {
        let _pass = self.finalizing.lock().await;
        let closed = {
            let _gate = self.gate.write();
            match self.tracker.lock().current() {
                Some(wm) => self.store.closed(wm),
                None => Vec::new(),
            }
        };
        if closed.is_empty() {
            return Ok(0);
        }
        let pass = self.finalizer.emit_closed(&self.store, closed).await;
        self.stats.emitted.fetch_add(pass.emitted as u64, Ordering::Relaxed);
        self.stats.sink_failures.fetch_add(pass.failed as u64, Ordering::Relaxed);
        tally_core::metrics::OPEN_WINDOWS.set(self.store.len() as i64);
        if pass.emitted > 0 {
            self.checkpoint().await?;
        }
        Ok(pass.emitted)
    }

    /// Snapshots state, positions and watermark clocks as one cut and writes it durably.
    #[instrument(name = "checkpoint", skip_all)]
    pub async fn checkpoint(&self) -> Result<CheckpointId> {
        let (state, positions, watermark, clocks) = {
            let _gate = self.gate.write();
            let tracker = self.tracker.lock();
            (self.store.snapshot(), self.positions.lock().clone(), tracker.current(), tracker.clocks())
        };
        tally_core::metrics::OPEN_WINDOWS.set(state.len() as i64);
        let id = self.checkpoints.commit(state, positions, watermark, clocks).await?;
        self.stats.checkpoints.fetch_add(1, Ordering::Relaxed);
        *self.last_checkpoint.lock() = Some(id);
        Ok(id)
    }

    pub fn report(&self) -> RunReport {
        let s = &self.stats;
        RunReport {
            ingested: s.ingested.load(Ordering::Relaxed),
            applied: s.applied.load(Ordering::Relaxed),
            rejected: s.rejected.lock().clone(),
            filtered: s.filtered.load(Ordering::Relaxed),
            late: s.late.load(Ordering::Relaxed),
            replayed: s.replayed.load(Ordering::Relaxed),
            emitted: s.emitted.load(Ordering::Relaxed),
            sink_failures: s.sink_failures.load(Ordering::Relaxed),
            checkpoints: s.checkpoints.load(Ordering::Relaxed),
            source_errors: s.source_errors.load(Ordering::Relaxed),
            last_checkpoint: *self.last_checkpoint.lock(),
            watermark: self.watermark(),
            open_windows: self.store.len(),
        }
    }

    /// Recovers, opens the source at the recovered positions and processes until the
    /// deadline passes or every partition ends, then drains to a final checkpoint.
    ///
    /// A checkpoint write failure stops ingestion and is returned; nothing after it
    /// is treated as durable.
    pub async fn run<S: Source>(self: Arc<Self>, mut source: S) -> Result<RunReport> {
        self.recover().await?;
        let resume = self.positions();
        let readers = source.open(&resume).await?;
        info!(partitions = readers.len(), "source opened");

        let (stop_tx, stop_rx) = watch::channel(false);
        let mut ingestion = JoinSet::new();
        for reader in readers {
            let engine = self.clone();
            let stop = stop_rx.clone();
            ingestion.spawn(async move { engine.ingest_partition(reader, stop).await });
        }

        let deadline = self.opts.max_run.map(|d| tokio::time::Instant::now() + d);
        let until_deadline = async move {
            match deadline {
                Some(d) => tokio::time::sleep_until(d).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(until_deadline);

        let mut wm_rx = self.wm_tx.subscribe();
        let mut tick = tokio::time::interval(self.opts.checkpoint_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tick.tick().await;

        let outcome: Result<()> = loop {
            tokio::select! {
                _ = &mut until_deadline => {
                    info!("run deadline reached; draining");
                    break Ok(());
                }
                _ = wm_rx.changed() => {
                    if let Err(e) = self.finalize().await {
                        break Err(e);
                    }
                }
                _ = tick.tick() => {
                    if let Err(e) = self.on_tick().await {
                        break Err(e);
                    }
                }
                joined = ingestion.join_next() => match joined {
                    None => {
                        info!("all partitions ended; draining");
                        break Ok(());
                    }
                    Some(Ok(())) => {}
                    Some(Err(e)) => break Err(Error::Anyhow(anyhow::anyhow!("ingestion task failed: {e}"))),
                },
            }
        };

        let _ = stop_tx.send(true);
        while let Some(joined) = ingestion.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "ingestion task failed during shutdown");
            }
        }
        outcome?;

        self.finalize().await?;
        self.checkpoint().await?;
        let report = self.report();
        info!(
            applied = report.applied,
            emitted = report.emitted,
            late = report.late,
            rejected = report.rejected_total(),
            open_windows = report.open_windows,
            "run finished"
        );
        Ok(report)
    }

    async fn on_tick(&self) -> Result<()> {
        // retries sink failures; checkpoints on its own when something was emitted
        if self.finalize().await? == 0 {
            self.checkpoint().await?;
        }
        Ok(())
    }

    async fn ingest_partition(&self, mut reader: Box<dyn PartitionReader>, mut stop: watch::Receiver<bool>) {
        let partition = reader.partition().clone();
        let mut backoff = self.opts.retry_backoff_min;
        let mut idle = false;
        let mut failing_since: Option<tokio::time::Instant> = None;
        debug!(%partition, "ingestion started");
        while !*stop.borrow() {
            let fetched = tokio::select! {
                biased;
                _ = stop.changed() => break,
                fetched = tokio::time::timeout(self.opts.idle_timeout, reader.poll()) => fetched,
            };
            match fetched {
                Ok(Ok(Fetch::Message(msg))) => {
                    idle = false;
                    failing_since = None;
                    backoff = self.opts.retry_backoff_min;
                    self.ingest(&msg);
                }
                Ok(Ok(Fetch::Idle)) => {
                    failing_since = None;
                    if !idle {
                        self.mark_idle(&partition);
                        idle = true;
                    }
                    tokio::time::sleep(IDLE_PAUSE).await;
                }
                Err(_elapsed) => {
                    if !idle {
                        self.mark_idle(&partition);
                        idle = true;
                    }
                }
                Ok(Ok(Fetch::End)) => {
                    self.mark_idle(&partition);
                    info!(%partition, "partition ended");
                    break;
                }
                Ok(Err(e)) => {
                    self.stats.source_errors.fetch_add(1, Ordering::Relaxed);
                    tally_core::metrics::SOURCE_READ_ERRORS
                        .with_label_values(&[&partition.to_string()])
                        .inc();
                    warn!(%partition, error = %e, backoff_ms = backoff.as_millis() as u64, "source read failed; retrying");
                    // a partition that keeps failing must not hold the watermark forever
                    let since = *failing_since.get_or_insert_with(tokio::time::Instant::now);
                    if !idle && since.elapsed() >= self.opts.idle_timeout {
                        self.mark_idle(&partition);
                        idle = true;
                    }
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(self.opts.retry_backoff_max);
                }
            }
        }
        debug!(%partition, "ingestion stopped");
    }
}

use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static RECORDS: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("tally_records_total", "Bus messages seen by ingestion, by outcome"),
        &["outcome"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).unwrap();
    c
});

pub static REJECTED_RECORDS: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("tally_rejected_records_total", "Messages that failed deserialization"),
        &["reason"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).unwrap();
    c
});

pub static WINDOWS_EMITTED: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("tally_windows_emitted_total", "Finalized windows acknowledged by the sink").unwrap();
    REGISTRY.register(Box::new(c.clone())).unwrap();
    c
});

pub static SINK_FAILURES: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("tally_sink_failures_total", "Window emissions the sink failed to acknowledge").unwrap();
    REGISTRY.register(Box::new(c.clone())).unwrap();
    c
});

pub static CHECKPOINTS_WRITTEN: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("tally_checkpoints_total", "Checkpoints durably written").unwrap();
    REGISTRY.register(Box::new(c.clone())).unwrap();
    c
});

pub static BYTES_WRITTEN: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("tally_sink_bytes_written_total", "Bytes written by sinks"),
        &["sink"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).unwrap();
    c
});

pub static SOURCE_READ_ERRORS: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("tally_source_read_errors_total", "Failed source polls, retried with backoff"),
        &["partition"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).unwrap();
    c
});

pub static WATERMARK_MS: Lazy<IntGauge> = Lazy::new(|| {
    let g = IntGauge::new("tally_watermark_ms", "Current global watermark (epoch ms)").unwrap();
    REGISTRY.register(Box::new(g.clone())).unwrap();
    g
});

pub static LAG_WATERMARK_MS: Lazy<IntGauge> = Lazy::new(|| {
    let g = IntGauge::new(
        "tally_watermark_lag_ms",
        "Lag between now and current watermark in ms",
    )
    .unwrap();
    REGISTRY.register(Box::new(g.clone())).unwrap();
    g
});

pub static OPEN_WINDOWS: Lazy<IntGauge> = Lazy::new(|| {
    let g = IntGauge::new("tally_open_windows", "Window keys held in aggregation state").unwrap();
    REGISTRY.register(Box::new(g.clone())).unwrap();
    g
});

pub static SINK_LATENCY_MS: Lazy<Histogram> = Lazy::new(|| {
    let h = Histogram::with_opts(
        HistogramOpts::new("tally_sink_emit_latency_ms", "Sink emit latency (ms)").buckets(vec![
            0.1, 0.5, 1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0,
        ]),
    )
    .unwrap();
    REGISTRY.register(Box::new(h.clone())).unwrap();
    h
});

pub static CHECKPOINT_LATENCY_MS: Lazy<Histogram> = Lazy::new(|| {
    let h = Histogram::with_opts(
        HistogramOpts::new("tally_checkpoint_latency_ms", "Checkpoint write latency (ms)").buckets(vec![
            1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 5000.0,
        ]),
    )
    .unwrap();
    REGISTRY.register(Box::new(h.clone())).unwrap();
    h
});

pub fn render_prometheus() -> String {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    encoder.encode(&REGISTRY.gather(), &mut buffer).ok();
    String::from_utf8(buffer).unwrap_or_default()
}

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct SourceConfig {
    pub kind: String, // "kafka" | "file"
    pub brokers: String,
    pub topics: Vec<String>,
    pub group_id: String,
    /// JSON-lines files for `kind = "file"`; each file is one partition.
    pub paths: Vec<PathBuf>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            kind: "kafka".into(),
            brokers: "kafka:9092".into(),
            topics: vec!["low_quantity".into(), "medium_quantity".into(), "high_quantity".into()],
            group_id: "tally".into(),
            paths: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct TimeConfig {
    pub allowed_lateness: String, // e.g., "10m"
    /// A partition silent for this long stops holding back the watermark.
    pub idle_timeout: String,
}

impl Default for TimeConfig {
    fn default() -> Self {
        Self { allowed_lateness: "10m".into(), idle_timeout: "30s".into() }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct WindowConfig {
    #[serde(rename = "type")]
    pub kind: String, // tumbling
    pub size: String, // e.g., "10m"
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self { kind: "tumbling".into(), size: "10m".into() }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct FilterConfig {
    pub countries: Vec<String>,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self { countries: vec!["United Kingdom".into(), "France".into(), "Spain".into()] }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct SinkConfig {
    pub kind: String, // "json" | "parquet"
    pub out_dir: PathBuf,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self { kind: "json".into(), out_dir: PathBuf::from("./out/aggregated_data") }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct CheckpointConfig {
    pub dir: PathBuf,
    /// Checkpoint at least this often even when no window closed.
    pub interval: String,
    pub keep_last: usize,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self { dir: PathBuf::from("/tmp/checkpoints"), interval: "30s".into(), keep_last: 3 }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct RunConfig {
    /// Stop admitting input after this long and drain; `None` runs until input ends.
    pub max_duration: Option<String>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self { max_duration: Some("600s".into()) }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(default)]
pub struct EngineConfig {
    pub source: SourceConfig,
    pub time: TimeConfig,
    pub window: WindowConfig,
    pub filter: FilterConfig,
    pub sink: SinkConfig,
    pub checkpoint: CheckpointConfig,
    pub run: RunConfig,
}

impl EngineConfig {
    pub fn from_toml_str(s: &str) -> anyhow::Result<Self> {
        let cfg: EngineConfig = toml::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        match self.source.kind.as_str() {
            "kafka" => {
                if self.source.topics.is_empty() {
                    anyhow::bail!("source.topics must name at least one topic");
                }
            }
            "file" => {
                if self.source.paths.is_empty() {
                    anyhow::bail!("source.paths must list at least one file");
                }
            }
            other => anyhow::bail!("unsupported source kind: {}", other),
        }
        if self.window.kind.as_str() != "tumbling" {
            anyhow::bail!("unsupported window type: {}", self.window.kind);
        }
        if self.sink.kind.as_str() != "json" && self.sink.kind.as_str() != "parquet" {
            anyhow::bail!("unsupported sink kind: {}", self.sink.kind);
        }
        if self.filter.countries.is_empty() {
            anyhow::bail!("filter.countries must not be empty");
        }
        if parse_duration_ms(&self.window.size)? <= 0 {
            anyhow::bail!("window.size must be positive");
        }
        parse_duration(&self.time.allowed_lateness)?;
        parse_duration(&self.time.idle_timeout)?;
        parse_duration(&self.checkpoint.interval)?;
        if let Some(d) = &self.run.max_duration {
            parse_duration(d)?;
        }
        Ok(())
    }
}

pub fn parse_duration_ms(s: &str) -> anyhow::Result<i64> {
    // small parser for values like "10s", "500ms", "2m"
    let s = s.trim();
    let (num, unit_ms) = if let Some(num) = s.strip_suffix("ms") {
        (num, 1)
    } else if let Some(num) = s.strip_suffix('s') {
        (num, 1_000)
    } else if let Some(num) = s.strip_suffix('m') {
        (num, 60_000)
    } else if let Some(num) = s.strip_suffix('h') {
        (num, 3_600_000)
    } else {
        // default assume seconds
        (s, 1_000)
    };
    match num.trim().parse::<i64>()?.checked_mul(unit_ms) {
        Some(ms) => Ok(ms),
        None => anyhow::bail!("duration out of range: {}", s),
    }
}

pub fn parse_duration(s: &str) -> anyhow::Result<std::time::Duration> {
    let ms = parse_duration_ms(s)?;
    if ms < 0 {
        anyhow::bail!("duration must not be negative: {}", s);
    }
    Ok(std::time::Duration::from_millis(ms as u64))
}

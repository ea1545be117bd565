//! tally-io: sources and sinks.
//! - `FileSource`: replays JSON-lines files, one partition per file
//! - `JsonSink`: writes one JSON document per finalized window
//! - `KafkaSource` (feature `kafka`): one assigned consumer per topic partition
//! - `ParquetSink` (feature `parquet`): one parquet file per finalized window
//!
//! Both sinks derive the output file name from the window key alone and replace the
//! file atomically, so emitting the same window again overwrites rather than duplicates.

use std::path::{Path, PathBuf};

use anyhow::Context as _;
use async_trait::async_trait;
use tally_core::{
    Error, Fetch, PartitionId, PartitionReader, RawMessage, Result, Sink, Source, SourcePositions, WindowKey,
    WindowResult,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt};
use tracing::{debug, info};

/// Reads JSON-lines files. Each file is one partition (topic = path, partition 0) and a
/// message's position is its 0-based line number.
pub struct FileSource {
    pub paths: Vec<PathBuf>,
}

impl FileSource {
    pub fn new<I, P>(paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self { paths: paths.into_iter().map(Into::into).collect() }
    }

    pub fn partition_for(path: &Path) -> PartitionId {
        PartitionId::new(path.display().to_string(), 0)
    }
}

#[async_trait]
impl Source for FileSource {
    async fn open(&mut self, resume: &SourcePositions) -> Result<Vec<Box<dyn PartitionReader>>> {
        let mut readers: Vec<Box<dyn PartitionReader>> = Vec::with_capacity(self.paths.len());
        for path in &self.paths {
            let file = tokio::fs::File::open(path)
                .await
                .with_context(|| format!("opening {}", path.display()))?;
            let partition = Self::partition_for(path);
            let resume_after = resume.get(&partition);
            info!(%partition, resume_after = ?resume_after, "file partition opened");
            readers.push(Box::new(FileReader {
                partition,
                lines: tokio::io::BufReader::new(file).lines(),
                next_position: 0,
                resume_after,
            }));
        }
        Ok(readers)
    }
}

struct FileReader {
    partition: PartitionId,
    lines: tokio::io::Lines<tokio::io::BufReader<tokio::fs::File>>,
    next_position: i64,
    resume_after: Option<i64>,
}

#[async_trait]
impl PartitionReader for FileReader {
    fn partition(&self) -> &PartitionId {
        &self.partition
    }

    async fn poll(&mut self) -> Result<Fetch> {
        loop {
            let line = self.lines.next_line().await.map_err(|e| Error::Source {
                partition: self.partition.clone(),
                message: e.to_string(),
            })?;
            let Some(line) = line else {
                return Ok(Fetch::End);
            };
            let position = self.next_position;
            self.next_position += 1;
            if self.resume_after.is_some_and(|r| position <= r) || line.trim().is_empty() {
                continue;
            }
            return Ok(Fetch::Message(RawMessage::new(self.partition.clone(), position, line.into_bytes())));
        }
    }
}

/// Writes each finalized window as `out_dir/dt=YYYY-MM-DD/<window key>.json`.
pub struct JsonSink {
    pub out_dir: PathBuf,
}

impl JsonSink {
    pub fn new(out_dir: impl Into<PathBuf>) -> Self {
        Self { out_dir: out_dir.into() }
    }

    pub fn path_for(&self, key: &WindowKey) -> PathBuf {
        output_path(&self.out_dir, key, "json")
    }
}

#[async_trait]
impl Sink for JsonSink {
    async fn emit(&self, result: &WindowResult) -> Result<()> {
        let path = self.path_for(&result.key);
        let mut bytes = serde_json::to_vec(&result.to_json())?;
        bytes.push(b'\n');
        replace_file(&path, &bytes)
            .await
            .map_err(|e| Error::Sink(format!("{}: {e:#}", path.display())))?;
        tally_core::metrics::BYTES_WRITTEN.with_label_values(&["json"]).inc_by(bytes.len() as u64);
        debug!(path = %path.display(), "window written");
        Ok(())
    }
}

/// `out_dir/dt=<window start date>/<stem>.<ext>`, a pure function of the window key.
pub fn output_path(out_dir: &Path, key: &WindowKey, ext: &str) -> PathBuf {
    let date = key
        .window
        .start
        .to_datetime()
        .map(|d| d.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| "unknown".into());
    out_dir.join(format!("dt={date}")).join(format!("{}.{ext}", file_stem(key)))
}

/// `<window start ms>+<invoice>+<customer>+<country>` with every byte outside
/// `[A-Za-z0-9.-]` written as `_XX`, so distinct keys never share a name.
pub fn file_stem(key: &WindowKey) -> String {
    let g = &key.group;
    format!(
        "{}+{}+{}+{}",
        key.window.start.as_millis(),
        escape(&g.invoice_no),
        escape(&g.customer_id),
        escape(&g.country)
    )
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        if b.is_ascii_alphanumeric() || b == b'.' || b == b'-' {
            out.push(b as char);
        } else {
            out.push_str(&format!("_{b:02X}"));
        }
    }
    out
}

/// Writes `bytes` to a sibling temp file, syncs it, renames it over `path`, then
/// syncs the directory so the rename itself survives a crash.
async fn replace_file(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let dir = path.parent().context("output path has no parent")?;
    tokio::fs::create_dir_all(dir).await.context("creating output directory")?;
    let tmp = tmp_path(path);
    let mut f = tokio::fs::File::create(&tmp).await.context("creating temp file")?;
    f.write_all(bytes).await.context("writing temp file")?;
    f.sync_all().await.context("syncing temp file")?;
    drop(f);
    tokio::fs::rename(&tmp, path).await.context("renaming into place")?;
    sync_dir(dir).await.context("syncing output directory")?;
    Ok(())
}

async fn sync_dir(dir: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    tokio::fs::File::open(dir).await?.sync_all().await?;
    Ok(())
}

pub(crate) fn tmp_path(path: &Path) -> PathBuf {
    let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    path.with_file_name(format!(".{name}.tmp"))
}

// --- Optional Kafka integration (behind feature flag) ---
#[cfg(feature = "kafka")]
mod kafka {
    use super::*;
    use anyhow::Context as _;
    use rdkafka::consumer::{BaseConsumer, Consumer, StreamConsumer};
    use rdkafka::error::KafkaError;
    use rdkafka::message::Message;
    use rdkafka::{ClientConfig, Offset, TopicPartitionList};
    use std::time::Duration;

    /// Reads every partition of `topics`, each through its own assigned consumer.
    ///
    /// Offsets are never committed to the broker: the engine's checkpoint is the only
    /// record of progress, and partitions are assigned right after the checkpointed offset.
    pub struct KafkaSource {
        pub brokers: String,
        pub group_id: String,
        pub topics: Vec<String>,
        pub metadata_timeout: Duration,
    }

    impl KafkaSource {
        pub fn new(brokers: impl Into<String>, group_id: impl Into<String>, topics: Vec<String>) -> Self {
            Self {
                brokers: brokers.into(),
                group_id: group_id.into(),
                topics,
                metadata_timeout: Duration::from_secs(10),
            }
        }

        fn client_config(&self) -> ClientConfig {
            let mut cfg = ClientConfig::new();
            cfg.set("bootstrap.servers", &self.brokers)
                .set("group.id", &self.group_id)
                .set("enable.auto.commit", "false")
                .set("enable.partition.eof", "true")
                .set("auto.offset.reset", "earliest")
                .set("session.timeout.ms", "10000");
            cfg
        }

        async fn partitions(&self) -> anyhow::Result<Vec<PartitionId>> {
            let cfg = self.client_config();
            let topics = self.topics.clone();
            let timeout = self.metadata_timeout;
            tokio::task::spawn_blocking(move || -> anyhow::Result<Vec<PartitionId>> {
                let consumer: BaseConsumer = cfg.create().context("failed to create kafka metadata client")?;
                let mut out = Vec::new();
                for topic in &topics {
                    let md = consumer
                        .fetch_metadata(Some(topic), timeout)
                        .with_context(|| format!("fetching metadata for {topic}"))?;
                    for t in md.topics() {
                        for p in t.partitions() {
                            out.push(PartitionId::new(t.name(), p.id()));
                        }
                    }
                }
                Ok(out)
            })
            .await
            .context("metadata task panicked")?
        }
    }

    #[async_trait]
    impl Source for KafkaSource {
        async fn open(&mut self, resume: &SourcePositions) -> Result<Vec<Box<dyn PartitionReader>>> {
            let partitions = self.partitions().await?;
            let mut readers: Vec<Box<dyn PartitionReader>> = Vec::with_capacity(partitions.len());
            for partition in partitions {
                let consumer: StreamConsumer =
                    self.client_config().create().context("failed to create kafka consumer")?;
                let offset = match resume.get(&partition) {
                    Some(p) => Offset::Offset(p + 1),
                    None => Offset::Beginning,
                };
                let mut tpl = TopicPartitionList::new();
                tpl.add_partition_offset(&partition.topic, partition.partition, offset)
                    .context("building assignment")?;
                consumer.assign(&tpl).with_context(|| format!("assigning {partition}"))?;
                info!(%partition, ?offset, "kafka partition assigned");
                readers.push(Box::new(KafkaPartitionReader { partition, consumer }));
            }
            Ok(readers)
        }
    }

    struct KafkaPartitionReader {
        partition: PartitionId,
        consumer: StreamConsumer,
    }

    #[async_trait]
    impl PartitionReader for KafkaPartitionReader {
        fn partition(&self) -> &PartitionId {
            &self.partition
        }

        async fn poll(&mut self) -> Result<Fetch> {
            match self.consumer.recv().await {
                Ok(m) => {
                    let payload = m.payload().unwrap_or_default().to_vec();
                    Ok(Fetch::Message(RawMessage::new(self.partition.clone(), m.offset(), payload)))
                }
                Err(KafkaError::PartitionEOF(_)) => Ok(Fetch::Idle),
                Err(e) => Err(Error::Source { partition: self.partition.clone(), message: e.to_string() }),
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn consumer_config_disables_broker_commits() {
            let src = KafkaSource::new("b:9092", "g1", vec!["low_quantity".into()]);
            let cfg = src.client_config();
            assert_eq!(cfg.get("enable.auto.commit"), Some("false"));
            assert_eq!(cfg.get("enable.partition.eof"), Some("true"));
            assert_eq!(cfg.get("group.id"), Some("g1"));
        }
    }
}

#[cfg(feature = "kafka")]
pub use kafka::KafkaSource;

#[cfg(feature = "parquet")]
pub mod parquet_sink;
#[cfg(feature = "parquet")]
pub use parquet_sink::{ParquetSink, ParquetSinkConfig};

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};

use crate::window::{Totals, WindowKey};
use crate::{Error, EventTime, PartitionClock, Result, SourcePositions, Watermark};

/// Monotonically increasing checkpoint identifier.
pub type CheckpointId = u64;

const CURRENT_FILE: &str = "CURRENT";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StateEntry {
    pub key: WindowKey,
    pub totals: Totals,
}

/// Consistent cut of the engine: open aggregation state, the source positions it
/// reflects, and the watermark clocks at the moment of the snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Checkpoint {
    pub id: CheckpointId,
    pub created_at: DateTime<Utc>,
    pub watermark: Option<Watermark>,
    /// Per-partition event-time progress behind `watermark`.
    #[serde(default)]
    pub clocks: Vec<PartitionClock>,
    pub positions: SourcePositions,
    pub state: Vec<StateEntry>,
}

impl Checkpoint {
    pub fn summary(&self) -> CheckpointSummary {
        CheckpointSummary {
            id: self.id,
            created_at: self.created_at,
            watermark: self.watermark.map(|w| w.0),
            positions: self.positions.clone(),
            open_windows: self.state.len(),
        }
    }
}

/// Human-oriented view of a checkpoint (what `tally inspect` prints).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckpointSummary {
    pub id: CheckpointId,
    pub created_at: DateTime<Utc>,
    pub watermark: Option<EventTime>,
    pub positions: SourcePositions,
    pub open_windows: usize,
}

/// Durable home of checkpoints. `write_atomic` must never leave a torn latest checkpoint.
#[async_trait::async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load_latest(&self) -> Result<Option<Checkpoint>>;
    async fn write_atomic(&self, checkpoint: &Checkpoint) -> Result<()>;
}

/// In-memory checkpoint store for tests and single-process embedding.
#[derive(Default)]
pub struct InMemoryCheckpointStore {
    latest: tokio::sync::Mutex<Option<Checkpoint>>,
    writes: AtomicU64,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn load_latest(&self) -> Result<Option<Checkpoint>> {
        Ok(self.latest.lock().await.clone())
    }

    async fn write_atomic(&self, checkpoint: &Checkpoint) -> Result<()> {
        *self.latest.lock().await = Some(checkpoint.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// File-system checkpoint store.
///
/// Layout:
/// ```text
/// <dir>/chk-00000000000000000007.json   full checkpoint, written via tmp + fsync + rename
/// <dir>/CURRENT                         name of the latest complete checkpoint file
/// ```
/// A new checkpoint file is fully durable before `CURRENT` is swapped to point at it,
/// so a crash at any step leaves the previous checkpoint readable.
pub struct FsCheckpointStore {
    dir: PathBuf,
    keep_last: usize,
}

impl FsCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>, keep_last: usize) -> Self {
        Self { dir: dir.into(), keep_last: keep_last.max(1) }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_name(id: CheckpointId) -> String {
        format!("chk-{id:020}.json")
    }

    fn parse_file_name(name: &str) -> Option<CheckpointId> {
        name.strip_prefix("chk-")?.strip_suffix(".json")?.parse().ok()
    }

    /// Checkpoint ids present on disk, oldest first.
    pub async fn list(&self) -> Result<Vec<CheckpointId>> {
        let mut ids = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if let Some(id) = entry.file_name().to_str().and_then(Self::parse_file_name) {
                ids.push(id);
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    async fn write_synced(path: &Path, bytes: &[u8]) -> Result<()> {
        let mut f = tokio::fs::File::create(path).await?;
        f.write_all(bytes).await?;
        f.sync_all().await?;
        Ok(())
    }

    /// Writes `bytes` next to `name` and renames over it.
    async fn replace(&self, name: &str, bytes: &[u8]) -> Result<()> {
        let tmp = self.dir.join(format!("{name}.tmp"));
        Self::write_synced(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, self.dir.join(name)).await?;
        Ok(())
    }

    async fn sync_dir(&self) -> Result<()> {
        #[cfg(unix)]
        tokio::fs::File::open(&self.dir).await?.sync_all().await?;
        Ok(())
    }

    async fn prune(&self, current: CheckpointId) -> Result<()> {
        let ids = self.list().await?;
        if ids.len() <= self.keep_last {
            return Ok(());
        }
        let purge_count = ids.len() - self.keep_last;
        for id in ids.into_iter().take(purge_count).filter(|id| *id != current) {
            let path = self.dir.join(Self::file_name(id));
            if let Err(e) = tokio::fs::remove_file(&path).await {
                warn!(path = %path.display(), error = %e, "failed to prune old checkpoint");
            } else {
                debug!(checkpoint = id, "pruned old checkpoint");
            }
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl CheckpointStore for FsCheckpointStore {
    async fn load_latest(&self) -> Result<Option<Checkpoint>> {
        let pointer = match tokio::fs::read_to_string(self.dir.join(CURRENT_FILE)).await {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let name = pointer.trim();
        if Self::parse_file_name(name).is_none() {
            return Err(Error::Checkpoint(format!("CURRENT points at unexpected file {name:?}")));
        }
        let bytes = tokio::fs::read(self.dir.join(name)).await?;
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    async fn write_atomic(&self, checkpoint: &Checkpoint) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let name = Self::file_name(checkpoint.id);
        let bytes = serde_json::to_vec(checkpoint)?;
        self.replace(&name, &bytes).await?;
        self.replace(CURRENT_FILE, format!("{name}\n").as_bytes()).await?;
        self.sync_dir().await?;
        self.prune(checkpoint.id).await
    }
}

/// Owns the checkpoint lifecycle: one recovery read at startup, then strictly
/// sequential commits with increasing ids.
pub struct CheckpointManager {
    store: Arc<dyn CheckpointStore>,
    next_id: tokio::sync::Mutex<CheckpointId>,
    recovered: AtomicBool,
}

impl CheckpointManager {
    pub fn new(store: Arc<dyn CheckpointStore>) -> Self {
        Self { store, next_id: tokio::sync::Mutex::new(1), recovered: AtomicBool::new(false) }
    }

    /// Loads the latest durable checkpoint. Only valid once per manager.
    pub async fn recover(&self) -> Result<Option<Checkpoint>> {
        if self.recovered.swap(true, Ordering::SeqCst) {
            return Err(Error::Checkpoint("latest checkpoint was already recovered".into()));
        }
        let latest = self
            .store
            .load_latest()
            .await
            .map_err(|e| Error::Checkpoint(format!("loading latest checkpoint: {e}")))?;
        match &latest {
            Some(cp) => {
                *self.next_id.lock().await = cp.id + 1;
                info!(
                    checkpoint = cp.id,
                    open_windows = cp.state.len(),
                    partitions = cp.positions.len(),
                    watermark = ?cp.watermark.map(|w| w.to_string()),
                    "recovered checkpoint"
                );
            }
            None => info!("no checkpoint found; starting from the beginning of all partitions"),
        }
        Ok(latest)
    }

    /// Durably writes a new checkpoint. Concurrent callers are serialized.
    pub async fn commit(
        &self,
        state: Vec<StateEntry>,
        positions: SourcePositions,
        watermark: Option<Watermark>,
        clocks: Vec<PartitionClock>,
    ) -> Result<CheckpointId> {
        let mut next = self.next_id.lock().await;
        let checkpoint = Checkpoint { id: *next, created_at: Utc::now(), watermark, clocks, positions, state };
        let started = Instant::now();
        if let Err(e) = self.store.write_atomic(&checkpoint).await {
            error!(checkpoint = checkpoint.id, error = %e, "checkpoint write failed");
            return Err(Error::Checkpoint(format!("writing checkpoint {}: {e}", checkpoint.id)));
        }
        crate::metrics::CHECKPOINTS_WRITTEN.inc();
        crate::metrics::CHECKPOINT_LATENCY_MS.observe(started.elapsed().as_secs_f64() * 1_000.0);
        debug!(
            checkpoint = checkpoint.id,
            open_windows = checkpoint.state.len(),
            "checkpoint committed"
        );
        *next += 1;
        Ok(checkpoint.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::window::{GroupKey, Window};
    use crate::PartitionId;

    fn entry(invoice: &str, qty: i64) -> StateEntry {
        let mut totals = Totals::default();
        totals.add(qty, 2.5);
        StateEntry {
            key: WindowKey::new(
                GroupKey { invoice_no: invoice.into(), customer_id: "17850".into(), country: "France".into() },
                Window::new(EventTime(0), EventTime(600_000)),
            ),
            totals,
        }
    }

    fn positions(pos: i64) -> SourcePositions {
        let mut p = SourcePositions::new();
        p.advance(&PartitionId::new("low_quantity", 0), pos);
        p
    }

    #[test]
    fn checkpoint_json_roundtrip() {
        let cp = Checkpoint {
            id: 3,
            created_at: DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap(),
            watermark: Some(Watermark(EventTime(1_291_191_960_000))),
            clocks: vec![PartitionClock {
                partition: PartitionId::new("low_quantity", 0),
                max_observed: EventTime(1_291_192_020_000),
                idle: false,
            }],
            positions: positions(41),
            state: vec![entry("536365", 6)],
        };
        let s = serde_json::to_string(&cp).unwrap();
        let back: Checkpoint = serde_json::from_str(&s).unwrap();
        assert_eq!(cp, back);
        assert_eq!(back.summary().open_windows, 1);
    }

    #[test]
    fn checkpoint_without_clocks_still_parses() {
        let json = r#"{"id":1,"created_at":"2010-12-01T08:26:00Z","watermark":null,"positions":[],"state":[]}"#;
        let cp: Checkpoint = serde_json::from_str(json).unwrap();
        assert!(cp.clocks.is_empty());
    }

    #[tokio::test]
    async fn fs_store_without_checkpoint_loads_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsCheckpointStore::new(dir.path().join("missing"), 3);
        assert!(store.load_latest().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn fs_store_swaps_current_after_full_write() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FsCheckpointStore::new(dir.path(), 2));
        let manager = CheckpointManager::new(store.clone());
        assert!(manager.recover().await.unwrap().is_none());

        let first = manager.commit(vec![entry("A1", 3)], positions(1), None, vec![]).await.unwrap();
        let second = manager
            .commit(vec![entry("A1", 5)], positions(2), Some(Watermark(EventTime(10))), vec![])
            .await
            .unwrap();
        assert_eq!((first, second), (1, 2));

        let latest = store.load_latest().await.unwrap().unwrap();
        assert_eq!(latest.id, 2);
        assert_eq!(latest.state[0].totals.total_quantity, 5);
        assert_eq!(latest.positions.get(&PartitionId::new("low_quantity", 0)), Some(2));

        // A torn write of a newer checkpoint never becomes visible.
        tokio::fs::write(dir.path().join(FsCheckpointStore::file_name(3) + ".tmp"), b"{\"id\":")
            .await
            .unwrap();
        assert_eq!(store.load_latest().await.unwrap().unwrap().id, 2);
    }

    #[tokio::test]
    async fn fs_store_prunes_to_keep_last() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FsCheckpointStore::new(dir.path(), 2));
        let manager = CheckpointManager::new(store.clone());
        manager.recover().await.unwrap();
        for i in 0..5 {
            manager.commit(vec![], positions(i), None, vec![]).await.unwrap();
        }
        assert_eq!(store.list().await.unwrap(), vec![4, 5]);
    }

    #[tokio::test]
    async fn manager_resumes_ids_after_recovery() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let first = CheckpointManager::new(store.clone());
        first.recover().await.unwrap();
        first.commit(vec![], positions(9), None, vec![]).await.unwrap();

        let second = CheckpointManager::new(store.clone());
        let recovered = second.recover().await.unwrap().unwrap();
        assert_eq!(recovered.id, 1);
        assert_eq!(second.commit(vec![], positions(10), None, vec![]).await.unwrap(), 2);
        assert!(second.recover().await.is_err());
        assert_eq!(store.writes(), 2);
    }

    #[tokio::test]
    async fn corrupt_pointer_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join(CURRENT_FILE), b"garbage\n").await.unwrap();
        let store = FsCheckpointStore::new(dir.path(), 1);
        assert!(matches!(store.load_latest().await, Err(Error::Checkpoint(_))));
    }
}

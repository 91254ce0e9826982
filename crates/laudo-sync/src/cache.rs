//! Local snapshot cache
//!
//! Layout: `<dir>/RL-<seq>-<year>.json`, one file per report. Each write goes
//! to its own temporary file in the same directory that is then renamed over
//! the entry, so a crash never leaves a half-written snapshot.
//!
//! Clones of a [`LocalCache`] share one write lock: a save and the
//! read-compare-write of [`LocalCache::mark_synced`] never interleave.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use laudo_core::{ControlNumber, LocalSnapshot};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::SyncError;

/// One cached report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    #[serde(rename = "avaliacaoId")]
    pub report_id: i64,
    pub controle: ControlNumber,
    #[serde(flatten)]
    pub snapshot: LocalSnapshot,
    /// Set once the server has accepted this exact snapshot
    #[serde(default)]
    pub synced: bool,
}

#[derive(Debug, Clone)]
pub struct LocalCache {
    dir: PathBuf,
    writes: Arc<Mutex<()>>,
}

impl LocalCache {
    /// Open (creating if needed) a cache directory
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, SyncError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            writes: Arc::default(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, control: &ControlNumber) -> PathBuf {
        self.dir.join(format!(
            "RL-{:03}-{}.json",
            control.sequence(),
            control.year()
        ))
    }

    pub async fn save(&self, entry: &CacheEntry) -> Result<(), SyncError> {
        self.save_then(entry, || ()).await
    }

    /// Save an entry and run `then` before any other write can start
    pub(crate) async fn save_then<T>(
        &self,
        entry: &CacheEntry,
        then: impl FnOnce() -> T,
    ) -> Result<T, SyncError> {
        let _guard = self.writes.lock().await;
        self.write_entry(entry).await?;
        Ok(then())
    }

    /// Callers hold the write lock
    async fn write_entry(&self, entry: &CacheEntry) -> Result<(), SyncError> {
        let path = self.entry_path(&entry.controle);
        let dir = self.dir.clone();
        let bytes = serde_json::to_vec_pretty(entry)?;
        tokio::task::spawn_blocking(move || -> io::Result<()> {
            let mut staged = tempfile::NamedTempFile::new_in(&dir)?;
            staged.write_all(&bytes)?;
            staged.as_file().sync_all()?;
            staged.persist(&path)?;
            Ok(())
        })
        .await
        .map_err(io::Error::other)??;
        debug!("Cached {} (synced: {})", entry.controle, entry.synced);
        Ok(())
    }

    /// Load a report's entry. Missing and unreadable entries both yield `None`.
    pub async fn load(&self, control: &ControlNumber) -> Result<Option<CacheEntry>, SyncError> {
        let path = self.entry_path(control);
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_slice(&raw) {
            Ok(entry) => Ok(Some(entry)),
            Err(e) => {
                warn!("Ignoring unreadable cache entry {}: {}", path.display(), e);
                Ok(None)
            }
        }
    }

    /// The cached snapshot of a report, for restoring editor state
    pub async fn snapshot(
        &self,
        control: &ControlNumber,
    ) -> Result<Option<LocalSnapshot>, SyncError> {
        Ok(self.load(control).await?.map(|entry| entry.snapshot))
    }

    /// Mark an entry synced if it still holds the snapshot stamped
    /// `updated_at`. Returns `false` when a newer snapshot has replaced it.
    pub async fn mark_synced(
        &self,
        control: &ControlNumber,
        updated_at: Option<DateTime<Utc>>,
    ) -> Result<bool, SyncError> {
        let _guard = self.writes.lock().await;
        let Some(mut entry) = self.load(control).await? else {
            return Ok(false);
        };
        if entry.snapshot.updated_at != updated_at {
            debug!("{} changed while syncing; leaving it pending", control);
            return Ok(false);
        }
        entry.synced = true;
        self.write_entry(&entry).await?;
        Ok(true)
    }

    /// Every entry not yet accepted by the server, oldest first
    pub async fn pending(&self) -> Result<Vec<CacheEntry>, SyncError> {
        let mut pending = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.dir).await?;
        while let Some(item) = dir.next_entry().await? {
            let path = item.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let raw = tokio::fs::read(&path).await?;
            match serde_json::from_slice::<CacheEntry>(&raw) {
                Ok(entry) if !entry.synced => pending.push(entry),
                Ok(_) => {}
                Err(e) => warn!("Skipping unreadable cache entry {}: {}", path.display(), e),
            }
        }
        pending.sort_by_key(|entry| entry.snapshot.updated_at);
        Ok(pending)
    }

    /// Drop a report's entry, e.g. after the report was deleted
    pub async fn remove(&self, control: &ControlNumber) -> Result<(), SyncError> {
        match tokio::fs::remove_file(self.entry_path(control)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use laudo_core::{restore, ConflictPolicy, ReportData, RestoreSource, ServerState};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn entry(seq: u32, endereco: &str) -> CacheEntry {
        CacheEntry {
            report_id: i64::from(seq),
            controle: ControlNumber::new(seq, 2024),
            snapshot: LocalSnapshot::new(
                json!({"identificacaoImovel": {"endereco": endereco}}),
                vec![json!({"descricao": "Sala"})],
                vec![],
            ),
            synced: false,
        }
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LocalCache::open(dir.path()).await.unwrap();
        let saved = entry(1, "Rua A");
        cache.save(&saved).await.unwrap();

        let loaded = cache.load(&saved.controle).await.unwrap().unwrap();
        assert_eq!(loaded, saved);
        assert!(dir.path().join("RL-001-2024.json").exists());
        // No staging files left behind
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_entry_file_uses_snapshot_keys() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LocalCache::open(dir.path()).await.unwrap();
        cache.save(&entry(2, "Rua B")).await.unwrap();

        let raw = std::fs::read_to_string(dir.path().join("RL-002-2024.json")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["controle"], "RL 002-2024");
        assert_eq!(value["avaliacaoId"], 2);
        assert_eq!(value["dados"]["identificacaoImovel"]["endereco"], "Rua B");
        assert!(value["atualizadoEm"].is_string());
        assert_eq!(value["synced"], false);
    }

    #[tokio::test]
    async fn test_missing_and_corrupt_entries_load_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LocalCache::open(dir.path()).await.unwrap();
        let control = ControlNumber::new(5, 2024);
        assert!(cache.load(&control).await.unwrap().is_none());

        std::fs::write(dir.path().join("RL-005-2024.json"), "{not json").unwrap();
        assert!(cache.load(&control).await.unwrap().is_none());
        assert!(cache.pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pending_skips_synced_entries() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LocalCache::open(dir.path()).await.unwrap();
        let first = entry(1, "Rua A");
        let second = entry(2, "Rua B");
        cache.save(&first).await.unwrap();
        cache.save(&second).await.unwrap();

        assert_eq!(cache.pending().await.unwrap().len(), 2);

        let marked = cache
            .mark_synced(&first.controle, first.snapshot.updated_at)
            .await
            .unwrap();
        assert!(marked);

        let pending = cache.pending().await.unwrap();
        assert_eq!(pending, vec![second]);
    }

    #[tokio::test]
    async fn test_mark_synced_ignores_stale_push() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LocalCache::open(dir.path()).await.unwrap();
        let old = entry(1, "Rua A");
        cache.save(&old).await.unwrap();

        let mut newer = entry(1, "Rua A, 20");
        newer.snapshot.updated_at = old
            .snapshot
            .updated_at
            .map(|t| t + chrono::Duration::seconds(1));
        cache.save(&newer).await.unwrap();

        let marked = cache
            .mark_synced(&old.controle, old.snapshot.updated_at)
            .await
            .unwrap();
        assert!(!marked);
        assert!(!cache.load(&old.controle).await.unwrap().unwrap().synced);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_saves_and_marks_keep_newest_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LocalCache::open(dir.path()).await.unwrap();

        for round in 0..50i64 {
            let old = entry(1, &format!("Rua A {}", round));
            cache.save(&old).await.unwrap();
            let mut newer = entry(1, &format!("Rua B {}", round));
            newer.snapshot.updated_at = old
                .snapshot
                .updated_at
                .map(|t| t + chrono::Duration::seconds(1));

            let marking = {
                let cache = cache.clone();
                let stamp = old.snapshot.updated_at;
                let control = old.controle;
                tokio::spawn(async move { cache.mark_synced(&control, stamp).await })
            };
            let saving = {
                let cache = cache.clone();
                let newer = newer.clone();
                tokio::spawn(async move { cache.save(&newer).await })
            };
            marking.await.unwrap().unwrap();
            saving.await.unwrap().unwrap();

            let stored = cache.load(&newer.controle).await.unwrap().unwrap();
            assert_eq!(stored, newer, "round {}", round);
        }
    }

    #[tokio::test]
    async fn test_cached_snapshot_restores_over_server_data() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LocalCache::open(dir.path()).await.unwrap();
        let cached = entry(3, "Rua Local");
        cache.save(&cached).await.unwrap();

        let server = ServerState {
            dados: json!({"identificacaoImovel": {"endereco": "Rua Servidor"}}),
            ..Default::default()
        };
        let snapshot = cache.snapshot(&cached.controle).await.unwrap();
        let restored = restore(
            &ReportData::skeleton(),
            &server,
            snapshot.as_ref(),
            ConflictPolicy::LocalWins,
        );

        assert_eq!(restored.source, RestoreSource::LocalCache);
        assert_eq!(restored.data["identificacaoImovel"]["endereco"], "Rua Local");
        assert_eq!(restored.areas, vec![json!({"descricao": "Sala"})]);
    }

    #[tokio::test]
    async fn test_remove_tolerates_missing_entry() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LocalCache::open(dir.path()).await.unwrap();
        let saved = entry(4, "Rua D");
        cache.save(&saved).await.unwrap();

        cache.remove(&saved.controle).await.unwrap();
        cache.remove(&saved.controle).await.unwrap();
        assert!(cache.load(&saved.controle).await.unwrap().is_none());
    }
}

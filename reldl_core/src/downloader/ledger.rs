use std::collections::BTreeSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::types::error::LedgerError;
use crate::types::types::LedgerKey;

/// Suffix of the sidecar file stored next to the output.
pub const LEDGER_SUFFIX: &str = ".reldl.json";

const RECORD_VERSION: u32 = 1;

/// Durable record of the chunks already written for one resource.
///
/// Completion is only trusted when the stored key equals the caller's key;
/// any mismatch reads as "nothing completed".
#[async_trait]
pub trait ResumeLedger: Send + Sync {
    /// Completed chunk indices, empty if there is no record or its key differs.
    async fn load(&self, key: &LedgerKey) -> Result<BTreeSet<u32>, LedgerError>;

    /// Records `index` as completed. Durable when it returns; re-marking is a no-op.
    async fn mark_completed(&self, key: &LedgerKey, index: u32) -> Result<(), LedgerError>;

    /// Drops all stored state.
    async fn invalidate(&self, key: &LedgerKey) -> Result<(), LedgerError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct LedgerRecord {
    version: u32,
    key: LedgerKey,
    completed: BTreeSet<u32>,
}

impl LedgerRecord {
    fn new(key: &LedgerKey) -> Self {
        Self {
            version: RECORD_VERSION,
            key: key.clone(),
            completed: BTreeSet::new(),
        }
    }
}

#[derive(Default)]
struct LedgerCache {
    loaded: bool,
    record: Option<LedgerRecord>,
}

/// JSON sidecar ledger.
///
/// Every mutation writes a fresh temp file, fsyncs it and renames it over
/// the sidecar, so a crash leaves either the old or the new record on disk.
/// The async mutex serializes concurrent workers.
pub struct FileLedger {
    path: PathBuf,
    cache: tokio::sync::Mutex<LedgerCache>,
}

impl FileLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cache: tokio::sync::Mutex::new(LedgerCache::default()),
        }
    }

    /// Ledger co-located with `output` as `<output>.reldl.json`.
    pub fn for_output(output: impl AsRef<Path>) -> Self {
        Self::new(sidecar_path(output.as_ref()))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Deletes the sidecar. Missing files are fine.
    pub async fn remove(&self) -> Result<(), LedgerError> {
        let mut cache = self.cache.lock().await;
        cache.loaded = true;
        cache.record = None;
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn ensure_loaded(&self, cache: &mut LedgerCache) -> Result<(), LedgerError> {
        if !cache.loaded {
            cache.record = self.read_record().await?;
            cache.loaded = true;
        }
        Ok(())
    }

    async fn read_record(&self) -> Result<Option<LedgerRecord>, LedgerError> {
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_str::<LedgerRecord>(&text) {
            Ok(record) if record.version == RECORD_VERSION => Ok(Some(record)),
            Ok(record) => {
                log::warn!(
                    "[ledger] {}: unsupported record version {}, ignoring",
                    self.path.display(),
                    record.version
                );
                Ok(None)
            }
            Err(e) => {
                log::warn!("[ledger] {}: unreadable record, ignoring: {}", self.path.display(), e);
                Ok(None)
            }
        }
    }

    async fn persist(&self, record: &LedgerRecord) -> Result<(), LedgerError> {
        let json = serde_json::to_vec_pretty(record)?;
        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "ledger".to_string());
        let tmp = self
            .path
            .with_file_name(format!("{}.{}.tmp", file_name, Uuid::new_v4()));

        let write = async {
            let mut file = tokio::fs::File::create(&tmp).await?;
            file.write_all(&json).await?;
            file.sync_all().await?;
            drop(file);
            tokio::fs::rename(&tmp, &self.path).await
        };
        if let Err(e) = write.await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        sync_parent_dir(&self.path).await;
        Ok(())
    }
}

#[async_trait]
impl ResumeLedger for FileLedger {
    async fn load(&self, key: &LedgerKey) -> Result<BTreeSet<u32>, LedgerError> {
        let mut cache = self.cache.lock().await;
        cache.record = self.read_record().await?;
        cache.loaded = true;

        match &cache.record {
            Some(record) if &record.key == key => Ok(record.completed.clone()),
            Some(record) => {
                log::info!(
                    "[ledger] {}: stored key {:?} does not match {:?}; previous progress is stale",
                    self.path.display(),
                    record.key,
                    key
                );
                Ok(BTreeSet::new())
            }
            None => Ok(BTreeSet::new()),
        }
    }

    async fn mark_completed(&self, key: &LedgerKey, index: u32) -> Result<(), LedgerError> {
        let mut cache = self.cache.lock().await;
        self.ensure_loaded(&mut cache).await?;

        let record = match cache.record.take() {
            Some(record) if &record.key == key => record,
            _ => LedgerRecord::new(key),
        };
        if record.completed.contains(&index) {
            cache.record = Some(record);
            return Ok(());
        }

        let mut updated = record.clone();
        updated.completed.insert(index);
        match self.persist(&updated).await {
            Ok(()) => {
                cache.record = Some(updated);
                Ok(())
            }
            Err(e) => {
                cache.record = Some(record);
                Err(e)
            }
        }
    }

    async fn invalidate(&self, _key: &LedgerKey) -> Result<(), LedgerError> {
        self.remove().await
    }
}

/// `<output>.reldl.json` next to `output`.
pub fn sidecar_path(output: &Path) -> PathBuf {
    let mut name = output
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "download".into());
    name.push(LEDGER_SUFFIX);
    output.with_file_name(name)
}

#[cfg(unix)]
async fn sync_parent_dir(path: &Path) {
    let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) else {
        return;
    };
    let result = async { tokio::fs::File::open(dir).await?.sync_all().await }.await;
    if let Err(e) = result {
        log::debug!("[ledger] could not fsync {}: {}", dir.display(), e);
    }
}

#[cfg(not(unix))]
async fn sync_parent_dir(_path: &Path) {}

/// Process-local ledger; progress does not survive a restart.
#[derive(Default)]
pub struct MemoryLedger {
    record: Mutex<Option<LedgerRecord>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<LedgerRecord>> {
        self.record.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl ResumeLedger for MemoryLedger {
    async fn load(&self, key: &LedgerKey) -> Result<BTreeSet<u32>, LedgerError> {
        Ok(self
            .lock()
            .as_ref()
            .filter(|record| &record.key == key)
            .map(|record| record.completed.clone())
            .unwrap_or_default())
    }

    async fn mark_completed(&self, key: &LedgerKey, index: u32) -> Result<(), LedgerError> {
        let mut guard = self.lock();
        let record = guard.get_or_insert_with(|| LedgerRecord::new(key));
        if &record.key != key {
            *record = LedgerRecord::new(key);
        }
        record.completed.insert(index);
        Ok(())
    }

    async fn invalidate(&self, _key: &LedgerKey) -> Result<(), LedgerError> {
        *self.lock() = None;
        Ok(())
    }
}

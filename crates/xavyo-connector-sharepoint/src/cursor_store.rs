//! Durable storage of per-scope change cursors.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tempfile::NamedTempFile;
use tracing::debug;

use crate::error::{SharePointError, SharePointResult};

/// Scope id to cursor.
pub type CursorMap = BTreeMap<String, String>;

#[async_trait]
pub trait CursorStore: Send + Sync {
    async fn load(&self) -> SharePointResult<CursorMap>;

    /// Replaces the stored cursors with `cursors`.
    async fn save(&self, cursors: &CursorMap) -> SharePointResult<()>;
}

/// Keeps cursors in memory only; they are lost on restart.
#[derive(Debug, Default)]
pub struct MemoryCursorStore {
    cursors: Mutex<CursorMap>,
    saves: std::sync::atomic::AtomicUsize,
}

impl MemoryCursorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cursors(cursors: CursorMap) -> Self {
        Self {
            cursors: Mutex::new(cursors),
            ..Self::default()
        }
    }

    /// Number of completed saves.
    pub fn saves(&self) -> usize {
        self.saves.load(std::sync::atomic::Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> CursorMap {
        self.cursors.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl CursorStore for MemoryCursorStore {
    async fn load(&self) -> SharePointResult<CursorMap> {
        Ok(self.snapshot())
    }

    async fn save(&self, cursors: &CursorMap) -> SharePointResult<()> {
        if let Ok(mut stored) = self.cursors.lock() {
            *stored = cursors.clone();
        }
        self.saves.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }
}

/// JSON file store. Writes go to a temp file in the same directory which is
/// then renamed over the target, so a crash leaves either the old or the new
/// map on disk.
#[derive(Debug, Clone)]
pub struct FileCursorStore {
    path: PathBuf,
}

impl FileCursorStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> SharePointResult<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.flush()?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| SharePointError::Io(e.error))?;
    Ok(())
}

#[async_trait]
impl CursorStore for FileCursorStore {
    async fn load(&self) -> SharePointResult<CursorMap> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(CursorMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, cursors: &CursorMap) -> SharePointResult<()> {
        let bytes = serde_json::to_vec_pretty(cursors)?;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_atomic(&path, &bytes))
            .await
            .map_err(|e| SharePointError::Io(std::io::Error::other(e)))??;
        debug!(path = %self.path.display(), scopes = cursors.len(), "Cursors persisted");
        Ok(())
    }
}

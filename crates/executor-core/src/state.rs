use crate::error::ExecutorError;
use std::path::{Path, PathBuf};

/// Persists executor state snapshots so another process can resume or clean up a job.
pub trait StateStore: Send + Sync {
    fn save(&self, key: &str, state: &serde_json::Value) -> Result<(), ExecutorError>;

    fn load(&self, key: &str) -> Result<Option<serde_json::Value>, ExecutorError>;

    fn remove(&self, key: &str) -> Result<(), ExecutorError>;
}

/// Stores each snapshot as `<key>.state.json` in a directory.
#[derive(Debug, Clone)]
pub struct FileStateStore {
    dir: PathBuf,
}

impl FileStateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.state.json", key))
    }
}

impl StateStore for FileStateStore {
    fn save(&self, key: &str, state: &serde_json::Value) -> Result<(), ExecutorError> {
        std::fs::create_dir_all(&self.dir)?;
        let json = serde_json::to_string_pretty(state)?;
        std::fs::write(self.path(key), json)?;
        Ok(())
    }

    fn load(&self, key: &str) -> Result<Option<serde_json::Value>, ExecutorError> {
        let path = self.path(key);
        if !path.exists() {
            return Ok(None);
        }
        let data = std::fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&data)?))
    }

    fn remove(&self, key: &str) -> Result<(), ExecutorError> {
        match std::fs::remove_file(self.path(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

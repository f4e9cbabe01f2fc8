//! Durable state document (`state.json`) with serialized read-modify-write.
//!
//! Every mutation goes through [`StateStore::update`], which holds a single
//! async mutex across load, apply, and persist. Two concurrent updates can
//! therefore never both start from the same stale snapshot. File access runs
//! on the blocking pool while the mutex is held.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tracing::{debug, instrument};

use crate::core::types::State;

/// Load state from disk; a missing file is an empty state.
pub fn load_state(path: &Path) -> Result<State> {
    if !path.exists() {
        debug!(path = %path.display(), "state missing, using default");
        return Ok(State::default());
    }
    let contents =
        fs::read_to_string(path).with_context(|| format!("read state {}", path.display()))?;
    let state: State = serde_json::from_str(&contents)
        .with_context(|| format!("parse state {}", path.display()))?;
    Ok(state)
}

/// Atomically write state to disk (temp file + rename).
pub fn write_state(path: &Path, state: &State) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(state).context("serialize state")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("state path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp state {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace state {}", path.display()))?;
    Ok(())
}

/// Shared handle to the state document. Clones share one update queue.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Snapshot of the persisted state. Waits for any in-flight update.
    pub async fn read(&self) -> Result<State> {
        let _guard = self.lock.lock().await;
        self.load().await
    }

    /// Load, apply `f`, persist, and return the new state.
    ///
    /// Updates are applied in the order callers acquire the queue. If `f`
    /// fails or the write fails, nothing is persisted and the error propagates.
    #[instrument(skip_all, fields(path = %self.path.display()))]
    pub async fn update<T, F>(&self, f: F) -> Result<(State, T)>
    where
        F: FnOnce(&mut State) -> Result<T>,
    {
        let _guard = self.lock.lock().await;
        let mut state = self.load().await?;
        let out = f(&mut state)?;
        let state = self.write(state).await?;
        Ok((state, out))
    }

    // Callers must hold `lock`.
    async fn load(&self) -> Result<State> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || load_state(&path))
            .await
            .context("join state load")?
    }

    // Callers must hold `lock`.
    async fn write(&self, state: State) -> Result<State> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_state(&path, &state).map(|()| state))
            .await
            .context("join state write")?
    }
}

//! File-backed history store for development and tests.
//!
//! `state.yaml` holds the applied revisions and the schema they produced; every
//! apply rewrites it atomically. The lock is `migration.lock`, created with
//! `create_new` so only one process can hold it.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{MigrationError, Result};
use crate::io::{atomic_write, ensure_dir};
use crate::paths;
use crate::schema::SchemaModel;

use super::script::RevisionScript;
use super::store::{LockGuard, MigrationStore};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LocalState {
    #[serde(default)]
    pub applied: Vec<AppliedRevision>,
    #[serde(default)]
    pub schema: SchemaModel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedRevision {
    pub version: String,
    pub name: String,
    pub applied_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct LocalMigrationStore {
    dir: PathBuf,
}

impl LocalMigrationStore {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    pub fn load_state(&self) -> Result<LocalState> {
        let path = paths::local_state_path(&self.dir);
        if !path.exists() {
            return Ok(LocalState::default());
        }
        let data = std::fs::read_to_string(&path)?;
        Ok(serde_yaml::from_str(&data)?)
    }

    fn save_state(&self, state: &LocalState) -> Result<()> {
        let data = serde_yaml::to_string(state)?;
        atomic_write(&paths::local_state_path(&self.dir), data.as_bytes())
    }
}

#[async_trait]
impl MigrationStore for LocalMigrationStore {
    async fn try_lock(&self) -> Result<Option<Box<dyn LockGuard>>> {
        ensure_dir(&self.dir)?;
        let path = paths::local_lock_path(&self.dir);
        let holder = format!("pid {} since {}", std::process::id(), Utc::now().to_rfc3339());
        let guard = create_lock(path, holder, |file, holder| file.write_all(holder.as_bytes()))?;
        Ok(guard.map(|g| {
            debug!(lock = %g.path.display(), "migration lock acquired");
            Box::new(g) as Box<dyn LockGuard>
        }))
    }

    async fn applied(&self) -> Result<Vec<String>> {
        Ok(self
            .load_state()?
            .applied
            .into_iter()
            .map(|r| r.version)
            .collect())
    }

    async fn apply(&self, script: &RevisionScript) -> Result<()> {
        let mut state = self.load_state()?;
        if state.applied.iter().any(|r| r.version == script.version) {
            return Err(MigrationError::Apply {
                version: script.version.clone(),
                reason: "already recorded as applied".to_string(),
            }
            .into());
        }
        // work on a copy so a failing change leaves state.yaml untouched
        let mut schema = state.schema.clone();
        for change in &script.changes {
            schema.apply(change).map_err(|reason| MigrationError::Apply {
                version: script.version.clone(),
                reason,
            })?;
        }
        state.schema = schema;
        state.applied.push(AppliedRevision {
            version: script.version.clone(),
            name: script.name.clone(),
            applied_at: Utc::now(),
        });
        self.save_state(&state)
    }

    async fn live_schema(&self) -> Result<SchemaModel> {
        Ok(self.load_state()?.schema)
    }

    async fn lock_holder(&self) -> Option<String> {
        std::fs::read_to_string(paths::local_lock_path(&self.dir)).ok()
    }

    fn describe(&self) -> String {
        format!("local {}", self.dir.display())
    }
}

/// Create `path` exclusively and record `holder` in it through `write`.
///
/// `None` when the file already exists. The guard exists before anything is
/// written, so a failed write removes the file again.
fn create_lock(
    path: PathBuf,
    holder: String,
    write: impl FnOnce(&mut File, &str) -> std::io::Result<()>,
) -> Result<Option<LockFile>> {
    let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let guard = LockFile {
        path,
        holder,
        released: false,
    };
    write(&mut file, &guard.holder)?;
    Ok(Some(guard))
}

/// Removes the lock file on release, or on drop if never released.
struct LockFile {
    path: PathBuf,
    holder: String,
    released: bool,
}

#[async_trait]
impl LockGuard for LockFile {
    fn holder(&self) -> String {
        self.holder.clone()
    }

    async fn release(mut self: Box<Self>) -> Result<()> {
        self.released = true;
        std::fs::remove_file(&self.path)?;
        Ok(())
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if !self.released {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

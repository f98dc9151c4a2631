use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::config::DependencyKind;

#[derive(Debug, Error)]
pub enum CurtainError {
    #[error("config not found: {0} (pass --config or set CURTAIN_CONFIG)")]
    ConfigNotFound(PathBuf),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("environment variable '{0}' is not set and has no default")]
    MissingEnv(String),

    #[error("service not found: {0}")]
    ServiceNotFound(String),

    #[error(transparent)]
    Wait(#[from] WaitError),

    #[error(transparent)]
    Migration(#[from] MigrationError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("listener failed to start: {0}")]
    Handoff(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CurtainError>;

// ---------------------------------------------------------------------------
// WaitError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum WaitError {
    #[error(
        "{kind} dependency '{dependency}' not ready after {waited:?} ({attempts} attempts); last error: {last_error}"
    )]
    DependencyTimeout {
        dependency: String,
        kind: DependencyKind,
        waited: Duration,
        attempts: u32,
        last_error: String,
    },
}

// ---------------------------------------------------------------------------
// MigrationError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("migration {version} failed: {reason}")]
    Apply { version: String, reason: String },

    #[error("schema drift detected ({changes} change(s)); rerun with --autogenerate to write a revision\n{report}")]
    DriftDetected { changes: usize, report: String },

    #[error("schema still differs from the model after applying generated revision {version}\n{report}")]
    DriftPersists { version: String, report: String },

    #[error("migration lock on {store} not acquired within {waited:?}: {holder}")]
    LockTimeout {
        store: String,
        waited: Duration,
        holder: String,
    },

    #[error("migration chain in {dir} is broken: {reason}")]
    ChainBroken { dir: PathBuf, reason: String },

    #[error("history records revision {0} which is not in the scripts directory")]
    UnknownAppliedRevision(String),

    #[error("invalid revision script {path}: {reason}")]
    InvalidScript { path: PathBuf, reason: String },

    #[error("revision file already exists: {0}")]
    RevisionExists(PathBuf),

    #[error("migration store error: {0}")]
    Store(String),
}

// ---------------------------------------------------------------------------
// GraphError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("unknown profile: {0}")]
    UnknownProfile(String),

    #[error("cycle detected: {}", .0.join(" -> "))]
    CyclicProfile(Vec<String>),

    #[error("{from} references undeclared {missing}")]
    MissingDependency { from: String, missing: String },
}

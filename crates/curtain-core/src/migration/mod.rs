//! Schema migrations for schema-owning services.
//!
//! - [`script`]: revision files and the linear chain they form
//! - [`store`]: the history-store trait and its lock guard
//! - [`local`] / [`postgres`]: store implementations
//! - [`sequencer`]: lock, apply, drift check, optional autogenerate, re-apply

pub mod local;
pub mod postgres;
pub mod script;
pub mod sequencer;
pub mod store;

pub use script::{RevisionScript, ScriptDir};
pub use sequencer::{AutogeneratePolicy, MigrationPlan, MigrationSequencer, SequencerReport};
pub use store::{open_store, LockGuard, MigrationStore};

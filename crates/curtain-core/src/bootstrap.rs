//! Per-service bootstrap: waiter chain, then migrations for schema owners.
//!
//! The bootstrapper never retries on its own. A failed bootstrap is terminal and
//! surfaces as a [`BootstrapResult`] whose exit code tells a supervisor what
//! went wrong.

use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info};

use crate::chain::WaiterChain;
use crate::config::{Config, ServiceConfig};
use crate::error::{CurtainError, MigrationError, Result, WaitError};
use crate::migration::{
    open_store, AutogeneratePolicy, MigrationSequencer, MigrationStore, SequencerReport,
};
use crate::probe::ProbeFactory;
use crate::waiter::WaitReport;

pub const EXIT_READY: i32 = 0;
pub const EXIT_DEPENDENCY_TIMEOUT: i32 = 3;
pub const EXIT_MIGRATION_FAILED: i32 = 4;
pub const EXIT_DRIFT_DETECTED: i32 = 5;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum BootstrapResult {
    Ready {
        waits: Vec<WaitReport>,
        #[serde(skip_serializing_if = "Option::is_none")]
        migration: Option<SequencerReport>,
    },
    DependencyTimeout {
        dependency: String,
        reason: String,
    },
    MigrationFailed {
        reason: String,
    },
    MigrationDriftDetected {
        report: String,
    },
}

impl BootstrapResult {
    pub fn is_ready(&self) -> bool {
        matches!(self, BootstrapResult::Ready { .. })
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            BootstrapResult::Ready { .. } => EXIT_READY,
            BootstrapResult::DependencyTimeout { .. } => EXIT_DEPENDENCY_TIMEOUT,
            BootstrapResult::MigrationFailed { .. } => EXIT_MIGRATION_FAILED,
            BootstrapResult::MigrationDriftDetected { .. } => EXIT_DRIFT_DETECTED,
        }
    }

    pub fn from_wait_error(e: WaitError) -> Self {
        let WaitError::DependencyTimeout { ref dependency, .. } = e;
        BootstrapResult::DependencyTimeout {
            dependency: dependency.clone(),
            reason: e.to_string(),
        }
    }

    /// Drift keeps its own outcome; every other sequencer error is a failed migration.
    pub fn from_migration_error(e: CurtainError) -> Self {
        match e {
            CurtainError::Migration(MigrationError::DriftDetected { report, .. }) => {
                BootstrapResult::MigrationDriftDetected { report }
            }
            other => BootstrapResult::MigrationFailed {
                reason: other.to_string(),
            },
        }
    }
}

pub struct Bootstrapper {
    service: String,
    chain: WaiterChain,
    sequencer: Option<MigrationSequencer>,
    policy: AutogeneratePolicy,
}

impl Bootstrapper {
    /// `store` is only used when the service owns a schema.
    pub fn new(
        service_name: &str,
        service: &ServiceConfig,
        chain: WaiterChain,
        store: Option<Arc<dyn MigrationStore>>,
        cli_autogenerate: bool,
    ) -> Self {
        let (sequencer, policy) = match (&service.schema, store) {
            (Some(schema), Some(store)) => (
                Some(MigrationSequencer::new(service_name, schema, store)),
                AutogeneratePolicy::resolve(schema, cli_autogenerate),
            ),
            _ => (None, AutogeneratePolicy::Deny),
        };
        Self {
            service: service_name.to_string(),
            chain,
            sequencer,
            policy,
        }
    }

    /// Wire a bootstrapper from config with network probes and the configured store.
    pub fn from_config(
        config: &Config,
        service_name: &str,
        probes: &dyn ProbeFactory,
        cli_autogenerate: bool,
    ) -> Result<Self> {
        let service = config.service(service_name)?;
        let chain = WaiterChain::from_config(config, service_name, probes)?;
        let store = match &service.schema {
            Some(schema) => Some(open_store(&schema.history)?),
            None => None,
        };
        Ok(Self::new(
            service_name,
            service,
            chain,
            store,
            cli_autogenerate,
        ))
    }

    pub fn is_schema_owner(&self) -> bool {
        self.sequencer.is_some()
    }

    pub async fn run(&self) -> BootstrapResult {
        info!(
            service = %self.service,
            dependencies = self.chain.len(),
            schema_owner = self.is_schema_owner(),
            "bootstrapping service"
        );

        let waits = match self.chain.run().await {
            Ok(waits) => waits,
            Err(e) => return BootstrapResult::from_wait_error(e),
        };

        let migration = match &self.sequencer {
            Some(sequencer) => match sequencer.run(self.policy).await {
                Ok(report) => Some(report),
                Err(e) => {
                    error!(service = %self.service, error = %e, "migration failed");
                    return BootstrapResult::from_migration_error(e);
                }
            },
            None => None,
        };

        info!(service = %self.service, "service ready");
        BootstrapResult::Ready { waits, migration }
    }
}

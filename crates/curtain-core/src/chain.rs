//! Waiter chain: a service's dependency waiters, run in declared order.
//!
//! The chain stops at the first dependency that times out. The total budget
//! comes from the service's wait tuning and is split evenly across the
//! dependencies, each share capped by the dependency's own `max_wait_seconds`.

use std::time::Duration;

use tracing::{error, info};

use crate::config::{Config, WaitTuning};
use crate::error::{CurtainError, Result, WaitError};
use crate::probe::ProbeFactory;
use crate::waiter::{DependencyWaiter, WaitPolicy, WaitReport};

#[derive(Debug, Clone)]
pub struct WaiterChain {
    pub service: String,
    waiters: Vec<DependencyWaiter>,
    tuning: WaitTuning,
}

impl WaiterChain {
    pub fn new(service: impl Into<String>, waiters: Vec<DependencyWaiter>, tuning: WaitTuning) -> Self {
        Self {
            service: service.into(),
            waiters,
            tuning,
        }
    }

    /// Build the chain for `service_name` from its `wait_for` list.
    pub fn from_config(
        config: &Config,
        service_name: &str,
        probes: &dyn ProbeFactory,
    ) -> Result<Self> {
        let service = config.service(service_name)?;
        let mut waiters = Vec::with_capacity(service.wait_for.len());
        for dep_name in &service.wait_for {
            let dependency = config.dependencies.get(dep_name).ok_or_else(|| {
                CurtainError::InvalidConfig(format!(
                    "service '{service_name}' waits for unknown dependency '{dep_name}'"
                ))
            })?;
            let probe = probes.probe_for(dep_name, dependency)?;
            waiters.push(
                DependencyWaiter::new(dep_name.clone(), dependency.kind, probe)
                    .with_max_wait(dependency.max_wait_seconds.map(Duration::from_secs)),
            );
        }
        Ok(Self::new(service_name, waiters, config.wait_tuning(service)))
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }

    pub fn dependencies(&self) -> impl Iterator<Item = &str> {
        self.waiters.iter().map(|w| w.name.as_str())
    }

    /// Deadline given to `waiter`: an even share of `total`, capped by its max wait.
    pub fn budget_for(&self, waiter: &DependencyWaiter, total: Duration) -> Duration {
        let n = self.waiters.len().max(1) as u32;
        let share = total / n;
        match waiter.max_wait {
            Some(cap) => share.min(cap),
            None => share,
        }
    }

    /// Run the chain within the service's configured total budget.
    pub async fn run(&self) -> std::result::Result<Vec<WaitReport>, WaitError> {
        self.run_within(self.tuning.total_budget()).await
    }

    /// Wait for every dependency in order; fail fast on the first timeout.
    pub async fn run_within(
        &self,
        total: Duration,
    ) -> std::result::Result<Vec<WaitReport>, WaitError> {
        let mut reports = Vec::with_capacity(self.waiters.len());
        for waiter in &self.waiters {
            let policy = WaitPolicy::from_tuning(&self.tuning, self.budget_for(waiter, total));
            match waiter.wait(&policy).await {
                Ok(report) => reports.push(report),
                Err(e) => {
                    error!(service = %self.service, error = %e, "dependency wait failed");
                    return Err(e);
                }
            }
        }
        info!(
            service = %self.service,
            dependencies = reports.len(),
            "all dependencies ready"
        );
        Ok(reports)
    }
}

//! Dependency waiter: probe one dependency until it is ready or a deadline passes.
//!
//! A failed probe is never fatal on its own. It is logged and retried after a
//! bounded backoff; only exhausting the deadline fails the wait. Sleeps are
//! clipped to the deadline and no probe starts once the deadline is reached, so
//! a wait never overruns its budget by more than one probe timeout.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::{DependencyKind, WaitTuning};
use crate::error::WaitError;
use crate::probe::Probe;

// ---------------------------------------------------------------------------
// WaitPolicy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct WaitPolicy {
    pub deadline: Duration,
    pub backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: u32,
    pub probe_timeout: Duration,
}

impl WaitPolicy {
    pub fn from_tuning(tuning: &WaitTuning, deadline: Duration) -> Self {
        Self {
            deadline,
            backoff: Duration::from_millis(tuning.backoff_ms),
            max_backoff: Duration::from_millis(tuning.max_backoff_ms),
            multiplier: tuning.multiplier.max(1),
            probe_timeout: Duration::from_millis(tuning.probe_timeout_ms),
        }
    }

    fn first_backoff(&self) -> Duration {
        self.backoff.min(self.max_backoff)
    }

    fn next_backoff(&self, current: Duration) -> Duration {
        current
            .checked_mul(self.multiplier)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

// ---------------------------------------------------------------------------
// WaitReport
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WaitReport {
    pub dependency: String,
    pub attempts: u32,
    #[serde(rename = "waited_ms", serialize_with = "serialize_millis")]
    pub waited: Duration,
}

fn serialize_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

// ---------------------------------------------------------------------------
// DependencyWaiter
// ---------------------------------------------------------------------------

/// One declared dependency plus the probe strategy that checks it.
#[derive(Clone)]
pub struct DependencyWaiter {
    pub name: String,
    pub kind: DependencyKind,
    /// Upper bound on this dependency's share of a chain budget.
    pub max_wait: Option<Duration>,
    probe: Arc<dyn Probe>,
}

impl DependencyWaiter {
    pub fn new(name: impl Into<String>, kind: DependencyKind, probe: Arc<dyn Probe>) -> Self {
        Self {
            name: name.into(),
            kind,
            max_wait: None,
            probe,
        }
    }

    pub fn with_max_wait(mut self, max_wait: Option<Duration>) -> Self {
        self.max_wait = max_wait;
        self
    }

    /// Probe until ready or until `policy.deadline` has elapsed.
    pub async fn wait(&self, policy: &WaitPolicy) -> Result<WaitReport, WaitError> {
        let start = Instant::now();
        let mut backoff = policy.first_backoff();
        let mut attempts = 0u32;
        let mut last_error = String::from("no probe attempted");

        info!(
            dependency = %self.name,
            kind = %self.kind,
            probe = %self.probe.describe(),
            deadline = ?policy.deadline,
            "waiting for dependency"
        );

        loop {
            let elapsed = start.elapsed();
            if elapsed >= policy.deadline {
                break;
            }
            let budget = policy.probe_timeout.min(policy.deadline - elapsed);
            attempts += 1;

            match tokio::time::timeout(budget, self.probe.check()).await {
                Ok(Ok(())) => {
                    let waited = start.elapsed();
                    info!(dependency = %self.name, attempts, waited = ?waited, "dependency ready");
                    return Ok(WaitReport {
                        dependency: self.name.clone(),
                        attempts,
                        waited,
                    });
                }
                Ok(Err(reason)) => last_error = reason,
                Err(_) => last_error = format!("probe timed out after {budget:?}"),
            }

            warn!(
                dependency = %self.name,
                attempt = attempts,
                error = %last_error,
                "connection to {} failed, retrying",
                self.name
            );

            let remaining = policy.deadline.saturating_sub(start.elapsed());
            if remaining.is_zero() {
                break;
            }
            tokio::time::sleep(backoff.min(remaining)).await;
            backoff = policy.next_backoff(backoff);
        }

        Err(WaitError::DependencyTimeout {
            dependency: self.name.clone(),
            kind: self.kind,
            waited: start.elapsed(),
            attempts,
            last_error,
        })
    }
}

impl std::fmt::Debug for DependencyWaiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyWaiter")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("max_wait", &self.max_wait)
            .field("probe", &self.probe.describe())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::probe::ProbeResult;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails until `ready_on` attempts have been made; `0` never succeeds.
    pub(crate) struct ScriptedProbe {
        pub calls: Arc<AtomicU32>,
        pub ready_on: u32,
    }

    impl ScriptedProbe {
        pub(crate) fn new(ready_on: u32) -> (Arc<Self>, Arc<AtomicU32>) {
            let calls = Arc::new(AtomicU32::new(0));
            let probe = Arc::new(Self {
                calls: Arc::clone(&calls),
                ready_on,
            });
            (probe, calls)
        }
    }

    #[async_trait]
    impl Probe for ScriptedProbe {
        async fn check(&self) -> ProbeResult {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.ready_on != 0 && n >= self.ready_on {
                Ok(())
            } else {
                Err("connection refused".into())
            }
        }

        fn describe(&self) -> String {
            "scripted".into()
        }
    }

    struct HangingProbe;

    #[async_trait]
    impl Probe for HangingProbe {
        async fn check(&self) -> ProbeResult {
            std::future::pending::<()>().await;
            Ok(())
        }

        fn describe(&self) -> String {
            "hanging".into()
        }
    }

    fn policy(deadline_s: u64, backoff_ms: u64) -> WaitPolicy {
        WaitPolicy {
            deadline: Duration::from_secs(deadline_s),
            backoff: Duration::from_millis(backoff_ms),
            max_backoff: Duration::from_secs(30),
            multiplier: 1,
            probe_timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn always_failing_probe_times_out_after_three_attempts() {
        let (probe, calls) = ScriptedProbe::new(0);
        let waiter = DependencyWaiter::new("postgres", DependencyKind::Datastore, probe);

        let err = waiter.wait(&policy(3, 1000)).await.unwrap_err();
        let WaitError::DependencyTimeout {
            dependency,
            kind,
            waited,
            attempts,
            last_error,
        } = err;
        assert_eq!(dependency, "postgres");
        assert_eq!(kind, DependencyKind::Datastore);
        assert_eq!(attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(waited >= Duration::from_secs(3));
        assert!(waited < Duration::from_secs(4));
        assert_eq!(last_error, "connection refused");
    }

    #[tokio::test(start_paused = true)]
    async fn ready_on_third_attempt() {
        let (probe, calls) = ScriptedProbe::new(3);
        let waiter = DependencyWaiter::new("redis", DependencyKind::Cache, probe);

        let report = waiter.wait(&policy(10, 500)).await.unwrap();
        assert_eq!(report.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(report.waited, Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_probe_is_bounded_by_probe_timeout() {
        let waiter = DependencyWaiter::new("auth_api", DependencyKind::HttpApi, Arc::new(HangingProbe));
        let mut p = policy(5, 1000);
        p.probe_timeout = Duration::from_secs(2);

        let err = waiter.wait(&p).await.unwrap_err();
        let WaitError::DependencyTimeout {
            attempts,
            waited,
            last_error,
            ..
        } = err;
        // t=0 probe (2s), sleep 1s, t=3 probe clipped to remaining 2s, t=5 deadline
        assert_eq!(attempts, 2);
        assert_eq!(waited, Duration::from_secs(5));
        assert!(last_error.contains("timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_grows_and_is_capped() {
        let (probe, calls) = ScriptedProbe::new(0);
        let waiter = DependencyWaiter::new("kafka", DependencyKind::Datastore, probe);
        let p = WaitPolicy {
            deadline: Duration::from_secs(10),
            backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(4),
            multiplier: 2,
            probe_timeout: Duration::from_secs(1),
        };
        // attempts at t = 0, 1, 3, 7; the next sleep (4s) is clipped to the deadline
        let err = waiter.wait(&p).await.unwrap_err();
        let WaitError::DependencyTimeout { attempts, waited, .. } = err;
        assert_eq!(attempts, 4);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(waited, Duration::from_secs(10));
    }

    #[test]
    fn policy_from_tuning() {
        let p = WaitPolicy::from_tuning(&WaitTuning::default(), Duration::from_secs(20));
        assert_eq!(p.deadline, Duration::from_secs(20));
        assert_eq!(p.backoff, Duration::from_secs(1));
        assert_eq!(p.multiplier, 1);
        assert_eq!(p.next_backoff(p.backoff), Duration::from_secs(1));
    }
}

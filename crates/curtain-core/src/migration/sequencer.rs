use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::MigrationConfig;
use crate::error::{MigrationError, Result};
use crate::schema::{SchemaDiff, SchemaModel};

use super::script::ScriptDir;
use super::store::{LockGuard, MigrationStore};

const DEFAULT_LOCK_POLL: Duration = Duration::from_millis(500);

/// What to do when the live schema has drifted from the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AutogeneratePolicy {
    /// Fail with a diff report and write nothing.
    #[default]
    Deny,
    /// Write a revision capturing the diff, then apply it.
    Generate,
}

impl AutogeneratePolicy {
    /// `Generate` when either the config or the operator opted in.
    pub fn resolve(config: &MigrationConfig, cli_opt_in: bool) -> Self {
        if config.autogenerate || cli_opt_in {
            AutogeneratePolicy::Generate
        } else {
            AutogeneratePolicy::Deny
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SequencerReport {
    /// Versions applied by this run, in order.
    pub applied: Vec<String>,
    /// Version of the revision written for drift, if any.
    pub generated: Option<String>,
    pub head: Option<String>,
}

/// Read-only view of what a run would do.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MigrationPlan {
    pub applied: Vec<String>,
    pub pending: Vec<String>,
    pub head: Option<String>,
    /// Drift left after the pending revisions; `None` without a model file.
    pub drift: Option<SchemaDiff>,
}

pub struct MigrationSequencer {
    service: String,
    store: Arc<dyn MigrationStore>,
    scripts_dir: PathBuf,
    models: Option<PathBuf>,
    lock_timeout: Duration,
    lock_poll: Duration,
}

impl MigrationSequencer {
    pub fn new(service: impl Into<String>, config: &MigrationConfig, store: Arc<dyn MigrationStore>) -> Self {
        Self {
            service: service.into(),
            store,
            scripts_dir: config.scripts.clone(),
            models: config.models.clone(),
            lock_timeout: Duration::from_secs(config.lock_timeout_seconds),
            lock_poll: DEFAULT_LOCK_POLL,
        }
    }

    pub fn with_lock_poll(mut self, poll: Duration) -> Self {
        self.lock_poll = poll;
        self
    }

    /// Lock, apply pending revisions, check drift, then unlock.
    pub async fn run(&self, policy: AutogeneratePolicy) -> Result<SequencerReport> {
        let guard = self.acquire_lock().await?;
        let outcome = self.migrate(policy).await;
        let released = guard.release().await;
        let report = outcome?;
        released?;
        Ok(report)
    }

    /// Compute pending revisions and drift without locking or writing anything.
    pub async fn plan(&self) -> Result<MigrationPlan> {
        let scripts = ScriptDir::load(&self.scripts_dir)?;
        let applied = self.store.applied().await?;
        check_known(&scripts, &applied)?;
        let pending = scripts.pending(&applied);

        let drift = match self.load_model()? {
            Some(model) => {
                let mut projected = self.store.live_schema().await?;
                for script in &pending {
                    for change in &script.changes {
                        projected
                            .apply(change)
                            .map_err(|reason| MigrationError::Apply {
                                version: script.version.clone(),
                                reason,
                            })?;
                    }
                }
                Some(projected.diff(&model))
            }
            None => None,
        };

        Ok(MigrationPlan {
            pending: pending.iter().map(|s| s.version.clone()).collect(),
            applied,
            head: scripts.head().map(str::to_string),
            drift,
        })
    }

    async fn acquire_lock(&self) -> Result<Box<dyn LockGuard>> {
        let start = Instant::now();
        loop {
            if let Some(guard) = self.store.try_lock().await? {
                info!(service = %self.service, holder = %guard.holder(), "migration lock acquired");
                return Ok(guard);
            }
            let waited = start.elapsed();
            let holder = self
                .store
                .lock_holder()
                .await
                .unwrap_or_else(|| "holder unknown".to_string());
            if waited >= self.lock_timeout {
                return Err(MigrationError::LockTimeout {
                    store: self.store.describe(),
                    waited,
                    holder,
                }
                .into());
            }
            warn!(
                service = %self.service,
                store = %self.store.describe(),
                holder = %holder,
                "migration lock held elsewhere, waiting"
            );
            tokio::time::sleep(self.lock_poll.min(self.lock_timeout - waited)).await;
        }
    }

    async fn migrate(&self, policy: AutogeneratePolicy) -> Result<SequencerReport> {
        let mut scripts = ScriptDir::load(&self.scripts_dir)?;
        let mut applied = self.apply_pending(&scripts).await?;
        let mut generated = None;

        if let Some(model) = self.load_model()? {
            let live = self.store.live_schema().await?;
            let diff = live.diff(&model);
            if !diff.is_empty() {
                match policy {
                    AutogeneratePolicy::Deny => {
                        warn!(service = %self.service, changes = diff.len(), "schema drift detected");
                        return Err(MigrationError::DriftDetected {
                            changes: diff.len(),
                            report: diff.report(),
                        }
                        .into());
                    }
                    AutogeneratePolicy::Generate => {
                        let message = format!("{} schema drift", self.service);
                        let script = scripts.write_revision(&message, diff.changes)?;
                        info!(
                            service = %self.service,
                            version = %script.version,
                            path = %script.path.display(),
                            "generated revision for schema drift"
                        );
                        applied.extend(self.apply_pending(&scripts).await?);

                        // a revision that does not close the gap would be regenerated every boot
                        let remaining = self.store.live_schema().await?.diff(&model);
                        if !remaining.is_empty() {
                            return Err(MigrationError::DriftPersists {
                                version: script.version,
                                report: remaining.report(),
                            }
                            .into());
                        }
                        generated = Some(script.version);
                    }
                }
            }
        }

        let head = scripts.head().map(str::to_string);
        info!(
            service = %self.service,
            applied = applied.len(),
            head = head.as_deref().unwrap_or("none"),
            "schema at head"
        );
        Ok(SequencerReport {
            applied,
            generated,
            head,
        })
    }

    async fn apply_pending(&self, scripts: &ScriptDir) -> Result<Vec<String>> {
        let recorded = self.store.applied().await?;
        check_known(scripts, &recorded)?;
        let mut applied = Vec::new();
        for script in scripts.pending(&recorded) {
            info!(
                service = %self.service,
                version = %script.version,
                name = %script.name,
                "applying revision"
            );
            self.store.apply(script).await?;
            applied.push(script.version.clone());
        }
        Ok(applied)
    }

    fn load_model(&self) -> Result<Option<SchemaModel>> {
        self.models
            .as_deref()
            .map(SchemaModel::load)
            .transpose()
    }
}

fn check_known(scripts: &ScriptDir, applied: &[String]) -> Result<()> {
    match applied.iter().find(|v| !scripts.contains(v)) {
        Some(unknown) => Err(MigrationError::UnknownAppliedRevision(unknown.clone()).into()),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HistoryStore;
    use crate::error::CurtainError;
    use crate::migration::local::LocalMigrationStore;
    use crate::migration::script::RevisionScript;
    use async_trait::async_trait;
    use std::path::Path;
    use tempfile::TempDir;

    const BASE: &str = r#"
version: "20261001090000"
parent: null
name: init
changes:
  - op: create_table
    table: users
    columns:
      id: { type: uuid, nullable: false }
"#;

    const SECOND: &str = r#"
version: "20261002090000"
parent: "20261001090000"
name: add name
changes:
  - op: add_column
    table: users
    column: name
    definition: { type: text }
"#;

    const MODEL_WITH_EMAIL: &str = r#"
tables:
  users:
    columns:
      id: { type: uuid, nullable: false }
      name: { type: text }
      email: { type: varchar(255), nullable: false }
"#;

    const MODEL_AT_HEAD: &str = r#"
tables:
  users:
    columns:
      id: { type: uuid, nullable: false }
      name: { type: text }
"#;

    struct Fixture {
        dir: TempDir,
    }

    impl Fixture {
        fn new(model: Option<&str>) -> Self {
            let dir = TempDir::new().unwrap();
            let scripts = dir.path().join("migrations");
            std::fs::create_dir_all(&scripts).unwrap();
            std::fs::write(scripts.join("20261001090000_init.yaml"), BASE).unwrap();
            std::fs::write(scripts.join("20261002090000_add_name.yaml"), SECOND).unwrap();
            if let Some(model) = model {
                std::fs::write(dir.path().join("models.yaml"), model).unwrap();
            }
            Self { dir }
        }

        fn root(&self) -> &Path {
            self.dir.path()
        }

        fn config(&self) -> MigrationConfig {
            let models = self.root().join("models.yaml");
            MigrationConfig {
                history: HistoryStore::Local {
                    path: self.root().join("state"),
                },
                scripts: self.root().join("migrations"),
                models: models.exists().then_some(models),
                autogenerate: false,
                lock_timeout_seconds: 2,
            }
        }

        fn store(&self) -> Arc<LocalMigrationStore> {
            Arc::new(LocalMigrationStore::new(&self.root().join("state")))
        }

        fn sequencer(&self) -> MigrationSequencer {
            MigrationSequencer::new("auth", &self.config(), self.store())
        }

        fn script_count(&self) -> usize {
            std::fs::read_dir(self.root().join("migrations")).unwrap().count()
        }
    }

    #[tokio::test]
    async fn applies_pending_and_converges() {
        let fx = Fixture::new(Some(MODEL_AT_HEAD));
        let report = fx.sequencer().run(AutogeneratePolicy::Deny).await.unwrap();
        assert_eq!(report.applied, ["20261001090000", "20261002090000"]);
        assert_eq!(report.generated, None);
        assert_eq!(report.head.as_deref(), Some("20261002090000"));

        let recorded = fx.store().applied().await.unwrap();
        assert_eq!(recorded.last().map(String::as_str), report.head.as_deref());
    }

    #[tokio::test]
    async fn second_run_is_a_no_op() {
        let fx = Fixture::new(Some(MODEL_WITH_EMAIL));
        let first = fx.sequencer().run(AutogeneratePolicy::Generate).await.unwrap();
        assert!(first.generated.is_some());

        let second = fx.sequencer().run(AutogeneratePolicy::Generate).await.unwrap();
        assert!(second.applied.is_empty());
        assert_eq!(second.generated, None);
        assert_eq!(second.head, first.head);
        assert_eq!(fx.script_count(), 3);
    }

    #[tokio::test]
    async fn drift_is_denied_by_default() {
        let fx = Fixture::new(Some(MODEL_WITH_EMAIL));
        let err = fx.sequencer().run(AutogeneratePolicy::Deny).await.unwrap_err();
        match err {
            CurtainError::Migration(MigrationError::DriftDetected { changes, report }) => {
                assert_eq!(changes, 1);
                assert!(report.contains("+ column users.email"), "{report}");
            }
            other => panic!("expected drift, got {other:?}"),
        }
        assert_eq!(fx.script_count(), 2);
        // the lock was released despite the failure
        assert!(!crate::paths::local_lock_path(&fx.root().join("state")).exists());
    }

    #[tokio::test]
    async fn generate_writes_revision_and_reapplies() {
        let fx = Fixture::new(Some(MODEL_WITH_EMAIL));
        let report = fx.sequencer().run(AutogeneratePolicy::Generate).await.unwrap();
        let generated = report.generated.clone().unwrap();
        assert_eq!(report.applied.len(), 3);
        assert_eq!(report.applied.last(), Some(&generated));
        assert_eq!(report.head.as_deref(), Some(generated.as_str()));

        let scripts = ScriptDir::load(&fx.root().join("migrations")).unwrap();
        let written: &RevisionScript = scripts.scripts().last().unwrap();
        assert_eq!(written.parent.as_deref(), Some("20261002090000"));
        assert!(written.path.ends_with(format!("{generated}_auth_schema_drift.yaml")));

        let live = fx.store().live_schema().await.unwrap();
        let model = SchemaModel::load(&fx.root().join("models.yaml")).unwrap();
        assert!(live.matches(&model));
    }

    #[tokio::test]
    async fn without_model_there_is_no_drift_check() {
        let fx = Fixture::new(None);
        let report = fx.sequencer().run(AutogeneratePolicy::Deny).await.unwrap();
        assert_eq!(report.applied.len(), 2);
        assert!(fx.sequencer().plan().await.unwrap().drift.is_none());
    }

    #[tokio::test]
    async fn unknown_applied_revision_is_fatal() {
        let fx = Fixture::new(None);
        fx.sequencer().run(AutogeneratePolicy::Deny).await.unwrap();
        std::fs::remove_file(fx.root().join("migrations/20261002090000_add_name.yaml")).unwrap();

        let err = fx.sequencer().run(AutogeneratePolicy::Deny).await.unwrap_err();
        assert!(matches!(
            err,
            CurtainError::Migration(MigrationError::UnknownAppliedRevision(ref v)) if v == "20261002090000"
        ));
    }

    #[tokio::test]
    async fn plan_reports_without_writing() {
        let fx = Fixture::new(Some(MODEL_WITH_EMAIL));
        let plan = fx.sequencer().plan().await.unwrap();
        assert!(plan.applied.is_empty());
        assert_eq!(plan.pending, ["20261001090000", "20261002090000"]);
        assert_eq!(plan.head.as_deref(), Some("20261002090000"));
        // drift is measured after the pending revisions
        assert_eq!(plan.drift.unwrap().len(), 1);
        assert!(fx.store().applied().await.unwrap().is_empty());
        assert_eq!(fx.script_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn lock_timeout_when_held_elsewhere() {
        let fx = Fixture::new(None);
        let _held = fx.store().try_lock().await.unwrap().expect("lock");

        let sequencer = fx.sequencer().with_lock_poll(Duration::from_millis(500));
        let err = sequencer.run(AutogeneratePolicy::Deny).await.unwrap_err();
        match err {
            CurtainError::Migration(MigrationError::LockTimeout { waited, holder, .. }) => {
                assert_eq!(waited, Duration::from_secs(2));
                assert!(holder.starts_with("pid "), "{holder}");
            }
            other => panic!("expected lock timeout, got {other:?}"),
        }
        assert!(fx.store().applied().await.unwrap().is_empty());
    }

    /// Local store whose applies take time, so a second sequencer contends for the lock.
    struct SlowStore(LocalMigrationStore);

    #[async_trait]
    impl MigrationStore for SlowStore {
        async fn try_lock(&self) -> Result<Option<Box<dyn LockGuard>>> {
            self.0.try_lock().await
        }

        async fn applied(&self) -> Result<Vec<String>> {
            self.0.applied().await
        }

        async fn apply(&self, script: &RevisionScript) -> Result<()> {
            tokio::time::sleep(Duration::from_millis(300)).await;
            self.0.apply(script).await
        }

        async fn live_schema(&self) -> Result<SchemaModel> {
            self.0.live_schema().await
        }

        async fn lock_holder(&self) -> Option<String> {
            self.0.lock_holder().await
        }

        fn describe(&self) -> String {
            self.0.describe()
        }
    }

    /// Local store that reports column types without their modifiers.
    struct LossyStore(LocalMigrationStore);

    #[async_trait]
    impl MigrationStore for LossyStore {
        async fn try_lock(&self) -> Result<Option<Box<dyn LockGuard>>> {
            self.0.try_lock().await
        }

        async fn applied(&self) -> Result<Vec<String>> {
            self.0.applied().await
        }

        async fn apply(&self, script: &RevisionScript) -> Result<()> {
            self.0.apply(script).await
        }

        async fn live_schema(&self) -> Result<SchemaModel> {
            let mut schema = self.0.live_schema().await?;
            for table in schema.tables.values_mut() {
                for column in table.columns.values_mut() {
                    if let Some(open) = column.sql_type.find('(') {
                        column.sql_type.truncate(open);
                    }
                }
            }
            Ok(schema)
        }

        fn describe(&self) -> String {
            self.0.describe()
        }
    }

    #[tokio::test]
    async fn generated_revision_that_leaves_drift_fails() {
        let fx = Fixture::new(Some(MODEL_WITH_EMAIL));
        let sequencer = MigrationSequencer::new(
            "auth",
            &fx.config(),
            Arc::new(LossyStore(LocalMigrationStore::new(&fx.root().join("state")))),
        );
        let err = sequencer.run(AutogeneratePolicy::Generate).await.unwrap_err();
        match err {
            CurtainError::Migration(MigrationError::DriftPersists { version, report }) => {
                assert!(fx.store().applied().await.unwrap().contains(&version));
                assert!(report.contains("~ column users.email"), "{report}");
            }
            other => panic!("expected persisting drift, got {other:?}"),
        }
        assert!(!crate::paths::local_lock_path(&fx.root().join("state")).exists());
    }

    #[tokio::test(start_paused = true)]
    async fn racing_sequencers_apply_each_revision_once() {
        let fx = Fixture::new(Some(MODEL_AT_HEAD));
        let state = fx.root().join("state");
        let a = MigrationSequencer::new(
            "auth",
            &fx.config(),
            Arc::new(SlowStore(LocalMigrationStore::new(&state))),
        )
        .with_lock_poll(Duration::from_millis(100));
        let b = MigrationSequencer::new(
            "auth",
            &fx.config(),
            Arc::new(SlowStore(LocalMigrationStore::new(&state))),
        )
        .with_lock_poll(Duration::from_millis(100));

        let (ra, rb) = tokio::join!(
            a.run(AutogeneratePolicy::Deny),
            b.run(AutogeneratePolicy::Deny)
        );
        let (ra, rb) = (ra.unwrap(), rb.unwrap());

        let mut all: Vec<_> = ra.applied.iter().chain(&rb.applied).cloned().collect();
        all.sort();
        assert_eq!(all, ["20261001090000", "20261002090000"]);
        assert!(ra.applied.is_empty() || rb.applied.is_empty());
        assert_eq!(ra.head, rb.head);
        assert_eq!(
            fx.store().applied().await.unwrap(),
            ["20261001090000", "20261002090000"]
        );
    }

    #[test]
    fn policy_is_opt_in() {
        let fx = Fixture::new(None);
        let mut cfg = fx.config();
        assert_eq!(AutogeneratePolicy::resolve(&cfg, false), AutogeneratePolicy::Deny);
        assert_eq!(AutogeneratePolicy::resolve(&cfg, true), AutogeneratePolicy::Generate);
        cfg.autogenerate = true;
        assert_eq!(AutogeneratePolicy::resolve(&cfg, false), AutogeneratePolicy::Generate);
    }
}

pub mod config;
pub mod migrate;
pub mod plan;
pub mod status;
pub mod up;
pub mod wait;

use curtain_core::bootstrap::BootstrapResult;

/// Log a terminal bootstrap outcome; the log goes to stderr.
pub fn log_failure(service: &str, result: &BootstrapResult) {
    match result {
        BootstrapResult::Ready { .. } => {}
        BootstrapResult::DependencyTimeout { reason, .. } => {
            tracing::error!(service, "bootstrap aborted: {reason}");
        }
        BootstrapResult::MigrationFailed { reason } => {
            tracing::error!(service, "bootstrap aborted: {reason}");
        }
        BootstrapResult::MigrationDriftDetected { report } => {
            tracing::error!(
                service,
                "schema drift detected; rerun with --autogenerate to write a revision\n{report}"
            );
        }
    }
}

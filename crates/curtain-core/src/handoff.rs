//! Hand control to the service's own listener once bootstrap is ready.

use tokio::process::Command;
use tracing::info;

use crate::config::ServiceConfig;
use crate::error::{CurtainError, Result};

pub const PORT_ENV: &str = "PORT";
pub const SERVICE_ENV: &str = "CURTAIN_SERVICE";

/// Run the listener command to completion and return its exit code.
///
/// With no command configured this is a no-op returning 0, so `curtain up` can
/// act as an init step in front of a separately started listener.
pub async fn run_listener(service_name: &str, service: &ServiceConfig) -> Result<i32> {
    let Some((program, args)) = service.command.split_first() else {
        info!(service = %service_name, "no listener command configured; bootstrap complete");
        return Ok(0);
    };

    let mut cmd = Command::new(program);
    cmd.args(args).env(SERVICE_ENV, service_name);
    if let Some(port) = service.port {
        cmd.env(PORT_ENV, port.to_string());
    }

    info!(service = %service_name, command = %service.command.join(" "), port = ?service.port, "starting listener");
    let mut child = cmd
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| CurtainError::Handoff(format!("{program}: {e}")))?;
    let status = child.wait().await?;
    info!(service = %service_name, status = %status, "listener exited");
    Ok(status.code().unwrap_or(1))
}

use crate::cmd::log_failure;
use crate::output::print_json;
use crate::root::load_valid_config;
use anyhow::Context;
use curtain_core::bootstrap::Bootstrapper;
use curtain_core::graph::DependencyGraph;
use curtain_core::handoff;
use curtain_core::probe::NetworkProbes;
use std::path::Path;

pub async fn run(
    config_path: Option<&Path>,
    service_name: &str,
    autogenerate: bool,
    json: bool,
) -> anyhow::Result<i32> {
    let config = load_valid_config(config_path)?;
    let service = config.service(service_name)?;
    DependencyGraph::new(&config)
        .service_plan(service_name)
        .with_context(|| format!("service '{service_name}' is not fully wired"))?;

    let boot = Bootstrapper::from_config(&config, service_name, &NetworkProbes, autogenerate)?;
    let result = boot.run().await;
    if json {
        print_json(&result)?;
    }
    if !result.is_ready() {
        log_failure(service_name, &result);
        return Ok(result.exit_code());
    }

    let code = handoff::run_listener(service_name, service).await?;
    Ok(code)
}

use crate::cmd::log_failure;
use crate::output::print_json;
use crate::root::load_valid_config;
use curtain_core::bootstrap::BootstrapResult;
use curtain_core::config::{Config, MigrationConfig};
use curtain_core::migration::{
    open_store, AutogeneratePolicy, MigrationPlan, MigrationSequencer, SequencerReport,
};
use std::path::Path;

pub async fn run(
    config_path: Option<&Path>,
    service_name: &str,
    autogenerate: bool,
    dry_run: bool,
    json: bool,
) -> anyhow::Result<i32> {
    let config = load_valid_config(config_path)?;
    let schema = owned_schema(&config, service_name)?;
    let store = open_store(&schema.history)?;
    let sequencer = MigrationSequencer::new(service_name, schema, store);

    if dry_run {
        let plan = sequencer.plan().await?;
        if json {
            print_json(&plan)?;
        } else {
            print_dry_run(service_name, &plan);
        }
        return Ok(0);
    }

    let policy = AutogeneratePolicy::resolve(schema, autogenerate);
    match sequencer.run(policy).await {
        Ok(report) => {
            if json {
                print_json(&report)?;
            } else {
                print_report(service_name, &report);
            }
            Ok(0)
        }
        Err(e) => {
            let result = BootstrapResult::from_migration_error(e);
            if json {
                print_json(&result)?;
            }
            log_failure(service_name, &result);
            Ok(result.exit_code())
        }
    }
}

/// The service's migration config, or an error naming a service that owns no schema.
pub fn owned_schema<'a>(config: &'a Config, service_name: &str) -> anyhow::Result<&'a MigrationConfig> {
    let service = config.service(service_name)?;
    service
        .schema
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("service '{service_name}' does not own a schema"))
}

fn print_report(service_name: &str, report: &SequencerReport) {
    let head = report.head.as_deref().unwrap_or("(empty)");
    if report.applied.is_empty() {
        println!("{service_name}: already at head {head}");
        return;
    }
    if let Some(generated) = &report.generated {
        println!("generated {generated} from schema drift");
    }
    for version in &report.applied {
        println!("applied {version}");
    }
    println!("{service_name}: at head {head}");
}

fn print_dry_run(service_name: &str, plan: &MigrationPlan) {
    let head = plan.head.as_deref().unwrap_or("(empty)");
    if plan.pending.is_empty() {
        println!("{service_name}: no pending revisions (head {head})");
    } else {
        println!("{service_name}: {} pending revision(s) up to {head}", plan.pending.len());
        for version in &plan.pending {
            println!("  would apply {version}");
        }
    }
    match &plan.drift {
        None => println!("drift: not checked (no model file)"),
        Some(diff) if diff.is_empty() => println!("drift: none"),
        Some(diff) => {
            println!("drift: {} change(s) would need a new revision", diff.len());
            print!("{}", diff.report());
        }
    }
}

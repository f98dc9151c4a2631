use crate::cmd::migrate::owned_schema;
use crate::output::{print_json, print_table};
use crate::root::load_valid_config;
use curtain_core::migration::{open_store, MigrationSequencer, ScriptDir};
use std::path::Path;

pub async fn run(config_path: Option<&Path>, service_name: &str, json: bool) -> anyhow::Result<i32> {
    let config = load_valid_config(config_path)?;
    let schema = owned_schema(&config, service_name)?;
    let store = open_store(&schema.history)?;
    let plan = MigrationSequencer::new(service_name, schema, store).plan().await?;

    if json {
        let value = serde_json::json!({
            "service": service_name,
            "store": schema.history.describe(),
            "status": plan,
        });
        print_json(&value)?;
        return Ok(0);
    }

    let scripts = ScriptDir::load(&schema.scripts)?;
    let rows = scripts
        .scripts()
        .iter()
        .map(|s| {
            let state = if plan.applied.contains(&s.version) {
                "applied"
            } else {
                "pending"
            };
            vec![s.version.clone(), state.to_string(), s.name.clone()]
        })
        .collect();

    println!("Store: {}", schema.history.describe());
    println!("Head:  {}", plan.head.as_deref().unwrap_or("(empty)"));
    println!();
    print_table(&["VERSION", "STATE", "NAME"], rows);
    if let Some(diff) = &plan.drift {
        println!();
        if diff.is_empty() {
            println!("Drift: none");
        } else {
            println!("Drift: {} change(s)", diff.len());
            print!("{}", diff.report());
        }
    }
    Ok(0)
}

use crate::output::{print_json, print_table};
use crate::root::load_valid_config;
use curtain_core::config::Config;
use curtain_core::graph::{DependencyGraph, Node};
use std::path::Path;

pub fn run(config_path: Option<&Path>, profile: &str, teardown: bool, json: bool) -> anyhow::Result<()> {
    let config = load_valid_config(config_path)?;
    let plan = DependencyGraph::new(&config).resolve(profile)?;
    let steps: Vec<&Node> = if teardown {
        plan.teardown()
    } else {
        plan.order.iter().collect()
    };

    if json {
        let direction = if teardown { "teardown" } else { "up" };
        let value = serde_json::json!({
            "profile": profile,
            "direction": direction,
            "services": plan.services(),
            "dependencies": plan.dependencies(),
            "steps": steps,
        });
        print_json(&value)?;
        return Ok(());
    }

    if steps.is_empty() {
        println!("Profile '{profile}' is empty.");
        return Ok(());
    }

    let rows = steps
        .iter()
        .enumerate()
        .map(|(i, node)| {
            vec![
                (i + 1).to_string(),
                node.kind().to_string(),
                node.name().to_string(),
                detail(&config, node),
            ]
        })
        .collect();
    print_table(&["STEP", "KIND", "NAME", "DETAIL"], rows);
    Ok(())
}

fn detail(config: &Config, node: &Node) -> String {
    match node {
        Node::Service(name) => config
            .services
            .get(name)
            .map(|s| {
                let port = s.port.map(|p| format!("port {p}")).unwrap_or_default();
                if s.is_schema_owner() {
                    format!("{port} schema owner").trim().to_string()
                } else {
                    port
                }
            })
            .unwrap_or_default(),
        Node::Dependency(name) => config
            .dependencies
            .get(name)
            .map(|d| format!("{}: {}", d.kind, d.probe.describe()))
            .unwrap_or_default(),
        Node::Profile(_) => String::new(),
    }
}

use crate::cmd::log_failure;
use crate::output::{format_duration, print_json, print_table};
use crate::root::load_valid_config;
use curtain_core::bootstrap::BootstrapResult;
use curtain_core::chain::WaiterChain;
use curtain_core::probe::NetworkProbes;
use std::path::Path;

pub async fn run(config_path: Option<&Path>, service_name: &str, json: bool) -> anyhow::Result<i32> {
    let config = load_valid_config(config_path)?;
    let chain = WaiterChain::from_config(&config, service_name, &NetworkProbes)?;

    let result = match chain.run().await {
        Ok(waits) => BootstrapResult::Ready {
            waits,
            migration: None,
        },
        Err(e) => BootstrapResult::from_wait_error(e),
    };

    if json {
        print_json(&result)?;
    } else if let BootstrapResult::Ready { waits, .. } = &result {
        if waits.is_empty() {
            println!("{service_name} has no dependencies to wait for.");
        } else {
            let rows = waits
                .iter()
                .map(|w| {
                    vec![
                        w.dependency.clone(),
                        w.attempts.to_string(),
                        format_duration(w.waited),
                    ]
                })
                .collect();
            print_table(&["DEPENDENCY", "ATTEMPTS", "WAITED"], rows);
        }
    }

    log_failure(service_name, &result);
    Ok(result.exit_code())
}

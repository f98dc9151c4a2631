mod cmd;
mod output;
mod root;

use clap::{Parser, Subcommand};
use cmd::config::ConfigSubcommand;
use std::future::Future;
use std::path::PathBuf;

/// Exit status after Ctrl-C.
const EXIT_INTERRUPTED: i32 = 130;

#[derive(Parser)]
#[command(
    name = "curtain",
    about = "Dependency-gated service bootstrap: wait for infrastructure, migrate, then start",
    version,
    propagate_version = true
)]
struct Cli {
    /// Config file (default: nearest curtain.yaml walking up from the current directory)
    #[arg(long, global = true, env = "CURTAIN_CONFIG")]
    config: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Wait for dependencies, migrate if the service owns a schema, then start its listener
    Up {
        service: String,
        /// Write a revision when the live schema drifts from the model
        #[arg(long)]
        autogenerate: bool,
    },

    /// Wait for a service's dependencies only
    Wait { service: String },

    /// Run a service's schema migrations only
    Migrate {
        service: String,
        /// Write a revision when the live schema drifts from the model
        #[arg(long)]
        autogenerate: bool,
        /// Show pending revisions and drift without applying or writing anything
        #[arg(long, conflicts_with = "autogenerate")]
        dry_run: bool,
    },

    /// Show applied and pending revisions for a service
    Status { service: String },

    /// Show the bring-up order for a profile
    Plan {
        profile: String,
        /// Print the teardown order instead
        #[arg(long)]
        teardown: bool,
    },

    /// Inspect the configuration
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Up { .. } | Commands::Wait { .. } | Commands::Migrate { .. } => {
            tracing::Level::INFO
        }
        _ => tracing::Level::WARN,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config_path = cli.config.as_deref();

    let result = match cli.command {
        Commands::Up {
            service,
            autogenerate,
        } => block_on(cmd::up::run(config_path, &service, autogenerate, cli.json)),
        Commands::Wait { service } => block_on(cmd::wait::run(config_path, &service, cli.json)),
        Commands::Migrate {
            service,
            autogenerate,
            dry_run,
        } => block_on(cmd::migrate::run(
            config_path,
            &service,
            autogenerate,
            dry_run,
            cli.json,
        )),
        Commands::Status { service } => block_on(cmd::status::run(config_path, &service, cli.json)),
        Commands::Plan { profile, teardown } => {
            cmd::plan::run(config_path, &profile, teardown, cli.json).map(|()| 0)
        }
        Commands::Config { subcommand } => {
            cmd::config::run(config_path, subcommand, cli.json).map(|()| 0)
        }
    };

    match result {
        Ok(0) => {}
        Ok(code) => std::process::exit(code),
        Err(e) => {
            // Print the full error chain (anyhow's alternate Display)
            eprintln!("error: {e:#}");
            std::process::exit(1);
        }
    }
}

/// Drive `fut` to completion unless Ctrl-C arrives first.
///
/// On interrupt the future is dropped before returning, which closes probe
/// connections, releases any migration lock and kills a spawned listener.
fn block_on<F>(fut: F) -> anyhow::Result<i32>
where
    F: Future<Output = anyhow::Result<i32>>,
{
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        tokio::select! {
            res = fut => res,
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("interrupted");
                Ok(EXIT_INTERRUPTED)
            }
        }
    })
}

//! worldd: the worldgrid daemon.
//!
//! Single binary that assembles all worldgrid subsystems:
//! - State store (redb) holding world records and the task queue
//! - Compute provider (simulated or HTTP)
//! - Task dispatcher
//! - Sweep scheduler and render pipeline loops
//! - REST API
//!
//! # Usage
//!
//! ```text
//! worldd serve --config /etc/worldgrid.toml --data-dir /var/lib/worldgrid
//! worldd sweep --config /etc/worldgrid.toml
//! ```

mod daemon;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use worldgrid_core::GridConfig;

#[derive(Parser)]
#[command(name = "worldd", about = "worldgrid daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Args, Clone)]
struct Common {
    /// Path to worldgrid.toml. Defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Data directory for persistent state.
    #[arg(long, default_value = "/var/lib/worldgrid")]
    data_dir: PathBuf,
}

#[derive(Subcommand)]
enum Command {
    /// Run the API server with the dispatcher, sweep and render loops.
    Serve {
        #[command(flatten)]
        common: Common,

        /// Port to listen on. Overrides `api.port`.
        #[arg(long)]
        port: Option<u16>,
    },
    /// Run one sweep and exit; fails if any unit fails.
    Sweep {
        #[command(flatten)]
        common: Common,
    },
    /// Run the render pipeline once and exit.
    Render {
        #[command(flatten)]
        common: Common,
    },
    /// Deliver every task that is currently due, once.
    Drain {
        #[command(flatten)]
        common: Common,
    },
    /// Print world records as JSON.
    Worlds {
        #[arg(long, default_value = "/var/lib/worldgrid")]
        data_dir: PathBuf,
    },
    /// Print the effective configuration as TOML.
    Config {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

/// Used when `RUST_LOG` is unset. Targets are crate names with `_`.
const DEFAULT_FILTER: &str = "info,worldd=debug,worldgrid_core=debug,worldgrid_state=debug,\
worldgrid_provider=debug,worldgrid_tasks=debug,worldgrid_lifecycle=debug,worldgrid_api=debug";

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_FILTER));
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<GridConfig> {
    match path {
        Some(path) => GridConfig::from_file(path),
        None => {
            let config = GridConfig::default();
            config.validate()?;
            Ok(config)
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Serve { common, port } => {
            let mut config = load_config(common.config.as_ref())?;
            if let Some(port) = port {
                config.api.port = port;
            }
            daemon::serve(config, &common.data_dir).await
        }
        Command::Sweep { common } => {
            let config = load_config(common.config.as_ref())?;
            daemon::sweep_once(config, &common.data_dir).await
        }
        Command::Render { common } => {
            let config = load_config(common.config.as_ref())?;
            daemon::render_once(config, &common.data_dir).await
        }
        Command::Drain { common } => {
            let config = load_config(common.config.as_ref())?;
            daemon::drain_once(config, &common.data_dir).await
        }
        Command::Worlds { data_dir } => daemon::print_worlds(&data_dir),
        Command::Config { config } => {
            print!("{}", load_config(config.as_ref())?.to_toml_string()?);
            Ok(())
        }
    }
}

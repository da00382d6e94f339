mod config_commands;
mod db_commands;
mod runner_commands;
mod server;

use std::path::{Path, PathBuf};

use {
    clap::{Parser, Subcommand},
    corral_config::CorralConfig,
    corral_jobs::{ErrorPayload, OperationKind, classify, normalize},
    tracing::info,
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

#[derive(Parser)]
#[command(name = "corral", about = "Corral: sandbox control plane")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Config file (overrides discovery of corral.{toml,yaml,yml,json}).
    #[arg(long, global = true, env = "CORRAL_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run dispatcher workers, health polling, sweeps and warm pools until Ctrl-C.
    Serve,
    /// Database management.
    Db {
        #[command(subcommand)]
        action: db_commands::DbAction,
    },
    /// Show how a failure message would be handled.
    Classify {
        /// Operation the failure came from: start, stop or generic.
        #[arg(long, default_value = "generic")]
        op: OperationKind,
        message: String,
    },
    /// Region administration.
    Region {
        #[command(subcommand)]
        action: runner_commands::RegionAction,
    },
    /// Runner administration.
    Runner {
        #[command(subcommand)]
        action: runner_commands::RunnerAction,
    },
    /// Configuration management.
    Config {
        #[command(subcommand)]
        action: config_commands::ConfigAction,
    },
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    let registry = tracing_subscriber::registry().with(filter);

    if cli.json_logs {
        registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(false))
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true),
            )
            .init();
    }
}

/// The explicit file when given, otherwise the discovered one or defaults.
fn load_config(explicit: Option<&Path>) -> anyhow::Result<CorralConfig> {
    match explicit {
        Some(path) => corral_config::load_config(path),
        None => Ok(corral_config::discover_and_load()),
    }
}

fn classify_message(op: OperationKind, message: &str) {
    let payload = ErrorPayload::Text(message);
    let sanitized = normalize(&payload);
    println!("reason:         {}", sanitized.error_reason);
    println!("recoverable:    {}", sanitized.recoverable);
    println!("classification: {}", classify(op, &payload));
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli);

    let explicit = cli.config.as_deref();
    match cli.command {
        Commands::Serve => {
            let config = load_config(explicit)?;
            info!(version = env!("CARGO_PKG_VERSION"), database = %config.database.url, "corral starting");
            let plane = server::ControlPlane::open(config).await?;
            server::serve(plane).await
        },
        Commands::Db { action } => db_commands::handle_db(action, &load_config(explicit)?).await,
        Commands::Classify { op, message } => {
            classify_message(op, &message);
            Ok(())
        },
        Commands::Region { action } => {
            let plane = server::ControlPlane::open(load_config(explicit)?).await?;
            let result = runner_commands::handle_region(action, &plane).await;
            plane.close().await;
            result
        },
        Commands::Runner { action } => {
            let plane = server::ControlPlane::open(load_config(explicit)?).await?;
            let result = runner_commands::handle_runner(action, &plane).await;
            plane.close().await;
            result
        },
        Commands::Config { action } => config_commands::handle_config(action, explicit),
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, clap::CommandFactory};

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_classify_arguments() {
        let cli = Cli::try_parse_from(["corral", "classify", "--op", "start", "boom"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Classify {
                op: OperationKind::Start,
                ..
            }
        ));
    }
}

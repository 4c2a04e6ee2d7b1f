//! Presence - command-line front-end for the presence RPC broker.
//!
//! Runs a broker, runs the demonstration `Registry` worker, load-tests it and
//! prints broker statistics.

mod commands;
mod registry;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use presence_core::RpcConfig;
use std::path::PathBuf;
use tracing::debug;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "presence")]
#[command(about = "Broker-mediated RPC: broker, workers and admin tools")]
struct Args {
    /// JSON configuration file (missing keys keep their defaults)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,

    /// Broker host workers and clients dial
    #[arg(long)]
    broker: Option<String>,

    /// Broker port
    #[arg(short, long)]
    port: Option<u16>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a component
    #[command(subcommand)]
    Run(commands::RunCommand),
}

fn init_logging(debug: bool, json: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false);

    if json {
        builder.json().init();
    } else {
        builder.compact().init();
    }
}

/// Configuration file (or defaults) with command-line overrides applied.
fn load_config(args: &Args) -> Result<RpcConfig> {
    let mut config = match &args.config {
        Some(path) => RpcConfig::from_json_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => RpcConfig::default(),
    };

    if let Some(broker) = &args.broker {
        config.broker = broker.clone();
    }
    if let Some(port) = args.port {
        config.port = port;
    }

    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(args.debug, args.log_json);

    let config = load_config(&args)?;
    debug!(?config, "Configuration loaded");

    match args.command {
        Command::Run(command) => command.execute(config).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_flags_override_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"broker": "10.0.0.5", "port": 6000, "client_retries": 7}}"#).unwrap();
        let path = file.path().to_str().unwrap();

        let args =
            Args::try_parse_from(["presence", "--config", path, "--port", "6100", "run", "stats"])
                .unwrap();
        let config = load_config(&args).unwrap();

        assert_eq!(config.broker, "10.0.0.5");
        assert_eq!(config.port, 6100);
        assert_eq!(config.client_retries, 7);
    }

    #[test]
    fn test_defaults_without_config_file() {
        let args = Args::try_parse_from(["presence", "--broker", "relay", "run", "broker"]).unwrap();
        let config = load_config(&args).unwrap();

        assert_eq!(config.broker, "relay");
        assert_eq!(config.port, 5000);
        assert_eq!(config.control_service, "icc");
    }

    #[test]
    fn test_count_defaults_to_ten_thousand() {
        let args = Args::try_parse_from(["presence", "run", "test"]).unwrap();
        match args.command {
            Command::Run(commands::RunCommand::Test { count }) => assert_eq!(count, 10_000),
            other => panic!("Expected run test, got: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_subcommand_rejected() {
        assert!(Args::try_parse_from(["presence", "run", "dance"]).is_err());
    }
}

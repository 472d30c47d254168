//! Autodialer launcher
//!
//! Loads an engine configuration from TOML, sets up logging and runs the
//! dialer server until Ctrl+C.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use autodialer_engine::logging::{setup_logging, LoggingConfig};
use autodialer_engine::prelude::*;

#[derive(Parser, Debug)]
#[command(author, version, about = "Predictive outbound dialer", long_about = None)]
struct Args {
    /// Engine configuration file (TOML)
    #[arg(short, long, env = "AUTODIALER_CONFIG")]
    config: Option<PathBuf>,

    /// Override the log level (trace, debug, info, warn, error)
    #[arg(short, long, env = "AUTODIALER_LOG")]
    log_level: Option<String>,

    /// Override the agent API bind address
    #[arg(long)]
    api_addr: Option<SocketAddr>,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,
}

fn load_config(args: &Args) -> Result<EngineConfig> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::from_toml_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => EngineConfig::for_testing(),
    };

    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }
    if let Some(addr) = args.api_addr {
        config.api.enabled = true;
        config.api.bind_addr = addr;
    }
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid configuration: {}", e))?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;

    setup_logging(LoggingConfig::from_log_config(&config.logging)?)?;

    if args.config.is_none() {
        warn!("No configuration given, running with a loopback telephony server and an in-memory database");
    }
    if args.check {
        info!("✅ Configuration is valid");
        return Ok(());
    }

    let mut server = DialerServerBuilder::new()
        .with_config(config)
        .build()
        .await
        .context("building dialer server")?;
    server.start().await?;

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C"),
    }

    server.stop().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_config_file() {
        let args = Args::parse_from(["autodialer"]);
        let config = load_config(&args).unwrap();
        assert_eq!(config.database.path, ":memory:");
        assert!(!config.api.enabled);
    }

    #[test]
    fn test_api_addr_enables_api() {
        let args = Args::parse_from(["autodialer", "--api-addr", "127.0.0.1:9090"]);
        let config = load_config(&args).unwrap();
        assert!(config.api.enabled);
        assert_eq!(config.api.bind_addr.port(), 9090);
    }
}

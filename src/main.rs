//! Stubrig - CLI Entry Point

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use stubrig::{MockServer, MockServerConfig};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(
    name = "stubrig",
    about = "Programmable HTTP stub server - request matching, templated responses, delay and fault injection",
    version
)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "stubrig.yaml")]
    config: PathBuf,

    /// Listen address, overriding `settings.listen` (e.g., "0.0.0.0:8080")
    #[arg(short, long, value_name = "ADDR")]
    listen: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'L', long, default_value = "info")]
    log_level: Level,

    /// Print default configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Validate configuration and exit
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if args.print_config {
        let default_config = include_str!("../config/default-config.yaml");
        println!("{}", default_config);
        return Ok(());
    }

    let mut config = if args.config.exists() {
        info!(path = ?args.config, "Loading configuration");
        MockServerConfig::from_file(&args.config)?
    } else if args.validate {
        anyhow::bail!("Configuration file not found: {:?}", args.config);
    } else {
        info!("Using default configuration (no stubs)");
        MockServerConfig::default()
    };

    if let Some(listen) = args.listen {
        config.settings.listen = listen;
    }

    if args.validate {
        config.validate()?;
        println!(
            "Configuration is valid ({} stubs defined)",
            config.stubs.len()
        );
        return Ok(());
    }

    let server = MockServer::start(config).await?;
    info!(url = %server.base_url(), "Ready; press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    server.stop().await;

    Ok(())
}

//! Scan Detection Agent CLI.

use actix_web::{web, App, HttpResponse, HttpServer};
use anyhow::Result;
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;
use zentinel_agent_scan_detect::cleanup::run_cleanup;
use zentinel_agent_scan_detect::{Config, MemoryStore, ScanDetector, ScanProtection};

#[derive(Parser, Debug)]
#[command(name = "zentinel-agent-scan-detect")]
#[command(about = "Scan detection agent for Zentinel - block clients that generate bursts of 404s")]
#[command(version)]
struct Args {
    /// Path to configuration file (defaults are used when omitted)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'L', long, default_value = "info")]
    log_level: String,

    /// Print example configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Validate configuration and exit
    #[arg(long)]
    validate: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve HTTP with scan protection in front of the health endpoint
    Serve {
        /// Address to listen on
        #[arg(short, long, default_value = "0.0.0.0:8080")]
        bind: SocketAddr,
    },
    /// Report on scan detection state; entries expire on their own
    Cleanup,
}

#[actix_web::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Handle --print-config
    if args.print_config {
        println!("{}", Config::example());
        return Ok(());
    }

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    // Load configuration
    match &args.config {
        Some(path) => info!(config = %path.display(), "Loading configuration"),
        None => info!("No configuration file given, using defaults"),
    }
    let config = Config::load_or_default(args.config.as_deref())?;

    // Handle --validate
    if args.validate {
        info!("Configuration is valid");
        return Ok(());
    }

    let store = Arc::new(MemoryStore::new(config.store.max_entries));

    match args.command.unwrap_or(Command::Serve {
        bind: SocketAddr::from(([0, 0, 0, 0], 8080)),
    }) {
        Command::Cleanup => {
            let detector = ScanDetector::from_config(&config, store);
            run_cleanup(&detector, std::io::stdout().lock())?;
        }
        Command::Serve { bind } => {
            let protection = ScanProtection::from_config(&config, store);

            info!(
                bind = %bind,
                enabled = config.settings.enabled,
                threshold = config.detection.threshold,
                count_window_secs = config.detection.count_window_seconds,
                block_duration_secs = config.detection.block_duration_seconds,
                "Starting scan detection agent"
            );

            HttpServer::new(move || {
                App::new()
                    .wrap(protection.clone())
                    .route("/healthz", web::get().to(|| async { HttpResponse::Ok().body("ok") }))
            })
            .bind(bind)?
            .run()
            .await?;
        }
    }

    Ok(())
}

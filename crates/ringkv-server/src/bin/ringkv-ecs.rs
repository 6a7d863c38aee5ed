//! RingKV coordinator (external configuration service).

use clap::Parser;
use ringkv::logging::LogConfig;
use ringkv::{Coordinator, CoordinatorConfig, NodeId};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info};

/// Coordinator tracking ring membership and driving handoffs.
#[derive(Parser, Debug)]
#[command(name = "ringkv-ecs", version, about = "RingKV coordinator")]
struct Args {
    /// Address to listen on
    #[arg(short, long, default_value = "127.0.0.1")]
    address: String,

    /// Port to listen on
    #[arg(short, long, default_value_t = 5152)]
    port: u16,

    /// Seconds between heartbeats to each server
    #[arg(long, default_value_t = 10)]
    heartbeat_interval: u64,

    /// Seconds a server may take to answer a heartbeat
    #[arg(long, default_value_t = 30)]
    heartbeat_timeout: u64,

    /// Log level filter (overridden by RUST_LOG)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Also write logs to this file, rotated daily
    #[arg(long)]
    log_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let mut log_config = LogConfig::default().with_level(args.log_level.clone());
    if let Some(path) = &args.log_file {
        log_config = log_config.with_both(path);
    }
    let _guard = match log_config.init() {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("ringkv-ecs: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let config = CoordinatorConfig {
        listen: NodeId::new(args.address, args.port),
        heartbeat_interval: Duration::from_secs(args.heartbeat_interval),
        heartbeat_timeout: Duration::from_secs(args.heartbeat_timeout),
    };
    let listener = match TcpListener::bind((config.listen.address(), config.listen.port())).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(listen = %config.listen, error = %e, "Failed to bind");
            return ExitCode::FAILURE;
        }
    };
    info!(listen = %config.listen, version = ringkv::VERSION, "RingKV coordinator starting");

    let coordinator = Arc::new(Coordinator::new(config));
    tokio::select! {
        _ = coordinator.serve(listener) => {}
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                error!(error = %e, "Could not listen for shutdown signal");
            }
        }
    }
    info!("Coordinator stopped");
    ExitCode::SUCCESS
}

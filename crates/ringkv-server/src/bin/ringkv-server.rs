//! RingKV key-value server.

use clap::Parser;
use ringkv::logging::LogConfig;
use ringkv::{HandoffMode, KvServer, NodeId, ServerConfig, StorageConfig, SyncMode};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};

/// Key-value server owning one arc of the hash ring.
#[derive(Parser, Debug)]
#[command(name = "ringkv-server", version, about = "RingKV key-value server")]
struct Args {
    /// Address to listen on and advertise
    #[arg(short, long, default_value = "127.0.0.1")]
    address: String,

    /// Port to listen on; 0 picks a free port
    #[arg(short, long, default_value_t = 5153)]
    port: u16,

    /// Coordinator as address:port. Without it the server runs standalone.
    #[arg(short, long)]
    coordinator: Option<NodeId>,

    /// Directory holding the B-tree store
    #[arg(short, long, default_value = "data")]
    data_dir: PathBuf,

    /// Minimum degree of the B-tree
    #[arg(long, default_value_t = 3)]
    minimum_degree: usize,

    /// Skip fsync on chunk writes
    #[arg(long)]
    no_sync: bool,

    /// Finish handoffs before acknowledging them
    #[arg(long)]
    inline_handoff: bool,

    /// Extra copies of every key kept on the owner's successors
    #[arg(long, default_value_t = ringkv::DEFAULT_REPLICAS)]
    replicas: usize,

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
            eprintln!("ringkv-server: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let storage = StorageConfig {
        minimum_degree: args.minimum_degree,
        sync_mode: if args.no_sync {
            SyncMode::None
        } else {
            SyncMode::Sync
        },
    };
    let mut config = ServerConfig::new(NodeId::new(args.address, args.port), args.data_dir)
        .with_storage(storage)
        .with_replicas(args.replicas)
        .with_handoff_mode(if args.inline_handoff {
            HandoffMode::Inline
        } else {
            HandoffMode::Background
        });
    if let Some(coordinator) = args.coordinator {
        config = config.with_coordinator(coordinator);
    }

    let server = match KvServer::bind(config).await {
        Ok(server) => server,
        Err(e) => {
            error!(error = %e, "Failed to start server");
            return ExitCode::FAILURE;
        }
    };
    info!(node = %server.node_id(), version = ringkv::VERSION, "RingKV server starting");

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Could not listen for shutdown signal");
        }
    };
    match server.run(shutdown).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Server failed");
            ExitCode::FAILURE
        }
    }
}

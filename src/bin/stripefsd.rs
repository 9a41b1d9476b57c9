//! StripeFS Storage Server Daemon
//!
//! One daemon per storage node. It serves the stripe RPC protocol on a data
//! port and the administrative handshake on the control port, exporting
//! either a local storage root or, with `nested_partition` configured, a
//! whole inner partition.
//!
//! # Usage
//!
//! ```bash
//! stripefsd --config /etc/stripefs/server.toml
//! stripefsd --storage-root /data/sfs --control-port 3456
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use stripefs::api::StripeFs;
use stripefs::config::{defaults, ServerConfig, WorkerMode};
use stripefs::logging;
use stripefs::server::{DiskBackend, FsBackend, NestedBackend, Server};

/// StripeFS storage server
#[derive(Parser, Debug)]
#[command(name = "stripefsd")]
#[command(about = "StripeFS storage server daemon")]
struct Args {
    /// TOML configuration file; flags below override nothing when set.
    #[arg(long, conflicts_with_all = ["storage_root", "bind_host", "control_port", "data_port"])]
    config: Option<PathBuf>,

    /// Storage root to export (required unless --config is given)
    #[arg(long)]
    storage_root: Option<PathBuf>,

    /// Host/interface to bind
    #[arg(long, default_value = "0.0.0.0")]
    bind_host: String,

    /// Control port (well-known handshake port)
    #[arg(long, default_value_t = defaults::CONTROL_PORT)]
    control_port: u16,

    /// Data port; 0 lets the OS choose
    #[arg(long, default_value_t = 0)]
    data_port: u16,

    /// Worker pool size; 0 means one task per request
    #[arg(long, default_value_t = defaults::WORKERS)]
    workers: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn into_config(self) -> Result<ServerConfig, Box<dyn std::error::Error>> {
        if let Some(path) = &self.config {
            return Ok(ServerConfig::from_file(path)?);
        }
        let storage_root = self
            .storage_root
            .ok_or("either --config or --storage-root is required")?;
        let worker_mode = if self.workers == 0 {
            WorkerMode::OnDemand
        } else {
            WorkerMode::Pool {
                workers: self.workers,
            }
        };
        let config = ServerConfig {
            bind_host: self.bind_host,
            control_port: self.control_port,
            data_port: self.data_port,
            storage_root,
            worker_mode,
            nested_partition: None,
            log_level: self.log_level,
        };
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let config = match args.into_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("stripefsd: {e}");
            std::process::exit(1);
        }
    };
    logging::init(&config.log_level);

    let backend: Arc<dyn FsBackend> = match &config.nested_partition {
        Some(partition) => {
            info!(
                "nesting over partition '{}' ({} servers)",
                partition.name,
                partition.server_count()
            );
            match StripeFs::new(partition.clone()) {
                Ok(fs) => Arc::new(NestedBackend::new(fs)),
                Err(e) => {
                    error!("nested partition setup failed: {}", e);
                    std::process::exit(1);
                }
            }
        }
        None => {
            info!("exporting {}", config.storage_root.display());
            Arc::new(DiskBackend::new(&config.storage_root))
        }
    };

    let server = match Server::bind(&config, backend).await {
        Ok(server) => server,
        Err(e) => {
            error!("bind failed: {}", e);
            std::process::exit(1);
        }
    };

    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            shutdown.trigger();
        }
    });

    if let Err(e) = server.run().await {
        error!("server terminated: {}", e);
        std::process::exit(1);
    }
}

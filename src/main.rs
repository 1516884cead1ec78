use std::fs::OpenOptions;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing_appender::non_blocking;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

mod audit;
mod backend;
mod cli;
mod config;
mod error;
mod framing;
mod guac;
mod mux;
mod recorder;
mod registry;
mod serve;
mod session;
mod ws;

pub use error::GatewayError;

fn main() -> Result<()> {
    let cli = cli::Cli::parse();
    init_tracing(cli.debug);

    let mut config = config::Config::init(cli.config.as_deref())?;
    if let Some(listen) = cli.listen {
        config.listen_addr = listen;
    }

    let directory = Arc::new(registry::SqliteDirectory::open(&config.directory_db_path)?);
    let (audit, _audit_worker) = audit::spawn_audit_worker(
        Box::new(audit::JsonlAuditStore::new(config.audit_log_path.clone())),
        Box::new(audit::LocalReplayStore::new(config.replay_dir.clone())),
    );

    let listener = std::net::TcpListener::bind(&config.listen_addr)?;
    tracing::info!("[serve] listening on {}", config.listen_addr);

    let gateway = Arc::new(serve::Gateway {
        config,
        directory,
        audit,
        mux: mux::ReadyLoop::new(),
        counter: Arc::new(session::GaugeCounter::default()),
    });

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let gateway = gateway.clone();
                std::thread::spawn(move || serve::handle_connection(stream, gateway));
            }
            Err(e) => tracing::warn!("[serve] accept failed: {}", e),
        }
    }
    Ok(())
}

/// File-only tracing under `<state_dir>/logs/debug.log`; console output stays
/// untouched. When the log file cannot be opened tracing is skipped for the
/// run.
fn init_tracing(debug: bool) {
    let logs_dir = match config::storage_dir() {
        Some(dir) => dir.join("logs"),
        None => std::path::PathBuf::from(".").join("logs"),
    };
    let _ = std::fs::create_dir_all(&logs_dir);
    let log_path = logs_dir.join("debug.log");
    let level_str = if debug { "debug" } else { "info" };

    match OpenOptions::new().create(true).append(true).open(&log_path) {
        Ok(file) => {
            let (non_blocking_writer, guard) = non_blocking(file);
            // Keep the writer thread alive for the process lifetime.
            let _ = Box::leak(Box::new(guard));
            let file_layer = fmt::layer()
                .with_writer(non_blocking_writer)
                .with_ansi(false)
                .with_filter(EnvFilter::new(level_str));
            tracing_subscriber::registry().with(file_layer).init();
        }
        Err(e) => {
            eprintln!("warning: could not open debug log at {}: {}", log_path.display(), e);
        }
    }
}

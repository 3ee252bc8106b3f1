//! Sotto background service
//!
//! The daemon that owns audio capture, transcription, and text refinement.
//! Clients (the `sotto` CLI or anything else speaking the framed protocol)
//! talk to it over a Unix domain socket.

mod config;
mod daemon;
mod engine;
mod error;
mod ipc;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use daemon::DaemonManager;
use ipc::registry::SessionRegistry;

/// Global shutdown flag
static SHUTDOWN_FLAG: std::sync::OnceLock<Arc<AtomicBool>> = std::sync::OnceLock::new();

/// Get the global shutdown flag.
pub fn get_shutdown_flag() -> Arc<AtomicBool> {
    SHUTDOWN_FLAG
        .get_or_init(|| Arc::new(AtomicBool::new(false)))
        .clone()
}

/// Request service shutdown.
pub fn request_shutdown() {
    info!("Shutdown requested");
    get_shutdown_flag().store(true, Ordering::SeqCst);
}

/// Check if shutdown has been requested.
pub fn is_shutdown_requested() -> bool {
    get_shutdown_flag().load(Ordering::SeqCst)
}

fn main() {
    // Keep the guard alive so the file writer flushes on exit
    let _log_guard = init_logging();

    info!("Sotto service starting (pid: {})...", std::process::id());

    // Set up signal handlers for graceful shutdown
    setup_signal_handlers();

    // Write a starter config on first run
    match config::ensure_default_config() {
        Ok(Some(path)) => info!("Wrote default config to {:?}", path),
        Ok(None) => {}
        Err(e) => warn!("Could not write default config: {}", e),
    }

    let config = match config::load_config(None) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    let factory = engine::engine_factory(&config);
    let manager = match DaemonManager::new(factory, &config) {
        Ok(manager) => manager,
        Err(e) => {
            error!("Failed to initialize engines: {}", e);
            std::process::exit(1);
        }
    };
    let registry = Arc::new(SessionRegistry::new());

    // Run async runtime
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("Failed to create Tokio runtime");

    runtime.block_on(async {
        // Start the IPC server (runs until shutdown)
        if let Err(e) = ipc::run_server(Arc::clone(&manager), registry).await {
            if !is_shutdown_requested() {
                error!("IPC server error: {}", e);
                std::process::exit(1);
            }
        }
    });

    // Cleanup
    cleanup_on_shutdown(&manager);
    info!("Sotto service stopped");
}

/// Initialize logging with RUST_LOG env var support.
///
/// Logs go to stderr and to a daily-rolled file under the platform log
/// directory. File logging is skipped when the directory cannot be created.
fn init_logging() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    match sotto_common::logging::ensure_log_dir() {
        Ok(()) => {
            let appender = tracing_appender::rolling::daily(
                sotto_common::logging::log_dir(),
                "sotto-service.log",
            );
            let (file_writer, guard) = tracing_appender::non_blocking(appender);
            let file_layer = tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false);

            tracing_subscriber::registry()
                .with(env_filter)
                .with(stderr_layer)
                .with(file_layer)
                .init();
            Some(guard)
        }
        Err(e) => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(stderr_layer)
                .init();
            warn!("File logging disabled: {}", e);
            None
        }
    }
}

/// Set up signal handlers for graceful shutdown.
fn setup_signal_handlers() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        std::thread::spawn(|| {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            rt.block_on(async {
                let mut sigterm = signal(SignalKind::terminate()).unwrap();
                let mut sigint = signal(SignalKind::interrupt()).unwrap();
                let mut sighup = signal(SignalKind::hangup()).unwrap();

                tokio::select! {
                    _ = sigterm.recv() => {
                        info!("Received SIGTERM");
                    }
                    _ = sigint.recv() => {
                        info!("Received SIGINT");
                    }
                    _ = sighup.recv() => {
                        info!("Received SIGHUP");
                    }
                }

                request_shutdown();
            });
        });
    }
}

/// Cleanup resources on shutdown.
fn cleanup_on_shutdown(manager: &Arc<DaemonManager>) {
    info!("Cleaning up...");

    // Abort any in-flight recording or transcription
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build();

    if let Ok(rt) = rt {
        rt.block_on(async {
            if let Err(e) = manager.shutdown().await {
                // Already shutting down when the request came over the wire
                debug!("Shutdown transition skipped: {}", e);
            }
        });
    }

    // Remove socket file
    #[cfg(unix)]
    {
        let socket_path = sotto_common::ipc::get_socket_path();
        if socket_path.exists() {
            if let Err(e) = std::fs::remove_file(&socket_path) {
                warn!("Failed to remove socket file: {}", e);
            } else {
                info!("Removed socket file: {:?}", socket_path);
            }
        }
    }
}

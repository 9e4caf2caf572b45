//! # rost-sysrootd
//!
//! Sysroot state coordinator for the rost daemon.
//!
//! ## Architecture
//!
//! One process per physical root that:
//! - Keeps one published object per OS name found under `ostree/deploy`
//! - Publishes the deployment list and the booted OS
//! - Watches the deployment store and reloads after changes settle
//! - Creates the on-disk skeleton of new OS names on request
//!
//! ## Communication
//!
//! Clients talk to the daemon over a Unix Domain Socket:
//! - Socket path: `daemon.socket` from the config (`/run/rost/sysrootd.sock`)
//! - Protocol: bincode-serialized `SysrootRequest`/`SysrootResponse` frames

pub mod capture;
pub mod commands;
pub mod error;
pub mod object_path;
pub mod registry;
pub mod scheduler;
pub mod skeleton;
pub mod snapshot;
pub mod socket;
pub mod store;
pub mod sysroot;
pub mod transaction;
pub mod watch;

use std::sync::Arc;

use anyhow::{Context, Result};
use rost_config::Config;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub use error::{StoreError, SysrootError};
pub use sysroot::{Sysroot, SysrootOptions, SysrootUpdated};

/// Main daemon entry point; returns after a clean shutdown
pub async fn run_daemon(config: Config) -> Result<()> {
    info!(
        sysroot = %config.sysroot.path.display(),
        socket = %config.daemon.socket.display(),
        debounce_secs = config.sysroot.debounce_secs,
        "Starting rost-sysrootd"
    );

    let transactions = Arc::new(transaction::TransactionMonitor::new());

    // Consumer first: start forwarding stdout before anything can print to it
    let capture_handle = if config.daemon.capture_stdout {
        match capture::spawn_stdout_capture(&transactions) {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!(error = %e, "Failed to capture stdout; output stays on the console");
                None
            }
        }
    } else {
        None
    };

    let store = Arc::new(store::FsDeploymentStore::new(
        &config.sysroot.path,
        &config.sysroot.cmdline,
    ));
    let sysroot = Sysroot::new(
        store,
        Arc::new(registry::StubFactory),
        &transactions,
        SysrootOptions {
            debounce: config.debounce(),
            watch: true,
        },
    );

    sysroot
        .populate()
        .await
        .context("Failed to load sysroot")?;

    let cancel = CancellationToken::new();
    let handler = commands::CommandHandler::new(Arc::clone(&sysroot));
    let socket_path = config.daemon.socket.clone();
    let listener_cancel = cancel.clone();
    let mut socket_handle = tokio::spawn(async move {
        socket::run_listener(&socket_path, handler, listener_cancel).await
    });

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("Failed to install SIGTERM handler")?;

    // Wait for the listener to die, or a signal for graceful shutdown
    let listener_result = tokio::select! {
        result = &mut socket_handle => Some(result),
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT, initiating graceful shutdown...");
            None
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, initiating graceful shutdown...");
            None
        }
    };

    cancel.cancel();
    sysroot.shutdown().await;

    if let Some(handle) = capture_handle {
        handle.abort();
    }

    match listener_result {
        Some(result) => result.context("Listener task panicked")??,
        None => {
            if let Err(e) = socket_handle.await {
                warn!(error = %e, "Listener task failed during shutdown");
            }
        }
    }

    info!("rost-sysrootd stopped");
    Ok(())
}

//! Unix Domain Socket listener for the sysroot daemon
//!
//! Length-prefixed bincode frames (see `rost_ipc::frame`), one response per
//! request. A `WatchUpdates` request switches the connection to streaming
//! `Updated` frames until either side goes away.

use std::path::Path;

use anyhow::Result;
use rost_config::{log_ipc_debug, log_ipc_info};
use rost_ipc::frame::{read_frame, write_frame};
use rost_ipc::{ErrorKind, RemoteError, SysrootRequest, SysrootResponse};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::commands::CommandHandler;

/// Bind `socket_path` (replacing a stale socket) and serve until `cancel` fires
pub async fn run_listener(
    socket_path: &Path,
    handler: CommandHandler,
    cancel: CancellationToken,
) -> Result<()> {
    if socket_path.exists() {
        std::fs::remove_file(socket_path)?;
    }
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let listener = UnixListener::bind(socket_path)?;
    log_ipc_info!(
        "Listening for connections",
        socket = tracing::field::display(socket_path.display()),
    );

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _addr)) => {
                    let handler = handler.clone();
                    let cancel = cancel.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_client(stream, handler, cancel).await {
                            warn!(error = %e, "Client handler error");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "Accept failed");
                }
            },
        }
    }

    let _ = std::fs::remove_file(socket_path);
    log_ipc_info!("Listener stopped");
    Ok(())
}

async fn handle_client(
    mut stream: UnixStream,
    handler: CommandHandler,
    cancel: CancellationToken,
) -> Result<()> {
    log_ipc_debug!("New client connected");

    loop {
        let request: SysrootRequest = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            frame = read_frame(&mut stream) => match frame? {
                Some(request) => request,
                None => {
                    log_ipc_debug!("Client disconnected");
                    return Ok(());
                }
            },
        };

        tracing::debug!(?request, "Received request");

        if request == SysrootRequest::WatchUpdates {
            // Subscribe before acking so no update can slip in between
            let updates = handler.sysroot().subscribe();
            write_frame(&mut stream, &SysrootResponse::WatchAck).await?;
            return stream_updates(stream, updates, cancel).await;
        }

        let response = handler.handle_request(request).await;
        write_frame(&mut stream, &response).await?;
    }
}

async fn stream_updates(
    mut stream: UnixStream,
    mut updates: broadcast::Receiver<crate::sysroot::SysrootUpdated>,
    cancel: CancellationToken,
) -> Result<()> {
    loop {
        let update = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            update = updates.recv() => update,
        };

        let response = match update {
            Ok(update) => SysrootResponse::Updated {
                generation: update.generation,
                booted: update.snapshot.booted_object_path(),
            },
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Update subscriber lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => {
                let err = RemoteError::new(ErrorKind::Unavailable, "sysroot shut down");
                write_frame(&mut stream, &SysrootResponse::Error(err)).await?;
                return Ok(());
            }
        };
        write_frame(&mut stream, &response).await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use rost_config::testing::TestEnvironment;

    use crate::registry::StubFactory;
    use crate::store::FsDeploymentStore;
    use crate::sysroot::{Sysroot, SysrootOptions};
    use crate::transaction::TransactionMonitor;

    const DEADLINE: Duration = Duration::from_secs(10);

    #[tokio::test]
    async fn test_listener_replaces_stale_socket() {
        let env = TestEnvironment::new().unwrap();

        // Left behind by a daemon that died without cleaning up
        drop(std::os::unix::net::UnixListener::bind(&env.socket_path).unwrap());
        assert!(env.socket_path.exists());
        assert!(std::os::unix::net::UnixStream::connect(&env.socket_path).is_err());

        let store = Arc::new(FsDeploymentStore::new(&env.sysroot, &env.cmdline_path));
        let monitor = Arc::new(TransactionMonitor::new());
        let options = SysrootOptions {
            debounce: Duration::from_millis(100),
            watch: false,
        };
        let sysroot = Sysroot::new(store, Arc::new(StubFactory), &monitor, options);
        sysroot.populate().await.unwrap();

        let cancel = CancellationToken::new();
        let socket_path = env.socket_path.clone();
        let handler = CommandHandler::new(Arc::clone(&sysroot));
        let listener_cancel = cancel.clone();
        let listener =
            tokio::spawn(async move { run_listener(&socket_path, handler, listener_cancel).await });

        let mut stream = tokio::time::timeout(DEADLINE, async {
            loop {
                if let Ok(stream) = UnixStream::connect(&env.socket_path).await {
                    return stream;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("listener never bound");

        write_frame(&mut stream, &SysrootRequest::Status).await.unwrap();
        let response: Option<SysrootResponse> = read_frame(&mut stream).await.unwrap();
        assert_eq!(
            response,
            Some(SysrootResponse::StatusAck {
                status: "idle".to_string()
            })
        );

        cancel.cancel();
        let result = tokio::time::timeout(DEADLINE, listener).await.unwrap();
        assert!(result.unwrap().is_ok());
        assert!(!env.socket_path.exists());
        sysroot.shutdown().await;
    }
}

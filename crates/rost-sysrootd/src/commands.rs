//! Request handlers for the sysroot daemon

use std::sync::Arc;

use rost_config::log_ipc_info;
use rost_ipc::{RemoteError, SysrootRequest, SysrootResponse};
use tracing::{debug, warn};

use crate::error::SysrootError;
use crate::sysroot::Sysroot;

/// Maps wire requests onto the coordinator
#[derive(Clone)]
pub struct CommandHandler {
    sysroot: Arc<Sysroot>,
}

impl CommandHandler {
    pub fn new(sysroot: Arc<Sysroot>) -> Self {
        Self { sysroot }
    }

    pub fn sysroot(&self) -> &Arc<Sysroot> {
        &self.sysroot
    }

    /// Handle one request. `WatchUpdates` is answered here with an ack;
    /// the streaming itself belongs to the connection loop.
    pub async fn handle_request(&self, request: SysrootRequest) -> SysrootResponse {
        match request {
            SysrootRequest::Status => SysrootResponse::StatusAck {
                status: format!("{:?}", self.sysroot.scheduler_state()).to_lowercase(),
            },

            SysrootRequest::CreateOsName { name } => self.handle_create_os_name(name).await,

            SysrootRequest::GetOs { name } => match self.sysroot.get_os(&name) {
                Ok(path) => SysrootResponse::ObjectPath(path),
                Err(e) => error_response(&e),
            },

            SysrootRequest::GetProperties => {
                SysrootResponse::Properties(self.sysroot.properties())
            }

            SysrootRequest::WatchUpdates => SysrootResponse::WatchAck,
        }
    }

    /// Skeleton creation touches the disk, so it runs on the blocking pool
    async fn handle_create_os_name(&self, name: String) -> SysrootResponse {
        let sysroot = Arc::clone(&self.sysroot);
        let joined = tokio::task::spawn_blocking(move || {
            let result = sysroot.create_os_name(&name);
            (name, result)
        })
        .await;

        match joined {
            Ok((name, Ok(path))) => {
                log_ipc_info!("CreateOsName", osname = name.as_str());
                SysrootResponse::ObjectPath(path)
            }
            Ok((name, Err(e))) => {
                warn!(osname = %name, error = %e, "CreateOsName failed");
                error_response(&e)
            }
            Err(e) => {
                let err = SysrootError::Internal(format!("CreateOsName task failed: {}", e));
                error_response(&err)
            }
        }
    }
}

fn error_response(err: &SysrootError) -> SysrootResponse {
    debug!(error = %err, "Replying with error");
    SysrootResponse::Error(RemoteError::from(err))
}

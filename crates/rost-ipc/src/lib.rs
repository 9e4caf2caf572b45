//! Wire types for the sysroot daemon's remote surface.
//!
//! Every frame is a little-endian `u32` length followed by a bincode payload.

use serde::{Deserialize, Serialize};

/// Object path of the sysroot itself, and of "nothing booted"
pub const ROOT_OBJECT_PATH: &str = "/";

/// Largest frame either side will accept
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum SysrootRequest {
    Status,
    CreateOsName { name: String },
    GetOs { name: String },
    GetProperties,
    /// Turns the connection into a stream of `SysrootResponse::Updated`
    WatchUpdates,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum SysrootResponse {
    StatusAck { status: String },
    ObjectPath(String),
    Properties(SysrootProperties),
    WatchAck,
    Updated { generation: u64, booted: String },
    Error(RemoteError),
}

/// Read-only properties published by the sysroot object
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SysrootProperties {
    pub path: String,
    pub booted: String,
    pub deployments: Vec<DeploymentInfo>,
    pub active_transaction_address: String,
}

/// One deployment as seen by remote callers
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeploymentInfo {
    pub id: String,
    pub osname: String,
    pub serial: u32,
    pub checksum: String,
    pub version: Option<String>,
    /// Seconds since the epoch
    pub timestamp: u64,
    /// Refspec from the deployment's origin file
    pub origin: Option<String>,
    pub booted: bool,
}

/// Stable error discriminator carried over the wire
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidName,
    NotFound,
    Io,
    Store,
    Unavailable,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct RemoteError {
    pub kind: ErrorKind,
    pub message: String,
}

impl RemoteError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Frame encoding shared by the daemon and the client
#[cfg(feature = "tokio")]
pub mod frame {
    use super::MAX_FRAME_SIZE;
    use serde::{de::DeserializeOwned, Serialize};
    use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

    /// Write one length-prefixed frame
    pub async fn write_frame<W, T>(stream: &mut W, value: &T) -> anyhow::Result<()>
    where
        W: AsyncWrite + Unpin,
        T: Serialize,
    {
        let payload = bincode::serialize(value)?;
        if payload.len() > MAX_FRAME_SIZE {
            anyhow::bail!("Frame too large: {} bytes", payload.len());
        }
        stream
            .write_all(&(payload.len() as u32).to_le_bytes())
            .await?;
        stream.write_all(&payload).await?;
        stream.flush().await?;
        Ok(())
    }

    /// Read one length-prefixed frame; `Ok(None)` on clean EOF
    pub async fn read_frame<R, T>(stream: &mut R) -> anyhow::Result<Option<T>>
    where
        R: AsyncRead + Unpin,
        T: DeserializeOwned,
    {
        let mut len_buf = [0u8; 4];
        match stream.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_le_bytes(len_buf) as usize;
        if len > MAX_FRAME_SIZE {
            anyhow::bail!("Frame too large: {} bytes", len);
        }

        let mut payload = vec![0u8; len];
        stream.read_exact(&mut payload).await?;
        Ok(Some(bincode::deserialize(&payload)?))
    }
}

/// IPC Client for communicating with the sysroot daemon
#[cfg(feature = "tokio")]
pub mod client {
    use super::*;
    use std::path::Path;
    use tokio::net::UnixStream;

    pub struct SysrootClient {
        stream: UnixStream,
    }

    impl SysrootClient {
        /// Connect to the daemon socket
        pub async fn connect(socket_path: impl AsRef<Path>) -> anyhow::Result<Self> {
            let stream = UnixStream::connect(socket_path.as_ref()).await?;
            Ok(Self { stream })
        }

        /// Send a request and receive response
        pub async fn send(&mut self, request: SysrootRequest) -> anyhow::Result<SysrootResponse> {
            frame::write_frame(&mut self.stream, &request).await?;
            match frame::read_frame(&mut self.stream).await? {
                Some(response) => Ok(response),
                None => anyhow::bail!("Daemon closed the connection"),
            }
        }

        /// Get daemon status
        pub async fn status(&mut self) -> anyhow::Result<String> {
            match self.send(SysrootRequest::Status).await? {
                SysrootResponse::StatusAck { status } => Ok(status),
                SysrootResponse::Error(e) => Err(e.into()),
                _ => anyhow::bail!("Unexpected response"),
            }
        }

        /// `CreateOsName(name)`; returns the new OS object path
        pub async fn create_os_name(&mut self, name: &str) -> anyhow::Result<String> {
            let request = SysrootRequest::CreateOsName {
                name: name.to_string(),
            };
            self.expect_object_path(request).await
        }

        /// `GetOs(name)`; the empty name asks for the booted OS
        pub async fn get_os(&mut self, name: &str) -> anyhow::Result<String> {
            let request = SysrootRequest::GetOs {
                name: name.to_string(),
            };
            self.expect_object_path(request).await
        }

        pub async fn properties(&mut self) -> anyhow::Result<SysrootProperties> {
            match self.send(SysrootRequest::GetProperties).await? {
                SysrootResponse::Properties(props) => Ok(props),
                SysrootResponse::Error(e) => Err(e.into()),
                _ => anyhow::bail!("Unexpected response"),
            }
        }

        /// Subscribe to `updated` notifications; consumes the client
        pub async fn watch_updates(mut self) -> anyhow::Result<UpdateStream> {
            match self.send(SysrootRequest::WatchUpdates).await? {
                SysrootResponse::WatchAck => Ok(UpdateStream {
                    stream: self.stream,
                }),
                SysrootResponse::Error(e) => Err(e.into()),
                _ => anyhow::bail!("Unexpected response"),
            }
        }

        async fn expect_object_path(&mut self, request: SysrootRequest) -> anyhow::Result<String> {
            match self.send(request).await? {
                SysrootResponse::ObjectPath(path) => Ok(path),
                SysrootResponse::Error(e) => Err(e.into()),
                _ => anyhow::bail!("Unexpected response"),
            }
        }
    }

    /// Stream of `updated` notifications
    pub struct UpdateStream {
        stream: UnixStream,
    }

    impl UpdateStream {
        /// Next `(generation, booted)`; `None` once the daemon hangs up
        pub async fn next(&mut self) -> anyhow::Result<Option<(u64, String)>> {
            match frame::read_frame(&mut self.stream).await? {
                Some(SysrootResponse::Updated { generation, booted }) => {
                    Ok(Some((generation, booted)))
                }
                Some(SysrootResponse::Error(e)) => Err(e.into()),
                Some(_) => anyhow::bail!("Unexpected response"),
                None => Ok(None),
            }
        }
    }
}

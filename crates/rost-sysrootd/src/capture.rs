//! Captured output forwarding.
//!
//! Lines written to our own stdout (the store library prints progress there)
//! go to the active transaction's owner when there is one, otherwise to the
//! real stdout.

use std::io::{self, Write};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::warn;

use crate::transaction::TransactionMonitor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Transaction,
    Fallback,
}

pub struct LogRouter {
    transactions: Weak<TransactionMonitor>,
    fallback: Mutex<Box<dyn Write + Send>>,
}

impl LogRouter {
    pub fn new(transactions: &Arc<TransactionMonitor>, fallback: Box<dyn Write + Send>) -> Self {
        Self {
            transactions: Arc::downgrade(transactions),
            fallback: Mutex::new(fallback),
        }
    }

    /// Deliver one line (without its trailing newline)
    pub fn route_line(&self, line: &str) -> Route {
        let active = self
            .transactions
            .upgrade()
            .and_then(|monitor| monitor.active_transaction());

        match active {
            Some(transaction) => {
                transaction.emit_message(line);
                Route::Transaction
            }
            None => {
                let mut out = self.fallback.lock().unwrap_or_else(PoisonError::into_inner);
                // Same as puts(): errors are not interesting here
                let _ = out.write_all(line.as_bytes());
                let _ = out.write_all(b"\n");
                let _ = out.flush();
                Route::Fallback
            }
        }
    }
}

/// Give up on the pipe after this many read errors in a row
pub const MAX_CONSECUTIVE_READ_ERRORS: usize = 8;

/// Read `reader` line by line into `router` until EOF; returns the line count.
///
/// Bytes that are not UTF-8 are forwarded lossily. A failed read is logged
/// and retried; only a run of failures ends the pump.
pub async fn pump_lines<R>(reader: R, router: Arc<LogRouter>) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    let mut count = 0;
    let mut errors = 0;
    loop {
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) if buf.is_empty() => return Ok(count),
            Ok(_) => {
                errors = 0;
                router.route_line(&String::from_utf8_lossy(strip_newline(&buf)));
                buf.clear();
                count += 1;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                errors += 1;
                warn!(error = %e, errors, "Failed to read captured stdout");
                if errors >= MAX_CONSECUTIVE_READ_ERRORS {
                    return Err(e);
                }
            }
        }
    }
}

fn strip_newline(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// Point fd 1 at a pipe. Returns the pipe's read end and a handle on the
/// original stdout.
#[cfg(unix)]
pub fn redirect_stdout() -> io::Result<(std::os::fd::OwnedFd, std::fs::File)> {
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

    // SAFETY: plain fd syscalls; every returned fd is immediately owned.
    unsafe {
        let real = libc::dup(libc::STDOUT_FILENO);
        if real < 0 {
            return Err(io::Error::last_os_error());
        }
        let real = OwnedFd::from_raw_fd(real);

        let mut fds = [0; 2];
        if libc::pipe(fds.as_mut_ptr()) < 0 {
            return Err(io::Error::last_os_error());
        }
        let read_end = OwnedFd::from_raw_fd(fds[0]);
        let write_end = OwnedFd::from_raw_fd(fds[1]);

        if libc::dup2(write_end.as_raw_fd(), libc::STDOUT_FILENO) < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok((read_end, std::fs::File::from(real)))
    }
}

/// Redirect stdout and spawn the task forwarding its lines
#[cfg(unix)]
pub fn spawn_stdout_capture(
    transactions: &Arc<TransactionMonitor>,
) -> io::Result<tokio::task::JoinHandle<()>> {
    let (read_end, real_stdout) = redirect_stdout()?;
    let receiver = tokio::net::unix::pipe::Receiver::from_owned_fd(read_end)?;
    let router = Arc::new(LogRouter::new(transactions, Box::new(real_stdout)));
    Ok(tokio::spawn(async move {
        let _ = pump_lines(receiver, router).await;
    }))
}

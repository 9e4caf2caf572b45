//! Filesystem watch on the deployment store.
//!
//! Watches `<root>/ostree/repo` and `<root>/ostree/deploy` (non-recursive)
//! and turns every relevant change into a debounced reload request.
//! Uses FSEvents on macOS, inotify on Linux.

use std::path::PathBuf;
use std::sync::Weak;
use std::time::Duration;

use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use rost_config::{log_watch_debug, log_watch_info, log_watch_warn};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::sysroot::Sysroot;

/// Events still queued at stop time are drained, up to this many
pub const WATCH_DRAIN_LIMIT: usize = 10;

type WatchEvent = Result<Event, notify::Error>;

/// Whether an event kind can change the set of OS names or deployments
pub fn is_relevant(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Remove(_) | EventKind::Modify(_)
    )
}

pub struct SysrootWatch {
    watcher: Option<RecommendedWatcher>,
    stop: CancellationToken,
    consumer: Option<JoinHandle<mpsc::UnboundedReceiver<WatchEvent>>>,
    paths: Vec<PathBuf>,
}

impl SysrootWatch {
    /// Start watching `paths`; changes are reported to `sysroot`
    pub fn start(
        paths: &[PathBuf],
        sysroot: Weak<Sysroot>,
        runtime: &Handle,
    ) -> notify::Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();

        let watcher_config = Config::default()
            .with_poll_interval(Duration::from_secs(2))
            .with_compare_contents(false);

        let mut watcher = RecommendedWatcher::new(
            move |res| {
                let _ = tx.send(res);
            },
            watcher_config,
        )?;

        for path in paths {
            watcher.watch(path, RecursiveMode::NonRecursive)?;
            log_watch_info!("Watching", path = tracing::field::display(path.display()));
        }

        let stop = CancellationToken::new();
        let consumer = runtime.spawn(consume(rx, sysroot, stop.clone()));

        Ok(Self {
            watcher: Some(watcher),
            stop,
            consumer: Some(consumer),
            paths: paths.to_vec(),
        })
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    /// Stop delivering events and wait for the consumer to exit.
    /// Returns how many queued events were discarded.
    pub async fn stop(mut self) -> usize {
        // Dropping the watcher closes the sending side
        self.watcher.take();
        self.stop.cancel();

        let Some(consumer) = self.consumer.take() else {
            return 0;
        };
        match consumer.await {
            Ok(mut rx) => drain_queued(&mut rx),
            Err(e) => {
                log_watch_warn!("Watch consumer failed", error = tracing::field::display(&e));
                0
            }
        }
    }
}

/// Discard at most [`WATCH_DRAIN_LIMIT`] queued events; the rest go with the channel
fn drain_queued<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> usize {
    let mut drained = 0;
    while drained < WATCH_DRAIN_LIMIT && rx.try_recv().is_ok() {
        drained += 1;
    }
    drained
}

impl Drop for SysrootWatch {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

async fn consume(
    mut rx: mpsc::UnboundedReceiver<WatchEvent>,
    sysroot: Weak<Sysroot>,
    stop: CancellationToken,
) -> mpsc::UnboundedReceiver<WatchEvent> {
    loop {
        let event = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            event = rx.recv() => event,
        };

        match event {
            Some(Ok(event)) => {
                if !is_relevant(&event.kind) {
                    continue;
                }
                debug!(?event, "FS event received");
                match sysroot.upgrade() {
                    Some(sysroot) => sysroot.notify_changed(),
                    None => break,
                }
            }
            Some(Err(e)) => {
                log_watch_warn!("FS watch error", error = tracing::field::display(&e));
            }
            None => break,
        }
    }
    log_watch_debug!("Watch consumer exiting");
    rx
}

//! Sysroot state coordinator.
//!
//! Owns the OS registry, the published deployment snapshot and the debounced
//! reload scheduler. Every piece of state touched by more than one event
//! source lives behind one reader/writer lock, which is only ever held for
//! in-memory bookkeeping: the blocking part of a reload (directory scan and
//! store load) runs on the blocking pool without it.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak,
};
use std::time::{Duration, Instant};

use rost_config::{log_sysroot_debug, log_sysroot_error, log_sysroot_info, log_sysroot_warn};
use rost_ipc::{SysrootProperties, ROOT_OBJECT_PATH};
use tokio::runtime::Handle;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, StoreError, SysrootError};
use crate::object_path::os_object_path;
use crate::registry::{
    is_valid_osname, scan_os_names, OsRegistry, OsServiceFactory, Reconciliation,
};
use crate::scheduler::{
    ReloadOutcome, Scheduler, SchedulerAction, SchedulerState, DEFAULT_WINDOW,
};
use crate::skeleton::ensure_os_skeleton;
use crate::snapshot::{load_snapshot, DeploymentSnapshot};
use crate::store::{DeploymentStore, LoadedSysroot};
use crate::transaction::{transaction_address, TransactionMonitor};
use crate::watch::SysrootWatch;

/// Broadcast once per successful background reload
#[derive(Debug, Clone)]
pub struct SysrootUpdated {
    pub generation: u64,
    /// Store handle the new state was read from
    pub store: Arc<LoadedSysroot>,
    pub snapshot: Arc<DeploymentSnapshot>,
}

#[derive(Debug, Clone)]
pub struct SysrootOptions {
    pub debounce: Duration,
    /// Subscribe to filesystem changes during `populate`
    pub watch: bool,
}

impl Default for SysrootOptions {
    fn default() -> Self {
        Self {
            debounce: DEFAULT_WINDOW,
            watch: true,
        }
    }
}

#[derive(Debug, Default)]
struct ReloadStats {
    started: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

/// Reload counters, read with [`Sysroot::stats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReloadStatsSnapshot {
    pub started: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub in_flight: usize,
    /// Highest number of loads ever observed running at once
    pub max_in_flight: usize,
}

struct Shared {
    registry: OsRegistry,
    snapshot: Arc<DeploymentSnapshot>,
    booted: String,
    store: Option<Arc<LoadedSysroot>>,
    scheduler: Scheduler,
    active_transaction_address: String,
}

#[derive(Default)]
struct Tasks {
    timer: Option<JoinHandle<()>>,
    reload: Option<JoinHandle<()>>,
    transactions: Option<JoinHandle<()>>,
}

/// Result of the lock-free half of a reload
struct LoadResult {
    names: BTreeSet<String>,
    store: LoadedSysroot,
    snapshot: DeploymentSnapshot,
}

pub struct Sysroot {
    root_path: PathBuf,
    store: Arc<dyn DeploymentStore>,
    factory: Arc<dyn OsServiceFactory>,
    options: SysrootOptions,
    runtime: Handle,
    cancel: CancellationToken,
    shut_down: AtomicBool,
    shared: RwLock<Shared>,
    tasks: Mutex<Tasks>,
    /// Signalled whenever the reload slot is released
    reload_done: Notify,
    watch: Mutex<Option<SysrootWatch>>,
    updated: broadcast::Sender<SysrootUpdated>,
    stats: ReloadStats,
    weak_self: Weak<Sysroot>,
}

impl Sysroot {
    /// Create the coordinator. Must be called from within a Tokio runtime.
    pub fn new(
        store: Arc<dyn DeploymentStore>,
        factory: Arc<dyn OsServiceFactory>,
        transactions: &Arc<TransactionMonitor>,
        options: SysrootOptions,
    ) -> Arc<Self> {
        let (updated, _) = broadcast::channel(16);
        let this = Arc::new_cyclic(|weak_self| Self {
            root_path: store.root().to_path_buf(),
            store,
            factory,
            runtime: Handle::current(),
            cancel: CancellationToken::new(),
            shut_down: AtomicBool::new(false),
            shared: RwLock::new(Shared {
                registry: OsRegistry::new(),
                snapshot: Arc::new(DeploymentSnapshot::default()),
                booted: ROOT_OBJECT_PATH.to_string(),
                store: None,
                scheduler: Scheduler::new(options.debounce),
                active_transaction_address: String::new(),
            }),
            options,
            tasks: Mutex::new(Tasks::default()),
            reload_done: Notify::new(),
            watch: Mutex::new(None),
            updated,
            stats: ReloadStats::default(),
            weak_self: weak_self.clone(),
        });
        this.bind_transactions(transactions);
        this
    }

    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    pub fn debounce(&self) -> Duration {
        self.options.debounce
    }

    fn read(&self) -> RwLockReadGuard<'_, Shared> {
        self.shared.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Shared> {
        self.shared.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn tasks(&self) -> MutexGuard<'_, Tasks> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ---------------------------------------------------------------------
    // Startup

    /// Load the store, reconcile once and start watching for changes.
    ///
    /// Any failure here is returned to the caller; only later background
    /// reloads are logged and retried. Shares the single reload slot with
    /// background reloads, waiting for a running one to finish first.
    pub async fn populate(&self) -> Result<()> {
        self.claim_reload_slot().await?;

        let result = match self.load_internals().await {
            Ok(_) if self.cancel.is_cancelled() => Err(SysrootError::Shutdown),
            Ok(loaded) => Ok(self.install(loaded)),
            Err(e) => Err(e),
        };

        // A failed populate goes back to the caller instead of being retried
        let outcome = if result.is_ok() {
            ReloadOutcome::Succeeded
        } else {
            ReloadOutcome::Cancelled
        };
        let action = self.write().scheduler.on_reload_finished(outcome);
        self.reload_done.notify_waiters();
        self.apply(action);

        let reconciliation = result?;
        log_sysroot_info!(
            "Sysroot populated",
            os_count = reconciliation.added.len(),
            generation = self.read().snapshot.generation,
        );

        if self.options.watch {
            self.establish_watch();
        }
        Ok(())
    }

    async fn claim_reload_slot(&self) -> Result<()> {
        loop {
            if self.cancel.is_cancelled() {
                return Err(SysrootError::Shutdown);
            }
            let released = self.reload_done.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            if self.write().scheduler.begin_load() {
                return Ok(());
            }
            log_sysroot_debug!("Waiting for the running reload to finish");
            tokio::select! {
                _ = &mut released => {}
                _ = self.cancel.cancelled() => return Err(SysrootError::Shutdown),
            }
        }
    }

    fn establish_watch(&self) {
        let mut watch = self.watch.lock().unwrap_or_else(PoisonError::into_inner);
        if watch.is_some() {
            return;
        }

        let paths = [self.store.repo_path(), self.store.deploy_path()];
        match SysrootWatch::start(&paths, self.weak_self.clone(), &self.runtime) {
            Ok(w) => *watch = Some(w),
            Err(e) => {
                log_sysroot_error!(
                    "Failed to watch deployment store; live updates disabled",
                    error = tracing::field::display(&e),
                );
            }
        }
    }

    fn bind_transactions(&self, monitor: &Arc<TransactionMonitor>) {
        let mut rx = monitor.subscribe();
        self.write().active_transaction_address = transaction_address(&rx.borrow_and_update());

        let weak = self.weak_self.clone();
        let cancel = self.cancel.clone();
        let handle = self.runtime.spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    changed = rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
                let address = transaction_address(&rx.borrow_and_update());
                match weak.upgrade() {
                    Some(this) => {
                        this.write().active_transaction_address = address;
                    }
                    None => break,
                }
            }
        });
        self.tasks().transactions = Some(handle);
    }

    // ---------------------------------------------------------------------
    // Reload

    /// Directory scan plus store load, off the request path and without the lock
    async fn load_internals(&self) -> Result<LoadResult> {
        let store = Arc::clone(&self.store);
        let cancel = self.cancel.clone();

        let in_flight = self.stats.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.stats.max_in_flight.fetch_max(in_flight, Ordering::SeqCst);

        let joined = tokio::task::spawn_blocking(move || -> Result<LoadResult> {
            let deploy = store.deploy_path();
            let names = scan_os_names(&deploy).map_err(|e| StoreError::io(&deploy, e))?;
            if cancel.is_cancelled() {
                return Err(StoreError::Cancelled.into());
            }
            let (store, snapshot) = load_snapshot(store.as_ref(), &cancel)?;
            Ok(LoadResult {
                names,
                store,
                snapshot,
            })
        })
        .await;

        self.stats.in_flight.fetch_sub(1, Ordering::SeqCst);
        joined.map_err(|e| SysrootError::Internal(format!("reload task failed: {}", e)))?
    }

    /// Publish a load result; reconciliation happens entirely under the writer lock
    fn install(&self, result: LoadResult) -> Reconciliation {
        let mut shared = self.write();
        let reconciliation = shared.registry.reconcile(&result.names, self.factory.as_ref());
        shared.booted = result.snapshot.booted_object_path();
        shared.snapshot = Arc::new(result.snapshot);
        shared.store = Some(Arc::new(result.store));

        if !reconciliation.is_noop() {
            log_sysroot_info!(
                "OS registry reconciled",
                added = reconciliation.added.len(),
                removed = reconciliation.removed.len(),
            );
        }
        reconciliation
    }

    /// Record a relevant filesystem change
    pub fn notify_changed(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        let action = self.write().scheduler.on_event(Instant::now());
        self.apply(action);
    }

    /// Run the quiescence check now instead of waiting for a timer
    pub fn trigger_refresh(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        let action = self.write().scheduler.check(Instant::now());
        self.apply(action);
    }

    fn on_timer_fired(&self) {
        let action = self.write().scheduler.on_timer(Instant::now());
        self.apply(action);
    }

    fn apply(&self, action: SchedulerAction) {
        if self.cancel.is_cancelled() {
            return;
        }
        match action {
            SchedulerAction::Idle => {}
            SchedulerAction::ArmTimer => self.arm_timer(),
            SchedulerAction::StartReload => self.spawn_reload(),
        }
    }

    fn arm_timer(&self) {
        let weak = self.weak_self.clone();
        let cancel = self.cancel.clone();
        let window = self.options.debounce;
        let handle = self.runtime.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(window) => {
                    if let Some(this) = weak.upgrade() {
                        this.on_timer_fired();
                    }
                }
            }
        });
        // The previous handle, if any, belongs to a timer that already fired
        self.tasks().timer = Some(handle);
    }

    fn spawn_reload(&self) {
        let Some(this) = self.weak_self.upgrade() else {
            return;
        };
        self.stats.started.fetch_add(1, Ordering::SeqCst);
        log_sysroot_debug!("Reloading sysroot data");

        let handle = self.runtime.spawn(async move {
            let result = match this.load_internals().await {
                Ok(loaded) if !this.cancel.is_cancelled() => {
                    this.install(loaded);
                    Ok(())
                }
                Ok(_) => Err(SysrootError::Shutdown),
                Err(e) => Err(e),
            };
            this.finish_reload(result);
        });
        self.tasks().reload = Some(handle);
    }

    fn finish_reload(&self, result: Result<()>) {
        let outcome = match &result {
            Ok(()) => ReloadOutcome::Succeeded,
            Err(e) if e.is_cancelled() => {
                log_sysroot_info!("Sysroot reload cancelled");
                ReloadOutcome::Cancelled
            }
            Err(e) => {
                log_sysroot_warn!(
                    "Error refreshing sysroot data",
                    error = tracing::field::display(e),
                );
                ReloadOutcome::Failed
            }
        };

        let (action, update) = {
            let mut shared = self.write();
            let action = shared.scheduler.on_reload_finished(outcome);
            let update = match (outcome, &shared.store) {
                (ReloadOutcome::Succeeded, Some(store)) => Some(SysrootUpdated {
                    generation: shared.snapshot.generation,
                    store: Arc::clone(store),
                    snapshot: Arc::clone(&shared.snapshot),
                }),
                _ => None,
            };
            (action, update)
        };
        self.reload_done.notify_waiters();

        match (outcome, update) {
            (ReloadOutcome::Succeeded, Some(update)) => {
                self.stats.succeeded.fetch_add(1, Ordering::SeqCst);
                // No subscribers is fine
                let _ = self.updated.send(update);
            }
            (ReloadOutcome::Failed, _) => {
                self.stats.failed.fetch_add(1, Ordering::SeqCst);
            }
            _ => {}
        }
        self.apply(action);
    }

    // ---------------------------------------------------------------------
    // Remote handlers

    /// `CreateOsName`: lay down the skeleton for `osname` and return its object path
    pub fn create_os_name(&self, osname: &str) -> Result<String> {
        if !is_valid_osname(osname) {
            return Err(SysrootError::InvalidName(osname.to_string()));
        }
        if self.cancel.is_cancelled() {
            return Err(SysrootError::Shutdown);
        }

        self.store.ensure_initialized()?;
        ensure_os_skeleton(&self.store.deploy_path().join(osname))?;
        log_sysroot_info!("Created OS name", osname = osname);

        let needs_refresh = self.read().scheduler.is_settled();
        if needs_refresh {
            self.trigger_refresh();
        }
        Ok(os_object_path(osname))
    }

    /// `GetOs`: object path of `name`, or of the booted OS when `name` is empty
    pub fn get_os(&self, name: &str) -> Result<String> {
        let shared = self.read();
        if name.is_empty() {
            return Ok(shared.booted.clone());
        }
        shared
            .registry
            .object_path(name)
            .map(str::to_string)
            .ok_or_else(|| SysrootError::NotFound(name.to_string()))
    }

    /// `Booted` property
    pub fn booted(&self) -> String {
        self.read().booted.clone()
    }

    /// `Deployments` property
    pub fn deployments(&self) -> Arc<DeploymentSnapshot> {
        Arc::clone(&self.read().snapshot)
    }

    /// `ActiveTransactionAddress` property
    pub fn active_transaction_address(&self) -> String {
        self.read().active_transaction_address.clone()
    }

    pub fn properties(&self) -> SysrootProperties {
        let shared = self.read();
        SysrootProperties {
            path: self.root_path.display().to_string(),
            booted: shared.booted.clone(),
            deployments: shared.snapshot.deployments.clone(),
            active_transaction_address: shared.active_transaction_address.clone(),
        }
    }

    /// Names currently in the OS registry
    pub fn os_names(&self) -> BTreeSet<String> {
        self.read().registry.names()
    }

    pub fn scheduler_state(&self) -> SchedulerState {
        self.read().scheduler.state()
    }

    /// Subscribe to the `updated` notification
    pub fn subscribe(&self) -> broadcast::Receiver<SysrootUpdated> {
        self.updated.subscribe()
    }

    pub fn stats(&self) -> ReloadStatsSnapshot {
        ReloadStatsSnapshot {
            started: self.stats.started.load(Ordering::SeqCst),
            succeeded: self.stats.succeeded.load(Ordering::SeqCst),
            failed: self.stats.failed.load(Ordering::SeqCst),
            in_flight: self.stats.in_flight.load(Ordering::SeqCst),
            max_in_flight: self.stats.max_in_flight.load(Ordering::SeqCst),
        }
    }

    pub fn is_watching(&self) -> bool {
        self.watch
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    // ---------------------------------------------------------------------
    // Teardown

    /// Cancel background work, stop the watch, dispose every OS object and
    /// release the store handle. Safe to call more than once.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();

        let watch = self
            .watch
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(watch) = watch {
            let drained = watch.stop().await;
            log_sysroot_debug!("Filesystem watch stopped", drained = drained);
        }

        let (timer, transactions) = {
            let mut tasks = self.tasks();
            (tasks.timer.take(), tasks.transactions.take())
        };
        for handle in [timer, transactions].into_iter().flatten() {
            handle.abort();
        }

        // A finishing reload may have queued one more before seeing the token
        loop {
            let reload = self.tasks().reload.take();
            match reload {
                Some(handle) => {
                    let _ = handle.await;
                }
                None => break,
            }
        }

        let disposed = {
            let mut shared = self.write();
            shared.store = None;
            shared.registry.shutdown_all()
        };
        log_sysroot_info!("Sysroot shut down", disposed = disposed);
    }
}

impl Drop for Sysroot {
    fn drop(&mut self) {
        self.cancel.cancel();
        let shared = self.shared.get_mut().unwrap_or_else(PoisonError::into_inner);
        shared.registry.shutdown_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::StubFactory;
    use crate::store::FsDeploymentStore;
    use crate::transaction::tests::RecordingTransaction;
    use rost_config::testing::TestEnvironment;

    fn sysroot_for(env: &TestEnvironment, monitor: &Arc<TransactionMonitor>) -> Arc<Sysroot> {
        let store = Arc::new(FsDeploymentStore::new(&env.sysroot, &env.cmdline_path));
        Sysroot::new(
            store,
            Arc::new(StubFactory),
            monitor,
            SysrootOptions {
                debounce: Duration::from_millis(100),
                watch: false,
            },
        )
    }

    #[tokio::test]
    async fn test_populate_empty_root() {
        let env = TestEnvironment::new().unwrap();
        let monitor = Arc::new(TransactionMonitor::new());
        let sysroot = sysroot_for(&env, &monitor);

        sysroot.populate().await.unwrap();
        assert!(sysroot.os_names().is_empty());
        assert!(sysroot.deployments().deployments.is_empty());
        assert_eq!(sysroot.booted(), "/");
        assert_eq!(sysroot.get_os("").unwrap(), "/");
        sysroot.shutdown().await;
    }

    #[tokio::test]
    async fn test_populate_uninitialized_fails() {
        let env = TestEnvironment::uninitialized().unwrap();
        let monitor = Arc::new(TransactionMonitor::new());
        let sysroot = sysroot_for(&env, &monitor);

        let err = sysroot.populate().await.unwrap_err();
        assert!(matches!(err, SysrootError::Store(_)));
    }

    #[tokio::test]
    async fn test_get_os_unknown_is_not_found() {
        let env = TestEnvironment::new().unwrap();
        env.create_os_dir("fedora").unwrap();
        let monitor = Arc::new(TransactionMonitor::new());
        let sysroot = sysroot_for(&env, &monitor);
        sysroot.populate().await.unwrap();

        assert_eq!(
            sysroot.get_os("fedora").unwrap(),
            "/org/projectatomic/rpmostree1/fedora"
        );
        assert!(matches!(
            sysroot.get_os("unknown"),
            Err(SysrootError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_booted_path_follows_snapshot() {
        let env = TestEnvironment::new().unwrap();
        let deployment = env.create_deployment("fedora", "abcd", 0, "r").unwrap();
        env.boot_into(&deployment).unwrap();
        let monitor = Arc::new(TransactionMonitor::new());
        let sysroot = sysroot_for(&env, &monitor);
        sysroot.populate().await.unwrap();

        assert_eq!(sysroot.booted(), "/org/projectatomic/rpmostree1/fedora");
        assert_eq!(sysroot.get_os("").unwrap(), sysroot.booted());
        let props = sysroot.properties();
        assert_eq!(props.deployments.len(), 1);
        assert!(props.deployments[0].booted);
    }

    #[tokio::test]
    async fn test_create_os_name_rejects_bad_names() {
        let env = TestEnvironment::uninitialized().unwrap();
        let monitor = Arc::new(TransactionMonitor::new());
        let sysroot = sysroot_for(&env, &monitor);

        for bad in ["a/b", "../x", "", "..", "x/"] {
            let err = sysroot.create_os_name(bad).unwrap_err();
            assert!(matches!(err, SysrootError::InvalidName(_)), "{:?}", bad);
        }
        // Validation happens before the store is touched
        assert!(!env.sysroot.join("ostree").exists());
    }

    #[tokio::test]
    async fn test_active_transaction_address_tracks_monitor() {
        let env = TestEnvironment::new().unwrap();
        let monitor = Arc::new(TransactionMonitor::new());
        monitor.set_active(RecordingTransaction::new(Some(":1.5")));
        let sysroot = sysroot_for(&env, &monitor);
        assert_eq!(sysroot.active_transaction_address(), ":1.5");

        monitor.clear();
        let cleared = tokio::time::timeout(Duration::from_secs(5), async {
            while !sysroot.active_transaction_address().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(cleared.is_ok());
        assert_eq!(sysroot.properties().active_transaction_address, "");
    }

    #[tokio::test]
    async fn test_shutdown_disposes_registry_and_is_idempotent() {
        let env = TestEnvironment::new().unwrap();
        env.create_os_dir("fedora").unwrap();
        env.create_os_dir("rhel").unwrap();
        let monitor = Arc::new(TransactionMonitor::new());
        let sysroot = sysroot_for(&env, &monitor);
        sysroot.populate().await.unwrap();
        assert_eq!(sysroot.os_names().len(), 2);

        sysroot.shutdown().await;
        sysroot.shutdown().await;
        assert!(sysroot.os_names().is_empty());
        assert!(matches!(
            sysroot.create_os_name("fedora"),
            Err(SysrootError::Shutdown)
        ));
        assert!(matches!(
            sysroot.populate().await,
            Err(SysrootError::Shutdown)
        ));
    }
}

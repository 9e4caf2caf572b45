//! Client/daemon round trips over the Unix socket

use std::sync::Arc;
use std::time::Duration;

use rost_config::testing::TestEnvironment;
use rost_ipc::client::SysrootClient;
use rost_ipc::ErrorKind;
use rost_sysrootd::commands::CommandHandler;
use rost_sysrootd::registry::StubFactory;
use rost_sysrootd::socket::run_listener;
use rost_sysrootd::store::FsDeploymentStore;
use rost_sysrootd::transaction::{Transaction, TransactionMonitor};
use rost_sysrootd::{Sysroot, SysrootOptions};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const DEADLINE: Duration = Duration::from_secs(10);

struct Daemon {
    sysroot: Arc<Sysroot>,
    monitor: Arc<TransactionMonitor>,
    cancel: CancellationToken,
    listener: JoinHandle<anyhow::Result<()>>,
}

impl Daemon {
    async fn start(env: &TestEnvironment) -> Self {
        let store = Arc::new(FsDeploymentStore::new(&env.sysroot, &env.cmdline_path));
        let monitor = Arc::new(TransactionMonitor::new());
        let sysroot = Sysroot::new(
            store,
            Arc::new(StubFactory),
            &monitor,
            SysrootOptions {
                debounce: Duration::from_millis(200),
                watch: false,
            },
        );
        sysroot.populate().await.unwrap();

        let cancel = CancellationToken::new();
        let handler = CommandHandler::new(Arc::clone(&sysroot));
        let socket_path = env.socket_path.clone();
        let listener_cancel = cancel.clone();
        let listener = tokio::spawn(async move {
            run_listener(&socket_path, handler, listener_cancel).await
        });

        Self {
            sysroot,
            monitor,
            cancel,
            listener,
        }
    }

    async fn stop(self) {
        self.cancel.cancel();
        self.sysroot.shutdown().await;
        let result = tokio::time::timeout(DEADLINE, self.listener).await;
        assert!(matches!(result, Ok(Ok(Ok(())))));
    }
}

async fn connect(env: &TestEnvironment) -> SysrootClient {
    tokio::time::timeout(DEADLINE, async {
        loop {
            if let Ok(client) = SysrootClient::connect(&env.socket_path).await {
                return client;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("daemon socket never came up")
}

struct ClientTransaction(&'static str);

impl Transaction for ClientTransaction {
    fn client_address(&self) -> Option<String> {
        Some(self.0.to_string())
    }

    fn emit_message(&self, _line: &str) {}
}

#[tokio::test]
async fn test_status_and_properties() {
    let env = TestEnvironment::new().unwrap();
    let daemon = Daemon::start(&env).await;
    let mut client = connect(&env).await;

    assert_eq!(client.status().await.unwrap(), "idle");

    let props = client.properties().await.unwrap();
    assert_eq!(props.path, env.sysroot.display().to_string());
    assert_eq!(props.booted, "/");
    assert!(props.deployments.is_empty());
    assert_eq!(props.active_transaction_address, "");

    daemon.stop().await;
}

#[tokio::test]
async fn test_create_then_get_os() {
    let env = TestEnvironment::new().unwrap();
    let daemon = Daemon::start(&env).await;
    let mut client = connect(&env).await;

    let path = client.create_os_name("fedora").await.unwrap();
    assert_eq!(path, "/org/projectatomic/rpmostree1/fedora");

    // Lookup succeeds once the triggered reload has been installed
    let found = tokio::time::timeout(DEADLINE, async {
        loop {
            if let Ok(found) = client.get_os("fedora").await {
                return found;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("OS never published");
    assert_eq!(found, path);

    assert_eq!(client.get_os("").await.unwrap(), "/");
    daemon.stop().await;
}

#[tokio::test]
async fn test_errors_cross_the_wire() {
    let env = TestEnvironment::new().unwrap();
    let daemon = Daemon::start(&env).await;
    let mut client = connect(&env).await;

    let err = client.create_os_name("../escape").await.unwrap_err();
    let remote = err.downcast_ref::<rost_ipc::RemoteError>().unwrap();
    assert_eq!(remote.kind, ErrorKind::InvalidName);

    let err = client.get_os("nope").await.unwrap_err();
    let remote = err.downcast_ref::<rost_ipc::RemoteError>().unwrap();
    assert_eq!(remote.kind, ErrorKind::NotFound);
    assert!(remote.message.contains("nope"));

    // The connection survives error replies
    assert_eq!(client.status().await.unwrap(), "idle");
    daemon.stop().await;
}

#[tokio::test]
async fn test_watch_updates_streams_reloads() {
    let env = TestEnvironment::new().unwrap();
    let daemon = Daemon::start(&env).await;

    let mut updates = connect(&env).await.watch_updates().await.unwrap();
    let mut client = connect(&env).await;
    client.create_os_name("rhel").await.unwrap();

    let (generation, booted) = tokio::time::timeout(DEADLINE, updates.next())
        .await
        .expect("no update streamed")
        .unwrap()
        .expect("stream ended");
    assert!(generation >= 2);
    assert_eq!(booted, "/");

    daemon.stop().await;
}

#[tokio::test]
async fn test_active_transaction_address_is_published() {
    let env = TestEnvironment::new().unwrap();
    let daemon = Daemon::start(&env).await;
    let mut client = connect(&env).await;

    daemon
        .monitor
        .set_active(Arc::new(ClientTransaction(":1.99")));
    let published = tokio::time::timeout(DEADLINE, async {
        loop {
            let props = client.properties().await.unwrap();
            if props.active_transaction_address == ":1.99" {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(published.is_ok());

    daemon.monitor.clear();
    let cleared = tokio::time::timeout(DEADLINE, async {
        loop {
            let props = client.properties().await.unwrap();
            if props.active_transaction_address.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(cleared.is_ok());

    daemon.stop().await;
}

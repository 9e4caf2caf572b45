//! Test environment abstraction for isolated testing.
//!
//! Provides `TestEnvironment` to manage:
//! - A temporary sysroot with the `ostree/repo` and `ostree/deploy` layout
//! - Isolated socket paths
//! - Helpers for creating OS directories and deployments out-of-band
//!
//! # Usage
//!
//! ```ignore
//! use rost_config::testing::TestEnvironment;
//!
//! #[tokio::test]
//! async fn test_something() {
//!     let env = TestEnvironment::new().unwrap();
//!     env.create_os_dir("fedora").unwrap();
//! }
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use tempfile::TempDir;

/// Atomic counter for unique test IDs
static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Isolated test environment with unique paths
pub struct TestEnvironment {
    /// Temporary directory (dropped on cleanup)
    _temp_dir: TempDir,
    /// Sysroot root (holds `ostree/`)
    pub sysroot: PathBuf,
    /// Unique socket path for this test
    pub socket_path: PathBuf,
    /// Kernel command line file for booted-deployment detection
    pub cmdline_path: PathBuf,
    /// Unique test ID
    pub test_id: u32,
}

impl TestEnvironment {
    /// Create a new isolated, initialized sysroot
    pub fn new() -> anyhow::Result<Self> {
        let env = Self::uninitialized()?;
        std::fs::create_dir_all(env.repo_dir())?;
        std::fs::create_dir_all(env.deploy_dir())?;
        Ok(env)
    }

    /// Create an environment whose sysroot has no `ostree/` tree yet
    pub fn uninitialized() -> anyhow::Result<Self> {
        let test_id = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path();

        let sysroot = root.join("sysroot");
        std::fs::create_dir_all(&sysroot)?;

        let cmdline_path = root.join("cmdline");
        std::fs::write(&cmdline_path, "root=/dev/vda1 rw\n")?;

        let socket_path = root.join(format!("rost-test-{}.sock", test_id));

        Ok(Self {
            _temp_dir: temp_dir,
            sysroot,
            socket_path,
            cmdline_path,
            test_id,
        })
    }

    /// `<sysroot>/ostree/repo`
    pub fn repo_dir(&self) -> PathBuf {
        self.sysroot.join("ostree").join("repo")
    }

    /// `<sysroot>/ostree/deploy`
    pub fn deploy_dir(&self) -> PathBuf {
        self.sysroot.join("ostree").join("deploy")
    }

    /// Create `<deploy>/<osname>` out-of-band
    pub fn create_os_dir(&self, osname: &str) -> anyhow::Result<PathBuf> {
        let path = self.deploy_dir().join(osname);
        std::fs::create_dir_all(&path)?;
        Ok(path)
    }

    /// Remove `<deploy>/<osname>` out-of-band
    pub fn remove_os_dir(&self, osname: &str) -> anyhow::Result<()> {
        std::fs::remove_dir_all(self.deploy_dir().join(osname))?;
        Ok(())
    }

    /// Create a deployment checkout `<deploy>/<osname>/deploy/<checksum>.<serial>`
    /// with an `.origin` file naming `refspec`.
    pub fn create_deployment(
        &self,
        osname: &str,
        checksum: &str,
        serial: u32,
        refspec: &str,
    ) -> anyhow::Result<PathBuf> {
        let deploy_root = self.create_os_dir(osname)?.join("deploy");
        let path = deploy_root.join(format!("{}.{}", checksum, serial));
        std::fs::create_dir_all(&path)?;
        std::fs::write(
            deploy_root.join(format!("{}.{}.origin", checksum, serial)),
            format!("[origin]\nrefspec={}\n", refspec),
        )?;
        Ok(path)
    }

    /// Point the kernel command line at `deployment` the way the bootloader does,
    /// through a `boot` symlink under the sysroot.
    pub fn boot_into(&self, deployment: &std::path::Path) -> anyhow::Result<()> {
        let boot_dir = self.sysroot.join("ostree").join("boot.1");
        std::fs::create_dir_all(&boot_dir)?;
        let link = boot_dir.join(format!("entry{}", self.test_id));
        if link.symlink_metadata().is_ok() {
            std::fs::remove_file(&link)?;
        }
        std::os::unix::fs::symlink(deployment, &link)?;
        let relative = link.strip_prefix(&self.sysroot)?;
        std::fs::write(
            &self.cmdline_path,
            format!("root=/dev/vda1 rw ostree=/{} quiet\n", relative.display()),
        )?;
        Ok(())
    }
}

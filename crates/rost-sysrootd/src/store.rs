//! Deployment store collaborator.
//!
//! The coordinator only ever queries the store through [`DeploymentStore`].
//! [`FsDeploymentStore`] reads the ostree on-disk layout directly:
//!
//! ```text
//! <root>/ostree/repo/
//! <root>/ostree/deploy/<osname>/deploy/<checksum>.<serial>/
//! <root>/ostree/deploy/<osname>/deploy/<checksum>.<serial>.origin
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::StoreError;

/// A deployment record as read from the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deployment {
    pub osname: String,
    pub checksum: String,
    pub serial: u32,
    /// Checkout directory of this deployment
    pub path: PathBuf,
    pub origin: Option<String>,
    pub version: Option<String>,
    pub timestamp: u64,
}

/// Result of one successful store load
#[derive(Debug, Clone, Default)]
pub struct LoadedSysroot {
    /// Increases by one on every successful load
    pub generation: u64,
    /// Deployments in the store's native order
    pub deployments: Vec<Deployment>,
    /// Index into `deployments` of the booted one
    pub booted: Option<usize>,
}

impl LoadedSysroot {
    pub fn booted_deployment(&self) -> Option<&Deployment> {
        self.booted.and_then(|idx| self.deployments.get(idx))
    }
}

pub trait DeploymentStore: Send + Sync {
    /// Root of the sysroot (the directory holding `ostree/`)
    fn root(&self) -> &Path;

    /// Create the store's directory skeleton if it does not exist yet
    fn ensure_initialized(&self) -> Result<(), StoreError>;

    /// Read all deployments; may observe `cancel` between I/O steps
    fn load(&self, cancel: &CancellationToken) -> Result<LoadedSysroot, StoreError>;

    fn repo_path(&self) -> PathBuf {
        self.root().join("ostree").join("repo")
    }

    /// Directory holding one subdirectory per OS name
    fn deploy_path(&self) -> PathBuf {
        self.root().join("ostree").join("deploy")
    }
}

/// Store backed by the ostree directory layout
#[derive(Debug)]
pub struct FsDeploymentStore {
    root: PathBuf,
    cmdline: PathBuf,
    generation: AtomicU64,
}

impl FsDeploymentStore {
    pub fn new(root: impl Into<PathBuf>, cmdline: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            cmdline: cmdline.into(),
            generation: AtomicU64::new(0),
        }
    }

    fn list_os_deployments(
        &self,
        osname: &str,
        os_dir: &Path,
    ) -> Result<Vec<Deployment>, StoreError> {
        let deploy_dir = os_dir.join("deploy");
        let entries = match fs::read_dir(&deploy_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(&deploy_dir, e)),
        };

        let mut deployments = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io(&deploy_dir, e))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some((checksum, serial)) = parse_deployment_name(&name) else {
                continue;
            };
            let path = entry.path();
            let metadata = match fs::metadata(&path) {
                Ok(m) if m.is_dir() => m,
                _ => continue,
            };
            let timestamp = metadata
                .modified()
                .ok()
                .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
                .map(|d| d.as_secs())
                .unwrap_or(0);

            deployments.push(Deployment {
                osname: osname.to_string(),
                checksum: checksum.to_string(),
                serial,
                origin: read_origin_refspec(&deploy_dir.join(format!("{}.origin", name))),
                version: read_os_release_version(&path),
                path,
                timestamp,
            });
        }
        Ok(deployments)
    }

    /// Resolve the `ostree=` kernel argument to a deployment index
    fn find_booted(&self, deployments: &[Deployment]) -> Option<usize> {
        let cmdline = fs::read_to_string(&self.cmdline).ok()?;
        let target = cmdline
            .split_whitespace()
            .find_map(|arg| arg.strip_prefix("ostree="))?;
        let resolved = self
            .root
            .join(target.trim_start_matches('/'))
            .canonicalize()
            .ok()?;
        deployments
            .iter()
            .position(|d| d.path.canonicalize().map(|p| p == resolved).unwrap_or(false))
    }
}

impl DeploymentStore for FsDeploymentStore {
    fn root(&self) -> &Path {
        &self.root
    }

    fn ensure_initialized(&self) -> Result<(), StoreError> {
        for dir in [self.repo_path(), self.deploy_path()] {
            fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;
        }
        Ok(())
    }

    fn load(&self, cancel: &CancellationToken) -> Result<LoadedSysroot, StoreError> {
        let repo = self.repo_path();
        let deploy = self.deploy_path();
        if !repo.is_dir() {
            return Err(StoreError::Unavailable(format!(
                "no repository at {}",
                repo.display()
            )));
        }

        let entries = fs::read_dir(&deploy).map_err(|e| {
            StoreError::Unavailable(format!("cannot read {}: {}", deploy.display(), e))
        })?;
        let mut os_dirs = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io(&deploy, e))?;
            if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                os_dirs.push((
                    entry.file_name().to_string_lossy().into_owned(),
                    entry.path(),
                ));
            }
        }
        os_dirs.sort();

        let mut deployments = Vec::new();
        for (osname, os_dir) in &os_dirs {
            if cancel.is_cancelled() {
                return Err(StoreError::Cancelled);
            }
            deployments.extend(self.list_os_deployments(osname, os_dir)?);
        }

        // Newest first
        deployments.sort_by(|a, b| {
            b.timestamp
                .cmp(&a.timestamp)
                .then(b.serial.cmp(&a.serial))
                .then(a.osname.cmp(&b.osname))
        });

        let booted = self.find_booted(&deployments);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(
            generation,
            count = deployments.len(),
            booted = ?booted,
            "Deployment store loaded"
        );

        Ok(LoadedSysroot {
            generation,
            deployments,
            booted,
        })
    }
}

/// `<checksum>.<serial>` → `(checksum, serial)`
fn parse_deployment_name(name: &str) -> Option<(&str, u32)> {
    let (checksum, serial) = name.rsplit_once('.')?;
    if checksum.is_empty() {
        return None;
    }
    Some((checksum, serial.parse().ok()?))
}

fn read_origin_refspec(path: &Path) -> Option<String> {
    let contents = fs::read_to_string(path).ok()?;
    contents
        .lines()
        .find_map(|line| line.trim().strip_prefix("refspec="))
        .map(|s| s.trim().to_string())
}

fn read_os_release_version(deployment: &Path) -> Option<String> {
    let contents = fs::read_to_string(deployment.join("usr/lib/os-release")).ok()?;
    contents
        .lines()
        .find_map(|line| line.strip_prefix("VERSION="))
        .map(|v| v.trim_matches('"').to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rost_config::testing::TestEnvironment;

    fn store_for(env: &TestEnvironment) -> FsDeploymentStore {
        FsDeploymentStore::new(&env.sysroot, &env.cmdline_path)
    }

    #[test]
    fn test_parse_deployment_name() {
        assert_eq!(parse_deployment_name("abc123.0"), Some(("abc123", 0)));
        assert_eq!(parse_deployment_name("abc.def.7"), Some(("abc.def", 7)));
        assert_eq!(parse_deployment_name("abc123.origin"), None);
        assert_eq!(parse_deployment_name(".3"), None);
        assert_eq!(parse_deployment_name("nodot"), None);
    }

    #[test]
    fn test_load_uninitialized_is_unavailable() {
        let env = TestEnvironment::uninitialized().unwrap();
        let store = store_for(&env);
        let err = store.load(&CancellationToken::new()).unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
    }

    #[test]
    fn test_ensure_initialized_is_idempotent() {
        let env = TestEnvironment::uninitialized().unwrap();
        let store = store_for(&env);
        store.ensure_initialized().unwrap();
        store.ensure_initialized().unwrap();
        assert!(env.repo_dir().is_dir());
        assert!(env.deploy_dir().is_dir());
    }

    #[test]
    fn test_load_reads_deployments_and_origin() {
        let env = TestEnvironment::new().unwrap();
        let path = env
            .create_deployment("fedora", "aaaa", 0, "fedora:fedora/x86_64")
            .unwrap();
        fs::create_dir_all(path.join("usr/lib")).unwrap();
        fs::write(
            path.join("usr/lib/os-release"),
            "NAME=Fedora\nVERSION=\"40 (Atomic)\"\n",
        )
        .unwrap();
        env.create_os_dir("empty").unwrap();

        let loaded = store_for(&env).load(&CancellationToken::new()).unwrap();
        assert_eq!(loaded.generation, 1);
        assert_eq!(loaded.deployments.len(), 1);
        let d = &loaded.deployments[0];
        assert_eq!(d.osname, "fedora");
        assert_eq!(d.checksum, "aaaa");
        assert_eq!(d.origin.as_deref(), Some("fedora:fedora/x86_64"));
        assert_eq!(d.version.as_deref(), Some("40 (Atomic)"));
        assert!(loaded.booted.is_none());
    }

    #[test]
    fn test_generation_increments() {
        let env = TestEnvironment::new().unwrap();
        let store = store_for(&env);
        let token = CancellationToken::new();
        assert_eq!(store.load(&token).unwrap().generation, 1);
        assert_eq!(store.load(&token).unwrap().generation, 2);
    }

    #[test]
    fn test_booted_from_cmdline() {
        let env = TestEnvironment::new().unwrap();
        env.create_deployment("fedora", "aaaa", 0, "r").unwrap();
        let booted = env.create_deployment("fedora", "bbbb", 1, "r").unwrap();
        env.boot_into(&booted).unwrap();

        let loaded = store_for(&env).load(&CancellationToken::new()).unwrap();
        let d = loaded.booted_deployment().expect("booted deployment");
        assert_eq!(d.checksum, "bbbb");
        assert_eq!(d.serial, 1);
    }

    #[test]
    fn test_cancelled_load() {
        let env = TestEnvironment::new().unwrap();
        env.create_os_dir("fedora").unwrap();
        let token = CancellationToken::new();
        token.cancel();
        let err = store_for(&env).load(&token).unwrap_err();
        assert!(matches!(err, StoreError::Cancelled));
    }
}

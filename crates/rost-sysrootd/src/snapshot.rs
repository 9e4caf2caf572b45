//! Deployment snapshot builder

use rost_ipc::{DeploymentInfo, ROOT_OBJECT_PATH};
use tokio_util::sync::CancellationToken;

use crate::error::StoreError;
use crate::object_path::os_object_path;
use crate::store::{Deployment, DeploymentStore, LoadedSysroot};

/// Complete view of the deployments at one point in time.
/// Replaced wholesale, never edited.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeploymentSnapshot {
    pub generation: u64,
    pub deployments: Vec<DeploymentInfo>,
    pub booted: Option<usize>,
}

impl DeploymentSnapshot {
    pub fn booted(&self) -> Option<&DeploymentInfo> {
        self.booted.and_then(|idx| self.deployments.get(idx))
    }

    /// Object path of the booted OS, or `/` when nothing is booted
    pub fn booted_object_path(&self) -> String {
        match self.booted() {
            Some(d) => os_object_path(&d.osname),
            None => ROOT_OBJECT_PATH.to_string(),
        }
    }
}

/// Stable identifier of a deployment
pub fn deployment_id(deployment: &Deployment) -> String {
    let short: String = deployment.checksum.chars().take(12).collect();
    format!("{}_{}_{}", deployment.osname, short, deployment.serial)
}

/// Build descriptors from a loaded store. Keeps the store's ordering.
pub fn build_snapshot(loaded: &LoadedSysroot) -> DeploymentSnapshot {
    let deployments = loaded
        .deployments
        .iter()
        .enumerate()
        .map(|(idx, d)| DeploymentInfo {
            id: deployment_id(d),
            osname: d.osname.clone(),
            serial: d.serial,
            checksum: d.checksum.clone(),
            version: d.version.clone(),
            timestamp: d.timestamp,
            origin: d.origin.clone(),
            booted: loaded.booted == Some(idx),
        })
        .collect();

    DeploymentSnapshot {
        generation: loaded.generation,
        deployments,
        booted: loaded.booted,
    }
}

/// Load the store and build its snapshot in one step
pub fn load_snapshot(
    store: &dyn DeploymentStore,
    cancel: &CancellationToken,
) -> Result<(LoadedSysroot, DeploymentSnapshot), StoreError> {
    let loaded = store.load(cancel)?;
    let snapshot = build_snapshot(&loaded);
    Ok((loaded, snapshot))
}

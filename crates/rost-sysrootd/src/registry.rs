//! OS registry: one published service object per OS name directory

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::Path;

use tracing::debug;

use crate::object_path::os_object_path;

/// Per-OS service object. The registry owns it exclusively.
pub trait OsService: Send + Sync {
    fn name(&self) -> &str;

    fn object_path(&self) -> &str;

    /// Release resources and unpublish. Called exactly once, before removal.
    fn shutdown(&mut self);
}

pub trait OsServiceFactory: Send + Sync {
    fn create(&self, osname: &str) -> Box<dyn OsService>;
}

/// Minimal OS object: publishes its path, unpublishes on shutdown
#[derive(Debug)]
pub struct OsStub {
    name: String,
    object_path: String,
    published: bool,
}

impl OsStub {
    pub fn new(name: &str) -> Self {
        let object_path = os_object_path(name);
        debug!(osname = %name, path = %object_path, "Publishing OS object");
        Self {
            name: name.to_string(),
            object_path,
            published: true,
        }
    }

    pub fn is_published(&self) -> bool {
        self.published
    }
}

impl OsService for OsStub {
    fn name(&self) -> &str {
        &self.name
    }

    fn object_path(&self) -> &str {
        &self.object_path
    }

    fn shutdown(&mut self) {
        if self.published {
            debug!(osname = %self.name, path = %self.object_path, "Unpublishing OS object");
            self.published = false;
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct StubFactory;

impl OsServiceFactory for StubFactory {
    fn create(&self, osname: &str) -> Box<dyn OsService> {
        Box::new(OsStub::new(osname))
    }
}

/// Outcome of one reconciliation pass
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Reconciliation {
    pub added: BTreeSet<String>,
    pub removed: BTreeSet<String>,
}

impl Reconciliation {
    pub fn is_noop(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Mapping from OS name to its service object
#[derive(Default)]
pub struct OsRegistry {
    entries: HashMap<String, Box<dyn OsService>>,
}

impl fmt::Debug for OsRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OsRegistry")
            .field("names", &self.names())
            .finish()
    }
}

impl OsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, osname: &str) -> bool {
        self.entries.contains_key(osname)
    }

    pub fn object_path(&self, osname: &str) -> Option<&str> {
        self.entries.get(osname).map(|svc| svc.object_path())
    }

    pub fn names(&self) -> BTreeSet<String> {
        self.entries.keys().cloned().collect()
    }

    /// Make the registry's keys equal `listing`.
    ///
    /// New names get a fresh service from `factory`; vanished names are shut
    /// down and dropped. Names present on both sides are left untouched.
    pub fn reconcile(
        &mut self,
        listing: &BTreeSet<String>,
        factory: &dyn OsServiceFactory,
    ) -> Reconciliation {
        let mut result = Reconciliation::default();

        for name in listing {
            if !is_valid_osname(name) || self.entries.contains_key(name) {
                continue;
            }
            self.entries.insert(name.clone(), factory.create(name));
            result.added.insert(name.clone());
        }

        let vanished: Vec<String> = self
            .entries
            .keys()
            .filter(|name| !listing.contains(*name))
            .cloned()
            .collect();
        for name in vanished {
            if let Some(mut svc) = self.entries.remove(&name) {
                svc.shutdown();
            }
            result.removed.insert(name);
        }

        result
    }

    /// Shut down and drop every entry; returns how many were disposed
    pub fn shutdown_all(&mut self) -> usize {
        let count = self.entries.len();
        for (_, mut svc) in self.entries.drain() {
            svc.shutdown();
        }
        count
    }
}

/// A valid OS name is a single, non-empty path component
pub fn is_valid_osname(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && Path::new(name).file_name().and_then(|n| n.to_str()) == Some(name)
}

/// Names of the subdirectories directly under `deploy_path`
pub fn scan_os_names(deploy_path: &Path) -> std::io::Result<BTreeSet<String>> {
    let mut names = BTreeSet::new();
    for entry in std::fs::read_dir(deploy_path)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            if is_valid_osname(name) {
                names.insert(name.to_string());
            }
        }
    }
    Ok(names)
}

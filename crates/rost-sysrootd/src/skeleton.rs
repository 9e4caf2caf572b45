//! On-disk skeleton of a new OS name.
//!
//! ```text
//! <deploy>/<osname>/var/tmp    (dir, 01777)
//! <deploy>/<osname>/var/lib    (dir)
//! <deploy>/<osname>/var/run  -> ../run
//! <deploy>/<osname>/var/lock -> ../run/lock
//! ```
//!
//! Every step is idempotent on its own; a failure leaves earlier steps in place.

use std::fs;
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::Path;

use crate::error::{Result, SysrootError};

/// Mode of `var/tmp`: world-writable with the sticky bit
pub const VAR_TMP_MODE: u32 = 0o1777;

pub fn ensure_os_skeleton(os_dir: &Path) -> Result<()> {
    let var = os_dir.join("var");

    let tmp = var.join("tmp");
    ensure_dir(&tmp)?;
    fs::set_permissions(&tmp, fs::Permissions::from_mode(VAR_TMP_MODE))
        .map_err(|e| SysrootError::io(&tmp, e))?;

    ensure_dir(&var.join("lib"))?;

    ensure_symlink(&var.join("run"), "../run")?;
    ensure_symlink(&var.join("lock"), "../run/lock")?;
    Ok(())
}

fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).map_err(|e| SysrootError::io(path, e))
}

/// Create `link -> target` unless a symlink is already there
fn ensure_symlink(link: &Path, target: &str) -> Result<()> {
    let is_symlink = fs::symlink_metadata(link)
        .map(|m| m.file_type().is_symlink())
        .unwrap_or(false);
    if is_symlink {
        return Ok(());
    }
    symlink(target, link).map_err(|e| SysrootError::io(link, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_skeleton_layout() {
        let temp = tempfile::tempdir().unwrap();
        let os_dir = temp.path().join("fedora");
        ensure_os_skeleton(&os_dir).unwrap();

        let tmp = os_dir.join("var/tmp");
        assert!(tmp.is_dir());
        let mode = fs::metadata(&tmp).unwrap().permissions().mode() & 0o7777;
        assert_eq!(mode, VAR_TMP_MODE);
        assert!(os_dir.join("var/lib").is_dir());
        assert_eq!(
            fs::read_link(os_dir.join("var/run")).unwrap(),
            PathBuf::from("../run")
        );
        assert_eq!(
            fs::read_link(os_dir.join("var/lock")).unwrap(),
            PathBuf::from("../run/lock")
        );
    }

    #[test]
    fn test_skeleton_is_idempotent() {
        let temp = tempfile::tempdir().unwrap();
        let os_dir = temp.path().join("fedora");
        ensure_os_skeleton(&os_dir).unwrap();
        ensure_os_skeleton(&os_dir).unwrap();

        let mut names: Vec<_> = fs::read_dir(os_dir.join("var"))
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        names.sort();
        assert_eq!(names, ["lib", "lock", "run", "tmp"]);
    }

    #[test]
    fn test_existing_non_symlink_is_an_error() {
        let temp = tempfile::tempdir().unwrap();
        let os_dir = temp.path().join("fedora");
        fs::create_dir_all(os_dir.join("var/run")).unwrap();

        let err = ensure_os_skeleton(&os_dir).unwrap_err();
        assert!(matches!(err, SysrootError::Io { .. }));
        // Earlier steps stay in place
        assert!(os_dir.join("var/tmp").is_dir());
        assert!(os_dir.join("var/lib").is_dir());
    }
}

//! Tree cleaning and mount recovery.

use crate::error::Error;
use crate::logs::BuildLog;
use crate::paths::Layout;
use crate::run::{run, RunOptions};

/// Remove all built packages and their recorded state, recreating the
/// empty directories.
pub fn clean_packages(layout: &Layout) -> Result<(), Error> {
    for dir in [layout.hash_dir(), layout.pkg_dir()] {
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir)?;
    }
    Ok(())
}

/// Remove the scratch trees invalidated by an epoch change.
pub fn clean_temporary_trees(layout: &Layout) -> Result<(), Error> {
    clean_mounts(layout);
    let _ = std::fs::remove_dir_all(layout.tmp_dir());
    Ok(())
}

/// Remove everything a build produced: logs, sources and the tmp tree.
pub fn complete_cleanup(layout: &Layout) -> Result<(), Error> {
    clean_mounts(layout);
    for dir in [layout.log_dir(), layout.sources_dir(), layout.tmp_dir()] {
        let _ = std::fs::remove_dir_all(dir);
    }
    Ok(())
}

/// Best-effort unmount of every mountpoint the builder may have left
/// behind. Runs at process start and on abnormal exit; failures are
/// ignored because most targets are usually not mounted.
pub fn clean_mounts(layout: &Layout) {
    let log = BuildLog::null();
    let no_check = RunOptions {
        no_check: true,
        quiet: true,
        ..Default::default()
    };

    // Per-source overlays: directory names embed the source name, so a
    // directory scan finds whatever a crashed run left around.
    if let Ok(entries) = std::fs::read_dir(layout.tmp_dir()) {
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with("dpkg-overlay_") {
                let path = entry.path();
                for sub in ["proc", "sys", "packages", "mnt/shared", "dpkg-src"] {
                    let _ = run(
                        &["umount", "-f", &path.join(sub).to_string_lossy()],
                        &no_check,
                        &log,
                    );
                }
                let _ = run(&["umount", "-R", "-f", &path.to_string_lossy()], &no_check, &log);
                let _ = std::fs::remove_dir_all(&path);
            } else if name.starts_with("tmpfs_") || name.starts_with("sources_") {
                let path = entry.path();
                let _ = run(&["umount", "-R", "-f", &path.to_string_lossy()], &no_check, &log);
                let _ = std::fs::remove_dir_all(&path);
            }
        }
    }

    // The shared image-phase chroot and its binds.
    let chroot = layout.chroot_basedir();
    for sub in ["packages", "proc", "sys"] {
        let _ = run(
            &["umount", "-f", &chroot.join(sub).to_string_lossy()],
            &no_check,
            &log,
        );
    }
    let _ = run(&["umount", "-R", "-f", &chroot.to_string_lossy()], &no_check, &log);
    let _ = std::fs::remove_dir_all(&chroot);
    let _ = run(
        &["umount", "-f", &layout.tmpfs().to_string_lossy()],
        &no_check,
        &log,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_packages_recreates_empty_dirs() {
        let td = tempfile::tempdir().unwrap();
        let layout = Layout::new(td.path());
        layout.setup_dirs().unwrap();
        std::fs::write(layout.pkg_dir().join("a.deb"), b"x").unwrap();
        std::fs::write(layout.hash_dir().join("a.hash"), b"x").unwrap();
        clean_packages(&layout).unwrap();
        assert!(layout.pkg_dir().exists());
        assert!(layout.hash_dir().exists());
        assert_eq!(std::fs::read_dir(layout.pkg_dir()).unwrap().count(), 0);
        assert_eq!(std::fs::read_dir(layout.hash_dir()).unwrap().count(), 0);
    }

    #[test]
    fn test_complete_cleanup_removes_trees() {
        let td = tempfile::tempdir().unwrap();
        let layout = Layout::new(td.path());
        layout.setup_dirs().unwrap();
        complete_cleanup(&layout).unwrap();
        assert!(!layout.tmp_dir().exists());
        assert!(!layout.log_dir().exists());
        assert!(!layout.sources_dir().exists());
    }
}

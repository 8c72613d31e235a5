//! Per-source ephemeral build workspaces.
//!
//! Every build gets its own overlayfs stack: the cached base chroot as
//! the read-only lower layer, a tmpfs-backed upper layer, and bind
//! mounts for the source tree, the shared package directory and the host
//! key folder. Directory names embed the source name so concurrent
//! builds never touch each other's mounts.
//!
//! Teardown runs in strict reverse order with `umount -f` best-effort,
//! and fires from [`Drop`] as well so an aborted build never leaves
//! mounts behind.

use crate::error::Error;
use crate::logs::BuildLog;
use crate::package::SourcePackage;
use crate::paths::Layout;
use crate::run::{run, RunOptions};
use std::path::PathBuf;

/// Host folder bind-mounted into each build at `/mnt/shared` for signing
/// keys.
pub const HOST_SHARED_FOLDER: &str = "/etc/keys";

/// ccache directory inside the chroot.
pub const CCACHE_IN_CHROOT: &str = "root/.ccache";

/// A mounted (or mountable) per-source workspace.
pub struct Overlay {
    name: String,
    tmp_dir: PathBuf,
    ccache_dir: PathBuf,
    use_tmpfs: bool,
    tmpfs_size: u64,
    ccache: bool,
    torn_down: bool,
}

impl Overlay {
    /// Describe the workspace for `pkg`; nothing is mounted yet.
    pub fn new(layout: &Layout, pkg: &SourcePackage, ccache: bool) -> Overlay {
        Overlay {
            name: pkg.name.clone(),
            tmp_dir: layout.tmp_dir(),
            ccache_dir: layout.ccache_dir(),
            use_tmpfs: pkg.tmpfs,
            tmpfs_size: pkg.tmpfs_size,
            ccache,
            torn_down: false,
        }
    }

    /// tmpfs mountpoint backing the chroot copy and the upper layer.
    pub fn tmpfs_path(&self) -> PathBuf {
        self.tmp_dir.join(format!("tmpfs_{}", self.name))
    }

    /// Where the base chroot is restored.
    pub fn chroot_base(&self) -> PathBuf {
        self.tmpfs_path().join(format!("chroot_{}", self.name))
    }

    /// overlayfs upperdir.
    pub fn chroot_overlay(&self) -> PathBuf {
        self.tmpfs_path().join(format!("chroot-overlay_{}", self.name))
    }

    /// overlayfs workdir.
    pub fn workdir_overlay(&self) -> PathBuf {
        self.tmpfs_path().join(format!("workdir-overlay_{}", self.name))
    }

    /// The merged view; the effective chroot root for the build.
    pub fn dpkg_overlay(&self) -> PathBuf {
        self.tmp_dir.join(format!("dpkg-overlay_{}", self.name))
    }

    /// Staging copy of the source tree, bind-mounted over `dpkg-src`.
    pub fn sources_overlay(&self) -> PathBuf {
        self.tmp_dir.join(format!("sources_{}", self.name))
    }

    /// The source tree as seen through the merged view.
    pub fn source_in_chroot(&self) -> PathBuf {
        self.dpkg_overlay().join("dpkg-src")
    }

    /// The shared package directory as seen through the merged view.
    pub fn packages_path(&self) -> PathBuf {
        self.dpkg_overlay().join("packages")
    }

    /// The shared host key folder as seen through the merged view.
    pub fn shared_path(&self) -> PathBuf {
        self.dpkg_overlay().join("mnt/shared")
    }

    /// The ccache directory as seen through the merged view.
    pub fn ccache_path(&self) -> PathBuf {
        self.dpkg_overlay().join(CCACHE_IN_CHROOT)
    }

    /// Mount the tmpfs (when enabled) and create the workspace root.
    pub fn mount_tmpfs(&self, log: &BuildLog) -> Result<(), Error> {
        std::fs::create_dir_all(self.tmpfs_path())?;
        if self.use_tmpfs {
            let size = format!("size={}G", self.tmpfs_size);
            run(
                &[
                    "mount",
                    "-t",
                    "tmpfs",
                    "-o",
                    &size,
                    "tmpfs",
                    &self.tmpfs_path().to_string_lossy(),
                ],
                &RunOptions::default(),
                log,
            )?;
        }
        Ok(())
    }

    /// Mount the overlay stack over the restored base chroot.
    pub fn mount(&self, pkg_dir: &std::path::Path, log: &BuildLog) -> Result<(), Error> {
        for dir in [
            self.chroot_overlay(),
            self.workdir_overlay(),
            self.dpkg_overlay(),
            self.sources_overlay(),
        ] {
            std::fs::create_dir_all(dir)?;
        }

        let overlay_opts = format!(
            "lowerdir={},upperdir={},workdir={}",
            self.chroot_base().display(),
            self.chroot_overlay().display(),
            self.workdir_overlay().display()
        );
        run(
            &[
                "mount",
                "-t",
                "overlay",
                "-o",
                &overlay_opts,
                "none",
                &self.dpkg_overlay().to_string_lossy(),
            ],
            &RunOptions::default(),
            log,
        )?;
        run(
            &[
                "mount",
                "proc",
                &self.dpkg_overlay().join("proc").to_string_lossy(),
                "-t",
                "proc",
            ],
            &RunOptions::default(),
            log,
        )?;
        run(
            &[
                "mount",
                "sysfs",
                &self.dpkg_overlay().join("sys").to_string_lossy(),
                "-t",
                "sysfs",
            ],
            &RunOptions::default(),
            log,
        )?;

        std::fs::create_dir_all(self.source_in_chroot())?;
        run(
            &[
                "mount",
                "--bind",
                &self.sources_overlay().to_string_lossy(),
                &self.source_in_chroot().to_string_lossy(),
            ],
            &RunOptions::default(),
            log,
        )?;

        std::fs::create_dir_all(self.packages_path())?;
        run(
            &[
                "mount",
                "--bind",
                &pkg_dir.to_string_lossy(),
                &self.packages_path().to_string_lossy(),
            ],
            &RunOptions::default(),
            log,
        )?;

        if std::path::Path::new(HOST_SHARED_FOLDER).exists() {
            std::fs::create_dir_all(self.shared_path())?;
            run(
                &[
                    "mount",
                    "--bind",
                    HOST_SHARED_FOLDER,
                    &self.shared_path().to_string_lossy(),
                ],
                &RunOptions::default(),
                log,
            )?;
        }

        if self.ccache {
            std::fs::create_dir_all(&self.ccache_dir)?;
            std::fs::create_dir_all(self.ccache_path())?;
            run(
                &[
                    "mount",
                    "--bind",
                    &self.ccache_dir.to_string_lossy(),
                    &self.ccache_path().to_string_lossy(),
                ],
                &RunOptions::default(),
                log,
            )?;
        }

        Ok(())
    }

    /// Unmount everything in reverse order and remove the workspace.
    /// Failures are logged by the unmount commands but never raised so
    /// teardown cannot mask the primary error.
    pub fn teardown(&mut self, log: &BuildLog) {
        let no_check = RunOptions {
            no_check: true,
            ..Default::default()
        };
        let dpkg_overlay = self.dpkg_overlay();
        let mut targets = vec![self.ccache_path(), self.shared_path(), self.source_in_chroot()];
        targets.push(self.packages_path());
        targets.push(dpkg_overlay.join("proc"));
        targets.push(dpkg_overlay.join("sys"));
        targets.push(dpkg_overlay.clone());
        for target in &targets {
            let _ = run(
                &["umount", "-f", &target.to_string_lossy()],
                &no_check,
                log,
            );
        }
        let _ = run(
            &["umount", "-R", "-f", &dpkg_overlay.to_string_lossy()],
            &no_check,
            log,
        );
        let _ = run(
            &["umount", "-R", "-f", &self.tmpfs_path().to_string_lossy()],
            &no_check,
            log,
        );

        for dir in [
            self.chroot_overlay(),
            self.workdir_overlay(),
            self.chroot_base(),
            self.sources_overlay(),
            dpkg_overlay,
            self.tmpfs_path(),
        ] {
            let _ = std::fs::remove_dir_all(dir);
        }
        self.torn_down = true;
    }
}

impl Drop for Overlay {
    fn drop(&mut self) {
        if !self.torn_down {
            self.teardown(&BuildLog::null());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::Manifest;
    use crate::package::SourcePackage;

    fn sample_package() -> SourcePackage {
        let manifest: Manifest = serde_yaml::from_str(
            r#"
code_name: Angelfish
debian_release: bullseye
apt-repos:
  url: https://apt.example.org/debian
  distribution: bullseye
  components: main
build-epoch: 1
sources:
  - name: openzfs
    repo: https://github.com/truenas/zfs
    branch: truenas/zfs-2.1-release
"#,
        )
        .unwrap();
        SourcePackage::from_manifest(&manifest).remove(0)
    }

    #[test]
    fn test_overlay_paths_embed_source_name() {
        let layout = Layout::new("/build");
        let overlay = Overlay::new(&layout, &sample_package(), false);
        assert_eq!(
            overlay.dpkg_overlay(),
            std::path::Path::new("/build/tmp/dpkg-overlay_openzfs")
        );
        assert_eq!(
            overlay.chroot_base(),
            std::path::Path::new("/build/tmp/tmpfs_openzfs/chroot_openzfs")
        );
        assert_eq!(
            overlay.workdir_overlay(),
            std::path::Path::new("/build/tmp/tmpfs_openzfs/workdir-overlay_openzfs")
        );
        assert_eq!(
            overlay.source_in_chroot(),
            std::path::Path::new("/build/tmp/dpkg-overlay_openzfs/dpkg-src")
        );
    }
}

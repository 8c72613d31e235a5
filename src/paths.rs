//! Builder directory layout.
//!
//! Every path the builder touches is derived from a single root, so the
//! whole tree can be relocated by changing one value. Directories are
//! only created at scheduler setup time, never as a side effect of path
//! computation.

use std::path::{Path, PathBuf};

/// Reference files whose uid/gid assignments are pinned across builds.
pub const REFERENCE_FILES: &[&str] = &["etc/passwd", "etc/group"];

/// Resolved builder paths.
#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    /// Create a layout rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Layout {
        Layout { root: root.into() }
    }

    /// The builder root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `conf/` directory with manifests and static build inputs.
    pub fn conf_dir(&self) -> PathBuf {
        self.root.join("conf")
    }

    /// The build manifest.
    pub fn manifest_path(&self) -> PathBuf {
        self.conf_dir().join("build.manifest")
    }

    /// Immutable reference `etc/passwd` and `etc/group`.
    pub fn reference_files_dir(&self) -> PathBuf {
        self.conf_dir().join("reference-files")
    }

    /// Files copied over the CD chroot before ISO assembly.
    pub fn cd_files_dir(&self) -> PathBuf {
        self.conf_dir().join("cd-files")
    }

    /// grub configuration installed into the ISO.
    pub fn grub_config_path(&self) -> PathBuf {
        self.conf_dir().join("grub.cfg")
    }

    /// Trusted apt key added to the host keyring before debootstrap.
    pub fn apt_key_path(&self) -> PathBuf {
        self.root.join("keys/truenas.gpg")
    }

    /// The offline installer payload shipped inside update files.
    pub fn installer_dir(&self) -> PathBuf {
        self.root.join("truenas_install")
    }

    /// Top-level log directory.
    pub fn log_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    /// Per-source git checkout logs.
    pub fn git_log_dir(&self) -> PathBuf {
        self.log_dir().join("git")
    }

    /// Per-source package build logs.
    pub fn pkg_log_dir(&self) -> PathBuf {
        self.log_dir().join("packages")
    }

    /// `<url> <short-sha>` lines for every checked-out source.
    pub fn git_manifest_path(&self) -> PathBuf {
        self.log_dir().join("GITMANIFEST")
    }

    /// Scratch tree for everything produced by a build.
    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    /// The single tmpfs mountpoint; per-source overlays suffix this.
    pub fn tmpfs(&self) -> PathBuf {
        self.tmp_dir().join("tmpfs")
    }

    /// Base chroot directory used by bootstrap and image phases.
    pub fn chroot_basedir(&self) -> PathBuf {
        self.tmpfs().join("chroot")
    }

    /// Base chroot squashfs cache directory.
    pub fn cache_dir(&self) -> PathBuf {
        self.tmp_dir().join("cache")
    }

    /// Per-source hash and pkglist state.
    pub fn hash_dir(&self) -> PathBuf {
        self.tmp_dir().join("pkghashes")
    }

    /// The shared local apt repository.
    pub fn pkg_dir(&self) -> PathBuf {
        self.tmp_dir().join("pkgdir")
    }

    /// Checked-out source trees.
    pub fn sources_dir(&self) -> PathBuf {
        self.root.join("sources")
    }

    /// Persistent ccache store shared by builds that opt in.
    pub fn ccache_dir(&self) -> PathBuf {
        self.root.join("ccache")
    }

    /// Release artifacts (update file, ISO, manifests).
    pub fn release_dir(&self) -> PathBuf {
        self.tmp_dir().join("release")
    }

    /// Update-file staging directory.
    pub fn update_dir(&self) -> PathBuf {
        self.tmp_dir().join("update")
    }

    /// CD assembly directory.
    pub fn cd_dir(&self) -> PathBuf {
        self.tmp_dir().join("cdrom")
    }

    /// Last-seen manifest build epoch.
    pub fn epoch_path(&self) -> PathBuf {
        self.tmp_dir().join(".buildEpoch")
    }

    /// Checkout location of one source tree.
    pub fn source_path(&self, source_name: &str) -> PathBuf {
        self.sources_dir().join(source_name)
    }

    /// Git SHA recorded at the last successful build of a source.
    pub fn pkg_hash_path(&self, source_name: &str) -> PathBuf {
        self.hash_dir().join(format!("{}.hash", source_name))
    }

    /// Artifact list recorded at the last successful build of a source.
    pub fn pkg_list_path(&self, source_name: &str) -> PathBuf {
        self.hash_dir().join(format!("{}.pkglist", source_name))
    }

    /// Build log of one source.
    pub fn pkg_log_path(&self, name: &str) -> PathBuf {
        self.pkg_log_dir().join(format!("{}.log", name))
    }

    /// Git checkout log of one source.
    pub fn git_log_path(&self, name: &str) -> PathBuf {
        self.git_log_dir().join(format!("{}.log", name))
    }

    /// The produced update file for a version.
    pub fn update_file_path(&self, version: &str) -> PathBuf {
        self.release_dir()
            .join(format!("TrueNAS-SCALE-{}.update", version))
    }

    /// SHA-256 sidecar of the update file.
    pub fn update_file_checksum_path(&self, version: &str) -> PathBuf {
        self.release_dir()
            .join(format!("TrueNAS-SCALE-{}.update.sha256", version))
    }

    /// The produced ISO for a version.
    pub fn iso_file_path(&self, version: &str) -> PathBuf {
        self.release_dir()
            .join(format!("TrueNAS-SCALE-{}.iso", version))
    }

    /// The rootfs mtree manifest.
    pub fn mtree_path(&self) -> PathBuf {
        self.release_dir().join("rootfs.mtree")
    }

    /// The release manifest.
    pub fn release_manifest_path(&self) -> PathBuf {
        self.release_dir().join("manifest.json")
    }

    /// Create every directory the build phases expect to exist.
    pub fn setup_dirs(&self) -> std::io::Result<()> {
        for dir in [
            self.tmp_dir(),
            self.tmpfs(),
            self.cache_dir(),
            self.hash_dir(),
            self.pkg_dir(),
            self.sources_dir(),
            self.log_dir(),
            self.git_log_dir(),
            self.pkg_log_dir(),
            self.release_dir(),
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::Layout;

    #[test]
    fn test_paths_derive_from_root() {
        let layout = Layout::new("/build");
        assert_eq!(
            layout.pkg_hash_path("openzfs"),
            std::path::Path::new("/build/tmp/pkghashes/openzfs.hash")
        );
        assert_eq!(
            layout.update_file_path("25.04.0"),
            std::path::Path::new("/build/tmp/release/TrueNAS-SCALE-25.04.0.update")
        );
        assert_eq!(
            layout.source_path("openzfs"),
            std::path::Path::new("/build/sources/openzfs")
        );
    }
}

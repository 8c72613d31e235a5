//! Base chroot creation and caching.
//!
//! A base chroot is debootstrapped once per cache key, configured with
//! the manifest's apt repositories and pinning preferences, then frozen
//! as a squashfs image. Builds restore it in seconds instead of paying
//! for debootstrap on every run.

pub mod cache;
pub mod hash;

use crate::config::apt_env;
use crate::error::Error;
use crate::logs::BuildLog;
use crate::manifest::Manifest;
use crate::paths::{Layout, REFERENCE_FILES};
use crate::run::{run, RunOptions};
use cache::CacheFile;
use std::path::PathBuf;

/// Keyring the trusted build key is installed into on the host.
pub const HOST_KEYRING: &str = "/etc/apt/trusted.gpg.d/debian-archive-truenas-automatic.gpg";

/// The deb line exposing the local package repository inside chroots.
pub const LOCAL_REPO_LINE: &str = "deb [trusted=yes] file:/packages /";

/// The base chroot flavors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variant {
    /// Build environment for source packages.
    Package,
    /// Seed for the final rootfs image.
    Rootfs,
    /// Seed for the installer CD environment.
    Cdrom,
}

impl Variant {
    /// Short name used in cache filenames and log lines.
    pub fn as_str(&self) -> &'static str {
        match self {
            Variant::Package => "package",
            Variant::Rootfs => "rootfs",
            Variant::Cdrom => "cdrom",
        }
    }

    /// Cache image filename for this variant.
    pub fn cache_filename(&self) -> String {
        format!("basechroot-{}.squashfs", self.as_str())
    }

    fn debootstrap_options(&self) -> Vec<&'static str> {
        match self {
            Variant::Package => vec![],
            // Two-stage bootstrap so the reference passwd/group can be
            // copied in before packages create their users.
            Variant::Rootfs => vec!["--foreign"],
            Variant::Cdrom => vec![
                "--components=main,contrib,nonfree",
                "--variant=minbase",
                "--include=systemd-sysv,gnupg",
            ],
        }
    }

    fn extra_packages(&self) -> &'static [&'static str] {
        match self {
            Variant::Package => &["build-essential", "dh-make", "devscripts", "fakeroot"],
            Variant::Rootfs | Variant::Cdrom => &[],
        }
    }
}

/// Creates, caches and restores one base chroot variant.
pub struct BootstrapDir<'a> {
    variant: Variant,
    layout: &'a Layout,
    manifest: &'a Manifest,
    chroot: PathBuf,
}

impl<'a> BootstrapDir<'a> {
    /// Bootstrap handle for `variant`.
    pub fn new(variant: Variant, layout: &'a Layout, manifest: &'a Manifest) -> BootstrapDir<'a> {
        BootstrapDir {
            variant,
            layout,
            manifest,
            chroot: layout.chroot_basedir(),
        }
    }

    /// The cache pair for this variant.
    pub fn cache(&self) -> CacheFile {
        CacheFile::new(&self.layout.cache_dir(), &self.variant.cache_filename())
    }

    /// Restore the cached chroot into `dst`.
    pub fn restore(&self, dst: &std::path::Path, log: &BuildLog) -> Result<(), Error> {
        self.cache().restore(dst, log)
    }

    /// Ensure the cache is current, rebuilding it when the repo hash
    /// moved. Idempotent: with an intact cache this performs no
    /// filesystem writes beyond mount churn.
    pub fn setup(
        &self,
        client: &reqwest::blocking::Client,
        log: &BuildLog,
    ) -> Result<(), Error> {
        self.clean_setup(log);
        let result = self.setup_impl(client, log);
        self.clean_setup(log);
        result
    }

    fn setup_impl(
        &self,
        client: &reqwest::blocking::Client,
        log: &BuildLog,
    ) -> Result<(), Error> {
        let current_hash = hash::all_repo_hash(client, self.manifest)?;
        let cache = self.cache();
        if cache.is_intact(&current_hash, log) {
            log.line("Basechroot cache is intact and does not need to be changed");
            return Ok(());
        }

        self.add_trusted_apt_key(log)?;
        self.debootstrap(log)?;
        self.setup_mounts(log)?;

        let apt_path = self.chroot.join("etc/apt");
        std::fs::write(
            apt_path.join("preferences"),
            self.manifest.render_preferences(),
        )?;

        let mut apt_sources = self.manifest.apt_source_lines();
        // Primary line only until the additional keys are trusted.
        std::fs::write(apt_path.join("sources.list"), apt_sources[0].clone() + "\n")?;
        for repo in &self.manifest.apt_repos.additional {
            if let Some(key) = &repo.key {
                log.line(&format!("Adding additional repo: {}", repo.url));
                std::fs::copy(
                    self.layout.root().join(key),
                    self.chroot.join("apt.key"),
                )?;
                self.run_in_chroot(&["apt-key", "add", "/apt.key"], log)?;
                std::fs::remove_file(self.chroot.join("apt.key"))?;
            }
        }
        std::fs::write(apt_path.join("sources.list"), apt_sources.join("\n") + "\n")?;

        self.run_in_chroot(&["apt", "update"], log)?;
        self.run_in_chroot(&["apt", "upgrade", "-y"], log)?;
        let extras = self.variant.extra_packages();
        if !extras.is_empty() {
            let mut cmd = vec!["apt", "install", "-y"];
            cmd.extend(extras);
            self.run_in_chroot(&cmd, log)?;
        }

        self.capture_inventory(log)?;

        // Local package repo goes to the top of the food chain so every
        // restored chroot prefers freshly built packages.
        apt_sources.insert(0, LOCAL_REPO_LINE.to_string());
        std::fs::write(apt_path.join("sources.list"), apt_sources.join("\n") + "\n")?;

        self.clean_mounts(log);
        log.line("Caching base chroot for future runs...");
        cache.save(&self.chroot, &current_hash, log)?;
        Ok(())
    }

    fn debootstrap(&self, log: &BuildLog) -> Result<(), Error> {
        let chroot = self.chroot.to_string_lossy().to_string();
        let mut argv: Vec<&str> = vec!["debootstrap"];
        let opts = self.variant.debootstrap_options();
        argv.extend(opts.iter().copied());
        argv.push("--keyring");
        argv.push(HOST_KEYRING);
        argv.push(self.manifest.debian_release.as_str());
        argv.push(chroot.as_str());
        argv.push(self.manifest.apt_repos.url.as_str());
        run(&argv, &RunOptions::default(), log)?;

        if self.variant == Variant::Rootfs {
            // Copy the reference passwd/group in before second stage so
            // uid/gid assignments are pinned across builds.
            for reference in REFERENCE_FILES {
                let dst = self.chroot.join(reference);
                if let Some(parent) = dst.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::copy(self.layout.reference_files_dir().join(reference), dst)?;
            }
            self.run_in_chroot(&["/debootstrap/debootstrap", "--second-stage"], log)?;
        }
        Ok(())
    }

    fn add_trusted_apt_key(&self, log: &BuildLog) -> Result<(), Error> {
        run(
            &[
                "apt-key",
                "--keyring",
                HOST_KEYRING,
                "add",
                &self.layout.apt_key_path().to_string_lossy(),
            ],
            &RunOptions::default(),
            log,
        )?;
        Ok(())
    }

    fn run_in_chroot(&self, argv: &[&str], log: &BuildLog) -> Result<(), Error> {
        let chroot = self.chroot.to_string_lossy().to_string();
        let mut cmd = vec!["chroot", chroot.as_str()];
        cmd.extend(argv);
        run(
            &cmd,
            &RunOptions {
                env: Some(apt_env()),
                ..Default::default()
            },
            log,
        )?;
        Ok(())
    }

    fn capture_inventory(&self, log: &BuildLog) -> Result<(), Error> {
        let chroot = self.chroot.to_string_lossy().to_string();
        let out = run(
            &[
                "chroot",
                &chroot,
                "dpkg-query",
                "-W",
                "-f",
                "${Package} ${Version}\\n",
            ],
            &RunOptions {
                env: Some(apt_env()),
                quiet: true,
                ..Default::default()
            },
            log,
        )?;

        let inventory_path = self
            .layout
            .cache_dir()
            .join(format!("{}.packages", self.variant.cache_filename()));
        if self.variant == Variant::Package {
            if let Ok(previous) = std::fs::read_to_string(&inventory_path) {
                if previous != out.stdout {
                    log.line("Base chroot package set changed, discarding built packages");
                    crate::clean::clean_packages(self.layout)?;
                }
            }
        }
        std::fs::create_dir_all(self.layout.cache_dir())?;
        std::fs::write(inventory_path, out.stdout)?;
        Ok(())
    }

    fn setup_mounts(&self, log: &BuildLog) -> Result<(), Error> {
        run(
            &[
                "mount",
                "proc",
                &self.chroot.join("proc").to_string_lossy(),
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
                &self.chroot.join("sys").to_string_lossy(),
                "-t",
                "sysfs",
            ],
            &RunOptions::default(),
            log,
        )?;
        Ok(())
    }

    fn clean_mounts(&self, log: &BuildLog) {
        let no_check = RunOptions {
            no_check: true,
            ..Default::default()
        };
        for target in [self.chroot.join("proc"), self.chroot.join("sys")] {
            let _ = run(&["umount", "-f", &target.to_string_lossy()], &no_check, log);
        }
    }

    /// Remove any existing chroot tree and its mounts.
    pub fn clean_setup(&self, log: &BuildLog) {
        self.clean_mounts(log);
        let _ = std::fs::remove_dir_all(&self.chroot);
    }
}

#[cfg(test)]
mod tests {
    use super::Variant;

    #[test]
    fn test_variant_cache_filenames() {
        assert_eq!(
            Variant::Package.cache_filename(),
            "basechroot-package.squashfs"
        );
        assert_eq!(Variant::Rootfs.cache_filename(), "basechroot-rootfs.squashfs");
        assert_eq!(Variant::Cdrom.cache_filename(), "basechroot-cdrom.squashfs");
    }

    #[test]
    fn test_variant_options() {
        assert!(Variant::Package.debootstrap_options().is_empty());
        assert_eq!(Variant::Rootfs.debootstrap_options(), vec!["--foreign"]);
        assert!(Variant::Cdrom
            .debootstrap_options()
            .contains(&"--variant=minbase"));
        assert!(Variant::Package.extra_packages().contains(&"devscripts"));
        assert!(Variant::Cdrom.extra_packages().is_empty());
    }
}

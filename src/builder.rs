//! The per-source build procedure.
//!
//! A build restores the cached package chroot into the source's overlay,
//! installs declared build dependencies from the shared local repo,
//! runs the recipe commands, and sweeps the produced `.deb`/`.udeb`
//! artifacts into the shared package directory. The overlay is torn down
//! on success and failure alike.

use crate::bootstrap::{BootstrapDir, Variant};
use crate::config::{apt_env, Config};
use crate::control::ParsedControl;
use crate::error::Error;
use crate::graph::{ControlResolver, FsControlResolver};
use crate::logs::BuildLog;
use crate::manifest::Manifest;
use crate::overlay::{Overlay, CCACHE_IN_CHROOT};
use crate::package::{resolve_command, SourcePackage, ALWAYS_REBUILD};
use crate::paths::Layout;
use crate::run::{run, run_interactive, run_shell, RunOptions};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

/// Shared state a build executes under.
pub struct BuildContext<'a> {
    /// Per-source log sink.
    pub log: &'a BuildLog,
    /// Lock serializing every mutation of the shared package directory
    /// and apt index.
    pub apt_lock: &'a Mutex<()>,
}

/// Executes one source build. The scheduler only knows this seam, so
/// ordering and failure semantics are testable without chroots.
pub trait BuildRunner: Sync {
    /// Build `pkg`, leaving its artifacts in the shared package
    /// directory.
    fn build(&self, pkg: &SourcePackage, ctx: &BuildContext) -> Result<(), Error>;
}

/// Regenerate the local apt index after a package-directory mutation.
/// Callers must hold the APT lock.
pub fn update_apt_index(layout: &Layout, log: &BuildLog) -> Result<(), Error> {
    run_shell(
        "dpkg-scanpackages . /dev/null | gzip > Packages.gz",
        &RunOptions {
            cwd: Some(layout.pkg_dir()),
            ..Default::default()
        },
        log,
    )?;
    Ok(())
}

/// The real build runner: chroot + overlayfs + debuild.
pub struct ChrootBuilder<'a> {
    /// Builder layout.
    pub layout: &'a Layout,
    /// Process configuration.
    pub config: &'a Config,
    /// The build manifest.
    pub manifest: &'a Manifest,
}

impl ChrootBuilder<'_> {
    fn ccache_enabled(&self, pkg: &SourcePackage) -> bool {
        self.config.ccache && pkg.supports_ccache
    }

    /// Host env plus the fixed apt env, injected secrets, the package's
    /// own overrides and the ccache settings.
    fn build_env(&self, pkg: &SourcePackage) -> HashMap<String, String> {
        let mut env = apt_env();
        for (key, value) in &self.config.secrets {
            env.insert(key.clone(), value.clone());
        }
        for (key, value) in &pkg.env {
            env.insert(key.clone(), value.clone());
        }
        if self.ccache_enabled(pkg) {
            env.insert(
                "CCACHE_DIR".to_string(),
                format!("/{}", CCACHE_IN_CHROOT),
            );
            let path = env.get("PATH").cloned().unwrap_or_default();
            if !path.split(':').any(|p| p == "/usr/lib/ccache") {
                env.insert("PATH".to_string(), format!("/usr/lib/ccache:{}", path));
            }
        }
        env
    }

    fn run_in_chroot(
        &self,
        overlay: &Overlay,
        pkg: &SourcePackage,
        command: &str,
        log: &BuildLog,
        context: &str,
    ) -> Result<(), Error> {
        let root = overlay.dpkg_overlay().to_string_lossy().to_string();
        let result = run(
            &["chroot", &root, "/bin/bash", "-c", command],
            &RunOptions {
                env: Some(self.build_env(pkg)),
                ..Default::default()
            },
            log,
        );
        match result {
            Ok(_) => Ok(()),
            Err(Error::CommandFailed {
                command,
                code,
                stderr,
            }) => {
                log.line(&format!("{} failed", context));
                Err(Error::CommandFailed {
                    command: format!("{}: {}", context, command),
                    code,
                    stderr,
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Unlink every artifact recorded by the previous build of `pkg`.
    /// The caller holds the APT lock.
    fn clean_previous_packages(&self, pkg: &SourcePackage, log: &BuildLog) -> Result<(), Error> {
        let pkglist = self.layout.pkg_list_path(&pkg.name);
        let contents = match std::fs::read_to_string(&pkglist) {
            Ok(contents) => contents,
            Err(_) => return Ok(()),
        };
        std::fs::remove_file(&pkglist)?;
        log.line(&format!("Removing previously built packages for {}", pkg.name));
        for name in contents.split_whitespace().filter(|n| !n.is_empty()) {
            let _ = std::fs::remove_file(self.layout.pkg_dir().join(name));
        }
        Ok(())
    }

    fn run_recipe_commands(
        &self,
        overlay: &Overlay,
        pkg: &SourcePackage,
        commands: &[crate::manifest::RecipeCommand],
        what: &str,
        log: &BuildLog,
    ) -> Result<(), Error> {
        let env = self.build_env(pkg);
        for entry in commands {
            let command = match resolve_command(entry, &env) {
                Some(command) => command,
                None => continue,
            };
            log.line(&format!("Running {}: {}", what, command));
            self.run_in_chroot(
                overlay,
                pkg,
                &format!("cd {} && {}", pkg.package_source(), command),
                log,
                &format!("Failed to execute {} command", what),
            )?;
        }
        Ok(())
    }

    fn stamp_truenas_metadata(&self, source_dir: &Path) -> Result<(), Error> {
        let manifest = serde_json::json!({
            "buildtime": self.config.build_time.timestamp(),
            "train": self.config.train(&self.manifest.code_name),
            "version": self.config.version,
        });
        std::fs::create_dir_all(source_dir.join("data"))?;
        std::fs::write(
            source_dir.join("data/manifest.json"),
            serde_json::to_string(&manifest).map_err(|e| Error::Call(e.to_string()))?,
        )?;
        std::fs::create_dir_all(source_dir.join("etc"))?;
        std::fs::write(source_dir.join("etc/version"), &self.config.version)?;
        Ok(())
    }

    fn build_commands(&self, pkg: &SourcePackage) -> Vec<String> {
        let ncpu = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let mut prefix = String::new();
        if let Some(deoptions) = &pkg.deoptions {
            prefix = format!("DEB_BUILD_OPTIONS={} ", deoptions);
        }
        vec![format!(
            "{}debuild -j{} -us -uc -b",
            prefix,
            pkg.jobs.unwrap_or(ncpu)
        )]
    }

    /// Move every `.deb`/`.udeb` from `artifact_dir` into the shared
    /// package directory, returning the moved filenames. The caller
    /// holds the APT lock.
    fn collect_artifacts(
        &self,
        artifact_dir: &Path,
        log: &BuildLog,
    ) -> Result<Vec<String>, Error> {
        let mut collected = Vec::new();
        for entry in std::fs::read_dir(artifact_dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if !(name.ends_with(".deb") || name.ends_with(".udeb")) {
                continue;
            }
            let dst = self.layout.pkg_dir().join(&name);
            // The overlay upper layer is usually tmpfs, so a rename can
            // fail with EXDEV; fall back to copy + unlink.
            if std::fs::rename(entry.path(), &dst).is_err() {
                std::fs::copy(entry.path(), &dst)?;
                std::fs::remove_file(entry.path())?;
            }
            collected.push(name);
        }
        log.line(&format!("Collected {} packages", collected.len()));
        Ok(collected)
    }

    fn build_impl(
        &self,
        pkg: &SourcePackage,
        overlay: &mut Overlay,
        ctx: &BuildContext,
    ) -> Result<(), Error> {
        let log = ctx.log;

        overlay.mount_tmpfs(log)?;
        log.line("Restoring base chroot...");
        BootstrapDir::new(Variant::Package, self.layout, self.manifest)
            .restore(&overlay.chroot_base(), log)?;
        overlay.mount(&self.layout.pkg_dir(), log)?;

        // Copy the checkout in, preserving symlinks.
        run(
            &[
                "cp",
                "-a",
                &format!("{}/.", pkg.source_path(self.layout).display()),
                &overlay.sources_overlay().to_string_lossy(),
            ],
            &RunOptions::default(),
            log,
        )?;

        if self.layout.pkg_dir().join("Packages.gz").exists() {
            self.run_in_chroot(overlay, pkg, "apt update", log, "Failed apt update")?;
        }

        {
            let _apt = ctx.apt_lock.lock().unwrap();
            self.clean_previous_packages(pkg, log)?;
        }

        if self.ccache_enabled(pkg) {
            log.line("Setting up ccache");
            self.run_in_chroot(overlay, pkg, "apt install -y ccache", log, "Failed ccache setup")?;
        }

        self.run_recipe_commands(overlay, pkg, &pkg.predepscmd, "predepcmd", log)?;

        let source_dir = overlay.dpkg_overlay().join(pkg.package_source());
        if !source_dir.join("debian/control").exists() {
            return Err(Error::Call(format!(
                "Missing debian/control file for {} in {}",
                pkg.name,
                source_dir.display()
            )));
        }

        self.run_in_chroot(
            overlay,
            pkg,
            &format!("cd {} && mk-build-deps --build-dep", pkg.package_source()),
            log,
            "Failed mk-build-deps",
        )?;
        self.run_in_chroot(
            overlay,
            pkg,
            &format!("cd {} && apt install -y ./*.deb", pkg.package_source()),
            log,
            "Failed install build deps",
        )?;

        if pkg.name == ALWAYS_REBUILD {
            self.stamp_truenas_metadata(&source_dir)?;
        }

        self.run_recipe_commands(overlay, pkg, &pkg.prebuildcmd, "prebuildcmd", log)?;

        if pkg.generate_version {
            let version = format!(
                "{}~truenas+1",
                self.config.build_time.format("%Y%m%d%H%M%S")
            );
            self.run_in_chroot(
                overlay,
                pkg,
                &format!(
                    "cd {} && dch -b -M -v {} --force-distribution \
                     --distribution bullseye-truenas-unstable 'Tagged from truenas-build'",
                    pkg.package_source(),
                    version
                ),
                log,
                "Failed dch changelog",
            )?;
        }

        if pkg.buildcmd.is_empty() {
            for command in self.build_commands(pkg) {
                log.line(&format!("Running build command: {}", command));
                self.run_in_chroot(
                    overlay,
                    pkg,
                    &format!("cd {} && {}", pkg.package_source(), command),
                    log,
                    &format!("Failed to build {} package", pkg.name),
                )?;
            }
        } else {
            self.run_recipe_commands(overlay, pkg, &pkg.buildcmd, "build command", log)?;
        }

        log.line("Copying finished packages");
        let artifact_dir = source_dir
            .parent()
            .ok_or_else(|| Error::Call(format!("No artifact directory for {}", pkg.name)))?
            .to_path_buf();
        let built = {
            let _apt = ctx.apt_lock.lock().unwrap();
            self.collect_artifacts(&artifact_dir, log)?
        };
        std::fs::create_dir_all(self.layout.hash_dir())?;
        std::fs::write(self.layout.pkg_list_path(&pkg.name), built.join("\n"))?;
        std::fs::write(
            self.layout.pkg_hash_path(&pkg.name),
            pkg.current_hash(self.layout)?,
        )?;
        Ok(())
    }
}

impl BuildRunner for ChrootBuilder<'_> {
    fn build(&self, pkg: &SourcePackage, ctx: &BuildContext) -> Result<(), Error> {
        let mut overlay = Overlay::new(self.layout, pkg, self.ccache_enabled(pkg));
        let result = self.build_impl(pkg, &mut overlay, ctx);
        if result.is_err() && self.config.pkg_debug {
            log::warn!("{} failed, dropping to debug shell", pkg.name);
            let root = overlay.dpkg_overlay().to_string_lossy().to_string();
            let _ = run_interactive(
                &["chroot", &root, "/bin/bash"],
                Some(&self.build_env(pkg)),
            );
        }
        overlay.teardown(ctx.log);
        result
    }
}

/// Control resolver that can handle `depscmd` sources by generating the
/// control file inside a transient overlay first.
pub struct ChrootControlResolver<'a> {
    /// Builder layout.
    pub layout: &'a Layout,
    /// Process configuration.
    pub config: &'a Config,
    /// The build manifest.
    pub manifest: &'a Manifest,
}

impl ControlResolver for ChrootControlResolver<'_> {
    fn resolve(&self, pkg: &SourcePackage) -> Result<Option<ParsedControl>, Error> {
        let fs_resolver = FsControlResolver { layout: self.layout };
        if pkg.depscmd.is_empty() {
            return fs_resolver.resolve(pkg);
        }

        // The only case where the graph phase needs a full chroot.
        log::debug!("Generating control file for {} in a transient overlay", pkg.name);
        let builder = ChrootBuilder {
            layout: self.layout,
            config: self.config,
            manifest: self.manifest,
        };
        let log = BuildLog::null();
        let mut overlay = Overlay::new(self.layout, pkg, false);
        let result = (|| -> Result<ParsedControl, Error> {
            overlay.mount_tmpfs(&log)?;
            BootstrapDir::new(Variant::Package, self.layout, self.manifest)
                .restore(&overlay.chroot_base(), &log)?;
            overlay.mount(&self.layout.pkg_dir(), &log)?;
            run(
                &[
                    "cp",
                    "-a",
                    &format!("{}/.", pkg.source_path(self.layout).display()),
                    &overlay.sources_overlay().to_string_lossy(),
                ],
                &RunOptions::default(),
                &log,
            )?;
            builder.run_recipe_commands(&overlay, pkg, &pkg.depscmd, "depscmd", &log)?;

            // The sources bind mount makes the generated file visible
            // outside the chroot.
            let sources = overlay.sources_overlay();
            let control_path = match (&pkg.deps_path, &pkg.subdir) {
                (Some(deps_path), _) => sources.join(deps_path).join("control"),
                (None, Some(subdir)) => sources.join(subdir).join("debian/control"),
                (None, None) => sources.join("debian/control"),
            };
            crate::control::parse_control_file(&control_path)
        })();
        overlay.teardown(&log);
        result.map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::Manifest;
    use crate::package::SourcePackage;

    fn fixture() -> (Manifest, Config) {
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
  - name: zectl
    repo: https://github.com/truenas/zectl
    branch: master
    deoptions: nocheck
    jobs: 4
    env:
      EXTRA_FLAG: "1"
"#,
        )
        .unwrap();
        (manifest, Config::from_env())
    }

    #[test]
    fn test_default_build_command() {
        let (manifest, config) = fixture();
        let layout = Layout::new("/build");
        let builder = ChrootBuilder {
            layout: &layout,
            config: &config,
            manifest: &manifest,
        };
        let pkg = SourcePackage::from_manifest(&manifest).remove(0);
        let commands = builder.build_commands(&pkg);
        assert_eq!(
            commands,
            vec!["DEB_BUILD_OPTIONS=nocheck debuild -j4 -us -uc -b".to_string()]
        );
    }

    #[test]
    fn test_build_env_layers() {
        let (manifest, mut config) = fixture();
        config
            .secrets
            .insert("API_TOKEN".to_string(), "sekrit".to_string());
        let layout = Layout::new("/build");
        let builder = ChrootBuilder {
            layout: &layout,
            config: &config,
            manifest: &manifest,
        };
        let pkg = SourcePackage::from_manifest(&manifest).remove(0);
        let env = builder.build_env(&pkg);
        assert_eq!(env.get("EXTRA_FLAG").map(String::as_str), Some("1"));
        assert_eq!(env.get("API_TOKEN").map(String::as_str), Some("sekrit"));
        assert_eq!(
            env.get("DEBIAN_FRONTEND").map(String::as_str),
            Some("noninteractive")
        );
        assert!(env.get("PATH").unwrap().contains("/usr/sbin"));
    }

    #[test]
    fn test_clean_previous_packages() {
        let td = tempfile::tempdir().unwrap();
        let layout = Layout::new(td.path());
        layout.setup_dirs().unwrap();
        let (manifest, config) = fixture();
        let builder = ChrootBuilder {
            layout: &layout,
            config: &config,
            manifest: &manifest,
        };
        let pkg = SourcePackage::from_manifest(&manifest).remove(0);

        std::fs::write(layout.pkg_dir().join("zectl_1.0_amd64.deb"), b"x").unwrap();
        std::fs::write(layout.pkg_dir().join("unrelated_1.0_amd64.deb"), b"x").unwrap();
        std::fs::write(
            layout.pkg_list_path(&pkg.name),
            "zectl_1.0_amd64.deb\nmissing_1.0_amd64.deb",
        )
        .unwrap();

        builder
            .clean_previous_packages(&pkg, &BuildLog::null())
            .unwrap();
        assert!(!layout.pkg_dir().join("zectl_1.0_amd64.deb").exists());
        assert!(layout.pkg_dir().join("unrelated_1.0_amd64.deb").exists());
        assert!(!layout.pkg_list_path(&pkg.name).exists());

        // A second sweep with no pkglist is a no-op.
        builder
            .clean_previous_packages(&pkg, &BuildLog::null())
            .unwrap();
    }
}

//! Bootable installer ISO assembly.
//!
//! The ISO carries a live CD environment squashed from the `cdrom` base
//! chroot, the boot files needed by grub, and the previously produced
//! update file for the offline installer to apply.

use crate::bootstrap::{hash, BootstrapDir, Variant};
use crate::config::{apt_env, Config};
use crate::error::Error;
use crate::image::bootstrap::{
    clean_mounts, setup_chroot_basedir, umount_chroot_basedir, CD_DIR_IN_CHROOT,
    RELEASE_DIR_IN_CHROOT,
};
use crate::logs::BuildLog;
use crate::manifest::Manifest;
use crate::paths::Layout;
use crate::run::{run, run_shell, RunOptions};
use std::io::Write;

/// Grub packages installed into the CD chroot for `grub-mkrescue`.
const GRUB_PACKAGES: &[&str] = &[
    "grub-common",
    "grub2-common",
    "grub-efi-amd64-bin",
    "grub-efi-amd64-signed",
    "grub-pc-bin",
    "mtools",
    "xorriso",
];

/// Paths pruned out of the live filesystem squashfs.
const CD_PRUNE: &[&str] = &[
    "var/cache/apt",
    "var/lib/apt",
    "usr/share/doc",
    "usr/share/man",
    "etc/resolv.conf",
];

fn run_in_chroot(layout: &Layout, argv: &[&str], log: &BuildLog) -> Result<(), Error> {
    let chroot = layout.chroot_basedir().to_string_lossy().to_string();
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

/// Version recorded in the release manifest, with the optional vendor
/// suffix for image naming.
pub fn image_version(layout: &Layout, vendor: Option<&str>) -> Result<String, Error> {
    let manifest_path = layout.release_manifest_path();
    if !manifest_path.exists() {
        return Err(Error::Call(format!(
            "{:?} does not exist",
            manifest_path.display()
        )));
    }
    let release: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&manifest_path)?)
            .map_err(|e| Error::Call(e.to_string()))?;
    let version = release["version"]
        .as_str()
        .ok_or_else(|| Error::Call("release manifest has no version".to_string()))?;
    Ok(match vendor {
        Some(vendor) => format!("{}-{}", version, vendor),
        None => version.to_string(),
    })
}

fn install_iso_packages(layout: &Layout, manifest: &Manifest, log: &BuildLog) -> Result<(), Error> {
    let result = (|| -> Result<(), Error> {
        run_in_chroot(layout, &["apt", "update"], log)?;
        for package in &manifest.iso_packages {
            run_in_chroot(layout, &["apt", "install", "-y", package], log)?;
        }
        let chroot = layout.chroot_basedir();
        std::fs::create_dir_all(chroot.join("boot/grub"))?;
        std::fs::copy(layout.grub_config_path(), chroot.join("boot/grub/grub.cfg"))?;
        Ok(())
    })();
    umount_chroot_basedir(layout, log);
    result
}

fn make_iso_file(
    layout: &Layout,
    config: &Config,
    version: &str,
    log: &BuildLog,
) -> Result<(), Error> {
    let chroot = layout.chroot_basedir();
    let cd_dir = layout.cd_dir();

    for entry in std::fs::read_dir(layout.release_dir())? {
        let entry = entry?;
        if entry.file_name().to_string_lossy().contains(".iso") {
            let _ = std::fs::remove_file(entry.path());
        }
    }

    // Installer environment basics: root login, network, identity.
    run_shell(
        &format!(
            "chroot {} /bin/bash -c \"echo -e 'root\\nroot' | passwd root\"",
            chroot.display()
        ),
        &RunOptions {
            quiet: true,
            ..Default::default()
        },
        log,
    )?;
    run_in_chroot(layout, &["systemctl", "enable", "systemd-networkd"], log)?;
    std::fs::write(chroot.join("etc/version"), version)?;
    std::fs::write(chroot.join("etc/hostname"), "truenas-installer.local")?;
    if let Some(vendor) = &config.vendor {
        std::fs::create_dir_all(chroot.join("data"))?;
        std::fs::write(
            chroot.join("data/.vendor"),
            serde_json::json!({ "name": vendor }).to_string(),
        )?;
    }

    if layout.cd_files_dir().exists() {
        run_shell(
            &format!(
                "rsync -aKv {}/ {}/",
                layout.cd_files_dir().display(),
                chroot.display()
            ),
            &RunOptions::default(),
            log,
        )?;
    }

    let _ = std::fs::remove_dir_all(&cd_dir);
    std::fs::create_dir_all(cd_dir.join("live"))?;

    let live_squashfs = layout.tmp_dir().join("truenas.squashfs");
    let mut exclude_file = tempfile::NamedTempFile::new()?;
    writeln!(exclude_file, "{}", CD_PRUNE.join("\n"))?;
    exclude_file.flush()?;
    run(
        &[
            "mksquashfs",
            &chroot.to_string_lossy(),
            &live_squashfs.to_string_lossy(),
            "-comp",
            "xz",
            "-ef",
            &exclude_file.path().to_string_lossy(),
        ],
        &RunOptions::default(),
        log,
    )?;
    std::fs::rename(&live_squashfs, cd_dir.join("live/filesystem.squashfs"))?;

    run(
        &[
            "cp",
            "-a",
            &chroot.join("boot").to_string_lossy(),
            &cd_dir.join("boot").to_string_lossy(),
        ],
        &RunOptions::default(),
        log,
    )?;
    // Dereference the top-level symlinks so the tree survives FAT32.
    std::fs::copy(chroot.join("initrd.img"), cd_dir.join("initrd.img"))?;
    std::fs::copy(chroot.join("vmlinuz"), cd_dir.join("vmlinuz"))?;
    for entry in std::fs::read_dir(cd_dir.join("boot"))? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with("initrd.img-") || name.starts_with("vmlinuz-") {
            let _ = std::fs::remove_file(entry.path());
        }
    }

    let plain_version = image_version(layout, None)?;
    std::fs::copy(
        layout.update_file_path(&plain_version),
        cd_dir.join("TrueNAS-SCALE.update"),
    )?;

    // Debian's GRUB EFI image probes for .disk/info to identify the
    // device to load its config from.
    std::fs::create_dir_all(cd_dir.join(".disk"))?;
    std::fs::write(cd_dir.join(".disk/info"), "")?;

    let release_bind = chroot.join(RELEASE_DIR_IN_CHROOT);
    let cd_bind = chroot.join(CD_DIR_IN_CHROOT);
    std::fs::create_dir_all(&release_bind)?;
    std::fs::create_dir_all(&cd_bind)?;

    let packages_bind = chroot.join("packages");
    std::fs::create_dir_all(&packages_bind)?;

    let result = (|| -> Result<(), Error> {
        for (src, dst) in [
            (layout.release_dir(), release_bind.clone()),
            (cd_dir.clone(), cd_bind.clone()),
            (layout.pkg_dir(), packages_bind.clone()),
        ] {
            run(
                &[
                    "mount",
                    "--bind",
                    &src.to_string_lossy(),
                    &dst.to_string_lossy(),
                ],
                &RunOptions::default(),
                log,
            )?;
        }

        let _ = run_in_chroot(layout, &["apt-get", "update"], log);
        let mut install = vec!["apt-get", "install", "-y"];
        install.extend(GRUB_PACKAGES);
        run_in_chroot(layout, &install, log)?;

        std::fs::create_dir_all(cd_dir.join("EFI/debian/fonts"))?;
        std::fs::copy(
            layout.grub_config_path(),
            cd_dir.join("EFI/debian/grub.cfg"),
        )?;
        let font = chroot.join("usr/share/grub/unicode.pf2");
        if font.exists() {
            std::fs::copy(font, cd_dir.join("EFI/debian/fonts/unicode.pf2"))?;
        }

        let iso_in_chroot = format!("/{}/TrueNAS-SCALE-{}.iso", RELEASE_DIR_IN_CHROOT, version);
        run_in_chroot(
            layout,
            &[
                "grub-mkrescue",
                "-o",
                &iso_in_chroot,
                &format!("/{}", CD_DIR_IN_CHROOT),
            ],
            log,
        )?;
        Ok(())
    })();

    let no_check = RunOptions {
        no_check: true,
        ..Default::default()
    };
    for target in [&cd_bind, &release_bind, &packages_bind] {
        let _ = run(&["umount", "-f", &target.to_string_lossy()], &no_check, log);
    }
    result?;

    let iso_path = layout.iso_file_path(version);
    let digest = crate::image::sha256_file(&iso_path)?;
    std::fs::write(
        layout
            .release_dir()
            .join(format!("TrueNAS-SCALE-{}.iso.sha256", version)),
        format!("{}  TrueNAS-SCALE-{}.iso", digest, version),
    )?;
    Ok(())
}

/// The whole `iso` phase.
pub fn build_iso(layout: &Layout, config: &Config, manifest: &Manifest) -> Result<String, Error> {
    let result = build_iso_impl(layout, config, manifest);
    clean_mounts(layout, &BuildLog::null());
    result
}

fn build_iso_impl(
    layout: &Layout,
    config: &Config,
    manifest: &Manifest,
) -> Result<String, Error> {
    clean_mounts(layout, &BuildLog::null());
    if let Ok(entries) = std::fs::read_dir(layout.log_dir()) {
        for entry in entries.flatten() {
            if entry.file_name().to_string_lossy().starts_with("cdrom") {
                let _ = std::fs::remove_file(entry.path());
            }
        }
    }

    let plain_version = image_version(layout, None)?;
    if !layout.update_file_path(&plain_version).exists() {
        return Err(Error::Call(format!(
            "Missing rootfs image {}. Run 'update' first.",
            layout.update_file_path(&plain_version).display()
        )));
    }
    let version = image_version(layout, config.vendor.as_deref())?;
    log::debug!("Image version identified as {:?}", version);

    let log_dir = layout.log_dir();
    log::info!(
        "Bootstrapping CD chroot [iso] ({})",
        log_dir.join("cdrom-bootstrap.log").display()
    );
    {
        let log = BuildLog::to_file(&log_dir.join("cdrom-bootstrap.log"))?;
        let bootstrap = BootstrapDir::new(Variant::Cdrom, layout, manifest);
        let client = hash::http_client()?;
        bootstrap.setup(&client, &log)?;
        setup_chroot_basedir(layout, &bootstrap, &log)?;
    }

    log::info!(
        "Installing ISO packages [iso] ({})",
        log_dir.join("cdrom-packages.log").display()
    );
    {
        let log = BuildLog::to_file(&log_dir.join("cdrom-packages.log"))?;
        install_iso_packages(layout, manifest, &log)?;
    }

    log::info!(
        "Creating ISO file [iso] ({})",
        log_dir.join("cdrom-iso.log").display()
    );
    let log = BuildLog::to_file(&log_dir.join("cdrom-iso.log"))?;
    make_iso_file(layout, config, &version, &log)?;
    Ok(version)
}

#[cfg(test)]
mod tests {
    use super::image_version;
    use crate::paths::Layout;

    #[test]
    fn test_image_version_vendor_suffix() {
        let td = tempfile::tempdir().unwrap();
        let layout = Layout::new(td.path());
        layout.setup_dirs().unwrap();
        std::fs::write(
            layout.release_manifest_path(),
            r#"{"version":"25.04.0"}"#,
        )
        .unwrap();
        assert_eq!(image_version(&layout, None).unwrap(), "25.04.0");
        assert_eq!(
            image_version(&layout, Some("acme")).unwrap(),
            "25.04.0-acme"
        );
    }

    #[test]
    fn test_image_version_requires_release_manifest() {
        let td = tempfile::tempdir().unwrap();
        let layout = Layout::new(td.path());
        assert!(image_version(&layout, None).is_err());
    }
}

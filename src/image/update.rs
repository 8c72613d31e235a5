//! Rootfs assembly and update-file production.
//!
//! The rootfs is installed into a fresh chroot restored from the
//! `rootfs` base cache with the freshly built local packages preferred
//! over upstream, pruned, fingerprinted with an mtree, and packed into a
//! nested squashfs: an outer image with uncompressed data blocks holding
//! the manifest (so an offline verifier can read it without extracting)
//! and the xz-compressed inner rootfs.

use crate::bootstrap::{hash, BootstrapDir, Variant, LOCAL_REPO_LINE};
use crate::config::{apt_env, Config};
use crate::error::Error;
use crate::image::bootstrap::{clean_mounts, setup_chroot_basedir, umount_chroot_basedir};
use crate::image::manifest::{build_release_manifest, build_update_manifest, sign_manifest};
use crate::image::mtree::generate_mtree;
use crate::image::reference_files::assert_reference_files;
use crate::logs::BuildLog;
use crate::manifest::Manifest;
use crate::paths::Layout;
use crate::run::{run, run_shell, RunOptions};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

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

/// Install the manifest's package sets into the prepared chroot.
pub fn install_rootfs_packages(
    layout: &Layout,
    manifest: &Manifest,
    log: &BuildLog,
) -> Result<(), Error> {
    let chroot = layout.chroot_basedir();

    std::fs::create_dir_all(chroot.join("etc/dpkg/dpkg.cfg.d"))?;
    std::fs::write(
        chroot.join("etc/dpkg/dpkg.cfg.d/force-unsafe-io"),
        "force-unsafe-io",
    )?;

    // Local packages first so everything just built wins over upstream.
    let mut sources = manifest.apt_source_lines();
    sources.insert(0, LOCAL_REPO_LINE.to_string());
    std::fs::write(
        chroot.join("etc/apt/sources.list"),
        sources.join("\n") + "\n",
    )?;

    run_in_chroot(layout, &["apt", "update"], log)?;

    let mut grouped: [(bool, Vec<&str>); 2] = [(false, Vec::new()), (true, Vec::new())];
    for entry in manifest
        .base_packages
        .iter()
        .chain(manifest.additional_packages.iter())
    {
        let slot = usize::from(entry.install_recommends);
        grouped[slot].1.push(entry.name.as_str());
    }
    for (install_recommends, names) in grouped {
        if names.is_empty() {
            continue;
        }
        log.line(&format!(
            "Installing {:?}{}",
            names,
            if install_recommends { "" } else { " (no recommends)" }
        ));
        let mut cmd = vec!["apt", "install", "-V", "-y"];
        if !install_recommends {
            cmd.push("--no-install-recommends");
        }
        cmd.extend(&names);
        run_in_chroot(layout, &cmd, log)?;
    }

    custom_rootfs_setup(layout, log)?;
    clean_rootfs(layout, manifest, log)?;

    // The image ships the upstream sources.list only.
    std::fs::write(
        chroot.join("etc/apt/sources.list"),
        manifest.apt_source_lines().join("\n") + "\n",
    )?;
    Ok(())
}

/// Rootfs mangling that cannot be expressed as package installs.
fn custom_rootfs_setup(layout: &Layout, log: &BuildLog) -> Result<(), Error> {
    let chroot = layout.chroot_basedir();

    std::fs::create_dir_all(chroot.join("boot/grub"))?;

    // If the image is first booted from a FreeBSD upgrade there is no
    // chance to regenerate the initrd, so give zfs module loading slack.
    let zfs_default = chroot.join("etc/default/zfs");
    let mut contents = std::fs::read_to_string(&zfs_default).unwrap_or_default();
    contents.push_str("ZFS_INITRD_POST_MODPROBE_SLEEP=15\n");
    std::fs::write(&zfs_default, contents)?;

    for entry in std::fs::read_dir(chroot.join("boot"))? {
        let name = entry?.file_name().to_string_lossy().to_string();
        if name.starts_with("initrd.img-") && name.contains("debug") {
            let _ = std::fs::remove_file(chroot.join("boot").join(&name));
        }
    }
    for entry in std::fs::read_dir(chroot.join("boot"))? {
        let name = entry?.file_name().to_string_lossy().to_string();
        if let Some(kernel) = name.strip_prefix("vmlinuz-") {
            if kernel.contains("debug") {
                continue;
            }
            run_in_chroot(layout, &["update-initramfs", "-k", kernel, "-u"], log)?;
        }
    }
    let _ = run(
        &[
            "chroot",
            &chroot.to_string_lossy(),
            "depmod",
        ],
        &RunOptions {
            env: Some(apt_env()),
            no_check: true,
            ..Default::default()
        },
        log,
    );

    // SysV-only services get generated units without an [Install]
    // section; synthesize one so they can be enabled like native units.
    let generated = chroot.join("tmp/systemd");
    std::fs::create_dir_all(&generated)?;
    run_in_chroot(
        layout,
        &[
            "/usr/lib/systemd/system-generators/systemd-sysv-generator",
            "/tmp/systemd",
            "/tmp/systemd",
            "/tmp/systemd",
        ],
        log,
    )?;
    for entry in std::fs::read_dir(&generated)? {
        let entry = entry?;
        if entry.file_name().to_string_lossy().ends_with(".service") {
            let mut unit = std::fs::read_to_string(entry.path())?;
            unit.push_str("\n[Install]\nWantedBy=multi-user.target\n");
            std::fs::write(entry.path(), unit)?;
        }
    }
    run_shell(
        &format!(
            "rsync -a {}/ {}/",
            generated.display(),
            chroot.join("usr/lib/systemd/system").display()
        ),
        &RunOptions::default(),
        log,
    )?;
    std::fs::remove_dir_all(&generated)?;

    // Host keys are generated per installation; identical keys across
    // every build of a version would defeat the point.
    remove_first_boot_files(&chroot)?;
    Ok(())
}

fn remove_first_boot_files(chroot: &Path) -> Result<(), Error> {
    let ssh_dir = chroot.join("etc/ssh");
    if ssh_dir.exists() {
        for entry in std::fs::read_dir(&ssh_dir)? {
            let name = entry?.file_name().to_string_lossy().to_string();
            if name.starts_with("ssh_host_")
                && (name.ends_with("_key")
                    || name.ends_with("_key.pub")
                    || name.ends_with("key-cert.pub"))
            {
                let _ = std::fs::remove_file(ssh_dir.join(&name));
            }
        }
    }
    let _ = std::fs::remove_file(chroot.join("etc/machine-id"));
    let _ = std::fs::remove_file(chroot.join("var/lib/dbus/machine-id"));
    Ok(())
}

/// Prune the rootfs: manifest removals, autoremove, cache purges.
fn clean_rootfs(layout: &Layout, manifest: &Manifest, log: &BuildLog) -> Result<(), Error> {
    if !manifest.base_prune.is_empty() {
        let mut cmd = vec!["apt", "remove", "-y"];
        cmd.extend(manifest.base_prune.iter().map(String::as_str));
        run_in_chroot(layout, &cmd, log)?;
    }
    run_in_chroot(layout, &["apt", "autoremove", "-y"], log)?;

    let chroot = layout.chroot_basedir();
    for dir in [
        "usr/share/doc",
        "var/cache/apt",
        "var/lib/apt/lists",
        "var/trash",
    ] {
        let path = chroot.join(dir);
        let _ = std::fs::remove_dir_all(&path);
        std::fs::create_dir_all(&path)?;
    }
    Ok(())
}

/// Strip the executable bit from package-management binaries so a
/// running system cannot mutate itself behind the updater's back.
fn disable_package_management(chroot: &Path) -> Result<(), Error> {
    let bin_dir = chroot.join("usr/bin");
    for entry in std::fs::read_dir(&bin_dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if !(name == "dpkg" || name == "apt" || name.starts_with("apt-")) {
            continue;
        }
        let metadata = entry.metadata()?;
        if !metadata.is_file() {
            continue;
        }
        let mut permissions = metadata.permissions();
        permissions.set_mode(permissions.mode() & !0o111);
        std::fs::set_permissions(entry.path(), permissions)?;
    }
    Ok(())
}

/// Produce the nested squashfs update file from the assembled chroot.
/// Returns the version it was stamped with.
pub fn build_rootfs_image(
    layout: &Layout,
    config: &Config,
    manifest: &Manifest,
    log: &BuildLog,
) -> Result<String, Error> {
    let chroot = layout.chroot_basedir();

    // A fresh update tree; stale release artifacts go too.
    if layout.release_dir().exists() {
        for entry in std::fs::read_dir(layout.release_dir())? {
            let entry = entry?;
            if entry.file_name().to_string_lossy().contains(".update") {
                let _ = std::fs::remove_file(entry.path());
            }
        }
    }
    let _ = std::fs::remove_dir_all(layout.update_dir());
    std::fs::create_dir_all(layout.update_dir())?;
    std::fs::create_dir_all(layout.release_dir())?;

    let version = crate::image::manifest::chroot_version(&chroot)?;
    let mtree_file = generate_mtree(layout, &chroot, &version, log)?;
    std::fs::create_dir_all(chroot.join("conf"))?;
    std::fs::copy(&mtree_file, chroot.join("conf/rootfs.mtree"))?;

    disable_package_management(&chroot)?;
    assert_reference_files(layout, &chroot, true)?;

    run(
        &[
            "mksquashfs",
            &chroot.to_string_lossy(),
            &layout.update_dir().join("rootfs.squashfs").to_string_lossy(),
            "-comp",
            "xz",
        ],
        &RunOptions::default(),
        log,
    )?;

    let version = build_update_manifest(layout, config, manifest, &chroot, log)?;

    if let (Some(key), Some(password)) = (&config.signing_key, &config.signing_password) {
        sign_manifest(layout, key, password, log)?;
    }

    let update_file = layout.update_file_path(&version);
    run(
        &[
            "mksquashfs",
            &layout.update_dir().to_string_lossy(),
            &update_file.to_string_lossy(),
            "-noD",
        ],
        &RunOptions::default(),
        log,
    )?;
    let checksum = crate::image::sha256_file(&update_file)?;
    std::fs::write(layout.update_file_checksum_path(&version), &checksum)?;

    build_release_manifest(layout, &update_file, &checksum)?;
    Ok(version)
}

/// The whole `update` phase: rootfs base cache, package installation,
/// image production. Mounts are cleaned on every exit path.
pub fn build_update(layout: &Layout, config: &Config, manifest: &Manifest) -> Result<String, Error> {
    crate::preflight::validate_reference_files(layout)?;

    let result = build_update_impl(layout, config, manifest);
    clean_mounts(layout, &BuildLog::null());
    result
}

fn build_update_impl(
    layout: &Layout,
    config: &Config,
    manifest: &Manifest,
) -> Result<String, Error> {
    let log_dir = layout.log_dir();

    log::info!(
        "Bootstrapping rootfs chroot [update] ({})",
        log_dir.join("rootfs-bootstrap.log").display()
    );
    let bootstrap = BootstrapDir::new(Variant::Rootfs, layout, manifest);
    {
        let log = BuildLog::to_file(&log_dir.join("rootfs-bootstrap.log"))?;
        let client = hash::http_client()?;
        bootstrap.setup(&client, &log)?;
        setup_chroot_basedir(layout, &bootstrap, &log)?;
    }

    log::info!(
        "Installing rootfs packages [update] ({})",
        log_dir.join("rootfs-packages.log").display()
    );
    let packages_result = {
        let log = BuildLog::to_file(&log_dir.join("rootfs-packages.log"))?;
        install_rootfs_packages(layout, manifest, &log)
    };
    if let Err(e) = packages_result {
        umount_chroot_basedir(layout, &BuildLog::null());
        return Err(e);
    }

    log::info!(
        "Building rootfs image [update] ({})",
        log_dir.join("rootfs-image.log").display()
    );
    let log = BuildLog::to_file(&log_dir.join("rootfs-image.log"))?;
    umount_chroot_basedir(layout, &log);
    let version = build_rootfs_image(layout, config, manifest, &log)?;
    Ok(version)
}

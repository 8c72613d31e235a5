//! Chroot preparation for the rootfs and ISO phases.
//!
//! Unlike package builds, the image phases work in a single chroot
//! restored from the relevant base-chroot cache, with only `proc`,
//! `sysfs` and the package directory bind-mounted.

use crate::bootstrap::BootstrapDir;
use crate::error::Error;
use crate::logs::BuildLog;
use crate::paths::Layout;
use crate::run::{run, RunOptions};

/// tmpfs size backing the image-phase chroot.
const IMAGE_TMPFS_SIZE: &str = "size=12G";

/// Release directory as seen from inside the chroot.
pub const RELEASE_DIR_IN_CHROOT: &str = "tmp/release";

/// CD assembly directory as seen from inside the chroot.
pub const CD_DIR_IN_CHROOT: &str = "tmp/cdrom";

/// Restore the cached base chroot and attach the standard mounts.
pub fn setup_chroot_basedir(
    layout: &Layout,
    bootstrap: &BootstrapDir,
    log: &BuildLog,
) -> Result<(), Error> {
    let chroot = layout.chroot_basedir();
    let _ = std::fs::remove_dir_all(&chroot);
    std::fs::create_dir_all(layout.tmpfs())?;
    run(
        &[
            "mount",
            "-t",
            "tmpfs",
            "-o",
            IMAGE_TMPFS_SIZE,
            "tmpfs",
            &layout.tmpfs().to_string_lossy(),
        ],
        &RunOptions::default(),
        log,
    )?;
    bootstrap.restore(&chroot, log)?;
    run(
        &[
            "mount",
            "proc",
            &chroot.join("proc").to_string_lossy(),
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
            &chroot.join("sys").to_string_lossy(),
            "-t",
            "sysfs",
        ],
        &RunOptions::default(),
        log,
    )?;
    std::fs::create_dir_all(chroot.join("packages"))?;
    run(
        &[
            "mount",
            "--bind",
            &layout.pkg_dir().to_string_lossy(),
            &chroot.join("packages").to_string_lossy(),
        ],
        &RunOptions::default(),
        log,
    )?;
    Ok(())
}

/// Unmount everything attached by [`setup_chroot_basedir`] and the ISO
/// phase, best-effort.
pub fn umount_chroot_basedir(layout: &Layout, log: &BuildLog) {
    let chroot = layout.chroot_basedir();
    let no_check = RunOptions {
        no_check: true,
        ..Default::default()
    };
    for target in [
        chroot.join("packages"),
        chroot.join("proc"),
        chroot.join("sys"),
        chroot.join(RELEASE_DIR_IN_CHROOT),
        chroot.join(CD_DIR_IN_CHROOT),
    ] {
        let _ = run(&["umount", "-f", &target.to_string_lossy()], &no_check, log);
    }
}

/// Remove the chroot tree and release the tmpfs.
pub fn umount_tmpfs_and_clean_chroot_dir(layout: &Layout, log: &BuildLog) {
    let _ = std::fs::remove_dir_all(layout.chroot_basedir());
    let _ = run(
        &["umount", "-f", &layout.tmpfs().to_string_lossy()],
        &RunOptions {
            no_check: true,
            ..Default::default()
        },
        log,
    );
}

/// Full image-phase mount cleanup.
pub fn clean_mounts(layout: &Layout, log: &BuildLog) {
    umount_chroot_basedir(layout, log);
    umount_tmpfs_and_clean_chroot_dir(layout, log);
}

//! mtree manifest of the assembled rootfs.
//!
//! The mtree records mode, ownership, type, link target, size and
//! SHA-256 for everything an installed system should consider immutable.
//! Files that are generated at first boot or change routinely are
//! removed or excluded beforehand so verification only flags real drift.

use crate::error::Error;
use crate::logs::BuildLog;
use crate::paths::Layout;
use crate::run::{run, RunOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Directories the mtree covers.
pub const MTREE_DIRS: &[&str] = &["boot", "etc", "usr", "opt", "var", "conf/audit_rules"];

/// Default files that the installed system regenerates; removed from the
/// image before the mtree is taken.
const ETC_FILES_TO_REMOVE: &[&str] = &[
    "etc/exports",
    "etc/ftpusers",
    "etc/hostname",
    "etc/hosts",
    "etc/idmapd.conf",
    "etc/krb5.conf",
    "etc/mailname",
    "etc/motd",
    "etc/nscd.conf",
    "etc/resolv.conf",
    "etc/ssh/sshd_config",
    "etc/subgid",
    "etc/subuid",
];

/// Directories removed before the mtree is taken.
const DIRS_TO_REMOVE: &[&str] = &["etc/nfs.conf.d"];

/// Paths excluded from the mtree because they exist on first boot but
/// are dynamically generated or contain routinely changing data.
const MTREE_EXCLUDES: &[&str] = &[
    "./boot/initrd.img*",
    "./etc/aliases",
    "./etc/console-setup/cached_setup_*",
    "./etc/default/keyboard",
    "./etc/default/zfs",
    "./etc/fstab",
    "./etc/group",
    "./etc/machine-id",
    "./etc/nsswitch.conf",
    "./etc/passwd",
    "./etc/shadow",
    "./etc/sudoers",
    "./usr/lib/debug/*",
    "./var/cache",
    "./var/lib/dbus/machine-id",
    "./var/log/*",
    "./var/spool/*",
    "./var/trash",
];

/// Options bsdtar records per entry.
const MTREE_OPTIONS: &str = "!all,mode,uid,gid,type,link,size,sha256";

/// Generate the rootfs mtree, prepend the version header and write the
/// SHA-256 sidecar. Returns the mtree path.
pub fn generate_mtree(
    layout: &Layout,
    chroot: &Path,
    version: &str,
    log: &BuildLog,
) -> Result<PathBuf, Error> {
    for file in ETC_FILES_TO_REMOVE {
        let _ = std::fs::remove_file(chroot.join(file));
    }
    for dir in DIRS_TO_REMOVE {
        let _ = std::fs::remove_dir_all(chroot.join(dir));
    }

    let scratch = tempfile::NamedTempFile::new()?;
    let scratch_path = scratch.path().to_string_lossy().to_string();

    let mut argv: Vec<&str> = vec![
        "bsdtar",
        "-f",
        &scratch_path,
        "-c",
        "--format=mtree",
    ];
    for exclude in MTREE_EXCLUDES.iter().copied() {
        argv.push("--exclude");
        argv.push(exclude);
    }
    argv.push("--options");
    argv.push(MTREE_OPTIONS);
    let dirs: Vec<&str> = MTREE_DIRS
        .iter()
        .copied()
        .filter(|dir| chroot.join(dir).exists())
        .collect();
    argv.extend(&dirs);

    run(
        &argv,
        &RunOptions {
            cwd: Some(chroot.to_path_buf()),
            ..Default::default()
        },
        log,
    )?;

    let mtree_path = layout.mtree_path();
    if let Some(parent) = mtree_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut out = std::fs::File::create(&mtree_path)?;
    writeln!(out, "# {}", version)?;
    let body = std::fs::read(scratch.path())?;
    out.write_all(&body)?;
    out.flush()?;
    drop(out);

    let digest = super::sha256_file(&mtree_path)?;
    std::fs::write(
        mtree_path.with_extension("mtree.sha256"),
        digest,
    )?;
    Ok(mtree_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preflight::which;

    #[test]
    fn test_generate_mtree_header_and_sidecar() {
        if which("bsdtar").is_none() {
            // Host tool not present; generation is covered end to end on
            // build hosts where preflight guarantees bsdtar.
            return;
        }
        let td = tempfile::tempdir().unwrap();
        let layout = Layout::new(td.path().join("builder"));
        let chroot = td.path().join("chroot");
        std::fs::create_dir_all(chroot.join("etc")).unwrap();
        std::fs::write(chroot.join("etc/version"), "25.04.0").unwrap();
        std::fs::write(chroot.join("etc/resolv.conf"), "nameserver 1.1.1.1").unwrap();

        let path =
            generate_mtree(&layout, &chroot, "25.04.0", &crate::logs::BuildLog::null()).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.starts_with("# 25.04.0\n"));
        assert!(contents.contains("etc/version"));
        // Removed before generation.
        assert!(!chroot.join("etc/resolv.conf").exists());

        let sidecar = std::fs::read_to_string(path.with_extension("mtree.sha256")).unwrap();
        assert_eq!(sidecar.len(), 64);
    }
}

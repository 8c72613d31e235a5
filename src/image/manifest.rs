//! Update and release manifests.

use crate::config::Config;
use crate::error::Error;
use crate::logs::BuildLog;
use crate::manifest::Manifest;
use crate::paths::Layout;
use crate::run::{run, run_shell, RunOptions};
use lazy_regex::regex;
use std::path::Path;

/// Version stamped into the rootfs at build time.
pub fn chroot_version(chroot: &Path) -> Result<String, Error> {
    Ok(std::fs::read_to_string(chroot.join("etc/version"))?
        .trim()
        .to_string())
}

/// Kernel version of the image: the first non-debug `vmlinuz-*` under
/// `boot/`.
pub fn kernel_version(chroot: &Path) -> Result<String, Error> {
    let pattern = regex!(r"^vmlinuz-(.+)$");
    for entry in std::fs::read_dir(chroot.join("boot"))? {
        let name = entry?.file_name().to_string_lossy().to_string();
        if let Some(captures) = pattern.captures(&name) {
            let version = &captures[1];
            if !version.contains("debug") {
                return Ok(version.to_string());
            }
        }
    }
    Err(Error::Call("No kernel found in rootfs boot directory".to_string()))
}

fn rootfs_size_estimate(chroot: &Path, log: &BuildLog) -> Result<u64, Error> {
    let out = run(
        &[
            "du",
            "--block-size",
            "1",
            "-d",
            "0",
            "-x",
            &chroot.to_string_lossy(),
        ],
        &RunOptions {
            quiet: true,
            ..Default::default()
        },
        log,
    )?;
    let bytes: u64 = out
        .stdout
        .split_whitespace()
        .next()
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| Error::Call("Unable to parse du output".to_string()))?;
    // Headroom for filesystem overhead when the installer sizes the
    // target dataset.
    Ok((bytes as f64 * 1.1) as u64)
}

/// Assemble `update/manifest.json` next to the inner rootfs image.
/// Returns the version the update file will be named after.
pub fn build_update_manifest(
    layout: &Layout,
    config: &Config,
    manifest: &Manifest,
    chroot: &Path,
    log: &BuildLog,
) -> Result<String, Error> {
    let version = chroot_version(chroot)?;
    let update_dir = layout.update_dir();

    // The offline installer is copied out of the builder tree. A source
    // package by the same name would also install it into the image;
    // refuse the ambiguity instead of picking a winner.
    let installer = layout.installer_dir();
    if installer.exists() {
        if manifest
            .iter_source_specs()
            .any(|spec| spec.name == "truenas_install")
        {
            return Err(Error::InvalidManifest(
                "truenas_install is declared as a source package and present in the builder tree"
                    .to_string(),
            ));
        }
        let mut options = fs_extra::dir::CopyOptions::new();
        options.copy_inside = true;
        fs_extra::dir::copy(&installer, update_dir.join("truenas_install"), &options)
            .map_err(|e| Error::Call(format!("Unable to copy installer payload: {}", e)))?;
    }

    let mut checksums = serde_json::Map::new();
    for entry in walkdir::WalkDir::new(&update_dir) {
        let entry = entry.map_err(|e| Error::Call(e.to_string()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(&update_dir)
            .map_err(|e| Error::Call(e.to_string()))?
            .to_string_lossy()
            .to_string();
        checksums.insert(
            relative,
            serde_json::Value::String(super::sha1_file(entry.path())?),
        );
    }

    let document = serde_json::json!({
        "date": config.build_time.to_rfc3339(),
        "version": version,
        "size": rootfs_size_estimate(chroot, log)?,
        "checksums": checksums,
        "kernel_version": kernel_version(chroot)?,
    });
    std::fs::write(
        update_dir.join("manifest.json"),
        serde_json::to_string(&document).map_err(|e| Error::Call(e.to_string()))?,
    )?;
    Ok(version)
}

/// Detach-sign the update manifest with gpg.
pub fn sign_manifest(layout: &Layout, key: &str, password: &str, log: &BuildLog) -> Result<(), Error> {
    let update_dir = layout.update_dir();
    run_shell(
        &format!(
            "echo \"{}\" | gpg -ab --batch --yes --no-use-agent --pinentry-mode loopback \
             --passphrase-fd 0 --default-key {} --output {} --sign {}",
            password,
            key,
            update_dir.join("MANIFEST.sig").display(),
            update_dir.join("manifest.json").display()
        ),
        &RunOptions {
            quiet: true,
            ..Default::default()
        },
        log,
    )
    .map_err(|_| Error::Call("Failed gpg signing with SIGNING_PASSWORD".to_string()))?;
    Ok(())
}

/// Write `release/manifest.json` describing the produced update file.
pub fn build_release_manifest(
    layout: &Layout,
    update_file: &Path,
    update_file_checksum: &str,
) -> Result<(), Error> {
    let inner: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(
        layout.update_dir().join("manifest.json"),
    )?)
    .map_err(|e| Error::Call(e.to_string()))?;

    let document = serde_json::json!({
        "filename": update_file.file_name().map(|n| n.to_string_lossy().to_string()),
        "version": inner["version"],
        "date": inner["date"],
        "changelog": "",
        "checksum": update_file_checksum,
        "filesize": std::fs::metadata(update_file)?.len(),
    });
    std::fs::write(
        layout.release_manifest_path(),
        serde_json::to_string(&document).map_err(|e| Error::Call(e.to_string()))?,
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kernel_version_skips_debug() {
        let td = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(td.path().join("boot")).unwrap();
        std::fs::write(
            td.path().join("boot/vmlinuz-6.6.44-debug+truenas"),
            b"",
        )
        .unwrap();
        std::fs::write(
            td.path().join("boot/vmlinuz-6.6.44-production+truenas"),
            b"",
        )
        .unwrap();
        let version = kernel_version(td.path()).unwrap();
        assert_eq!(version, "6.6.44-production+truenas");
    }

    #[test]
    fn test_release_manifest_shape() {
        let td = tempfile::tempdir().unwrap();
        let layout = Layout::new(td.path());
        layout.setup_dirs().unwrap();
        std::fs::create_dir_all(layout.update_dir()).unwrap();
        std::fs::write(
            layout.update_dir().join("manifest.json"),
            r#"{"version":"25.04.0","date":"2025-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        let update_file = layout.update_file_path("25.04.0");
        std::fs::write(&update_file, b"payload").unwrap();

        build_release_manifest(&layout, &update_file, "deadbeef").unwrap();
        let release: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(layout.release_manifest_path()).unwrap(),
        )
        .unwrap();
        assert_eq!(release["filename"], "TrueNAS-SCALE-25.04.0.update");
        assert_eq!(release["version"], "25.04.0");
        assert_eq!(release["checksum"], "deadbeef");
        assert_eq!(release["filesize"], 7);
        assert_eq!(release["changelog"], "");
    }
}

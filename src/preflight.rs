//! Host validation before any phase runs.

use crate::error::Error;
use crate::paths::Layout;

/// Host tools every build needs.
pub const WANTED_PACKAGES: &[&str] = &[
    "debootstrap",
    "git",
    "mksquashfs",
    "unsquashfs",
    "rsync",
    "grub-mkrescue",
    "xorriso",
    "bsdtar",
];

const REQUIRED_RAM_GIB: u64 = 16;

/// Look `name` up on `PATH`.
pub fn which(name: &str) -> Option<std::path::PathBuf> {
    let path = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path) {
        let candidate = dir.join(name);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

/// The required host tools that are absent.
pub fn retrieve_missing_packages() -> Vec<String> {
    WANTED_PACKAGES
        .iter()
        .filter(|pkg| which(pkg).is_none())
        .map(|pkg| pkg.to_string())
        .collect()
}

fn total_ram_bytes() -> Option<u64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    let line = meminfo.lines().find(|l| l.starts_with("MemTotal:"))?;
    let kib: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kib * 1024)
}

/// Whether the host has less memory than builds comfortably need.
pub fn has_low_ram() -> bool {
    match total_ram_bytes() {
        Some(total) => total < REQUIRED_RAM_GIB * 1024 * 1024 * 1024,
        None => false,
    }
}

/// Validate the host: root privileges and required tools.
pub fn validate_system_state() -> Result<(), Error> {
    if !nix::unistd::geteuid().is_root() {
        return Err(Error::Call(
            "Must be run as root (or using sudo)!".to_string(),
        ));
    }
    let missing = retrieve_missing_packages();
    if !missing.is_empty() {
        return Err(Error::MissingPackages(missing));
    }
    Ok(())
}

/// Full preflight: host validation, RAM warning, directory setup.
pub fn preflight_check(layout: &Layout) -> Result<(), Error> {
    validate_system_state()?;
    if has_low_ram() {
        log::warn!(
            "Running with less than {}GB of memory. Build may fail...",
            REQUIRED_RAM_GIB
        );
    }
    layout.setup_dirs()?;
    Ok(())
}

/// Validate that the reference uid/gid files are present when a rootfs
/// build is requested.
pub fn validate_reference_files(layout: &Layout) -> Result<(), Error> {
    for reference in crate::paths::REFERENCE_FILES {
        let path = layout.reference_files_dir().join(reference);
        if !path.exists() {
            return Err(Error::Call(format!(
                "Missing reference file {}",
                path.display()
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::which;

    #[test]
    fn test_which_finds_sh() {
        assert!(which("sh").is_some());
        assert!(which("definitely-not-a-real-binary-xyz").is_none());
    }
}

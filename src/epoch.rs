//! Build-epoch bookkeeping.
//!
//! The manifest carries an integer epoch. When it no longer matches the
//! recorded one, everything cached under `tmp/` is stale; the run either
//! aborts or, when `FORCE_CLEANUP_WITH_EPOCH_CHANGE` is set, cleans the
//! scratch trees and continues.

use crate::config::Config;
use crate::error::Error;
use crate::manifest::Manifest;
use crate::paths::Layout;

fn write_epoch(layout: &Layout, epoch: i64) -> Result<(), Error> {
    std::fs::create_dir_all(layout.tmp_dir())?;
    std::fs::write(layout.epoch_path(), epoch.to_string())?;
    Ok(())
}

/// Compare the manifest epoch against the recorded one, handling a
/// mismatch per configuration.
pub fn check_epoch(layout: &Layout, manifest: &Manifest, config: &Config) -> Result<(), Error> {
    let recorded = std::fs::read_to_string(layout.epoch_path())
        .ok()
        .and_then(|s| s.trim().parse::<i64>().ok());
    match recorded {
        Some(epoch) if epoch == manifest.build_epoch => Ok(()),
        Some(_) => {
            if config.force_cleanup_with_epoch_change {
                log::warn!(
                    "Build epoch changed! Removing temporary files and forcing clean build."
                );
                crate::clean::clean_temporary_trees(layout)?;
                write_epoch(layout, manifest.build_epoch)
            } else {
                Err(Error::Call(
                    "Build epoch changed; run clean or set FORCE_CLEANUP_WITH_EPOCH_CHANGE"
                        .to_string(),
                ))
            }
        }
        None => write_epoch(layout, manifest.build_epoch),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture(force: bool) -> (tempfile::TempDir, Layout, Manifest, Config) {
        let td = tempfile::tempdir().unwrap();
        let layout = Layout::new(td.path());
        let manifest: Manifest = serde_yaml::from_str(
            r#"
code_name: Angelfish
debian_release: bullseye
apt-repos:
  url: https://apt.example.org/debian
  distribution: bullseye
  components: main
build-epoch: 3
sources:
  - name: openzfs
    repo: https://github.com/truenas/zfs
    branch: master
"#,
        )
        .unwrap();
        let mut config = Config::from_env();
        config.force_cleanup_with_epoch_change = force;
        (td, layout, manifest, config)
    }

    #[test]
    fn test_epoch_recorded_on_first_run() {
        let (_td, layout, manifest, config) = fixture(false);
        check_epoch(&layout, &manifest, &config).unwrap();
        assert_eq!(
            std::fs::read_to_string(layout.epoch_path()).unwrap(),
            "3"
        );
        // Matching epoch is a no-op.
        check_epoch(&layout, &manifest, &config).unwrap();
    }

    #[test]
    fn test_epoch_mismatch_errors() {
        let (_td, layout, manifest, config) = fixture(false);
        std::fs::create_dir_all(layout.tmp_dir()).unwrap();
        std::fs::write(layout.epoch_path(), "2").unwrap();
        assert!(check_epoch(&layout, &manifest, &config).is_err());
    }

    #[test]
    fn test_epoch_mismatch_cleans_when_forced() {
        let (_td, layout, manifest, config) = fixture(true);
        layout.setup_dirs().unwrap();
        std::fs::write(layout.epoch_path(), "2").unwrap();
        std::fs::write(layout.pkg_dir().join("stale.deb"), b"x").unwrap();
        check_epoch(&layout, &manifest, &config).unwrap();
        assert!(!layout.pkg_dir().join("stale.deb").exists());
        assert_eq!(
            std::fs::read_to_string(layout.epoch_path()).unwrap(),
            "3"
        );
    }
}

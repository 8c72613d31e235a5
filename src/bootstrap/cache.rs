//! squashfs cache files for base chroots.
//!
//! Each cached chroot is a squashfs image next to a sidecar `.hash` file
//! holding the repo hash it was built against. The two form a coherent
//! pair: if either is missing or the hash no longer matches, both are
//! removed.

use crate::error::Error;
use crate::logs::BuildLog;
use crate::run::{run, RunOptions};
use std::path::{Path, PathBuf};

/// A squashfs cache image plus its sidecar hash file.
#[derive(Debug, Clone)]
pub struct CacheFile {
    /// Path of the squashfs image.
    pub squashfs: PathBuf,
    /// Path of the sidecar hash file.
    pub hash_file: PathBuf,
}

impl CacheFile {
    /// Cache pair for `filename` inside `cache_dir`.
    pub fn new(cache_dir: &Path, filename: &str) -> CacheFile {
        CacheFile {
            squashfs: cache_dir.join(filename),
            hash_file: cache_dir.join(format!("{}.hash", filename)),
        }
    }

    /// Whether both halves of the pair exist.
    pub fn exists(&self) -> bool {
        self.squashfs.exists() && self.hash_file.exists()
    }

    /// The recorded repo hash, if the pair is present.
    pub fn stored_hash(&self) -> Option<String> {
        if !self.exists() {
            return None;
        }
        std::fs::read_to_string(&self.hash_file)
            .ok()
            .map(|s| s.trim().to_string())
    }

    /// Remove whichever halves exist.
    pub fn remove(&self) {
        for path in [&self.squashfs, &self.hash_file] {
            if path.exists() {
                let _ = std::fs::remove_file(path);
            }
        }
    }

    /// Whether the cache is valid for `current_hash`. An invalid cache
    /// is removed as a side effect so a partial pair can never be
    /// restored.
    pub fn is_intact(&self, current_hash: &str, log: &BuildLog) -> bool {
        let intact = match self.stored_hash() {
            None => {
                log.line("Basechroot cache does not exist");
                false
            }
            Some(stored) if stored != current_hash => {
                log.line("Upstream repo changed! Removing squashfs cache to re-create.");
                false
            }
            Some(_) => true,
        };
        if !intact {
            self.remove();
        }
        intact
    }

    /// Serialize `chroot` into the squashfs image and record `hash`.
    pub fn save(&self, chroot: &Path, hash: &str, log: &BuildLog) -> Result<(), Error> {
        if let Some(parent) = self.squashfs.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if self.squashfs.exists() {
            std::fs::remove_file(&self.squashfs)?;
        }
        run(
            &[
                "mksquashfs",
                &chroot.to_string_lossy(),
                &self.squashfs.to_string_lossy(),
            ],
            &RunOptions::default(),
            log,
        )?;
        std::fs::write(&self.hash_file, hash)?;
        Ok(())
    }

    /// Restore the cached chroot into `dst`.
    pub fn restore(&self, dst: &Path, log: &BuildLog) -> Result<(), Error> {
        run(
            &[
                "unsquashfs",
                "-f",
                "-d",
                &dst.to_string_lossy(),
                &self.squashfs.to_string_lossy(),
            ],
            &RunOptions::default(),
            log,
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::CacheFile;
    use crate::logs::BuildLog;

    #[test]
    fn test_pair_coherence() {
        let td = tempfile::tempdir().unwrap();
        let cache = CacheFile::new(td.path(), "basechroot-package.squashfs");
        assert!(!cache.exists());

        std::fs::write(&cache.squashfs, b"squash").unwrap();
        // Sidecar missing: not intact, and the orphan image is removed.
        assert!(!cache.is_intact("abc", &BuildLog::null()));
        assert!(!cache.squashfs.exists());

        std::fs::write(&cache.squashfs, b"squash").unwrap();
        std::fs::write(&cache.hash_file, "abc\n").unwrap();
        assert!(cache.is_intact("abc", &BuildLog::null()));
        assert_eq!(cache.stored_hash().as_deref(), Some("abc"));

        // Hash mismatch removes both halves.
        assert!(!cache.is_intact("def", &BuildLog::null()));
        assert!(!cache.squashfs.exists());
        assert!(!cache.hash_file.exists());
    }
}

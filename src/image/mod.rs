//! Rootfs and ISO image composition.

/// Chroot preparation for the image phases.
pub mod bootstrap;
/// ISO assembly.
pub mod iso;
/// Update and release manifests.
pub mod manifest;
/// mtree generation over the assembled rootfs.
pub mod mtree;
/// Reference uid/gid file comparison.
pub mod reference_files;
/// Rootfs installation and update-file assembly.
pub mod update;

use crate::error::Error;
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;

/// SHA-256 of a file, hex encoded.
pub fn sha256_file(path: &Path) -> Result<String, Error> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// SHA-1 of a file, hex encoded. Only used for the update payload's
/// checksum table, which installers still expect in this format.
pub fn sha1_file(path: &Path) -> Result<String, Error> {
    use sha1::Sha1;
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha1::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::{sha1_file, sha256_file};

    #[test]
    fn test_file_digests() {
        let td = tempfile::tempdir().unwrap();
        let path = td.path().join("f");
        std::fs::write(&path, b"abc").unwrap();
        assert_eq!(
            sha256_file(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(
            sha1_file(&path).unwrap(),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
    }
}

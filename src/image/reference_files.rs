//! Reference uid/gid file comparison.
//!
//! `conf/reference-files/etc/{passwd,group}` pin user and group ids
//! across builds. After rootfs assembly the files in the chroot must
//! match the reference exactly; any drift means a package created an
//! account and the reference needs a deliberate update.

use crate::error::Error;
use crate::paths::{Layout, REFERENCE_FILES};
use std::collections::HashSet;
use std::path::Path;

/// One reference-file comparison result.
#[derive(Debug)]
pub struct ReferenceDiff {
    /// Which file differed, relative to the chroot root.
    pub file: String,
    /// Differing lines, `-` reference / `+` chroot.
    pub diff: Vec<String>,
}

fn diff_lines(reference: &[String], real: &[String]) -> Vec<String> {
    let mut out = Vec::new();
    let ref_set: HashSet<&String> = reference.iter().collect();
    let real_set: HashSet<&String> = real.iter().collect();
    for line in reference {
        if !real_set.contains(line) {
            out.push(format!("-{}", line));
        }
    }
    for line in real {
        if !ref_set.contains(line) {
            out.push(format!("+{}", line));
        }
    }
    out
}

/// Compare each reference file against its counterpart in `chroot`.
///
/// With `cut_nonexistent_user_group_membership` set, group membership in
/// the reference is trimmed to users that already exist in the chroot's
/// passwd; a freshly installed system cannot list members that have not
/// been created yet.
pub fn compare_reference_files(
    layout: &Layout,
    chroot: &Path,
    cut_nonexistent_user_group_membership: bool,
) -> Result<Vec<ReferenceDiff>, Error> {
    let mut diffs = Vec::new();
    for reference_file in REFERENCE_FILES {
        let reference_path = layout.reference_files_dir().join(reference_file);
        let chroot_path = chroot.join(reference_file);
        if !chroot_path.exists() {
            return Err(Error::Call(format!(
                "File {:?} does not exist in chroot",
                reference_file
            )));
        }

        let mut reference: Vec<String> = std::fs::read_to_string(&reference_path)?
            .lines()
            .map(str::to_string)
            .collect();
        let real: Vec<String> = std::fs::read_to_string(&chroot_path)?
            .lines()
            .map(str::to_string)
            .collect();

        if cut_nonexistent_user_group_membership && *reference_file == "etc/group" {
            let existing: HashSet<String> = std::fs::read_to_string(chroot.join("etc/passwd"))?
                .lines()
                .filter_map(|line| line.split(':').next().map(str::to_string))
                .collect();
            for line in reference.iter_mut() {
                let mut bits: Vec<&str> = line.split(':').collect();
                if bits.len() < 4 {
                    continue;
                }
                let members: Vec<&str> = bits[3]
                    .split(',')
                    .filter(|user| existing.contains(*user))
                    .collect();
                let joined = members.join(",");
                bits[3] = &joined;
                *line = bits.join(":");
            }
        }

        let diff = diff_lines(&reference, &real);
        if !diff.is_empty() {
            diffs.push(ReferenceDiff {
                file: reference_file.to_string(),
                diff,
            });
        }
    }
    Ok(diffs)
}

/// Fail with [`Error::IntegrityFailure`] when any reference file drifted.
pub fn assert_reference_files(
    layout: &Layout,
    chroot: &Path,
    cut_nonexistent_user_group_membership: bool,
) -> Result<(), Error> {
    let diffs =
        compare_reference_files(layout, chroot, cut_nonexistent_user_group_membership)?;
    if diffs.is_empty() {
        return Ok(());
    }
    let mut message = String::from("reference files changed by package installation:");
    for diff in diffs {
        message.push_str(&format!("\n{}:\n{}", diff.file, diff.diff.join("\n")));
    }
    Err(Error::IntegrityFailure(message))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture(
        reference_group: &str,
        chroot_passwd: &str,
        chroot_group: &str,
    ) -> (tempfile::TempDir, Layout, std::path::PathBuf) {
        let td = tempfile::tempdir().unwrap();
        let layout = Layout::new(td.path().join("builder"));
        let refs = layout.reference_files_dir().join("etc");
        std::fs::create_dir_all(&refs).unwrap();
        std::fs::write(refs.join("passwd"), chroot_passwd).unwrap();
        std::fs::write(refs.join("group"), reference_group).unwrap();

        let chroot = td.path().join("chroot");
        std::fs::create_dir_all(chroot.join("etc")).unwrap();
        std::fs::write(chroot.join("etc/passwd"), chroot_passwd).unwrap();
        std::fs::write(chroot.join("etc/group"), chroot_group).unwrap();
        (td, layout, chroot)
    }

    #[test]
    fn test_identical_files_pass() {
        let (_td, layout, chroot) = fixture(
            "root:x:0:\n",
            "root:x:0:0:root:/root:/bin/bash\n",
            "root:x:0:\n",
        );
        assert_reference_files(&layout, &chroot, false).unwrap();
    }

    #[test]
    fn test_drift_is_integrity_failure() {
        let (_td, layout, chroot) = fixture(
            "root:x:0:\n",
            "root:x:0:0:root:/root:/bin/bash\n",
            "root:x:0:\nrogue:x:999:\n",
        );
        match assert_reference_files(&layout, &chroot, false) {
            Err(Error::IntegrityFailure(msg)) => assert!(msg.contains("rogue")),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_membership_trimmed_for_missing_users() {
        // The reference lists an operator user in the group that the
        // chroot has not created yet; trimming makes them match.
        let (_td, layout, chroot) = fixture(
            "sudo:x:27:root,operator\n",
            "root:x:0:0:root:/root:/bin/bash\n",
            "sudo:x:27:root\n",
        );
        assert!(assert_reference_files(&layout, &chroot, false).is_err());
        assert_reference_files(&layout, &chroot, true).unwrap();
    }
}

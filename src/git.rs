//! git queries for source trees.

use crate::error::Error;
use crate::logs::BuildLog;
use crate::paths::Layout;
use crate::run::{run, RunOptions};
use lazy_regex::regex;
use std::io::Write;
use std::path::Path;

fn quiet() -> RunOptions {
    RunOptions {
        quiet: true,
        ..Default::default()
    }
}

/// Short SHA of HEAD in `path`.
pub fn head_sha(path: &Path) -> Result<String, Error> {
    let out = run(
        &["git", "-C", &path.to_string_lossy(), "rev-parse", "--short", "HEAD"],
        &quiet(),
        &BuildLog::null(),
    )?;
    Ok(out.stdout.trim().to_string())
}

/// Whether the working tree at `path` has uncommitted changes.
pub fn is_dirty(path: &Path) -> Result<bool, Error> {
    let out = run(
        &["git", "-C", &path.to_string_lossy(), "status", "--porcelain"],
        &quiet(),
        &BuildLog::null(),
    )?;
    Ok(!out.stdout.trim().is_empty())
}

/// The currently checked-out branch of `path`, if any.
pub fn current_branch(path: &Path) -> Option<String> {
    let out = run(
        &[
            "git",
            "-C",
            &path.to_string_lossy(),
            "branch",
            "--show-current",
        ],
        &RunOptions {
            quiet: true,
            no_check: true,
            ..Default::default()
        },
        &BuildLog::null(),
    )
    .ok()?;
    let branch = out.stdout.trim();
    if out.success() && !branch.is_empty() {
        Some(branch.to_string())
    } else {
        None
    }
}

/// The `origin` remote URL of `path`, if configured.
pub fn origin_url(path: &Path) -> Option<String> {
    let out = run(
        &[
            "git",
            "-C",
            &path.to_string_lossy(),
            "remote",
            "get-url",
            "origin",
        ],
        &RunOptions {
            quiet: true,
            no_check: true,
            ..Default::default()
        },
        &BuildLog::null(),
    )
    .ok()?;
    if out.success() {
        Some(out.stdout.trim().to_string())
    } else {
        None
    }
}

/// Whether `branch` exists on the remote `origin`.
pub fn branch_exists_in_repository(origin: &str, branch: &str) -> Result<bool, Error> {
    let out = run(&["git", "ls-remote", origin], &quiet(), &BuildLog::null())?;
    let pattern = regex!(r"refs/heads/(\S+)");
    Ok(pattern
        .captures_iter(&out.stdout)
        .any(|c| &c[1] == branch))
}

/// Append a `<url> <short-sha>` line to `logs/GITMANIFEST`, truncating
/// first when `truncate` is set.
pub fn update_git_manifest(
    layout: &Layout,
    url: &str,
    sha: &str,
    truncate: bool,
) -> Result<(), Error> {
    let path = layout.git_manifest_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(!truncate)
        .write(true)
        .truncate(truncate)
        .open(path)?;
    writeln!(file, "{} {}", url, sha)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::run_shell;

    fn init_repo(dir: &Path) {
        run_shell(
            &format!(
                "cd {} && git init -q -b main && git config user.email t@e && \
                 git config user.name t && echo x > f && git add f && git commit -qm init",
                dir.display()
            ),
            &RunOptions::default(),
            &BuildLog::null(),
        )
        .unwrap();
    }

    #[test]
    fn test_head_sha_and_dirty() {
        let td = tempfile::tempdir().unwrap();
        init_repo(td.path());
        let sha = head_sha(td.path()).unwrap();
        assert!(!sha.is_empty());
        assert!(!is_dirty(td.path()).unwrap());
        std::fs::write(td.path().join("f"), "changed").unwrap();
        assert!(is_dirty(td.path()).unwrap());
    }

    #[test]
    fn test_current_branch() {
        let td = tempfile::tempdir().unwrap();
        init_repo(td.path());
        assert_eq!(current_branch(td.path()).as_deref(), Some("main"));
    }

    #[test]
    fn test_git_manifest_modes() {
        let td = tempfile::tempdir().unwrap();
        let layout = Layout::new(td.path());
        update_git_manifest(&layout, "https://example.org/a", "abc1234", true).unwrap();
        update_git_manifest(&layout, "https://example.org/b", "def5678", false).unwrap();
        let contents = std::fs::read_to_string(layout.git_manifest_path()).unwrap();
        assert_eq!(
            contents,
            "https://example.org/a abc1234\nhttps://example.org/b def5678\n"
        );
        update_git_manifest(&layout, "https://example.org/c", "0f0f0f0", true).unwrap();
        let contents = std::fs::read_to_string(layout.git_manifest_path()).unwrap();
        assert_eq!(contents, "https://example.org/c 0f0f0f0\n");
    }
}

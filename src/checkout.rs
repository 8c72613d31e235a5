//! Source tree checkout.
//!
//! Each distinct source tree is cloned or fast-forwarded to its
//! configured branch, honoring the branch-override environment, and its
//! origin/SHA pair is recorded in `logs/GITMANIFEST`.

use crate::config::Config;
use crate::error::Error;
use crate::git;
use crate::logs::BuildLog;
use crate::manifest::Manifest;
use crate::package::SourcePackage;
use crate::paths::Layout;
use crate::run::{run, RunOptions};

const CHECKOUT_RETRIES: usize = 3;

/// Resolve the branch to check out for `pkg`: explicit overrides win,
/// then `TRY_BRANCH_OVERRIDE` when it exists on the remote, then the
/// manifest branch.
fn resolve_branch(pkg: &SourcePackage, config: &Config) -> String {
    let mut branch = pkg.effective_branch(config).to_string();
    if let Some(try_branch) = &config.try_branch_override {
        for attempt in 1..=CHECKOUT_RETRIES {
            match git::branch_exists_in_repository(&pkg.repo, try_branch) {
                Ok(true) => {
                    branch = try_branch.clone();
                    break;
                }
                Ok(false) => break,
                Err(_) if attempt < CHECKOUT_RETRIES => {
                    log::debug!(
                        "Failed to determine if {:?} branch exists for {:?}. Trying again",
                        try_branch,
                        pkg.repo
                    );
                }
                Err(_) => {
                    log::debug!(
                        "Unable to determine if {:?} branch exists in {} attempts.",
                        try_branch,
                        CHECKOUT_RETRIES
                    );
                }
            }
        }
    }
    branch
}

fn checkout_one(
    layout: &Layout,
    pkg: &SourcePackage,
    branch: &str,
) -> Result<(), Error> {
    let path = layout.source_path(&pkg.source_name);
    let path_str = path.to_string_lossy().to_string();
    let update = git::current_branch(&path).as_deref() == Some(branch)
        && git::origin_url(&path).as_deref() == Some(pkg.repo.as_str());

    let log_path = layout.git_log_path(&pkg.source_name);
    for attempt in 1..=CHECKOUT_RETRIES {
        let verb = if update { "Updating" } else { "Checking out" };
        if attempt == 1 {
            log::debug!(
                "{} git repo {:?} (using branch {:?}) ({})",
                verb,
                pkg.source_name,
                branch,
                log_path.display()
            );
        } else {
            log::warn!(
                "Retrying to {} git repo {:?} (using branch {:?})",
                verb.to_lowercase(),
                pkg.source_name,
                branch
            );
        }

        let log = BuildLog::to_file(&log_path)?;
        let commands: Vec<Vec<String>> = if update {
            vec![
                vec!["git".into(), "-C".into(), path_str.clone(), "fetch".into(), "origin".into()],
                vec![
                    "git".into(),
                    "-C".into(),
                    path_str.clone(),
                    "checkout".into(),
                    branch.into(),
                ],
                vec![
                    "git".into(),
                    "-C".into(),
                    path_str.clone(),
                    "reset".into(),
                    "--hard".into(),
                    format!("origin/{}", branch),
                ],
            ]
        } else {
            let _ = std::fs::remove_dir_all(&path);
            vec![
                vec![
                    "git".into(),
                    "clone".into(),
                    "--recurse".into(),
                    pkg.repo.clone(),
                    path_str.clone(),
                ],
                vec![
                    "git".into(),
                    "-C".into(),
                    path_str.clone(),
                    "checkout".into(),
                    branch.into(),
                ],
            ]
        };

        let mut failed: Option<Error> = None;
        for command in &commands {
            let argv: Vec<&str> = command.iter().map(String::as_str).collect();
            if let Err(e) = run(&argv, &RunOptions::default(), &log) {
                failed = Some(e);
                break;
            }
        }

        match failed {
            None => return Ok(()),
            Some(e) => {
                let failed_log = log_path.with_extension(format!("log.failed.{}", attempt));
                let _ = std::fs::copy(&log_path, &failed_log);
                if attempt == CHECKOUT_RETRIES {
                    return Err(e);
                }
                log::warn!("{} (check {} for details)", e, failed_log.display());
            }
        }
    }
    unreachable!()
}

/// Check out every distinct source tree referenced by the manifest.
pub fn checkout_sources(
    layout: &Layout,
    manifest: &Manifest,
    config: &Config,
) -> Result<(), Error> {
    std::fs::create_dir_all(layout.git_log_dir())?;

    // The builder's own tree heads the manifest.
    if let Some(url) = git::origin_url(layout.root()) {
        let sha = git::head_sha(layout.root())?;
        git::update_git_manifest(layout, &url, &sha, true)?;
    }

    log::info!("Starting checkout of sources");
    let mut seen = std::collections::HashSet::new();
    for pkg in SourcePackage::from_manifest(manifest) {
        if !seen.insert(pkg.source_name.clone()) {
            continue;
        }
        let branch = resolve_branch(&pkg, config);
        checkout_one(layout, &pkg, &branch)?;
        let path = layout.source_path(&pkg.source_name);
        let url = git::origin_url(&path).unwrap_or_else(|| pkg.repo.clone());
        git::update_git_manifest(layout, &url, &git::head_sha(&path)?, false)?;
        log::info!(
            "Checkout of git repo {:?} (using branch {:?}) complete",
            pkg.source_name,
            branch
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::run_shell;

    fn init_origin(dir: &std::path::Path, branch: &str) {
        run_shell(
            &format!(
                "cd {} && git init -q -b {} && git config user.email t@e && \
                 git config user.name t && echo 1 > f && git add f && git commit -qm init",
                dir.display(),
                branch
            ),
            &RunOptions::default(),
            &BuildLog::null(),
        )
        .unwrap();
    }

    #[test]
    fn test_checkout_clone_and_update() {
        let origin_td = tempfile::tempdir().unwrap();
        init_origin(origin_td.path(), "master");

        let td = tempfile::tempdir().unwrap();
        let layout = Layout::new(td.path());
        layout.setup_dirs().unwrap();

        let manifest: Manifest = serde_yaml::from_str(&format!(
            r#"
code_name: Angelfish
debian_release: bullseye
apt-repos:
  url: https://apt.example.org/debian
  distribution: bullseye
  components: main
build-epoch: 1
sources:
  - name: demo
    repo: "{}"
    branch: master
"#,
            origin_td.path().display()
        ))
        .unwrap();
        let config = Config::from_env();

        checkout_sources(&layout, &manifest, &config).unwrap();
        assert!(layout.source_path("demo").join("f").exists());
        let recorded = std::fs::read_to_string(layout.git_manifest_path()).unwrap();
        assert!(recorded.contains(&origin_td.path().display().to_string()));

        // A second run takes the fetch/reset path and stays clean.
        checkout_sources(&layout, &manifest, &config).unwrap();
        assert!(layout.source_path("demo").join("f").exists());
    }
}

//! Source packages: the unit of building.
//!
//! A [`SourcePackage`] is the flattened form of a manifest source
//! descriptor: subpackage entries have inherited their parent's branch,
//! repository and source tree, and the implicit dependency set has been
//! merged in. Anything that needs a chroot lives elsewhere; this module
//! is configuration plus per-source on-disk state.

use crate::config::{truthy, Config};
use crate::error::Error;
use crate::manifest::{
    BuildConstraint, ConstraintType, Manifest, RecipeCommand, SourceSpec,
};
use crate::paths::Layout;
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;

/// Source names every package implicitly build-depends on.
pub const MANDATORY_DEPENDENCIES: &[&str] = &["python3"];

/// Source name that is always treated as changed.
pub const ALWAYS_REBUILD: &str = "truenas";

/// Default ready-queue tiebreaker; explicitly prioritized sources use
/// smaller values to get dispatched first.
pub const DEFAULT_BATCH_PRIORITY: i64 = 100;

const DEFAULT_TMPFS_SIZE_GIB: u64 = 12;

/// A fully resolved build unit.
#[derive(Debug, Clone)]
pub struct SourcePackage {
    /// Unique package name.
    pub name: String,
    /// Name of the shared source checkout.
    pub source_name: String,
    /// Git branch built from.
    pub branch: String,
    /// Git remote URL.
    pub repo: String,
    /// Commands run before build-dependency installation.
    pub predepscmd: Vec<RecipeCommand>,
    /// Commands producing the control file inside a transient overlay.
    pub depscmd: Vec<RecipeCommand>,
    /// Commands run right before the build.
    pub prebuildcmd: Vec<RecipeCommand>,
    /// Replacement build commands; empty means debuild.
    pub buildcmd: Vec<RecipeCommand>,
    /// Override for the debian control directory.
    pub deps_path: Option<String>,
    /// Subdirectory of the checkout holding the sources.
    pub subdir: Option<String>,
    /// Whether to stamp a synthetic changelog entry.
    pub generate_version: bool,
    /// `DEB_BUILD_OPTIONS` value for the build.
    pub deoptions: Option<String>,
    /// debuild parallelism override.
    pub jobs: Option<usize>,
    /// Source names treated as build-time dependencies, implicit set
    /// included.
    pub explicit_deps: BTreeSet<String>,
    /// Whether a ccache mount may be attached.
    pub supports_ccache: bool,
    /// Ready-queue tiebreaker, lower is earlier.
    pub batch_priority: i64,
    /// Whether the overlay is backed by tmpfs.
    pub tmpfs: bool,
    /// tmpfs size in GiB.
    pub tmpfs_size: u64,
    /// Constraints gating the build.
    pub build_constraints: Vec<BuildConstraint>,
    /// Extra build-environment variables.
    pub env: HashMap<String, String>,
}

impl SourcePackage {
    fn from_spec(spec: &SourceSpec, parent: Option<&SourceSpec>) -> SourcePackage {
        let branch = spec
            .branch
            .clone()
            .or_else(|| parent.and_then(|p| p.branch.clone()))
            .unwrap_or_default();
        let repo = spec
            .repo
            .clone()
            .or_else(|| parent.and_then(|p| p.repo.clone()))
            .unwrap_or_default();
        let source_name = spec
            .source_name
            .clone()
            .or_else(|| parent.map(|p| p.source_name.clone().unwrap_or_else(|| p.name.clone())))
            .unwrap_or_else(|| spec.name.clone());

        let mut explicit_deps: BTreeSet<String> = spec.explicit_deps.iter().cloned().collect();
        for dep in MANDATORY_DEPENDENCIES {
            explicit_deps.insert(dep.to_string());
        }

        SourcePackage {
            name: spec.name.clone(),
            source_name,
            branch,
            repo,
            predepscmd: spec.predepscmd.clone(),
            depscmd: spec.depscmd.clone(),
            prebuildcmd: spec.prebuildcmd.clone(),
            buildcmd: spec.buildcmd.clone(),
            deps_path: spec.deps_path.clone(),
            subdir: spec.subdir.clone(),
            generate_version: spec.generate_version,
            deoptions: spec.deoptions.clone(),
            jobs: spec.jobs,
            explicit_deps,
            supports_ccache: spec.supports_ccache,
            batch_priority: spec.batch_priority.unwrap_or(DEFAULT_BATCH_PRIORITY),
            tmpfs: spec.tmpfs.unwrap_or(true),
            tmpfs_size: spec.tmpfs_size.unwrap_or(DEFAULT_TMPFS_SIZE_GIB),
            build_constraints: spec.build_constraints.clone(),
            env: spec.env.clone(),
        }
    }

    /// Flatten the manifest sources, hoisting subpackage inheritance and
    /// dropping packages excluded by their build constraints.
    pub fn from_manifest(manifest: &Manifest) -> Vec<SourcePackage> {
        let mut packages = Vec::new();
        for spec in &manifest.sources {
            let pkg = SourcePackage::from_spec(spec, None);
            if pkg.to_build_by_constraints() {
                packages.push(pkg);
            }
            for sub in &spec.subpackages {
                let sub_pkg = SourcePackage::from_spec(sub, Some(spec));
                if sub_pkg.to_build_by_constraints() {
                    packages.push(sub_pkg);
                }
            }
        }
        packages
    }

    /// Where this package's source tree is checked out.
    pub fn source_path(&self, layout: &Layout) -> PathBuf {
        layout.source_path(&self.source_name)
    }

    /// Whether the source tree exists on disk.
    pub fn exists(&self, layout: &Layout) -> bool {
        self.source_path(layout).exists()
    }

    /// Source location inside the build chroot, relative to its root.
    pub fn package_source(&self) -> String {
        match &self.subdir {
            Some(subdir) => format!("dpkg-src/{}", subdir),
            None => "dpkg-src".to_string(),
        }
    }

    /// The SHA recorded at the last successful build, if any.
    pub fn stored_hash(&self, layout: &Layout) -> Option<String> {
        std::fs::read_to_string(layout.pkg_hash_path(&self.name))
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    /// Current short SHA of the checked-out tree.
    pub fn current_hash(&self, layout: &Layout) -> Result<String, Error> {
        crate::git::head_sha(&self.source_path(layout))
    }

    /// Whether the source differs from its last built state: the SHA
    /// moved, the tree is dirty, or nothing was ever recorded.
    pub fn hash_changed(&self, layout: &Layout) -> Result<bool, Error> {
        if self.name == ALWAYS_REBUILD {
            return Ok(true);
        }
        let stored = match self.stored_hash(layout) {
            Some(stored) => stored,
            None => return Ok(true),
        };
        let path = self.source_path(layout);
        Ok(stored != crate::git::head_sha(&path)? || crate::git::is_dirty(&path)?)
    }

    /// Evaluate the build constraints against the process environment.
    pub fn to_build_by_constraints(&self) -> bool {
        self.build_constraints
            .iter()
            .all(constraint_satisfied)
    }

    /// The branch to check out, honoring overrides.
    pub fn effective_branch<'a>(&'a self, config: &'a Config) -> &'a str {
        config.branch_override_for(&self.name).unwrap_or(&self.branch)
    }
}

fn constraint_satisfied(constraint: &BuildConstraint) -> bool {
    let actual = match std::env::var(&constraint.name) {
        Ok(v) => v,
        Err(_) => return false,
    };
    match constraint.constraint_type {
        ConstraintType::Boolean => {
            let expected = match &constraint.value {
                serde_yaml::Value::Bool(b) => *b,
                serde_yaml::Value::Number(n) => n.as_i64().map(|v| v != 0).unwrap_or(false),
                serde_yaml::Value::String(s) => truthy(s),
                _ => false,
            };
            truthy(&actual) == expected
        }
        ConstraintType::Integer => {
            let expected = match &constraint.value {
                serde_yaml::Value::Number(n) => n.as_i64(),
                serde_yaml::Value::String(s) => s.trim().parse().ok(),
                _ => None,
            };
            match (actual.trim().parse::<i64>().ok(), expected) {
                (Some(a), Some(e)) => a == e,
                _ => false,
            }
        }
        ConstraintType::String => match &constraint.value {
            serde_yaml::Value::String(s) => &actual == s,
            other => serde_yaml::to_string(other)
                .map(|s| s.trim() == actual)
                .unwrap_or(false),
        },
    }
}

/// Resolve a recipe command against the build environment. `None` means
/// the command's guards did not all match and it must be skipped.
pub fn resolve_command<'a>(
    command: &'a RecipeCommand,
    env: &HashMap<String, String>,
) -> Option<&'a str> {
    match command {
        RecipeCommand::Plain(cmd) => Some(cmd),
        RecipeCommand::Guarded { command, env_checks } => {
            for check in env_checks {
                // String-exact comparison, never coerced.
                if env.get(&check.key).map(|v| v.as_str()) != Some(check.value.as_str()) {
                    log::debug!(
                        "Skipping {:?} command because {:?} does not match {:?}",
                        command,
                        check.key,
                        check.value
                    );
                    return None;
                }
            }
            Some(command)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::EnvCheck;

    fn manifest() -> Manifest {
        serde_yaml::from_str(
            r#"
code_name: Angelfish
debian_release: bullseye
apt-repos:
  url: https://apt.example.org/debian
  distribution: bullseye
  components: main
build-epoch: 1
sources:
  - name: openzfs
    repo: https://github.com/truenas/zfs
    branch: truenas/zfs-2.1-release
    batch_priority: 2
    subpackages:
      - name: openzfs-dbg
        deps_path: contrib/debian
  - name: py_libzfs
    repo: https://github.com/truenas/py-libzfs
    branch: master
    explicit_deps:
      - openzfs
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_hoisting_inherits_parent() {
        let packages = SourcePackage::from_manifest(&manifest());
        assert_eq!(packages.len(), 3);
        let dbg = packages.iter().find(|p| p.name == "openzfs-dbg").unwrap();
        assert_eq!(dbg.source_name, "openzfs");
        assert_eq!(dbg.branch, "truenas/zfs-2.1-release");
        assert_eq!(dbg.repo, "https://github.com/truenas/zfs");
        assert_eq!(dbg.batch_priority, DEFAULT_BATCH_PRIORITY);
        let zfs = packages.iter().find(|p| p.name == "openzfs").unwrap();
        assert_eq!(zfs.batch_priority, 2);
    }

    #[test]
    fn test_mandatory_deps_merged() {
        let packages = SourcePackage::from_manifest(&manifest());
        let py = packages.iter().find(|p| p.name == "py_libzfs").unwrap();
        assert!(py.explicit_deps.contains("openzfs"));
        assert!(py.explicit_deps.contains("python3"));
    }

    #[test]
    fn test_package_source_subdir() {
        let mut pkg = SourcePackage::from_manifest(&manifest())
            .into_iter()
            .next()
            .unwrap();
        assert_eq!(pkg.package_source(), "dpkg-src");
        pkg.subdir = Some("upstream".to_string());
        assert_eq!(pkg.package_source(), "dpkg-src/upstream");
    }

    #[test]
    fn test_resolve_command_guards() {
        let mut env = HashMap::new();
        env.insert("BUILD_VARIANT".to_string(), "full".to_string());
        let guarded = RecipeCommand::Guarded {
            command: "./prepare.sh".to_string(),
            env_checks: vec![EnvCheck {
                key: "BUILD_VARIANT".to_string(),
                value: "full".to_string(),
            }],
        };
        assert_eq!(resolve_command(&guarded, &env), Some("./prepare.sh"));

        env.insert("BUILD_VARIANT".to_string(), "1".to_string());
        // "1" is truthy but guards compare string-exact.
        assert_eq!(resolve_command(&guarded, &env), None);
    }

    #[test]
    fn test_constraint_boolean_coercion() {
        let constraint = BuildConstraint {
            name: "SCALE_BUILD_TEST_SKIP_APP".to_string(),
            constraint_type: ConstraintType::Boolean,
            value: serde_yaml::Value::Bool(true),
        };
        std::env::set_var("SCALE_BUILD_TEST_SKIP_APP", "1");
        assert!(constraint_satisfied(&constraint));
        std::env::set_var("SCALE_BUILD_TEST_SKIP_APP", "no");
        assert!(!constraint_satisfied(&constraint));
        std::env::remove_var("SCALE_BUILD_TEST_SKIP_APP");
        assert!(!constraint_satisfied(&constraint));
    }
}

//! The build manifest.
//!
//! `conf/build.manifest` is a YAML document describing the apt
//! repositories, pinning preferences, package sets and source packages a
//! build is made from. It is loaded once and validated up front; every
//! later phase works from the typed record.

use crate::error::Error;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;

/// The primary apt repository plus any additional ones.
#[derive(Debug, Clone, Deserialize)]
pub struct AptRepos {
    /// Mirror URL of the primary repository.
    pub url: String,
    /// Distribution of the primary repository.
    pub distribution: String,
    /// Space-separated component list of the primary repository.
    pub components: String,
    /// Additional repositories, in priority order.
    #[serde(default)]
    pub additional: Vec<AptRepo>,
}

/// One additional apt repository.
#[derive(Debug, Clone, Deserialize)]
pub struct AptRepo {
    /// Mirror URL.
    pub url: String,
    /// Distribution name.
    pub distribution: String,
    /// Single component.
    pub component: String,
    /// Optional path (relative to the builder root) of the repository's
    /// signing key, installed into each chroot.
    #[serde(default)]
    pub key: Option<String>,
}

/// One apt pinning stanza. Field names match the rendered file.
#[derive(Debug, Clone, Deserialize)]
pub struct AptPreference {
    /// The `Package:` glob.
    #[serde(rename = "Package")]
    pub package: String,
    /// The `Pin:` expression.
    #[serde(rename = "Pin")]
    pub pin: String,
    /// The `Pin-Priority:` value.
    #[serde(rename = "Pin-Priority")]
    pub pin_priority: i64,
}

/// A package installed into the rootfs.
#[derive(Debug, Clone, Deserialize)]
pub struct PackageEntry {
    /// Binary package name.
    pub name: String,
    /// Whether apt should pull in recommends.
    #[serde(default)]
    pub install_recommends: bool,
}

/// A recipe command: either a plain shell snippet or one guarded by
/// environment checks.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RecipeCommand {
    /// Unconditional shell snippet.
    Plain(String),
    /// Snippet that only runs when every guard matches.
    Guarded {
        /// The shell snippet.
        command: String,
        /// Guards compared string-exact against the build environment.
        env_checks: Vec<EnvCheck>,
    },
}

/// One environment guard on a recipe command.
#[derive(Debug, Clone, Deserialize)]
pub struct EnvCheck {
    /// Environment variable name.
    pub key: String,
    /// Expected value, compared string-exact.
    pub value: String,
}

/// Type a build constraint coerces its environment variable to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConstraintType {
    /// Boolean with the `Y`/`n`/digit coercion.
    Boolean,
    /// Decimal integer.
    Integer,
    /// Plain string.
    String,
}

/// A constraint gating whether a source is built at all.
#[derive(Debug, Clone, Deserialize)]
pub struct BuildConstraint {
    /// Environment variable to inspect.
    pub name: String,
    /// Coercion applied to both sides before comparing.
    #[serde(rename = "type")]
    pub constraint_type: ConstraintType,
    /// Expected value.
    pub value: serde_yaml::Value,
}

/// A source package descriptor as written in the manifest. Subpackage
/// entries inherit `branch`, `repo` and `source_name` from their parent.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceSpec {
    /// Unique package name.
    pub name: String,
    /// Source tree name; defaults to `name`.
    #[serde(default)]
    pub source_name: Option<String>,
    /// Git branch. Required at the top level, inherited for subpackages.
    #[serde(default)]
    pub branch: Option<String>,
    /// Git remote URL. Required at the top level, inherited for
    /// subpackages.
    #[serde(default)]
    pub repo: Option<String>,
    /// Commands run before the build-dependency install.
    #[serde(default)]
    pub predepscmd: Vec<RecipeCommand>,
    /// Commands producing the control file for opaque sources.
    #[serde(default)]
    pub depscmd: Vec<RecipeCommand>,
    /// Commands run after build-dep install, before the build.
    #[serde(default)]
    pub prebuildcmd: Vec<RecipeCommand>,
    /// Replacement build commands; empty means plain debuild.
    #[serde(default)]
    pub buildcmd: Vec<RecipeCommand>,
    /// Override for locating the debian control directory.
    #[serde(default)]
    pub deps_path: Option<String>,
    /// Subdirectory of the checkout the sources live in.
    #[serde(default)]
    pub subdir: Option<String>,
    /// Stamp a synthetic changelog entry before building.
    #[serde(default)]
    pub generate_version: bool,
    /// Value for `DEB_BUILD_OPTIONS`.
    #[serde(default)]
    pub deoptions: Option<String>,
    /// Parallelism override for debuild.
    #[serde(default)]
    pub jobs: Option<usize>,
    /// Source names treated as additional build-time dependencies.
    #[serde(default)]
    pub explicit_deps: Vec<String>,
    /// Whether a ccache mount may be attached to this build.
    #[serde(default)]
    pub supports_ccache: bool,
    /// Tiebreaker among ready tasks, lower is earlier.
    #[serde(default)]
    pub batch_priority: Option<i64>,
    /// Whether the overlay is backed by tmpfs.
    #[serde(default)]
    pub tmpfs: Option<bool>,
    /// tmpfs size in GiB.
    #[serde(default)]
    pub tmpfs_size: Option<u64>,
    /// Constraints deciding whether the source is built at all.
    #[serde(default)]
    pub build_constraints: Vec<BuildConstraint>,
    /// Extra variables merged into the build environment.
    #[serde(default)]
    pub env: std::collections::HashMap<String, String>,
    /// Descriptors inheriting branch/repo/source_name from this entry.
    #[serde(default)]
    pub subpackages: Vec<SourceSpec>,
}

/// The validated build manifest.
#[derive(Debug, Clone, Deserialize)]
pub struct Manifest {
    /// Release code name, used for the default update train.
    pub code_name: String,
    /// Base Debian distribution name.
    pub debian_release: String,
    /// Apt repositories.
    #[serde(rename = "apt-repos")]
    pub apt_repos: AptRepos,
    /// Pinning preferences, alphabetical by `Package`.
    #[serde(default)]
    pub apt_preferences: Vec<AptPreference>,
    /// Packages forming the base system.
    #[serde(rename = "base-packages", default)]
    pub base_packages: Vec<PackageEntry>,
    /// Packages layered on top of the base system.
    #[serde(rename = "additional-packages", default)]
    pub additional_packages: Vec<PackageEntry>,
    /// Packages removed from the rootfs after installation.
    #[serde(rename = "base-prune", default)]
    pub base_prune: Vec<String>,
    /// Packages installed into the ISO environment.
    #[serde(rename = "iso-packages", default)]
    pub iso_packages: Vec<String>,
    /// Epoch; a change against the on-disk epoch forces a clean build.
    #[serde(rename = "build-epoch")]
    pub build_epoch: i64,
    /// Source package descriptors.
    pub sources: Vec<SourceSpec>,
}

impl Manifest {
    /// Load and validate the manifest at `path`.
    pub fn load(path: &Path) -> Result<Manifest, Error> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::MissingManifest)
            }
            Err(e) => return Err(e.into()),
        };
        let manifest: Manifest = serde_yaml::from_str(&text)?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Schema checks beyond what deserialization enforces.
    pub fn validate(&self) -> Result<(), Error> {
        if self.apt_repos.url.is_empty() {
            return Err(Error::InvalidManifest(
                "at least one apt repository must be configured".to_string(),
            ));
        }

        // Preferences are written in the order listed; require the
        // manifest to already be alphabetical so the rendered file is
        // deterministic.
        let keys: Vec<String> = self
            .apt_preferences
            .iter()
            .map(|p| p.package.replace('*', ""))
            .collect();
        let mut sorted = keys.clone();
        sorted.sort();
        if keys != sorted {
            return Err(Error::InvalidManifest(
                "apt_preferences must be listed in alphabetical order of Package".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for spec in self.iter_source_specs() {
            if !seen.insert(spec.name.clone()) {
                return Err(Error::InvalidManifest(format!(
                    "duplicate source package {:?}",
                    spec.name
                )));
            }
            if spec.name.is_empty() {
                return Err(Error::InvalidManifest(
                    "source package with empty name".to_string(),
                ));
            }
        }
        for spec in &self.sources {
            if spec.branch.as_deref().unwrap_or("").is_empty()
                || spec.repo.as_deref().unwrap_or("").is_empty()
            {
                return Err(Error::InvalidManifest(format!(
                    "source package {:?} must declare branch and repo",
                    spec.name
                )));
            }
        }
        Ok(())
    }

    /// All source descriptors, subpackages included, in manifest order.
    pub fn iter_source_specs(&self) -> impl Iterator<Item = &SourceSpec> {
        self.sources
            .iter()
            .flat_map(|spec| std::iter::once(spec).chain(spec.subpackages.iter()))
    }

    /// Render `/etc/apt/preferences` text from the pinning entries.
    pub fn render_preferences(&self) -> String {
        let mut out = String::new();
        for pref in &self.apt_preferences {
            out.push_str(&format!(
                "Package: {}\nPin: {}\nPin-Priority: {}\n\n",
                pref.package, pref.pin, pref.pin_priority
            ));
        }
        out
    }

    /// Every deb line for `/etc/apt/sources.list` inside chroots and the
    /// final rootfs, primary repository first.
    pub fn apt_source_lines(&self) -> Vec<String> {
        let mut lines = vec![format!(
            "deb {} {} {}",
            self.apt_repos.url, self.apt_repos.distribution, self.apt_repos.components
        )];
        for repo in &self.apt_repos.additional {
            lines.push(format!(
                "deb {} {} {}",
                repo.url, repo.distribution, repo.component
            ));
        }
        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
code_name: Angelfish
debian_release: bullseye
apt-repos:
  url: https://apt.example.org/debian
  distribution: bullseye
  components: main
  additional:
    - url: https://apt.example.org/extra
      distribution: bullseye
      component: main
      key: keys/extra.gpg
apt_preferences:
  - Package: "*"
    Pin: "release n=bullseye"
    Pin-Priority: 900
  - Package: "*zfs*"
    Pin: "version 2.0.*"
    Pin-Priority: 1000
base-packages:
  - name: linux-truenas
    install_recommends: true
base-prune:
  - gcc-9-base
iso-packages:
  - live-boot
build-epoch: 2
sources:
  - name: openzfs
    repo: https://github.com/truenas/zfs
    branch: truenas/zfs-2.1-release
    generate_version: true
    subpackages:
      - name: openzfs-dbg
        deps_path: contrib/debian
  - name: truenas
    repo: https://github.com/truenas/middleware
    branch: master
    predepscmd:
      - command: ./prepare.sh
        env_checks:
          - key: BUILD_VARIANT
            value: full
"#;

    #[test]
    fn test_parse_minimal() {
        let manifest: Manifest = serde_yaml::from_str(MINIMAL).unwrap();
        manifest.validate().unwrap();
        assert_eq!(manifest.build_epoch, 2);
        assert_eq!(manifest.sources.len(), 2);
        assert_eq!(manifest.sources[0].subpackages.len(), 1);
        assert_eq!(manifest.apt_repos.additional[0].component, "main");
        match &manifest.sources[1].predepscmd[0] {
            RecipeCommand::Guarded { command, env_checks } => {
                assert_eq!(command, "./prepare.sh");
                assert_eq!(env_checks[0].key, "BUILD_VARIANT");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_unsorted_preferences_rejected() {
        // "zzz" sorts after "zfs", so the first entry is now out of
        // order.
        let text = MINIMAL.replace("Package: \"*\"", "Package: \"*zzz*\"");
        let manifest: Manifest = serde_yaml::from_str(&text).unwrap();
        match manifest.validate() {
            Err(Error::InvalidManifest(msg)) => assert!(msg.contains("alphabetical")),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_duplicate_sources_rejected() {
        let text = MINIMAL.replace("name: truenas", "name: openzfs-dbg");
        let manifest: Manifest = serde_yaml::from_str(&text).unwrap();
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn test_render_preferences() {
        let manifest: Manifest = serde_yaml::from_str(MINIMAL).unwrap();
        let rendered = manifest.render_preferences();
        assert!(rendered.starts_with("Package: *\nPin: release n=bullseye\nPin-Priority: 900\n"));
        assert!(rendered.contains("Package: *zfs*\n"));
    }

    #[test]
    fn test_apt_source_lines() {
        let manifest: Manifest = serde_yaml::from_str(MINIMAL).unwrap();
        assert_eq!(
            manifest.apt_source_lines(),
            vec![
                "deb https://apt.example.org/debian bullseye main".to_string(),
                "deb https://apt.example.org/extra bullseye main".to_string(),
            ]
        );
    }

    #[test]
    fn test_missing_manifest() {
        match Manifest::load(std::path::Path::new("/nonexistent/build.manifest")) {
            Err(Error::MissingManifest) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }
}

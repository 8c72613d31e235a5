//! Process configuration assembled from the environment.
//!
//! Everything the builder reads from the environment is collected once,
//! at startup, into an explicit [`Config`] record that is threaded into
//! every component. No component consults `std::env` on its own.

use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// Prefix for environment variables injected verbatim into build
/// environments (with the prefix stripped).
pub const SECRET_ENV_PREFIX: &str = "SECRET_";

/// Coerce an environment-style string to a boolean.
///
/// The contract, preserved from the original builder: an all-digit value
/// is numeric truthiness; a leading `y`/`Y` is true, a leading `n`/`N` is
/// false; any other non-empty value is true; an empty value is false.
pub fn truthy(value: &str) -> bool {
    if value.is_empty() {
        return false;
    }
    if value.chars().all(|c| c.is_ascii_digit()) {
        return value.parse::<i64>().map(|v| v != 0).unwrap_or(false);
    }
    match value.chars().next() {
        Some('y') | Some('Y') => true,
        Some('n') | Some('N') => false,
        _ => true,
    }
}

/// Read a boolean environment variable with the [`truthy`] coercion.
pub fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(v) if !v.is_empty() => truthy(&v),
        _ => default,
    }
}

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

/// The fixed environment every apt/chroot invocation runs with, layered
/// over the inherited host environment.
pub fn apt_env() -> HashMap<String, String> {
    let mut env: HashMap<String, String> = std::env::vars().collect();
    // When logging in as 'su root' the sbin dirs get dropped out of PATH.
    let path = env.get("PATH").cloned().unwrap_or_default();
    env.insert(
        "PATH".to_string(),
        format!("{}:/sbin:/usr/sbin:/usr/local/sbin", path),
    );
    // Makes some perl scripts happy during package builds.
    env.insert("LC_ALL".to_string(), "C".to_string());
    env.insert("LANG".to_string(), "C".to_string());
    let ncpu = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    env.insert(
        "DEB_BUILD_OPTIONS".to_string(),
        format!("parallel={}", ncpu),
    );
    // Never go full interactive on any packages.
    env.insert("DEBIAN_FRONTEND".to_string(), "noninteractive".to_string());
    env
}

/// Immutable process configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Wall-clock time the process started, used for version stamping.
    pub build_time: DateTime<Utc>,
    /// Release version label (`TRUENAS_VERSION` or derived from the
    /// build time).
    pub version: String,
    /// Update-train override (`TRUENAS_TRAIN`).
    pub train: Option<String>,
    /// Vendor label baked into ISO images (`TRUENAS_VENDOR`).
    pub vendor: Option<String>,
    /// Worker-pool size for package builds.
    pub parallel_builds: usize,
    /// Drop to an interactive chroot shell when a build fails.
    pub pkg_debug: bool,
    /// Enable ccache bind mounts for sources that support it.
    pub ccache: bool,
    /// Clean instead of erroring when the build epoch changes.
    pub force_cleanup_with_epoch_change: bool,
    /// GPG key id for update-manifest signing.
    pub signing_key: Option<String>,
    /// Passphrase for the signing key.
    pub signing_password: Option<String>,
    /// Global branch override (`TRUENAS_BRANCH_OVERRIDE`).
    pub branch_override: Option<String>,
    /// Branch used only when it exists on the remote (`TRY_BRANCH_OVERRIDE`).
    pub try_branch_override: Option<String>,
    /// Per-package branch overrides (`<PKG>_OVERRIDE`).
    pub branch_overrides: HashMap<String, String>,
    /// `SECRET_*` variables, prefix stripped, injected into build envs.
    pub secrets: HashMap<String, String>,
}

impl Config {
    /// Assemble the configuration from the process environment.
    pub fn from_env() -> Config {
        let build_time = Utc::now();
        let version = env_opt("TRUENAS_VERSION").unwrap_or_else(|| {
            format!(
                "{}-MASTER-{}",
                build_time.format("%y.%m"),
                build_time.format("%Y%m%d-%H%M%S")
            )
        });

        let ncpu = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let mut parallel_builds = match env_opt("PARALLEL_BUILDS") {
            Some(v) => v.parse().unwrap_or(1),
            None => std::cmp::max(ncpu, 8) / 4,
        };
        let pkg_debug = env_bool("PKG_DEBUG", false);
        if pkg_debug {
            parallel_builds = 1;
        }

        let mut branch_overrides = HashMap::new();
        let mut secrets = HashMap::new();
        for (key, value) in std::env::vars() {
            if let Some(name) = key.strip_prefix(SECRET_ENV_PREFIX) {
                secrets.insert(name.to_string(), value);
            } else if let Some(name) = key.strip_suffix("_OVERRIDE") {
                if key != "TRUENAS_BRANCH_OVERRIDE" && key != "TRY_BRANCH_OVERRIDE" {
                    branch_overrides.insert(name.to_string(), value);
                }
            }
        }

        Config {
            build_time,
            version,
            train: env_opt("TRUENAS_TRAIN"),
            vendor: env_opt("TRUENAS_VENDOR"),
            parallel_builds: std::cmp::max(parallel_builds, 1),
            pkg_debug,
            ccache: env_bool("CCACHE", false),
            force_cleanup_with_epoch_change: env_bool("FORCE_CLEANUP_WITH_EPOCH_CHANGE", false),
            signing_key: env_opt("SIGNING_KEY"),
            signing_password: env_opt("SIGNING_PASSWORD"),
            branch_override: env_opt("TRUENAS_BRANCH_OVERRIDE"),
            try_branch_override: env_opt("TRY_BRANCH_OVERRIDE"),
            branch_overrides,
            secrets,
        }
    }

    /// The update train, falling back to the nightly train for the
    /// manifest's code name.
    pub fn train(&self, code_name: &str) -> String {
        self.train
            .clone()
            .unwrap_or_else(|| format!("TrueNAS-SCALE-{}-Nightlies", code_name))
    }

    /// Branch override for one source: the global override wins over the
    /// per-package one.
    pub fn branch_override_for(&self, name: &str) -> Option<&str> {
        self.branch_override
            .as_deref()
            .or_else(|| self.branch_overrides.get(name).map(|s| s.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::truthy;

    #[test]
    fn test_truthy_digits() {
        assert!(truthy("1"));
        assert!(truthy("23"));
        assert!(!truthy("0"));
        assert!(!truthy("000"));
    }

    #[test]
    fn test_truthy_leading_letter() {
        assert!(truthy("y"));
        assert!(truthy("Yes"));
        assert!(!truthy("n"));
        assert!(!truthy("NO"));
    }

    #[test]
    fn test_truthy_fallback() {
        assert!(truthy("please"));
        assert!(truthy("true"));
        assert!(!truthy(""));
    }
}

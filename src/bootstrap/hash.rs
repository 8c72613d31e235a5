//! Base-chroot cache keys.
//!
//! The cache key is a composite hash over every configured apt
//! repository's `Release` file plus the rendered pinning preferences, so
//! any upstream publish or local pin change invalidates the cached base
//! chroot.

use crate::error::Error;
use crate::manifest::Manifest;
use sha2::{Digest, Sha256};
use std::time::Duration;

/// HTTP timeout for `Release` fetches.
pub const RELEASE_FETCH_TIMEOUT: Duration = Duration::from_secs(60);

/// Build the blocking HTTP client used for repository metadata.
pub fn http_client() -> Result<reqwest::blocking::Client, Error> {
    Ok(reqwest::blocking::Client::builder()
        .timeout(RELEASE_FETCH_TIMEOUT)
        .build()?)
}

/// SHA-256 of one repository's `Release` file. Any non-200 response is
/// fatal; there is no retry.
pub fn repo_hash(
    client: &reqwest::blocking::Client,
    repo_url: &str,
    distribution: &str,
) -> Result<String, Error> {
    let url = format!(
        "{}/dists/{}/Release",
        repo_url.trim_end_matches('/'),
        distribution
    );
    let response = client.get(&url).send()?;
    if !response.status().is_success() {
        return Err(Error::Call(format!(
            "Unable to retrieve hash for {} ({})",
            repo_url,
            response.status()
        )));
    }
    let body = response.bytes()?;
    Ok(hex::encode(Sha256::digest(&body)))
}

/// The composite cache key: primary repo hash, each additional repo hash
/// in manifest order, then the hash of the rendered apt preferences.
pub fn all_repo_hash(
    client: &reqwest::blocking::Client,
    manifest: &Manifest,
) -> Result<String, Error> {
    let mut combined = repo_hash(
        client,
        &manifest.apt_repos.url,
        &manifest.apt_repos.distribution,
    )?;
    for repo in &manifest.apt_repos.additional {
        combined.push_str(&repo_hash(client, &repo.url, &repo.distribution)?);
    }
    combined.push_str(&hex::encode(Sha256::digest(
        manifest.render_preferences().as_bytes(),
    )));
    Ok(combined)
}

#[cfg(test)]
mod tests {
    use sha2::{Digest, Sha256};

    #[test]
    fn test_preferences_digest_is_stable() {
        // The preference text participates in the cache key; make sure a
        // pin bump really changes the digest.
        let a = hex::encode(Sha256::digest(b"Package: *\nPin-Priority: 900\n"));
        let b = hex::encode(Sha256::digest(b"Package: *\nPin-Priority: 950\n"));
        assert_ne!(a, b);
        assert_eq!(a.len(), 64);
    }
}

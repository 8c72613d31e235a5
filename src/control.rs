//! `debian/control` parsing and dependency normalization.
//!
//! Relation strings are reduced to bare package names: alternatives all
//! count, version constraints are dropped, and substvar tokens (anything
//! containing `$`) are ignored.

use crate::error::Error;
use std::path::Path;

/// One binary stanza of a control file, reduced to what the dependency
/// graph needs.
#[derive(Debug, Clone)]
pub struct BinaryStanza {
    /// Binary package name.
    pub name: String,
    /// Normalized install dependencies.
    pub depends: Vec<String>,
}

/// A parsed control file.
#[derive(Debug, Clone)]
pub struct ParsedControl {
    /// Source package name.
    pub source: String,
    /// Normalized build dependencies.
    pub build_depends: Vec<String>,
    /// Binary packages the source produces.
    pub binaries: Vec<BinaryStanza>,
}

/// Normalize a `Build-Depends` value: split on `,`, take every `|`
/// alternative, strip `(...)` version constraints.
pub fn normalize_build_depends(build_depends: &str) -> Vec<String> {
    let mut deps = Vec::new();
    for dep in build_depends.split(',').map(str::trim).filter(|d| !d.is_empty()) {
        for alt in dep.split('|').map(str::trim).filter(|d| !d.is_empty()) {
            let name = match alt.find('(') {
                Some(index) => alt[..index].trim(),
                None => alt,
            };
            // Only the bare package name matters for source-level
            // ordering; architecture qualifiers and restriction lists
            // are dropped.
            let name = name
                .split_whitespace()
                .next()
                .unwrap_or("")
                .split(':')
                .next()
                .unwrap_or("");
            if !name.is_empty() && !name.contains('$') {
                deps.push(name.to_string());
            }
        }
    }
    deps
}

/// Normalize a binary `Depends` value: split on `,`, drop substvar
/// tokens.
pub fn normalize_install_depends(depends: &str) -> Vec<String> {
    depends
        .split(',')
        .map(str::trim)
        .filter(|d| !d.is_empty() && !d.contains('$'))
        .map(|d| {
            let name = match d.find('(') {
                Some(index) => d[..index].trim(),
                None => d,
            };
            name.split_whitespace().next().unwrap_or("").to_string()
        })
        .filter(|d| !d.is_empty())
        .collect()
}

/// Parse the control file at `path`.
pub fn parse_control_file(path: &Path) -> Result<ParsedControl, Error> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        Error::Call(format!(
            "Unable to read control file {}: {}",
            path.display(),
            e
        ))
    })?;
    parse_control_text(&text, path)
}

fn parse_control_text(text: &str, path: &Path) -> Result<ParsedControl, Error> {
    let control: debian_control::Control = text
        .parse()
        .map_err(|e| Error::Call(format!("Unable to parse {}: {:?}", path.display(), e)))?;
    let source = control
        .source()
        .ok_or_else(|| Error::Call(format!("No source stanza in {}", path.display())))?;
    let source_name = source
        .name()
        .ok_or_else(|| Error::Call(format!("Unnamed source stanza in {}", path.display())))?;

    let build_depends = source
        .build_depends()
        .map(|rels| normalize_build_depends(&rels.to_string()))
        .unwrap_or_default();

    let mut binaries = Vec::new();
    for binary in control.binaries() {
        let name = match binary.name() {
            Some(name) => name,
            None => continue,
        };
        let depends = binary
            .depends()
            .map(|rels| normalize_install_depends(&rels.to_string()))
            .unwrap_or_default();
        binaries.push(BinaryStanza { name, depends });
    }

    Ok(ParsedControl {
        source: source_name,
        build_depends,
        binaries,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_build_depends() {
        assert_eq!(
            normalize_build_depends(
                "debhelper-compat (= 12), dh-python | python3-all (>= 3.9), libssl-dev"
            ),
            vec!["debhelper-compat", "dh-python", "python3-all", "libssl-dev"]
        );
    }

    #[test]
    fn test_normalize_build_depends_drops_substvars() {
        assert_eq!(
            normalize_build_depends("gcc, ${shlibs:Depends}"),
            vec!["gcc"]
        );
        assert!(normalize_build_depends("").is_empty());
    }

    #[test]
    fn test_normalize_install_depends() {
        assert_eq!(
            normalize_install_depends(
                "${misc:Depends}, python3 (>= 3.9), libzfs4linux, ${shlibs:Depends}"
            ),
            vec!["python3", "libzfs4linux"]
        );
    }

    #[test]
    fn test_parse_control_text() {
        let text = "Source: openzfs\n\
                    Maintainer: Nobody <nobody@example.org>\n\
                    Build-Depends: debhelper-compat (= 12),\n libtool,\n po-debconf\n\
                    \n\
                    Package: libzfs4linux\n\
                    Architecture: linux-any\n\
                    Depends: ${shlibs:Depends}, ${misc:Depends}\n\
                    Description: OpenZFS filesystem library\n\
                    \n\
                    Package: zfsutils-linux\n\
                    Architecture: linux-any\n\
                    Depends: libzfs4linux, python3\n\
                    Description: command-line tools\n";
        let parsed = parse_control_text(text, Path::new("debian/control")).unwrap();
        assert_eq!(parsed.source, "openzfs");
        assert_eq!(
            parsed.build_depends,
            vec!["debhelper-compat", "libtool", "po-debconf"]
        );
        assert_eq!(parsed.binaries.len(), 2);
        assert_eq!(parsed.binaries[0].name, "libzfs4linux");
        assert!(parsed.binaries[0].depends.is_empty());
        assert_eq!(parsed.binaries[1].depends, vec!["libzfs4linux", "python3"]);
    }
}

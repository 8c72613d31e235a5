//! The source-level dependency graph.
//!
//! Sources are nodes in a single arena indexed by position; edges are
//! expressed as index sets, never as references, so parent/child links
//! can be mutated freely and `parent_changed` propagation is an
//! iterative fixpoint instead of a recursive walk.

use crate::control::{parse_control_file, ParsedControl};
use crate::error::Error;
use crate::package::SourcePackage;
use crate::paths::Layout;
use std::collections::{BTreeSet, HashMap};

/// A binary package derived from a source's control file.
#[derive(Debug, Clone)]
pub struct BinaryPackage {
    /// Binary package name.
    pub name: String,
    /// Debian source stanza name.
    pub source_package: String,
    /// Name of the build unit producing this binary.
    pub source: String,
    /// Build dependencies declared by the source stanza.
    pub build_deps: BTreeSet<String>,
    /// Install dependencies declared by the binary stanza.
    pub install_deps: BTreeSet<String>,
}

/// Resolves a source package to its parsed control file.
///
/// `Ok(None)` marks an opaque source: one whose control file only exists
/// after its predep commands ran. Such a source contributes a single
/// synthetic binary named after itself, with no dependencies.
pub trait ControlResolver {
    /// Resolve `pkg`'s control data.
    fn resolve(&self, pkg: &SourcePackage) -> Result<Option<ParsedControl>, Error>;
}

/// Resolver for sources whose control file is discoverable on disk.
pub struct FsControlResolver<'a> {
    /// Builder layout the source trees live in.
    pub layout: &'a Layout,
}

impl FsControlResolver<'_> {
    /// Where `pkg`'s control file lives inside its checkout.
    pub fn control_path(&self, pkg: &SourcePackage) -> std::path::PathBuf {
        let source = pkg.source_path(self.layout);
        match (&pkg.deps_path, &pkg.subdir) {
            (Some(deps_path), _) => source.join(deps_path).join("control"),
            (None, Some(subdir)) => source.join(subdir).join("debian/control"),
            (None, None) => source.join("debian/control"),
        }
    }
}

impl ControlResolver for FsControlResolver<'_> {
    fn resolve(&self, pkg: &SourcePackage) -> Result<Option<ParsedControl>, Error> {
        if !pkg.predepscmd.is_empty() && pkg.deps_path.is_none() {
            return Ok(None);
        }
        Ok(Some(parse_control_file(&self.control_path(pkg))?))
    }
}

/// One source in the graph.
#[derive(Debug)]
pub struct Node {
    /// The build unit.
    pub pkg: SourcePackage,
    /// Binaries this source produces.
    pub binaries: Vec<BinaryPackage>,
    /// Binary-package names declared as build dependencies.
    pub build_depends: BTreeSet<String>,
    /// Indices of the sources this one depends on at build time.
    pub build_time_deps: BTreeSet<usize>,
    /// Indices of the sources that depend on this one at build time.
    pub children: BTreeSet<usize>,
    /// The recorded SHA differs from git HEAD or the tree is dirty.
    pub hash_changed: bool,
    /// A transitive parent is in a changed state.
    pub parent_changed: bool,
}

impl Node {
    /// Whether this source must be rebuilt.
    pub fn rebuild(&self) -> bool {
        self.hash_changed || self.parent_changed
    }
}

/// Arena-backed dependency graph over the manifest's sources.
pub struct PackageGraph {
    nodes: Vec<Node>,
    index: HashMap<String, usize>,
}

impl PackageGraph {
    /// Build the graph: resolve control files, project binary-level
    /// dependencies back to producing sources, and propagate change
    /// state to a fixpoint.
    ///
    /// `hash_changed` decides per source whether its checkout moved; it
    /// is a seam so rebuild logic is testable without git state.
    pub fn build(
        packages: Vec<SourcePackage>,
        resolver: &dyn ControlResolver,
        hash_changed: &dyn Fn(&SourcePackage) -> Result<bool, Error>,
    ) -> Result<PackageGraph, Error> {
        let mut nodes: Vec<Node> = Vec::with_capacity(packages.len());
        let mut index = HashMap::new();
        for pkg in packages {
            if index.contains_key(&pkg.name) {
                return Err(Error::InvalidManifest(format!(
                    "duplicate source package {:?}",
                    pkg.name
                )));
            }
            index.insert(pkg.name.clone(), nodes.len());
            nodes.push(Node {
                pkg,
                binaries: Vec::new(),
                build_depends: BTreeSet::new(),
                build_time_deps: BTreeSet::new(),
                children: BTreeSet::new(),
                hash_changed: false,
                parent_changed: false,
            });
        }

        let mut binary_table: HashMap<String, BinaryPackage> = HashMap::new();
        for node in nodes.iter_mut() {
            match resolver.resolve(&node.pkg)? {
                Some(parsed) => {
                    node.build_depends = parsed.build_depends.iter().cloned().collect();
                    for stanza in &parsed.binaries {
                        node.binaries.push(BinaryPackage {
                            name: stanza.name.clone(),
                            source_package: parsed.source.clone(),
                            source: node.pkg.name.clone(),
                            build_deps: node.build_depends.clone(),
                            install_deps: stanza.depends.iter().cloned().collect(),
                        });
                    }
                }
                None => {
                    node.binaries.push(BinaryPackage {
                        name: node.pkg.name.clone(),
                        source_package: node.pkg.name.clone(),
                        source: node.pkg.name.clone(),
                        build_deps: BTreeSet::new(),
                        install_deps: BTreeSet::new(),
                    });
                }
            }
            for binary in &node.binaries {
                binary_table.insert(binary.name.clone(), binary.clone());
            }
        }

        for i in 0..nodes.len() {
            let mut dep_sources = gather_build_time_dependencies(
                &binary_table,
                &nodes[i].build_depends,
            );
            for dep in &nodes[i].pkg.explicit_deps {
                dep_sources.insert(dep.clone());
            }
            let deps: BTreeSet<usize> = dep_sources
                .iter()
                .filter_map(|name| index.get(name).copied())
                .filter(|&dep| dep != i)
                .collect();
            for &dep in &deps {
                nodes[dep].children.insert(i);
            }
            nodes[i].build_time_deps = deps;
        }

        for node in nodes.iter_mut() {
            node.hash_changed = hash_changed(&node.pkg)?;
        }

        let mut graph = PackageGraph { nodes, index };
        graph.propagate_parent_changed();
        Ok(graph)
    }

    /// Mark every transitive child of a changed source, repeating until
    /// no flag flips.
    fn propagate_parent_changed(&mut self) {
        loop {
            let mut changed = false;
            for i in 0..self.nodes.len() {
                if !(self.nodes[i].hash_changed || self.nodes[i].parent_changed) {
                    continue;
                }
                let children: Vec<usize> = self.nodes[i].children.iter().copied().collect();
                for child in children {
                    if !self.nodes[child].parent_changed {
                        self.nodes[child].parent_changed = true;
                        changed = true;
                    }
                }
            }
            if !changed {
                break;
            }
        }
    }

    /// Number of sources in the graph.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph is empty.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The node at `idx`.
    pub fn node(&self, idx: usize) -> &Node {
        &self.nodes[idx]
    }

    /// Index of the source named `name`.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    /// Indices of every source that must be rebuilt.
    pub fn to_build(&self) -> BTreeSet<usize> {
        (0..self.nodes.len())
            .filter(|&i| self.nodes[i].rebuild())
            .collect()
    }

    /// Order candidate indices for dispatch: ascending batch priority,
    /// then name.
    pub fn dispatch_order(&self, candidates: &mut Vec<usize>) {
        candidates.sort_by(|&a, &b| {
            (self.nodes[a].pkg.batch_priority, &self.nodes[a].pkg.name)
                .cmp(&(self.nodes[b].pkg.batch_priority, &self.nodes[b].pkg.name))
        });
    }
}

fn gather_build_time_dependencies(
    binary_table: &HashMap<String, BinaryPackage>,
    roots: &BTreeSet<String>,
) -> BTreeSet<String> {
    let mut sources = BTreeSet::new();
    let mut visited: BTreeSet<String> = BTreeSet::new();
    let mut stack: Vec<String> = roots.iter().cloned().collect();
    while let Some(dep) = stack.pop() {
        if !visited.insert(dep.clone()) {
            continue;
        }
        if let Some(binary) = binary_table.get(&dep) {
            sources.insert(binary.source.clone());
            stack.extend(binary.install_deps.iter().cloned());
            stack.extend(binary.build_deps.iter().cloned());
        }
    }
    sources
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::{BinaryStanza, ParsedControl};
    use crate::manifest::Manifest;
    use std::collections::HashMap;

    const TEST_MANIFEST: &str = r#"
code_name: Angelfish
debian_release: bullseye
apt-repos:
  url: https://apt.example.org/debian
  distribution: bullseye
  components: main
build-epoch: 1
sources:
  - name: kernel
    repo: https://github.com/truenas/linux
    branch: truenas/linux-5.15
    batch_priority: 0
  - name: openzfs
    repo: https://github.com/truenas/zfs
    branch: truenas/zfs-2.1-release
  - name: py_libzfs
    repo: https://github.com/truenas/py-libzfs
    branch: master
    explicit_deps:
      - openzfs
  - name: zectl
    repo: https://github.com/truenas/zectl
    branch: master
    explicit_deps:
      - openzfs
  - name: truenas_samba
    repo: https://github.com/truenas/samba
    branch: SCALE-v4-18-stable
    explicit_deps:
      - openzfs
"#;

    struct MapResolver(HashMap<String, ParsedControl>);

    impl ControlResolver for MapResolver {
        fn resolve(&self, pkg: &SourcePackage) -> Result<Option<ParsedControl>, Error> {
            Ok(self.0.get(&pkg.name).cloned())
        }
    }

    fn control(
        source: &str,
        build_depends: &[&str],
        binaries: &[(&str, &[&str])],
    ) -> ParsedControl {
        ParsedControl {
            source: source.to_string(),
            build_depends: build_depends.iter().map(|s| s.to_string()).collect(),
            binaries: binaries
                .iter()
                .map(|(name, depends)| BinaryStanza {
                    name: name.to_string(),
                    depends: depends.iter().map(|s| s.to_string()).collect(),
                })
                .collect(),
        }
    }

    fn resolver() -> MapResolver {
        let mut controls = HashMap::new();
        controls.insert(
            "kernel".to_string(),
            control(
                "linux",
                &["debhelper-compat"],
                &[
                    ("linux-headers-truenas", &[]),
                    ("linux-image-truenas", &[]),
                ],
            ),
        );
        controls.insert(
            "openzfs".to_string(),
            control(
                "openzfs",
                &["debhelper-compat", "linux-headers-truenas"],
                &[
                    ("libzfs4linux", &[]),
                    ("zfsutils-linux", &["libzfs4linux"] as &[&str]),
                ],
            ),
        );
        controls.insert(
            "py_libzfs".to_string(),
            control(
                "py-libzfs",
                &["libzfs4linux"],
                &[("python3-libzfs", &["libzfs4linux"] as &[&str])],
            ),
        );
        controls.insert(
            "zectl".to_string(),
            control("zectl", &["libzfs4linux"], &[("zectl", &[] as &[&str])]),
        );
        controls.insert(
            "truenas_samba".to_string(),
            control(
                "samba",
                &["zfsutils-linux"],
                &[("truenas-samba", &[] as &[&str])],
            ),
        );
        MapResolver(controls)
    }

    fn build_graph(changed: &[&str]) -> PackageGraph {
        let manifest: Manifest = serde_yaml::from_str(TEST_MANIFEST).unwrap();
        let packages = SourcePackage::from_manifest(&manifest);
        let changed: Vec<String> = changed.iter().map(|s| s.to_string()).collect();
        PackageGraph::build(packages, &resolver(), &|pkg| {
            Ok(changed.contains(&pkg.name))
        })
        .unwrap()
    }

    #[test]
    fn test_build_time_deps_projected_to_sources() {
        let graph = build_graph(&[]);
        let openzfs = graph.index_of("openzfs").unwrap();
        let kernel = graph.index_of("kernel").unwrap();
        assert!(graph.node(openzfs).build_time_deps.contains(&kernel));
        assert!(graph.node(kernel).children.contains(&openzfs));

        // explicit_deps count as build-time dependencies too.
        let zectl = graph.index_of("zectl").unwrap();
        assert!(graph.node(zectl).build_time_deps.contains(&openzfs));
    }

    #[test]
    fn test_transitive_closure_over_binaries() {
        let graph = build_graph(&[]);
        // truenas_samba build-depends on zfsutils-linux which install-
        // depends on libzfs4linux; both project back to openzfs.
        let samba = graph.index_of("truenas_samba").unwrap();
        let openzfs = graph.index_of("openzfs").unwrap();
        assert!(graph.node(samba).build_time_deps.contains(&openzfs));
    }

    #[test]
    fn test_children_rebuild_when_parent_changed() {
        let graph = build_graph(&["openzfs"]);
        for name in ["openzfs", "py_libzfs", "zectl", "truenas_samba"] {
            let idx = graph.index_of(name).unwrap();
            assert!(graph.node(idx).rebuild(), "{} should rebuild", name);
        }
        let kernel = graph.index_of("kernel").unwrap();
        assert!(!graph.node(kernel).rebuild());
    }

    #[test]
    fn test_kernel_change_propagates_through_openzfs() {
        let graph = build_graph(&["kernel"]);
        for name in ["kernel", "openzfs", "py_libzfs", "zectl", "truenas_samba"] {
            let idx = graph.index_of(name).unwrap();
            assert!(graph.node(idx).rebuild(), "{} should rebuild", name);
        }
    }

    #[test]
    fn test_leaf_change_does_not_rebuild_siblings() {
        let graph = build_graph(&["zectl"]);
        let py = graph.index_of("py_libzfs").unwrap();
        assert!(!graph.node(py).rebuild());
        assert_eq!(graph.to_build().len(), 1);
    }

    #[test]
    fn test_dispatch_order_batch_priority_then_name() {
        let graph = build_graph(&["kernel"]);
        let mut candidates: Vec<usize> = ["zectl", "openzfs", "kernel"]
            .iter()
            .map(|n| graph.index_of(n).unwrap())
            .collect();
        graph.dispatch_order(&mut candidates);
        let names: Vec<&str> = candidates
            .iter()
            .map(|&i| graph.node(i).pkg.name.as_str())
            .collect();
        // kernel has batch_priority 0, the rest tie at the default and
        // fall back to name order.
        assert_eq!(names, vec!["kernel", "openzfs", "zectl"]);
    }

    #[test]
    fn test_opaque_source_contributes_synthetic_binary() {
        let manifest: Manifest = serde_yaml::from_str(
            r#"
code_name: Angelfish
debian_release: bullseye
apt-repos:
  url: https://apt.example.org/debian
  distribution: bullseye
  components: main
build-epoch: 1
sources:
  - name: opaque-tool
    repo: https://github.com/truenas/opaque
    branch: master
    predepscmd:
      - ./generate-debian.sh
"#,
        )
        .unwrap();
        let packages = SourcePackage::from_manifest(&manifest);
        let graph =
            PackageGraph::build(packages, &FsControlResolver { layout: &Layout::new("/x") }, &|_| {
                Ok(false)
            })
            .unwrap();
        let node = graph.node(graph.index_of("opaque-tool").unwrap());
        assert_eq!(node.binaries.len(), 1);
        assert_eq!(node.binaries[0].name, "opaque-tool");
        assert!(node.binaries[0].install_deps.is_empty());
    }
}

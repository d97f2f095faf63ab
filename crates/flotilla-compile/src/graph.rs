//! Package dependency graph.
//!
//! Cycle detection runs at construction, before any compile call is
//! issued. The graph also computes the transitive dependency fingerprint
//! of each package: a dependency change re-fingerprints everything above
//! it even when a package's own source is untouched.

use std::collections::HashMap;

use flotilla_core::content_fingerprint;
use flotilla_plan::PackageSpec;

use crate::error::{CompileError, CompileResult};

/// Validated, acyclic package dependency graph.
#[derive(Debug)]
pub struct PackageGraph {
    specs: HashMap<String, PackageSpec>,
    /// Topological order: dependencies before dependents.
    order: Vec<String>,
    /// Package name -> dependency-closure fingerprint.
    fingerprints: HashMap<String, String>,
}

impl PackageGraph {
    /// Build and validate the graph from a plan's package set.
    pub fn build(packages: &[PackageSpec]) -> CompileResult<Self> {
        let specs: HashMap<String, PackageSpec> = packages
            .iter()
            .map(|p| (p.name.clone(), p.clone()))
            .collect();

        for pkg in packages {
            for dep in &pkg.dependencies {
                if !specs.contains_key(dep) {
                    return Err(CompileError::UnknownDependency {
                        package: pkg.name.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        // Iterative DFS with an explicit recursion stack for cycle
        // detection; post-order gives the topological order.
        let mut order = Vec::with_capacity(packages.len());
        let mut state: HashMap<&str, Visit> = HashMap::new();
        let mut names: Vec<&str> = specs.keys().map(String::as_str).collect();
        names.sort_unstable(); // deterministic order

        for root in names {
            if state.contains_key(root) {
                continue;
            }
            let mut stack: Vec<(&str, usize)> = vec![(root, 0)];
            state.insert(root, Visit::InProgress);
            while let Some((name, next_dep)) = stack.pop() {
                let deps = &specs[name].dependencies;
                if next_dep < deps.len() {
                    stack.push((name, next_dep + 1));
                    let dep = deps[next_dep].as_str();
                    match state.get(dep) {
                        Some(Visit::InProgress) => {
                            let mut cycle: Vec<String> = stack
                                .iter()
                                .map(|(n, _)| n.to_string())
                                .skip_while(|n| n != dep)
                                .collect();
                            cycle.push(dep.to_string());
                            return Err(CompileError::CyclicDependency { cycle });
                        }
                        Some(Visit::Done) => {}
                        None => {
                            state.insert(dep, Visit::InProgress);
                            stack.push((dep, 0));
                        }
                    }
                } else {
                    state.insert(name, Visit::Done);
                    order.push(name.to_string());
                }
            }
        }

        // Fingerprints bottom-up along the topological order.
        let mut fingerprints: HashMap<String, String> = HashMap::new();
        for name in &order {
            let spec = &specs[name];
            let mut dep_prints: Vec<&str> = spec
                .dependencies
                .iter()
                .map(|d| fingerprints[d].as_str())
                .collect();
            dep_prints.sort_unstable();
            let material = format!(
                "{}|{}|{}|{}",
                spec.name,
                spec.version,
                spec.source_blob,
                dep_prints.join(",")
            );
            fingerprints.insert(name.clone(), content_fingerprint(material.as_bytes()));
        }

        Ok(Self {
            specs,
            order,
            fingerprints,
        })
    }

    /// Packages in dependency order.
    pub fn order(&self) -> &[String] {
        &self.order
    }

    pub fn spec(&self, name: &str) -> Option<&PackageSpec> {
        self.specs.get(name)
    }

    /// Dependency-closure fingerprint of a package.
    pub fn fingerprint(&self, name: &str) -> Option<&str> {
        self.fingerprints.get(name).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[derive(Clone, Copy)]
enum Visit {
    InProgress,
    Done,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pkg(name: &str, deps: &[&str]) -> PackageSpec {
        PackageSpec {
            name: name.into(),
            version: "1".into(),
            source_blob: format!("blob-{name}"),
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
        }
    }

    #[test]
    fn topological_order_puts_dependencies_first() {
        let graph =
            PackageGraph::build(&[pkg("app", &["lib", "util"]), pkg("lib", &["util"]), pkg("util", &[])])
                .unwrap();
        let pos = |n: &str| graph.order().iter().position(|x| x == n).unwrap();
        assert!(pos("util") < pos("lib"));
        assert!(pos("lib") < pos("app"));
        assert_eq!(graph.len(), 3);
    }

    #[test]
    fn cycle_is_detected() {
        let err = PackageGraph::build(&[pkg("a", &["b"]), pkg("b", &["c"]), pkg("c", &["a"])])
            .unwrap_err();
        match err {
            CompileError::CyclicDependency { cycle } => {
                assert!(cycle.len() >= 3);
            }
            other => panic!("expected cycle, got {other}"),
        }
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let err = PackageGraph::build(&[pkg("a", &["a"])]).unwrap_err();
        assert!(matches!(err, CompileError::CyclicDependency { .. }));
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let err = PackageGraph::build(&[pkg("a", &["ghost"])]).unwrap_err();
        assert!(matches!(err, CompileError::UnknownDependency { .. }));
    }

    #[test]
    fn dependency_change_cascades_through_fingerprints() {
        let v1 = PackageGraph::build(&[pkg("app", &["lib"]), pkg("lib", &[])]).unwrap();

        // Bump only lib's source blob.
        let mut lib2 = pkg("lib", &[]);
        lib2.source_blob = "blob-lib-v2".into();
        let v2 = PackageGraph::build(&[pkg("app", &["lib"]), lib2]).unwrap();

        assert_ne!(v1.fingerprint("lib"), v2.fingerprint("lib"));
        // app's own spec is unchanged but its fingerprint moved.
        assert_ne!(v1.fingerprint("app"), v2.fingerprint("app"));
    }

    #[test]
    fn fingerprints_are_stable_across_builds() {
        let a = PackageGraph::build(&[pkg("app", &["lib"]), pkg("lib", &[])]).unwrap();
        let b = PackageGraph::build(&[pkg("lib", &[]), pkg("app", &["lib"])]).unwrap();
        assert_eq!(a.fingerprint("app"), b.fingerprint("app"));
    }
}

// Copyright 2025 Plugify Contributors
// SPDX-License-Identifier: MIT

//! Dependency resolution.
//!
//! Kahn's algorithm over the dependency graph with per-edge constraint
//! filtering: each package's requirements and conflicts are checked
//! against the full package set, circular dependencies are detected via
//! DFS over the recursion stack, and a deterministic topological order is
//! computed over whatever remains loadable.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::error::{DependencyIssue, DependencyIssueKind};
use crate::manifest::{Manifest, PackageId};

/// Per-package resolution outcome: the issues raised against it and
/// whether they block loading.
#[derive(Debug, Clone, Default)]
pub struct PackageResolution {
    pub id: PackageId,
    pub issues: Vec<DependencyIssue>,
}

impl PackageResolution {
    pub fn can_load(&self) -> bool {
        !self.issues.iter().any(|i| i.is_blocker)
    }

    pub fn blocker_count(&self) -> usize {
        self.issues.iter().filter(|i| i.is_blocker).count()
    }
}

/// Full result of a dependency resolution pass.
#[derive(Debug, Clone, Default)]
pub struct DependencyReport {
    pub resolutions: Vec<PackageResolution>,
    pub dependency_graph: HashMap<PackageId, Vec<PackageId>>,
    pub reverse_dependency_graph: HashMap<PackageId, Vec<PackageId>>,
    pub load_order: Vec<PackageId>,
    pub is_load_order_valid: bool,
}

impl DependencyReport {
    pub fn has_blocking_issues(&self) -> bool {
        self.resolutions.iter().any(|r| !r.can_load())
    }

    pub fn blocker_count(&self) -> usize {
        self.resolutions.iter().filter(|r| r.blocker_count() > 0).count()
    }

    pub fn packages_with_issues(&self) -> Vec<PackageId> {
        self.resolutions.iter().filter(|r| !r.issues.is_empty()).map(|r| r.id.clone()).collect()
    }

    pub fn loadable_packages(&self) -> Vec<PackageId> {
        self.resolutions.iter().filter(|r| r.can_load()).map(|r| r.id.clone()).collect()
    }

    pub fn direct_dependents(&self, package: &str) -> Vec<PackageId> {
        self.reverse_dependency_graph.get(package).cloned().unwrap_or_default()
    }
}

/// Resolves a closed collection of manifests into a [`DependencyReport`].
pub struct DependencyResolver;

impl DependencyResolver {
    pub fn new() -> Self {
        Self
    }

    pub fn resolve(&self, packages: &HashMap<PackageId, Manifest>) -> DependencyReport {
        let mut report = DependencyReport::default();

        self.process_all_packages(packages, &mut report);
        self.detect_all_circular_dependencies(packages, &mut report);
        self.compute_load_order(packages, &mut report);

        report
    }

    fn process_all_packages(&self, packages: &HashMap<PackageId, Manifest>, report: &mut DependencyReport) {
        let mut names: Vec<&PackageId> = packages.keys().collect();
        names.sort();

        for id in names {
            let manifest = &packages[id];
            let mut resolution = PackageResolution { id: id.clone(), issues: Vec::new() };

            let deps: Vec<PackageId> = manifest.dependencies().iter().map(|d| d.name.clone()).collect();
            report.dependency_graph.insert(id.clone(), deps.clone());
            for dep_name in &deps {
                report.reverse_dependency_graph.entry(dep_name.clone()).or_default().push(id.clone());
            }

            for dep in manifest.dependencies() {
                match packages.get(&dep.name) {
                    None => {
                        if !dep.optional {
                            resolution.issues.push(DependencyIssue {
                                kind: DependencyIssueKind::Missing,
                                affected_package: id.clone(),
                                involved_package: Some(dep.name.clone()),
                                description: format!("'{}' requires '{}', which is not present", id, dep.name),
                                is_blocker: true,
                                suggested_fixes: vec![format!("install package '{}'", dep.name)],
                            });
                        }
                    }
                    Some(dep_manifest) => {
                        if !dep.is_satisfied_by(dep_manifest.version()) {
                            resolution.issues.push(DependencyIssue {
                                kind: DependencyIssueKind::VersionConflict,
                                affected_package: id.clone(),
                                involved_package: Some(dep.name.clone()),
                                description: format!(
                                    "'{}' requires '{}' {}, found {}",
                                    id,
                                    dep.name,
                                    format_constraints(&dep.constraints),
                                    dep_manifest.version()
                                ),
                                is_blocker: !dep.optional,
                                suggested_fixes: vec![format!(
                                    "update '{}' to a version matching {}",
                                    dep.name,
                                    format_constraints(&dep.constraints)
                                )],
                            });
                        }
                    }
                }
            }

            for conflict in manifest.conflicts() {
                if let Some(other) = packages.get(&conflict.name) {
                    if conflict.forbids(other.version()) {
                        resolution.issues.push(DependencyIssue {
                            kind: DependencyIssueKind::MutualConflict,
                            affected_package: id.clone(),
                            involved_package: Some(conflict.name.clone()),
                            description: conflict
                                .reason
                                .clone()
                                .unwrap_or_else(|| format!("'{}' conflicts with '{}'", id, conflict.name)),
                            is_blocker: true,
                            suggested_fixes: vec![format!("remove either '{}' or '{}'", id, conflict.name)],
                        });
                    }
                }
            }

            report.resolutions.push(resolution);
        }
    }

    fn detect_all_circular_dependencies(&self, packages: &HashMap<PackageId, Manifest>, report: &mut DependencyReport) {
        let mut visited = HashSet::new();
        let mut names: Vec<&PackageId> = packages.keys().collect();
        names.sort();

        for id in names {
            if !visited.contains(id) {
                let mut recursion_stack = HashSet::new();
                let mut path = Vec::new();
                self.detect_cycles_from_node(id, packages, &mut visited, &mut recursion_stack, &mut path, report);
            }
        }
    }

    fn detect_cycles_from_node<'a>(
        &self,
        node: &'a PackageId,
        packages: &'a HashMap<PackageId, Manifest>,
        visited: &mut HashSet<&'a PackageId>,
        recursion_stack: &mut HashSet<&'a PackageId>,
        path: &mut Vec<&'a PackageId>,
        report: &mut DependencyReport,
    ) {
        visited.insert(node);
        recursion_stack.insert(node);
        path.push(node);

        if let Some(manifest) = packages.get(node) {
            for dep in manifest.dependencies() {
                if !packages.contains_key(&dep.name) {
                    continue;
                }
                // Borrow-checker note: `dep.name` doesn't live as long as
                // `'a`; look up the key actually stored in `packages` so
                // the recursion stack's lifetimes line up.
                let (dep_key, _) = packages.get_key_value(&dep.name).unwrap();
                if recursion_stack.contains(dep_key) {
                    let cycle_start = path.iter().position(|p| **p == *dep_key).unwrap_or(0);
                    let cycle: Vec<PackageId> = path[cycle_start..].iter().map(|p| (**p).clone()).collect();
                    self.record_circular_dependency(&cycle, report);
                } else if !visited.contains(dep_key) {
                    self.detect_cycles_from_node(dep_key, packages, visited, recursion_stack, path, report);
                }
            }
        }

        path.pop();
        recursion_stack.remove(node);
    }

    fn record_circular_dependency(&self, cycle: &[PackageId], report: &mut DependencyReport) {
        if cycle.is_empty() {
            return;
        }
        let description = format!("circular dependency: {}", cycle.join(" -> "));
        for id in cycle {
            if let Some(resolution) = report.resolutions.iter_mut().find(|r| &r.id == id) {
                let already_recorded = resolution
                    .issues
                    .iter()
                    .any(|i| i.kind == DependencyIssueKind::Circular && i.description == description);
                if !already_recorded {
                    resolution.issues.push(DependencyIssue {
                        kind: DependencyIssueKind::Circular,
                        affected_package: id.clone(),
                        involved_package: None,
                        description: description.clone(),
                        is_blocker: true,
                        suggested_fixes: vec!["break the cycle by removing or making one edge optional".to_string()],
                    });
                }
            }
        }
    }

    /// Kahn's algorithm over edges whose endpoints are both present and
    /// loadable, with name-ascending tie-breaks among ready nodes for a
    /// deterministic order: dependencies precede dependents, and among
    /// packages with no remaining ordering constraint, name order is used
    /// as a stable tiebreak.
    fn compute_load_order(&self, packages: &HashMap<PackageId, Manifest>, report: &mut DependencyReport) {
        let loadable: HashSet<PackageId> = report.loadable_packages().into_iter().collect();

        let mut in_degree: HashMap<PackageId, usize> = loadable.iter().map(|id| (id.clone(), 0)).collect();
        let mut forward: HashMap<PackageId, Vec<PackageId>> = loadable.iter().map(|id| (id.clone(), Vec::new())).collect();

        for id in &loadable {
            let manifest = &packages[id];
            for dep in manifest.dependencies() {
                if loadable.contains(&dep.name) {
                    forward.get_mut(&dep.name).unwrap().push(id.clone());
                    *in_degree.get_mut(id).unwrap() += 1;
                }
            }
        }

        let mut ready: VecDeque<PackageId> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(id, _)| id.clone())
            .collect();
        let mut ready_vec: Vec<PackageId> = ready.drain(..).collect();
        ready_vec.sort();
        let mut ready: VecDeque<PackageId> = ready_vec.into();

        let mut order = Vec::with_capacity(loadable.len());
        while let Some(id) = ready.pop_front() {
            order.push(id.clone());
            let mut newly_ready = Vec::new();
            for dependent in &forward[&id] {
                let degree = in_degree.get_mut(dependent).unwrap();
                *degree -= 1;
                if *degree == 0 {
                    newly_ready.push(dependent.clone());
                }
            }
            newly_ready.sort();
            let mut merged: Vec<PackageId> = ready.drain(..).chain(newly_ready).collect();
            merged.sort();
            ready = merged.into();
        }

        let has_cycle = report
            .resolutions
            .iter()
            .any(|r| r.issues.iter().any(|i| i.kind == DependencyIssueKind::Circular));
        report.is_load_order_valid = !has_cycle && order.len() == loadable.len();
        report.load_order = order;
    }
}

impl Default for DependencyResolver {
    fn default() -> Self {
        Self::new()
    }
}

fn format_constraints(constraints: &[crate::version::Constraint]) -> String {
    if constraints.is_empty() {
        return "any version".to_string();
    }
    constraints.iter().map(|c| c.to_string()).collect::<Vec<_>>().join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{Dependency, ManifestCommon, ModuleManifest};
    use crate::version::{Constraint, Version};
    use std::path::PathBuf;

    fn module(name: &str, version: Version, deps: Vec<Dependency>) -> Manifest {
        Manifest::Module(ModuleManifest {
            common: ManifestCommon {
                name: name.to_string(),
                version,
                description: None,
                author: None,
                website: None,
                license: None,
                platforms: vec![],
                dependencies: deps,
                conflicts: vec![],
                source_path: PathBuf::new(),
            },
            language: "lua".to_string(),
            runtime_library_path: PathBuf::from(format!("{name}.so")),
            search_directories: vec![],
            force_load: false,
        })
    }

    #[test]
    fn missing_required_dependency_is_blocking() {
        let mut packages = HashMap::new();
        packages.insert(
            "a".to_string(),
            module("a", Version::new(1, 0, 0), vec![Dependency { name: "b".into(), constraints: vec![], optional: false }]),
        );
        let report = DependencyResolver::new().resolve(&packages);
        assert!(report.has_blocking_issues());
        assert!(!report.loadable_packages().contains(&"a".to_string()));
    }

    #[test]
    fn missing_optional_dependency_is_not_blocking() {
        let mut packages = HashMap::new();
        packages.insert(
            "a".to_string(),
            module("a", Version::new(1, 0, 0), vec![Dependency { name: "b".into(), constraints: vec![], optional: true }]),
        );
        let report = DependencyResolver::new().resolve(&packages);
        assert!(!report.has_blocking_issues());
        assert_eq!(report.load_order, vec!["a".to_string()]);
    }

    #[test]
    fn load_order_places_dependency_before_dependent() {
        let mut packages = HashMap::new();
        packages.insert("a".to_string(), module("a", Version::new(1, 0, 0), vec![]));
        packages.insert(
            "b".to_string(),
            module("b", Version::new(1, 0, 0), vec![Dependency { name: "a".into(), constraints: vec![], optional: false }]),
        );
        let report = DependencyResolver::new().resolve(&packages);
        assert!(report.is_load_order_valid);
        let pos_a = report.load_order.iter().position(|p| p == "a").unwrap();
        let pos_b = report.load_order.iter().position(|p| p == "b").unwrap();
        assert!(pos_a < pos_b);
    }

    #[test]
    fn circular_dependency_blocks_both_packages() {
        let mut packages = HashMap::new();
        packages.insert(
            "a".to_string(),
            module("a", Version::new(1, 0, 0), vec![Dependency { name: "b".into(), constraints: vec![], optional: false }]),
        );
        packages.insert(
            "b".to_string(),
            module("b", Version::new(1, 0, 0), vec![Dependency { name: "a".into(), constraints: vec![], optional: false }]),
        );
        let report = DependencyResolver::new().resolve(&packages);
        assert!(report.has_blocking_issues());
        let a = report.resolutions.iter().find(|r| r.id == "a").unwrap();
        assert!(a.issues.iter().any(|i| i.kind == DependencyIssueKind::Circular));
    }

    #[test]
    fn version_conflict_is_reported_with_suggestion() {
        let mut packages = HashMap::new();
        packages.insert(
            "a".to_string(),
            module(
                "a",
                Version::new(1, 0, 0),
                vec![Dependency {
                    name: "b".into(),
                    constraints: vec![">=2.0.0".parse::<Constraint>().unwrap()],
                    optional: false,
                }],
            ),
        );
        packages.insert("b".to_string(), module("b", Version::new(1, 0, 0), vec![]));
        let report = DependencyResolver::new().resolve(&packages);
        let a = report.resolutions.iter().find(|r| r.id == "a").unwrap();
        let issue = a.issues.iter().find(|i| i.kind == DependencyIssueKind::VersionConflict).unwrap();
        assert!(!issue.suggested_fixes.is_empty());
    }

    #[test]
    fn tie_break_among_independent_packages_is_name_ascending() {
        let mut packages = HashMap::new();
        packages.insert("zeta".to_string(), module("zeta", Version::new(1, 0, 0), vec![]));
        packages.insert("alpha".to_string(), module("alpha", Version::new(1, 0, 0), vec![]));
        let report = DependencyResolver::new().resolve(&packages);
        assert_eq!(report.load_order, vec!["alpha".to_string(), "zeta".to_string()]);
    }
}

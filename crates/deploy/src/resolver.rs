//! Dependency resolution into a deterministic execution order.

use std::collections::HashSet;

use derive_more::Deref;

use crate::descriptor::{DeploymentUnit, DescriptorSet};
use crate::error::{DeployError, Result};

/// Unit names in the order they must be processed.
#[derive(Debug, Clone, PartialEq, Eq, Deref)]
pub struct ExecutionOrder(Vec<String>);

impl ExecutionOrder {
    pub fn into_inner(self) -> Vec<String> {
        self.0
    }
}

/// Order every unit of the set after all of its dependencies.
///
/// Among units whose dependencies are all placed, the first declared wins, so the
/// output is stable for identical input. Fails without partial output on an unknown
/// dependency name or a cycle.
pub fn resolve(set: &DescriptorSet) -> Result<ExecutionOrder> {
    let known: HashSet<&str> = set.iter().map(|u| u.name.as_str()).collect();
    for unit in set.iter() {
        if let Some(missing) = unit
            .dependencies
            .iter()
            .find(|dep| !known.contains(dep.as_str()))
        {
            return Err(DeployError::UnresolvedDependency {
                unit: unit.name.clone(),
                missing: missing.clone(),
            });
        }
    }

    let mut placed: HashSet<&str> = HashSet::with_capacity(set.len());
    let mut order = Vec::with_capacity(set.len());

    while order.len() < set.len() {
        let ready = set.iter().find(|unit| {
            !placed.contains(unit.name.as_str())
                && unit
                    .dependencies
                    .iter()
                    .all(|dep| placed.contains(dep.as_str()))
        });

        match ready {
            Some(unit) => {
                placed.insert(unit.name.as_str());
                order.push(unit.name.clone());
            }
            None => {
                return Err(DeployError::CyclicDependency {
                    members: find_cycle(set, &placed),
                });
            }
        }
    }

    tracing::debug!(order = ?order, "Resolved execution order");
    Ok(ExecutionOrder(order))
}

/// Resolve the whole set, then keep only the requested units and everything they
/// transitively depend on. An empty request selects every unit.
pub fn resolve_scoped(set: &DescriptorSet, requested: &[String]) -> Result<ExecutionOrder> {
    let full = resolve(set)?;
    if requested.is_empty() {
        return Ok(full);
    }

    let mut wanted: HashSet<&str> = HashSet::new();
    let mut stack: Vec<&str> = Vec::with_capacity(requested.len());
    for name in requested {
        let unit = set
            .unit(name)
            .ok_or_else(|| DeployError::config(format!("requested unit '{name}' is not declared")))?;
        stack.push(unit.name.as_str());
    }

    while let Some(name) = stack.pop() {
        if wanted.insert(name)
            && let Some(unit) = set.unit(name)
        {
            stack.extend(unit.dependencies.iter().map(String::as_str));
        }
    }

    Ok(ExecutionOrder(
        full.0
            .into_iter()
            .filter(|name| wanted.contains(name.as_str()))
            .collect(),
    ))
}

/// Walk unplaced units along unplaced dependencies until a unit repeats.
///
/// Every unplaced unit has at least one unplaced dependency once resolution stalls,
/// so the walk always closes a loop.
fn find_cycle(set: &DescriptorSet, placed: &HashSet<&str>) -> Vec<String> {
    let unplaced = |name: &str| !placed.contains(name);

    let Some(mut current) = set.iter().find(|u| unplaced(&u.name)) else {
        return Vec::new();
    };
    let mut path: Vec<&DeploymentUnit> = Vec::new();

    loop {
        if let Some(pos) = path.iter().position(|u| u.name == current.name) {
            return path[pos..].iter().map(|u| u.name.clone()).collect();
        }
        path.push(current);

        match current
            .dependencies
            .iter()
            .find(|dep| unplaced(dep))
            .and_then(|dep| set.unit(dep))
        {
            Some(next) => current = next,
            None => return path.iter().map(|u| u.name.clone()).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(name: &str, deps: &[&str]) -> DeploymentUnit {
        DeploymentUnit {
            name: name.to_string(),
            implementation: name.to_string(),
            proxy: None,
            constructor_args: Vec::new(),
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
            skip_if_already_deployed: true,
        }
    }

    fn set(units: Vec<DeploymentUnit>) -> DescriptorSet {
        DescriptorSet {
            units,
            wiring: Vec::new(),
        }
    }

    fn assert_topological(set: &DescriptorSet, order: &ExecutionOrder) {
        assert_eq!(order.len(), set.len(), "every unit appears exactly once");
        for unit in set.iter() {
            let pos = order.iter().position(|n| *n == unit.name).unwrap();
            for dep in &unit.dependencies {
                let dep_pos = order.iter().position(|n| n == dep).unwrap();
                assert!(dep_pos < pos, "{dep} must come before {}", unit.name);
            }
        }
    }

    #[test]
    fn test_independent_units_keep_declaration_order() {
        let set = set(vec![unit("A", &[]), unit("B", &[]), unit("C", &["A", "B"])]);
        let order = resolve(&set).unwrap();
        assert_eq!(order.into_inner(), vec!["A", "B", "C"]);
    }

    #[test]
    fn test_dependency_declared_later_moves_first() {
        let set = set(vec![
            unit("ResolveController", &["CellIDRegistry", "CellNameSpace"]),
            unit("CellIDRegistry", &[]),
            unit("SBTsFactory", &[]),
            unit("CellNameSpace", &[]),
        ]);
        let order = resolve(&set).unwrap();
        assert_eq!(
            order.into_inner(),
            vec![
                "CellIDRegistry",
                "SBTsFactory",
                "CellNameSpace",
                "ResolveController"
            ]
        );
    }

    #[test]
    fn test_resolution_is_deterministic_and_topological() {
        let graphs = vec![
            set(vec![
                unit("D", &["B", "C"]),
                unit("C", &["A"]),
                unit("B", &["A"]),
                unit("A", &[]),
            ]),
            set(vec![
                unit("E", &[]),
                unit("F", &["E"]),
                unit("G", &["F", "E"]),
                unit("H", &[]),
                unit("I", &["H", "G"]),
            ]),
            set(vec![unit("solo", &[])]),
            set(vec![]),
        ];

        for graph in &graphs {
            let first = resolve(graph).unwrap();
            assert_topological(graph, &first);
            for _ in 0..5 {
                assert_eq!(resolve(graph).unwrap(), first);
            }
        }
    }

    #[test]
    fn test_two_unit_cycle() {
        let set = set(vec![unit("A", &["B"]), unit("B", &["A"])]);
        match resolve(&set) {
            Err(DeployError::CyclicDependency { members }) => {
                assert_eq!(members, vec!["A", "B"]);
            }
            other => panic!("expected a cycle error, got {other:?}"),
        }
    }

    #[test]
    fn test_cycle_behind_acyclic_prefix() {
        let set = set(vec![
            unit("A", &[]),
            unit("B", &["A", "D"]),
            unit("C", &["B"]),
            unit("D", &["C"]),
        ]);
        match resolve(&set) {
            Err(DeployError::CyclicDependency { members }) => {
                assert_eq!(members, vec!["B", "D", "C"]);
            }
            other => panic!("expected a cycle error, got {other:?}"),
        }
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let set = set(vec![unit("A", &["A"])]);
        match resolve(&set) {
            Err(DeployError::CyclicDependency { members }) => assert_eq!(members, vec!["A"]),
            other => panic!("expected a cycle error, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_dependency() {
        let set = set(vec![unit("A", &[]), unit("B", &["Nope"])]);
        match resolve(&set) {
            Err(DeployError::UnresolvedDependency { unit, missing }) => {
                assert_eq!(unit, "B");
                assert_eq!(missing, "Nope");
            }
            other => panic!("expected an unresolved dependency, got {other:?}"),
        }
    }

    #[test]
    fn test_scoped_resolution_pulls_dependencies() {
        let set = set(vec![
            unit("A", &[]),
            unit("B", &[]),
            unit("C", &["A"]),
            unit("D", &["C"]),
        ]);
        let order = resolve_scoped(&set, &["D".to_string()]).unwrap();
        assert_eq!(order.into_inner(), vec!["A", "C", "D"]);

        let all = resolve_scoped(&set, &[]).unwrap();
        assert_eq!(all.len(), 4);
    }

    #[test]
    fn test_scoped_resolution_unknown_unit() {
        let set = set(vec![unit("A", &[])]);
        let err = resolve_scoped(&set, &["Z".to_string()]).unwrap_err();
        assert!(matches!(err, DeployError::Configuration(_)));
    }

    #[test]
    fn test_scoped_resolution_still_rejects_cycles_elsewhere() {
        let set = set(vec![unit("A", &[]), unit("B", &["C"]), unit("C", &["B"])]);
        assert!(matches!(
            resolve_scoped(&set, &["A".to_string()]),
            Err(DeployError::CyclicDependency { .. })
        ));
    }
}

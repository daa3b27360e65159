//! Dependency resolution.
//!
//! Units are ordered with Kahn's algorithm. Among units whose dependencies
//! are all satisfied, the one with the smallest `(created_at, id)` goes first,
//! so the order is stable across runs and independent of registration order.

use std::collections::{BTreeSet, HashMap, HashSet};

use super::error::DependencyError;
use super::unit::MigrationUnit;

/// Orders migration units by their declared dependencies.
pub struct DependencyResolver;

impl DependencyResolver {
    /// Order every unit so that dependencies come before dependents.
    pub fn resolve<'a>(
        units: &[&'a MigrationUnit],
    ) -> Result<Vec<&'a MigrationUnit>, DependencyError> {
        let mut by_id: HashMap<&str, &'a MigrationUnit> = HashMap::with_capacity(units.len());
        for &unit in units {
            if by_id.insert(unit.id(), unit).is_some() {
                return Err(DependencyError::Duplicate {
                    id: unit.id().to_string(),
                });
            }
        }

        for &unit in units {
            for dep in unit.dependencies() {
                if !by_id.contains_key(dep.as_str()) {
                    return Err(DependencyError::Missing {
                        migration: unit.id().to_string(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        let mut remaining: HashMap<&str, usize> = HashMap::with_capacity(units.len());
        let mut dependents: HashMap<&str, Vec<&'a MigrationUnit>> = HashMap::new();
        let mut ready: BTreeSet<(u64, &str)> = BTreeSet::new();

        for &unit in units {
            let deps: HashSet<&str> = unit.dependencies().iter().map(String::as_str).collect();
            remaining.insert(unit.id(), deps.len());
            for dep in deps {
                dependents.entry(dep).or_default().push(unit);
            }
            if unit.dependencies().is_empty() {
                ready.insert(sort_key(unit));
            }
        }

        let mut ordered = Vec::with_capacity(units.len());
        while let Some(next) = ready.pop_first() {
            let unit = by_id[next.1];
            ordered.push(unit);
            if let Some(children) = dependents.get(unit.id()) {
                for &child in children {
                    if let Some(count) = remaining.get_mut(child.id()) {
                        *count -= 1;
                        if *count == 0 {
                            ready.insert(sort_key(child));
                        }
                    }
                }
            }
        }

        if ordered.len() < units.len() {
            let placed: HashSet<&str> = ordered.iter().map(|u| u.id()).collect();
            let path = find_cycle(&by_id, &placed);
            return Err(DependencyError::Cycle { path });
        }

        Ok(ordered)
    }

    /// Order `target` and its transitive dependencies.
    ///
    /// Fails on a missing dependency or a cycle reachable from `target`.
    pub fn resolve_target<'a>(
        units: &[&'a MigrationUnit],
        target: &str,
    ) -> Result<Vec<&'a MigrationUnit>, DependencyError> {
        let by_id: HashMap<&str, &'a MigrationUnit> =
            units.iter().map(|&u| (u.id(), u)).collect();

        let mut closure: Vec<&'a MigrationUnit> = Vec::new();
        let mut seen: HashSet<&str> = HashSet::new();
        let mut stack = vec![target];
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            let unit = *by_id.get(id).ok_or_else(|| DependencyError::Missing {
                migration: target.to_string(),
                dependency: id.to_string(),
            })?;
            closure.push(unit);
            for dep in unit.dependencies() {
                if !by_id.contains_key(dep.as_str()) {
                    return Err(DependencyError::Missing {
                        migration: unit.id().to_string(),
                        dependency: dep.clone(),
                    });
                }
                stack.push(dep.as_str());
            }
        }

        Self::resolve(&closure)
    }
}

fn sort_key(unit: &MigrationUnit) -> (u64, &str) {
    (unit.metadata().created_at, unit.id())
}

/// Walk dependency edges among unplaced units until a node repeats.
///
/// Every unplaced unit has at least one unplaced dependency, so the walk
/// always closes a cycle. Starting from the smallest unplaced id and always
/// following the smallest unplaced dependency keeps the reported path stable.
fn find_cycle(by_id: &HashMap<&str, &MigrationUnit>, placed: &HashSet<&str>) -> Vec<String> {
    let mut unplaced: Vec<&str> = by_id
        .keys()
        .copied()
        .filter(|id| !placed.contains(id))
        .collect();
    unplaced.sort_unstable();

    let Some(start) = unplaced.first().copied() else {
        return Vec::new();
    };

    let mut path: Vec<&str> = Vec::new();
    let mut position: HashMap<&str, usize> = HashMap::new();
    let mut current = start;
    loop {
        if let Some(&idx) = position.get(current) {
            let mut cycle: Vec<String> = path[idx..].iter().map(|s| s.to_string()).collect();
            cycle.push(current.to_string());
            return cycle;
        }
        position.insert(current, path.len());
        path.push(current);

        let mut deps: Vec<&str> = by_id[current]
            .dependencies()
            .iter()
            .map(String::as_str)
            .filter(|d| !placed.contains(d))
            .collect();
        deps.sort_unstable();
        match deps.first() {
            Some(&next) => current = next,
            None => return path.iter().map(|s| s.to_string()).collect(),
        }
    }
}

//! The set of known migration units.

use std::collections::HashMap;

use super::error::MigrationError;
use super::resolver::DependencyResolver;
use super::unit::{MigrationKind, MigrationUnit};

/// Registered migration units, kept in dependency order.
///
/// Construction validates the whole graph, so a registry that exists has
/// unique ids, no missing dependencies and no cycles.
#[derive(Debug, Clone)]
pub struct MigrationRegistry {
    units: Vec<MigrationUnit>,
    index: HashMap<String, usize>,
}

impl MigrationRegistry {
    /// Build a registry from a manifest of units.
    pub fn from_manifest(units: Vec<MigrationUnit>) -> Result<Self, MigrationError> {
        let order: Vec<String> = {
            let refs: Vec<&MigrationUnit> = units.iter().collect();
            DependencyResolver::resolve(&refs)?
                .into_iter()
                .map(|u| u.id().to_string())
                .collect()
        };

        let mut by_id: HashMap<String, MigrationUnit> =
            units.into_iter().map(|u| (u.id().to_string(), u)).collect();
        let mut ordered = Vec::with_capacity(order.len());
        let mut index = HashMap::with_capacity(order.len());
        for id in order {
            if let Some(unit) = by_id.remove(&id) {
                index.insert(id, ordered.len());
                ordered.push(unit);
            }
        }

        tracing::debug!(migrations = ordered.len(), "registry built");
        Ok(Self {
            units: ordered,
            index,
        })
    }

    /// An empty registry.
    pub fn empty() -> Self {
        Self {
            units: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Look up a unit.
    pub fn get(&self, id: &str) -> Option<&MigrationUnit> {
        self.index.get(id).map(|&i| &self.units[i])
    }

    /// Look up a unit, failing with `NotFound`.
    pub fn require(&self, id: &str) -> Result<&MigrationUnit, MigrationError> {
        self.get(id).ok_or_else(|| MigrationError::NotFound {
            migration_id: id.to_string(),
        })
    }

    /// Every unit in dependency order.
    pub fn ordered(&self) -> &[MigrationUnit] {
        &self.units
    }

    /// Units of one kind, in dependency order.
    pub fn of_kind(&self, kind: MigrationKind) -> impl Iterator<Item = &MigrationUnit> {
        self.units.iter().filter(move |u| u.kind() == kind)
    }

    /// Number of registered units.
    pub fn len(&self) -> usize {
        self.units.len()
    }

    /// Returns `true` if no unit is registered.
    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// `id` and its transitive dependencies, in execution order.
    pub fn resolve_target(&self, id: &str) -> Result<Vec<&MigrationUnit>, MigrationError> {
        self.require(id)?;
        let refs: Vec<&MigrationUnit> = self.units.iter().collect();
        Ok(DependencyResolver::resolve_target(&refs, id)?)
    }

    /// Units that declare `id` as a direct dependency.
    pub fn dependents_of(&self, id: &str) -> Vec<&MigrationUnit> {
        self.units
            .iter()
            .filter(|u| u.dependencies().iter().any(|d| d == id))
            .collect()
    }
}

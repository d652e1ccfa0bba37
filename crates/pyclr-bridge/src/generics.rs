//! Generic type name registry.
//!
//! Native code names generic types without their arity suffix. This registry
//! maps (namespace, base name) to the full names of the generic definitions
//! so an arity-qualified lookup finds the right one.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

use crate::managed::TypeName;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenericRegistry {
    /// namespace -> base name -> full names, in registration order
    mapping: IndexMap<SmolStr, IndexMap<SmolStr, Vec<SmolStr>>>,
}

impl GenericRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a generic definition. Non-generic names are ignored.
    pub fn register(&mut self, name: &TypeName) -> bool {
        if !name.is_generic() {
            return false;
        }
        let names = self
            .mapping
            .entry(SmolStr::new(name.namespace()))
            .or_default()
            .entry(SmolStr::new(name.base_name()))
            .or_default();
        if names.iter().any(|existing| existing == name.name()) {
            return false;
        }
        names.push(SmolStr::new(name.name()));
        true
    }

    pub fn register_all<'a>(&mut self, names: impl IntoIterator<Item = &'a TypeName>) -> usize {
        names.into_iter().filter(|name| self.register(name)).count()
    }

    /// Base names of the generic definitions in a namespace
    pub fn base_names(&self, namespace: &str) -> Vec<SmolStr> {
        self.mapping
            .get(namespace)
            .map(|bases| bases.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// The definition of `base` taking `arity` parameters.
    pub fn generic_by_name(&self, namespace: &str, base: &str, arity: usize) -> Option<TypeName> {
        self.mapping
            .get(namespace)?
            .get(base)?
            .iter()
            .map(|name| TypeName::new(namespace, name.clone()))
            .find(|name| name.generic_arity() == arity)
    }

    /// The first definition registered for `base`.
    pub fn generic_name_for_base(&self, namespace: &str, base: &str) -> Option<TypeName> {
        self.mapping
            .get(namespace)?
            .get(base)?
            .first()
            .map(|name| TypeName::new(namespace, name.clone()))
    }

    pub fn names(&self) -> impl Iterator<Item = TypeName> + '_ {
        self.mapping.iter().flat_map(|(namespace, bases)| {
            bases
                .values()
                .flatten()
                .map(move |name| TypeName::new(namespace.clone(), name.clone()))
        })
    }

    pub fn len(&self) -> usize {
        self.mapping.values().flat_map(|bases| bases.values()).map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn reset(&mut self) {
        self.mapping.clear();
    }
}

//! Namespace imports: the set of managed namespaces the native side has
//! pulled in, kept across reloads.

use std::sync::Arc;

use indexmap::IndexSet;
use pyclr_native::{gil, NativeObject};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use tracing::{debug, instrument};

use crate::engine::Engine;
use crate::error::{BridgeError, BridgeResult};
use crate::projection::TypeDescriptor;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportState {
    namespaces: IndexSet<SmolStr>,
}

impl ImportState {
    /// Returns `true` on the first import of `namespace`.
    pub fn record(&mut self, namespace: &str) -> bool {
        self.namespaces.insert(SmolStr::new(namespace))
    }

    pub fn contains(&self, namespace: &str) -> bool {
        self.namespaces.contains(namespace)
    }

    /// Imported namespaces in import order
    pub fn namespaces(&self) -> Vec<SmolStr> {
        self.namespaces.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.namespaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.namespaces.is_empty()
    }

    pub fn clear(&mut self) {
        self.namespaces.clear();
    }
}

impl Engine {
    /// Project every type of a managed namespace.
    #[instrument(skip(self))]
    pub fn import_namespace(&self, namespace: &str) -> BridgeResult<Vec<Arc<TypeDescriptor>>> {
        gil::assert_held("import_namespace");
        let types = self.domain().types_in(namespace);
        if types.is_empty() {
            return Err(BridgeError::NamespaceNotFound {
                namespace: namespace.to_string(),
            });
        }
        let descriptors = types
            .iter()
            .map(|ty| self.project(ty.name()))
            .collect::<BridgeResult<Vec<_>>>()?;
        if self.imports.lock().record(namespace) {
            debug!(types = descriptors.len(), "namespace imported");
        }
        Ok(descriptors)
    }

    pub fn is_imported(&self, namespace: &str) -> bool {
        self.imports.lock().contains(namespace)
    }

    /// Import a native module by dotted name.
    pub fn import_module(&self, name: &str) -> BridgeResult<NativeObject> {
        gil::assert_held("import_module");
        Ok(self.native().import_module(name)?.into_managed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_record_keeps_import_order() {
        let mut state = ImportState::default();
        assert!(state.record("System.IO"));
        assert!(state.record("Demo"));
        assert!(!state.record("System.IO"));
        assert_eq!(state.namespaces(), vec![SmolStr::new("System.IO"), SmolStr::new("Demo")]);
        assert!(state.contains("Demo"));
        state.clear();
        assert!(state.is_empty());
    }
}

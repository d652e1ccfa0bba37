//! Bridge Registry
//!
//! Process-wide map from bridge handles to the native object, descriptor and
//! managed target of every live bridge object. Each bridge object stores its
//! handle in the trailing slot of its native instance.
//!
//! The registry only ever runs under the engine's mutex, and callers never
//! drop managed targets or release native references while holding it: a
//! release can re-enter the deallocation adapter, which takes the mutex.

use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

use crate::error::{BridgeError, BridgeResult};
use crate::managed::{InstanceId, ManagedRef, Member, TypeName};
use crate::maybe::MaybeMember;
use crate::projection::TypeDescriptor;

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

/// Registry key stored in a bridge object's trailing slot. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(NonZeroU64);

impl HandleId {
    fn next() -> Self {
        let raw = NEXT_HANDLE.fetch_add(1, Ordering::Relaxed);
        // the counter starts at 1 and would need 2^64 allocations to wrap
        Self(NonZeroU64::new(raw).unwrap_or(NonZeroU64::MIN))
    }

    pub fn from_word(word: usize) -> Option<Self> {
        NonZeroU64::new(word as u64).map(Self)
    }

    pub fn to_word(self) -> usize {
        self.0.get() as usize
    }
}

/// A bridge object's managed side.
#[derive(Clone)]
pub enum HeldInstance {
    Live(ManagedRef),
    /// Placeholder for an instance that did not survive a reload
    Tombstone(TypeName),
}

impl HeldInstance {
    pub fn live(&self) -> BridgeResult<&ManagedRef> {
        match self {
            HeldInstance::Live(instance) => Ok(instance),
            HeldInstance::Tombstone(type_name) => Err(BridgeError::instance_tombstoned(type_name)),
        }
    }

    pub fn type_name(&self) -> TypeName {
        match self {
            HeldInstance::Live(instance) => instance.type_name(),
            HeldInstance::Tombstone(type_name) => type_name.clone(),
        }
    }

    pub fn instance_id(&self) -> Option<InstanceId> {
        match self {
            HeldInstance::Live(instance) => Some(InstanceId::of(instance)),
            HeldInstance::Tombstone(_) => None,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        matches!(self, HeldInstance::Tombstone(_))
    }
}

/// Which overloads a bound method dispatches to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "signature", rename_all = "snake_case")]
pub enum OverloadFilter {
    /// Any overload that binds the arguments
    #[default]
    Any,
    /// `__overloads__`: subscripting with parameter types selects one
    Mapper,
    /// Only the overload declaring these parameter type labels
    Signature(Vec<SmolStr>),
}

impl OverloadFilter {
    pub fn admits(&self, member: &Member) -> bool {
        match self {
            OverloadFilter::Any | OverloadFilter::Mapper => true,
            OverloadFilter::Signature(labels) => member.signature().as_deref() == Some(labels.as_slice()),
        }
    }
}

#[derive(Clone)]
pub enum BridgeTarget {
    Instance(HeldInstance),
    /// Callable bound to a receiver and a member name
    BoundMethod {
        receiver: HeldInstance,
        member: MaybeMember,
        overload: OverloadFilter,
    },
}

impl BridgeTarget {
    pub fn instance(&self) -> Option<&HeldInstance> {
        match self {
            BridgeTarget::Instance(held) => Some(held),
            BridgeTarget::BoundMethod { .. } => None,
        }
    }
}

pub struct BridgeEntry {
    pub address: usize,
    pub descriptor: Arc<TypeDescriptor>,
    pub target: BridgeTarget,
}

#[derive(Default)]
pub struct BridgeRegistry {
    entries: FxHashMap<HandleId, BridgeEntry>,
    by_address: FxHashMap<usize, HandleId>,
    /// (instance, projected type) -> the bridge object wrapping it
    identity: FxHashMap<(InstanceId, TypeName), HandleId>,
    creation_blocked: bool,
}

impl BridgeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a bridge object. Callers check [`BridgeRegistry::is_blocked`]
    /// first, under the same lock.
    pub fn insert(&mut self, address: usize, descriptor: Arc<TypeDescriptor>, target: BridgeTarget) -> HandleId {
        let handle = HandleId::next();
        if let BridgeTarget::Instance(HeldInstance::Live(instance)) = &target {
            self.identity
                .insert((InstanceId::of(instance), descriptor.name().clone()), handle);
        }
        self.by_address.insert(address, handle);
        self.entries.insert(
            handle,
            BridgeEntry {
                address,
                descriptor,
                target,
            },
        );
        handle
    }

    pub fn get(&self, handle: HandleId) -> Option<&BridgeEntry> {
        self.entries.get(&handle)
    }

    pub fn handle_at(&self, address: usize) -> Option<HandleId> {
        self.by_address.get(&address).copied()
    }

    /// Address of the live bridge object wrapping `instance` as `type_name`
    pub fn lookup_identity(&self, instance: &ManagedRef, type_name: &TypeName) -> Option<usize> {
        let handle = self
            .identity
            .get(&(InstanceId::of(instance), type_name.clone()))?;
        self.entries.get(handle).map(|entry| entry.address)
    }

    /// Handles of every bridge object targeting `instance`
    pub fn handles_for(&self, instance: &ManagedRef) -> Vec<HandleId> {
        let id = InstanceId::of(instance);
        let mut handles: Vec<HandleId> = self
            .entries
            .iter()
            .filter(|(_, entry)| match &entry.target {
                BridgeTarget::Instance(held) | BridgeTarget::BoundMethod { receiver: held, .. } => {
                    held.instance_id() == Some(id)
                }
            })
            .map(|(handle, _)| *handle)
            .collect();
        handles.sort_unstable();
        handles
    }

    /// Remove an entry. Repeat removals return `None`.
    pub fn remove(&mut self, handle: HandleId) -> Option<BridgeEntry> {
        let entry = self.entries.remove(&handle)?;
        if self.by_address.get(&entry.address) == Some(&handle) {
            self.by_address.remove(&entry.address);
        }
        if let BridgeTarget::Instance(HeldInstance::Live(instance)) = &entry.target {
            let key = (InstanceId::of(instance), entry.descriptor.name().clone());
            if self.identity.get(&key) == Some(&handle) {
                self.identity.remove(&key);
            }
        }
        Some(entry)
    }

    pub fn block_creation(&mut self) {
        self.creation_blocked = true;
    }

    pub fn is_blocked(&self) -> bool {
        self.creation_blocked
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Distinct live managed instances held by bridge objects
    pub fn live_instances(&self) -> usize {
        let mut ids: Vec<InstanceId> = self
            .entries
            .values()
            .filter_map(|entry| entry.target.instance().and_then(HeldInstance::instance_id))
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (HandleId, &BridgeEntry)> {
        self.entries.iter().map(|(handle, entry)| (*handle, entry))
    }

    /// Take every entry out, leaving the registry empty.
    pub fn drain(&mut self) -> Vec<BridgeEntry> {
        self.by_address.clear();
        self.identity.clear();
        self.entries.drain().map(|(_, entry)| entry).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::managed::ManagedObject;
    use crate::projection::{DescriptorKind, DescriptorState};
    use pretty_assertions::assert_eq;
    use pyclr_native::{AbiRevision, OwnedRef};
    use std::any::Any;

    struct Thing;

    impl ManagedObject for Thing {
        fn type_name(&self) -> TypeName {
            TypeName::parse("Demo.Thing")
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    /// A descriptor over fake type memory. Its type reference is moved out
    /// before drop so nothing is released through the native surface.
    fn descriptor(memory: &mut [usize; 4]) -> Arc<TypeDescriptor> {
        let ty = unsafe { OwnedRef::from_raw(memory.as_mut_ptr().cast()) }.unwrap();
        let descriptor = TypeDescriptor::new(
            TypeName::parse("Demo.Thing"),
            TypeName::parse("Demo.Thing"),
            DescriptorKind::Class,
            ty.into_managed(),
            32,
            24,
            AbiRevision::new(3, 10, false),
            DescriptorState::Tombstone {
                reason: "test".into(),
            },
        );
        if let Some(type_ref) = descriptor.take_type_ref() {
            let _ = type_ref.into_owned().into_raw();
        }
        Arc::new(descriptor)
    }

    #[test]
    fn test_handles_are_never_reused() {
        let a = HandleId::next();
        let b = HandleId::next();
        assert_ne!(a, b);
        assert_eq!(HandleId::from_word(a.to_word()), Some(a));
        assert_eq!(HandleId::from_word(0), None);
    }

    #[test]
    fn test_identity_lookup_and_removal() {
        let mut memory = [0usize; 4];
        let descriptor = descriptor(&mut memory);
        let instance: ManagedRef = Arc::new(Thing);
        let mut registry = BridgeRegistry::new();
        let handle = registry.insert(
            0x1000,
            Arc::clone(&descriptor),
            BridgeTarget::Instance(HeldInstance::Live(Arc::clone(&instance))),
        );
        assert_eq!(registry.lookup_identity(&instance, descriptor.name()), Some(0x1000));
        assert_eq!(registry.handle_at(0x1000), Some(handle));
        assert_eq!(registry.handles_for(&instance), vec![handle]);
        assert_eq!(registry.live_instances(), 1);

        assert!(registry.remove(handle).is_some());
        assert!(registry.remove(handle).is_none());
        assert_eq!(registry.lookup_identity(&instance, descriptor.name()), None);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_tombstones_are_not_identity_keyed() {
        let mut memory = [0usize; 4];
        let descriptor = descriptor(&mut memory);
        let mut registry = BridgeRegistry::new();
        registry.insert(
            0x2000,
            descriptor,
            BridgeTarget::Instance(HeldInstance::Tombstone(TypeName::parse("Demo.Thing"))),
        );
        assert_eq!(registry.live_instances(), 0);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.drain().len(), 1);
        assert_eq!(registry.handle_at(0x2000), None);
    }

    #[test]
    fn test_tombstone_instance_error() {
        let held = HeldInstance::Tombstone(TypeName::parse("Demo.Thing"));
        let err = held.live().err().unwrap();
        assert!(err.is_tombstone());
        assert_eq!(err.to_string(), "The managed instance of Demo.Thing no longer exists");
    }
}

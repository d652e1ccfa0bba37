//! Type Projection
//!
//! A managed type is projected into a native heap type object whose protocol
//! slots point at the bridge's adapters. The [`TypeDescriptor`] ties the two
//! together and is cached for the life of the attach.
//!
//! ## Module Structure
//!
//! - [`binding`]: which members are exposed
//! - [`slots`]: slot kinds and their member bindings
//! - `layout`: writing adapters into type-object memory
//! - `adapters`: the `extern "C"` slot functions and their dispatch

pub(crate) mod adapters;
pub mod binding;
pub(crate) mod layout;
pub mod slots;

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use pyclr_native::{AbiRevision, BorrowedRef, NativeObject, PyObject};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

use crate::error::{BridgeError, BridgeResult};
use crate::managed::{ManagedType, Member, TypeName};

pub use binding::{select_overload, BindingFilter, MemberTable};
pub use slots::{SlotBinding, SlotKind};

/// Bound members and slot bindings of a live managed type.
pub struct Projection {
    ty: Arc<ManagedType>,
    table: MemberTable,
    slots: FxHashMap<SlotKind, SlotBinding>,
}

impl Projection {
    pub fn build(ty: Arc<ManagedType>, filter: &BindingFilter) -> Self {
        let table = MemberTable::collect(&ty, filter);
        let slots = slots::bind_slots(&ty, &table);
        Self { ty, table, slots }
    }

    pub fn managed_type(&self) -> &Arc<ManagedType> {
        &self.ty
    }

    pub fn slot(&self, kind: SlotKind) -> Option<SlotBinding> {
        self.slots.get(&kind).copied()
    }

    /// Bound slot kinds in a stable order
    pub fn slot_kinds(&self) -> Vec<SlotKind> {
        SlotKind::all().filter(|kind| self.slots.contains_key(kind)).collect()
    }

    pub fn member(&self, index: usize) -> Option<&Member> {
        self.ty.members().get(index)
    }

    pub fn has_method(&self, name: &str) -> bool {
        self.table.methods.contains_key(name)
    }

    /// Overload candidates for a callable member
    pub fn method(&self, name: &str) -> Option<&[usize]> {
        self.table.methods.get(name).map(Vec::as_slice)
    }

    pub fn attribute(&self, name: &str) -> Option<&Member> {
        self.table.attributes.get(name).and_then(|index| self.member(*index))
    }

    pub fn constructor(&self, arity: usize) -> Option<&Member> {
        select_overload(&self.ty, &self.table.constructors, arity)
    }

    pub fn method_names(&self) -> impl Iterator<Item = &SmolStr> {
        self.table.methods.keys()
    }

    pub fn attribute_names(&self) -> impl Iterator<Item = &SmolStr> {
        self.table.attributes.keys()
    }
}

impl fmt::Debug for Projection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Projection")
            .field("type", self.ty.name())
            .field("slots", &self.slot_kinds())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DescriptorKind {
    /// Projection of a managed class
    Class,
    /// Callable bound to (receiver, member)
    MethodBinding,
}

pub enum DescriptorState {
    Projected(Arc<Projection>),
    /// Bridge-defined extension type with no managed counterpart
    Extension,
    Tombstone { reason: String },
}

/// A projected native type and the managed type behind it.
pub struct TypeDescriptor {
    name: TypeName,
    /// Managed type whose members the native type exposes
    managed_name: TypeName,
    kind: DescriptorKind,
    type_object: usize,
    /// The cache's reference to the type object
    type_ref: Mutex<Option<NativeObject>>,
    basicsize: usize,
    bridge_slot_offset: usize,
    revision: AbiRevision,
    state: RwLock<DescriptorState>,
}

impl TypeDescriptor {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        name: TypeName,
        managed_name: TypeName,
        kind: DescriptorKind,
        type_ref: NativeObject,
        basicsize: usize,
        bridge_slot_offset: usize,
        revision: AbiRevision,
        state: DescriptorState,
    ) -> Self {
        Self {
            name,
            managed_name,
            kind,
            type_object: type_ref.addr(),
            type_ref: Mutex::new(Some(type_ref)),
            basicsize,
            bridge_slot_offset,
            revision,
            state: RwLock::new(state),
        }
    }

    pub fn name(&self) -> &TypeName {
        &self.name
    }

    pub fn managed_name(&self) -> &TypeName {
        &self.managed_name
    }

    pub fn kind(&self) -> DescriptorKind {
        self.kind
    }

    /// Address of the native type object
    pub fn type_object(&self) -> usize {
        self.type_object
    }

    pub fn type_ptr(&self) -> *mut PyObject {
        self.type_object as *mut PyObject
    }

    pub(crate) fn type_borrowed(&self) -> BridgeResult<BorrowedRef<'_>> {
        if self.type_ref.lock().is_none() {
            return Err(BridgeError::type_tombstoned(&self.name));
        }
        // SAFETY: the descriptor holds a reference to the type object.
        Ok(unsafe { BorrowedRef::from_ptr(self.type_ptr()) }?)
    }

    pub fn basicsize(&self) -> usize {
        self.basicsize
    }

    /// Offset of the bridge handle word inside each instance
    pub fn bridge_slot_offset(&self) -> usize {
        self.bridge_slot_offset
    }

    pub fn revision(&self) -> AbiRevision {
        self.revision
    }

    /// The live projection, or the tombstone error.
    pub fn projection(&self) -> BridgeResult<Arc<Projection>> {
        match &*self.state.read() {
            DescriptorState::Projected(projection) => Ok(Arc::clone(projection)),
            DescriptorState::Tombstone { .. } => Err(BridgeError::type_tombstoned(&self.managed_name)),
            DescriptorState::Extension => Err(BridgeError::contract(format!(
                "`{}` is a bridge extension type with no managed members",
                self.name
            ))),
        }
    }

    pub fn is_tombstone(&self) -> bool {
        matches!(&*self.state.read(), DescriptorState::Tombstone { .. })
    }

    pub fn tombstone_reason(&self) -> Option<String> {
        match &*self.state.read() {
            DescriptorState::Tombstone { reason } => Some(reason.clone()),
            _ => None,
        }
    }

    /// Fails for a tombstone; live projections and extension types pass
    pub fn check_live(&self) -> BridgeResult<()> {
        match &*self.state.read() {
            DescriptorState::Tombstone { .. } => Err(BridgeError::type_tombstoned(&self.managed_name)),
            _ => Ok(()),
        }
    }

    pub fn is_sealed(&self) -> bool {
        match &*self.state.read() {
            DescriptorState::Projected(projection) => projection.managed_type().is_sealed(),
            _ => true,
        }
    }

    pub(crate) fn set_state(&self, state: DescriptorState) {
        *self.state.write() = state;
    }

    /// Hand the cache's type reference to the caller.
    pub(crate) fn take_type_ref(&self) -> Option<NativeObject> {
        self.type_ref.lock().take()
    }
}

impl fmt::Debug for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeDescriptor")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("type_object", &format_args!("{:#x}", self.type_object))
            .field("bridge_slot_offset", &self.bridge_slot_offset)
            .field("tombstone", &self.is_tombstone())
            .finish()
    }
}

#[derive(Default)]
struct CacheInner {
    by_name: IndexMap<TypeName, Arc<TypeDescriptor>>,
    by_address: FxHashMap<usize, Arc<TypeDescriptor>>,
}

/// Descriptors by projected name and by type-object address.
#[derive(Default)]
pub struct TypeCache {
    inner: RwLock<CacheInner>,
}

impl TypeCache {
    pub fn get(&self, name: &TypeName) -> Option<Arc<TypeDescriptor>> {
        self.inner.read().by_name.get(name).cloned()
    }

    pub fn by_address(&self, address: usize) -> Option<Arc<TypeDescriptor>> {
        self.inner.read().by_address.get(&address).cloned()
    }

    /// Insert unless the name is taken; returns the cached descriptor.
    pub(crate) fn insert(&self, descriptor: Arc<TypeDescriptor>) -> Arc<TypeDescriptor> {
        let mut inner = self.inner.write();
        if let Some(existing) = inner.by_name.get(descriptor.name()) {
            return Arc::clone(existing);
        }
        inner
            .by_address
            .insert(descriptor.type_object(), Arc::clone(&descriptor));
        inner
            .by_name
            .insert(descriptor.name().clone(), Arc::clone(&descriptor));
        descriptor
    }

    pub fn descriptors(&self) -> Vec<Arc<TypeDescriptor>> {
        self.inner.read().by_name.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn drain(&self) -> Vec<Arc<TypeDescriptor>> {
        let mut inner = self.inner.write();
        inner.by_address.clear();
        inner.by_name.drain(..).map(|(_, descriptor)| descriptor).collect()
    }
}

impl fmt::Debug for TypeCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeCache").field("len", &self.len()).finish()
    }
}

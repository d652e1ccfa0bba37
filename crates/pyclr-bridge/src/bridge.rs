//! Bridge objects: wrapping managed instances, resolving them back, and
//! releasing them when the native side lets go.

use std::sync::Arc;

use pyclr_native::ffi::{read_word, type_flags, write_word};
use pyclr_native::{gil, BorrowedRef, OwnedRef, PyObject};
use smol_str::SmolStr;
use tracing::trace;

use crate::convert::{dict_from_keywords, from_native, to_native, tuple_from_values};
use crate::engine::Engine;
use crate::error::{BridgeError, BridgeResult};
use crate::managed::{ManagedRef, TypeName, Value};
use crate::maybe::MaybeMember;
use crate::projection::{layout, TypeDescriptor};
use crate::registry::{BridgeTarget, HandleId, HeldInstance, OverloadFilter};
use crate::stash;

/// A non-owning reference to a bridge object.
///
/// Upgrading fails once the object is released or the engine detaches;
/// handles are not carried across a reload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WeakBridge {
    address: usize,
    handle: HandleId,
}

impl WeakBridge {
    pub fn handle(&self) -> HandleId {
        self.handle
    }

    /// A new reference, if the object is still registered with the attached engine.
    pub fn upgrade(&self) -> Option<OwnedRef> {
        Engine::try_current()?.upgrade(self)
    }
}

impl Engine {
    /// A bridge object for `instance`, projected as its own type.
    pub fn wrap(&self, instance: &ManagedRef) -> BridgeResult<OwnedRef> {
        let descriptor = self.project(&instance.type_name())?;
        self.wrap_as(instance, &descriptor)
    }

    /// A bridge object for `instance` as `descriptor`. With the identity cache
    /// on, wrapping the same instance twice yields the same native object.
    pub fn wrap_as(&self, instance: &ManagedRef, descriptor: &Arc<TypeDescriptor>) -> BridgeResult<OwnedRef> {
        gil::assert_held("wrap");
        descriptor.projection()?;
        {
            let registry = self.registry.lock();
            if registry.is_blocked() {
                return Err(BridgeError::shutting_down(format!("bridge objects of {}", descriptor.name())));
            }
            if self.config().identity_cache {
                if let Some(address) = registry.lookup_identity(instance, descriptor.name()) {
                    // SAFETY: registered objects stay alive until their dealloc
                    // removes them, which needs this lock.
                    let existing = unsafe { BorrowedRef::from_ptr(address as *mut PyObject) }?;
                    return Ok(existing.to_owned());
                }
            }
        }
        let object = self.native().generic_alloc(descriptor.type_borrowed()?)?;
        self.register(
            object,
            descriptor,
            BridgeTarget::Instance(HeldInstance::Live(Arc::clone(instance))),
        )
    }

    /// A callable bound to `receiver` and `member`.
    pub(crate) fn bind_method(
        &self,
        receiver: HeldInstance,
        member: MaybeMember,
        overload: OverloadFilter,
    ) -> BridgeResult<OwnedRef> {
        let descriptor = self.method_binding()?;
        let object = self.native().generic_alloc(descriptor.type_borrowed()?)?;
        self.register(
            object,
            &descriptor,
            BridgeTarget::BoundMethod {
                receiver,
                member,
                overload,
            },
        )
    }

    fn register(&self, object: OwnedRef, descriptor: &Arc<TypeDescriptor>, target: BridgeTarget) -> BridgeResult<OwnedRef> {
        let mut registry = self.registry.lock();
        if registry.is_blocked() {
            drop(registry);
            drop(target);
            // the slot is still empty so its dealloc only frees memory
            drop(object);
            return Err(BridgeError::shutting_down(format!("bridge objects of {}", descriptor.name())));
        }
        let handle = registry.insert(object.addr(), Arc::clone(descriptor), target);
        drop(registry);
        // SAFETY: `object` is a fresh instance of `descriptor`, sized to hold
        // the handle word at its slot offset.
        unsafe { write_word(object.as_ptr(), descriptor.bridge_slot_offset(), handle.to_word()) };
        trace!(addr = object.addr(), handle = handle.to_word(), "bridge object registered");
        Ok(object)
    }

    /// The descriptor and target behind a native object, or `None` when it
    /// is not a bridge object.
    pub(crate) fn bridge_target(
        &self,
        ob: BorrowedRef<'_>,
    ) -> BridgeResult<Option<(Arc<TypeDescriptor>, BridgeTarget)>> {
        let ty = self.native().type_of(ob);
        if layout::flags(self.offsets(), ty.as_ptr())? & type_flags::HAS_MANAGED_INSTANCE == 0 {
            return Ok(None);
        }
        let Some(descriptor) = self.types.by_address(ty.addr()) else {
            // projected by an engine that has since detached
            let type_name = TypeName::parse(&self.native().type_name(ty));
            return Err(BridgeError::type_tombstoned(&type_name));
        };
        // SAFETY: instances of projected types carry the handle word at the
        // descriptor's slot offset.
        let word = unsafe { read_word(ob.as_ptr(), descriptor.bridge_slot_offset()) };
        let target = HandleId::from_word(word).and_then(|handle| {
            let registry = self.registry.lock();
            registry
                .get(handle)
                .filter(|entry| entry.address == ob.addr())
                .map(|entry| entry.target.clone())
        });
        match target {
            Some(target) => Ok(Some((descriptor, target))),
            None => Err(BridgeError::instance_tombstoned(descriptor.managed_name())),
        }
    }

    pub(crate) fn resolve_bridge(&self, ob: BorrowedRef<'_>) -> BridgeResult<(Arc<TypeDescriptor>, BridgeTarget)> {
        self.bridge_target(ob)?
            .ok_or_else(|| BridgeError::contract(format!("object at {:#x} is not a bridge object", ob.addr())))
    }

    pub fn is_bridge(&self, ob: BorrowedRef<'_>) -> bool {
        matches!(self.bridge_target(ob), Ok(Some(_)))
    }

    /// The managed instance behind a bridge object. Non-bridge objects and
    /// bound methods give `None`; tombstones give their error.
    pub fn unwrap(&self, ob: BorrowedRef<'_>) -> BridgeResult<Option<ManagedRef>> {
        gil::assert_held("unwrap");
        match self.bridge_target(ob)? {
            Some((_, BridgeTarget::Instance(held))) => Ok(Some(Arc::clone(held.live()?))),
            _ => Ok(None),
        }
    }

    /// Deallocation of a bridge object: unregister it, free the native
    /// memory, and only then drop the managed target.
    pub(crate) fn finalize(&self, ob: *mut PyObject) {
        // SAFETY: called from the deallocation slot with a live object.
        let Ok(object) = (unsafe { BorrowedRef::from_ptr(ob) }) else {
            return;
        };
        let ty = self.native().type_of(object).as_ptr();
        let removed = self.types.by_address(ty as usize).and_then(|descriptor| {
            let offset = descriptor.bridge_slot_offset();
            // SAFETY: instances of a cached descriptor own the word at `offset`.
            let word = unsafe { read_word(ob, offset) };
            unsafe { write_word(ob, offset, 0) };
            let handle = HandleId::from_word(word)?;
            let mut registry = self.registry.lock();
            if registry.is_blocked() {
                stash::note_detached_free(ob as usize);
            }
            registry.remove(handle)
        });
        // SAFETY: `ob` is being deallocated and is not touched again.
        unsafe { self.native().object_free(ob) };
        // SAFETY: every instance owns one reference to its type.
        drop(unsafe { OwnedRef::from_raw(ty) });
        if let Some(entry) = &removed {
            trace!(addr = entry.address, "bridge object released");
        }
        drop(removed);
    }

    /// A weak reference to a registered bridge object.
    pub fn downgrade(&self, ob: BorrowedRef<'_>) -> BridgeResult<WeakBridge> {
        self.resolve_bridge(ob)?;
        let handle = self
            .registry
            .lock()
            .handle_at(ob.addr())
            .ok_or_else(|| BridgeError::contract("bridge object lost its registration"))?;
        Ok(WeakBridge {
            address: ob.addr(),
            handle,
        })
    }

    pub fn upgrade(&self, weak: &WeakBridge) -> Option<OwnedRef> {
        gil::assert_held("upgrade");
        let registry = self.registry.lock();
        let entry = registry.get(weak.handle)?;
        if entry.address != weak.address {
            return None;
        }
        // SAFETY: a registered address is a live object.
        let object = unsafe { BorrowedRef::from_ptr(entry.address as *mut PyObject) }.ok()?;
        Some(object.to_owned())
    }

    /// Construct a managed instance through a public constructor and wrap it.
    pub fn construct(&self, type_name: &TypeName, args: &[Value]) -> BridgeResult<OwnedRef> {
        let descriptor = self.project(type_name)?;
        let projection = descriptor.projection()?;
        let ctor = projection.constructor(args.len()).ok_or_else(|| {
            BridgeError::not_supported(type_name, format!("construction with {} arguments", args.len()))
        })?;
        match ctor.invoke(None, args)? {
            Value::Object(instance) => self.wrap_as(&instance, &descriptor),
            other => to_native(self, &other),
        }
    }

    /// Call a native callable with managed arguments.
    pub fn call_native(&self, callable: BorrowedRef<'_>, args: &[Value]) -> BridgeResult<Value> {
        gil::assert_held("call_native");
        let tuple = tuple_from_values(self, args)?;
        let result = self.native().object_call(callable, tuple.borrow())?;
        from_native(self, result.borrow())
    }

    /// Call a native callable with positional and keyword arguments.
    pub fn call_native_kw(
        &self,
        callable: BorrowedRef<'_>,
        args: &[Value],
        keywords: &[(SmolStr, Value)],
    ) -> BridgeResult<Value> {
        gil::assert_held("call_native_kw");
        let tuple = tuple_from_values(self, args)?;
        let kwargs = dict_from_keywords(self, keywords)?;
        let result = self
            .native()
            .object_call_kw(callable, tuple.borrow(), Some(kwargs.borrow()))?;
        from_native(self, result.borrow())
    }

    /// Read an attribute of a native object as a managed value.
    pub fn get_native_attr(&self, ob: BorrowedRef<'_>, name: &str) -> BridgeResult<Value> {
        gil::assert_held("get_native_attr");
        let attr = self.native().object_get_attr(ob, name)?;
        from_native(self, attr.borrow())
    }
}

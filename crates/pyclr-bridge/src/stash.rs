//! Stash and restore of the bridge graph across a managed reload.
//!
//! On [`ShutdownMode::Reload`](crate::ShutdownMode) the engine serializes its
//! descriptors, live bridge objects and extension state into a blob parked
//! in the interpreter's `sys` module. The next attach reads the blob once,
//! re-adopts the projected type objects, and re-registers every bridge object
//! at its old address. Instances whose type or payload did not survive come
//! back as tombstones.
//!
//! Blob layout: `b"PCLR"`, format version (u32 LE), JSON body. In native
//! memory the blob is prefixed with its length (u64 LE) and referenced from a
//! capsule.

use std::ffi::c_void;
use std::sync::Arc;

use parking_lot::{const_mutex, Mutex};
use pyclr_native::ffi::write_word;
use pyclr_native::{gil, AbiRevision, NativeApi, OwnedRef, PyObject};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use tracing::{debug, info, instrument, warn};

use crate::engine::Engine;
use crate::error::{BridgeError, BridgeResult};
use crate::generics::GenericRegistry;
use crate::managed::{InstanceId, TypeName};
use crate::maybe::{MaybeMember, MemberRef};
use crate::projection::{layout, DescriptorKind, DescriptorState, Projection, SlotKind, TypeDescriptor};
use crate::registry::{BridgeTarget, HeldInstance, OverloadFilter};

const MAGIC: [u8; 4] = *b"PCLR";

/// Version of the blob body. Bumped on any incompatible record change.
pub const FORMAT_VERSION: u32 = 1;

const LENGTH_PREFIX: usize = 8;

/// Bridge objects freed while no engine was attached. Their recorded
/// addresses may be reused and must not be re-registered.
static DETACHED_FREES: Mutex<Option<FxHashSet<usize>>> = const_mutex(None);

pub(crate) fn note_detached_free(address: usize) {
    DETACHED_FREES
        .lock()
        .get_or_insert_with(FxHashSet::default)
        .insert(address);
}

fn take_detached_frees() -> FxHashSet<usize> {
    DETACHED_FREES.lock().take().unwrap_or_default()
}

// ============================================================================
// Records
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct DescriptorRecord {
    name: TypeName,
    managed_name: TypeName,
    kind: DescriptorKind,
    type_object: usize,
    basicsize: usize,
    bridge_slot_offset: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct InstanceRecord {
    id: u32,
    type_name: TypeName,
    /// `None` for instances that cannot be serialized
    payload: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum TargetRecord {
    Instance {
        instance: Option<u32>,
        type_name: TypeName,
    },
    BoundMethod {
        receiver: Option<u32>,
        receiver_type: TypeName,
        member: MemberRef,
        #[serde(default)]
        overload: OverloadFilter,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct ObjectRecord {
    address: usize,
    descriptor: TypeName,
    target: TargetRecord,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct StashSnapshot {
    revision: AbiRevision,
    descriptors: Vec<DescriptorRecord>,
    instances: Vec<InstanceRecord>,
    objects: Vec<ObjectRecord>,
    generics: GenericRegistry,
    namespaces: Vec<SmolStr>,
}

/// What a reload stash recorded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StashStats {
    pub descriptors: usize,
    pub objects: usize,
    pub instances: usize,
    /// Instances recorded without a payload
    pub placeholders: usize,
    pub bytes: usize,
}

/// What a restore brought back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreStats {
    pub descriptors: usize,
    pub tombstoned_types: usize,
    pub objects: usize,
    pub tombstoned_instances: usize,
    pub tombstoned_members: usize,
    /// Recorded objects freed while detached
    pub dropped_objects: usize,
    pub namespaces: usize,
}

fn encode(snapshot: &StashSnapshot) -> BridgeResult<Vec<u8>> {
    let mut bytes = Vec::with_capacity(1024);
    bytes.extend_from_slice(&MAGIC);
    bytes.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    serde_json::to_writer(&mut bytes, snapshot)?;
    Ok(bytes)
}

fn decode(bytes: &[u8]) -> BridgeResult<StashSnapshot> {
    if bytes.len() < 8 || bytes[..4] != MAGIC {
        return Err(BridgeError::stash("blob is not a bridge stash"));
    }
    let mut version = [0u8; 4];
    version.copy_from_slice(&bytes[4..8]);
    let version = u32::from_le_bytes(version);
    if version != FORMAT_VERSION {
        return Err(BridgeError::stash(format!(
            "stash format {version} is not supported (expected {FORMAT_VERSION})"
        )));
    }
    Ok(serde_json::from_slice(&bytes[8..])?)
}

// ============================================================================
// Blob storage
// ============================================================================

fn write_blob(native: &dyn NativeApi, slot: &str, bytes: &[u8]) -> BridgeResult<()> {
    let block = native
        .mem_malloc(LENGTH_PREFIX + bytes.len())
        .ok_or_else(|| BridgeError::stash(format!("could not allocate {} bytes", bytes.len())))?;
    // SAFETY: the block was just allocated with room for the prefix and body.
    unsafe {
        std::ptr::copy_nonoverlapping(
            (bytes.len() as u64).to_le_bytes().as_ptr(),
            block.as_ptr(),
            LENGTH_PREFIX,
        );
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), block.as_ptr().add(LENGTH_PREFIX), bytes.len());
    }
    let capsule = match native.capsule_new(block.cast::<c_void>()) {
        Ok(capsule) => capsule,
        Err(err) => {
            // SAFETY: the block is not referenced anywhere else.
            unsafe { native.mem_free(block) };
            return Err(err.into());
        }
    };
    native.sys_set_object(slot, Some(capsule.borrow()))?;
    Ok(())
}

/// Copy the blob out of native memory, if one is parked under `slot`.
fn read_blob(native: &dyn NativeApi, slot: &str) -> BridgeResult<Option<Vec<u8>>> {
    let Some(capsule) = native.sys_get_object(slot) else {
        return Ok(None);
    };
    if native.builtin_kind(capsule) == Some(pyclr_native::BuiltinKind::None) {
        return Ok(None);
    }
    let block = native.capsule_get_pointer(capsule)?.cast::<u8>();
    let mut prefix = [0u8; LENGTH_PREFIX];
    // SAFETY: blocks written by `write_blob` start with the body length.
    unsafe { std::ptr::copy_nonoverlapping(block.as_ptr(), prefix.as_mut_ptr(), LENGTH_PREFIX) };
    let len = u64::from_le_bytes(prefix) as usize;
    let mut bytes = vec![0u8; len];
    // SAFETY: the body follows the prefix and is `len` bytes long.
    unsafe { std::ptr::copy_nonoverlapping(block.as_ptr().add(LENGTH_PREFIX), bytes.as_mut_ptr(), len) };
    Ok(Some(bytes))
}

/// Free the parked blob and clear the `sys` attribute.
fn clear_blob(native: &dyn NativeApi, slot: &str) -> BridgeResult<bool> {
    let block = match native.sys_get_object(slot) {
        Some(capsule) if native.builtin_kind(capsule) != Some(pyclr_native::BuiltinKind::None) => {
            Some(native.capsule_get_pointer(capsule)?.cast::<u8>())
        }
        _ => None,
    };
    let Some(block) = block else {
        return Ok(false);
    };
    native.sys_set_object(slot, None)?;
    // SAFETY: the block came from `mem_malloc` and only the capsule pointed at it.
    unsafe { native.mem_free(block) };
    Ok(true)
}

/// Whether a stash is waiting under `slot`.
pub fn has_stash(native: &dyn NativeApi, slot: &str) -> bool {
    matches!(read_blob(native, slot), Ok(Some(_)))
}

/// Drop a parked stash without restoring it.
pub(crate) fn discard(native: &dyn NativeApi, slot: &str) -> BridgeResult<bool> {
    clear_blob(native, slot)
}

// ============================================================================
// Stash
// ============================================================================

#[instrument(skip_all)]
pub(crate) fn stash(engine: &Engine) -> BridgeResult<StashStats> {
    gil::assert_held("stash");
    take_detached_frees();

    let descriptors = engine.types().descriptors();
    let descriptor_records: Vec<DescriptorRecord> = descriptors
        .iter()
        .map(|descriptor| DescriptorRecord {
            name: descriptor.name().clone(),
            managed_name: descriptor.managed_name().clone(),
            kind: descriptor.kind(),
            type_object: descriptor.type_object(),
            basicsize: descriptor.basicsize(),
            bridge_slot_offset: descriptor.bridge_slot_offset(),
        })
        .collect();

    // clone targets out so no managed code runs under the registry lock
    let entries: Vec<(usize, TypeName, BridgeTarget)> = engine
        .registry
        .lock()
        .iter()
        .map(|(_, entry)| (entry.address, entry.descriptor.name().clone(), entry.target.clone()))
        .collect();

    let mut ids: FxHashMap<InstanceId, u32> = FxHashMap::default();
    let mut instances = Vec::new();
    let mut placeholders = 0;
    let mut intern = |held: &HeldInstance| -> Option<u32> {
        let HeldInstance::Live(instance) = held else {
            return None;
        };
        let key = InstanceId::of(instance);
        if let Some(id) = ids.get(&key) {
            return Some(*id);
        }
        let id = instances.len() as u32;
        let payload = instance.snapshot();
        if payload.is_none() {
            placeholders += 1;
        }
        instances.push(InstanceRecord {
            id,
            type_name: instance.type_name(),
            payload,
        });
        ids.insert(key, id);
        Some(id)
    };

    let mut objects = Vec::with_capacity(entries.len());
    for (address, descriptor, target) in &entries {
        let target = match target {
            BridgeTarget::Instance(held) => TargetRecord::Instance {
                instance: intern(held),
                type_name: held.type_name(),
            },
            BridgeTarget::BoundMethod {
                receiver,
                member,
                overload,
            } => TargetRecord::BoundMethod {
                receiver: intern(receiver),
                receiver_type: receiver.type_name(),
                member: member.reference().clone(),
                overload: overload.clone(),
            },
        };
        objects.push(ObjectRecord {
            address: *address,
            descriptor: descriptor.clone(),
            target,
        });
    }
    objects.sort_by_key(|object| object.address);

    let snapshot = StashSnapshot {
        revision: engine.offsets().revision(),
        descriptors: descriptor_records,
        instances,
        objects,
        generics: engine.generics.read().clone(),
        namespaces: engine.imports.lock().namespaces(),
    };
    let bytes = encode(&snapshot)?;
    write_blob(engine.native().as_ref(), &engine.config().stash_slot, &bytes)?;

    for descriptor in &descriptors {
        if let Some(type_ref) = descriptor.take_type_ref() {
            // the blob owns this reference until restore adopts it
            let _ = type_ref.into_owned().into_raw();
        }
    }
    drop(entries);

    let stats = StashStats {
        descriptors: snapshot.descriptors.len(),
        objects: snapshot.objects.len(),
        instances: snapshot.instances.len(),
        placeholders,
        bytes: bytes.len(),
    };
    info!(
        descriptors = stats.descriptors,
        objects = stats.objects,
        instances = stats.instances,
        placeholders = stats.placeholders,
        bytes = stats.bytes,
        "bridge graph stashed"
    );
    Ok(stats)
}

// ============================================================================
// Restore
// ============================================================================

#[instrument(skip_all)]
pub(crate) fn restore(engine: &Engine) -> BridgeResult<Option<RestoreStats>> {
    gil::assert_held("restore");
    let native = engine.native().as_ref();
    let slot = engine.config().stash_slot.as_str();
    let Some(bytes) = read_blob(native, slot)? else {
        return Ok(None);
    };
    clear_blob(native, slot)?;
    let snapshot = decode(&bytes)?;
    let revision = engine.offsets().revision();
    if snapshot.revision != revision {
        return Err(BridgeError::stash(format!(
            "stash was written for ABI {} but the interpreter is {}",
            snapshot.revision, revision
        )));
    }

    let freed = take_detached_frees();
    let domain = engine.domain().as_ref();
    let filter = engine.filter();
    let mut stats = RestoreStats::default();

    for record in snapshot.descriptors {
        // SAFETY: the stash owns one reference to each recorded type object.
        let type_ref = unsafe { OwnedRef::from_raw(record.type_object as *mut PyObject) }
            .ok_or_else(|| BridgeError::stash(format!("null type object for {}", record.name)))?
            .into_managed();
        let (state, kinds, sealed) = match record.kind {
            DescriptorKind::MethodBinding => {
                (DescriptorState::Extension, SlotKind::METHOD_BINDING.to_vec(), true)
            }
            DescriptorKind::Class => match domain.resolve(&record.managed_name) {
                Some(ty) => {
                    let projection = Projection::build(ty, filter);
                    let kinds = projection.slot_kinds();
                    let sealed = record.name == record.managed_name && projection.managed_type().is_sealed();
                    (DescriptorState::Projected(Arc::new(projection)), kinds, sealed)
                }
                None => {
                    warn!(type_name = %record.managed_name, "managed type did not survive the reload");
                    stats.tombstoned_types += 1;
                    let reason = format!("{} was not found after reload", record.managed_name);
                    (DescriptorState::Tombstone { reason }, SlotKind::all().collect(), true)
                }
            },
        };
        layout::bind_slots(engine.offsets(), type_ref.borrow().as_ptr(), &kinds, sealed)?;
        let descriptor = TypeDescriptor::new(
            record.name,
            record.managed_name,
            record.kind,
            type_ref,
            record.basicsize,
            record.bridge_slot_offset,
            revision,
            state,
        );
        engine.types().insert(Arc::new(descriptor));
        stats.descriptors += 1;
    }

    let mut revived: FxHashMap<u32, HeldInstance> = FxHashMap::default();
    for record in snapshot.instances {
        let instance = record
            .payload
            .as_ref()
            .and_then(|payload| domain.restore_instance(&record.type_name, payload));
        let held = match instance {
            Some(instance) => HeldInstance::Live(instance),
            None => {
                stats.tombstoned_instances += 1;
                HeldInstance::Tombstone(record.type_name)
            }
        };
        revived.insert(record.id, held);
    }
    let held_for = |id: Option<u32>, type_name: TypeName| {
        id.and_then(|id| revived.get(&id).cloned())
            .unwrap_or(HeldInstance::Tombstone(type_name))
    };

    for record in snapshot.objects {
        if freed.contains(&record.address) {
            stats.dropped_objects += 1;
            continue;
        }
        let descriptor = engine.types().get(&record.descriptor).ok_or_else(|| {
            BridgeError::stash(format!(
                "object at {:#x} names unknown descriptor {}",
                record.address, record.descriptor
            ))
        })?;
        let target = match record.target {
            TargetRecord::Instance { instance, type_name } => BridgeTarget::Instance(held_for(instance, type_name)),
            TargetRecord::BoundMethod {
                receiver,
                receiver_type,
                member,
                overload,
            } => {
                let member = MaybeMember::resolve(domain, member, filter);
                if !member.is_valid() {
                    stats.tombstoned_members += 1;
                }
                BridgeTarget::BoundMethod {
                    receiver: held_for(receiver, receiver_type),
                    member,
                    overload,
                }
            }
        };
        let handle = engine
            .registry
            .lock()
            .insert(record.address, Arc::clone(&descriptor), target);
        // SAFETY: the object survived the reload at its recorded address and
        // is an instance of `descriptor`.
        unsafe {
            write_word(
                record.address as *mut PyObject,
                descriptor.bridge_slot_offset(),
                handle.to_word(),
            )
        };
        stats.objects += 1;
    }
    drop(revived);

    {
        let mut generics = engine.generics.write();
        for name in snapshot.generics.names() {
            if domain.resolve(&name).is_some() {
                generics.register(&name);
            } else {
                debug!(%name, "generic name dropped after reload");
            }
        }
    }
    let available = domain.namespaces();
    let mut imports = engine.imports.lock();
    for namespace in snapshot.namespaces {
        if available.contains(&namespace) {
            imports.record(&namespace);
            stats.namespaces += 1;
        } else {
            warn!(%namespace, "imported namespace did not survive the reload");
        }
    }
    drop(imports);

    info!(
        descriptors = stats.descriptors,
        objects = stats.objects,
        tombstoned_types = stats.tombstoned_types,
        tombstoned_instances = stats.tombstoned_instances,
        tombstoned_members = stats.tombstoned_members,
        dropped = stats.dropped_objects,
        "bridge graph restored"
    );
    Ok(Some(stats))
}

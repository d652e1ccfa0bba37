//! Writing adapters into native type-object memory.

use pyclr_native::abi::SlotGroup;
use pyclr_native::ffi::{read_word, type_flags, write_word};
use pyclr_native::{PyObject, SlotLocation, TypeOffsets};

use crate::error::{BridgeError, BridgeResult};
use crate::projection::adapters;
use crate::projection::slots::SlotKind;

/// Point every `tp_as_*` field at its sub-table inside the type object.
pub(crate) fn install_sub_tables(offsets: &TypeOffsets, ty: *mut PyObject) -> BridgeResult<()> {
    for group in SlotGroup::ALL {
        let table = offsets.offset(group.table_slot)?;
        let first = offsets.offset(group.first_slot)?;
        // SAFETY: `ty` is a heap type object of `offsets.heap_type_size()` bytes.
        unsafe { write_word(ty, table, ty as usize + first) };
    }
    Ok(())
}

fn write_slot(offsets: &TypeOffsets, ty: *mut PyObject, kind: SlotKind, value: usize) -> BridgeResult<()> {
    match offsets.locate(kind.slot_name())? {
        // SAFETY: offsets come from the table for this type object's revision.
        SlotLocation::Direct(offset) => unsafe { write_word(ty, offset, value) },
        SlotLocation::Indirect {
            table_offset,
            relative,
        } => {
            // SAFETY: as above; the sub-table pointer was installed at synthesis.
            let table = unsafe { read_word(ty, table_offset) };
            if table == 0 {
                return Err(BridgeError::contract(format!(
                    "sub-table for `{}` is not installed",
                    kind.slot_name()
                )));
            }
            unsafe { write_word(table as *mut PyObject, relative, value) };
        }
    }
    Ok(())
}

/// Install adapters for `kinds`, clear every other bridge slot, and set the
/// type flags. Used both at synthesis and when rebinding a surviving type
/// object after a reload.
pub(crate) fn bind_slots(offsets: &TypeOffsets, ty: *mut PyObject, kinds: &[SlotKind], sealed: bool) -> BridgeResult<()> {
    for kind in SlotKind::all() {
        let value = if kinds.contains(&kind) {
            adapters::address_of(kind)
        } else {
            0
        };
        write_slot(offsets, ty, kind, value)?;
    }
    let flags_offset = offsets.offset("tp_flags")?;
    // SAFETY: tp_flags lies inside the type object.
    let mut flags = unsafe { read_word(ty, flags_offset) };
    flags |= type_flags::HEAP_TYPE | type_flags::HAS_MANAGED_INSTANCE;
    if kinds.contains(&SlotKind::Traverse) {
        flags |= type_flags::HAVE_GC;
    } else {
        flags &= !type_flags::HAVE_GC;
    }
    if sealed {
        flags &= !type_flags::BASE_TYPE;
    } else {
        flags |= type_flags::BASE_TYPE;
    }
    unsafe { write_word(ty, flags_offset, flags) };
    Ok(())
}

pub(crate) fn set_base(offsets: &TypeOffsets, ty: *mut PyObject, base: *mut PyObject) -> BridgeResult<()> {
    let offset = offsets.offset("tp_base")?;
    // SAFETY: tp_base lies inside the type object.
    unsafe { write_word(ty, offset, base as usize) };
    Ok(())
}

pub(crate) fn flags(offsets: &TypeOffsets, ty: *mut PyObject) -> BridgeResult<usize> {
    let offset = offsets.offset("tp_flags")?;
    // SAFETY: tp_flags lies inside the type object.
    Ok(unsafe { read_word(ty, offset) })
}

/// Adapter currently installed for `kind`, 0 when unbound
pub(crate) fn installed(offsets: &TypeOffsets, ty: *mut PyObject, kind: SlotKind) -> BridgeResult<usize> {
    Ok(match offsets.locate(kind.slot_name())? {
        SlotLocation::Direct(offset) => unsafe { read_word(ty, offset) },
        SlotLocation::Indirect {
            table_offset,
            relative,
        } => {
            let table = unsafe { read_word(ty, table_offset) };
            if table == 0 {
                0
            } else {
                unsafe { read_word(table as *mut PyObject, relative) }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pyclr_native::AbiRevision;
    use pyclr_native::NumberOp;

    fn with_type_memory<R>(f: impl FnOnce(&TypeOffsets, *mut PyObject) -> R) -> R {
        let offsets = TypeOffsets::compute(AbiRevision::new(3, 10, false), std::mem::size_of::<usize>()).unwrap();
        let mut memory = vec![0usize; offsets.heap_type_size() / std::mem::size_of::<usize>()];
        let ty = memory.as_mut_ptr().cast::<PyObject>();
        f(&offsets, ty)
    }

    #[test]
    fn test_bind_writes_direct_and_indirect_slots() {
        with_type_memory(|offsets, ty| {
            install_sub_tables(offsets, ty).unwrap();
            let kinds = [SlotKind::Repr, SlotKind::Number(NumberOp::Add), SlotKind::Length];
            bind_slots(offsets, ty, &kinds, false).unwrap();
            for kind in kinds {
                assert_eq!(installed(offsets, ty, kind).unwrap(), adapters::address_of(kind));
            }
            assert_eq!(installed(offsets, ty, SlotKind::Hash).unwrap(), 0);
            let nb_add = offsets.offset("nb_add").unwrap();
            assert_eq!(unsafe { read_word(ty, nb_add) }, adapters::address_of(SlotKind::Number(NumberOp::Add)));
        });
    }

    #[test]
    fn test_sealed_types_are_not_base_types() {
        with_type_memory(|offsets, ty| {
            install_sub_tables(offsets, ty).unwrap();
            bind_slots(offsets, ty, &[SlotKind::Dealloc], true).unwrap();
            let sealed = flags(offsets, ty).unwrap();
            assert_eq!(sealed & type_flags::BASE_TYPE, 0);
            assert_ne!(sealed & type_flags::HAS_MANAGED_INSTANCE, 0);

            bind_slots(offsets, ty, &[SlotKind::Dealloc], false).unwrap();
            assert_ne!(flags(offsets, ty).unwrap() & type_flags::BASE_TYPE, 0);
        });
    }

    #[test]
    fn test_rebind_clears_dropped_slots() {
        with_type_memory(|offsets, ty| {
            install_sub_tables(offsets, ty).unwrap();
            bind_slots(offsets, ty, &[SlotKind::Call, SlotKind::Traverse], false).unwrap();
            assert_ne!(flags(offsets, ty).unwrap() & type_flags::HAVE_GC, 0);
            bind_slots(offsets, ty, &[SlotKind::Dealloc], false).unwrap();
            assert_eq!(installed(offsets, ty, SlotKind::Call).unwrap(), 0);
            assert_eq!(flags(offsets, ty).unwrap() & type_flags::HAVE_GC, 0);
        });
    }

    #[test]
    fn test_missing_sub_table_is_reported() {
        with_type_memory(|offsets, ty| {
            let err = bind_slots(offsets, ty, &[SlotKind::Length], false).unwrap_err();
            assert!(err.is_contract_violation());
        });
    }
}

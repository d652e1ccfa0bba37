//! ABI resolution.
//!
//! Interpreter builds disagree on the layout of the heap type object: slots
//! are added, renamed and removed between minor versions, and debug builds
//! (`Py_TRACE_REFS`) prepend two list pointers to every object header. The
//! offsets the bridge writes through are therefore taken from a table chosen
//! by the running interpreter's version and build flags.
//!
//! Every field is treated as one machine word, so a slot's offset is its
//! index in the table times the pointer size. A running interpreter with no
//! table is a fatal error; writing through a guessed layout corrupts memory.

use std::fmt;
use std::sync::OnceLock;

use indexmap::IndexMap;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::api::NativeApi;
use crate::error::{NativeError, NativeResult};

// ============================================================================
// Versions
// ============================================================================

/// Interpreter version, as reported by `Py_GetVersion`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PythonVersion {
    pub major: u8,
    pub minor: u8,
    pub micro: u8,
}

impl PythonVersion {
    pub fn new(major: u8, minor: u8, micro: u8) -> Self {
        Self { major, minor, micro }
    }

    /// Parse the leading `major.minor[.micro]` of a version banner such as
    /// `"3.8.10 (default, May  3 2021, 08:55:58) [GCC 9.4.0]"`.
    pub fn parse(version: &str) -> NativeResult<Self> {
        let head = version.split_whitespace().next().unwrap_or_default();
        let mut parts = head.split('.');
        let major = parts.next().and_then(leading_number);
        let minor = parts.next().and_then(leading_number);
        match (major, minor) {
            (Some(major), Some(minor)) => {
                let micro = parts.next().and_then(leading_number).unwrap_or(0);
                Ok(Self { major, minor, micro })
            }
            _ => Err(NativeError::invalid_version(version)),
        }
    }
}

fn leading_number(component: &str) -> Option<u8> {
    let end = component
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(component.len());
    component[..end].parse().ok()
}

impl fmt::Display for PythonVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.micro)
    }
}

/// The layout-relevant identity of an interpreter build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AbiRevision {
    pub major: u8,
    pub minor: u8,
    /// `Py_TRACE_REFS` build: two extra header words per object
    pub debug: bool,
}

impl AbiRevision {
    pub fn new(major: u8, minor: u8, debug: bool) -> Self {
        Self { major, minor, debug }
    }

    pub fn from_version(version: PythonVersion, abi_flags: &str) -> Self {
        Self {
            major: version.major,
            minor: version.minor,
            debug: abi_flags.contains('d'),
        }
    }

    /// Ask the running interpreter.
    pub fn detect(native: &dyn NativeApi) -> NativeResult<Self> {
        let version = PythonVersion::parse(&native.version())?;
        Ok(Self::from_version(version, &native.abi_flags()))
    }
}

impl fmt::Display for AbiRevision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)?;
        if self.debug {
            write!(f, "d")?;
        }
        Ok(())
    }
}

// ============================================================================
// Slot tables
// ============================================================================

const TRACE_REFS_HEADER: &[&str] = &["_ob_next", "_ob_prev"];

const TYPE_HEAD: &[&str] = &[
    "ob_refcnt",
    "ob_type",
    "ob_size",
    "tp_name",
    "tp_basicsize",
    "tp_itemsize",
    "tp_dealloc",
];

const TYPE_BODY: &[&str] = &[
    "tp_getattr",
    "tp_setattr",
    "tp_as_async",
    "tp_repr",
    "tp_as_number",
    "tp_as_sequence",
    "tp_as_mapping",
    "tp_hash",
    "tp_call",
    "tp_str",
    "tp_getattro",
    "tp_setattro",
    "tp_as_buffer",
    "tp_flags",
    "tp_doc",
    "tp_traverse",
    "tp_clear",
    "tp_richcompare",
    "tp_weaklistoffset",
    "tp_iter",
    "tp_iternext",
    "tp_methods",
    "tp_members",
    "tp_getset",
    "tp_base",
    "tp_dict",
    "tp_descr_get",
    "tp_descr_set",
    "tp_dictoffset",
    "tp_init",
    "tp_alloc",
    "tp_new",
    "tp_free",
    "tp_is_gc",
    "tp_bases",
    "tp_mro",
    "tp_cache",
    "tp_subclasses",
    "tp_weaklist",
    "tp_del",
    "tp_version_tag",
    "tp_finalize",
];

const ASYNC_METHODS: &[&str] = &["am_await", "am_aiter", "am_anext"];

const NUMBER_METHODS: &[&str] = &[
    "nb_add",
    "nb_subtract",
    "nb_multiply",
    "nb_remainder",
    "nb_divmod",
    "nb_power",
    "nb_negative",
    "nb_positive",
    "nb_absolute",
    "nb_bool",
    "nb_invert",
    "nb_lshift",
    "nb_rshift",
    "nb_and",
    "nb_xor",
    "nb_or",
    "nb_int",
    "nb_reserved",
    "nb_float",
    "nb_inplace_add",
    "nb_inplace_subtract",
    "nb_inplace_multiply",
    "nb_inplace_remainder",
    "nb_inplace_power",
    "nb_inplace_lshift",
    "nb_inplace_rshift",
    "nb_inplace_and",
    "nb_inplace_xor",
    "nb_inplace_or",
    "nb_floor_divide",
    "nb_true_divide",
    "nb_inplace_floor_divide",
    "nb_inplace_true_divide",
    "nb_index",
    "nb_matrix_multiply",
    "nb_inplace_matrix_multiply",
];

const MAPPING_METHODS: &[&str] = &["mp_length", "mp_subscript", "mp_ass_subscript"];

const SEQUENCE_METHODS: &[&str] = &[
    "sq_length",
    "sq_concat",
    "sq_repeat",
    "sq_item",
    "was_sq_slice",
    "sq_ass_item",
    "was_sq_ass_slice",
    "sq_contains",
    "sq_inplace_concat",
    "sq_inplace_repeat",
];

const BUFFER_METHODS: &[&str] = &["bf_getbuffer", "bf_releasebuffer"];

const HEAP_TYPE_TAIL: &[&str] = &["name", "ht_slots", "qualname", "ht_cached_keys"];

/// Oldest and newest supported minor versions of major version 3
const SUPPORTED_MINORS: std::ops::RangeInclusive<u8> = 7..=12;

/// Heap type field names in memory order, without the debug header.
fn heap_type_slots(major: u8, minor: u8) -> Option<Vec<&'static str>> {
    if major != 3 || !SUPPORTED_MINORS.contains(&minor) {
        return None;
    }
    let mut slots = Vec::with_capacity(128);
    slots.extend_from_slice(TYPE_HEAD);
    slots.push(if minor >= 8 { "tp_vectorcall_offset" } else { "tp_print" });
    slots.extend_from_slice(TYPE_BODY);
    if minor >= 8 {
        slots.push("tp_vectorcall");
    }
    if minor == 8 {
        slots.push("tp_print");
    }
    if minor >= 12 {
        slots.push("tp_watched");
    }
    slots.extend_from_slice(ASYNC_METHODS);
    if minor >= 10 {
        slots.push("am_send");
    }
    slots.extend_from_slice(NUMBER_METHODS);
    slots.extend_from_slice(MAPPING_METHODS);
    slots.extend_from_slice(SEQUENCE_METHODS);
    slots.extend_from_slice(BUFFER_METHODS);
    slots.extend_from_slice(HEAP_TYPE_TAIL);
    if minor >= 9 {
        slots.push("ht_module");
    }
    if minor >= 11 {
        slots.push("_ht_tpname");
        slots.push("_spec_cache_getitem");
    }
    if minor >= 12 {
        slots.push("_spec_cache_getitem_version");
    }
    Some(slots)
}

/// A protocol sub-table embedded in the heap type object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotGroup {
    /// Type slot holding the sub-table pointer, e.g. `tp_as_number`
    pub table_slot: &'static str,
    /// First field of the sub-table, e.g. `nb_add`
    pub first_slot: &'static str,
}

impl SlotGroup {
    /// The sub-table a slot name belongs to, if any.
    pub fn of(slot: &str) -> Option<Self> {
        let (table_slot, first_slot) = if slot.starts_with("nb_") {
            ("tp_as_number", "nb_add")
        } else if slot.starts_with("mp_") {
            ("tp_as_mapping", "mp_length")
        } else if slot.starts_with("sq_") || slot.starts_with("was_sq_") {
            ("tp_as_sequence", "sq_length")
        } else if slot.starts_with("am_") {
            ("tp_as_async", "am_await")
        } else if slot.starts_with("bf_") {
            ("tp_as_buffer", "bf_getbuffer")
        } else {
            return None;
        };
        Some(Self {
            table_slot,
            first_slot,
        })
    }

    pub const ALL: [SlotGroup; 5] = [
        SlotGroup {
            table_slot: "tp_as_async",
            first_slot: "am_await",
        },
        SlotGroup {
            table_slot: "tp_as_number",
            first_slot: "nb_add",
        },
        SlotGroup {
            table_slot: "tp_as_mapping",
            first_slot: "mp_length",
        },
        SlotGroup {
            table_slot: "tp_as_sequence",
            first_slot: "sq_length",
        },
        SlotGroup {
            table_slot: "tp_as_buffer",
            first_slot: "bf_getbuffer",
        },
    ];
}

/// Where a slot lives relative to a type object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotLocation {
    /// Directly in the type object at this offset
    Direct(usize),
    /// In a sub-table reached through the pointer at `table_offset`
    Indirect { table_offset: usize, relative: usize },
}

/// Offsets of the heap type object for one ABI revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeOffsets {
    revision: AbiRevision,
    word: usize,
    slots: IndexMap<&'static str, usize>,
    heap_type_size: usize,
    refcount: usize,
}

impl TypeOffsets {
    /// Build the table for `revision` with `word`-byte fields.
    pub fn compute(revision: AbiRevision, word: usize) -> NativeResult<Self> {
        let names = heap_type_slots(revision.major, revision.minor)
            .ok_or_else(|| NativeError::unsupported_abi(revision.to_string()))?;
        let header: &[&'static str] = if revision.debug { TRACE_REFS_HEADER } else { &[] };

        let mut slots = IndexMap::with_capacity(header.len() + names.len());
        for (index, name) in header.iter().chain(names.iter()).enumerate() {
            slots.insert(*name, index * word);
        }
        let heap_type_size = slots.len() * word;
        // the object header must be `ob_refcnt` then `ob_type`
        let refcount = match (slots.get("ob_refcnt"), slots.get("ob_type")) {
            (Some(&refcount), Some(&ty)) if ty == refcount + word => refcount,
            _ => return Err(NativeError::unsupported_abi(revision.to_string())),
        };
        Ok(Self {
            revision,
            word,
            slots,
            heap_type_size,
            refcount,
        })
    }

    pub fn revision(&self) -> AbiRevision {
        self.revision
    }

    pub fn word_size(&self) -> usize {
        self.word
    }

    pub fn get(&self, slot: &str) -> Option<usize> {
        self.slots.get(slot).copied()
    }

    /// Offset of a slot; unknown names are an error.
    pub fn offset(&self, slot: &str) -> NativeResult<usize> {
        self.get(slot)
            .ok_or_else(|| NativeError::unknown_slot(slot, self.revision.to_string()))
    }

    /// Where a slot is found, following protocol sub-tables.
    pub fn locate(&self, slot: &str) -> NativeResult<SlotLocation> {
        let offset = self.offset(slot)?;
        match SlotGroup::of(slot) {
            Some(group) => Ok(SlotLocation::Indirect {
                table_offset: self.offset(group.table_slot)?,
                relative: offset - self.offset(group.first_slot)?,
            }),
            None => Ok(SlotLocation::Direct(offset)),
        }
    }

    pub fn refcount_offset(&self) -> usize {
        self.refcount
    }

    pub fn type_offset(&self) -> usize {
        self.refcount_offset() + self.word
    }

    /// Size of a plain object header (refcount and type pointer)
    pub fn object_header_size(&self) -> usize {
        self.type_offset() + self.word
    }

    /// Size of a heap type object
    pub fn heap_type_size(&self) -> usize {
        self.heap_type_size
    }

    /// Slot names and offsets in memory order
    pub fn slots(&self) -> impl Iterator<Item = (&'static str, usize)> + '_ {
        self.slots.iter().map(|(name, offset)| (*name, *offset))
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

// ============================================================================
// Resolution
// ============================================================================

type TableCache = RwLock<FxHashMap<(AbiRevision, usize), &'static TypeOffsets>>;

fn tables() -> &'static TableCache {
    static TABLES: OnceLock<TableCache> = OnceLock::new();
    TABLES.get_or_init(|| RwLock::new(FxHashMap::default()))
}

/// The table for `revision` on this machine, computed once per revision.
pub fn offsets_for(revision: AbiRevision) -> NativeResult<&'static TypeOffsets> {
    let word = std::mem::size_of::<usize>();
    if let Some(table) = tables().read().get(&(revision, word)) {
        return Ok(table);
    }
    let mut cache = tables().write();
    if let Some(table) = cache.get(&(revision, word)) {
        return Ok(table);
    }
    let table: &'static TypeOffsets = Box::leak(Box::new(TypeOffsets::compute(revision, word)?));
    debug!(%revision, slots = table.len(), "computed type offsets");
    cache.insert((revision, word), table);
    Ok(table)
}

/// Detect the running interpreter and select its offset table.
pub fn resolve(native: &dyn NativeApi) -> NativeResult<&'static TypeOffsets> {
    let revision = AbiRevision::detect(native)?;
    let table = offsets_for(revision)?;
    info!(
        %revision,
        refcount_offset = table.refcount_offset(),
        heap_type_size = table.heap_type_size(),
        "resolved interpreter ABI"
    );
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const WORD: usize = std::mem::size_of::<usize>();

    #[test]
    fn test_parse_version_banner() {
        let version = PythonVersion::parse("3.8.10 (default, May  3 2021) [GCC 9.4.0]").unwrap();
        assert_eq!(version, PythonVersion::new(3, 8, 10));
    }

    #[test]
    fn test_parse_prerelease_micro() {
        let version = PythonVersion::parse("3.12.0rc1+").unwrap();
        assert_eq!(version, PythonVersion::new(3, 12, 0));
        assert_eq!(PythonVersion::parse("3.9").unwrap(), PythonVersion::new(3, 9, 0));
    }

    #[test]
    fn test_parse_garbage_fails() {
        assert!(matches!(
            PythonVersion::parse("not a version"),
            Err(NativeError::InvalidVersion { .. })
        ));
        assert!(PythonVersion::parse("").is_err());
    }

    #[test]
    fn test_revision_from_flags() {
        let version = PythonVersion::new(3, 9, 1);
        assert!(AbiRevision::from_version(version, "d").debug);
        assert!(!AbiRevision::from_version(version, "").debug);
        assert_eq!(AbiRevision::new(3, 9, true).to_string(), "3.9d");
    }

    #[test]
    fn test_offsets_are_index_times_word() {
        let table = TypeOffsets::compute(AbiRevision::new(3, 8, false), WORD).unwrap();
        assert_eq!(table.offset("ob_refcnt").unwrap(), 0);
        assert_eq!(table.offset("ob_type").unwrap(), WORD);
        assert_eq!(table.offset("tp_name").unwrap(), 3 * WORD);
        assert_eq!(table.offset("tp_dealloc").unwrap(), 6 * WORD);
        assert_eq!(table.offset("tp_vectorcall_offset").unwrap(), 7 * WORD);
        assert_eq!(table.heap_type_size(), table.len() * WORD);
    }

    #[test]
    fn test_debug_build_shifts_refcount() {
        let release = TypeOffsets::compute(AbiRevision::new(3, 9, false), WORD).unwrap();
        let debug = TypeOffsets::compute(AbiRevision::new(3, 9, true), WORD).unwrap();
        assert_eq!(release.refcount_offset(), 0);
        assert_eq!(debug.refcount_offset(), 2 * WORD);
        assert_eq!(
            debug.offset("tp_repr").unwrap(),
            release.offset("tp_repr").unwrap() + 2 * WORD
        );
        assert_eq!(debug.object_header_size(), release.object_header_size() + 2 * WORD);
    }

    #[test]
    fn test_versions_disagree_on_layout() {
        let v37 = TypeOffsets::compute(AbiRevision::new(3, 7, false), WORD).unwrap();
        let v38 = TypeOffsets::compute(AbiRevision::new(3, 8, false), WORD).unwrap();
        let v39 = TypeOffsets::compute(AbiRevision::new(3, 9, false), WORD).unwrap();
        let v310 = TypeOffsets::compute(AbiRevision::new(3, 10, false), WORD).unwrap();
        assert_eq!(v37.offset("tp_print").unwrap(), 7 * WORD);
        assert!(v37.get("tp_vectorcall").is_none());
        assert!(v38.offset("tp_print").unwrap() > v38.offset("tp_finalize").unwrap());
        assert!(v310.get("am_send").is_some());
        assert_eq!(
            v310.offset("nb_add").unwrap(),
            v39.offset("nb_add").unwrap() + WORD
        );
    }

    #[test]
    fn test_unsupported_revision_is_fatal() {
        let err = TypeOffsets::compute(AbiRevision::new(3, 6, false), WORD).unwrap_err();
        assert!(err.is_fatal());
        assert!(offsets_for(AbiRevision::new(2, 7, false)).is_err());
    }

    #[test]
    fn test_offsets_for_is_cached() {
        let first = offsets_for(AbiRevision::new(3, 11, false)).unwrap();
        let second = offsets_for(AbiRevision::new(3, 11, false)).unwrap();
        assert!(std::ptr::eq(first, second));
        let debug = offsets_for(AbiRevision::new(3, 11, true)).unwrap();
        assert!(!std::ptr::eq(first, debug));
    }

    #[test]
    fn test_locate_follows_sub_tables() {
        let table = TypeOffsets::compute(AbiRevision::new(3, 8, false), WORD).unwrap();
        assert_eq!(
            table.locate("tp_repr").unwrap(),
            SlotLocation::Direct(table.offset("tp_repr").unwrap())
        );
        assert_eq!(
            table.locate("nb_subtract").unwrap(),
            SlotLocation::Indirect {
                table_offset: table.offset("tp_as_number").unwrap(),
                relative: WORD,
            }
        );
        assert_eq!(
            table.locate("sq_contains").unwrap(),
            SlotLocation::Indirect {
                table_offset: table.offset("tp_as_sequence").unwrap(),
                relative: 7 * WORD,
            }
        );
        assert!(table.locate("tp_nonexistent").is_err());
    }

    #[test]
    fn test_every_table_starts_with_object_header() {
        for minor in SUPPORTED_MINORS {
            for debug in [false, true] {
                let table = TypeOffsets::compute(AbiRevision::new(3, minor, debug), WORD).unwrap();
                assert_eq!(table.refcount_offset(), table.offset("ob_refcnt").unwrap());
                assert_eq!(table.type_offset(), table.offset("ob_type").unwrap());
            }
        }
    }

    #[test]
    fn test_slot_names_are_unique() {
        for minor in SUPPORTED_MINORS {
            let names = heap_type_slots(3, minor).unwrap();
            let table = TypeOffsets::compute(AbiRevision::new(3, minor, false), WORD).unwrap();
            assert_eq!(names.len(), table.len(), "duplicate slot in 3.{minor}");
        }
    }
}

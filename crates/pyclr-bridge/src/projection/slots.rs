//! Protocol slot dispatch table.
//!
//! Every native protocol slot the bridge fills is a [`SlotKind`]. Synthesis
//! maps the managed members of a type onto slot kinds once, producing a
//! [`SlotBinding`] per kind; the `extern "C"` adapter for a kind dispatches
//! through that binding at call time.

use pyclr_native::NumberOp;
use rustc_hash::FxHashMap;

use crate::managed::{ManagedType, MemberKind};
use crate::projection::binding::MemberTable;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotKind {
    Dealloc,
    Repr,
    Str,
    Hash,
    Call,
    GetAttr,
    SetAttr,
    RichCompare,
    Iter,
    IterNext,
    Length,
    Contains,
    Subscript,
    AssignSubscript,
    Number(NumberOp),
    Traverse,
    Clear,
}

impl SlotKind {
    pub const FIXED: [SlotKind; 16] = [
        SlotKind::Dealloc,
        SlotKind::Repr,
        SlotKind::Str,
        SlotKind::Hash,
        SlotKind::Call,
        SlotKind::GetAttr,
        SlotKind::SetAttr,
        SlotKind::RichCompare,
        SlotKind::Iter,
        SlotKind::IterNext,
        SlotKind::Length,
        SlotKind::Contains,
        SlotKind::Subscript,
        SlotKind::AssignSubscript,
        SlotKind::Traverse,
        SlotKind::Clear,
    ];

    /// Slots every projected class binds, whatever its members
    pub const CLASS_DEFAULTS: [SlotKind; 9] = [
        SlotKind::Dealloc,
        SlotKind::Repr,
        SlotKind::Str,
        SlotKind::Hash,
        SlotKind::GetAttr,
        SlotKind::SetAttr,
        SlotKind::RichCompare,
        SlotKind::Traverse,
        SlotKind::Clear,
    ];

    /// Slots of the bound-method extension type
    pub const METHOD_BINDING: [SlotKind; 5] = [
        SlotKind::Dealloc,
        SlotKind::Repr,
        SlotKind::GetAttr,
        SlotKind::Call,
        SlotKind::Subscript,
    ];

    pub fn all() -> impl Iterator<Item = SlotKind> {
        Self::FIXED
            .into_iter()
            .chain(NumberOp::ALL.into_iter().map(SlotKind::Number))
    }

    /// Field name in the heap type object or one of its sub-tables
    pub fn slot_name(self) -> &'static str {
        match self {
            SlotKind::Dealloc => "tp_dealloc",
            SlotKind::Repr => "tp_repr",
            SlotKind::Str => "tp_str",
            SlotKind::Hash => "tp_hash",
            SlotKind::Call => "tp_call",
            SlotKind::GetAttr => "tp_getattro",
            SlotKind::SetAttr => "tp_setattro",
            SlotKind::RichCompare => "tp_richcompare",
            SlotKind::Iter => "tp_iter",
            SlotKind::IterNext => "tp_iternext",
            SlotKind::Length => "mp_length",
            SlotKind::Contains => "sq_contains",
            SlotKind::Subscript => "mp_subscript",
            SlotKind::AssignSubscript => "mp_ass_subscript",
            SlotKind::Number(op) => op.slot_name(),
            SlotKind::Traverse => "tp_traverse",
            SlotKind::Clear => "tp_clear",
        }
    }
}

/// How a slot reaches managed code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotBinding {
    /// Generic bridge behaviour, no managed member involved
    Default,
    /// One member backs the slot
    Member(usize),
    Compare {
        equals: Option<usize>,
        compare_to: Option<usize>,
    },
    IterNext {
        move_next: usize,
        current: usize,
    },
}

/// Managed operator method implementing a numeric operator.
pub fn operator_method(op: NumberOp) -> Option<&'static str> {
    Some(match op {
        NumberOp::Add => "op_Addition",
        NumberOp::Subtract => "op_Subtraction",
        NumberOp::Multiply => "op_Multiply",
        NumberOp::TrueDivide => "op_Division",
        NumberOp::Remainder => "op_Modulus",
        NumberOp::And => "op_BitwiseAnd",
        NumberOp::Or => "op_BitwiseOr",
        NumberOp::Xor => "op_ExclusiveOr",
        NumberOp::LeftShift => "op_LeftShift",
        NumberOp::RightShift => "op_RightShift",
        NumberOp::FloorDivide => return None,
    })
}

/// Map bound members onto protocol slots.
pub fn bind_slots(ty: &ManagedType, table: &MemberTable) -> FxHashMap<SlotKind, SlotBinding> {
    let method = |name: &str, arity: usize| -> Option<usize> {
        table.methods.get(name).and_then(|indices| {
            indices.iter().copied().find(|index| {
                let member = &ty.members()[*index];
                matches!(member.kind(), MemberKind::Method(_)) && member.accepts(arity)
            })
        })
    };
    let readable = |name: &str| -> Option<usize> {
        table
            .attributes
            .get(name)
            .copied()
            .filter(|index| ty.members()[*index].is_readable())
    };

    let mut slots = FxHashMap::default();
    for kind in SlotKind::CLASS_DEFAULTS {
        slots.insert(kind, SlotBinding::Default);
    }
    if let Some(to_string) = method("ToString", 0) {
        slots.insert(SlotKind::Repr, SlotBinding::Member(to_string));
        slots.insert(SlotKind::Str, SlotBinding::Member(to_string));
    }
    if let Some(hash) = method("GetHashCode", 0) {
        slots.insert(SlotKind::Hash, SlotBinding::Member(hash));
    }
    let equals = method("Equals", 1);
    let compare_to = method("CompareTo", 1);
    if equals.is_some() || compare_to.is_some() {
        slots.insert(SlotKind::RichCompare, SlotBinding::Compare { equals, compare_to });
    }
    if let Some(invoke) = table.methods.get("Invoke").and_then(|indices| indices.first()) {
        slots.insert(SlotKind::Call, SlotBinding::Member(*invoke));
    }
    if let Some(length) = readable("Count").or_else(|| readable("Length")) {
        slots.insert(SlotKind::Length, SlotBinding::Member(length));
    }
    if let Some(contains) = method("Contains", 1) {
        slots.insert(SlotKind::Contains, SlotBinding::Member(contains));
    }
    if let Some(get_item) = method("get_Item", 1) {
        slots.insert(SlotKind::Subscript, SlotBinding::Member(get_item));
    }
    if let Some(set_item) = method("set_Item", 2) {
        slots.insert(SlotKind::AssignSubscript, SlotBinding::Member(set_item));
    }
    let iter_next = method("MoveNext", 0)
        .zip(readable("Current"))
        .map(|(move_next, current)| SlotBinding::IterNext { move_next, current });
    if let Some(enumerator) = method("GetEnumerator", 0) {
        slots.insert(SlotKind::Iter, SlotBinding::Member(enumerator));
    } else if iter_next.is_some() {
        // an enumerator iterates itself
        slots.insert(SlotKind::Iter, SlotBinding::Default);
    }
    if let Some(binding) = iter_next {
        slots.insert(SlotKind::IterNext, binding);
    }
    for op in NumberOp::ALL {
        let bound = operator_method(op).and_then(|name| {
            table.methods.get(name).and_then(|indices| {
                indices
                    .iter()
                    .copied()
                    .find(|index| ty.members()[*index].is_static() && ty.members()[*index].accepts(2))
            })
        });
        if let Some(index) = bound {
            slots.insert(SlotKind::Number(op), SlotBinding::Member(index));
        }
    }
    slots
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::managed::{TypeName, Value};
    use crate::projection::binding::BindingFilter;
    use pretty_assertions::assert_eq;

    fn slots_of(ty: &ManagedType) -> FxHashMap<SlotKind, SlotBinding> {
        bind_slots(ty, &MemberTable::collect(ty, &BindingFilter::default()))
    }

    #[test]
    fn test_slot_names_are_unique() {
        let mut names: Vec<&str> = SlotKind::all().map(SlotKind::slot_name).collect();
        let total = names.len();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), total);
        assert_eq!(total, 27);
    }

    #[test]
    fn test_plain_type_gets_defaults_only() {
        let ty = ManagedType::builder(TypeName::parse("Demo.Plain")).build();
        let slots = slots_of(&ty);
        assert_eq!(slots.len(), SlotKind::CLASS_DEFAULTS.len());
        assert!(slots.values().all(|binding| *binding == SlotBinding::Default));
    }

    #[test]
    fn test_collection_members_map_to_slots() {
        let ty = ManagedType::builder(TypeName::parse("Demo.Bag"))
            .method("ToString", 0, |_, _| Ok(Value::from("bag")))
            .method("get_Item", 1, |_, _| Ok(Value::None))
            .method("Contains", 1, |_, _| Ok(Value::Bool(false)))
            .method("GetEnumerator", 0, |_, _| Ok(Value::None))
            .property("Count", |_, _| Ok(Value::Int(0)))
            .build();
        let slots = slots_of(&ty);
        assert_eq!(slots[&SlotKind::Repr], SlotBinding::Member(0));
        assert_eq!(slots[&SlotKind::Str], SlotBinding::Member(0));
        assert_eq!(slots[&SlotKind::Subscript], SlotBinding::Member(1));
        assert_eq!(slots[&SlotKind::Contains], SlotBinding::Member(2));
        assert_eq!(slots[&SlotKind::Iter], SlotBinding::Member(3));
        assert_eq!(slots[&SlotKind::Length], SlotBinding::Member(4));
        assert!(!slots.contains_key(&SlotKind::IterNext));
        assert!(!slots.contains_key(&SlotKind::AssignSubscript));
    }

    #[test]
    fn test_enumerator_iterates_itself() {
        let ty = ManagedType::builder(TypeName::parse("Demo.Cursor"))
            .method("MoveNext", 0, |_, _| Ok(Value::Bool(false)))
            .property("Current", |_, _| Ok(Value::None))
            .build();
        let slots = slots_of(&ty);
        assert_eq!(slots[&SlotKind::Iter], SlotBinding::Default);
        assert_eq!(
            slots[&SlotKind::IterNext],
            SlotBinding::IterNext {
                move_next: 0,
                current: 1
            }
        );
    }

    #[test]
    fn test_operators_must_be_static_binary() {
        let ty = ManagedType::builder(TypeName::parse("Demo.Vector"))
            .static_method("op_Addition", 2, |_, _| Ok(Value::None))
            .method("op_Subtraction", 2, |_, _| Ok(Value::None))
            .build();
        let slots = slots_of(&ty);
        assert_eq!(slots[&SlotKind::Number(NumberOp::Add)], SlotBinding::Member(0));
        assert!(!slots.contains_key(&SlotKind::Number(NumberOp::Subtract)));
    }
}

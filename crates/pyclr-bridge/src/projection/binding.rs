//! Member binding filters.
//!
//! Decides which reflected members a projected type exposes. The rules follow
//! what a subclass outside the defining assembly could see.

use indexmap::IndexMap;
use smol_str::SmolStr;

use crate::managed::{ManagedType, Member, MemberKind};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BindingFilter {
    /// Bind every member regardless of visibility
    pub bind_non_public: bool,
}

impl BindingFilter {
    pub fn new(bind_non_public: bool) -> Self {
        Self { bind_non_public }
    }

    pub fn admits(&self, member: &Member) -> bool {
        if self.bind_non_public {
            return true;
        }
        match member.kind() {
            MemberKind::Method(accessor) | MemberKind::Constructor(accessor) => accessor.visibility.is_bindable(),
            MemberKind::Field { visibility, .. } => visibility.is_bindable(),
            // getter first, setter only when there is no getter
            MemberKind::Property { getter, setter } => match (getter, setter) {
                (Some(getter), _) => getter.visibility.is_bindable(),
                (None, Some(setter)) => setter.visibility.is_bindable(),
                (None, None) => false,
            },
            MemberKind::Event { add, .. } => add.visibility.is_bindable(),
        }
    }
}

/// Bound members of one type, grouped for lookup.
#[derive(Debug, Clone, Default)]
pub struct MemberTable {
    /// Callables by name; overloads keep declaration order
    pub methods: IndexMap<SmolStr, Vec<usize>>,
    /// Properties and fields by name
    pub attributes: IndexMap<SmolStr, usize>,
    pub constructors: Vec<usize>,
}

impl MemberTable {
    pub fn collect(ty: &ManagedType, filter: &BindingFilter) -> Self {
        let mut table = MemberTable::default();
        for (index, member) in ty.members().iter().enumerate() {
            if !filter.admits(member) {
                continue;
            }
            match member.kind() {
                MemberKind::Constructor(_) => table.constructors.push(index),
                MemberKind::Method(_) | MemberKind::Event { .. } => {
                    table
                        .methods
                        .entry(SmolStr::new(member.name()))
                        .or_default()
                        .push(index);
                }
                MemberKind::Property { .. } | MemberKind::Field { .. } => {
                    table.attributes.entry(SmolStr::new(member.name())).or_insert(index);
                }
            }
        }
        table
    }
}

/// Pick the first overload accepting `count` arguments.
pub fn select_overload<'a>(ty: &'a ManagedType, candidates: &[usize], count: usize) -> Option<&'a Member> {
    candidates
        .iter()
        .filter_map(|index| ty.members().get(*index))
        .find(|member| member.accepts(count))
}

//! Managed Runtime Model
//!
//! The bridge sees the managed runtime through reflection metadata
//! ([`ManagedType`], [`Member`]), live instances ([`ManagedObject`]) and a
//! [`Domain`] that resolves types by name. A reload replaces the domain; the
//! bridge re-resolves everything it stashed against the new one.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};
use pyclr_native::{BorrowedRef, ExceptionKind, NativeException, NativeObject};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

use crate::error::BridgeError;

// ============================================================================
// Names
// ============================================================================

/// Namespace-qualified managed type name.
///
/// Generic definitions carry their arity as a backtick suffix, e.g.
/// ``System.Collections.Generic.List`1``.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TypeName {
    namespace: SmolStr,
    name: SmolStr,
}

impl TypeName {
    pub fn new(namespace: impl Into<SmolStr>, name: impl Into<SmolStr>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Split a full name at its last dot.
    pub fn parse(full_name: &str) -> Self {
        match full_name.rfind('.') {
            Some(dot) => Self::new(&full_name[..dot], &full_name[dot + 1..]),
            None => Self::new("", full_name),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn full_name(&self) -> String {
        if self.namespace.is_empty() {
            self.name.to_string()
        } else {
            format!("{}.{}", self.namespace, self.name)
        }
    }

    /// Name without the generic arity suffix
    pub fn base_name(&self) -> &str {
        match self.name.find('`') {
            Some(tick) => &self.name[..tick],
            None => &self.name,
        }
    }

    pub fn generic_arity(&self) -> usize {
        self.name
            .find('`')
            .and_then(|tick| self.name[tick + 1..].parse().ok())
            .unwrap_or(0)
    }

    pub fn is_generic(&self) -> bool {
        self.generic_arity() > 0
    }
}

impl fmt::Display for TypeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}.{}", self.namespace, self.name)
        }
    }
}

// ============================================================================
// Members
// ============================================================================

/// Managed member accessibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Visibility {
    Public,
    /// protected
    Family,
    /// protected internal
    FamilyOrAssembly,
    /// internal
    Assembly,
    /// private protected
    FamilyAndAssembly,
    Private,
}

impl Visibility {
    /// Visible to a subclass defined outside the assembly.
    pub fn is_bindable(self) -> bool {
        matches!(
            self,
            Visibility::Public | Visibility::Family | Visibility::FamilyOrAssembly
        )
    }
}

/// Calls a member. The first argument is the receiver for instance members.
pub type Invoker =
    Arc<dyn Fn(Option<&ManagedRef>, &[Value]) -> Result<Value, ManagedException> + Send + Sync>;

#[derive(Clone)]
pub struct Accessor {
    pub visibility: Visibility,
    pub invoke: Invoker,
}

impl Accessor {
    pub fn new<F>(visibility: Visibility, f: F) -> Self
    where
        F: Fn(Option<&ManagedRef>, &[Value]) -> Result<Value, ManagedException> + Send + Sync + 'static,
    {
        Self {
            visibility,
            invoke: Arc::new(f),
        }
    }

    pub fn public<F>(f: F) -> Self
    where
        F: Fn(Option<&ManagedRef>, &[Value]) -> Result<Value, ManagedException> + Send + Sync + 'static,
    {
        Self::new(Visibility::Public, f)
    }
}

#[derive(Clone)]
pub enum MemberKind {
    Method(Accessor),
    Property {
        getter: Option<Accessor>,
        setter: Option<Accessor>,
    },
    Field {
        visibility: Visibility,
        getter: Invoker,
        setter: Option<Invoker>,
    },
    Event {
        add: Accessor,
        remove: Option<Accessor>,
    },
    Constructor(Accessor),
}

impl MemberKind {
    pub fn label(&self) -> &'static str {
        match self {
            MemberKind::Method(_) => "method",
            MemberKind::Property { .. } => "property",
            MemberKind::Field { .. } => "field",
            MemberKind::Event { .. } => "event",
            MemberKind::Constructor(_) => "constructor",
        }
    }
}

/// A declared parameter of a callable member.
#[derive(Debug, Clone)]
pub struct Param {
    name: SmolStr,
    /// Type label an argument must carry; `object` takes anything
    type_label: SmolStr,
    default: Option<Value>,
}

impl Param {
    pub fn new(name: impl Into<SmolStr>, type_label: impl Into<SmolStr>) -> Self {
        Self {
            name: name.into(),
            type_label: type_label.into(),
            default: None,
        }
    }

    /// A parameter that takes `default` when no argument is given.
    pub fn optional(name: impl Into<SmolStr>, type_label: impl Into<SmolStr>, default: Value) -> Self {
        Self {
            default: Some(default),
            ..Self::new(name, type_label)
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn type_label(&self) -> &str {
        &self.type_label
    }

    pub fn default(&self) -> Option<&Value> {
        self.default.as_ref()
    }

    pub fn admits(&self, value: &Value) -> bool {
        match self.type_label.as_str() {
            "object" => true,
            "float" => matches!(value, Value::Float(_) | Value::Int(_)),
            label => value.type_label() == label,
        }
    }
}

/// A reflected member of a managed type.
#[derive(Clone)]
pub struct Member {
    name: SmolStr,
    is_static: bool,
    /// Parameter count for callables; `None` accepts any count
    arity: Option<usize>,
    params: Option<Arc<[Param]>>,
    kind: MemberKind,
}

impl Member {
    pub fn new(name: impl Into<SmolStr>, is_static: bool, arity: Option<usize>, kind: MemberKind) -> Self {
        Self {
            name: name.into(),
            is_static,
            arity,
            params: None,
            kind,
        }
    }

    /// Declare the parameters; the arity becomes their count.
    pub fn with_params(mut self, params: Vec<Param>) -> Self {
        self.arity = Some(params.len());
        self.params = Some(params.into());
        self
    }

    pub fn params(&self) -> Option<&[Param]> {
        self.params.as_deref()
    }

    /// Declared parameter type labels
    pub fn signature(&self) -> Option<Vec<SmolStr>> {
        self.params()
            .map(|params| params.iter().map(|param| param.type_label.clone()).collect())
    }

    /// Whether every argument has its parameter's declared type. Members
    /// without declared parameters admit anything.
    pub fn admits(&self, args: &[Value]) -> bool {
        self.params()
            .map_or(true, |params| params.iter().zip(args).all(|(param, arg)| param.admits(arg)))
    }

    /// Arrange positional and keyword arguments in parameter order, filling
    /// defaults. The error names the first mismatch.
    pub fn bind_arguments(&self, args: &[Value], keywords: &[(SmolStr, Value)]) -> Result<Vec<Value>, String> {
        let Some(params) = self.params() else {
            if !keywords.is_empty() {
                return Err("takes no keyword arguments".to_string());
            }
            return if self.accepts(args.len()) {
                Ok(args.to_vec())
            } else {
                Err(format!("takes {} arguments ({} given)", self.arity.unwrap_or(0), args.len()))
            };
        };
        if args.len() > params.len() {
            return Err(format!(
                "takes at most {} arguments ({} given)",
                params.len(),
                args.len()
            ));
        }
        let mut slots: Vec<Option<Value>> = args.iter().cloned().map(Some).collect();
        slots.resize(params.len(), None);
        for (keyword, value) in keywords {
            let index = params
                .iter()
                .position(|param| param.name == *keyword)
                .ok_or_else(|| format!("got an unexpected keyword argument '{keyword}'"))?;
            if slots[index].is_some() {
                return Err(format!("got multiple values for argument '{keyword}'"));
            }
            slots[index] = Some(value.clone());
        }
        params
            .iter()
            .zip(slots)
            .map(|(param, slot)| {
                slot.or_else(|| param.default.clone())
                    .ok_or_else(|| format!("missing required argument '{}'", param.name))
            })
            .collect()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_static(&self) -> bool {
        self.is_static
    }

    pub fn arity(&self) -> Option<usize> {
        self.arity
    }

    pub fn kind(&self) -> &MemberKind {
        &self.kind
    }

    pub fn is_callable(&self) -> bool {
        matches!(
            self.kind,
            MemberKind::Method(_) | MemberKind::Constructor(_) | MemberKind::Event { .. }
        )
    }

    pub fn is_readable(&self) -> bool {
        match &self.kind {
            MemberKind::Property { getter, .. } => getter.is_some(),
            MemberKind::Field { .. } => true,
            _ => false,
        }
    }

    pub fn accepts(&self, count: usize) -> bool {
        match self.params() {
            Some(params) => {
                let required = params.iter().filter(|param| param.default.is_none()).count();
                (required..=params.len()).contains(&count)
            }
            None => self.arity.map_or(true, |arity| arity == count),
        }
    }

    /// Invoke a method, constructor, or an event's add accessor.
    pub fn invoke(&self, target: Option<&ManagedRef>, args: &[Value]) -> Result<Value, ManagedException> {
        let target = if self.is_static { None } else { target };
        match &self.kind {
            MemberKind::Method(accessor) | MemberKind::Constructor(accessor) => (accessor.invoke)(target, args),
            MemberKind::Event { add, .. } => (add.invoke)(target, args),
            other => Err(ManagedException::invalid_operation(format!(
                "{} `{}` is not callable",
                other.label(),
                self.name
            ))),
        }
    }

    /// Read a property or field.
    pub fn get(&self, target: Option<&ManagedRef>) -> Result<Value, ManagedException> {
        let target = if self.is_static { None } else { target };
        match &self.kind {
            MemberKind::Property {
                getter: Some(getter), ..
            } => (getter.invoke)(target, &[]),
            MemberKind::Field { getter, .. } => getter(target, &[]),
            _ => Err(ManagedException::invalid_operation(format!(
                "`{}` has no getter",
                self.name
            ))),
        }
    }

    /// Whether [`Member::set`] can succeed
    pub fn is_writable(&self) -> bool {
        match &self.kind {
            MemberKind::Property { setter, .. } => setter.is_some(),
            MemberKind::Field { setter, .. } => setter.is_some(),
            _ => false,
        }
    }

    pub fn set(&self, target: Option<&ManagedRef>, value: Value) -> Result<(), ManagedException> {
        let target = if self.is_static { None } else { target };
        let args = [value];
        match &self.kind {
            MemberKind::Property {
                setter: Some(setter), ..
            } => (setter.invoke)(target, &args).map(|_| ()),
            MemberKind::Field {
                setter: Some(setter), ..
            } => setter(target, &args).map(|_| ()),
            _ => Err(ManagedException::invalid_operation(format!(
                "`{}` has no setter",
                self.name
            ))),
        }
    }
}

impl fmt::Debug for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Member")
            .field("name", &self.name)
            .field("kind", &self.kind.label())
            .field("is_static", &self.is_static)
            .field("arity", &self.arity)
            .finish()
    }
}

// ============================================================================
// Types
// ============================================================================

/// Reflection metadata for one managed type.
#[derive(Debug)]
pub struct ManagedType {
    name: TypeName,
    sealed: bool,
    serializable: bool,
    base: Option<TypeName>,
    members: Vec<Member>,
}

impl ManagedType {
    pub fn builder(name: TypeName) -> TypeBuilder {
        TypeBuilder {
            ty: ManagedType {
                name,
                sealed: false,
                serializable: false,
                base: None,
                members: Vec::new(),
            },
        }
    }

    pub fn name(&self) -> &TypeName {
        &self.name
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    pub fn is_serializable(&self) -> bool {
        self.serializable
    }

    pub fn base(&self) -> Option<&TypeName> {
        self.base.as_ref()
    }

    pub fn members(&self) -> &[Member] {
        &self.members
    }

    pub fn members_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Member> + 'a {
        self.members.iter().filter(move |member| member.name() == name)
    }
}

/// Builds [`ManagedType`] metadata.
pub struct TypeBuilder {
    ty: ManagedType,
}

impl TypeBuilder {
    pub fn sealed(mut self) -> Self {
        self.ty.sealed = true;
        self
    }

    pub fn serializable(mut self) -> Self {
        self.ty.serializable = true;
        self
    }

    pub fn base(mut self, base: TypeName) -> Self {
        self.ty.base = Some(base);
        self
    }

    pub fn member(mut self, member: Member) -> Self {
        self.ty.members.push(member);
        self
    }

    /// Public instance method
    pub fn method<F>(self, name: &str, arity: usize, f: F) -> Self
    where
        F: Fn(Option<&ManagedRef>, &[Value]) -> Result<Value, ManagedException> + Send + Sync + 'static,
    {
        self.method_with(name, Visibility::Public, false, Some(arity), f)
    }

    /// Public static method
    pub fn static_method<F>(self, name: &str, arity: usize, f: F) -> Self
    where
        F: Fn(Option<&ManagedRef>, &[Value]) -> Result<Value, ManagedException> + Send + Sync + 'static,
    {
        self.method_with(name, Visibility::Public, true, Some(arity), f)
    }

    pub fn method_with<F>(self, name: &str, visibility: Visibility, is_static: bool, arity: Option<usize>, f: F) -> Self
    where
        F: Fn(Option<&ManagedRef>, &[Value]) -> Result<Value, ManagedException> + Send + Sync + 'static,
    {
        self.member(Member::new(
            name,
            is_static,
            arity,
            MemberKind::Method(Accessor::new(visibility, f)),
        ))
    }

    /// Public instance method with declared parameters
    pub fn method_with_params<F>(self, name: &str, params: Vec<Param>, f: F) -> Self
    where
        F: Fn(Option<&ManagedRef>, &[Value]) -> Result<Value, ManagedException> + Send + Sync + 'static,
    {
        self.member(Member::new(name, false, None, MemberKind::Method(Accessor::public(f))).with_params(params))
    }

    /// Public read-only instance property
    pub fn property<G>(self, name: &str, getter: G) -> Self
    where
        G: Fn(Option<&ManagedRef>, &[Value]) -> Result<Value, ManagedException> + Send + Sync + 'static,
    {
        self.member(Member::new(
            name,
            false,
            None,
            MemberKind::Property {
                getter: Some(Accessor::public(getter)),
                setter: None,
            },
        ))
    }

    /// Public read-write instance property
    pub fn property_rw<G, S>(self, name: &str, getter: G, setter: S) -> Self
    where
        G: Fn(Option<&ManagedRef>, &[Value]) -> Result<Value, ManagedException> + Send + Sync + 'static,
        S: Fn(Option<&ManagedRef>, &[Value]) -> Result<Value, ManagedException> + Send + Sync + 'static,
    {
        self.member(Member::new(
            name,
            false,
            None,
            MemberKind::Property {
                getter: Some(Accessor::public(getter)),
                setter: Some(Accessor::public(setter)),
            },
        ))
    }

    pub fn constructor<F>(self, arity: usize, f: F) -> Self
    where
        F: Fn(Option<&ManagedRef>, &[Value]) -> Result<Value, ManagedException> + Send + Sync + 'static,
    {
        self.member(Member::new(
            ".ctor",
            true,
            Some(arity),
            MemberKind::Constructor(Accessor::public(f)),
        ))
    }

    pub fn build(self) -> Arc<ManagedType> {
        Arc::new(self.ty)
    }
}

impl fmt::Debug for TypeBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TypeBuilder").field(&self.ty.name).finish()
    }
}

// ============================================================================
// Instances and values
// ============================================================================

/// A live managed instance.
pub trait ManagedObject: Any + Send + Sync {
    fn type_name(&self) -> TypeName;

    /// Serialized state for stash/restore; `None` when not serializable
    fn snapshot(&self) -> Option<serde_json::Value> {
        None
    }

    /// Report native references this instance keeps alive
    fn visit_native(&self, _visit: &mut dyn FnMut(BorrowedRef<'_>)) {}

    fn as_any(&self) -> &dyn Any;
}

pub type ManagedRef = Arc<dyn ManagedObject>;

/// Identity of a managed instance while it is alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(usize);

impl InstanceId {
    pub fn of(instance: &ManagedRef) -> Self {
        Self(Arc::as_ptr(instance) as *const () as usize)
    }

    pub fn as_usize(self) -> usize {
        self.0
    }
}

/// Downcast an instance to its concrete type.
pub fn downcast<T: ManagedObject>(instance: &ManagedRef) -> Option<&T> {
    instance.as_any().downcast_ref::<T>()
}

/// A value crossing the boundary.
#[derive(Clone)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(SmolStr),
    Object(ManagedRef),
    /// A native object with no managed counterpart
    Native(Arc<NativeObject>),
}

impl Value {
    pub fn type_label(&self) -> String {
        match self {
            Value::None => "None".to_string(),
            Value::Bool(_) => "bool".to_string(),
            Value::Int(_) => "int".to_string(),
            Value::Float(_) => "float".to_string(),
            Value::Str(_) => "str".to_string(),
            Value::Object(instance) => instance.type_name().full_name(),
            Value::Native(_) => "native object".to_string(),
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(value) => Some(*value),
            Value::Bool(value) => Some(i64::from(*value)),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(value) => Some(*value),
            Value::Int(value) => Some(*value as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&ManagedRef> {
        match self {
            Value::Object(instance) => Some(instance),
            _ => None,
        }
    }

    /// Managed truthiness
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::None => false,
            Value::Bool(value) => *value,
            Value::Int(value) => *value != 0,
            Value::Float(value) => *value != 0.0,
            Value::Str(value) => !value.is_empty(),
            Value::Object(_) | Value::Native(_) => true,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None => write!(f, "None"),
            Value::Bool(value) => write!(f, "Bool({value})"),
            Value::Int(value) => write!(f, "Int({value})"),
            Value::Float(value) => write!(f, "Float({value})"),
            Value::Str(value) => write!(f, "Str({value:?})"),
            Value::Object(instance) => write!(f, "Object({})", instance.type_name()),
            Value::Native(object) => write!(f, "Native({object:?})"),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::None, Value::None) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => InstanceId::of(a) == InstanceId::of(b),
            (Value::Native(a), Value::Native(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(SmolStr::new(value))
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Str(SmolStr::from(value))
    }
}

impl From<ManagedRef> for Value {
    fn from(value: ManagedRef) -> Self {
        Value::Object(value)
    }
}

// ============================================================================
// Exceptions
// ============================================================================

/// An exception thrown by managed code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedException {
    pub type_name: SmolStr,
    pub message: String,
    pub stack_trace: Option<String>,
    /// Set when the exception wraps a native error raised through managed code
    pub native: Option<NativeException>,
}

impl ManagedException {
    pub fn new(type_name: impl Into<SmolStr>, message: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            message: message.into(),
            stack_trace: None,
            native: None,
        }
    }

    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::new("System.InvalidOperationException", message)
    }

    pub fn argument(message: impl Into<String>) -> Self {
        Self::new("System.ArgumentException", message)
    }

    pub fn with_stack_trace(mut self, stack_trace: impl Into<String>) -> Self {
        self.stack_trace = Some(stack_trace.into());
        self
    }

    /// Wrap a native error so it is re-raised unchanged if it crosses back.
    pub fn from_native(exception: NativeException) -> Self {
        Self {
            type_name: SmolStr::new("Python.Runtime.PythonException"),
            message: exception.to_string(),
            stack_trace: exception.traceback.clone(),
            native: Some(exception),
        }
    }

    /// The native exception a native caller sees.
    pub fn to_native_exception(&self) -> NativeException {
        match &self.native {
            Some(original) => original.clone(),
            None => {
                let exception = NativeException::new(ExceptionKind::ClrError, self.to_string());
                match &self.stack_trace {
                    Some(trace) => exception.with_traceback(trace.clone()),
                    None => exception,
                }
            }
        }
    }
}

impl fmt::Display for ManagedException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.type_name, self.message)
    }
}

impl From<BridgeError> for ManagedException {
    fn from(err: BridgeError) -> Self {
        match err {
            BridgeError::Managed(exception) => exception,
            other => Self::from_native(other.to_native_exception()),
        }
    }
}

// ============================================================================
// Domains
// ============================================================================

/// One loaded generation of the managed runtime.
pub trait Domain: Send + Sync {
    fn name(&self) -> &str;

    fn resolve(&self, name: &TypeName) -> Option<Arc<ManagedType>>;

    fn types(&self) -> Vec<Arc<ManagedType>>;

    /// Recreate an instance from a stash snapshot
    fn restore_instance(&self, type_name: &TypeName, snapshot: &serde_json::Value) -> Option<ManagedRef>;

    fn namespaces(&self) -> Vec<SmolStr> {
        let mut namespaces = IndexSet::new();
        for ty in self.types() {
            namespaces.insert(SmolStr::new(ty.name().namespace()));
        }
        namespaces.into_iter().collect()
    }

    fn types_in(&self, namespace: &str) -> Vec<Arc<ManagedType>> {
        self.types()
            .into_iter()
            .filter(|ty| ty.name().namespace() == namespace)
            .collect()
    }
}

/// Rebuilds an instance from its snapshot.
pub type InstanceFactory = Arc<dyn Fn(&serde_json::Value) -> Option<ManagedRef> + Send + Sync>;

/// A domain with a fixed set of types.
pub struct StaticDomain {
    name: String,
    types: IndexMap<TypeName, (Arc<ManagedType>, Option<InstanceFactory>)>,
}

impl StaticDomain {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            types: IndexMap::new(),
        }
    }

    pub fn with_type(mut self, ty: Arc<ManagedType>) -> Self {
        self.register(ty, None);
        self
    }

    pub fn with_restorable<F>(mut self, ty: Arc<ManagedType>, factory: F) -> Self
    where
        F: Fn(&serde_json::Value) -> Option<ManagedRef> + Send + Sync + 'static,
    {
        self.register(ty, Some(Arc::new(factory)));
        self
    }

    pub fn register(&mut self, ty: Arc<ManagedType>, factory: Option<InstanceFactory>) {
        self.types.insert(ty.name().clone(), (ty, factory));
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

impl Domain for StaticDomain {
    fn name(&self) -> &str {
        &self.name
    }

    fn resolve(&self, name: &TypeName) -> Option<Arc<ManagedType>> {
        self.types.get(name).map(|(ty, _)| Arc::clone(ty))
    }

    fn types(&self) -> Vec<Arc<ManagedType>> {
        self.types.values().map(|(ty, _)| Arc::clone(ty)).collect()
    }

    fn restore_instance(&self, type_name: &TypeName, snapshot: &serde_json::Value) -> Option<ManagedRef> {
        let (ty, factory) = self.types.get(type_name)?;
        if !ty.is_serializable() {
            return None;
        }
        factory.as_ref().and_then(|factory| factory(snapshot))
    }
}

impl fmt::Debug for StaticDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticDomain")
            .field("name", &self.name)
            .field("types", &self.types.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    struct Unit;

    impl ManagedObject for Unit {
        fn type_name(&self) -> TypeName {
            TypeName::parse("Demo.Unit")
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[test]
    fn test_type_name_parse() {
        let name = TypeName::parse("System.Collections.Generic.List`1");
        assert_eq!(name.namespace(), "System.Collections.Generic");
        assert_eq!(name.name(), "List`1");
        assert_eq!(name.base_name(), "List");
        assert_eq!(name.generic_arity(), 1);
        assert_eq!(name.full_name(), "System.Collections.Generic.List`1");
        assert_eq!(TypeName::parse("Bare").namespace(), "");
        assert_eq!(TypeName::parse("Bare").to_string(), "Bare");
    }

    #[test]
    fn test_visibility_binding() {
        assert!(Visibility::Public.is_bindable());
        assert!(Visibility::Family.is_bindable());
        assert!(Visibility::FamilyOrAssembly.is_bindable());
        assert!(!Visibility::Assembly.is_bindable());
        assert!(!Visibility::FamilyAndAssembly.is_bindable());
        assert!(!Visibility::Private.is_bindable());
    }

    #[test]
    fn test_static_members_ignore_receiver() {
        let ty = ManagedType::builder(TypeName::parse("Demo.Math"))
            .static_method("Twice", 1, |target, args| {
                assert!(target.is_none());
                Ok(Value::Int(args[0].as_int().unwrap_or(0) * 2))
            })
            .build();
        let instance: ManagedRef = Arc::new(Unit);
        let member = ty.members_named("Twice").next().unwrap();
        assert_eq!(member.invoke(Some(&instance), &[Value::Int(21)]).unwrap(), Value::Int(42));
    }

    #[test]
    fn test_read_only_property_rejects_set() {
        let ty = ManagedType::builder(TypeName::parse("Demo.Unit"))
            .property("Size", |_, _| Ok(Value::Int(1)))
            .build();
        let member = &ty.members()[0];
        assert!(member.is_readable());
        assert!(!member.is_writable());
        assert!(member.set(None, Value::Int(2)).is_err());
    }

    #[test]
    fn test_instance_identity_follows_arc() {
        let a: ManagedRef = Arc::new(Unit);
        let b = Arc::clone(&a);
        let c: ManagedRef = Arc::new(Unit);
        assert_eq!(InstanceId::of(&a), InstanceId::of(&b));
        assert_ne!(InstanceId::of(&a), InstanceId::of(&c));
        assert_eq!(Value::Object(a), Value::Object(b));
    }

    #[test]
    fn test_native_wrapped_exception_round_trips() {
        let original = NativeException::new(ExceptionKind::ValueError, "bad value");
        let managed = ManagedException::from_native(original.clone());
        assert_eq!(managed.to_native_exception(), original);
    }

    #[test]
    fn test_domain_namespaces_are_distinct_and_ordered() {
        let domain = StaticDomain::new("test")
            .with_type(ManagedType::builder(TypeName::parse("B.One")).build())
            .with_type(ManagedType::builder(TypeName::parse("A.Two")).build())
            .with_type(ManagedType::builder(TypeName::parse("B.Three")).build());
        assert_eq!(domain.namespaces(), vec![SmolStr::new("B"), SmolStr::new("A")]);
        assert_eq!(domain.types_in("B").len(), 2);
    }

    #[test]
    fn test_non_serializable_types_do_not_restore() {
        let ty = ManagedType::builder(TypeName::parse("Demo.Unit")).build();
        let domain = StaticDomain::new("test").with_restorable(ty, |_| Some(Arc::new(Unit) as ManagedRef));
        assert!(domain
            .restore_instance(&TypeName::parse("Demo.Unit"), &serde_json::Value::Null)
            .is_none());
    }

    fn format_member() -> Member {
        Member::new(
            "Format",
            true,
            None,
            MemberKind::Method(Accessor::public(|_, args| Ok(Value::Int(args.len() as i64)))),
        )
        .with_params(vec![
            Param::new("value", "int"),
            Param::optional("width", "int", Value::Int(0)),
            Param::optional("fill", "str", Value::from(" ")),
        ])
    }

    #[test]
    fn test_bind_arguments_by_name_and_default() {
        let member = format_member();
        assert_eq!(member.arity(), Some(3));
        assert!(member.accepts(1) && member.accepts(3) && !member.accepts(0));

        let bound = member
            .bind_arguments(&[Value::Int(7)], &[(SmolStr::new("fill"), Value::from("0"))])
            .unwrap();
        assert_eq!(bound, vec![Value::Int(7), Value::Int(0), Value::from("0")]);
    }

    #[test]
    fn test_bind_arguments_reports_mismatches() {
        let member = format_member();
        let twice = member
            .bind_arguments(&[Value::Int(7)], &[(SmolStr::new("value"), Value::Int(8))])
            .unwrap_err();
        assert!(twice.contains("multiple values for argument 'value'"));
        let unknown = member
            .bind_arguments(&[Value::Int(7)], &[(SmolStr::new("colour"), Value::None)])
            .unwrap_err();
        assert!(unknown.contains("unexpected keyword argument 'colour'"));
        let missing = member.bind_arguments(&[], &[(SmolStr::new("width"), Value::Int(2))]).unwrap_err();
        assert!(missing.contains("missing required argument 'value'"));

        let untyped = Member::new("Run", false, Some(0), MemberKind::Method(Accessor::public(|_, _| Ok(Value::None))));
        assert!(untyped.bind_arguments(&[], &[(SmolStr::new("x"), Value::None)]).is_err());
    }

    #[test]
    fn test_params_admit_by_type_label() {
        let member = format_member();
        assert!(member.admits(&[Value::Int(1), Value::Int(2)]));
        assert!(!member.admits(&[Value::from("1")]));
        assert!(Param::new("x", "float").admits(&Value::Int(1)));
        assert!(Param::new("x", "object").admits(&Value::Object(Arc::new(Unit))));
        assert!(Param::new("x", "Demo.Unit").admits(&Value::Object(Arc::new(Unit))));
    }
}

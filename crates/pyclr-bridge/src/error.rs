//! Error Types for the Bridge
//!
//! ## Error Categories
//!
//! - Native surface failures, forwarded unchanged
//! - Lifecycle errors (not attached, shutting down)
//! - Resolution failures and tombstones
//! - Contract violations (sealed subclassing, handle misuse)
//! - Managed exceptions crossing into native code
//! - Stash and configuration problems

use pyclr_native::{ExceptionKind, NativeApi, NativeError, NativeException};
use thiserror::Error;

use crate::managed::{ManagedException, TypeName};

/// Result type for bridge operations
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Bridge error types
#[derive(Error, Debug, Clone)]
pub enum BridgeError {
    /// The native surface reported a failure
    #[error(transparent)]
    Native(#[from] NativeError),

    /// No engine is attached to the process
    #[error("managed runtime is not attached")]
    NotAttached,

    /// An engine is already attached
    #[error("managed runtime is already attached")]
    AlreadyAttached,

    /// Creation was blocked by a shutdown in progress
    #[error("cannot create {what}: the bridge is shutting down")]
    ShuttingDown {
        /// What was being created
        what: String,
    },

    /// A managed type could not be resolved for first-time binding
    #[error("managed type `{type_name}` could not be resolved")]
    TypeNotFound { type_name: String },

    /// A managed namespace holds no resolvable types
    #[error("no managed namespace named `{namespace}`")]
    NamespaceNotFound { namespace: String },

    /// The descriptor's managed type did not survive a reload
    #[error("The managed type {type_name} no longer exists")]
    TypeTombstoned { type_name: String },

    /// A bound member did not survive a reload
    #[error("The managed member {type_name}.{member} no longer exists")]
    MemberTombstoned { type_name: String, member: String },

    /// A bridge object's instance could not be restored
    #[error("The managed instance of {type_name} no longer exists")]
    InstanceTombstoned { type_name: String },

    /// Attribute lookup failed on a projected object
    #[error("'{type_name}' object has no attribute '{attribute}'")]
    AttributeNotFound { type_name: String, attribute: String },

    /// Assignment to an attribute without a setter
    #[error("attribute '{attribute}' of '{type_name}' objects is not writable")]
    ReadOnlyAttribute { type_name: String, attribute: String },

    /// The projected type has no binding for an operation
    #[error("'{type_name}' object does not support {operation}")]
    NotSupported { type_name: String, operation: String },

    /// Attempt to subclass a sealed projected type
    #[error("contract violation: type `{type_name}` is sealed and cannot be subclassed")]
    SealedType { type_name: String },

    /// Misuse of the bridge by its consumer
    #[error("contract violation: {message}")]
    ContractViolation { message: String },

    /// A managed member threw
    #[error("{0}")]
    Managed(ManagedException),

    /// A value could not cross the boundary
    #[error("cannot convert {from} to {to}")]
    Conversion { from: String, to: String },

    /// No overload accepts the given number of arguments
    #[error("{member}() takes {expected} arguments ({actual} given)")]
    ArgumentCount {
        member: String,
        expected: String,
        actual: usize,
    },

    /// Keyword arguments matched no overload
    #[error("{member}() {message}")]
    ArgumentBinding { member: String, message: String },

    /// `__overloads__` was indexed with a signature no overload declares
    #[error("no overload of {member}() matches ({signature})")]
    NoMatchingOverload { member: String, signature: String },

    /// Stash blob could not be written or read
    #[error("stash error: {message}")]
    Stash { message: String },

    /// Invalid configuration
    #[error("invalid bridge configuration: {message}")]
    Config { message: String },

    /// A panic was caught at a slot boundary
    #[error("panic in bridge adapter: {message}")]
    Panic { message: String },
}

impl BridgeError {
    pub fn shutting_down(what: impl Into<String>) -> Self {
        BridgeError::ShuttingDown { what: what.into() }
    }

    pub fn type_not_found(type_name: &TypeName) -> Self {
        BridgeError::TypeNotFound {
            type_name: type_name.full_name(),
        }
    }

    pub fn type_tombstoned(type_name: &TypeName) -> Self {
        BridgeError::TypeTombstoned {
            type_name: type_name.full_name(),
        }
    }

    pub fn member_tombstoned(type_name: &TypeName, member: impl Into<String>) -> Self {
        BridgeError::MemberTombstoned {
            type_name: type_name.full_name(),
            member: member.into(),
        }
    }

    pub fn instance_tombstoned(type_name: &TypeName) -> Self {
        BridgeError::InstanceTombstoned {
            type_name: type_name.full_name(),
        }
    }

    pub fn attribute_not_found(type_name: &TypeName, attribute: impl Into<String>) -> Self {
        BridgeError::AttributeNotFound {
            type_name: type_name.full_name(),
            attribute: attribute.into(),
        }
    }

    pub fn read_only(type_name: &TypeName, attribute: impl Into<String>) -> Self {
        BridgeError::ReadOnlyAttribute {
            type_name: type_name.full_name(),
            attribute: attribute.into(),
        }
    }

    pub fn not_supported(type_name: &TypeName, operation: impl Into<String>) -> Self {
        BridgeError::NotSupported {
            type_name: type_name.full_name(),
            operation: operation.into(),
        }
    }

    pub fn sealed(type_name: &TypeName) -> Self {
        BridgeError::SealedType {
            type_name: type_name.full_name(),
        }
    }

    pub fn contract(message: impl Into<String>) -> Self {
        BridgeError::ContractViolation {
            message: message.into(),
        }
    }

    pub fn conversion(from: impl Into<String>, to: impl Into<String>) -> Self {
        BridgeError::Conversion {
            from: from.into(),
            to: to.into(),
        }
    }

    pub fn stash(message: impl Into<String>) -> Self {
        BridgeError::Stash {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        BridgeError::Config {
            message: message.into(),
        }
    }

    /// Whether the error reports a type, member or instance lost in a reload
    pub fn is_tombstone(&self) -> bool {
        matches!(
            self,
            BridgeError::TypeTombstoned { .. }
                | BridgeError::MemberTombstoned { .. }
                | BridgeError::InstanceTombstoned { .. }
        )
    }

    /// Whether the error is a consumer bug that must not be retried
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            BridgeError::SealedType { .. } | BridgeError::ContractViolation { .. }
        )
    }

    /// Check if this is a fatal error (cannot continue)
    pub fn is_fatal(&self) -> bool {
        match self {
            BridgeError::Native(err) => err.is_fatal(),
            BridgeError::Panic { .. } => true,
            other => other.is_contract_violation(),
        }
    }

    /// The native exception a native caller sees for this error.
    pub fn to_native_exception(&self) -> NativeException {
        match self {
            BridgeError::Native(NativeError::Exception(exception)) => exception.clone(),
            BridgeError::Native(other) => {
                NativeException::new(ExceptionKind::SystemError, other.to_string())
            }
            BridgeError::Managed(managed) => managed.to_native_exception(),
            BridgeError::AttributeNotFound { .. } | BridgeError::ReadOnlyAttribute { .. } => {
                NativeException::new(ExceptionKind::AttributeError, self.to_string())
            }
            BridgeError::NotSupported { .. }
            | BridgeError::SealedType { .. }
            | BridgeError::Conversion { .. }
            | BridgeError::ArgumentCount { .. }
            | BridgeError::ArgumentBinding { .. }
            | BridgeError::NoMatchingOverload { .. } => {
                NativeException::new(ExceptionKind::TypeError, self.to_string())
            }
            BridgeError::NamespaceNotFound { .. } => {
                NativeException::new(ExceptionKind::ModuleNotFoundError, self.to_string())
            }
            BridgeError::TypeTombstoned { .. }
            | BridgeError::MemberTombstoned { .. }
            | BridgeError::InstanceTombstoned { .. }
            | BridgeError::NotAttached
            | BridgeError::AlreadyAttached
            | BridgeError::ShuttingDown { .. }
            | BridgeError::TypeNotFound { .. }
            | BridgeError::Panic { .. } => {
                NativeException::new(ExceptionKind::RuntimeError, self.to_string())
            }
            BridgeError::ContractViolation { .. }
            | BridgeError::Stash { .. }
            | BridgeError::Config { .. } => {
                NativeException::new(ExceptionKind::SystemError, self.to_string())
            }
        }
    }

    /// Set this error as the pending native exception.
    pub fn raise(&self, native: &dyn NativeApi) {
        native.err_set(&self.to_native_exception());
    }
}

impl From<ManagedException> for BridgeError {
    fn from(exception: ManagedException) -> Self {
        BridgeError::Managed(exception)
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        BridgeError::stash(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_tombstone_messages_name_the_missing_thing() {
        let ty = TypeName::parse("Demo.Counter");
        assert_eq!(
            BridgeError::type_tombstoned(&ty).to_string(),
            "The managed type Demo.Counter no longer exists"
        );
        assert_eq!(
            BridgeError::member_tombstoned(&ty, "M").to_string(),
            "The managed member Demo.Counter.M no longer exists"
        );
    }

    #[test]
    fn test_tombstones_raise_runtime_error() {
        let err = BridgeError::member_tombstoned(&TypeName::parse("Demo.Counter"), "M");
        assert!(err.is_tombstone());
        let exception = err.to_native_exception();
        assert!(exception.is(ExceptionKind::RuntimeError));
        assert!(exception.message.contains("no longer exists"));
    }

    #[test]
    fn test_missing_attribute_raises_attribute_error() {
        let err = BridgeError::attribute_not_found(&TypeName::parse("Demo.Counter"), "Nope");
        assert_eq!(
            err.to_native_exception(),
            NativeException::new(
                ExceptionKind::AttributeError,
                "'Demo.Counter' object has no attribute 'Nope'"
            )
        );
    }

    #[test]
    fn test_native_exception_passes_through() {
        let original = NativeException::new(ExceptionKind::KeyError, "missing");
        let err = BridgeError::from(NativeError::Exception(original.clone()));
        assert_eq!(err.to_native_exception(), original);
    }

    #[test]
    fn test_sealed_is_contract_violation() {
        let err = BridgeError::sealed(&TypeName::parse("System.String"));
        assert!(err.is_contract_violation());
        assert!(err.is_fatal());
        assert!(err.to_native_exception().is(ExceptionKind::TypeError));
    }

    #[test]
    fn test_managed_exception_keeps_stack_trace() {
        let managed = ManagedException::new("System.InvalidOperationException", "bad state")
            .with_stack_trace("at Demo.Counter.Fail()");
        let exception = BridgeError::from(managed).to_native_exception();
        assert!(exception.is(ExceptionKind::ClrError));
        assert_eq!(exception.traceback.as_deref(), Some("at Demo.Counter.Fail()"));
    }
}

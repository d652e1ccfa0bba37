//! Error Types for the Native Surface
//!
//! ## Error Categories
//!
//! - Null handles handed across the boundary
//! - Native exceptions fetched from the interpreter
//! - ABI resolution failures (fatal)
//! - Dynamic library loading

use std::fmt;
use thiserror::Error;

/// Result type for native surface operations
pub type NativeResult<T> = Result<T, NativeError>;

/// Native exception classes the bridge raises or recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExceptionKind {
    TypeError,
    AttributeError,
    KeyError,
    IndexError,
    ValueError,
    StopIteration,
    KeyboardInterrupt,
    RuntimeError,
    NotImplementedError,
    MemoryError,
    ModuleNotFoundError,
    SystemError,
    /// A managed exception surfaced to native callers
    ClrError,
}

impl ExceptionKind {
    /// Name of the native exception type
    pub fn type_name(self) -> &'static str {
        match self {
            ExceptionKind::TypeError => "TypeError",
            ExceptionKind::AttributeError => "AttributeError",
            ExceptionKind::KeyError => "KeyError",
            ExceptionKind::IndexError => "IndexError",
            ExceptionKind::ValueError => "ValueError",
            ExceptionKind::StopIteration => "StopIteration",
            ExceptionKind::KeyboardInterrupt => "KeyboardInterrupt",
            ExceptionKind::RuntimeError => "RuntimeError",
            ExceptionKind::NotImplementedError => "NotImplementedError",
            ExceptionKind::MemoryError => "MemoryError",
            ExceptionKind::ModuleNotFoundError => "ModuleNotFoundError",
            ExceptionKind::SystemError => "SystemError",
            ExceptionKind::ClrError => "ClrError",
        }
    }

    /// Look up a kind by its native type name
    pub fn from_type_name(name: &str) -> Option<Self> {
        const ALL: [ExceptionKind; 13] = [
            ExceptionKind::TypeError,
            ExceptionKind::AttributeError,
            ExceptionKind::KeyError,
            ExceptionKind::IndexError,
            ExceptionKind::ValueError,
            ExceptionKind::StopIteration,
            ExceptionKind::KeyboardInterrupt,
            ExceptionKind::RuntimeError,
            ExceptionKind::NotImplementedError,
            ExceptionKind::MemoryError,
            ExceptionKind::ModuleNotFoundError,
            ExceptionKind::SystemError,
            ExceptionKind::ClrError,
        ];
        ALL.into_iter().find(|kind| kind.type_name() == name)
    }
}

impl fmt::Display for ExceptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.type_name())
    }
}

/// A native exception in transit across the boundary.
///
/// Native errors reach managed callers as this structure. Managed exceptions
/// reach native callers by being raised from it, traceback included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeException {
    /// Native exception type name (e.g. "TypeError")
    pub type_name: String,
    /// Exception message
    pub message: String,
    /// Optional traceback or managed stack trace
    pub traceback: Option<String>,
}

impl NativeException {
    /// Create an exception of a known kind
    pub fn new(kind: ExceptionKind, message: impl Into<String>) -> Self {
        Self {
            type_name: kind.type_name().to_string(),
            message: message.into(),
            traceback: None,
        }
    }

    /// Create an exception with an arbitrary type name
    pub fn named(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            message: message.into(),
            traceback: None,
        }
    }

    /// Attach a traceback
    pub fn with_traceback(mut self, traceback: impl Into<String>) -> Self {
        self.traceback = Some(traceback.into());
        self
    }

    /// The kind, when the type name is one the bridge knows
    pub fn kind(&self) -> Option<ExceptionKind> {
        ExceptionKind::from_type_name(&self.type_name)
    }

    /// Check the exception's type
    pub fn is(&self, kind: ExceptionKind) -> bool {
        self.type_name == kind.type_name()
    }
}

impl fmt::Display for NativeException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.type_name, self.message)
    }
}

/// Native surface error types
#[derive(Error, Debug, Clone)]
pub enum NativeError {
    /// A handle required to be non-null was null
    #[error("null native handle: {context}")]
    NullHandle {
        /// Operation that produced or required the handle
        context: String,
    },

    /// The interpreter raised an exception
    #[error("{0}")]
    Exception(NativeException),

    /// No offset table exists for the running interpreter
    #[error("Python ABI v{version} is not supported")]
    UnsupportedAbi {
        /// Revision string, e.g. "3.6" or "3.13d"
        version: String,
    },

    /// The interpreter reported a version string we cannot read
    #[error("cannot parse interpreter version `{version}`")]
    InvalidVersion { version: String },

    /// A slot name absent from the resolved offset table
    #[error("unknown type slot `{slot}` for ABI {revision}")]
    UnknownSlot { slot: String, revision: String },

    /// No native interpreter has been installed
    #[error("no native interpreter installed")]
    NotInstalled,

    /// Shared library could not be loaded
    #[error("failed to load library `{name}`: {reason}")]
    LibraryLoad { name: String, reason: String },

    /// Symbol missing from a loaded library
    #[error("symbol `{symbol}` not found in `{library}`")]
    SymbolNotFound { symbol: String, library: String },

    /// Native allocation returned nothing
    #[error("native allocation failed: {context}")]
    AllocationFailed { context: String },
}

impl NativeError {
    /// Create a null handle error
    pub fn null_handle(context: impl Into<String>) -> Self {
        NativeError::NullHandle {
            context: context.into(),
        }
    }

    /// Create an exception error
    pub fn exception(kind: ExceptionKind, message: impl Into<String>) -> Self {
        NativeError::Exception(NativeException::new(kind, message))
    }

    /// Create an unsupported ABI error
    pub fn unsupported_abi(version: impl Into<String>) -> Self {
        NativeError::UnsupportedAbi {
            version: version.into(),
        }
    }

    /// Create an invalid version error
    pub fn invalid_version(version: impl Into<String>) -> Self {
        NativeError::InvalidVersion {
            version: version.into(),
        }
    }

    /// Create an unknown slot error
    pub fn unknown_slot(slot: impl Into<String>, revision: impl Into<String>) -> Self {
        NativeError::UnknownSlot {
            slot: slot.into(),
            revision: revision.into(),
        }
    }

    /// Create a library load error
    pub fn library_load(name: impl Into<String>, reason: impl Into<String>) -> Self {
        NativeError::LibraryLoad {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Create a symbol not found error
    pub fn symbol_not_found(symbol: impl Into<String>, library: impl Into<String>) -> Self {
        NativeError::SymbolNotFound {
            symbol: symbol.into(),
            library: library.into(),
        }
    }

    /// Create an allocation failure
    pub fn allocation_failed(context: impl Into<String>) -> Self {
        NativeError::AllocationFailed {
            context: context.into(),
        }
    }

    /// The carried native exception, if any
    pub fn as_exception(&self) -> Option<&NativeException> {
        match self {
            NativeError::Exception(exception) => Some(exception),
            _ => None,
        }
    }

    /// Check if this carries a native exception of `kind`
    pub fn is_exception_of(&self, kind: ExceptionKind) -> bool {
        self.as_exception().is_some_and(|e| e.is(kind))
    }

    /// Errors that make continuing unsafe
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            NativeError::UnsupportedAbi { .. }
                | NativeError::InvalidVersion { .. }
                | NativeError::UnknownSlot { .. }
                | NativeError::NotInstalled
        )
    }
}

impl From<NativeException> for NativeError {
    fn from(exception: NativeException) -> Self {
        NativeError::Exception(exception)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_exception_kind_round_trips_type_name() {
        assert_eq!(
            ExceptionKind::from_type_name("KeyboardInterrupt"),
            Some(ExceptionKind::KeyboardInterrupt)
        );
        assert_eq!(ExceptionKind::from_type_name("FancyError"), None);
    }

    #[test]
    fn test_native_exception_display() {
        let exc = NativeException::new(ExceptionKind::TypeError, "bad operand")
            .with_traceback("  at Foo.Bar()");
        assert_eq!(exc.to_string(), "TypeError: bad operand");
        assert_eq!(exc.kind(), Some(ExceptionKind::TypeError));
        assert_eq!(exc.traceback.as_deref(), Some("  at Foo.Bar()"));
    }

    #[test]
    fn test_unsupported_abi_is_fatal() {
        let err = NativeError::unsupported_abi("3.6");
        assert!(err.is_fatal());
        assert_eq!(err.to_string(), "Python ABI v3.6 is not supported");
    }

    #[test]
    fn test_exception_classification() {
        let err = NativeError::exception(ExceptionKind::StopIteration, "");
        assert!(err.is_exception_of(ExceptionKind::StopIteration));
        assert!(!err.is_exception_of(ExceptionKind::TypeError));
        assert!(!err.is_fatal());
    }
}

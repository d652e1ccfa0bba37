//! # pyclr native
//!
//! The native half of the pyclr bridge: everything that touches the
//! reference-counted interpreter directly.
//!
//! ## Overview
//!
//! - Reference ownership encoded in move-only handle types
//! - The injected interpreter call surface ([`NativeApi`])
//! - Per-revision type-object offset tables
//! - The interpreter lock discipline
//! - Deferred releases for references dropped without the lock
//! - Interpreter library discovery
//!
//! ## Module Structure
//!
//! - [`handle`]: Borrowed, owned and stolen references
//! - [`api`]: The native call surface and its process-wide installation
//! - [`abi`]: Version detection and offset tables
//! - [`gil`]: Lock acquisition, allow-threads brackets, interrupts
//! - [`finalizer`]: Pending-release queue
//! - [`loader`]: Dynamic library loading
//! - [`ffi`]: Raw slot signatures and type flags
//! - [`error`]: Error types and native exception transport

pub mod abi;
pub mod api;
pub mod error;
pub mod ffi;
pub mod finalizer;
pub mod gil;
pub mod handle;
pub mod loader;

// Re-export main types for convenience
pub use abi::{AbiRevision, PythonVersion, SlotLocation, TypeOffsets};
pub use api::{BuiltinKind, CompareOp, GilToken, NativeApi, NumberOp, ThreadStateToken};
pub use error::{ExceptionKind, NativeError, NativeException, NativeResult};
pub use ffi::PyObject;
pub use finalizer::Finalizer;
pub use gil::{GilGuard, GilState};
pub use handle::{BorrowedRef, NativeObject, OwnedRef, StolenRef};
pub use loader::{LibraryHandle, LibraryLoader, SharedLibraryLoader};

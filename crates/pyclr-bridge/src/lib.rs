//! # pyclr bridge
//!
//! Exposes managed objects to a reference-counted native interpreter as
//! first-class native objects, and survives managed reloads by stashing the
//! bridge graph inside the interpreter.
//!
//! ## Overview
//!
//! - Managed types are projected into native heap types whose slots dispatch
//!   back into the managed member tables
//! - Each bridge object stores a registry handle in its trailing slot
//! - Types and members that disappear across a reload become tombstones that
//!   raise a clear error instead of crashing
//!
//! ## Module Structure
//!
//! - [`engine`]: Attach, detach and type projection
//! - [`bridge`]: Wrapping, unwrapping and deallocation of bridge objects
//! - [`registry`]: Handle-keyed registry of live bridge objects
//! - [`projection`]: Type descriptors, member binding and slot adapters
//! - [`stash`]: Reload stash and restore
//! - [`managed`]: The managed object model and domains
//! - [`maybe`]: Type and member references that survive reloads
//! - [`generics`]: Arity-qualified generic name registry
//! - [`imports`]: Namespace import state
//! - [`convert`]: Value conversion across the boundary
//! - [`codecs`]: Custom encoders and decoders consulted by conversion
//! - [`config`]: Engine configuration
//! - [`error`]: Error types

pub mod bridge;
pub mod codecs;
pub mod config;
pub mod convert;
pub mod engine;
pub mod error;
pub mod generics;
pub mod imports;
pub mod managed;
pub mod maybe;
pub mod projection;
pub mod registry;
pub mod stash;

// Re-export main types for convenience
pub use bridge::WeakBridge;
pub use codecs::{CodecRegistry, Decoder, Encoder};
pub use config::BridgeConfig;
pub use engine::{method_binding_name, Engine, ShutdownMode};
pub use error::{BridgeError, BridgeResult};
pub use generics::GenericRegistry;
pub use imports::ImportState;
pub use managed::{
    downcast, Domain, InstanceId, ManagedException, ManagedObject, ManagedRef, ManagedType, Member, MemberKind,
    Param, StaticDomain, TypeBuilder, TypeName, Value, Visibility,
};
pub use maybe::{MaybeMember, MaybeType, MemberRef};
pub use projection::{BindingFilter, DescriptorKind, Projection, SlotKind, TypeCache, TypeDescriptor};
pub use registry::{HandleId, OverloadFilter};
pub use stash::{RestoreStats, StashStats};

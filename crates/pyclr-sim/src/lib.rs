//! # pyclr sim
//!
//! An in-memory interpreter implementing the native surface of `pyclr-native`,
//! so the bridge can be driven without loading a real interpreter library.
//!
//! Objects are real allocations laid out per the resolved offset table, so
//! slot tables written by the bridge are read back and called exactly as a
//! native interpreter would. Values live in a side table keyed by address.
//!
//! ## Module Structure
//!
//! - [`interp`]: The interpreter and its native surface
//! - [`object`]: Object memory, payloads and built-in addresses
//! - [`gil`]: The simulated interpreter lock

pub mod gil;
pub mod interp;
pub mod object;

pub use interp::{SimConfig, SimInterpreter};
pub use object::{Builtins, Payload, SimFunction};

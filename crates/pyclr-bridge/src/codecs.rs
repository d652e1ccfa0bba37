//! Conversion codecs.
//!
//! An [`Encoder`] turns managed instances of chosen types into plain native
//! objects instead of bridge objects. A [`Decoder`] turns native objects the
//! bridge has no conversion for into managed values. Both are consulted in
//! registration order; the first result wins.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use pyclr_native::{gil, BorrowedRef, OwnedRef};
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::engine::Engine;
use crate::error::BridgeResult;
use crate::managed::{ManagedRef, TypeName, Value};

pub trait Encoder: Send + Sync {
    fn can_encode(&self, type_name: &TypeName) -> bool;

    /// `Ok(None)` passes the instance on to the next encoder.
    fn try_encode(&self, engine: &Engine, instance: &ManagedRef) -> BridgeResult<Option<OwnedRef>>;
}

pub trait Decoder: Send + Sync {
    /// `native_type` is the name of the object's native type.
    fn can_decode(&self, native_type: &str) -> bool;

    /// `Ok(None)` passes the object on to the next decoder.
    fn try_decode(&self, engine: &Engine, ob: BorrowedRef<'_>) -> BridgeResult<Option<Value>>;
}

type EncoderList = Arc<[Arc<dyn Encoder>]>;

#[derive(Default)]
pub struct CodecRegistry {
    encoders: Vec<Arc<dyn Encoder>>,
    decoders: Vec<Arc<dyn Decoder>>,
    /// Applicable encoders per managed type, filled on first use
    by_type: Mutex<FxHashMap<TypeName, EncoderList>>,
}

impl CodecRegistry {
    pub fn register_encoder(&mut self, encoder: Arc<dyn Encoder>) {
        self.encoders.push(encoder);
        self.by_type.get_mut().clear();
    }

    pub fn register_decoder(&mut self, decoder: Arc<dyn Decoder>) {
        self.decoders.push(decoder);
    }

    pub fn has_encoders(&self) -> bool {
        !self.encoders.is_empty()
    }

    pub fn has_decoders(&self) -> bool {
        !self.decoders.is_empty()
    }

    pub fn encoders_for(&self, type_name: &TypeName) -> EncoderList {
        let mut by_type = self.by_type.lock();
        if let Some(found) = by_type.get(type_name) {
            return Arc::clone(found);
        }
        let found: EncoderList = self
            .encoders
            .iter()
            .filter(|encoder| encoder.can_encode(type_name))
            .cloned()
            .collect();
        by_type.insert(type_name.clone(), Arc::clone(&found));
        found
    }

    pub fn decoders_for(&self, native_type: &str) -> Vec<Arc<dyn Decoder>> {
        self.decoders
            .iter()
            .filter(|decoder| decoder.can_decode(native_type))
            .cloned()
            .collect()
    }
}

impl fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodecRegistry")
            .field("encoders", &self.encoders.len())
            .field("decoders", &self.decoders.len())
            .finish()
    }
}

impl Engine {
    pub fn register_encoder(&self, encoder: Arc<dyn Encoder>) {
        let mut codecs = self.codecs.write();
        codecs.register_encoder(encoder);
        debug!(codecs = ?*codecs, "encoder registered");
    }

    pub fn register_decoder(&self, decoder: Arc<dyn Decoder>) {
        let mut codecs = self.codecs.write();
        codecs.register_decoder(decoder);
        debug!(codecs = ?*codecs, "decoder registered");
    }

    /// The native form an encoder gives `instance`, if any.
    pub(crate) fn encode(&self, instance: &ManagedRef) -> BridgeResult<Option<OwnedRef>> {
        let encoders = {
            let codecs = self.codecs.read();
            if !codecs.has_encoders() {
                return Ok(None);
            }
            codecs.encoders_for(&instance.type_name())
        };
        gil::assert_held("encode");
        for encoder in encoders.iter() {
            if let Some(encoded) = encoder.try_encode(self, instance)? {
                return Ok(Some(encoded));
            }
        }
        Ok(None)
    }

    /// The managed value a decoder gives `ob`, if any.
    pub(crate) fn decode(&self, ob: BorrowedRef<'_>) -> BridgeResult<Option<Value>> {
        let decoders = {
            let codecs = self.codecs.read();
            if !codecs.has_decoders() {
                return Ok(None);
            }
            let native = self.native();
            codecs.decoders_for(&native.type_name(native.type_of(ob)))
        };
        gil::assert_held("decode");
        for decoder in decoders {
            if let Some(value) = decoder.try_decode(self, ob)? {
                return Ok(Some(value));
            }
        }
        Ok(None)
    }
}

//! Bridge Engine
//!
//! The process-wide service that owns the bridge registry, the descriptor
//! cache and the extension state (generic names, imported namespaces).
//!
//! ## Lifecycle
//!
//! 1. [`Engine::initialize`] installs the native surface, resolves the ABI
//!    offset table and restores a stashed bridge graph if one is waiting
//! 2. Slot adapters reach the engine through [`Engine::current`]
//! 3. [`Engine::shutdown`] blocks creation, stashes on
//!    [`ShutdownMode::Reload`], and detaches
//!
//! Every operation that touches native objects or the registry requires the
//! interpreter lock; debug builds assert it.

use std::fmt;
use std::sync::Arc;

use parking_lot::{const_mutex, const_rwlock, Mutex, RwLock};
use pyclr_native::ffi::write_word;
use pyclr_native::loader::{locate_interpreter, open_interpreter, LibraryHandle, LibraryLoader, SharedLibraryLoader};
use pyclr_native::{
    abi, api, gil, AbiRevision, Finalizer, GilGuard, NativeApi, NativeObject, PyObject, PythonVersion, TypeOffsets,
};
use smol_str::SmolStr;
use tracing::{debug, info, instrument, warn};

use crate::codecs::CodecRegistry;
use crate::config::BridgeConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::generics::GenericRegistry;
use crate::imports::ImportState;
use crate::managed::{Domain, ManagedType, TypeName};
use crate::projection::{layout, BindingFilter, DescriptorKind, DescriptorState, Projection, SlotKind, TypeCache, TypeDescriptor};
use crate::registry::BridgeRegistry;
use crate::stash::{self, RestoreStats, StashStats};

static ENGINE: RwLock<Option<Arc<Engine>>> = const_rwlock(None);

/// Serializes attach and detach.
static LIFECYCLE: Mutex<()> = const_mutex(());

/// How the managed runtime is leaving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Final detach; projected types are released
    Normal,
    /// Detach for a reload; the bridge graph is stashed for the next attach
    Reload,
}

/// Name of the bridge-defined bound-method type
pub fn method_binding_name() -> TypeName {
    TypeName::new("pyclr", "MethodBinding")
}

fn same_surface(a: &Arc<dyn NativeApi>, b: &Arc<dyn NativeApi>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

/// Open the configured interpreter library, or locate it by version, and
/// check its entry points.
fn open_library(
    loader: &dyn LibraryLoader,
    config: &BridgeConfig,
    native: &dyn NativeApi,
    revision: AbiRevision,
) -> BridgeResult<LibraryHandle> {
    let library = match &config.library_path {
        Some(path) => open_interpreter(loader, path)?,
        None => {
            let version = PythonVersion::parse(&native.version())?;
            locate_interpreter(loader, version, revision.debug)?
        }
    };
    debug!(library = library.name(), "interpreter library verified");
    Ok(library)
}

pub struct Engine {
    config: BridgeConfig,
    native: Arc<dyn NativeApi>,
    offsets: &'static TypeOffsets,
    domain: Arc<dyn Domain>,
    filter: BindingFilter,
    pub(crate) registry: Mutex<BridgeRegistry>,
    pub(crate) types: TypeCache,
    pub(crate) generics: RwLock<GenericRegistry>,
    pub(crate) imports: Mutex<ImportState>,
    pub(crate) codecs: RwLock<CodecRegistry>,
    loader: Arc<dyn LibraryLoader>,
    library: Mutex<Option<LibraryHandle>>,
    last_restore: Option<RestoreStats>,
}

impl Engine {
    /// Attach a managed domain to the native interpreter.
    pub fn initialize(
        native: Arc<dyn NativeApi>,
        domain: Arc<dyn Domain>,
        config: BridgeConfig,
    ) -> BridgeResult<Arc<Engine>> {
        Self::initialize_with_loader(native, domain, config, Arc::new(SharedLibraryLoader))
    }

    /// Attach, checking the interpreter library through `loader` when
    /// [`BridgeConfig::verify_library`] is set.
    #[instrument(skip_all, fields(domain = domain.name()))]
    pub fn initialize_with_loader(
        native: Arc<dyn NativeApi>,
        domain: Arc<dyn Domain>,
        config: BridgeConfig,
        loader: Arc<dyn LibraryLoader>,
    ) -> BridgeResult<Arc<Engine>> {
        config.validate()?;
        // lock order: interpreter lock, then LIFECYCLE
        let _gil = GilGuard::acquire_with(Arc::clone(&native));
        let _lifecycle = LIFECYCLE.lock();
        if ENGINE.read().is_some() {
            return Err(BridgeError::AlreadyAttached);
        }
        if !api::is_current(&native) {
            api::install(Arc::clone(&native));
        }
        let offsets = abi::resolve(native.as_ref())?;
        let library = if config.verify_library {
            Some(open_library(loader.as_ref(), &config, native.as_ref(), offsets.revision())?)
        } else {
            None
        };

        let finalizer = Finalizer::global();
        finalizer.set_threshold(config.finalizer_threshold);
        finalizer.set_enabled(config.finalizer_enabled);

        let mut engine = Engine {
            filter: BindingFilter::new(config.bind_non_public),
            config,
            native,
            offsets,
            domain,
            loader,
            library: Mutex::new(library),
            registry: Mutex::new(BridgeRegistry::new()),
            types: TypeCache::default(),
            generics: RwLock::new(GenericRegistry::new()),
            imports: Mutex::new(ImportState::default()),
            codecs: RwLock::new(CodecRegistry::default()),
            last_restore: None,
        };
        let types = engine.domain.types();
        let generics = engine
            .generics
            .get_mut()
            .register_all(types.iter().map(|ty| ty.name()));

        let attached = engine.attach_state();
        if let Err(err) = attached {
            engine.release_library();
            return Err(err);
        }

        let engine = Arc::new(engine);
        *ENGINE.write() = Some(Arc::clone(&engine));
        info!(
            revision = %offsets.revision(),
            generics,
            restored = engine.last_restore.is_some(),
            library = engine.interpreter_library().as_deref(),
            "managed runtime attached"
        );
        Ok(engine)
    }

    fn attach_state(&mut self) -> BridgeResult<()> {
        self.last_restore = if self.config.restore_on_attach {
            stash::restore(self)?
        } else {
            if stash::discard(self.native.as_ref(), &self.config.stash_slot)? {
                warn!("discarded a stashed bridge graph; restore_on_attach is off");
            }
            None
        };
        self.ensure_method_binding()?;
        Ok(())
    }

    /// Detach the attached engine. Returns the stash statistics on reload.
    #[instrument]
    pub fn shutdown(mode: ShutdownMode) -> BridgeResult<Option<StashStats>> {
        loop {
            let Some(observed) = Self::try_current() else {
                return Ok(None);
            };
            // lock order: interpreter lock, then LIFECYCLE
            let _gil = GilGuard::acquire_with(Arc::clone(&observed.native));
            let _lifecycle = LIFECYCLE.lock();
            let Some(engine) = ENGINE.read().clone() else {
                return Ok(None);
            };
            if !same_surface(&engine.native, &observed.native) {
                // re-attached to another interpreter in between
                continue;
            }
            return engine.detach(mode);
        }
    }

    fn detach(&self, mode: ShutdownMode) -> BridgeResult<Option<StashStats>> {
        self.registry.lock().block_creation();
        Finalizer::global().collect(self.native.as_ref());

        let stashed = match mode {
            ShutdownMode::Reload => stash::stash(self).map(Some),
            ShutdownMode::Normal => Ok(None),
        };
        *ENGINE.write() = None;
        let released = match &stashed {
            Ok(Some(_)) => ShutdownMode::Reload,
            _ => ShutdownMode::Normal,
        };
        if let Err(err) = &stashed {
            warn!(%err, "stash failed; detaching without it");
        }
        self.teardown(released);
        info!(?mode, "managed runtime detached");
        stashed
    }

    fn release_library(&self) {
        if let Some(library) = self.library.lock().take() {
            debug!(library = library.name(), "releasing interpreter library");
            self.loader.free(library);
        }
    }

    /// Drop every registry entry and cached descriptor.
    fn teardown(&self, mode: ShutdownMode) {
        let entries = self.registry.lock().drain();
        if mode == ShutdownMode::Normal {
            for entry in &entries {
                // SAFETY: registered objects stay alive until their dealloc
                // removes them, and the registry was just emptied under the lock.
                unsafe {
                    write_word(
                        entry.address as *mut PyObject,
                        entry.descriptor.bridge_slot_offset(),
                        0,
                    )
                };
            }
        }
        let objects = entries.len();
        drop(entries);

        let descriptors = self.types.drain();
        for descriptor in &descriptors {
            descriptor.set_state(DescriptorState::Tombstone {
                reason: "managed runtime detached".to_string(),
            });
            // after a reload stash the reference already belongs to the blob
            drop(descriptor.take_type_ref());
        }
        self.generics.write().reset();
        self.imports.lock().clear();
        self.release_library();
        debug!(objects, types = descriptors.len(), ?mode, "engine state released");
    }

    pub fn current() -> BridgeResult<Arc<Engine>> {
        Self::try_current().ok_or(BridgeError::NotAttached)
    }

    pub fn try_current() -> Option<Arc<Engine>> {
        ENGINE.read().clone()
    }

    pub fn is_attached() -> bool {
        ENGINE.read().is_some()
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn native(&self) -> &Arc<dyn NativeApi> {
        &self.native
    }

    pub fn offsets(&self) -> &'static TypeOffsets {
        self.offsets
    }

    pub fn domain(&self) -> &Arc<dyn Domain> {
        &self.domain
    }

    pub fn filter(&self) -> &BindingFilter {
        &self.filter
    }

    pub fn types(&self) -> &TypeCache {
        &self.types
    }

    /// Name of the checked interpreter library, when verification ran
    pub fn interpreter_library(&self) -> Option<String> {
        self.library.lock().as_ref().map(|library| library.name().to_string())
    }

    /// Statistics of the restore performed at attach, if any
    pub fn last_restore(&self) -> Option<RestoreStats> {
        self.last_restore
    }

    /// Number of registered bridge objects
    pub fn live_bridges(&self) -> usize {
        self.registry.lock().len()
    }

    /// Distinct managed instances kept alive by bridge objects
    pub fn live_instances(&self) -> usize {
        self.registry.lock().live_instances()
    }

    pub fn generic_names(&self) -> GenericRegistry {
        self.generics.read().clone()
    }

    pub(crate) fn ensure_creation_allowed(&self, what: &str) -> BridgeResult<()> {
        if self.registry.lock().is_blocked() {
            Err(BridgeError::shutting_down(what))
        } else {
            Ok(())
        }
    }

    // ========================================================================
    // Projection
    // ========================================================================

    /// The descriptor for a managed type, synthesizing it on first use.
    pub fn project(&self, name: &TypeName) -> BridgeResult<Arc<TypeDescriptor>> {
        if let Some(descriptor) = self.types.get(name) {
            return Ok(descriptor);
        }
        gil::assert_held("project");
        self.ensure_creation_allowed("projected types")?;
        let ty = self
            .domain
            .resolve(name)
            .ok_or_else(|| BridgeError::type_not_found(name))?;
        self.synthesize(name.clone(), ty, None)
    }

    /// Synthesize a subclass of a projected type under a new name.
    pub fn derive(&self, base: &TypeName, name: &TypeName) -> BridgeResult<Arc<TypeDescriptor>> {
        let base_descriptor = self.project(base)?;
        let projection = base_descriptor.projection()?;
        if base_descriptor.is_sealed() {
            return Err(BridgeError::sealed(base));
        }
        if let Some(existing) = self.types.get(name) {
            return Ok(existing);
        }
        self.synthesize(
            name.clone(),
            Arc::clone(projection.managed_type()),
            Some(&base_descriptor),
        )
    }

    /// Resolve an arity-qualified generic name and project it.
    pub fn resolve_generic(&self, namespace: &str, base: &str, arity: usize) -> BridgeResult<Arc<TypeDescriptor>> {
        let name = self
            .generics
            .read()
            .generic_by_name(namespace, base, arity)
            .ok_or_else(|| BridgeError::TypeNotFound {
                type_name: format!("{namespace}.{base}`{arity}"),
            })?;
        self.project(&name)
    }

    /// Allocate and ready a heap type object with adapters for `kinds`.
    fn allocate_type(
        &self,
        name: &TypeName,
        slot_offset: usize,
        kinds: &[SlotKind],
        sealed: bool,
        base: Option<&TypeDescriptor>,
    ) -> BridgeResult<(NativeObject, usize)> {
        let basicsize = slot_offset + self.offsets.word_size();
        let type_ref = self.native.alloc_type(&name.full_name(), basicsize)?;
        let ty = type_ref.as_ptr();
        layout::install_sub_tables(self.offsets, ty)?;
        if let Some(base) = base {
            // tp_base holds its own reference
            let base_ref = base.type_borrowed()?.to_owned();
            layout::set_base(self.offsets, ty, base_ref.into_raw())?;
        }
        layout::bind_slots(self.offsets, ty, kinds, sealed)?;
        self.native.type_ready(type_ref.borrow())?;
        Ok((type_ref.into_managed(), basicsize))
    }

    #[instrument(skip(self, ty, base), fields(type_name = %name))]
    fn synthesize(
        &self,
        name: TypeName,
        ty: Arc<ManagedType>,
        base: Option<&Arc<TypeDescriptor>>,
    ) -> BridgeResult<Arc<TypeDescriptor>> {
        let projection = Projection::build(Arc::clone(&ty), &self.filter);
        let kinds = projection.slot_kinds();
        let sealed = base.is_none() && ty.is_sealed();
        let slot_offset = match base {
            Some(base) => base.bridge_slot_offset(),
            None => self.offsets.object_header_size(),
        };
        let (type_ref, basicsize) =
            self.allocate_type(&name, slot_offset, &kinds, sealed, base.map(|base| base.as_ref()))?;
        debug!(slots = kinds.len(), basicsize, sealed, "synthesized projected type");
        let descriptor = TypeDescriptor::new(
            name,
            ty.name().clone(),
            DescriptorKind::Class,
            type_ref,
            basicsize,
            slot_offset,
            self.offsets.revision(),
            DescriptorState::Projected(Arc::new(projection)),
        );
        Ok(self.types.insert(Arc::new(descriptor)))
    }

    fn ensure_method_binding(&self) -> BridgeResult<Arc<TypeDescriptor>> {
        let name = method_binding_name();
        if let Some(existing) = self.types.get(&name) {
            return Ok(existing);
        }
        let slot_offset = self.offsets.object_header_size();
        let (type_ref, basicsize) = self.allocate_type(&name, slot_offset, &SlotKind::METHOD_BINDING, true, None)?;
        let descriptor = TypeDescriptor::new(
            name.clone(),
            name,
            DescriptorKind::MethodBinding,
            type_ref,
            basicsize,
            slot_offset,
            self.offsets.revision(),
            DescriptorState::Extension,
        );
        Ok(self.types.insert(Arc::new(descriptor)))
    }

    pub(crate) fn method_binding(&self) -> BridgeResult<Arc<TypeDescriptor>> {
        self.types
            .get(&method_binding_name())
            .ok_or_else(|| BridgeError::contract("bound-method type was not synthesized"))
    }

    // ========================================================================
    // Threads
    // ========================================================================

    /// Post a keyboard interrupt to a native thread. Requires the lock.
    pub fn interrupt(&self, thread_id: u64) -> BridgeResult<bool> {
        Ok(gil::interrupt(thread_id)?)
    }

    pub fn imported_namespaces(&self) -> Vec<SmolStr> {
        self.imports.lock().namespaces()
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("domain", &self.domain.name())
            .field("revision", &self.offsets.revision())
            .field("types", &self.types.len())
            .field("bridges", &self.live_bridges())
            .finish()
    }
}

//! Dynamic library resolution.
//!
//! Locating the interpreter library and its entry points is delegated to a
//! [`LibraryLoader`]. [`SharedLibraryLoader`] covers Linux, macOS and Windows
//! through `libloading`.

use std::ffi::c_void;
use std::fmt;
use std::ptr::NonNull;

use libloading::{Library, Symbol};
use tracing::{debug, warn};

use crate::abi::PythonVersion;
use crate::error::{NativeError, NativeResult};

/// Entry points the bridge cannot start without.
pub const REQUIRED_SYMBOLS: &[&str] = &[
    "Py_GetVersion",
    "Py_IncRef",
    "Py_DecRef",
    "PyGILState_Ensure",
    "PyGILState_Release",
    "PyEval_SaveThread",
    "PyEval_RestoreThread",
    "PyThreadState_SetAsyncExc",
    "PyType_GenericAlloc",
    "PyType_Ready",
    "PyErr_Fetch",
    "PyErr_SetString",
    "PySys_GetObject",
    "PySys_SetObject",
    "PyCapsule_New",
    "PyCapsule_GetPointer",
    "PyDict_New",
    "PyDict_SetItemString",
    "PyDict_Next",
    "PyObject_Call",
];

/// An open shared library.
pub struct LibraryHandle {
    name: String,
    library: Option<Library>,
}

impl LibraryHandle {
    /// A handle with no OS library behind it, for loaders that resolve
    /// symbols themselves.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            library: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn library(&self) -> Option<&Library> {
        self.library.as_ref()
    }
}

impl fmt::Debug for LibraryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LibraryHandle")
            .field("name", &self.name)
            .field("open", &self.library.is_some())
            .finish()
    }
}

/// OS-specific shared library loading.
pub trait LibraryLoader: Send + Sync {
    fn load(&self, name: &str) -> NativeResult<LibraryHandle>;

    fn symbol(&self, library: &LibraryHandle, name: &str) -> NativeResult<NonNull<c_void>>;

    fn free(&self, library: LibraryHandle);
}

/// Loader over the platform's dynamic linker.
#[derive(Debug, Default, Clone, Copy)]
pub struct SharedLibraryLoader;

impl LibraryLoader for SharedLibraryLoader {
    fn load(&self, name: &str) -> NativeResult<LibraryHandle> {
        // SAFETY: loading runs the library's initializers, which is what
        // attaching to the interpreter library requires.
        let library = unsafe { Library::new(name) }.map_err(|err| NativeError::library_load(name, err.to_string()))?;
        debug!(library = name, "loaded shared library");
        Ok(LibraryHandle {
            name: name.to_string(),
            library: Some(library),
        })
    }

    fn symbol(&self, library: &LibraryHandle, name: &str) -> NativeResult<NonNull<c_void>> {
        let missing = || NativeError::symbol_not_found(name, library.name());
        let inner = library.library().ok_or_else(missing)?;
        let mut symbol_name = Vec::with_capacity(name.len() + 1);
        symbol_name.extend_from_slice(name.as_bytes());
        symbol_name.push(0);
        // SAFETY: the symbol is only read as an address here, never called.
        let symbol: Symbol<'_, *mut c_void> = unsafe { inner.get(&symbol_name) }.map_err(|_| missing())?;
        NonNull::new(*symbol).ok_or_else(missing)
    }

    fn free(&self, library: LibraryHandle) {
        let LibraryHandle { name, library } = library;
        if let Some(inner) = library {
            if let Err(err) = inner.close() {
                warn!(library = %name, %err, "failed to close shared library");
            }
        }
    }
}

/// File name of the interpreter library on this platform.
pub fn library_file_name(version: PythonVersion, debug: bool) -> String {
    let stem = if cfg!(target_os = "windows") {
        format!("python{}{}{}", version.major, version.minor, if debug { "_d" } else { "" })
    } else {
        format!("python{}.{}{}", version.major, version.minor, if debug { "d" } else { "" })
    };
    libloading::library_filename(stem).to_string_lossy().into_owned()
}

/// Fail unless every required entry point resolves. The library is freed
/// on failure.
pub fn check_symbols(loader: &dyn LibraryLoader, library: LibraryHandle) -> NativeResult<LibraryHandle> {
    for symbol in REQUIRED_SYMBOLS {
        if let Err(err) = loader.symbol(&library, symbol) {
            loader.free(library);
            return Err(err);
        }
    }
    Ok(library)
}

/// Open the interpreter library at `name` and check its entry points.
pub fn open_interpreter(loader: &dyn LibraryLoader, name: &str) -> NativeResult<LibraryHandle> {
    check_symbols(loader, loader.load(name)?)
}

/// Load the interpreter library for `version` and check its entry points.
///
/// Tries the plain file name first, then the versioned `.so.1.0` name used by
/// most Linux distributions.
pub fn locate_interpreter(
    loader: &dyn LibraryLoader,
    version: PythonVersion,
    debug: bool,
) -> NativeResult<LibraryHandle> {
    let primary = library_file_name(version, debug);
    let library = match loader.load(&primary) {
        Ok(library) => library,
        Err(first) if primary.ends_with(".so") => {
            loader.load(&format!("{primary}.1.0")).map_err(|_| first)?
        }
        Err(err) => return Err(err),
    };
    check_symbols(loader, library)
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;

    /// Loader that knows a fixed set of libraries and symbols.
    struct TableLoader {
        libraries: Vec<String>,
        symbols: Vec<&'static str>,
        freed: Mutex<Vec<String>>,
    }

    impl TableLoader {
        fn new(libraries: &[&str], symbols: &[&'static str]) -> Self {
            Self {
                libraries: libraries.iter().map(|name| name.to_string()).collect(),
                symbols: symbols.to_vec(),
                freed: Mutex::new(Vec::new()),
            }
        }
    }

    impl LibraryLoader for TableLoader {
        fn load(&self, name: &str) -> NativeResult<LibraryHandle> {
            if self.libraries.iter().any(|library| library == name) {
                Ok(LibraryHandle::named(name))
            } else {
                Err(NativeError::library_load(name, "not found"))
            }
        }

        fn symbol(&self, library: &LibraryHandle, name: &str) -> NativeResult<NonNull<c_void>> {
            if self.symbols.iter().any(|symbol| *symbol == name) {
                Ok(NonNull::dangling())
            } else {
                Err(NativeError::symbol_not_found(name, library.name()))
            }
        }

        fn free(&self, library: LibraryHandle) {
            self.freed.lock().push(library.name().to_string());
        }
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn test_library_file_name_linux() {
        assert_eq!(library_file_name(PythonVersion::new(3, 8, 10), false), "libpython3.8.so");
        assert_eq!(library_file_name(PythonVersion::new(3, 11, 0), true), "libpython3.11d.so");
    }

    #[test]
    #[cfg(target_os = "macos")]
    fn test_library_file_name_macos() {
        assert_eq!(library_file_name(PythonVersion::new(3, 10, 4), false), "libpython3.10.dylib");
    }

    #[test]
    #[cfg(target_os = "windows")]
    fn test_library_file_name_windows() {
        assert_eq!(library_file_name(PythonVersion::new(3, 12, 1), false), "python312.dll");
        assert_eq!(library_file_name(PythonVersion::new(3, 12, 1), true), "python312_d.dll");
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn test_locate_falls_back_to_versioned_name() {
        let loader = TableLoader::new(&["libpython3.9.so.1.0"], REQUIRED_SYMBOLS);
        let library = locate_interpreter(&loader, PythonVersion::new(3, 9, 2), false).unwrap();
        assert_eq!(library.name(), "libpython3.9.so.1.0");
    }

    #[test]
    fn test_locate_rejects_missing_symbols() {
        let name = library_file_name(PythonVersion::new(3, 10, 0), false);
        let loader = TableLoader::new(&[name.as_str()], &["Py_GetVersion"]);
        let err = locate_interpreter(&loader, PythonVersion::new(3, 10, 0), false).unwrap_err();
        assert!(matches!(err, NativeError::SymbolNotFound { .. }));
        assert_eq!(loader.freed.lock().as_slice(), &[name]);
    }

    #[test]
    fn test_open_interpreter_by_path() {
        let loader = TableLoader::new(&["/opt/python/lib/libpython3.11.so"], REQUIRED_SYMBOLS);
        let library = open_interpreter(&loader, "/opt/python/lib/libpython3.11.so").unwrap();
        assert!(library.library().is_none());
        assert!(open_interpreter(&loader, "/missing/libpython3.11.so").is_err());
    }

    #[test]
    fn test_shared_loader_reports_missing_library() {
        let err = SharedLibraryLoader.load("libpyclr-definitely-missing.so").unwrap_err();
        assert!(matches!(err, NativeError::LibraryLoad { .. }));
    }

    #[test]
    fn test_named_handle_has_no_symbols() {
        let handle = LibraryHandle::named("embedded");
        let err = SharedLibraryLoader.symbol(&handle, "Py_IncRef").unwrap_err();
        assert!(matches!(err, NativeError::SymbolNotFound { .. }));
    }
}

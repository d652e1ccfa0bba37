//! Bridge configuration.

use std::fs;
use std::path::Path;

use pyclr_native::Finalizer;
use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, BridgeResult};

/// Settings read once when the engine attaches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// `sys` attribute holding the stash blob between attaches
    pub stash_slot: String,
    /// Restore a stashed bridge graph when attaching
    pub restore_on_attach: bool,
    /// Pending releases that trigger a collection on lock acquisition
    pub finalizer_threshold: usize,
    pub finalizer_enabled: bool,
    /// Project non-public members too
    pub bind_non_public: bool,
    /// Reuse the live bridge object when wrapping the same instance again
    pub identity_cache: bool,
    /// Check the interpreter library exports the required entry points
    /// before attaching
    pub verify_library: bool,
    /// Interpreter library to check; located by version when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub library_path: Option<String>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            stash_slot: "clr_data".to_string(),
            restore_on_attach: true,
            finalizer_threshold: Finalizer::DEFAULT_THRESHOLD,
            finalizer_enabled: true,
            bind_non_public: false,
            identity_cache: true,
            verify_library: false,
            library_path: None,
        }
    }
}

impl BridgeConfig {
    pub fn from_toml_str(source: &str) -> BridgeResult<Self> {
        let config: BridgeConfig = toml::from_str(source).map_err(|err| BridgeError::config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> BridgeResult<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|err| BridgeError::config(format!("{}: {err}", path.display())))?;
        Self::from_toml_str(&content)
    }

    pub fn to_toml_string(&self) -> BridgeResult<String> {
        toml::to_string_pretty(self).map_err(|err| BridgeError::config(err.to_string()))
    }

    pub fn validate(&self) -> BridgeResult<()> {
        if self.stash_slot.is_empty() {
            return Err(BridgeError::config("stash_slot must not be empty"));
        }
        if !self
            .stash_slot
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
            || self.stash_slot.starts_with(|c: char| c.is_ascii_digit())
        {
            return Err(BridgeError::config(format!(
                "stash_slot `{}` is not a valid attribute name",
                self.stash_slot
            )));
        }
        if self.finalizer_threshold == 0 {
            return Err(BridgeError::config("finalizer_threshold must be at least 1"));
        }
        if self.library_path.as_deref().map_or(false, |path| path.trim().is_empty()) {
            return Err(BridgeError::config("library_path must not be empty"));
        }
        Ok(())
    }

    pub fn with_stash_slot(mut self, slot: impl Into<String>) -> Self {
        self.stash_slot = slot.into();
        self
    }

    pub fn with_restore_on_attach(mut self, restore: bool) -> Self {
        self.restore_on_attach = restore;
        self
    }

    pub fn with_finalizer_threshold(mut self, threshold: usize) -> Self {
        self.finalizer_threshold = threshold;
        self
    }

    pub fn with_finalizer_enabled(mut self, enabled: bool) -> Self {
        self.finalizer_enabled = enabled;
        self
    }

    pub fn with_bind_non_public(mut self, bind: bool) -> Self {
        self.bind_non_public = bind;
        self
    }

    pub fn with_identity_cache(mut self, enabled: bool) -> Self {
        self.identity_cache = enabled;
        self
    }

    pub fn with_verify_library(mut self, verify: bool) -> Self {
        self.verify_library = verify;
        self
    }

    pub fn with_library_path(mut self, path: impl Into<String>) -> Self {
        self.library_path = Some(path.into());
        self
    }
}

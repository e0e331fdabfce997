// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 Courier Developers. All Rights Reserved.

//! Anti-forgery token providers.
//!
//! The gateway never generates or validates anti-forgery tokens; it asks a
//! [`TokenProvider`] for the current value before each call and sets the
//! configured header (`X-CSRF-Token` by default) when one is available.
//!
//! # Providers
//!
//! - [`MemoryTokenProvider`]: a token held in memory, updated by the session
//!   layer after login.
//! - [`FileTokenProvider`]: a token persisted in the user's config directory,
//!   shared with other tools on the same machine.
//! - [`StaticTokenProvider`]: a fixed token, typically from the command line.
//! - Any `Fn() -> Option<String>` closure.
//!
//! # Examples
//!
//! ```rust
//! use courier_client::{MemoryTokenProvider, TokenProvider};
//!
//! let tokens = MemoryTokenProvider::new();
//! assert_eq!(tokens.csrf_token(), None);
//! tokens.set("4f1c9a");
//! assert_eq!(tokens.csrf_token(), Some("4f1c9a".to_string()));
//! ```

use crate::Error;
use directories::ProjectDirs;
use log::{debug, warn};
use std::{path::PathBuf, sync::RwLock};

/// Synchronous source of the anti-forgery token.
///
/// Returning `None` (or an empty string) means no header is sent.
pub trait TokenProvider: Send + Sync {
    fn csrf_token(&self) -> Option<String>;
}

impl<F> TokenProvider for F
where
    F: Fn() -> Option<String> + Send + Sync,
{
    fn csrf_token(&self) -> Option<String> {
        self()
    }
}

/// Provider that never yields a token.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoToken;

impl TokenProvider for NoToken {
    fn csrf_token(&self) -> Option<String> {
        None
    }
}

/// Fixed token.
#[derive(Debug, Clone)]
pub struct StaticTokenProvider(String);

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        StaticTokenProvider(token.into())
    }
}

impl TokenProvider for StaticTokenProvider {
    fn csrf_token(&self) -> Option<String> {
        Some(self.0.clone())
    }
}

/// In-memory token, replaceable at runtime.
#[derive(Debug, Default)]
pub struct MemoryTokenProvider {
    token: RwLock<Option<String>>,
}

impl MemoryTokenProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, token: &str) {
        match self.token.write() {
            Ok(mut guard) => *guard = Some(token.to_owned()),
            Err(e) => warn!("Failed to acquire token write lock: {}", e),
        }
    }

    pub fn clear(&self) {
        match self.token.write() {
            Ok(mut guard) => *guard = None,
            Err(e) => warn!("Failed to acquire token write lock: {}", e),
        }
    }
}

impl TokenProvider for MemoryTokenProvider {
    fn csrf_token(&self) -> Option<String> {
        match self.token.read() {
            Ok(guard) => guard.clone(),
            Err(e) => {
                warn!("Failed to acquire token read lock: {}", e);
                None
            }
        }
    }
}

/// Token persisted on the local filesystem.
///
/// The file is read on every lookup so a token refreshed by another process
/// is picked up without restarting. By default the file lives in the platform
/// config directory (e.g. `~/.config/courier/csrf-token` on Linux).
#[derive(Debug, Clone)]
pub struct FileTokenProvider {
    path: PathBuf,
}

impl FileTokenProvider {
    pub fn new() -> Result<Self, Error> {
        let path = ProjectDirs::from("dev", "Courier", "courier")
            .ok_or_else(|| {
                Error::InvalidParameters("Could not determine user config directory".to_string())
            })?
            .config_dir()
            .join("csrf-token");

        debug!("FileTokenProvider using default path: {:?}", path);
        Ok(Self { path })
    }

    pub fn with_path(path: PathBuf) -> Self {
        debug!("FileTokenProvider using custom path: {:?}", path);
        Self { path }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Persists `token`, creating parent directories as needed.
    pub fn store(&self, token: &str) -> Result<(), Error> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, token)?;
        debug!("Token stored to {:?}", self.path);
        Ok(())
    }

    pub fn clear(&self) -> Result<(), Error> {
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
            debug!("Token file removed from {:?}", self.path);
        }
        Ok(())
    }
}

impl TokenProvider for FileTokenProvider {
    fn csrf_token(&self) -> Option<String> {
        if !self.path.exists() {
            return None;
        }

        match std::fs::read_to_string(&self.path) {
            Ok(token) => {
                let token = token.trim();
                (!token.is_empty()).then(|| token.to_owned())
            }
            Err(e) => {
                warn!("Failed to read token from {:?}: {}", self.path, e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn test_memory_provider_set_clear() {
        let tokens = MemoryTokenProvider::new();
        assert_eq!(tokens.csrf_token(), None);

        tokens.set("token-1");
        assert_eq!(tokens.csrf_token(), Some("token-1".to_string()));

        tokens.set("token-2");
        assert_eq!(tokens.csrf_token(), Some("token-2".to_string()));

        tokens.clear();
        assert_eq!(tokens.csrf_token(), None);
    }

    #[test]
    fn test_memory_provider_thread_safety() {
        let tokens = Arc::new(MemoryTokenProvider::new());
        let tokens_clone = Arc::clone(&tokens);

        std::thread::spawn(move || tokens_clone.set("thread-token"))
            .join()
            .unwrap();
        assert_eq!(tokens.csrf_token(), Some("thread-token".to_string()));
    }

    #[test]
    fn test_file_provider_store_load_clear() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("csrf-token");
        let tokens = FileTokenProvider::with_path(path.clone());

        assert_eq!(tokens.csrf_token(), None);

        tokens.store("file-token\n").unwrap();
        assert!(path.exists());
        assert_eq!(tokens.csrf_token(), Some("file-token".to_string()));

        tokens.clear().unwrap();
        assert!(!path.exists());
        assert_eq!(tokens.csrf_token(), None);
        assert!(tokens.clear().is_ok());
    }

    #[test]
    fn test_file_provider_empty_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("csrf-token");
        std::fs::write(&path, "  ").unwrap();
        assert_eq!(FileTokenProvider::with_path(path).csrf_token(), None);
    }

    #[test]
    fn test_closure_and_static_providers() {
        let closure = || Some("from-closure".to_string());
        assert_eq!(closure.csrf_token(), Some("from-closure".to_string()));
        assert_eq!(
            StaticTokenProvider::new("fixed").csrf_token(),
            Some("fixed".to_string())
        );
        assert_eq!(NoToken.csrf_token(), None);
    }
}

//! Durable storage for the raw access and refresh credentials.
//!
//! Stores are opaque string maps with two keys. They know nothing about
//! expiry or token format.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use keyring::Entry;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::StorageError;

/// Token file name in the cache directory
const TOKEN_FILE: &str = "tokens.json";

/// Keyring service name
const SERVICE_NAME: &str = "healthdesk";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenKey {
    Access,
    Refresh,
}

impl TokenKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenKey::Access => "accessToken",
            TokenKey::Refresh => "refreshToken",
        }
    }
}

impl std::fmt::Display for TokenKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Synchronous key/value persistence for raw credential strings.
pub trait TokenStore: Send + Sync {
    fn get(&self, key: TokenKey) -> Result<Option<String>, StorageError>;
    fn set(&self, key: TokenKey, value: &str) -> Result<(), StorageError>;
    fn remove(&self, key: TokenKey) -> Result<(), StorageError>;
}

// ============================================================================
// File store
// ============================================================================

#[derive(Debug, Default, Serialize, Deserialize)]
struct TokenFile {
    #[serde(rename = "accessToken", skip_serializing_if = "Option::is_none")]
    access_token: Option<String>,
    #[serde(rename = "refreshToken", skip_serializing_if = "Option::is_none")]
    refresh_token: Option<String>,
}

impl TokenFile {
    fn slot(&mut self, key: TokenKey) -> &mut Option<String> {
        match key {
            TokenKey::Access => &mut self.access_token,
            TokenKey::Refresh => &mut self.refresh_token,
        }
    }
}

/// Tokens kept as a JSON document in the cache directory.
pub struct FileTokenStore {
    path: PathBuf,
    // Serializes read-modify-write cycles on the file.
    lock: Mutex<()>,
}

impl FileTokenStore {
    pub fn new(cache_dir: impl AsRef<Path>) -> Self {
        Self {
            path: cache_dir.as_ref().join(TOKEN_FILE),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<TokenFile, StorageError> {
        if !self.path.exists() {
            return Ok(TokenFile::default());
        }
        let contents = std::fs::read_to_string(&self.path)
            .map_err(|e| StorageError::Unavailable(format!("failed to read token file: {e}")))?;
        if contents.trim().is_empty() {
            return Ok(TokenFile::default());
        }
        serde_json::from_str(&contents)
            .map_err(|e| StorageError::Unavailable(format!("failed to parse token file: {e}")))
    }

    fn write(&self, file: &TokenFile) -> Result<(), StorageError> {
        if file.access_token.is_none() && file.refresh_token.is_none() {
            if self.path.exists() {
                std::fs::remove_file(&self.path).map_err(|e| {
                    StorageError::Unavailable(format!("failed to remove token file: {e}"))
                })?;
            }
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StorageError::Unavailable(format!("failed to create token directory: {e}"))
            })?;
        }
        let contents = serde_json::to_string_pretty(file)
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;
        write_private(&self.path, contents.as_bytes())
            .map_err(|e| StorageError::Unavailable(format!("failed to write token file: {e}")))
    }

    fn update(&self, key: TokenKey, value: Option<&str>) -> Result<(), StorageError> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| StorageError::Unavailable("token file lock poisoned".into()))?;
        // An unreadable file is replaced rather than blocking writes forever.
        let mut file = self.read().unwrap_or_default();
        *file.slot(key) = value.map(str::to_string);
        self.write(&file)
    }
}

/// Write `contents` readable by the owner only.
#[cfg(unix)]
fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    use std::fs::{OpenOptions, Permissions};
    use std::io::Write;
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    // `mode` only applies on creation; tighten files left by older versions.
    file.set_permissions(Permissions::from_mode(0o600))?;
    file.write_all(contents)
}

#[cfg(not(unix))]
fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    std::fs::write(path, contents)
}

impl TokenStore for FileTokenStore {
    fn get(&self, key: TokenKey) -> Result<Option<String>, StorageError> {
        let mut file = self.read()?;
        Ok(file.slot(key).take())
    }

    fn set(&self, key: TokenKey, value: &str) -> Result<(), StorageError> {
        debug!(%key, path = ?self.path, "Persisting token");
        self.update(key, Some(value))
    }

    fn remove(&self, key: TokenKey) -> Result<(), StorageError> {
        self.update(key, None)
    }
}

// ============================================================================
// Keyring store
// ============================================================================

/// Tokens kept in the OS keychain, one entry per key.
pub struct KeyringTokenStore {
    service: String,
}

impl KeyringTokenStore {
    pub fn new() -> Self {
        Self::with_service(SERVICE_NAME)
    }

    pub fn with_service(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, key: TokenKey) -> Result<Entry, StorageError> {
        Entry::new(&self.service, key.as_str())
            .map_err(|e| StorageError::Unavailable(format!("failed to create keyring entry: {e}")))
    }
}

impl Default for KeyringTokenStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenStore for KeyringTokenStore {
    fn get(&self, key: TokenKey) -> Result<Option<String>, StorageError> {
        match self.entry(key)?.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(StorageError::Unavailable(format!(
                "failed to read {key} from keychain: {e}"
            ))),
        }
    }

    fn set(&self, key: TokenKey, value: &str) -> Result<(), StorageError> {
        self.entry(key)?.set_password(value).map_err(|e| {
            StorageError::Unavailable(format!("failed to store {key} in keychain: {e}"))
        })
    }

    fn remove(&self, key: TokenKey) -> Result<(), StorageError> {
        match self.entry(key)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(StorageError::Unavailable(format!(
                "failed to delete {key} from keychain: {e}"
            ))),
        }
    }
}

// ============================================================================
// Memory store
// ============================================================================

/// In-process store. Nothing survives a restart.
///
/// `set_available(false)` makes every call fail, which is how a disabled
/// or full storage substrate looks to the session manager.
#[derive(Default)]
pub struct MemoryTokenStore {
    values: Mutex<HashMap<TokenKey, String>>,
    unavailable: AtomicBool,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    fn values(&self) -> Result<std::sync::MutexGuard<'_, HashMap<TokenKey, String>>, StorageError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("storage disabled".into()));
        }
        self.values
            .lock()
            .map_err(|_| StorageError::Unavailable("memory store lock poisoned".into()))
    }
}

impl TokenStore for MemoryTokenStore {
    fn get(&self, key: TokenKey) -> Result<Option<String>, StorageError> {
        Ok(self.values()?.get(&key).cloned())
    }

    fn set(&self, key: TokenKey, value: &str) -> Result<(), StorageError> {
        self.values()?.insert(key, value.to_string());
        Ok(())
    }

    fn remove(&self, key: TokenKey) -> Result<(), StorageError> {
        self.values()?.remove(&key);
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

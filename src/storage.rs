//! Durable local storage for client state.
//!
//! A small string key/value store that survives restarts. Holds the bearer
//! token backup, the user profile, the OAuth CSRF state and the list of
//! active tabs.
//!
//! # Storage
//!
//! Production: single OS keyring entry `termtab/local-storage` containing a
//! JSON map, so the whole store costs at most one keychain prompt.
//! Test mode: file at `{config_dir}/local-storage.json`.
//!
//! # Graceful Degradation
//!
//! Keyring access can fail transiently (locked keychain, changed binary
//! signature). Loading retries, then falls back to an empty store so the
//! client can continue and re-authenticate.

use anyhow::{Context, Result};
use keyring::Entry;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

/// Keyring service name.
const KEYRING_SERVICE: &str = "termtab";
/// Keyring entry holding the serialized store.
const KEYRING_ENTRY: &str = "local-storage";

/// Number of attempts for keyring reads.
const KEYRING_RETRY_ATTEMPTS: u32 = 2;
/// Delay between keyring read attempts.
const KEYRING_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Categorized keyring access errors.
#[derive(Debug)]
pub enum KeyringAccessError {
    /// Keyring is locked and requires user interaction.
    Locked(String),
    /// Entry does not exist (normal on first run).
    NotFound,
    /// Access denied, typically after a binary signature change.
    AccessDenied(String),
    /// Data exists but cannot be parsed.
    Corrupted(String),
    /// Anything else.
    Other(String),
}

impl std::fmt::Display for KeyringAccessError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Locked(msg) => write!(f, "Keyring locked: {msg}"),
            Self::NotFound => write!(f, "Keyring entry not found"),
            Self::AccessDenied(msg) => write!(f, "Keyring access denied: {msg}"),
            Self::Corrupted(msg) => write!(f, "Keyring data corrupted: {msg}"),
            Self::Other(msg) => write!(f, "Keyring error: {msg}"),
        }
    }
}

impl std::error::Error for KeyringAccessError {}

fn categorize_keyring_error(err: &keyring::Error) -> KeyringAccessError {
    match err {
        keyring::Error::NoEntry => KeyringAccessError::NotFound,
        keyring::Error::BadEncoding(_) => KeyringAccessError::Corrupted(format!("{err:?}")),
        _ => {
            let msg = format!("{err:?}");
            let lower = msg.to_lowercase();
            if lower.contains("user interaction") || lower.contains("user canceled") {
                KeyringAccessError::Locked(msg)
            } else if lower.contains("denied") || lower.contains("not allowed") {
                KeyringAccessError::AccessDenied(msg)
            } else {
                KeyringAccessError::Other(msg)
            }
        }
    }
}

/// Where the store is persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
enum StorageBackend {
    /// OS keyring entry.
    Keyring,
    /// Plain JSON file (test modes, explicit paths).
    File(PathBuf),
}

/// Serialized form of the store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoredValues {
    #[serde(default)]
    values: BTreeMap<String, String>,
    #[serde(default = "default_version")]
    version: u8,
}

fn default_version() -> u8 {
    1
}

/// Persistent string key/value store.
///
/// Reads are served from memory; every write is persisted immediately.
#[derive(Debug)]
pub struct DurableStorage {
    backend: StorageBackend,
    data: StoredValues,
}

impl DurableStorage {
    /// Open the store for the current environment.
    ///
    /// Uses the OS keyring in production and a file under the config
    /// directory in any test mode.
    pub fn open() -> Result<Self> {
        if crate::env::should_skip_keyring() {
            let path = crate::config::Config::config_dir()?.join("local-storage.json");
            return Self::open_file(path);
        }

        Ok(Self {
            backend: StorageBackend::Keyring,
            data: load_from_keyring_with_retry(),
        })
    }

    /// Open a file-backed store at `path`.
    pub fn open_file(path: PathBuf) -> Result<Self> {
        let data = if path.exists() {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            match serde_json::from_str(&content) {
                Ok(data) => data,
                Err(e) => {
                    log::warn!("[Storage] {} is corrupted, starting empty: {e}", path.display());
                    StoredValues::default()
                }
            }
        } else {
            StoredValues::default()
        };

        Ok(Self {
            backend: StorageBackend::File(path),
            data,
        })
    }

    /// Read a value.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.data.values.get(key).map(String::as_str)
    }

    /// Write a value and persist.
    pub fn set(&mut self, key: &str, value: impl Into<String>) -> Result<()> {
        self.data.values.insert(key.to_string(), value.into());
        self.persist()
    }

    /// Remove a value and persist. Removing a missing key is not an error.
    pub fn remove(&mut self, key: &str) -> Result<()> {
        if self.data.values.remove(key).is_some() {
            self.persist()?;
        }
        Ok(())
    }

    /// Read and deserialize a JSON value.
    ///
    /// Unparseable values are treated as absent.
    #[must_use]
    pub fn get_json<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = self.get(key)?;
        match serde_json::from_str(raw) {
            Ok(value) => Some(value),
            Err(e) => {
                log::warn!("[Storage] Ignoring unparseable value for {key}: {e}");
                None
            }
        }
    }

    /// Serialize a value as JSON and persist it.
    pub fn set_json<T: Serialize>(&mut self, key: &str, value: &T) -> Result<()> {
        let json = serde_json::to_string(value)?;
        self.set(key, json)
    }

    fn persist(&self) -> Result<()> {
        match &self.backend {
            StorageBackend::File(path) => {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(path, serde_json::to_string_pretty(&self.data)?)
                    .with_context(|| format!("Failed to write {}", path.display()))?;

                #[cfg(unix)]
                fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;

                log::trace!("[Storage] Saved {} keys to file", self.data.values.len());
                Ok(())
            }
            StorageBackend::Keyring => {
                let entry = Entry::new(KEYRING_SERVICE, KEYRING_ENTRY)
                    .map_err(|e| anyhow::anyhow!("Failed to create keyring entry: {e:?}"))?;
                entry
                    .set_password(&serde_json::to_string(&self.data)?)
                    .map_err(|e| anyhow::anyhow!("Failed to store values in keyring: {e:?}"))?;
                log::debug!("[Storage] Saved {} keys to OS keyring", self.data.values.len());
                Ok(())
            }
        }
    }
}

/// Load from keyring, retrying transient failures.
///
/// Always yields a store; failures degrade to an empty one.
fn load_from_keyring_with_retry() -> StoredValues {
    let mut last_error: Option<KeyringAccessError> = None;

    for attempt in 0..KEYRING_RETRY_ATTEMPTS {
        if attempt > 0 {
            log::debug!(
                "[Storage] Retrying keyring access (attempt {}/{})",
                attempt + 1,
                KEYRING_RETRY_ATTEMPTS
            );
            thread::sleep(KEYRING_RETRY_DELAY);
        }

        match try_load_from_keyring() {
            Ok(data) => return data,
            Err(KeyringAccessError::NotFound) => {
                log::debug!("[Storage] No keyring entry yet, starting empty");
                return StoredValues::default();
            }
            Err(err @ KeyringAccessError::Corrupted(_)) => {
                log::warn!("[Storage] {err}, starting empty");
                return StoredValues::default();
            }
            Err(err) => {
                log::debug!("[Storage] Keyring attempt {} failed: {err}", attempt + 1);
                last_error = Some(err);
            }
        }
    }

    if let Some(err) = &last_error {
        log::warn!(
            "[Storage] Keyring access failed after {KEYRING_RETRY_ATTEMPTS} attempts: {err}. \
             You may need to log in again."
        );
    }
    StoredValues::default()
}

fn try_load_from_keyring() -> std::result::Result<StoredValues, KeyringAccessError> {
    let entry = Entry::new(KEYRING_SERVICE, KEYRING_ENTRY)
        .map_err(|e| KeyringAccessError::Other(format!("Failed to create entry: {e:?}")))?;

    let json = entry
        .get_password()
        .map_err(|e| categorize_keyring_error(&e))?;
    serde_json::from_str(&json)
        .map_err(|e| KeyringAccessError::Corrupted(format!("JSON parse error: {e}")))
}

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::config::atomic_write;
use crate::error::SessionError;

pub const AUTHED_KEY: &str = "authed";
pub const SDK_CONFIG_KEY: &str = "sdkConfig";
pub const REDACTED: &str = "redacted";

pub const SESSION_FILE_NAME: &str = "session.json";

/// Client configuration handed to the SDK. `password` and `two_factor_code`
/// are secrets and never reach persistent storage unredacted.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SdkConfig {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub two_factor_code: String,
    #[serde(default)]
    pub user_id: u64,
    #[serde(default)]
    pub auth_version: u32,
    #[serde(default)]
    pub base_folder_uuid: String,
    #[serde(default)]
    pub connect_to_socket: bool,
    #[serde(default)]
    pub metadata_cache: bool,
    /// SDK fields this crate does not interpret, kept as-is.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Default for SdkConfig {
    fn default() -> Self {
        Self {
            email: "anonymous".to_string(),
            password: "anonymous".to_string(),
            two_factor_code: "anonymous".to_string(),
            user_id: 0,
            auth_version: 2,
            base_folder_uuid: String::new(),
            connect_to_socket: false,
            metadata_cache: false,
            extra: BTreeMap::new(),
        }
    }
}

impl std::fmt::Debug for SdkConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SdkConfig")
            .field("email", &self.email)
            .field("password", &REDACTED)
            .field("two_factor_code", &REDACTED)
            .field("user_id", &self.user_id)
            .field("auth_version", &self.auth_version)
            .field("base_folder_uuid", &self.base_folder_uuid)
            .finish_non_exhaustive()
    }
}

impl SdkConfig {
    pub fn redacted(&self) -> Self {
        Self {
            password: REDACTED.to_string(),
            two_factor_code: REDACTED.to_string(),
            ..self.clone()
        }
    }
}

/// Key/value storage that survives restarts (the browser's local storage).
pub trait SessionStorage: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, SessionError>;
    fn set(&self, key: &str, value: &str) -> Result<(), SessionError>;
    fn remove(&self, key: &str) -> Result<(), SessionError>;
    fn clear(&self) -> Result<(), SessionError>;
}

pub fn is_authed(storage: &dyn SessionStorage) -> Result<bool, SessionError> {
    Ok(storage.get(AUTHED_KEY)?.as_deref() == Some("true"))
}

/// Writes the redacted form of `config`; the unredacted secrets never touch
/// storage.
pub fn persist_sdk_config(
    storage: &dyn SessionStorage,
    config: &SdkConfig,
) -> Result<SdkConfig, SessionError> {
    let redacted = config.redacted();
    storage.set(SDK_CONFIG_KEY, &serde_json::to_string(&redacted)?)?;
    Ok(redacted)
}

pub fn load_sdk_config(storage: &dyn SessionStorage) -> Result<Option<SdkConfig>, SessionError> {
    match storage.get(SDK_CONFIG_KEY)? {
        Some(text) => Ok(Some(serde_json::from_str(&text)?)),
        None => Ok(None),
    }
}

#[derive(Debug, Default)]
pub struct MemorySessionStorage {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemorySessionStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, String>> {
        // A poisoned map is still a valid map.
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl SessionStorage for MemorySessionStorage {
    fn get(&self, key: &str) -> Result<Option<String>, SessionError> {
        Ok(self.entries().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), SessionError> {
        self.entries().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), SessionError> {
        self.entries().remove(key);
        Ok(())
    }

    fn clear(&self) -> Result<(), SessionError> {
        self.entries().clear();
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SessionFileV1 {
    version: u32,
    entries: BTreeMap<String, String>,
}

const SESSION_FILE_VERSION: u32 = 1;

pub fn session_path(data_dir: &Path) -> PathBuf {
    data_dir.join(SESSION_FILE_NAME)
}

/// JSON file backed storage; every write replaces the file atomically.
#[derive(Debug)]
pub struct FileSessionStorage {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileSessionStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<BTreeMap<String, String>, SessionError> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let bytes = std::fs::read(&self.path)?;
        let file: SessionFileV1 = serde_json::from_slice(&bytes)?;
        if file.version != SESSION_FILE_VERSION {
            return Err(SessionError::InvalidFormat {
                message: format!("unsupported session file version: {}", file.version),
            });
        }
        Ok(file.entries)
    }

    fn write(&self, entries: BTreeMap<String, String>) -> Result<(), SessionError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = SessionFileV1 {
            version: SESSION_FILE_VERSION,
            entries,
        };
        atomic_write(&self.path, &serde_json::to_vec_pretty(&file)?)?;
        Ok(())
    }

    fn modify(&self, f: impl FnOnce(&mut BTreeMap<String, String>)) -> Result<(), SessionError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut entries = self.read()?;
        f(&mut entries);
        self.write(entries)
    }
}

impl SessionStorage for FileSessionStorage {
    fn get(&self, key: &str) -> Result<Option<String>, SessionError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        Ok(self.read()?.remove(key))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), SessionError> {
        self.modify(|entries| {
            entries.insert(key.to_string(), value.to_string());
        })
    }

    fn remove(&self, key: &str) -> Result<(), SessionError> {
        self.modify(|entries| {
            entries.remove(key);
        })
    }

    fn clear(&self) -> Result<(), SessionError> {
        self.modify(|entries| entries.clear())
    }
}

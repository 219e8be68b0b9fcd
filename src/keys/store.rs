//! Credential records and their persistence.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

/// Validity of a credential as last observed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyStatus {
    /// The back end accepted the credential.
    Valid,
    /// The back end rejected the credential. Never selected until reset.
    Invalid,
    /// Not yet used or verified.
    #[default]
    Unknown,
}

impl fmt::Display for KeyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Valid => write!(f, "valid"),
            Self::Invalid => write!(f, "invalid"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// One access credential and its validity.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialRecord {
    /// The credential itself.
    #[serde(alias = "key")]
    pub value: String,
    /// Last observed validity.
    #[serde(default)]
    pub status: KeyStatus,
}

impl CredentialRecord {
    /// Creates a record with `Unknown` status.
    pub fn new(value: impl Into<String>) -> Self {
        Self::with_status(value, KeyStatus::Unknown)
    }

    /// Creates a record with the given status.
    pub fn with_status(value: impl Into<String>, status: KeyStatus) -> Self {
        Self {
            value: value.into(),
            status,
        }
    }

    /// Returns true unless the record is `Invalid`.
    pub fn is_usable(&self) -> bool {
        self.status != KeyStatus::Invalid
    }

    /// Returns the credential with everything but its edges hidden, for logs.
    pub fn masked(&self) -> String {
        mask_key(&self.value)
    }
}

impl fmt::Debug for CredentialRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialRecord")
            .field("value", &self.masked())
            .field("status", &self.status)
            .finish()
    }
}

/// Masks a credential for display: `AIza…wxyz`.
pub fn mask_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() <= 8 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}…{tail}")
}

/// Everything the pool persists: the ordered records and the rotation cursor.
///
/// Persisted as one unit so cursor and statuses cannot diverge.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPoolState {
    /// Credentials in insertion order.
    #[serde(default)]
    pub records: Vec<CredentialRecord>,
    /// Index of the last returned record, unset before first use.
    #[serde(default)]
    pub cursor: Option<usize>,
}

impl KeyPoolState {
    /// Creates a state with `Unknown` records and no cursor.
    pub fn from_keys<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            records: keys.into_iter().map(CredentialRecord::new).collect(),
            cursor: None,
        }
    }

    pub(crate) fn position(&self, value: &str) -> Option<usize> {
        self.records.iter().position(|r| r.value == value)
    }
}

/// Persistence collaborator for the credential pool.
///
/// `load` followed by `save` must round-trip records and cursor exactly.
pub trait KeyStore: Send + Sync {
    /// Reads the current state.
    fn load(&self) -> Result<KeyPoolState>;

    /// Replaces the stored state.
    fn save(&self, state: &KeyPoolState) -> Result<()>;
}

/// Keeps the pool state in process memory.
#[derive(Debug, Default)]
pub struct MemoryKeyStore {
    state: Mutex<KeyPoolState>,
}

impl MemoryKeyStore {
    /// Creates a store holding `state`.
    pub fn new(state: KeyPoolState) -> Self {
        Self {
            state: Mutex::new(state),
        }
    }
}

impl KeyStore for MemoryKeyStore {
    fn load(&self) -> Result<KeyPoolState> {
        Ok(self
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    fn save(&self, state: &KeyPoolState) -> Result<()> {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state.clone();
        Ok(())
    }
}

/// Stores the pool state as a JSON file.
///
/// A missing file loads as the empty state. Saves go through a sibling
/// temporary file and a rename so readers never see a partial write.
#[derive(Debug, Clone)]
pub struct JsonFileKeyStore {
    path: PathBuf,
}

impl JsonFileKeyStore {
    /// Creates a store backed by `path`. The file is not touched until first use.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Returns the backing file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl KeyStore for JsonFileKeyStore {
    fn load(&self) -> Result<KeyPoolState> {
        match std::fs::read_to_string(&self.path) {
            Ok(text) if text.trim().is_empty() => Ok(KeyPoolState::default()),
            Ok(text) => Ok(serde_json::from_str(&text)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(KeyPoolState::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, state: &KeyPoolState) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.temp_path();
        std::fs::write(&tmp, serde_json::to_vec_pretty(state)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

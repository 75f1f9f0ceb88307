use std::fs;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use sweep_core::state::SweepState;
use sweep_core::storage_keys::state_object_key;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object key '{key}' must be a relative path without '..'")]
    InvalidKey { key: String },

    #[error("failed to {action} {}: {source}", path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("object '{key}' is not valid JSON: {source}")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("object '{key}' could not be encoded: {source}")]
    Encode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Keyed blob storage for sweep state and job records.
pub trait StateStore {
    fn write_object(&self, key: &str, body: &[u8]) -> Result<(), StoreError>;

    /// `Ok(None)` when nothing was ever written under `key`.
    fn read_object(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
}

/// Stores each object as a file below `root`, mirroring the key's path.
#[derive(Debug, Clone)]
pub struct FileStateStore {
    root: PathBuf,
}

impl FileStateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        let relative = Path::new(key);
        let valid = !key.is_empty()
            && relative
                .components()
                .all(|component| matches!(component, Component::Normal(_)));
        if !valid {
            return Err(StoreError::InvalidKey {
                key: key.to_string(),
            });
        }
        Ok(self.root.join(relative))
    }
}

impl StateStore for FileStateStore {
    fn write_object(&self, key: &str, body: &[u8]) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                action: "create directory",
                path: parent.to_path_buf(),
                source,
            })?;
        }

        // A reader never sees a half-written object: write aside, then rename.
        let staging = path.with_extension("json.tmp");
        fs::write(&staging, body).map_err(|source| StoreError::Io {
            action: "write",
            path: staging.clone(),
            source,
        })?;
        fs::rename(&staging, &path).map_err(|source| StoreError::Io {
            action: "rename into",
            path: path.clone(),
            source,
        })
    }

    fn read_object(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.path_for(key)?;
        match fs::read(&path) {
            Ok(body) => Ok(Some(body)),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StoreError::Io {
                action: "read",
                path,
                source,
            }),
        }
    }
}

pub fn write_json<T: Serialize + ?Sized>(
    store: &dyn StateStore,
    key: &str,
    value: &T,
) -> Result<(), StoreError> {
    let body = serde_json::to_vec_pretty(value).map_err(|source| StoreError::Encode {
        key: key.to_string(),
        source,
    })?;
    store.write_object(key, &body)
}

pub fn read_json<T: DeserializeOwned>(
    store: &dyn StateStore,
    key: &str,
) -> Result<Option<T>, StoreError> {
    let Some(body) = store.read_object(key)? else {
        return Ok(None);
    };
    serde_json::from_slice(&body)
        .map(Some)
        .map_err(|source| StoreError::Decode {
            key: key.to_string(),
            source,
        })
}

/// Persists `state` under its run's state key and returns that key.
pub fn save_state(
    store: &dyn StateStore,
    prefix: &str,
    state: &SweepState,
) -> Result<String, StoreError> {
    let key = state_object_key(prefix, &state.run_id);
    write_json(store, &key, state)?;
    Ok(key)
}

pub fn load_state(
    store: &dyn StateStore,
    prefix: &str,
    run_id: &str,
) -> Result<Option<SweepState>, StoreError> {
    read_json(store, &state_object_key(prefix, run_id))
}

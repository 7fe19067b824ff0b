//! JSON file store
//!
//! Holds the whole data set in memory and rewrites the file after every
//! successful mutation using the temp-file + rename pattern with 0o600
//! permissions. A failed write rolls the in-memory copy back, so memory and
//! disk never disagree.

use super::{StoreData, TaskInsert, not_found};
use crate::core::compile::CompiledPolicy;
use crate::core::error::{Error, Result};
use crate::core::model::{FilteringPolicy, Firewall, PolicyVersion};
use crate::orchestrator::task::ApplicationTask;
use crate::utils::write_atomic;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, error};
use uuid::Uuid;

#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    data: Mutex<StoreData>,
}

impl JsonFileStore {
    /// Opens the store at `path`, starting empty if the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the file exists but cannot be read or parsed.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let data = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StoreData::default(),
            Err(e) => return Err(e.into()),
        };
        debug!("Opened store at {}", path.display());
        Ok(Self {
            path,
            data: Mutex::new(data),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read<T>(&self, f: impl FnOnce(&StoreData) -> Result<T>) -> Result<T> {
        let data = self
            .data
            .lock()
            .map_err(|_| Error::Internal("store mutex poisoned".to_string()))?;
        f(&data)
    }

    fn write<T>(&self, f: impl FnOnce(&mut StoreData) -> Result<T>) -> Result<T> {
        let mut data = self
            .data
            .lock()
            .map_err(|_| Error::Internal("store mutex poisoned".to_string()))?;
        let before = data.clone();
        let out = f(&mut data)?;
        let persisted = serde_json::to_vec_pretty(&*data)
            .map_err(Error::from)
            .and_then(|bytes| write_atomic(&self.path, &bytes).map_err(Error::from));
        if let Err(e) = persisted {
            error!("Failed to persist store {}: {e}", self.path.display());
            *data = before;
            return Err(e);
        }
        Ok(out)
    }
}

impl_store!(JsonFileStore);

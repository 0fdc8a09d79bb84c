//! Batch repository.
//!
//! The store owns every batch and is the single writer of the persisted
//! JSON file. Read-modify-write sections run under one mutex; a batch with
//! a pass in flight is marked so that no second pass can start on it.

use crate::models::{Batch, KeyPackage};
use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tempfile::NamedTempFile;
use tracing::{debug, error, info, warn};

/// Maximum number of batches; each one owns a distinct transmission risk level.
pub const MAX_BATCHES: usize = 8;

/// Errors raised by the batch store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to decode store {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode store: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("no batch for user '{0}'")]
    UnknownUser(String),

    #[error("store already holds {} batches", MAX_BATCHES)]
    TooManyBatches,

    #[error("a pass is already running for '{0}'")]
    PassInFlight(String),

    #[error("batch for '{0}' changed while its pass was running")]
    StaleClaim(String),
}

#[derive(Debug, Default)]
struct StoreState {
    batches: Vec<Batch>,
    in_flight: HashSet<String>,
}

/// Owned repository of batches with optional file persistence.
#[derive(Debug, Default)]
pub struct BatchStore {
    state: Mutex<StoreState>,
    path: Option<PathBuf>,
}

/// Marks a batch as having a pass in flight until dropped.
#[derive(Debug)]
pub struct PassClaim<'a> {
    store: &'a BatchStore,
    user_name: String,
    batch: Batch,
}

impl PassClaim<'_> {
    /// Snapshot of the batch taken when the claim was made.
    pub fn batch(&self) -> &Batch {
        &self.batch
    }
}

impl Drop for PassClaim<'_> {
    fn drop(&mut self) {
        self.store.lock().in_flight.remove(&self.user_name);
        debug!("Released pass claim for {}", self.user_name);
    }
}

impl BatchStore {
    /// A store that is never written to disk.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Open the store at `path`; a missing file is an empty store.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let batches = if path.exists() {
            let content = std::fs::read_to_string(path).map_err(|source| StoreError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            serde_json::from_str(&content).map_err(|source| StoreError::Decode {
                path: path.to_path_buf(),
                source,
            })?
        } else {
            debug!("No store at {}, starting empty", path.display());
            Vec::new()
        };

        Ok(Self {
            state: Mutex::new(StoreState {
                batches,
                in_flight: HashSet::new(),
            }),
            path: Some(path.to_path_buf()),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Import a key package and return the batch's transmission risk level.
    ///
    /// A batch for the same user is replaced in place; otherwise a new one is
    /// appended.
    pub fn import(&self, package: KeyPackage) -> Result<u8, StoreError> {
        let mut state = self.lock();

        let position = state
            .batches
            .iter()
            .position(|b| b.user_name == package.user_name);

        if state.in_flight.contains(&package.user_name) {
            return Err(StoreError::PassInFlight(package.user_name));
        }
        if position.is_none() && state.batches.len() >= MAX_BATCHES {
            return Err(StoreError::TooManyBatches);
        }

        let index = position.unwrap_or(state.batches.len());
        let risk_level = index as u8;
        let key_count = package.keys.len();
        let batch = Batch::new(package, risk_level);
        info!(
            "Imported {} keys from {} (risk level {})",
            key_count, batch.user_name, risk_level
        );

        if position.is_some() {
            state.batches[index] = batch;
        } else {
            state.batches.push(batch);
        }

        self.persist_logged(&state);
        Ok(risk_level)
    }

    /// Delete every batch and return how many there were.
    ///
    /// Refused while any pass is in flight.
    pub fn clear(&self) -> Result<usize, StoreError> {
        let mut state = self.lock();
        if let Some(user_name) = state.in_flight.iter().next() {
            return Err(StoreError::PassInFlight(user_name.clone()));
        }

        let count = state.batches.len();
        info!("Deleting {} batches", count);
        state.batches.clear();
        self.persist_logged(&state);
        Ok(count)
    }

    /// Copy of every batch, in store order.
    pub fn snapshot(&self) -> Vec<Batch> {
        self.lock().batches.clone()
    }

    pub fn batch(&self, user_name: &str) -> Option<Batch> {
        self.lock()
            .batches
            .iter()
            .find(|b| b.user_name == user_name)
            .cloned()
    }

    /// Mark `user_name`'s batch as having a pass in flight.
    pub fn claim(&self, user_name: &str) -> Result<PassClaim<'_>, StoreError> {
        let mut state = self.lock();

        let batch = state
            .batches
            .iter()
            .find(|b| b.user_name == user_name)
            .cloned()
            .ok_or_else(|| StoreError::UnknownUser(user_name.to_string()))?;

        if !state.in_flight.insert(user_name.to_string()) {
            return Err(StoreError::PassInFlight(user_name.to_string()));
        }

        Ok(PassClaim {
            store: self,
            user_name: user_name.to_string(),
            batch,
        })
    }

    /// Apply `f` to a claimed batch and persist the result.
    ///
    /// The batch must still be the one the claim was taken on: same import
    /// and same pass count. Otherwise `f` is not run. Persistence failures
    /// are logged; the in-memory state stays authoritative.
    pub fn update<R>(
        &self,
        claim: &PassClaim<'_>,
        f: impl FnOnce(&mut Batch) -> R,
    ) -> Result<R, StoreError> {
        let mut state = self.lock();

        let batch = state
            .batches
            .iter_mut()
            .find(|b| b.user_name == claim.user_name)
            .ok_or_else(|| StoreError::UnknownUser(claim.user_name.clone()))?;

        if batch.date_processed != claim.batch.date_processed
            || batch.analysis_passes != claim.batch.analysis_passes
        {
            warn!("Discarding pass result for {}: batch was replaced", claim.user_name);
            return Err(StoreError::StaleClaim(claim.user_name.clone()));
        }

        let result = f(batch);
        self.persist_logged(&state);
        Ok(result)
    }

    /// Write the store to disk now.
    pub fn save(&self) -> Result<(), StoreError> {
        let state = self.lock();
        self.persist(&state)
    }

    fn persist_logged(&self, state: &StoreState) {
        if let Err(e) = self.persist(state) {
            error!("Failed to persist batches: {}", e);
        }
    }

    fn persist(&self, state: &StoreState) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let encoded = serde_json::to_vec_pretty(&state.batches)?;
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let io_err = |source: std::io::Error| StoreError::Io {
            path: path.clone(),
            source,
        };

        let mut file = NamedTempFile::new_in(dir).map_err(io_err)?;
        file.write_all(&encoded).map_err(io_err)?;
        file.persist(path).map_err(|e| io_err(e.error))?;

        debug!("Persisted {} batches to {}", state.batches.len(), path.display());
        Ok(())
    }
}

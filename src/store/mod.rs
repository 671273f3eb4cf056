//! Durable phase state store.
//!
//! SQLite is the single source of truth for what runs next. The executor
//! re-reads the phase record every iteration; nothing about retries is
//! cached in memory.

pub mod db;
pub mod models;

use std::path::Path;
use std::sync::Arc;

pub use db::PhaseStore;
pub use models::*;

use crate::errors::StoreError;

/// Async-safe handle to the phase store.
///
/// Wraps `PhaseStore` behind `Arc<Mutex>` and runs each call on tokio's
/// blocking pool so SQLite I/O never stalls async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<PhaseStore>>,
}

impl DbHandle {
    pub fn new(store: PhaseStore) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(store)),
        }
    }

    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Ok(Self::new(PhaseStore::open(path)?))
    }

    /// Run a closure against the store on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&mut PhaseStore) -> Result<R, StoreError> + Send + 'static,
        R: Send + 'static,
    {
        let store = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = store.lock().map_err(|_| StoreError::LockPoisoned)?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::TaskFailed(e.to_string()))?
    }

    /// Lock synchronously. For CLI commands and tests, never a hot async path.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, PhaseStore>, StoreError> {
        self.inner.lock().map_err(|_| StoreError::LockPoisoned)
    }
}

//! Application state management

use std::sync::Arc;

use crate::config::Config;
use crate::error::StorageError;
use crate::storage::{BackingStore, LocalStore};
use crate::upload::{StagingStore, UploadService};

/// Error type for state initialization
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("Failed to open backing store: {0}")]
    Storage(#[from] StorageError),

    #[error("Failed to create staging directory: {0}")]
    Staging(#[from] std::io::Error),
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: Config,
    store: Arc<dyn BackingStore>,
    uploads: UploadService,
}

impl AppState {
    /// Create state over an existing store
    pub fn new(config: Config, store: Arc<dyn BackingStore>) -> Self {
        let uploads = UploadService::new(
            StagingStore::new(&config.storage.staging_dir),
            store.clone(),
            config.upload.completion_workers,
            config.upload.completion_queue_capacity,
        );

        Self {
            inner: Arc::new(AppStateInner {
                config,
                store,
                uploads,
            }),
        }
    }

    /// Create state backed by a local directory store, as configured
    ///
    /// Must be called inside a Tokio runtime; the completion workers start
    /// immediately.
    pub fn from_config(config: Config) -> Result<Self, StateError> {
        let store = LocalStore::new(&config.storage.root)?;
        std::fs::create_dir_all(&config.storage.staging_dir)?;

        Ok(Self::new(config, Arc::new(store)))
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Get the backing store
    pub fn store(&self) -> &Arc<dyn BackingStore> {
        &self.inner.store
    }

    /// Get the upload service
    pub fn uploads(&self) -> &UploadService {
        &self.inner.uploads
    }

    /// Drain pending upload completions
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down application state...");
        self.inner.uploads.shutdown().await;
    }
}

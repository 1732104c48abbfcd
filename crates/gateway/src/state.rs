use crate::store::{DefectStore, StoreError};
use dispatcher::Dispatcher;
use protocol::DEFAULT_MAX_MESSAGE_BYTES;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Shared by every handler: one dispatcher, one store.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub store: Arc<dyn DefectStore>,
    pub max_upload_bytes: usize,
    sessions: Arc<AtomicU64>,
}

impl AppState {
    pub fn new(dispatcher: Arc<Dispatcher>, store: Arc<dyn DefectStore>) -> Self {
        Self {
            dispatcher,
            store,
            max_upload_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            sessions: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn with_max_upload_bytes(mut self, max_upload_bytes: usize) -> Self {
        self.max_upload_bytes = max_upload_bytes;
        self
    }

    /// Token for a new websocket connection, unique for the process lifetime.
    pub fn next_session(&self) -> String {
        format!("session-{}", self.sessions.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Run a store call on the blocking pool.
    pub async fn with_store<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&dyn DefectStore) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || f(store.as_ref()))
            .await
            .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

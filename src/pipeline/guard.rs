//! Per-stage idempotency guard and bounded store access.
//!
//! Every store call runs on the blocking pool under `store_timeout`. A call
//! that times out keeps running in the background; if it was an insert that
//! later succeeds, the next cycle sees the prediction and skips the stage.

use std::sync::Arc;
use std::time::Duration;

use crate::storage::{InsertOutcome, PersistentStore, StoreError};
use crate::types::{Stage, StagePrediction};

#[derive(Clone)]
pub struct IdempotencyGuard {
    store: Arc<dyn PersistentStore>,
    timeout: Duration,
}

impl IdempotencyGuard {
    pub fn new(store: Arc<dyn PersistentStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    /// Run a blocking store operation with the configured timeout.
    pub async fn call<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        F: FnOnce(&dyn PersistentStore) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(&self.store);
        let task = tokio::task::spawn_blocking(move || op(store.as_ref()));
        match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(StoreError::Task(join_err.to_string())),
            Err(_) => Err(StoreError::Timeout(self.timeout)),
        }
    }

    /// Has `(stage, sensor_record_id)` already produced a prediction?
    pub async fn is_processed(&self, stage: Stage, sensor_record_id: &str) -> Result<bool, StoreError> {
        let id = sensor_record_id.to_string();
        self.call(move |store| store.prediction_exists(stage, &id)).await
    }

    /// Single unique insert. A lost race comes back as `AlreadyExists`.
    pub async fn commit(&self, prediction: StagePrediction) -> Result<InsertOutcome, StoreError> {
        self.call(move |store| store.insert_prediction(&prediction)).await
    }
}

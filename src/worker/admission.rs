//! Admission controller: the only path by which task records are created.

use std::sync::Arc;

use crate::error::AdmissionError;
use crate::store::TaskStore;
use crate::worker::state::{NewTask, TaskRecord};

/// Gatekeeper in front of [`TaskStore::admit`].
///
/// The check-and-insert happens inside the store's transaction, so two
/// concurrent `try_admit` calls can never both take the last slot.
#[derive(Clone)]
pub struct AdmissionController {
    store: Arc<dyn TaskStore>,
}

impl AdmissionController {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self { store }
    }

    /// Reserve a slot and record the task as pending.
    pub async fn try_admit(&self, task: NewTask) -> Result<TaskRecord, AdmissionError> {
        match self.store.admit(&task).await {
            Ok(record) => Ok(record),
            Err(e) => {
                if e.is_capacity() {
                    tracing::info!(label = %task.label, "Admission rejected: {}", e);
                } else {
                    tracing::error!(label = %task.label, "Admission failed: {}", e);
                }
                Err(e)
            }
        }
    }

    /// Read-only check: is there at least one global slot free?
    ///
    /// Advisory only. The authoritative check is the one in `try_admit`.
    pub async fn has_capacity(&self) -> bool {
        self.store.running_count().await < self.capacity()
    }

    pub async fn running_count(&self) -> usize {
        self.store.running_count().await
    }

    pub fn capacity(&self) -> usize {
        self.store.limits().max_concurrent
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }
}

//! Device and team storage.
//!
//! The device store is the persistence boundary of the master. Production
//! deployments can back it with a document database; the in-memory store
//! keeps insertion order so iteration (and therefore matching) is
//! deterministic.

mod memory;
mod teams;

use async_trait::async_trait;
use devlab_model::Device;
use thiserror::Error;

pub use memory::InMemoryDeviceStore;
pub use teams::{extract_job_name, TeamDirectory, TeamPool};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("device store unavailable: {0}")]
    Unavailable(String),

    #[error("invalid device record: {0}")]
    Invalid(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Persisted device records keyed by `(id, host)`.
#[async_trait]
pub trait DeviceStore: Send + Sync {
    async fn find(&self, id: &str, host: &str) -> StoreResult<Option<Device>>;

    /// Every record, in store iteration order.
    async fn find_all(&self) -> StoreResult<Vec<Device>>;

    async fn find_by_host(&self, host: &str) -> StoreResult<Vec<Device>>;

    /// Insert or replace the record with the same `(id, host)`.
    async fn save(&self, device: Device) -> StoreResult<()>;

    /// Returns whether a record was removed.
    async fn delete(&self, id: &str, host: &str) -> StoreResult<bool>;
}

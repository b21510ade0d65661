//! Remote storage abstraction.
//!
//! A destination is a flat namespace of named blobs. The engine never
//! retries destination calls; failures surface as
//! [`EngineError::Destination`](crate::utils::errors::EngineError::Destination).

pub mod local;
pub mod lock;
pub mod memory;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::utils::errors::Result;

pub use local::LocalDestination;
pub use lock::DestinationLocks;
pub use memory::MemoryDestination;

/// One row of a destination listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteObject {
    pub name: String,
    pub size: u64,
}

#[async_trait]
pub trait Destination: Send + Sync {
    /// Stable identity used to serialize operations against the same storage.
    fn id(&self) -> String;

    async fn list(&self) -> Result<Vec<RemoteObject>>;

    async fn put(&self, name: &str, data: Bytes) -> Result<()>;

    async fn get(&self, name: &str) -> Result<Bytes>;

    /// Deleting a missing object succeeds.
    async fn delete(&self, name: &str) -> Result<()>;

    /// Leftovers of writes that never completed, hidden from [`list`] but
    /// removable with [`delete`].
    ///
    /// [`list`]: Destination::list
    /// [`delete`]: Destination::delete
    async fn list_incomplete(&self) -> Result<Vec<RemoteObject>> {
        Ok(Vec::new())
    }
}

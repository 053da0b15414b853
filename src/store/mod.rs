//! Durable key-value persistence for queue, registry and cache state.
//!
//! Everything the sync core remembers between runs goes through
//! [`DurableStore`]: named blobs that can be read, replaced or deleted.

mod memory;
mod sqlite;

use async_trait::async_trait;

use crate::error::SyncResult;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Trait for durable store backends.
///
/// Every call is a suspension point; callers must not assume the value
/// they read is still current after awaiting something else.
#[async_trait]
pub trait DurableStore: Send + Sync {
  /// Read a blob, `None` if the key was never written or was deleted.
  async fn get(&self, key: &str) -> SyncResult<Option<Vec<u8>>>;

  /// Replace the blob stored under `key`.
  async fn set(&self, key: &str, value: &[u8]) -> SyncResult<()>;

  /// Delete a key. Deleting a missing key is not an error.
  async fn delete(&self, key: &str) -> SyncResult<()>;

  /// List keys starting with `prefix`, sorted.
  async fn keys(&self, prefix: &str) -> SyncResult<Vec<String>>;
}

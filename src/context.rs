//! Shared handle to durable state.
//!
//! The queue, registry, cache and orchestrator are all built from one
//! [`Context`], so tests can swap the store for a [`MemoryStore`].
//!
//! [`MemoryStore`]: crate::store::MemoryStore

use chrono::Utc;
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};

use crate::error::SyncResult;
use crate::ident::SequenceId;
use crate::store::DurableStore;

pub(crate) const QUEUE_KEY: &str = "write_queue";
pub(crate) const REGISTRY_KEY: &str = "temporary_entities";
const SEQUENCE_KEY: &str = "sequence";

/// Owns the durable store handle and serializes read-modify-write cycles.
#[derive(Clone)]
pub struct Context {
  store: Arc<dyn DurableStore>,
  write_lock: Arc<Mutex<()>>,
}

impl Context {
  pub fn new(store: impl DurableStore + 'static) -> Self {
    Self::from_shared(Arc::new(store))
  }

  pub fn from_shared(store: Arc<dyn DurableStore>) -> Self {
    Self {
      store,
      write_lock: Arc::new(Mutex::new(())),
    }
  }

  pub fn store(&self) -> &dyn DurableStore {
    self.store.as_ref()
  }

  /// Read and decode a JSON value without taking the write lock.
  ///
  /// Every write replaces a whole key, so readers see either the old or the
  /// new value, never a mix.
  pub async fn read_json<T: DeserializeOwned>(&self, key: &str) -> SyncResult<Option<T>> {
    match self.store.get(key).await? {
      Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
      None => Ok(None),
    }
  }

  /// Take the write lock. Held for the whole read-modify-write of a key.
  pub async fn begin(&self) -> StateGuard<'_> {
    StateGuard {
      ctx: self,
      _guard: self.write_lock.lock().await,
    }
  }
}

/// Exclusive access to the queue and registry keys.
pub struct StateGuard<'a> {
  ctx: &'a Context,
  _guard: MutexGuard<'a, ()>,
}

impl StateGuard<'_> {
  pub async fn read_json<T: DeserializeOwned>(&self, key: &str) -> SyncResult<Option<T>> {
    self.ctx.read_json(key).await
  }

  pub async fn write_json<T: Serialize + Sync>(&self, key: &str, value: &T) -> SyncResult<()> {
    let bytes = serde_json::to_vec(value)?;
    self.ctx.store.set(key, &bytes).await
  }

  /// Allocate the next device-local sequence id and persist the high-water mark.
  pub async fn next_sequence(&self) -> SyncResult<SequenceId> {
    let last: Option<SequenceId> = self.read_json(SEQUENCE_KEY).await?;
    let now = u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0);
    let next = SequenceId::next_after(last, now);
    self.write_json(SEQUENCE_KEY, &next).await?;
    Ok(next)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::store::MemoryStore;

  #[tokio::test]
  async fn test_sequence_strictly_increases() {
    let ctx = Context::new(MemoryStore::new());
    let guard = ctx.begin().await;
    let mut last = guard.next_sequence().await.unwrap();
    for _ in 0..50 {
      let next = guard.next_sequence().await.unwrap();
      assert!(next > last);
      last = next;
    }
  }

  #[tokio::test]
  async fn test_sequence_survives_new_context() {
    let store: Arc<dyn DurableStore> = Arc::new(MemoryStore::new());
    let first = Context::from_shared(store.clone());
    let a = first.begin().await.next_sequence().await.unwrap();

    let second = Context::from_shared(store);
    let b = second.begin().await.next_sequence().await.unwrap();
    assert!(b > a);
  }
}

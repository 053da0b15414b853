//! In-memory store, used in tests and when no persistence is wanted.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Mutex;

use super::DurableStore;
use crate::error::{SyncError, SyncResult};

/// Volatile store with an optional byte quota.
#[derive(Default)]
pub struct MemoryStore {
  entries: Mutex<BTreeMap<String, Vec<u8>>>,
  quota: Option<usize>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  /// Store that reports [`SyncError::StorageExhausted`] once the total size
  /// of all values would exceed `bytes`.
  pub fn with_quota(bytes: usize) -> Self {
    Self {
      entries: Mutex::new(BTreeMap::new()),
      quota: Some(bytes),
    }
  }

  fn lock(&self) -> SyncResult<std::sync::MutexGuard<'_, BTreeMap<String, Vec<u8>>>> {
    self
      .entries
      .lock()
      .map_err(|e| SyncError::Storage(format!("Lock poisoned: {}", e)))
  }
}

#[async_trait]
impl DurableStore for MemoryStore {
  async fn get(&self, key: &str) -> SyncResult<Option<Vec<u8>>> {
    Ok(self.lock()?.get(key).cloned())
  }

  async fn set(&self, key: &str, value: &[u8]) -> SyncResult<()> {
    let mut entries = self.lock()?;
    if let Some(quota) = self.quota {
      let used: usize = entries
        .iter()
        .filter(|(k, _)| k.as_str() != key)
        .map(|(_, v)| v.len())
        .sum();
      if used + value.len() > quota {
        return Err(SyncError::StorageExhausted);
      }
    }
    entries.insert(key.to_string(), value.to_vec());
    Ok(())
  }

  async fn delete(&self, key: &str) -> SyncResult<()> {
    self.lock()?.remove(key);
    Ok(())
  }

  async fn keys(&self, prefix: &str) -> SyncResult<Vec<String>> {
    Ok(
      self
        .lock()?
        .keys()
        .filter(|k| k.starts_with(prefix))
        .cloned()
        .collect(),
    )
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_quota_exhaustion() {
    let store = MemoryStore::with_quota(4);
    store.set("a", b"abc").await.unwrap();
    // Replacing a key only counts the new value.
    store.set("a", b"abcd").await.unwrap();
    assert!(matches!(
      store.set("b", b"x").await,
      Err(SyncError::StorageExhausted)
    ));
    assert_eq!(store.get("b").await.unwrap(), None);
  }
}

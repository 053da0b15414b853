//! Response cache over the durable store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::context::Context;
use crate::error::SyncResult;

const CACHE_PREFIX: &str = "cache:";

/// A stored server response for one endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheRecord {
  /// Endpoint the response came from, as requested
  pub key: String,
  pub value: Value,
  pub stored_at: DateTime<Utc>,
}

/// Endpoint-keyed response cache.
#[derive(Clone)]
pub struct ResponseCache {
  ctx: Context,
}

impl ResponseCache {
  pub fn new(ctx: Context) -> Self {
    Self { ctx }
  }

  /// Overwrite the cached response for `endpoint`.
  pub async fn store(&self, endpoint: &str, value: &Value) -> SyncResult<()> {
    let record = CacheRecord {
      key: endpoint.to_string(),
      value: value.clone(),
      stored_at: Utc::now(),
    };
    let bytes = serde_json::to_vec(&record)?;
    self.ctx.store().set(&storage_key(endpoint), &bytes).await?;
    debug!(endpoint, "Cached response");
    Ok(())
  }

  /// Last stored response for `endpoint`, if any.
  pub async fn fetch(&self, endpoint: &str) -> SyncResult<Option<CacheRecord>> {
    self.ctx.read_json(&storage_key(endpoint)).await
  }

  /// Number of endpoints with a cached response.
  pub async fn len(&self) -> SyncResult<usize> {
    Ok(self.ctx.store().keys(CACHE_PREFIX).await?.len())
  }
}

/// Store key for an endpoint: a SHA256 of the normalized endpoint so keys are
/// fixed-length regardless of query strings.
fn storage_key(endpoint: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(normalize_endpoint(endpoint).as_bytes());
  format!("{}{}", CACHE_PREFIX, hex::encode(hasher.finalize()))
}

/// Trims whitespace and a trailing slash so `/subjects/` and `/subjects` share a record.
fn normalize_endpoint(endpoint: &str) -> &str {
  let trimmed = endpoint.trim();
  match trimmed.strip_suffix('/') {
    Some(rest) if !rest.is_empty() => rest,
    _ => trimmed,
  }
}

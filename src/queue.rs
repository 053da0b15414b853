//! Ordered list of mutations waiting for the remote service.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::context::{Context, StateGuard, QUEUE_KEY};
use crate::error::{SyncError, SyncResult};
use crate::ident::SequenceId;
use crate::payload::MutationPayload;
use crate::registry;

/// A pending mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
  pub id: SequenceId,
  pub payload: MutationPayload,
  pub created_at: DateTime<Utc>,
  /// Failed sync attempts so far
  #[serde(default)]
  pub attempts: u32,
  /// Why the most recent attempt failed, for the manual-review list
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub last_error: Option<String>,
}

/// Durable FIFO of [`QueueEntry`] values.
///
/// The whole queue lives under one store key and is replaced on every
/// change, so a reader never sees a partially written entry.
#[derive(Clone)]
pub struct WriteQueue {
  ctx: Context,
}

impl WriteQueue {
  pub fn new(ctx: Context) -> Self {
    Self { ctx }
  }

  /// Append a mutation and persist it before returning its id.
  ///
  /// Fails with [`SyncError::NotFound`] if the payload references a temporary
  /// id that is not registered.
  pub async fn enqueue(&self, payload: MutationPayload) -> SyncResult<SequenceId> {
    let guard = self.ctx.begin().await;
    registry::check_registered(&registry::load(&guard).await?, payload.unresolved())?;
    let mut entries = load(&guard).await?;
    let id = guard.next_sequence().await?;

    debug!(%id, kind = %payload.kind, "Queueing mutation");
    entries.push(QueueEntry {
      id,
      payload,
      created_at: Utc::now(),
      attempts: 0,
      last_error: None,
    });
    guard.write_json(QUEUE_KEY, &entries).await?;

    Ok(id)
  }

  /// All entries, oldest first.
  pub async fn list(&self) -> SyncResult<Vec<QueueEntry>> {
    Ok(self.ctx.read_json(QUEUE_KEY).await?.unwrap_or_default())
  }

  pub async fn get(&self, id: SequenceId) -> SyncResult<Option<QueueEntry>> {
    Ok(self.list().await?.into_iter().find(|e| e.id == id))
  }

  pub async fn count(&self) -> SyncResult<usize> {
    Ok(self.list().await?.len())
  }

  /// Drop an entry. Unknown ids are ignored.
  pub async fn remove(&self, id: SequenceId) -> SyncResult<()> {
    let guard = self.ctx.begin().await;
    let mut entries = load(&guard).await?;
    let before = entries.len();
    entries.retain(|e| e.id != id);
    if entries.len() != before {
      guard.write_json(QUEUE_KEY, &entries).await?;
      debug!(%id, "Removed queue entry");
    }
    Ok(())
  }

  /// Note a failed sync attempt on the entry, if it still exists.
  pub async fn record_failure(&self, id: SequenceId, error: &SyncError) -> SyncResult<()> {
    let guard = self.ctx.begin().await;
    let mut entries = load(&guard).await?;
    if let Some(entry) = entries.iter_mut().find(|e| e.id == id) {
      entry.attempts += 1;
      entry.last_error = Some(error.to_string());
      guard.write_json(QUEUE_KEY, &entries).await?;
    }
    Ok(())
  }
}

pub(crate) async fn load(guard: &StateGuard<'_>) -> SyncResult<Vec<QueueEntry>> {
  Ok(guard.read_json(QUEUE_KEY).await?.unwrap_or_default())
}

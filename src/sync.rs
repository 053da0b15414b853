//! Reconciliation of locally stored writes against the remote service.
//!
//! A pass first creates every temporary entity (patching references to it as
//! soon as its real id is known), then replays the write queue oldest-first.
//! Failures are counted per item and never stop the pass.

use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::EndpointTable;
use crate::context::Context;
use crate::error::{SyncError, SyncResult};
use crate::ident::{LocalId, RemoteId, SequenceId, TEMP_PREFIX};
use crate::payload::{fields_to_wire, Operation};
use crate::queue::{QueueEntry, WriteQueue};
use crate::registry::{TemporaryEntity, TemporaryRegistry};
use crate::remote::{extract_id, RemoteApi, Route};

/// Outcome of a sync pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
  pub success_count: usize,
  pub fail_count: usize,
  /// Temporary ids that received a real id during the pass
  pub resolved: BTreeMap<LocalId, RemoteId>,
}

impl fmt::Display for SyncReport {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} synced, {} failed", self.success_count, self.fail_count)
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncState {
  Idle,
  Syncing,
  /// Last run finished. A new run may start from here.
  Completed(SyncReport),
}

/// A single record to sync on demand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncTarget {
  Entry(SequenceId),
  Temporary(LocalId),
}

impl FromStr for SyncTarget {
  type Err = SyncError;

  /// `TEMP_...` names a temporary entity, a number names a queue entry.
  fn from_str(s: &str) -> SyncResult<Self> {
    let s = s.trim();
    if s.starts_with(TEMP_PREFIX) {
      return LocalId::try_from(s.to_string()).map(Self::Temporary);
    }
    s.parse::<u64>()
      .map(|n| Self::Entry(SequenceId(n)))
      .map_err(|_| SyncError::InvalidIdentifier(s.to_string()))
  }
}

impl fmt::Display for SyncTarget {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Entry(id) => id.fmt(f),
      Self::Temporary(id) => id.fmt(f),
    }
  }
}

/// Result of syncing a single record.
#[derive(Debug, Clone, PartialEq)]
pub enum SingleSyncOutcome {
  /// Queue entry applied; carries the remote response body.
  Entry(Value),
  /// Temporary entity created; carries its real id.
  Temporary(RemoteId),
}

/// Drives sync passes. Clones share the reentrancy guard and state channel.
#[derive(Clone)]
pub struct SyncOrchestrator {
  remote: Arc<dyn RemoteApi>,
  queue: WriteQueue,
  registry: TemporaryRegistry,
  endpoints: EndpointTable,
  id_field: String,
  running: Arc<AtomicBool>,
  state: Arc<watch::Sender<SyncState>>,
}

/// Clears the running flag when a run ends, including on early return.
struct RunGuard {
  running: Arc<AtomicBool>,
}

impl Drop for RunGuard {
  fn drop(&mut self) {
    self.running.store(false, Ordering::Release);
  }
}

impl SyncOrchestrator {
  pub fn new(
    ctx: &Context,
    remote: Arc<dyn RemoteApi>,
    endpoints: EndpointTable,
    id_field: impl Into<String>,
  ) -> Self {
    let (state, _rx) = watch::channel(SyncState::Idle);
    Self {
      remote,
      queue: WriteQueue::new(ctx.clone()),
      registry: TemporaryRegistry::new(ctx.clone()),
      endpoints,
      id_field: id_field.into(),
      running: Arc::new(AtomicBool::new(false)),
      state: Arc::new(state),
    }
  }

  pub fn state(&self) -> SyncState {
    self.state.borrow().clone()
  }

  pub fn subscribe(&self) -> watch::Receiver<SyncState> {
    self.state.subscribe()
  }

  fn try_begin(&self) -> SyncResult<RunGuard> {
    self
      .running
      .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
      .map_err(|_| SyncError::SyncInProgress)?;
    self.state.send_replace(SyncState::Syncing);
    Ok(RunGuard {
      running: Arc::clone(&self.running),
    })
  }

  /// Release the guard, then publish. A subscriber reacting to the new state
  /// can start the next run straight away.
  fn finish(&self, guard: RunGuard, next: SyncState) {
    drop(guard);
    self.state.send_replace(next);
  }

  /// Run one full pass over everything stored locally.
  ///
  /// Returns [`SyncError::SyncInProgress`] if another run is active. Only
  /// storage failures end the pass early; remote failures are counted.
  pub async fn run_pass(&self) -> SyncResult<SyncReport> {
    let guard = self.try_begin()?;
    let result = self.pass().await;
    let next = match &result {
      Ok(report) => SyncState::Completed(report.clone()),
      Err(_) => SyncState::Idle,
    };
    self.finish(guard, next);
    result
  }

  async fn pass(&self) -> SyncResult<SyncReport> {
    let mut report = SyncReport::default();

    let entities = self.registry.list(None).await?;
    info!(temporary = entities.len(), "Sync pass started");

    for snapshot in entities {
      // Re-read: the user may have discarded it, or an earlier creation in
      // this pass may have patched its references.
      let Some(entity) = self.registry.get(&snapshot.temporary_id).await? else {
        debug!(id = %snapshot.temporary_id, "Temporary entity discarded mid-pass");
        continue;
      };

      match self.create_temporary(&entity).await {
        Ok(real) => {
          report.success_count += 1;
          report.resolved.insert(entity.temporary_id, real);
        }
        Err(e) if e.is_storage() => return Err(e),
        Err(e) => {
          warn!(id = %entity.temporary_id, kind = %entity.kind, error = %e, "Temporary entity not synced");
          self.registry.record_failure(&entity.temporary_id, &e).await?;
          report.fail_count += 1;
        }
      }
    }

    let entries = self.queue.list().await?;
    info!(queued = entries.len(), "Replaying write queue");

    for snapshot in entries {
      let Some(entry) = self.queue.get(snapshot.id).await? else {
        debug!(id = %snapshot.id, "Queue entry discarded mid-pass");
        continue;
      };

      match self.submit_entry(&entry).await {
        Ok(_) => {
          self.queue.remove(entry.id).await?;
          report.success_count += 1;
        }
        Err(e) if e.is_storage() => return Err(e),
        Err(e) => {
          warn!(id = %entry.id, kind = %entry.payload.kind, error = %e, "Queue entry not synced");
          self.queue.record_failure(entry.id, &e).await?;
          report.fail_count += 1;
        }
      }
    }

    info!(
      success = report.success_count,
      failed = report.fail_count,
      "Sync pass completed"
    );
    Ok(report)
  }

  /// Sync exactly one record, with the same bookkeeping as a full pass.
  pub async fn run_single(&self, target: &SyncTarget) -> SyncResult<SingleSyncOutcome> {
    let guard = self.try_begin()?;
    let mut report = SyncReport::default();

    let result = match target {
      SyncTarget::Entry(id) => self.single_entry(*id).await.map(SingleSyncOutcome::Entry),
      SyncTarget::Temporary(id) => {
        let outcome = self.single_temporary(id).await;
        if let Ok(real) = &outcome {
          report.resolved.insert(id.clone(), real.clone());
        }
        outcome.map(SingleSyncOutcome::Temporary)
      }
    };

    match &result {
      Ok(_) => report.success_count = 1,
      Err(e) if e.is_storage() || matches!(e, SyncError::NotFound(_)) => {}
      Err(_) => report.fail_count = 1,
    }
    self.finish(guard, SyncState::Completed(report));
    result
  }

  async fn single_entry(&self, id: SequenceId) -> SyncResult<Value> {
    let entry = self
      .queue
      .get(id)
      .await?
      .ok_or_else(|| SyncError::NotFound(format!("queue entry {}", id)))?;

    match self.submit_entry(&entry).await {
      Ok(response) => {
        self.queue.remove(id).await?;
        Ok(response)
      }
      Err(e) => {
        if !e.is_storage() {
          self.queue.record_failure(id, &e).await?;
        }
        Err(e)
      }
    }
  }

  async fn single_temporary(&self, id: &LocalId) -> SyncResult<RemoteId> {
    let entity = self
      .registry
      .get(id)
      .await?
      .ok_or_else(|| SyncError::NotFound(format!("temporary entity {}", id)))?;

    match self.create_temporary(&entity).await {
      Ok(real) => Ok(real),
      Err(e) => {
        if !e.is_storage() {
          self.registry.record_failure(id, &e).await?;
        }
        Err(e)
      }
    }
  }

  /// Create the entity remotely, then swap its temporary id for the real one
  /// everywhere and drop it from the registry.
  async fn create_temporary(&self, entity: &TemporaryEntity) -> SyncResult<RemoteId> {
    let route = Route::create(&self.endpoints, &entity.kind)?;
    let body = fields_to_wire(&entity.fields)?;

    let response = self.remote.send(route.method, &route.path, Some(body)).await?;
    let real = extract_id(&response, &self.id_field)?;

    self.registry.resolve(&entity.temporary_id, &real).await?;
    debug!(temporary = %entity.temporary_id, %real, "Temporary entity synced");
    Ok(real)
  }

  /// Send a queued mutation. Refuses, without a remote call, while any
  /// reference is still temporary.
  async fn submit_entry(&self, entry: &QueueEntry) -> SyncResult<Value> {
    if let Some(dependency) = entry.payload.first_unresolved() {
      return Err(SyncError::DependencyUnresolved(dependency.clone()));
    }

    let route = Route::for_mutation(&self.endpoints, &entry.payload)?;
    let body = match entry.payload.operation {
      Operation::Delete => None,
      Operation::Create | Operation::Update => Some(entry.payload.to_wire()?),
    };

    let response = self.remote.send(route.method, &route.path, body).await?;
    debug!(id = %entry.id, method = %route.method, path = %route.path, "Queue entry synced");
    Ok(response)
  }
}

use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::cache::ResponseCache;
use crate::config::Config;
use crate::connectivity::{Connectivity, Transition};
use crate::context::Context;
use crate::error::{SyncError, SyncResult};
use crate::gate::RequestGate;
use crate::ident::{LocalId, SequenceId};
use crate::payload::{EntityKind, Fields, MutationPayload};
use crate::queue::{QueueEntry, WriteQueue};
use crate::registry::{TemporaryEntity, TemporaryRegistry};
use crate::remote::RemoteApi;
use crate::sync::{SingleSyncOutcome, SyncOrchestrator, SyncReport, SyncTarget};

/// Everything waiting to be synced, for the pending badge and review list.
#[derive(Debug, Clone)]
pub struct Pending {
  pub entries: Vec<QueueEntry>,
  pub temporaries: Vec<TemporaryEntity>,
}

impl Pending {
  pub fn count(&self) -> usize {
    self.entries.len() + self.temporaries.len()
  }
}

/// The sync core wired together: one store, one connectivity signal,
/// one orchestrator. Cloning shares all of them.
#[derive(Clone)]
pub struct App {
  connectivity: Connectivity,
  gate: RequestGate,
  sync: SyncOrchestrator,
  queue: WriteQueue,
  registry: TemporaryRegistry,
  cache: ResponseCache,
  refresh_after_sync: Arc<Vec<String>>,
}

impl App {
  pub fn new(
    config: &Config,
    ctx: Context,
    remote: Arc<dyn RemoteApi>,
    connectivity: Connectivity,
  ) -> Self {
    let gate = RequestGate::new(
      &ctx,
      Arc::clone(&remote),
      connectivity.clone(),
      config.endpoints.clone(),
      config.temporary_kinds.clone(),
    );
    let sync = SyncOrchestrator::new(
      &ctx,
      remote,
      config.endpoints.clone(),
      config.api.id_field.clone(),
    );

    Self {
      connectivity,
      gate,
      sync,
      queue: WriteQueue::new(ctx.clone()),
      registry: TemporaryRegistry::new(ctx.clone()),
      cache: ResponseCache::new(ctx),
      refresh_after_sync: Arc::new(config.refresh_after_sync.clone()),
    }
  }

  pub fn gate(&self) -> &RequestGate {
    &self.gate
  }

  pub fn orchestrator(&self) -> &SyncOrchestrator {
    &self.sync
  }

  pub fn connectivity(&self) -> &Connectivity {
    &self.connectivity
  }

  pub fn cache(&self) -> &ResponseCache {
    &self.cache
  }

  /// Queue a mutation directly, bypassing the gate.
  pub async fn enqueue(&self, payload: MutationPayload) -> SyncResult<SequenceId> {
    self.queue.enqueue(payload).await
  }

  /// Register an entity created offline, bypassing the gate.
  pub async fn create_temporary(&self, kind: EntityKind, fields: Fields) -> SyncResult<LocalId> {
    self.registry.create(kind, fields).await
  }

  pub async fn pending(&self) -> SyncResult<Pending> {
    Ok(Pending {
      entries: self.queue.list().await?,
      temporaries: self.registry.list(None).await?,
    })
  }

  pub async fn pending_count(&self) -> SyncResult<usize> {
    Ok(self.queue.count().await? + self.registry.count().await?)
  }

  /// Drop a queued mutation or temporary entity the user gave up on.
  pub async fn discard(&self, target: &SyncTarget) -> SyncResult<()> {
    info!(%target, "Discarding pending item");
    match target {
      SyncTarget::Entry(id) => self.queue.remove(*id).await,
      SyncTarget::Temporary(id) => self.registry.remove(id).await,
    }
  }

  /// Run a full pass, then refresh the configured read endpoints if
  /// anything reached the server.
  pub async fn sync_now(&self) -> SyncResult<SyncReport> {
    let report = self.sync.run_pass().await?;
    if report.success_count > 0 {
      self.refresh_cache().await?;
    }
    Ok(report)
  }

  pub async fn sync_one(&self, target: &SyncTarget) -> SyncResult<SingleSyncOutcome> {
    let outcome = self.sync.run_single(target).await?;
    self.refresh_cache().await?;
    Ok(outcome)
  }

  async fn refresh_cache(&self) -> SyncResult<()> {
    for endpoint in self.refresh_after_sync.iter() {
      let result = self.gate.get(endpoint).await?;
      debug!(endpoint, source = ?result.source, "Refreshed after sync");
    }
    Ok(())
  }

  /// Run a sync pass every time connectivity comes back.
  pub fn spawn_auto_sync(&self) -> JoinHandle<()> {
    let app = self.clone();
    let mut events = self.connectivity.subscribe();

    tokio::spawn(async move {
      while let Some(transition) = events.next().await {
        if transition != Transition::WentOnline {
          continue;
        }
        match app.sync_now().await {
          Ok(report) => info!(%report, "Sync after reconnect finished"),
          Err(SyncError::SyncInProgress) => debug!("Sync already running, skipping"),
          Err(e) => error!(error = %e, "Sync after reconnect failed"),
        }
      }
    })
  }
}

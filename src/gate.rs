//! Connectivity-aware wrapper around every outbound call.
//!
//! Reads go to the network and fall back to the response cache. Writes go to
//! the network when online, and to the write queue or temporary registry when
//! the device is known to be offline.

use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cache::{CacheResult, ResponseCache};
use crate::config::EndpointTable;
use crate::connectivity::Connectivity;
use crate::context::Context;
use crate::error::{SyncError, SyncResult};
use crate::ident::{LocalId, SequenceId};
use crate::payload::{EntityKind, MutationPayload, Operation};
use crate::queue::WriteQueue;
use crate::registry::TemporaryRegistry;
use crate::remote::{RemoteApi, Route};

/// What happened to a mutation handed to the gate.
#[derive(Debug)]
pub enum MutationOutcome {
  /// Applied by the remote service; carries its response body.
  Sent(Value),
  /// Stored in the write queue for a later sync pass.
  Queued(SequenceId),
  /// Stored as a temporary entity; the id can be referenced right away.
  CreatedLocally(LocalId),
  /// Online, but the remote call failed. Nothing was stored; the caller may
  /// hand the payload to [`RequestGate::enqueue_fallback`].
  Failed {
    error: SyncError,
    payload: MutationPayload,
  },
}

#[derive(Clone)]
pub struct RequestGate {
  remote: Arc<dyn RemoteApi>,
  connectivity: Connectivity,
  cache: ResponseCache,
  queue: WriteQueue,
  registry: TemporaryRegistry,
  endpoints: EndpointTable,
  temporary_kinds: BTreeSet<EntityKind>,
}

impl RequestGate {
  pub fn new(
    ctx: &Context,
    remote: Arc<dyn RemoteApi>,
    connectivity: Connectivity,
    endpoints: EndpointTable,
    temporary_kinds: BTreeSet<EntityKind>,
  ) -> Self {
    Self {
      remote,
      connectivity,
      cache: ResponseCache::new(ctx.clone()),
      queue: WriteQueue::new(ctx.clone()),
      registry: TemporaryRegistry::new(ctx.clone()),
      endpoints,
      temporary_kinds,
    }
  }

  /// Read `endpoint`, refreshing the cache on success.
  ///
  /// Never fails for network reasons: when the remote is unreachable or
  /// refuses, the cached body is returned, or `null` marked
  /// [`CacheSource::Unavailable`] if nothing was cached.
  ///
  /// [`CacheSource::Unavailable`]: crate::cache::CacheSource::Unavailable
  pub async fn get(&self, endpoint: &str) -> SyncResult<CacheResult<Value>> {
    let error = if self.connectivity.is_online() {
      match self.remote.get(endpoint).await {
        Ok(body) => {
          self.cache.store(endpoint, &body).await?;
          return Ok(CacheResult::from_network(body));
        }
        Err(e) if e.is_remote() => e,
        Err(e) => return Err(e),
      }
    } else {
      SyncError::NetworkUnavailable("device offline".into())
    };

    match self.cache.fetch(endpoint).await? {
      Some(record) => {
        debug!(endpoint, %error, "Serving cached response");
        Ok(CacheResult::offline(record.value, record.stored_at))
      }
      None => {
        warn!(endpoint, %error, "No cached response available");
        Ok(CacheResult::unavailable(Value::Null))
      }
    }
  }

  /// Apply a create, update or delete.
  ///
  /// Offline, or when the payload still references a temporary entity, the
  /// mutation is stored locally without touching the network. References to
  /// temporary ids that are no longer registered fail with
  /// [`SyncError::NotFound`].
  pub async fn mutate(&self, payload: MutationPayload) -> SyncResult<MutationOutcome> {
    self.endpoints.collection(&payload.kind)?;

    if !self.connectivity.is_online() {
      return self.defer(payload).await;
    }
    if let Some(dependency) = payload.first_unresolved() {
      info!(%dependency, "Mutation depends on an unsynced entity, deferring");
      return self.defer(payload).await;
    }

    let route = Route::for_mutation(&self.endpoints, &payload)?;
    let body = match payload.operation {
      Operation::Delete => None,
      Operation::Create | Operation::Update => Some(payload.to_wire()?),
    };

    match self.remote.send(route.method, &route.path, body).await {
      Ok(response) => Ok(MutationOutcome::Sent(response)),
      Err(error) if error.is_remote() => {
        warn!(method = %route.method, path = %route.path, %error, "Mutation failed while online");
        Ok(MutationOutcome::Failed { error, payload })
      }
      Err(error) => Err(error),
    }
  }

  /// Store a mutation that failed online, after the user agreed to keep it.
  pub async fn enqueue_fallback(&self, payload: MutationPayload) -> SyncResult<MutationOutcome> {
    self.defer(payload).await
  }

  async fn defer(&self, payload: MutationPayload) -> SyncResult<MutationOutcome> {
    if payload.operation == Operation::Create && self.temporary_kinds.contains(&payload.kind) {
      let id = self.registry.create(payload.kind, payload.fields).await?;
      return Ok(MutationOutcome::CreatedLocally(id));
    }
    let id = self.queue.enqueue(payload).await?;
    Ok(MutationOutcome::Queued(id))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::CacheSource;
  use crate::ident::{Identifier, RemoteId};
  use crate::remote::{Method, ScriptedRemote};
  use crate::store::MemoryStore;
  use serde_json::json;

  struct Harness {
    gate: RequestGate,
    remote: Arc<ScriptedRemote>,
    connectivity: Connectivity,
    queue: WriteQueue,
    registry: TemporaryRegistry,
  }

  fn harness(online: bool) -> Harness {
    let ctx = Context::new(MemoryStore::new());
    let remote = Arc::new(ScriptedRemote::new());
    let connectivity = Connectivity::new(online);
    let gate = RequestGate::new(
      &ctx,
      remote.clone(),
      connectivity.clone(),
      EndpointTable::from_pairs([("grade", "/grades"), ("assessment", "/assessment-categories")]),
      [EntityKind::new("assessment")].into_iter().collect(),
    );
    Harness {
      gate,
      remote,
      connectivity,
      queue: WriteQueue::new(ctx.clone()),
      registry: TemporaryRegistry::new(ctx),
    }
  }

  fn grade() -> MutationPayload {
    MutationPayload::create(EntityKind::new("grade")).with_value("score", json!(75))
  }

  #[tokio::test]
  async fn test_get_serves_cache_when_offline() {
    let h = harness(true);
    h.remote.respond_to("/subjects", json!(["Math", "History"]));

    let fresh = h.gate.get("/subjects").await.unwrap();
    assert_eq!(fresh.source, CacheSource::Network);

    h.connectivity.set_online(false);
    let cached = h.gate.get("/subjects").await.unwrap();
    assert_eq!(cached.source, CacheSource::Offline);
    assert!(cached.is_stale());
    assert_eq!(cached.data, json!(["Math", "History"]));
    assert_eq!(h.remote.calls().len(), 1);
  }

  #[tokio::test]
  async fn test_get_falls_back_on_transport_error() {
    let h = harness(true);
    h.remote.respond_to("/subjects", json!(["Math"]));
    h.gate.get("/subjects").await.unwrap();

    h.remote.set_offline(true);
    let result = h.gate.get("/subjects").await.unwrap();
    assert_eq!(result.source, CacheSource::Offline);
    assert_eq!(result.data, json!(["Math"]));
  }

  #[tokio::test]
  async fn test_get_without_cache_is_empty_not_error() {
    let h = harness(false);
    let result = h.gate.get("/students").await.unwrap();
    assert_eq!(result.source, CacheSource::Unavailable);
    assert_eq!(result.data, Value::Null);
  }

  #[tokio::test]
  async fn test_offline_mutation_is_queued_without_network() {
    let h = harness(false);
    let outcome = h.gate.mutate(grade()).await.unwrap();
    assert!(matches!(outcome, MutationOutcome::Queued(_)));
    assert_eq!(h.queue.count().await.unwrap(), 1);
    assert!(h.remote.calls().is_empty());
  }

  #[tokio::test]
  async fn test_offline_create_of_temporary_kind_goes_to_registry() {
    let h = harness(false);
    let payload = MutationPayload::create(EntityKind::new("assessment")).with_value("name", json!("Quiz"));
    let outcome = h.gate.mutate(payload).await.unwrap();

    let MutationOutcome::CreatedLocally(id) = outcome else {
      panic!("expected a temporary entity");
    };
    assert!(h.registry.get(&id).await.unwrap().is_some());
    assert_eq!(h.queue.count().await.unwrap(), 0);
  }

  #[tokio::test]
  async fn test_online_mutation_is_sent() {
    let h = harness(true);
    let outcome = h.gate.mutate(grade()).await.unwrap();
    let MutationOutcome::Sent(body) = outcome else {
      panic!("expected the mutation to be sent");
    };
    assert_eq!(body["id"], json!("R1"));

    let calls = h.remote.calls();
    assert_eq!(calls[0].method, Method::Post);
    assert_eq!(calls[0].path, "/grades");
    assert_eq!(h.queue.count().await.unwrap(), 0);
  }

  #[tokio::test]
  async fn test_online_failure_is_not_queued_automatically() {
    let h = harness(true);
    h.remote.reject_when(|_| true);

    let outcome = h.gate.mutate(grade()).await.unwrap();
    let MutationOutcome::Failed { error, payload } = outcome else {
      panic!("expected a failure");
    };
    assert!(matches!(error, SyncError::RemoteRejected { status: 422, .. }));
    assert_eq!(h.queue.count().await.unwrap(), 0);

    let queued = h.gate.enqueue_fallback(payload).await.unwrap();
    assert!(matches!(queued, MutationOutcome::Queued(_)));
    assert_eq!(h.queue.count().await.unwrap(), 1);
  }

  #[tokio::test]
  async fn test_online_mutation_with_temporary_ref_is_deferred() {
    let h = harness(false);
    let category = match h
      .gate
      .mutate(MutationPayload::create(EntityKind::new("assessment")))
      .await
      .unwrap()
    {
      MutationOutcome::CreatedLocally(id) => id,
      other => panic!("unexpected: {:?}", other),
    };

    h.connectivity.set_online(true);
    let outcome = h
      .gate
      .mutate(grade().with_ref("category", Identifier::Local(category)))
      .await
      .unwrap();
    assert!(matches!(outcome, MutationOutcome::Queued(_)));
    assert!(h.remote.calls().is_empty());
  }

  #[tokio::test]
  async fn test_reference_to_synced_entity_is_refused() {
    let h = harness(false);
    let category = h
      .registry
      .create(EntityKind::new("assessment"), Default::default())
      .await
      .unwrap();
    h.registry
      .resolve(&category, &RemoteId::new("R3").unwrap())
      .await
      .unwrap();

    let result = h
      .gate
      .mutate(grade().with_ref("category", Identifier::Local(category)))
      .await;
    assert!(matches!(result, Err(SyncError::NotFound(_))));
    assert_eq!(h.queue.count().await.unwrap(), 0);
  }

  #[tokio::test]
  async fn test_unknown_kind_is_refused_even_offline() {
    let h = harness(false);
    let result = h.gate.mutate(MutationPayload::create(EntityKind::new("attendance"))).await;
    assert!(matches!(result, Err(SyncError::UnknownKind(_))));
    assert_eq!(h.queue.count().await.unwrap(), 0);
  }
}

//! Entities created offline that are still waiting for a server id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::context::{Context, StateGuard, QUEUE_KEY, REGISTRY_KEY};
use crate::error::{SyncError, SyncResult};
use crate::ident::{LocalId, RemoteId};
use crate::payload::{local_refs, rewrite_fields, EntityKind, Fields};
use crate::queue;

/// A locally created record awaiting a server-assigned identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemporaryEntity {
  pub temporary_id: LocalId,
  pub kind: EntityKind,
  pub fields: Fields,
  pub created_at: DateTime<Utc>,
  #[serde(default)]
  pub attempts: u32,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub last_error: Option<String>,
}

/// Durable registry of [`TemporaryEntity`] records, in creation order.
#[derive(Clone)]
pub struct TemporaryRegistry {
  ctx: Context,
}

impl TemporaryRegistry {
  pub fn new(ctx: Context) -> Self {
    Self { ctx }
  }

  /// Record a new entity and hand back its temporary id.
  ///
  /// References to other temporary entities must name registered ones.
  pub async fn create(&self, kind: EntityKind, fields: Fields) -> SyncResult<LocalId> {
    let guard = self.ctx.begin().await;
    let mut entities = load(&guard).await?;
    check_registered(&entities, local_refs(&fields))?;
    let temporary_id = LocalId::from_sequence(guard.next_sequence().await?);

    debug!(id = %temporary_id, %kind, "Registering temporary entity");
    entities.push(TemporaryEntity {
      temporary_id: temporary_id.clone(),
      kind,
      fields,
      created_at: Utc::now(),
      attempts: 0,
      last_error: None,
    });
    guard.write_json(REGISTRY_KEY, &entities).await?;

    Ok(temporary_id)
  }

  /// Entities in creation order, optionally restricted to one kind.
  pub async fn list(&self, kind: Option<&EntityKind>) -> SyncResult<Vec<TemporaryEntity>> {
    let entities: Vec<TemporaryEntity> = self.ctx.read_json(REGISTRY_KEY).await?.unwrap_or_default();
    Ok(match kind {
      Some(kind) => entities.into_iter().filter(|e| &e.kind == kind).collect(),
      None => entities,
    })
  }

  pub async fn get(&self, id: &LocalId) -> SyncResult<Option<TemporaryEntity>> {
    Ok(self.list(None).await?.into_iter().find(|e| &e.temporary_id == id))
  }

  pub async fn count(&self) -> SyncResult<usize> {
    Ok(self.list(None).await?.len())
  }

  /// Drop an entity. Unknown ids are ignored.
  pub async fn remove(&self, id: &LocalId) -> SyncResult<()> {
    let guard = self.ctx.begin().await;
    let mut entities = load(&guard).await?;
    let before = entities.len();
    entities.retain(|e| &e.temporary_id != id);
    if entities.len() != before {
      guard.write_json(REGISTRY_KEY, &entities).await?;
      debug!(%id, "Removed temporary entity");
    }
    Ok(())
  }

  /// Point every reference to `old` at `new`, in queued mutations and in
  /// other temporary entities. Returns how many records changed.
  ///
  /// Holds the write lock throughout and replaces each key in one write.
  pub async fn rewrite_references(&self, old: &LocalId, new: &RemoteId) -> SyncResult<usize> {
    let guard = self.ctx.begin().await;
    let mut changed = rewrite_queue(&guard, old, new).await?;

    let mut entities = load(&guard).await?;
    let registry_changed = rewrite_entities(&mut entities, old, new);
    if registry_changed > 0 {
      guard.write_json(REGISTRY_KEY, &entities).await?;
      changed += registry_changed;
    }

    debug!(%old, %new, changed, "Rewrote references");
    Ok(changed)
  }

  /// Record that `old` now exists remotely as `new`: rewrite every reference
  /// and drop the entity, all under one lock. No reference to `old`
  /// outlives the entity.
  pub async fn resolve(&self, old: &LocalId, new: &RemoteId) -> SyncResult<usize> {
    let guard = self.ctx.begin().await;
    let mut changed = rewrite_queue(&guard, old, new).await?;

    let mut entities = load(&guard).await?;
    entities.retain(|e| &e.temporary_id != old);
    changed += rewrite_entities(&mut entities, old, new);
    guard.write_json(REGISTRY_KEY, &entities).await?;

    debug!(%old, %new, changed, "Resolved temporary entity");
    Ok(changed)
  }

  /// Note a failed creation attempt on the entity, if it still exists.
  pub async fn record_failure(&self, id: &LocalId, error: &SyncError) -> SyncResult<()> {
    let guard = self.ctx.begin().await;
    let mut entities = load(&guard).await?;
    if let Some(entity) = entities.iter_mut().find(|e| &e.temporary_id == id) {
      entity.attempts += 1;
      entity.last_error = Some(error.to_string());
      guard.write_json(REGISTRY_KEY, &entities).await?;
    }
    Ok(())
  }
}

pub(crate) async fn load(guard: &StateGuard<'_>) -> SyncResult<Vec<TemporaryEntity>> {
  Ok(guard.read_json(REGISTRY_KEY).await?.unwrap_or_default())
}

/// Refuse references to temporary ids that are not (or no longer) registered.
pub(crate) fn check_registered<'a>(
  entities: &[TemporaryEntity],
  ids: impl IntoIterator<Item = &'a LocalId>,
) -> SyncResult<()> {
  for id in ids {
    if !entities.iter().any(|e| &e.temporary_id == id) {
      return Err(SyncError::NotFound(format!("temporary entity {}", id)));
    }
  }
  Ok(())
}

async fn rewrite_queue(guard: &StateGuard<'_>, old: &LocalId, new: &RemoteId) -> SyncResult<usize> {
  let mut entries = queue::load(guard).await?;
  let mut changed = 0;
  for entry in entries.iter_mut() {
    if entry.payload.rewrite(old, new) {
      changed += 1;
    }
  }
  if changed > 0 {
    guard.write_json(QUEUE_KEY, &entries).await?;
  }
  Ok(changed)
}

fn rewrite_entities(entities: &mut [TemporaryEntity], old: &LocalId, new: &RemoteId) -> usize {
  let mut changed = 0;
  for entity in entities.iter_mut() {
    if rewrite_fields(&mut entity.fields, old, new) {
      changed += 1;
    }
  }
  changed
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::ident::{Identifier, TEMP_PREFIX};
  use crate::payload::{Field, MutationPayload};
  use crate::queue::WriteQueue;
  use crate::store::MemoryStore;
  use serde_json::json;

  fn setup() -> (TemporaryRegistry, WriteQueue) {
    let ctx = Context::new(MemoryStore::new());
    (TemporaryRegistry::new(ctx.clone()), WriteQueue::new(ctx))
  }

  fn category(name: &str) -> Fields {
    let mut fields = Fields::new();
    fields.insert("name".into(), Field::Value(json!(name)));
    fields
  }

  #[tokio::test]
  async fn test_create_allocates_unique_prefixed_ids() {
    let (registry, _) = setup();
    let a = registry.create(EntityKind::new("assessment"), category("Quiz")).await.unwrap();
    let b = registry.create(EntityKind::new("assessment"), category("Exam")).await.unwrap();

    assert_ne!(a, b);
    assert!(a.as_str().starts_with(TEMP_PREFIX));
    assert_eq!(registry.count().await.unwrap(), 2);
  }

  #[tokio::test]
  async fn test_list_filters_by_kind() {
    let (registry, _) = setup();
    registry.create(EntityKind::new("assessment"), category("Quiz")).await.unwrap();
    registry.create(EntityKind::new("term"), category("Fall")).await.unwrap();

    let assessments = registry.list(Some(&EntityKind::new("assessment"))).await.unwrap();
    assert_eq!(assessments.len(), 1);
    assert_eq!(assessments[0].kind.as_str(), "assessment");
    assert_eq!(registry.list(None).await.unwrap().len(), 2);
  }

  #[tokio::test]
  async fn test_remove_is_idempotent() {
    let (registry, _) = setup();
    let a = registry.create(EntityKind::new("assessment"), category("Quiz")).await.unwrap();
    registry.remove(&a).await.unwrap();
    registry.remove(&a).await.unwrap();
    assert_eq!(registry.count().await.unwrap(), 0);
  }

  #[tokio::test]
  async fn test_rewrite_references_patches_queue_and_registry() {
    let (registry, queue) = setup();
    let cat = registry.create(EntityKind::new("assessment"), category("Quiz")).await.unwrap();

    let mut child_fields = category("Quiz retake");
    child_fields.insert("parent".into(), Field::Ref(Identifier::Local(cat.clone())));
    let child = registry.create(EntityKind::new("assessment"), child_fields).await.unwrap();

    let grade = MutationPayload::create(EntityKind::new("grade"))
      .with_value("score", json!(88))
      .with_ref("category", Identifier::Local(cat.clone()));
    let entry_id = queue.enqueue(grade).await.unwrap();

    let real = RemoteId::new("R1").unwrap();
    let changed = registry.rewrite_references(&cat, &real).await.unwrap();
    assert_eq!(changed, 2);

    let entry = queue.get(entry_id).await.unwrap().unwrap();
    assert_eq!(
      entry.payload.fields.get("category"),
      Some(&Field::Ref(Identifier::Remote(real.clone())))
    );
    assert!(entry.payload.first_unresolved().is_none());

    let child = registry.get(&child).await.unwrap().unwrap();
    assert_eq!(
      child.fields.get("parent"),
      Some(&Field::Ref(Identifier::Remote(real)))
    );
  }

  #[tokio::test]
  async fn test_resolve_rewrites_and_drops_entity() {
    let (registry, queue) = setup();
    let cat = registry.create(EntityKind::new("assessment"), category("Quiz")).await.unwrap();
    let grade = MutationPayload::create(EntityKind::new("grade"))
      .with_ref("category", Identifier::Local(cat.clone()));
    let entry_id = queue.enqueue(grade).await.unwrap();

    let real = RemoteId::new("R7").unwrap();
    assert_eq!(registry.resolve(&cat, &real).await.unwrap(), 1);
    assert!(registry.get(&cat).await.unwrap().is_none());

    let entry = queue.get(entry_id).await.unwrap().unwrap();
    assert_eq!(
      entry.payload.fields.get("category"),
      Some(&Field::Ref(Identifier::Remote(real)))
    );
  }

  #[tokio::test]
  async fn test_references_to_resolved_entity_are_refused() {
    let (registry, queue) = setup();
    let cat = registry.create(EntityKind::new("assessment"), category("Quiz")).await.unwrap();
    registry.resolve(&cat, &RemoteId::new("R7").unwrap()).await.unwrap();

    let grade = MutationPayload::create(EntityKind::new("grade"))
      .with_ref("category", Identifier::Local(cat.clone()));
    assert!(matches!(queue.enqueue(grade).await, Err(SyncError::NotFound(_))));
    assert_eq!(queue.count().await.unwrap(), 0);

    let mut child = category("Retake");
    child.insert("parent".into(), Field::Ref(Identifier::Local(cat)));
    assert!(matches!(
      registry.create(EntityKind::new("assessment"), child).await,
      Err(SyncError::NotFound(_))
    ));
    assert_eq!(registry.count().await.unwrap(), 0);
  }
}

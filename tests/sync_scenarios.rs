use rollbook::cache::CacheSource;
use rollbook::config::EndpointTable;
use rollbook::connectivity::Connectivity;
use rollbook::context::Context;
use rollbook::gate::{MutationOutcome, RequestGate};
use rollbook::ident::{Identifier, LocalId, RemoteId, TEMP_PREFIX};
use rollbook::payload::{EntityKind, Field, Fields, MutationPayload};
use rollbook::queue::WriteQueue;
use rollbook::registry::TemporaryRegistry;
use rollbook::remote::{Method, ScriptedRemote};
use rollbook::store::MemoryStore;
use rollbook::sync::SyncOrchestrator;
use serde_json::json;
use std::sync::Arc;

struct World {
  gate: RequestGate,
  sync: SyncOrchestrator,
  queue: WriteQueue,
  registry: TemporaryRegistry,
  remote: Arc<ScriptedRemote>,
  connectivity: Connectivity,
}

fn world(online: bool) -> World {
  let ctx = Context::new(MemoryStore::new());
  let remote = Arc::new(ScriptedRemote::new());
  let connectivity = Connectivity::new(online);
  let endpoints = EndpointTable::from_pairs([
    ("assessment", "/assessment-categories"),
    ("grade", "/grades"),
  ]);

  World {
    gate: RequestGate::new(
      &ctx,
      remote.clone(),
      connectivity.clone(),
      endpoints.clone(),
      [EntityKind::new("assessment")].into_iter().collect(),
    ),
    sync: SyncOrchestrator::new(&ctx, remote.clone(), endpoints, "id"),
    queue: WriteQueue::new(ctx.clone()),
    registry: TemporaryRegistry::new(ctx),
    remote,
    connectivity,
  }
}

fn category(name: &str) -> Fields {
  let mut fields = Fields::new();
  fields.insert("name".into(), Field::Value(json!(name)));
  fields
}

fn grade_in(category: &LocalId) -> MutationPayload {
  MutationPayload::create(EntityKind::new("grade"))
    .with_value("student", json!("S-104"))
    .with_value("score", json!(17))
    .with_ref("category", Identifier::Local(category.clone()))
}

#[tokio::test]
async fn grade_follows_its_category_to_the_server() {
  let w = world(false);
  let a = w
    .registry
    .create(EntityKind::new("assessment"), category("Lab reports"))
    .await
    .unwrap();
  let entry = w.queue.enqueue(grade_in(&a)).await.unwrap();

  let report = w.sync.run_pass().await.unwrap();

  assert!(w.registry.get(&a).await.unwrap().is_none());
  assert_eq!(report.success_count, 2);
  assert_eq!(report.fail_count, 0);
  assert_eq!(report.resolved.get(&a), Some(&RemoteId::new("R1").unwrap()));
  assert_eq!(w.queue.count().await.unwrap(), 0);
  assert!(w.queue.get(entry).await.unwrap().is_none());

  let calls = w.remote.calls();
  assert_eq!(calls.len(), 2);
  assert_eq!(calls[1].path, "/grades");
  assert_eq!(calls[1].body.as_ref().unwrap()["category"], json!("R1"));
}

#[tokio::test]
async fn rewritten_reference_is_kept_when_grade_fails() {
  let w = world(false);
  let a = w
    .registry
    .create(EntityKind::new("assessment"), category("Lab reports"))
    .await
    .unwrap();
  let entry = w.queue.enqueue(grade_in(&a)).await.unwrap();
  w.remote.reject_when(|call| call.path == "/grades");

  let report = w.sync.run_pass().await.unwrap();
  assert_eq!((report.success_count, report.fail_count), (1, 1));

  let kept = w.queue.get(entry).await.unwrap().unwrap();
  assert_eq!(
    kept.payload.fields.get("category"),
    Some(&Field::Ref(Identifier::Remote(RemoteId::new("R1").unwrap())))
  );
  assert!(kept.payload.first_unresolved().is_none());
}

#[tokio::test]
async fn grade_is_held_back_when_its_category_fails() {
  let w = world(false);
  let a = w
    .registry
    .create(EntityKind::new("assessment"), category("Lab reports"))
    .await
    .unwrap();
  w.queue.enqueue(grade_in(&a)).await.unwrap();
  w.remote
    .reject_when(|call| call.path == "/assessment-categories");

  let report = w.sync.run_pass().await.unwrap();

  assert!(w.registry.get(&a).await.unwrap().is_some());
  assert_eq!(report.fail_count, 2);
  assert_eq!(report.success_count, 0);
  assert_eq!(w.queue.count().await.unwrap(), 1);

  // Only the category creation reached the server.
  let calls = w.remote.calls();
  assert_eq!(calls.len(), 1);
  assert!(calls.iter().all(|c| c.path != "/grades"));

  let entry = &w.queue.list().await.unwrap()[0];
  assert!(entry.last_error.as_deref().unwrap().contains("dependency not yet synced"));
}

#[tokio::test]
async fn three_offline_grades_drain_on_reconnect() {
  let w = world(false);
  for score in [12, 15, 19] {
    let payload = MutationPayload::create(EntityKind::new("grade")).with_value("score", json!(score));
    let outcome = w.gate.mutate(payload).await.unwrap();
    assert!(matches!(outcome, MutationOutcome::Queued(_)));
  }
  assert_eq!(w.queue.count().await.unwrap(), 3);
  assert!(w.remote.calls().is_empty());

  w.connectivity.set_online(true);
  let report = w.sync.run_pass().await.unwrap();
  assert_eq!(report.success_count, 3);
  assert_eq!(w.queue.count().await.unwrap(), 0);
}

#[tokio::test]
async fn subjects_are_served_from_cache_offline() {
  let w = world(true);
  w.remote.respond_to("/subjects", json!([{"id": 1, "name": "Chemistry"}]));

  let first = w.gate.get("/subjects").await.unwrap();
  assert_eq!(first.source, CacheSource::Network);

  w.connectivity.set_online(false);
  let second = w.gate.get("/subjects").await.unwrap();
  assert_eq!(second.source, CacheSource::Offline);
  assert_eq!(second.data, json!([{"id": 1, "name": "Chemistry"}]));
}

#[tokio::test]
async fn one_bad_category_does_not_block_the_others() {
  let w = world(false);
  let mut ids = Vec::new();
  for name in ["Quizzes", "Homework", "INVALID", "Projects", "Exams"] {
    ids.push(
      w.registry
        .create(EntityKind::new("assessment"), category(name))
        .await
        .unwrap(),
    );
  }
  w.remote.reject_when(|call| {
    call
      .body
      .as_ref()
      .is_some_and(|b| b["name"] == json!("INVALID"))
  });

  let report = w.sync.run_pass().await.unwrap();
  assert_eq!((report.success_count, report.fail_count), (4, 1));

  let left = w.registry.list(None).await.unwrap();
  assert_eq!(left.len(), 1);
  assert_eq!(left[0].temporary_id, ids[2]);
  assert_eq!(left[0].attempts, 1);

  for real in report.resolved.values() {
    assert!(!real.as_str().starts_with(TEMP_PREFIX));
  }
}

#[tokio::test]
async fn items_added_after_a_pass_go_out_with_the_next_one() {
  let w = world(true);
  w.queue
    .enqueue(MutationPayload::create(EntityKind::new("grade")).with_value("score", json!(1)))
    .await
    .unwrap();

  let report = w.sync.run_pass().await.unwrap();
  assert_eq!(report.success_count, 1);

  w.queue
    .enqueue(MutationPayload::create(EntityKind::new("grade")).with_value("score", json!(2)))
    .await
    .unwrap();
  let next = w.sync.run_pass().await.unwrap();
  assert_eq!(next.success_count, 1);
  assert_eq!(w.remote.calls().len(), 2);
  assert!(w.remote.calls().iter().all(|c| c.method == Method::Post));
}

#[tokio::test]
async fn failed_pass_can_be_rerun() {
  let w = world(true);
  w.queue
    .enqueue(MutationPayload::create(EntityKind::new("grade")).with_value("score", json!(1)))
    .await
    .unwrap();

  w.remote.set_offline(true);
  let first = w.sync.run_pass().await.unwrap();
  assert_eq!(first.fail_count, 1);
  assert_eq!(w.queue.count().await.unwrap(), 1);

  w.remote.set_offline(false);
  let second = w.sync.run_pass().await.unwrap();
  assert_eq!(second.success_count, 1);
  assert_eq!(w.queue.count().await.unwrap(), 0);
}

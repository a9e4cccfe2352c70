//! End-to-end scenarios for the memory engine with a deterministic
//! embedder, so the semantic thresholds (0.80 upsert, 0.90 delete) can be
//! pinned with exact cosine values.

use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use memcp_config::{AppConfig, ConfigHandle};
use memcp_memory::engine::{CreateRequest, UpdateRequest};
use memcp_memory::{
    Embedder, EmbeddedIndex, MemoryEngine, MemoryError, OperationLog, PersonaRegistry,
    SearchRequest, VectorIndex, spawn_workers,
};

const DIM: usize = 32;

/// Deterministic embedder: phrases in the table get hand-placed unit
/// vectors (so pairwise cosines are exact); everything else gets a hashed
/// pseudo-random unit vector, distinct per content.
struct StubEmbedder {
    table: HashMap<String, Vec<f32>>,
}

impl StubEmbedder {
    fn new(entries: &[(&str, &[f32])]) -> Self {
        let table = entries
            .iter()
            .map(|(text, head)| {
                let mut v = vec![0.0_f32; DIM];
                v[..head.len()].copy_from_slice(head);
                (text.to_string(), v)
            })
            .collect();
        Self { table }
    }

    fn hashed_vector(text: &str) -> Vec<f32> {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        text.hash(&mut hasher);
        let mut state = hasher.finish() | 1;
        let mut v = Vec::with_capacity(DIM);
        for _ in 0..DIM {
            // LCG over the text hash: deterministic, spread over the axes
            // the hand-placed vectors never touch heavily.
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            v.push(((state >> 33) as f32 / (u32::MAX >> 1) as f32) - 1.0);
        }
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        v.into_iter().map(|x| x / norm).collect()
    }
}

#[async_trait]
impl Embedder for StubEmbedder {
    async fn embed(&self, texts: &[String]) -> memcp_memory::Result<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|t| self.table.get(t).cloned().unwrap_or_else(|| Self::hashed_vector(t)))
            .collect())
    }

    fn dimension(&self) -> usize {
        DIM
    }
}

// Hand-placed geometry. e1 = strawberries axis, e2 = meeting axis.
// cos(a, e) for a = [c, sqrt(1-c^2)] against the unit axis is exactly c.
fn scenario_embedder() -> Arc<StubEmbedder> {
    Arc::new(StubEmbedder::new(&[
        ("likes strawberries", &[1.0, 0.0, 0.0, 0.0]),
        // 0.93 against the strawberries axis — above the delete bar.
        ("the strawberry thing exactly", &[0.93, 0.367_56, 0.0, 0.0]),
        // 0.83 — below the delete bar, above nothing destructive.
        ("the strawberry thing", &[0.83, 0.557_76, 0.0, 0.0]),
        ("meet at 10am tomorrow", &[0.0, 0.0, 1.0, 0.0]),
        ("meet at 11am tomorrow", &[0.0, 0.0, 1.0, 0.0]),
        // 0.95 against the meeting axis — updates in place.
        ("when is the meeting?", &[0.0, 0.0, 0.95, 0.312_25]),
        // 0.50 — under the upsert threshold, so a new memory is created.
        ("a barely related thought", &[0.0, 0.0, 0.5, 0.866_03]),
    ]))
}

fn engine_in(dir: &tempfile::TempDir, config: AppConfig) -> Arc<MemoryEngine> {
    let registry = Arc::new(PersonaRegistry::new(dir.path()));
    let oplog = Arc::new(OperationLog::new(dir.path().join("logs").join("operations.log")));
    Arc::new(MemoryEngine::new(
        registry,
        Arc::new(EmbeddedIndex::new()),
        Some(scenario_embedder()),
        None,
        oplog,
        Arc::new(ConfigHandle::fixed(config)),
    ))
}

fn create_content(content: &str) -> CreateRequest {
    CreateRequest {
        content: content.to_string(),
        ..CreateRequest::default()
    }
}

#[tokio::test]
async fn scenario_create_then_read_round_trips() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let engine = engine_in(&dir, AppConfig::default());
    let cancel = CancellationToken::new();

    let outcome = engine
        .create("alice", CreateRequest {
            content: "likes strawberries".to_string(),
            tags: vec!["food".to_string()],
            importance: Some(0.8),
            emotion: Some("joy".to_string()),
            ..CreateRequest::default()
        }, &cancel)
        .await?;

    let results = engine
        .read("alice", &outcome.key, SearchRequest::default(), &cancel)
        .await?;
    assert_eq!(results.len(), 1);
    let memory = &results[0].memory;
    assert_eq!(memory.content, "likes strawberries");
    assert!(memory.tags.contains("food"));
    assert_eq!(memory.importance, 0.8);
    assert_eq!(memory.emotion, "joy");
    assert_eq!(memory.physical_state, "normal");
    assert_eq!(memory.mental_state, "calm");
    assert_eq!(memory.created_at, memory.updated_at);
    Ok(())
}

#[tokio::test]
async fn scenario_personas_are_isolated() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let engine = engine_in(&dir, AppConfig::default());
    let cancel = CancellationToken::new();

    engine
        .create("alice", CreateRequest {
            content: "likes strawberries".to_string(),
            tags: vec!["food".to_string()],
            ..CreateRequest::default()
        }, &cancel)
        .await?;

    let results = engine
        .read("bob", "likes strawberries", SearchRequest {
            k: Some(5),
            ..SearchRequest::default()
        }, &cancel)
        .await?;
    assert!(results.is_empty());

    let bob_stats = engine.stats("bob").await?;
    assert_eq!(bob_stats.store.count, 0);
    let alice_stats = engine.stats("alice").await?;
    assert_eq!(alice_stats.store.count, 1);
    Ok(())
}

#[tokio::test]
async fn scenario_text_field_filters_match_by_substring() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let engine = engine_in(&dir, AppConfig::default());
    let cancel = CancellationToken::new();

    engine
        .create("alice", CreateRequest {
            content: "likes strawberries".to_string(),
            emotion: Some("joyful".to_string()),
            ..CreateRequest::default()
        }, &cancel)
        .await?;

    let joyful = engine
        .read("alice", "likes strawberries", SearchRequest {
            emotion: Some("joy".to_string()),
            ..SearchRequest::default()
        }, &cancel)
        .await?;
    assert_eq!(joyful.len(), 1);

    let sad = engine
        .read("alice", "likes strawberries", SearchRequest {
            emotion: Some("sad".to_string()),
            ..SearchRequest::default()
        }, &cancel)
        .await?;
    assert!(sad.is_empty());
    Ok(())
}

#[tokio::test]
async fn scenario_update_by_meaning_pins_the_threshold() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let engine = engine_in(&dir, AppConfig::default());
    let cancel = CancellationToken::new();

    let created = engine
        .create("alice", create_content("meet at 10am tomorrow"), &cancel)
        .await?;
    let original = engine
        .read("alice", &created.key, SearchRequest::default(), &cancel)
        .await?[0]
        .memory
        .clone();

    // Similarity 0.95 ≥ 0.80: the existing memory is updated in place.
    let updated = engine
        .update("alice", "when is the meeting?", UpdateRequest {
            content: Some("meet at 11am tomorrow".to_string()),
            ..UpdateRequest::default()
        }, &cancel)
        .await?;
    assert!(!updated.created);
    assert_eq!(updated.key, created.key);

    let after = engine
        .read("alice", &created.key, SearchRequest::default(), &cancel)
        .await?[0]
        .memory
        .clone();
    assert_eq!(after.content, "meet at 11am tomorrow");
    assert_eq!(after.created_at, original.created_at);
    assert!(after.updated_at > original.updated_at);

    // Similarity 0.50 < 0.80: a new memory is created instead.
    let upserted = engine
        .update("alice", "a barely related thought", UpdateRequest {
            content: Some("completely new note".to_string()),
            ..UpdateRequest::default()
        }, &cancel)
        .await?;
    assert!(upserted.created);
    assert_ne!(upserted.key, created.key);
    assert_eq!(engine.stats("alice").await?.store.count, 2);
    Ok(())
}

#[tokio::test]
async fn scenario_delete_by_query_respects_the_safety_threshold() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let engine = engine_in(&dir, AppConfig::default());
    let cancel = CancellationToken::new();

    engine
        .create("alice", create_content("likes strawberries"), &cancel)
        .await?;

    // Top hit at 0.83: nothing deleted, candidates listed.
    let below = engine.delete("alice", "the strawberry thing", &cancel).await?;
    assert!(below.deleted_keys.is_empty());
    assert!(!below.candidates.is_empty());
    assert_eq!(engine.stats("alice").await?.store.count, 1);

    // Top hit at 0.93: exactly one memory deleted.
    let above = engine
        .delete("alice", "the strawberry thing exactly", &cancel)
        .await?;
    assert_eq!(above.deleted_keys.len(), 1);
    assert_eq!(engine.stats("alice").await?.store.count, 0);
    Ok(())
}

#[tokio::test]
async fn delete_by_key_is_idempotent_in_its_not_found() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let engine = engine_in(&dir, AppConfig::default());
    let cancel = CancellationToken::new();

    let created = engine
        .create("alice", create_content("likes strawberries"), &cancel)
        .await?;
    engine
        .create("alice", create_content("meet at 10am tomorrow"), &cancel)
        .await?;

    let first = engine.delete("alice", &created.key, &cancel).await?;
    assert_eq!(first.deleted_keys, vec![created.key.clone()]);

    let second = engine.delete("alice", &created.key, &cancel).await;
    assert!(matches!(second, Err(MemoryError::NotFound(_))));
    // The other memory is untouched.
    assert_eq!(engine.stats("alice").await?.store.count, 1);
    Ok(())
}

#[tokio::test]
async fn importance_is_clamped_on_create_and_update() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let engine = engine_in(&dir, AppConfig::default());
    let cancel = CancellationToken::new();

    let created = engine
        .create("alice", CreateRequest {
            content: "likes strawberries".to_string(),
            importance: Some(7.5),
            ..CreateRequest::default()
        }, &cancel)
        .await?;
    let stored = engine
        .read("alice", &created.key, SearchRequest::default(), &cancel)
        .await?[0]
        .memory
        .clone();
    assert_eq!(stored.importance, 1.0);

    engine
        .update("alice", &created.key, UpdateRequest {
            importance: Some(-3.0),
            ..UpdateRequest::default()
        }, &cancel)
        .await?;
    let stored = engine
        .read("alice", &created.key, SearchRequest::default(), &cancel)
        .await?[0]
        .memory
        .clone();
    assert_eq!(stored.importance, 0.0);
    Ok(())
}

#[tokio::test]
async fn create_applies_context_bearing_fields_to_the_persona_context() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let engine = engine_in(&dir, AppConfig::default());
    let cancel = CancellationToken::new();

    engine
        .create("alice", CreateRequest {
            content: "likes strawberries".to_string(),
            emotion: Some("joy".to_string()),
            environment: Some("kitchen".to_string()),
            ..CreateRequest::default()
        }, &cancel)
        .await?;

    let session = engine.get_session_context("alice").await?;
    assert_eq!(session.context.current_emotion.as_deref(), Some("joy"));
    assert_eq!(session.context.environment.as_deref(), Some("kitchen"));
    assert_eq!(session.recent.len(), 1);
    Ok(())
}

#[tokio::test]
async fn context_helpers_follow_their_merge_semantics() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let engine = engine_in(&dir, AppConfig::default());
    let cancel = CancellationToken::new();

    assert!(engine.add_favourite("alice", "strawberries", &cancel).await?);
    assert!(!engine.add_favourite("alice", "Strawberries", &cancel).await?);
    engine.set_promise("alice", "bake a cake on sunday", &cancel).await?;
    engine.set_goal("alice", "learn to ice skate", &cancel).await?;
    engine
        .add_anniversary("alice", "first met", "2023-04-01", None, &cancel)
        .await?;
    engine
        .add_anniversary("alice", "first met", "2023-04-02", Some("corrected"), &cancel)
        .await?;
    engine
        .record_emotion_flow("alice", "excited", Some("good news"), &cancel)
        .await?;
    engine
        .record_sensation("alice", Some("tired"), None, Some("long day"), &cancel)
        .await?;
    engine
        .update_equipment(
            "alice",
            BTreeMap::from([
                ("lantern".to_string(), "lit".to_string()),
                ("compass".to_string(), "pointing north".to_string()),
            ]),
            &cancel,
        )
        .await?;
    // A later merge overwrites supplied keys and leaves the rest alone.
    engine
        .update_equipment(
            "alice",
            BTreeMap::from([("lantern".to_string(), "dimmed".to_string())]),
            &cancel,
        )
        .await?;

    let session = engine.get_session_context("alice").await?;
    assert_eq!(session.context.favourites, vec!["strawberries"]);
    assert_eq!(session.context.promises.len(), 1);
    assert_eq!(session.context.goals.len(), 1);
    assert_eq!(session.context.anniversaries.len(), 1);
    assert_eq!(session.context.anniversaries[0].date, "2023-04-02");
    assert_eq!(session.context.current_emotion.as_deref(), Some("excited"));
    assert_eq!(session.context.physical_state.as_deref(), Some("tired"));
    assert_eq!(session.context.equipment.len(), 2);
    assert_eq!(session.context.equipment.get("lantern").map(String::as_str), Some("dimmed"));
    assert_eq!(
        session.context.equipment.get("compass").map(String::as_str),
        Some("pointing north")
    );

    let err = engine.update_equipment("alice", BTreeMap::new(), &cancel).await;
    assert!(matches!(err, Err(MemoryError::Validation(_))));
    Ok(())
}

#[tokio::test]
async fn every_attempted_mutation_writes_exactly_one_op_record() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let engine = engine_in(&dir, AppConfig::default());
    let cancel = CancellationToken::new();

    // Two successes and two failures.
    engine
        .create("alice", create_content("likes strawberries"), &cancel)
        .await?;
    engine.set_goal("alice", "learn to ice skate", &cancel).await?;
    assert!(engine.create("alice", create_content("   "), &cancel).await.is_err());
    assert!(engine.delete("alice", "memory_19990101000000", &cancel).await.is_err());

    let records = engine.oplog().tail(100)?;
    assert_eq!(records.len(), 4);
    assert_eq!(records.iter().filter(|r| r.success).count(), 2);
    for failed in records.iter().filter(|r| !r.success) {
        let error = failed.error.as_deref().unwrap_or("");
        assert!(!error.is_empty(), "failed op records must carry an error");
    }
    // Reads are not mutations: no new records.
    engine
        .read("alice", "likes strawberries", SearchRequest::default(), &cancel)
        .await?;
    assert_eq!(engine.oplog().tail(100)?.len(), 4);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn scenario_idle_rebuild_converges_after_quiescence() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut config = AppConfig::default();
    config.vector_rebuild.idle_seconds = 2;
    config.vector_rebuild.min_interval = 3;
    let engine = engine_in(&dir, config);
    let cancel = CancellationToken::new();

    let (shutdown_tx, _rx) = tokio::sync::watch::channel(false);
    let workers = spawn_workers(Arc::clone(&engine), &shutdown_tx);

    // Twenty memories in bursts of five with one-second gaps.
    let mut contents = Vec::new();
    for burst in 0..4 {
        for item in 0..5 {
            let content = format!("burst {burst} item {item} observation");
            engine.create("alice", create_content(&content), &cancel).await?;
            contents.push(content);
        }
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
    }

    let handle = engine.registry().handle("alice")?;
    assert_eq!(handle.store.count().await?, 20);

    // Simulate a lost index: wipe the collection, leave the persona dirty.
    engine.vector().rebuild(&handle.collection, Vec::new()).await?;
    handle.mark_dirty();
    assert_eq!(engine.vector().count(&handle.collection).await?, 0);

    // Quiescence ≥ idle_seconds + min_interval.
    tokio::time::sleep(std::time::Duration::from_secs(10)).await;

    assert_eq!(engine.vector().count(&handle.collection).await?, 20);
    assert!(!handle.is_dirty());

    // Every original content finds its own key as the top hit.
    for content in &contents {
        let results = engine
            .read("alice", content, SearchRequest {
                k: Some(1),
                ..SearchRequest::default()
            }, &cancel)
            .await?;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].memory.content, *content);
    }

    let _ = shutdown_tx.send(true);
    for worker in workers {
        let _ = worker.await;
    }
    Ok(())
}

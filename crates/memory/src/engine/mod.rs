//! The memory engine: orchestrates the relational store, vector index,
//! context store, and operation log to serve the persona-scoped
//! operations.
//!
//! Dual-store discipline: SQLite commits first and is authoritative; the
//! vector index is refreshed best-effort afterwards. An index failure
//! never fails the caller's write — the persona is already marked dirty,
//! and the idle rebuild reconciles. Exactly one operation record is
//! appended per attempted mutating call, success or failure.

mod context_ops;

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use memcp_config::{AppConfig, ConfigHandle};

use crate::context::ContextUpdate;
use crate::embed::{Embedder, Reranker, normalized};
use crate::error::{MemoryError, Result};
use crate::keys;
use crate::oplog::OperationLog;
use crate::registry::{PersonaHandle, PersonaRegistry, PersonaState};
use crate::schema::{
    Memory, MemoryPreview, OperationRecord, clamp_importance, collapse_tags, truncate_str,
};
use crate::search::{SearchPipeline, SearchRequest, SearchResultItem};
use crate::store::StoreStats;
use crate::vector::{VectorIndex, VectorPoint};

pub use context_ops::SessionContext;

/// Upsert-by-meaning: a query selector updates the nearest memory only at
/// or above this cosine similarity; otherwise a new memory is created.
pub const UPDATE_MATCH_THRESHOLD: f32 = 0.80;

/// Delete-by-query is destructive, so its bar is deliberately higher than
/// the update threshold. Do not unify them.
pub const DELETE_MATCH_THRESHOLD: f32 = 0.90;

/// Characters of content kept in previews (stats, session context).
const PREVIEW_CHARS: usize = 80;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CreateRequest {
    pub content: String,
    pub tags: Vec<String>,
    pub importance: Option<f32>,
    pub emotion: Option<String>,
    pub physical_state: Option<String>,
    pub mental_state: Option<String>,
    pub environment: Option<String>,
    pub relationship_status: Option<String>,
    pub action_tag: Option<String>,
    /// Identity / conversation-state fields applied to the persona context
    /// alongside the new memory.
    pub context_updates: Option<ContextUpdate>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateRequest {
    pub content: Option<String>,
    pub tags: Option<Vec<String>>,
    pub importance: Option<f32>,
    pub emotion: Option<String>,
    pub physical_state: Option<String>,
    pub mental_state: Option<String>,
    pub environment: Option<String>,
    pub relationship_status: Option<String>,
    pub action_tag: Option<String>,
}

impl UpdateRequest {
    fn is_empty(&self) -> bool {
        self.content.is_none()
            && self.tags.is_none()
            && self.importance.is_none()
            && self.emotion.is_none()
            && self.physical_state.is_none()
            && self.mental_state.is_none()
            && self.environment.is_none()
            && self.relationship_status.is_none()
            && self.action_tag.is_none()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateOutcome {
    pub key: String,
    pub message: String,
    /// Present when the write landed in SQLite but the index refresh
    /// failed; the rebuild worker will reconcile.
    pub index_warning: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpdateOutcome {
    pub key: String,
    /// `true` when the selector matched nothing close enough and a new
    /// memory was created instead.
    pub created: bool,
    pub message: String,
    pub index_warning: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeleteOutcome {
    pub deleted_keys: Vec<String>,
    /// Populated when a query selector stayed under the safety threshold:
    /// nothing was deleted, these are the near matches.
    pub candidates: Vec<SearchResultItem>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsReport {
    pub persona: String,
    pub store: StoreStats,
    pub recent: Vec<MemoryPreview>,
    pub index_count: Option<usize>,
    pub last_write: Option<DateTime<Utc>>,
    pub last_rebuild: Option<DateTime<Utc>>,
    pub state: PersonaState,
}

pub struct MemoryEngine {
    registry: Arc<PersonaRegistry>,
    vector: Arc<dyn VectorIndex>,
    embedder: Option<Arc<dyn Embedder>>,
    reranker: Option<Arc<dyn Reranker>>,
    oplog: Arc<OperationLog>,
    config: Arc<ConfigHandle>,
}

impl MemoryEngine {
    pub fn new(
        registry: Arc<PersonaRegistry>,
        vector: Arc<dyn VectorIndex>,
        embedder: Option<Arc<dyn Embedder>>,
        reranker: Option<Arc<dyn Reranker>>,
        oplog: Arc<OperationLog>,
        config: Arc<ConfigHandle>,
    ) -> Self {
        Self {
            registry,
            vector,
            embedder,
            reranker,
            oplog,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<PersonaRegistry> {
        &self.registry
    }

    pub fn vector(&self) -> &Arc<dyn VectorIndex> {
        &self.vector
    }

    pub fn embedder(&self) -> Option<&Arc<dyn Embedder>> {
        self.embedder.as_ref()
    }

    pub fn config(&self) -> &Arc<ConfigHandle> {
        &self.config
    }

    pub fn oplog(&self) -> &Arc<OperationLog> {
        &self.oplog
    }

    fn pipeline(&self, config: &AppConfig) -> SearchPipeline {
        SearchPipeline {
            embedder: self.embedder.clone(),
            reranker: self.reranker.clone(),
            vector: Arc::clone(&self.vector),
            tz: config.tz(),
            reranker_top_n: config.reranker_top_n,
        }
    }

    // ── create ───────────────────────────────────────────────────────────

    pub async fn create(
        &self,
        persona: &str,
        request: CreateRequest,
        cancel: &CancellationToken,
    ) -> Result<CreateOutcome> {
        let result = self.create_inner(persona, &request, cancel).await;
        let (key, after) = match &result {
            Ok((outcome, memory)) => (Some(outcome.key.clone()), Some(memory.clone())),
            Err(_) => (None, None),
        };
        self.record_op(persona, "create", key, None, after, &result)
            .await?;
        result.map(|(outcome, _)| outcome)
    }

    async fn create_inner(
        &self,
        persona: &str,
        request: &CreateRequest,
        cancel: &CancellationToken,
    ) -> Result<(CreateOutcome, Memory)> {
        if cancel.is_cancelled() {
            return Err(MemoryError::Cancelled);
        }
        if request.content.trim().is_empty() {
            return Err(MemoryError::Validation("content must not be empty".into()));
        }

        let handle = self.registry.handle(persona)?;
        let _guard = handle.write_lock.lock().await;

        let now = Utc::now();
        let key = self.generate_key(&handle, now).await?;

        let mut memory = Memory::new(&key, request.content.trim(), now);
        memory.tags = collapse_tags(&request.tags);
        if let Some(importance) = request.importance {
            memory.importance = clamp_importance(importance);
        }
        if let Some(v) = &request.emotion {
            memory.emotion = v.clone();
        }
        if let Some(v) = &request.physical_state {
            memory.physical_state = v.clone();
        }
        if let Some(v) = &request.mental_state {
            memory.mental_state = v.clone();
        }
        if let Some(v) = &request.environment {
            memory.environment = v.clone();
        }
        if let Some(v) = &request.relationship_status {
            memory.relationship_status = v.clone();
        }
        memory.action_tag = request.action_tag.clone();

        handle.store.put(&memory).await?;
        handle.mark_write();

        // Context-bearing fields piggyback onto the persona context.
        let mut context_update = request.context_updates.clone().unwrap_or_default();
        if context_update.emotion.is_none() {
            context_update.emotion = request.emotion.clone();
        }
        if context_update.physical_state.is_none() {
            context_update.physical_state = request.physical_state.clone();
        }
        if context_update.mental_state.is_none() {
            context_update.mental_state = request.mental_state.clone();
        }
        if context_update.environment.is_none() {
            context_update.environment = request.environment.clone();
        }
        if context_update.relationship_status.is_none() {
            context_update.relationship_status = request.relationship_status.clone();
        }
        if !context_update.is_empty() {
            let mut context = handle.context.load()?;
            context.apply(&context_update);
            handle.context.save(&context)?;
        }

        let index_warning = self.index_upsert(&handle, &memory).await;
        info!(persona = %handle.name, key = %key, "memory created");

        let outcome = CreateOutcome {
            message: format!("Stored memory {key}: {}", truncate_str(&memory.content, 60)),
            key,
            index_warning,
        };
        Ok((outcome, memory))
    }

    // ── read ─────────────────────────────────────────────────────────────

    /// Non-mutating. A key selector returns at most the one exact match; a
    /// query selector runs the search pipeline. `options.query` is
    /// ignored in favour of `selector`.
    pub async fn read(
        &self,
        persona: &str,
        selector: &str,
        mut options: SearchRequest,
        cancel: &CancellationToken,
    ) -> Result<Vec<SearchResultItem>> {
        if cancel.is_cancelled() {
            return Err(MemoryError::Cancelled);
        }
        if selector.trim().is_empty() {
            return Err(MemoryError::Validation("selector must not be empty".into()));
        }
        let handle = self.registry.handle(persona)?;

        if keys::is_key_selector(selector) {
            let memory = handle
                .store
                .get(selector)
                .await?
                .ok_or_else(|| MemoryError::NotFound(format!("no memory with key {selector}")))?;
            return Ok(vec![SearchResultItem {
                key: memory.key.clone(),
                content: memory.content.clone(),
                created_at: memory.created_at,
                score: 1.0,
                memory,
            }]);
        }

        let config = self.config.current();
        options.query = selector.to_string();
        self.pipeline(&config).run(&handle, &options, cancel).await
    }

    // ── update ───────────────────────────────────────────────────────────

    pub async fn update(
        &self,
        persona: &str,
        selector: &str,
        request: UpdateRequest,
        cancel: &CancellationToken,
    ) -> Result<UpdateOutcome> {
        let result = self.update_inner(persona, selector, &request, cancel).await;
        let (key, before, after) = match &result {
            Ok((outcome, before, memory)) => {
                (Some(outcome.key.clone()), before.clone(), Some(memory.clone()))
            }
            Err(_) => (None, None, None),
        };
        self.record_op(persona, "update", key, before, after, &result)
            .await?;
        result.map(|(outcome, _, _)| outcome)
    }

    async fn update_inner(
        &self,
        persona: &str,
        selector: &str,
        request: &UpdateRequest,
        cancel: &CancellationToken,
    ) -> Result<(UpdateOutcome, Option<Memory>, Memory)> {
        if cancel.is_cancelled() {
            return Err(MemoryError::Cancelled);
        }
        if selector.trim().is_empty() {
            return Err(MemoryError::Validation("selector must not be empty".into()));
        }
        if request.is_empty() {
            return Err(MemoryError::Validation("update carries no changes".into()));
        }
        if let Some(content) = &request.content
            && content.trim().is_empty()
        {
            return Err(MemoryError::Validation("content must not be empty".into()));
        }

        let handle = self.registry.handle(persona)?;
        let config = self.config.current();
        let _guard = handle.write_lock.lock().await;

        // Resolve the target: exact key, or semantically nearest memory at
        // or above the upsert-by-meaning threshold.
        let target = if keys::is_key_selector(selector) {
            Some(handle.store.get(selector).await?.ok_or_else(|| {
                MemoryError::NotFound(format!("no memory with key {selector}"))
            })?)
        } else {
            match self
                .pipeline(&config)
                .top_semantic_match(&handle, selector, cancel)
                .await?
            {
                Some(hit) if hit.similarity >= UPDATE_MATCH_THRESHOLD => {
                    debug!(
                        key = %hit.key,
                        similarity = hit.similarity,
                        "selector matched existing memory"
                    );
                    // Re-read from the authoritative store; the index
                    // payload may lag.
                    handle.store.get(&hit.key).await?
                }
                _ => None,
            }
        };

        match target {
            Some(before) => {
                let mut memory = before.clone();
                let content_changed = match &request.content {
                    Some(content) if content.trim() != memory.content => {
                        memory.content = content.trim().to_string();
                        true
                    }
                    _ => false,
                };
                if let Some(tags) = &request.tags {
                    memory.tags = collapse_tags(tags);
                }
                if let Some(importance) = request.importance {
                    memory.importance = clamp_importance(importance);
                }
                if let Some(v) = &request.emotion {
                    memory.emotion = v.clone();
                }
                if let Some(v) = &request.physical_state {
                    memory.physical_state = v.clone();
                }
                if let Some(v) = &request.mental_state {
                    memory.mental_state = v.clone();
                }
                if let Some(v) = &request.environment {
                    memory.environment = v.clone();
                }
                if let Some(v) = &request.relationship_status {
                    memory.relationship_status = v.clone();
                }
                if let Some(v) = &request.action_tag {
                    memory.action_tag = Some(v.clone());
                }
                memory.updated_at = next_updated_at(before.updated_at);

                handle.store.put(&memory).await?;
                handle.mark_write();

                let index_warning = if content_changed {
                    self.index_upsert(&handle, &memory).await
                } else {
                    self.index_set_payload(&handle, &memory).await
                };
                info!(persona = %handle.name, key = %memory.key, "memory updated");

                let outcome = UpdateOutcome {
                    key: memory.key.clone(),
                    created: false,
                    message: format!("Updated memory {}", memory.key),
                    index_warning,
                };
                Ok((outcome, Some(before), memory))
            }
            None => {
                // Upsert-by-meaning: nothing close enough, so create.
                let Some(content) = &request.content else {
                    return Err(MemoryError::NotFound(format!(
                        "no memory matched '{selector}' and no content was given to create one"
                    )));
                };

                let now = Utc::now();
                let key = self.generate_key(&handle, now).await?;
                let mut memory = Memory::new(&key, content.trim(), now);
                if let Some(tags) = &request.tags {
                    memory.tags = collapse_tags(tags);
                }
                if let Some(importance) = request.importance {
                    memory.importance = clamp_importance(importance);
                }
                if let Some(v) = &request.emotion {
                    memory.emotion = v.clone();
                }
                if let Some(v) = &request.physical_state {
                    memory.physical_state = v.clone();
                }
                if let Some(v) = &request.mental_state {
                    memory.mental_state = v.clone();
                }
                if let Some(v) = &request.environment {
                    memory.environment = v.clone();
                }
                if let Some(v) = &request.relationship_status {
                    memory.relationship_status = v.clone();
                }
                memory.action_tag = request.action_tag.clone();

                handle.store.put(&memory).await?;
                handle.mark_write();
                let index_warning = self.index_upsert(&handle, &memory).await;
                info!(
                    persona = %handle.name,
                    key = %key,
                    "selector matched nothing close enough; created new memory"
                );

                let outcome = UpdateOutcome {
                    message: format!("No close match for '{selector}'; created {key}"),
                    key,
                    created: true,
                    index_warning,
                };
                Ok((outcome, None, memory))
            }
        }
    }

    // ── delete ───────────────────────────────────────────────────────────

    pub async fn delete(
        &self,
        persona: &str,
        selector: &str,
        cancel: &CancellationToken,
    ) -> Result<DeleteOutcome> {
        let result = self.delete_inner(persona, selector, cancel).await;
        let (key, before) = match &result {
            Ok((outcome, before)) => (outcome.deleted_keys.first().cloned(), before.clone()),
            Err(_) => (None, None),
        };
        self.record_op(persona, "delete", key, before, None, &result)
            .await?;
        result.map(|(outcome, _)| outcome)
    }

    async fn delete_inner(
        &self,
        persona: &str,
        selector: &str,
        cancel: &CancellationToken,
    ) -> Result<(DeleteOutcome, Option<Memory>)> {
        if cancel.is_cancelled() {
            return Err(MemoryError::Cancelled);
        }
        if selector.trim().is_empty() {
            return Err(MemoryError::Validation("selector must not be empty".into()));
        }

        let handle = self.registry.handle(persona)?;
        let config = self.config.current();
        let _guard = handle.write_lock.lock().await;

        if keys::is_key_selector(selector) {
            let before = handle
                .store
                .get(selector)
                .await?
                .ok_or_else(|| MemoryError::NotFound(format!("no memory with key {selector}")))?;
            handle.store.delete(selector).await?;
            handle.mark_write();
            if let Err(err) = self.vector.delete(&handle.collection, selector).await {
                warn!(%err, key = selector, "index delete failed; persona marked dirty");
            }
            info!(persona = %handle.name, key = selector, "memory deleted");
            return Ok((
                DeleteOutcome {
                    deleted_keys: vec![selector.to_string()],
                    candidates: Vec::new(),
                },
                Some(before),
            ));
        }

        let pipeline = self.pipeline(&config);
        let top = pipeline.top_semantic_match(&handle, selector, cancel).await?;

        match top {
            Some(hit) if hit.similarity >= DELETE_MATCH_THRESHOLD => {
                let before = handle.store.get(&hit.key).await?.ok_or_else(|| {
                    MemoryError::NotFound(format!("index points at vanished key {}", hit.key))
                })?;
                handle.store.delete(&hit.key).await?;
                handle.mark_write();
                if let Err(err) = self.vector.delete(&handle.collection, &hit.key).await {
                    warn!(%err, key = %hit.key, "index delete failed; persona marked dirty");
                }
                info!(
                    persona = %handle.name,
                    key = %hit.key,
                    similarity = hit.similarity,
                    "memory deleted by query selector"
                );
                Ok((
                    DeleteOutcome {
                        deleted_keys: vec![hit.key],
                        candidates: Vec::new(),
                    },
                    Some(before),
                ))
            }
            _ => {
                // Under the safety threshold (or similarity unknowable):
                // never delete, just show the near matches.
                let request = SearchRequest {
                    query: selector.to_string(),
                    ..SearchRequest::default()
                };
                let candidates = pipeline.run(&handle, &request, cancel).await?;
                if candidates.is_empty() {
                    return Err(MemoryError::NotFound(format!(
                        "nothing resembling '{selector}' found"
                    )));
                }
                Ok((
                    DeleteOutcome {
                        deleted_keys: Vec::new(),
                        candidates,
                    },
                    None,
                ))
            }
        }
    }

    // ── stats ────────────────────────────────────────────────────────────

    pub async fn stats(&self, persona: &str) -> Result<StatsReport> {
        let handle = self.registry.handle(persona)?;
        let config = self.config.current();

        let store = handle.store.stats().await?;
        let recent = handle
            .store
            .list(0, config.stats_recent_count as u64)
            .await?
            .iter()
            .map(|m| MemoryPreview::from_memory(m, PREVIEW_CHARS))
            .collect();
        let index_count = self.vector.count(&handle.collection).await.ok();

        Ok(StatsReport {
            persona: handle.name.clone(),
            store,
            recent,
            index_count,
            last_write: instant_from_secs(handle.last_write_secs()),
            last_rebuild: instant_from_secs(handle.last_rebuild_secs()),
            state: handle.state(),
        })
    }

    /// Manual rebuild entry point (`vector_rebuild.mode = "manual"`, admin
    /// surfaces). Returns the number of points indexed.
    pub async fn rebuild_index(&self, persona: &str) -> Result<usize> {
        let config = self.config.current();
        if config.vector_rebuild.mode == memcp_config::RebuildMode::Disabled {
            return Err(MemoryError::Validation("vector rebuild is disabled".into()));
        }
        let handle = self.registry.handle(persona)?;
        crate::maintenance::rebuild_persona(self, &handle).await
    }

    // ── shared internals ─────────────────────────────────────────────────

    /// Fresh key for `now`; same-second creates walk the suffix space.
    async fn generate_key(&self, handle: &PersonaHandle, now: DateTime<Utc>) -> Result<String> {
        let base = keys::base_key(now);
        if handle.store.get(&base).await?.is_none() {
            return Ok(base);
        }
        for n in 1..=keys::MAX_KEY_ATTEMPTS {
            let candidate = keys::disambiguated(&base, n);
            if handle.store.get(&candidate).await?.is_none() {
                return Ok(candidate);
            }
        }
        Err(MemoryError::Conflict(format!(
            "could not disambiguate key {base} after {} attempts",
            keys::MAX_KEY_ATTEMPTS
        )))
    }

    /// Best-effort index refresh after a successful relational write. A
    /// failure is reduced to a warning for the caller; the persona is
    /// already dirty so the rebuild worker will reconcile.
    async fn index_upsert(&self, handle: &PersonaHandle, memory: &Memory) -> Option<String> {
        let embedder = self.embedder.as_ref()?;

        let result: Result<()> = async {
            let vectors = embedder.embed(&[memory.content.clone()]).await?;
            let vector = vectors
                .into_iter()
                .next()
                .map(normalized)
                .ok_or_else(|| MemoryError::Model("embedder returned no vector".into()))?;
            self.vector
                .ensure_collection(&handle.collection, embedder.dimension())
                .await?;
            self.vector
                .upsert(&handle.collection, VectorPoint {
                    key: memory.key.clone(),
                    vector,
                    payload: memory.clone(),
                })
                .await
        }
        .await;

        match result {
            Ok(()) => None,
            Err(err) => {
                warn!(%err, key = %memory.key, persona = %handle.name, "index refresh failed; persona marked dirty");
                Some(format!("search index lagging: {err}"))
            }
        }
    }

    async fn index_set_payload(&self, handle: &PersonaHandle, memory: &Memory) -> Option<String> {
        match self
            .vector
            .set_payload(&handle.collection, &memory.key, memory.clone())
            .await
        {
            Ok(()) => None,
            Err(err) => {
                warn!(%err, key = %memory.key, persona = %handle.name, "index payload refresh failed; persona marked dirty");
                Some(format!("search index lagging: {err}"))
            }
        }
    }

    /// Append the single audit record for an attempted mutation. A log
    /// failure is a data-store failure and surfaces to the caller even if
    /// the mutation itself committed.
    async fn record_op<T>(
        &self,
        persona: &str,
        op: &str,
        key: Option<String>,
        before: Option<Memory>,
        after: Option<Memory>,
        result: &Result<T>,
    ) -> Result<()> {
        let (success, error) = match result {
            Ok(_) => (true, None),
            Err(err) => (false, Some(format!("{} ({})", err, err.kind()))),
        };
        let record = OperationRecord {
            timestamp: Utc::now(),
            op_id: Uuid::new_v4(),
            persona: crate::registry::sanitize_persona(persona),
            op: op.to_string(),
            key,
            success,
            error,
            before,
            after,
            metadata: serde_json::Map::new(),
        };
        self.oplog.append(&record).await
    }
}

/// Strictly-increasing `updated_at` even for updates within one clock tick.
fn next_updated_at(previous: DateTime<Utc>) -> DateTime<Utc> {
    let now = Utc::now();
    if now > previous {
        now
    } else {
        previous + Duration::microseconds(1)
    }
}

fn instant_from_secs(secs: i64) -> Option<DateTime<Utc>> {
    if secs <= 0 {
        None
    } else {
        DateTime::<Utc>::from_timestamp(secs, 0)
    }
}

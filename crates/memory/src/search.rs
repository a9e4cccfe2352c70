//! Semantic search pipeline with keyword fallback.
//!
//! The happy path embeds the query, asks the vector index for `k * 3`
//! candidates under a conjunctive payload filter, optionally reranks with
//! the cross-encoder, and composes the final score from similarity plus
//! caller-weighted importance and recency. Any model or index failure
//! degrades the request to a keyword scan of the relational store — the
//! same filters apply post-hoc there, so both paths agree on what matches.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::embed::{Embedder, Reranker, normalized};
use crate::error::{MemoryError, Result};
use crate::registry::PersonaHandle;
use crate::schema::{Memory, clamp_importance};
use crate::timeframe::{self, DateRange};
use crate::vector::{PayloadFilter, SearchHit, TagFilter, TextField, VectorIndex};

/// Vector candidates fetched per requested result.
pub const CANDIDATE_MULTIPLIER: usize = 3;
pub const DEFAULT_K: usize = 5;
pub const DEFAULT_FUZZY_THRESHOLD: f32 = 70.0;

/// Upper bound on one embedding or reranking call; a timeout degrades the
/// request to the keyword path rather than failing it.
const MODEL_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchRequest {
    pub query: String,
    pub k: Option<usize>,
    pub tags: Option<Vec<String>>,
    /// `false` = any-of (default); `true` = all-of.
    pub tags_match_all: bool,
    pub date_range: Option<DateRange>,
    pub min_importance: Option<f32>,
    pub emotion: Option<String>,
    pub action_tag: Option<String>,
    pub environment: Option<String>,
    pub physical_state: Option<String>,
    pub mental_state: Option<String>,
    pub relationship_status: Option<String>,
    pub importance_weight: f32,
    pub recency_weight: f32,
    pub fuzzy_match: bool,
    pub fuzzy_threshold: Option<f32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResultItem {
    pub key: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub score: f32,
    pub memory: Memory,
}

impl SearchResultItem {
    fn from_memory(memory: Memory, score: f32) -> Self {
        Self {
            key: memory.key.clone(),
            content: memory.content.clone(),
            created_at: memory.created_at,
            score,
            memory,
        }
    }
}

/// Linear freshness bonus: 1.0 now, fading to 0.0 at thirty days.
pub fn recency(created_at: DateTime<Utc>, now: DateTime<Utc>) -> f32 {
    let age_days = (now - created_at).num_seconds().max(0) as f32 / 86_400.0;
    (1.0 - age_days / 30.0).max(0.0)
}

/// Token-level fuzzy score on a 0–100 scale: mean over query tokens of the
/// best Jaro-Winkler match among content tokens.
pub fn fuzzy_score(query: &str, content: &str) -> f32 {
    let query_tokens = tokenize(query);
    if query_tokens.is_empty() {
        return 0.0;
    }
    let content_tokens = tokenize(content);
    if content_tokens.is_empty() {
        return 0.0;
    }

    let total: f64 = query_tokens
        .iter()
        .map(|q| {
            content_tokens
                .iter()
                .map(|c| strsim::jaro_winkler(q, c))
                .fold(0.0_f64, f64::max)
        })
        .sum();
    (total / query_tokens.len() as f64 * 100.0) as f32
}

fn tokenize(text: &str) -> Vec<String> {
    text.split(|ch: char| !ch.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Translate request filters into the payload predicate both backends
/// understand. Invalid date expressions are a validation error; weights
/// are clamped rather than rejected.
pub fn build_filter(request: &SearchRequest, tz: Tz, now: DateTime<Utc>) -> Result<PayloadFilter> {
    let mut filter = PayloadFilter::default();

    if let Some(tags) = &request.tags {
        let set = crate::schema::collapse_tags(tags.iter().map(String::as_str));
        if !set.is_empty() {
            filter.tags = Some(if request.tags_match_all {
                TagFilter::All(set)
            } else {
                TagFilter::Any(set)
            });
        }
    }

    if let Some(range) = &request.date_range {
        let (from, to) = timeframe::resolve(range, tz, now)?;
        filter.created_from = from;
        filter.created_to = to;
    }

    if let Some(min) = request.min_importance {
        filter.min_importance = Some(clamp_importance(min));
    }

    for (field, value) in [
        (TextField::Emotion, &request.emotion),
        (TextField::ActionTag, &request.action_tag),
        (TextField::Environment, &request.environment),
        (TextField::PhysicalState, &request.physical_state),
        (TextField::MentalState, &request.mental_state),
        (TextField::RelationshipStatus, &request.relationship_status),
    ] {
        if let Some(value) = value
            && !value.trim().is_empty()
        {
            filter.text_contains.push((field, value.trim().to_string()));
        }
    }

    Ok(filter)
}

pub struct SearchPipeline {
    pub embedder: Option<Arc<dyn Embedder>>,
    pub reranker: Option<Arc<dyn Reranker>>,
    pub vector: Arc<dyn VectorIndex>,
    pub tz: Tz,
    pub reranker_top_n: usize,
}

impl SearchPipeline {
    pub async fn run(
        &self,
        handle: &PersonaHandle,
        request: &SearchRequest,
        cancel: &CancellationToken,
    ) -> Result<Vec<SearchResultItem>> {
        if request.query.trim().is_empty() {
            return Err(MemoryError::Validation("search query must not be empty".into()));
        }
        let k = request.k.unwrap_or(DEFAULT_K).max(1);
        let now = Utc::now();
        let filter = build_filter(request, self.tz, now)?;

        if cancel.is_cancelled() {
            return Err(MemoryError::Cancelled);
        }

        let Some(embedder) = &self.embedder else {
            debug!("no embedder configured; using keyword search");
            return self.keyword_search(handle, request, &filter, k, now).await;
        };

        let query_vector = match self.embed_query(embedder, &request.query, cancel).await {
            Ok(vector) => vector,
            Err(MemoryError::Cancelled) => return Err(MemoryError::Cancelled),
            Err(err) => {
                warn!(%err, "query embedding failed; degrading to keyword search");
                return self.keyword_search(handle, request, &filter, k, now).await;
            }
        };

        let hits = match self
            .vector
            .search(&handle.collection, &query_vector, k * CANDIDATE_MULTIPLIER, &filter)
            .await
        {
            Ok(hits) => hits,
            Err(err) => {
                warn!(%err, persona = %handle.name, "vector search failed; degrading to keyword search");
                return self.keyword_search(handle, request, &filter, k, now).await;
            }
        };

        let hits = self.apply_reranker(&request.query, hits, cancel).await?;

        let mut results: Vec<SearchResultItem> = hits
            .into_iter()
            .map(|hit| {
                let score = hit.similarity
                    + request.importance_weight.clamp(0.0, 1.0) * hit.payload.importance
                    + request.recency_weight.clamp(0.0, 1.0) * recency(hit.payload.created_at, now);
                SearchResultItem::from_memory(hit.payload, score)
            })
            .collect();

        sort_results(&mut results);
        results.truncate(k);
        Ok(results)
    }

    /// Raw best semantic match for the mutation paths (upsert-by-meaning,
    /// delete-by-query). No reranking and no weight composition — the
    /// 0.80/0.90 thresholds are defined over plain cosine similarity.
    /// `None` means the similarity is unknowable (no embedder, no index),
    /// in which case the destructive shortcuts must not fire.
    pub async fn top_semantic_match(
        &self,
        handle: &PersonaHandle,
        query: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<SearchHit>> {
        let Some(embedder) = &self.embedder else {
            return Ok(None);
        };
        let query_vector = match self.embed_query(embedder, query, cancel).await {
            Ok(vector) => vector,
            Err(MemoryError::Cancelled) => return Err(MemoryError::Cancelled),
            Err(err) => {
                warn!(%err, "embedding unavailable for selector match");
                return Ok(None);
            }
        };
        match self
            .vector
            .search(&handle.collection, &query_vector, 1, &PayloadFilter::default())
            .await
        {
            Ok(hits) => Ok(hits.into_iter().next()),
            Err(err) => {
                warn!(%err, persona = %handle.name, "vector search unavailable for selector match");
                Ok(None)
            }
        }
    }

    async fn embed_query(
        &self,
        embedder: &Arc<dyn Embedder>,
        query: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<f32>> {
        let texts = vec![query.to_string()];
        let embedded = tokio::select! {
            _ = cancel.cancelled() => return Err(MemoryError::Cancelled),
            result = tokio::time::timeout(MODEL_TIMEOUT, embedder.embed(&texts)) => match result {
                Err(_) => return Err(MemoryError::Model("embedding call timed out".into())),
                Ok(inner) => inner?,
            },
        };
        embedded
            .into_iter()
            .next()
            .map(normalized)
            .ok_or_else(|| MemoryError::Model("embedder returned no vector".into()))
    }

    /// Replace cosine similarity with cross-encoder scores for the top
    /// `reranker_top_n` candidates. Rerank scores live on their own scale,
    /// so the candidate set is narrowed to the reranked ones instead of
    /// mixing scales in one ordering. Failures keep the original scores.
    async fn apply_reranker(
        &self,
        query: &str,
        hits: Vec<SearchHit>,
        cancel: &CancellationToken,
    ) -> Result<Vec<SearchHit>> {
        let Some(reranker) = &self.reranker else {
            return Ok(hits);
        };
        if hits.is_empty() {
            return Ok(hits);
        }

        let mut hits = hits;
        hits.truncate(self.reranker_top_n.max(1));
        let docs: Vec<String> = hits.iter().map(|h| h.payload.content.clone()).collect();

        let scores = tokio::select! {
            _ = cancel.cancelled() => return Err(MemoryError::Cancelled),
            result = tokio::time::timeout(MODEL_TIMEOUT, reranker.score(query, &docs)) => match result {
                Err(_) => {
                    warn!("reranker timed out; keeping similarity order");
                    return Ok(hits);
                }
                Ok(Err(err)) => {
                    warn!(%err, "reranker failed; keeping similarity order");
                    return Ok(hits);
                }
                Ok(Ok(scores)) => scores,
            },
        };

        if scores.len() == hits.len() {
            for (hit, score) in hits.iter_mut().zip(scores) {
                hit.similarity = score;
            }
        }
        Ok(hits)
    }

    /// Fallback path: case-insensitive substring (or fuzzy) scan over the
    /// relational store with the same filters applied post-hoc.
    async fn keyword_search(
        &self,
        handle: &PersonaHandle,
        request: &SearchRequest,
        filter: &PayloadFilter,
        k: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<SearchResultItem>> {
        let memories = handle.store.all().await?;
        let needle = request.query.trim().to_lowercase();
        let threshold = request
            .fuzzy_threshold
            .unwrap_or(DEFAULT_FUZZY_THRESHOLD)
            .clamp(0.0, 100.0);

        let mut results = Vec::new();
        for memory in memories {
            if !filter.matches(&memory) {
                continue;
            }
            let base = if memory.content.to_lowercase().contains(&needle) {
                1.0
            } else if request.fuzzy_match {
                let score = fuzzy_score(&request.query, &memory.content);
                if score < threshold {
                    continue;
                }
                score / 100.0
            } else {
                continue;
            };

            let score = base
                + request.importance_weight.clamp(0.0, 1.0) * memory.importance
                + request.recency_weight.clamp(0.0, 1.0) * recency(memory.created_at, now);
            results.push(SearchResultItem::from_memory(memory, score));
        }

        sort_results(&mut results);
        results.truncate(k);
        Ok(results)
    }
}

/// Descending score; fresher `created_at` wins ties, then lexicographic
/// key for full determinism.
fn sort_results(results: &mut [SearchResultItem]) {
    results.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| b.created_at.cmp(&a.created_at))
            .then_with(|| a.key.cmp(&b.key))
    });
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use anyhow::Result;
    use async_trait::async_trait;
    use chrono::{Duration, TimeZone};

    use super::*;
    use crate::registry::PersonaRegistry;
    use crate::vector::{EmbeddedIndex, VectorPoint};

    /// Deterministic embedder: known phrases map to fixed unit vectors,
    /// anything else hashes onto an axis.
    struct StubEmbedder {
        table: HashMap<String, Vec<f32>>,
    }

    impl StubEmbedder {
        fn new(entries: &[(&str, Vec<f32>)]) -> Self {
            Self {
                table: entries
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.clone()))
                    .collect(),
            }
        }
    }

    #[async_trait]
    impl Embedder for StubEmbedder {
        async fn embed(&self, texts: &[String]) -> crate::error::Result<Vec<Vec<f32>>> {
            Ok(texts
                .iter()
                .map(|t| {
                    self.table.get(t).cloned().unwrap_or_else(|| {
                        let ix = t.len() % 4;
                        let mut v = vec![0.0; 4];
                        v[ix] = 1.0;
                        v
                    })
                })
                .collect())
        }

        fn dimension(&self) -> usize {
            4
        }
    }

    fn memory_at(key: &str, content: &str, minutes_ago: i64) -> Memory {
        let now = Utc::now();
        let mut memory = Memory::new(key, content, now - Duration::minutes(minutes_ago));
        memory.updated_at = memory.created_at;
        memory
    }

    async fn pipeline_without_embedder(
        dir: &tempfile::TempDir,
    ) -> Result<(SearchPipeline, std::sync::Arc<crate::registry::PersonaHandle>)> {
        let registry = PersonaRegistry::new(dir.path());
        let handle = registry.handle("alice")?;
        let pipeline = SearchPipeline {
            embedder: None,
            reranker: None,
            vector: Arc::new(EmbeddedIndex::new()),
            tz: chrono_tz::Tz::UTC,
            reranker_top_n: 10,
        };
        Ok((pipeline, handle))
    }

    #[tokio::test]
    async fn keyword_path_matches_substring_case_insensitively() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (pipeline, handle) = pipeline_without_embedder(&dir).await?;
        handle.store.put(&memory_at("memory_1", "Likes Strawberries", 1)).await?;
        handle.store.put(&memory_at("memory_2", "prefers bananas", 1)).await?;

        let request = SearchRequest {
            query: "strawberries".to_string(),
            ..SearchRequest::default()
        };
        let results = pipeline.run(&handle, &request, &CancellationToken::new()).await?;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].key, "memory_1");
        Ok(())
    }

    #[tokio::test]
    async fn fuzzy_match_is_gated_by_threshold() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (pipeline, handle) = pipeline_without_embedder(&dir).await?;
        handle.store.put(&memory_at("memory_1", "likes strawberies", 1)).await?;

        let strict = SearchRequest {
            query: "strawberries".to_string(),
            fuzzy_match: true,
            fuzzy_threshold: Some(99.0),
            ..SearchRequest::default()
        };
        assert!(pipeline.run(&handle, &strict, &CancellationToken::new()).await?.is_empty());

        let lenient = SearchRequest {
            query: "strawberries".to_string(),
            fuzzy_match: true,
            fuzzy_threshold: Some(80.0),
            ..SearchRequest::default()
        };
        let results = pipeline.run(&handle, &lenient, &CancellationToken::new()).await?;
        assert_eq!(results.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn filters_apply_post_hoc_on_the_keyword_path() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (pipeline, handle) = pipeline_without_embedder(&dir).await?;

        let mut joyful = memory_at("memory_1", "made pancakes", 1);
        joyful.emotion = "joyful".to_string();
        let mut sad = memory_at("memory_2", "burnt pancakes", 1);
        sad.emotion = "sad".to_string();
        handle.store.put(&joyful).await?;
        handle.store.put(&sad).await?;

        let request = SearchRequest {
            query: "pancakes".to_string(),
            emotion: Some("joy".to_string()),
            ..SearchRequest::default()
        };
        let results = pipeline.run(&handle, &request, &CancellationToken::new()).await?;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].key, "memory_1");
        Ok(())
    }

    #[tokio::test]
    async fn semantic_path_ranks_by_similarity_and_weights() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let registry = PersonaRegistry::new(dir.path());
        let handle = registry.handle("alice")?;
        let index = Arc::new(EmbeddedIndex::new());
        index.ensure_collection(&handle.collection, 4).await?;

        let close = memory_at("memory_close", "breakfast plans", 60);
        let far = memory_at("memory_far", "tax deadline", 60);
        index
            .upsert(&handle.collection, VectorPoint {
                key: close.key.clone(),
                vector: vec![1.0, 0.0, 0.0, 0.0],
                payload: close,
            })
            .await?;
        index
            .upsert(&handle.collection, VectorPoint {
                key: far.key.clone(),
                vector: vec![0.0, 1.0, 0.0, 0.0],
                payload: far,
            })
            .await?;

        let pipeline = SearchPipeline {
            embedder: Some(Arc::new(StubEmbedder::new(&[(
                "what is for breakfast",
                vec![1.0, 0.0, 0.0, 0.0],
            )]))),
            reranker: None,
            vector: index,
            tz: chrono_tz::Tz::UTC,
            reranker_top_n: 10,
        };

        let request = SearchRequest {
            query: "what is for breakfast".to_string(),
            k: Some(2),
            ..SearchRequest::default()
        };
        let results = pipeline.run(&handle, &request, &CancellationToken::new()).await?;
        assert_eq!(results[0].key, "memory_close");
        assert!(results[0].score > results[1].score);
        Ok(())
    }

    #[tokio::test]
    async fn importance_weight_can_reorder_results() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let registry = PersonaRegistry::new(dir.path());
        let handle = registry.handle("alice")?;
        let index = Arc::new(EmbeddedIndex::new());
        index.ensure_collection(&handle.collection, 4).await?;

        let mut slightly_closer = memory_at("memory_a", "minor note", 60);
        slightly_closer.importance = 0.0;
        let mut important = memory_at("memory_b", "critical fact", 60);
        important.importance = 1.0;

        index
            .upsert(&handle.collection, VectorPoint {
                key: slightly_closer.key.clone(),
                vector: vec![1.0, 0.0, 0.0, 0.0],
                payload: slightly_closer,
            })
            .await?;
        index
            .upsert(&handle.collection, VectorPoint {
                key: important.key.clone(),
                vector: normalized(vec![0.95, 0.3122, 0.0, 0.0]),
                payload: important,
            })
            .await?;

        let pipeline = SearchPipeline {
            embedder: Some(Arc::new(StubEmbedder::new(&[(
                "query",
                vec![1.0, 0.0, 0.0, 0.0],
            )]))),
            reranker: None,
            vector: index,
            tz: chrono_tz::Tz::UTC,
            reranker_top_n: 10,
        };

        let neutral = SearchRequest {
            query: "query".to_string(),
            ..SearchRequest::default()
        };
        let results = pipeline.run(&handle, &neutral, &CancellationToken::new()).await?;
        assert_eq!(results[0].key, "memory_a");

        let weighted = SearchRequest {
            query: "query".to_string(),
            importance_weight: 0.5,
            ..SearchRequest::default()
        };
        let results = pipeline.run(&handle, &weighted, &CancellationToken::new()).await?;
        assert_eq!(results[0].key, "memory_b");
        Ok(())
    }

    #[tokio::test]
    async fn cancelled_requests_short_circuit() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (pipeline, handle) = pipeline_without_embedder(&dir).await?;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let request = SearchRequest {
            query: "anything".to_string(),
            ..SearchRequest::default()
        };
        let err = pipeline.run(&handle, &request, &cancel).await.unwrap_err();
        assert!(matches!(err, MemoryError::Cancelled));
        Ok(())
    }

    #[test]
    fn recency_fades_linearly_over_thirty_days() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        assert!((recency(now, now) - 1.0).abs() < 1e-6);
        assert!((recency(now - Duration::days(15), now) - 0.5).abs() < 1e-3);
        assert_eq!(recency(now - Duration::days(45), now), 0.0);
    }

    #[test]
    fn fuzzy_score_reflects_token_closeness() {
        assert!(fuzzy_score("strawberries", "likes strawberries") > 99.0);
        assert!(fuzzy_score("strawberries", "likes strawberies") > 90.0);
        assert!(fuzzy_score("strawberries", "tax deadline") < 60.0);
    }

    #[test]
    fn tie_break_prefers_fresher_then_lexicographic() {
        let now = Utc::now();
        let older = memory_at("memory_a", "same", 60);
        let newer = memory_at("memory_b", "same", 1);
        let mut results = vec![
            SearchResultItem::from_memory(older, 1.0),
            SearchResultItem::from_memory(newer, 1.0),
        ];
        sort_results(&mut results);
        assert_eq!(results[0].key, "memory_b");

        let twin_a = Memory::new("memory_a", "same", now);
        let twin_b = Memory::new("memory_b", "same", now);
        let mut results = vec![
            SearchResultItem::from_memory(twin_b, 1.0),
            SearchResultItem::from_memory(twin_a, 1.0),
        ];
        sort_results(&mut results);
        assert_eq!(results[0].key, "memory_a");
    }
}

//! Persona-scoped approximate-nearest-neighbour index over memory
//! embeddings.
//!
//! The relational store stays authoritative; everything behind
//! [`VectorIndex`] is derived state that the rebuild worker can
//! reconstruct. The default backend is the in-process [`EmbeddedIndex`];
//! the `qdrant` feature adds an external-service backend with the same
//! collection naming.

pub mod cosine;
pub mod memory;

#[cfg(feature = "qdrant")]
pub mod qdrant;

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::schema::Memory;

pub use memory::EmbeddedIndex;

/// Naming convention for per-persona collections.
pub fn collection_name(persona: &str) -> String {
    format!("memory_{persona}")
}

/// One indexed memory: the key, its content embedding, and the full
/// metadata payload used for filtering.
#[derive(Debug, Clone)]
pub struct VectorPoint {
    pub key: String,
    pub vector: Vec<f32>,
    pub payload: Memory,
}

#[derive(Debug, Clone)]
pub struct SearchHit {
    pub key: String,
    /// Cosine similarity of the stored vector to the query vector.
    pub similarity: f32,
    pub payload: Memory,
}

/// Tag predicate: any-of is the default; all-of when the caller asks for
/// an exact conjunction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagFilter {
    Any(BTreeSet<String>),
    All(BTreeSet<String>),
}

/// Metadata text fields that filter by case-insensitive substring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextField {
    Emotion,
    ActionTag,
    Environment,
    PhysicalState,
    MentalState,
    RelationshipStatus,
}

impl TextField {
    pub fn value<'a>(&self, memory: &'a Memory) -> Option<&'a str> {
        match self {
            Self::Emotion => Some(&memory.emotion),
            Self::ActionTag => memory.action_tag.as_deref(),
            Self::Environment => Some(&memory.environment),
            Self::PhysicalState => Some(&memory.physical_state),
            Self::MentalState => Some(&memory.mental_state),
            Self::RelationshipStatus => Some(&memory.relationship_status),
        }
    }
}

/// Conjunction of payload predicates applied during a vector query (and by
/// the keyword fallback, so both paths agree on what matches).
#[derive(Debug, Clone, Default)]
pub struct PayloadFilter {
    pub tags: Option<TagFilter>,
    pub created_from: Option<DateTime<Utc>>,
    pub created_to: Option<DateTime<Utc>>,
    pub min_importance: Option<f32>,
    /// Substring predicates; `"cook"` matches `"cooking"`.
    pub text_contains: Vec<(TextField, String)>,
}

impl PayloadFilter {
    pub fn is_empty(&self) -> bool {
        self.tags.is_none()
            && self.created_from.is_none()
            && self.created_to.is_none()
            && self.min_importance.is_none()
            && self.text_contains.is_empty()
    }

    pub fn matches(&self, memory: &Memory) -> bool {
        match &self.tags {
            Some(TagFilter::Any(wanted)) => {
                if wanted.intersection(&memory.tags).next().is_none() {
                    return false;
                }
            }
            Some(TagFilter::All(wanted)) => {
                if !wanted.is_subset(&memory.tags) {
                    return false;
                }
            }
            None => {}
        }

        if let Some(from) = self.created_from
            && memory.created_at < from
        {
            return false;
        }
        if let Some(to) = self.created_to
            && memory.created_at > to
        {
            return false;
        }
        if let Some(min) = self.min_importance
            && memory.importance < min
        {
            return false;
        }

        for (field, needle) in &self.text_contains {
            let Some(value) = field.value(memory) else {
                return false;
            };
            if !value.to_lowercase().contains(&needle.to_lowercase()) {
                return false;
            }
        }

        true
    }
}

/// Persona-scoped ANN index. All implementations are safe for concurrent
/// use; collection mutations are serialised upstream by the persona mutex.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Create the collection if needed. An existing collection with a
    /// different dimension is destructively rebuilt before writes are
    /// accepted.
    async fn ensure_collection(&self, collection: &str, dim: usize) -> Result<()>;

    /// Insert or replace by key.
    async fn upsert(&self, collection: &str, point: VectorPoint) -> Result<()>;

    /// Refresh the payload of an existing point without re-embedding.
    /// Missing points are left to the next rebuild.
    async fn set_payload(&self, collection: &str, key: &str, payload: Memory) -> Result<()>;

    /// Remove by key; absent keys are not an error.
    async fn delete(&self, collection: &str, key: &str) -> Result<()>;

    /// Top-`k` hits by cosine similarity, restricted to `filter`.
    async fn search(
        &self,
        collection: &str,
        query: &[f32],
        k: usize,
        filter: &PayloadFilter,
    ) -> Result<Vec<SearchHit>>;

    async fn count(&self, collection: &str) -> Result<usize>;

    /// Wipe the collection and reinsert all points.
    async fn rebuild(&self, collection: &str, points: Vec<VectorPoint>) -> Result<()>;

    /// All `(key, vector)` pairs; used by the duplicate detector.
    async fn export(&self, collection: &str) -> Result<Vec<(String, Vec<f32>)>>;
}

// ── Tests ─────────────────────────────────────────────────────────────────────

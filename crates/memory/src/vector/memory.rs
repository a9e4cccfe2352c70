//! In-process vector index using brute-force cosine scan.
//!
//! The default backend: no external service, rebuilt from the relational
//! store at startup and by the idle worker. Brute force is adequate for
//! the per-persona collection sizes this service sees (thousands, not
//! millions); the `qdrant` feature covers the rest.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use tracing::warn;

use super::cosine::cosine_similarity;
use super::{PayloadFilter, SearchHit, VectorIndex, VectorPoint};
use crate::error::{MemoryError, Result};
use crate::schema::Memory;

struct Collection {
    dim: usize,
    points: HashMap<String, (Vec<f32>, Memory)>,
}

#[derive(Default)]
pub struct EmbeddedIndex {
    collections: RwLock<HashMap<String, Collection>>,
}

impl EmbeddedIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VectorIndex for EmbeddedIndex {
    async fn ensure_collection(&self, collection: &str, dim: usize) -> Result<()> {
        let mut collections = self.collections.write().expect("vector lock poisoned");
        match collections.get(collection) {
            Some(existing) if existing.dim == dim => {}
            Some(existing) => {
                warn!(
                    collection,
                    old_dim = existing.dim,
                    new_dim = dim,
                    "vector dimension changed; dropping collection for rebuild"
                );
                collections.insert(
                    collection.to_string(),
                    Collection {
                        dim,
                        points: HashMap::new(),
                    },
                );
            }
            None => {
                collections.insert(
                    collection.to_string(),
                    Collection {
                        dim,
                        points: HashMap::new(),
                    },
                );
            }
        }
        Ok(())
    }

    async fn upsert(&self, collection: &str, point: VectorPoint) -> Result<()> {
        let mut collections = self.collections.write().expect("vector lock poisoned");
        let entry = collections
            .entry(collection.to_string())
            .or_insert_with(|| Collection {
                dim: point.vector.len(),
                points: HashMap::new(),
            });
        if point.vector.len() != entry.dim {
            return Err(MemoryError::VectorStore(format!(
                "dimension mismatch in {collection}: point has {}, collection has {}",
                point.vector.len(),
                entry.dim
            )));
        }
        entry.points.insert(point.key.clone(), (point.vector, point.payload));
        Ok(())
    }

    async fn set_payload(&self, collection: &str, key: &str, payload: Memory) -> Result<()> {
        let mut collections = self.collections.write().expect("vector lock poisoned");
        if let Some(entry) = collections.get_mut(collection)
            && let Some(slot) = entry.points.get_mut(key)
        {
            slot.1 = payload;
        }
        // A missing point means the index lags the store; the next rebuild
        // reconciles it.
        Ok(())
    }

    async fn delete(&self, collection: &str, key: &str) -> Result<()> {
        let mut collections = self.collections.write().expect("vector lock poisoned");
        if let Some(entry) = collections.get_mut(collection) {
            entry.points.remove(key);
        }
        Ok(())
    }

    async fn search(
        &self,
        collection: &str,
        query: &[f32],
        k: usize,
        filter: &PayloadFilter,
    ) -> Result<Vec<SearchHit>> {
        let collections = self.collections.read().expect("vector lock poisoned");
        let Some(entry) = collections.get(collection) else {
            return Ok(Vec::new());
        };
        if k == 0 {
            return Ok(Vec::new());
        }

        let mut hits: Vec<SearchHit> = entry
            .points
            .iter()
            .filter(|(_, (_, payload))| filter.matches(payload))
            .map(|(key, (vector, payload))| SearchHit {
                key: key.clone(),
                similarity: cosine_similarity(query, vector),
                payload: payload.clone(),
            })
            .collect();

        hits.sort_by(|a, b| {
            b.similarity
                .total_cmp(&a.similarity)
                .then_with(|| b.payload.created_at.cmp(&a.payload.created_at))
                .then_with(|| a.key.cmp(&b.key))
        });
        hits.truncate(k);
        Ok(hits)
    }

    async fn count(&self, collection: &str) -> Result<usize> {
        let collections = self.collections.read().expect("vector lock poisoned");
        Ok(collections.get(collection).map_or(0, |c| c.points.len()))
    }

    async fn rebuild(&self, collection: &str, points: Vec<VectorPoint>) -> Result<()> {
        let mut collections = self.collections.write().expect("vector lock poisoned");
        let dim = points
            .first()
            .map(|p| p.vector.len())
            .or_else(|| collections.get(collection).map(|c| c.dim))
            .unwrap_or(0);

        let mut rebuilt = Collection {
            dim,
            points: HashMap::with_capacity(points.len()),
        };
        for point in points {
            if point.vector.len() != dim {
                return Err(MemoryError::VectorStore(format!(
                    "dimension mismatch during rebuild of {collection}"
                )));
            }
            rebuilt.points.insert(point.key.clone(), (point.vector, point.payload));
        }
        collections.insert(collection.to_string(), rebuilt);
        Ok(())
    }

    async fn export(&self, collection: &str) -> Result<Vec<(String, Vec<f32>)>> {
        let collections = self.collections.read().expect("vector lock poisoned");
        Ok(collections.get(collection).map_or_else(Vec::new, |c| {
            c.points
                .iter()
                .map(|(key, (vector, _))| (key.clone(), vector.clone()))
                .collect()
        }))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

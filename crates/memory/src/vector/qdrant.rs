//! Qdrant-backed vector index (feature `qdrant`).
//!
//! Collections follow the same `memory_<persona>` naming as the embedded
//! backend. Qdrant point ids must be uuids or integers, so each point id
//! is a v5 uuid derived from the memory key; the key itself rides in the
//! payload together with the full metadata and a numeric
//! `created_at_ts` field used for server-side range filtering.
//!
//! Server-side filtering covers the cheap predicates (importance, created
//! range, any-of tags); the conjunction in [`PayloadFilter::matches`] is
//! re-applied to the decoded payloads so substring and all-of semantics
//! are identical across backends.

use std::collections::HashMap;

use async_trait::async_trait;
use qdrant_client::Qdrant;
use qdrant_client::qdrant::{
    Condition, CountPointsBuilder, CreateCollectionBuilder, DeletePointsBuilder, Distance, Filter,
    PointStruct, PointsIdsList, Range, ScrollPointsBuilder, SearchPointsBuilder,
    UpsertPointsBuilder, VectorParamsBuilder,
};
use tracing::{info, warn};
use uuid::Uuid;

use super::{PayloadFilter, SearchHit, TagFilter, VectorIndex, VectorPoint};
use crate::error::{MemoryError, Result};
use crate::schema::Memory;

/// Batch size for rebuild upserts and export scrolling.
const BATCH: usize = 128;

pub struct QdrantIndex {
    client: Qdrant,
}

impl QdrantIndex {
    pub fn connect(url: &str) -> Result<Self> {
        let client = Qdrant::from_url(url)
            .build()
            .map_err(|err| MemoryError::VectorStore(err.to_string()))?;
        info!(url, "connected to qdrant");
        Ok(Self { client })
    }
}

fn point_id_for(key: &str) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, key.as_bytes()).to_string()
}

fn vector_err(err: impl std::fmt::Display) -> MemoryError {
    MemoryError::VectorStore(err.to_string())
}

fn encode_payload(memory: &Memory) -> Result<HashMap<String, serde_json::Value>> {
    let mut payload: HashMap<String, serde_json::Value> =
        serde_json::from_value(serde_json::to_value(memory)?)?;
    payload.insert(
        "created_at_ts".to_string(),
        serde_json::json!(memory.created_at.timestamp_micros()),
    );
    Ok(payload)
}

fn decode_payload(
    payload: HashMap<String, qdrant_client::qdrant::Value>,
) -> Result<Memory> {
    let mut value = serde_json::to_value(payload)?;
    if let Some(object) = value.as_object_mut() {
        object.remove("created_at_ts");
    }
    serde_json::from_value(value)
        .map_err(|err| MemoryError::VectorStore(format!("undecodable qdrant payload: {err}")))
}

/// Server-side prefilter: importance and created-at ranges as `must`,
/// any-of tags as `should`. All-of tags become per-tag `must` conditions.
fn server_filter(filter: &PayloadFilter) -> Option<Filter> {
    let mut must = Vec::new();
    let mut should = Vec::new();

    if let Some(min) = filter.min_importance {
        must.push(Condition::range(
            "importance",
            Range {
                gte: Some(min as f64),
                ..Range::default()
            },
        ));
    }
    if filter.created_from.is_some() || filter.created_to.is_some() {
        must.push(Condition::range(
            "created_at_ts",
            Range {
                gte: filter.created_from.map(|t| t.timestamp_micros() as f64),
                lte: filter.created_to.map(|t| t.timestamp_micros() as f64),
                ..Range::default()
            },
        ));
    }
    match &filter.tags {
        Some(TagFilter::Any(tags)) => {
            for tag in tags {
                should.push(Condition::matches("tags", tag.clone()));
            }
        }
        Some(TagFilter::All(tags)) => {
            for tag in tags {
                must.push(Condition::matches("tags", tag.clone()));
            }
        }
        None => {}
    }

    if must.is_empty() && should.is_empty() {
        return None;
    }
    Some(Filter {
        must,
        should,
        ..Filter::default()
    })
}

#[async_trait]
impl VectorIndex for QdrantIndex {
    async fn ensure_collection(&self, collection: &str, dim: usize) -> Result<()> {
        let exists = self
            .client
            .collection_exists(collection)
            .await
            .map_err(vector_err)?;

        if exists {
            let info = self
                .client
                .collection_info(collection)
                .await
                .map_err(vector_err)?;
            let existing_dim = info
                .result
                .as_ref()
                .and_then(|r| r.config.as_ref())
                .and_then(|c| c.params.as_ref())
                .and_then(|p| p.vectors_config.as_ref())
                .and_then(|v| v.config.as_ref())
                .and_then(|c| match c {
                    qdrant_client::qdrant::vectors_config::Config::Params(params) => {
                        Some(params.size as usize)
                    }
                    _ => None,
                });
            match existing_dim {
                Some(existing) if existing == dim => return Ok(()),
                other => {
                    warn!(
                        collection,
                        existing_dim = ?other,
                        new_dim = dim,
                        "vector dimension changed; dropping qdrant collection for rebuild"
                    );
                    self.client
                        .delete_collection(collection)
                        .await
                        .map_err(vector_err)?;
                }
            }
        }

        self.client
            .create_collection(
                CreateCollectionBuilder::new(collection)
                    .vectors_config(VectorParamsBuilder::new(dim as u64, Distance::Cosine)),
            )
            .await
            .map_err(vector_err)?;
        Ok(())
    }

    async fn upsert(&self, collection: &str, point: VectorPoint) -> Result<()> {
        let payload = encode_payload(&point.payload)?;
        let qdrant_point = PointStruct::new(point_id_for(&point.key), point.vector, payload);
        self.client
            .upsert_points(UpsertPointsBuilder::new(collection, vec![qdrant_point]))
            .await
            .map_err(vector_err)?;
        Ok(())
    }

    async fn set_payload(&self, collection: &str, key: &str, payload: Memory) -> Result<()> {
        use qdrant_client::qdrant::SetPayloadPointsBuilder;

        let encoded = encode_payload(&payload)?;
        let qdrant_payload: qdrant_client::Payload = encoded.into();
        self.client
            .set_payload(
                SetPayloadPointsBuilder::new(collection, qdrant_payload).points_selector(
                    PointsIdsList {
                        ids: vec![point_id_for(key).into()],
                    },
                ),
            )
            .await
            .map_err(vector_err)?;
        Ok(())
    }

    async fn delete(&self, collection: &str, key: &str) -> Result<()> {
        self.client
            .delete_points(DeletePointsBuilder::new(collection).points(PointsIdsList {
                ids: vec![point_id_for(key).into()],
            }))
            .await
            .map_err(vector_err)?;
        Ok(())
    }

    async fn search(
        &self,
        collection: &str,
        query: &[f32],
        k: usize,
        filter: &PayloadFilter,
    ) -> Result<Vec<SearchHit>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        // Over-fetch so the exact client-side conjunction (substring
        // predicates, all-of tags) still fills k results.
        let fetch = (k * 4).max(k);
        let mut builder =
            SearchPointsBuilder::new(collection, query.to_vec(), fetch as u64).with_payload(true);
        if let Some(server) = server_filter(filter) {
            builder = builder.filter(server);
        }

        let response = self.client.search_points(builder).await.map_err(vector_err)?;

        let mut hits = Vec::new();
        for point in response.result {
            let payload = decode_payload(point.payload)?;
            if !filter.matches(&payload) {
                continue;
            }
            hits.push(SearchHit {
                key: payload.key.clone(),
                similarity: point.score,
                payload,
            });
            if hits.len() == k {
                break;
            }
        }
        Ok(hits)
    }

    async fn count(&self, collection: &str) -> Result<usize> {
        let response = self
            .client
            .count(CountPointsBuilder::new(collection).exact(true))
            .await
            .map_err(vector_err)?;
        Ok(response.result.map_or(0, |r| r.count as usize))
    }

    async fn rebuild(&self, collection: &str, points: Vec<VectorPoint>) -> Result<()> {
        let Some(dim) = points.first().map(|p| p.vector.len()) else {
            // Nothing to index: leave an empty collection behind.
            if self
                .client
                .collection_exists(collection)
                .await
                .map_err(vector_err)?
            {
                self.client
                    .delete_collection(collection)
                    .await
                    .map_err(vector_err)?;
            }
            return Ok(());
        };

        if self
            .client
            .collection_exists(collection)
            .await
            .map_err(vector_err)?
        {
            self.client
                .delete_collection(collection)
                .await
                .map_err(vector_err)?;
        }
        self.ensure_collection(collection, dim).await?;

        for chunk in points.chunks(BATCH) {
            let batch: Vec<PointStruct> = chunk
                .iter()
                .map(|point| {
                    encode_payload(&point.payload).map(|payload| {
                        PointStruct::new(point_id_for(&point.key), point.vector.clone(), payload)
                    })
                })
                .collect::<Result<_>>()?;
            self.client
                .upsert_points(UpsertPointsBuilder::new(collection, batch))
                .await
                .map_err(vector_err)?;
        }
        Ok(())
    }

    async fn export(&self, collection: &str) -> Result<Vec<(String, Vec<f32>)>> {
        let mut out = Vec::new();
        let mut offset: Option<qdrant_client::qdrant::PointId> = None;

        loop {
            let mut builder = ScrollPointsBuilder::new(collection)
                .limit(BATCH as u32)
                .with_payload(true)
                .with_vectors(true);
            if let Some(next) = offset.clone() {
                builder = builder.offset(next);
            }

            let response = self.client.scroll(builder).await.map_err(vector_err)?;
            for point in response.result {
                let payload = decode_payload(point.payload)?;
                #[allow(deprecated)] // VectorsOutput.data is deprecated but still populated
                let vector = point.vectors.and_then(|v| v.vectors_options).and_then(|v| {
                    match v {
                        qdrant_client::qdrant::vectors_output::VectorsOptions::Vector(v) => {
                            Some(v.data)
                        }
                        qdrant_client::qdrant::vectors_output::VectorsOptions::Vectors(_) => None,
                    }
                });
                if let Some(vector) = vector {
                    out.push((payload.key, vector));
                }
            }

            match response.next_page_offset {
                Some(next) => offset = Some(next),
                None => break,
            }
        }
        Ok(out)
    }
}

//! Narrow ports to the embedding and reranking models.
//!
//! The engine only ever sees these traits; the concrete models live behind
//! the optional `fastembed` feature and are loaded once per process. A
//! port that fails to load degrades the service to keyword-only search —
//! it never fails startup.

use async_trait::async_trait;

use crate::error::Result;

/// Text → fixed-dimension vector. Deterministic for a given model version.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Output dimensionality; the vector store derives its collection
    /// dimension from this at initialisation.
    fn dimension(&self) -> usize;
}

/// Cross-encoder relevance scorer: `(query, doc) → score`, higher is more
/// relevant. Optional — callers must function without it.
#[async_trait]
pub trait Reranker: Send + Sync {
    async fn score(&self, query: &str, docs: &[String]) -> Result<Vec<f32>>;
}

/// Scale to unit length in place. Zero vectors stay zero.
pub fn normalize(vector: &mut [f32]) {
    let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in vector.iter_mut() {
            *x /= norm;
        }
    }
}

pub fn normalized(mut vector: Vec<f32>) -> Vec<f32> {
    normalize(&mut vector);
    vector
}

/// The process-wide model singletons, resolved once at startup.
pub struct ModelPorts {
    pub embedder: Option<std::sync::Arc<dyn Embedder>>,
    pub reranker: Option<std::sync::Arc<dyn Reranker>>,
}

/// Load the configured models. Any load failure is logged and leaves the
/// corresponding port empty.
#[cfg(feature = "fastembed")]
pub fn load_model_ports(config: &memcp_config::AppConfig, cache_dir: &std::path::Path) -> ModelPorts {
    use std::sync::Arc;

    let embedder = match fastembed_impl::FastembedEmbedder::load(&config.embeddings_model, cache_dir)
    {
        Ok(embedder) => Some(Arc::new(embedder) as Arc<dyn Embedder>),
        Err(err) => {
            tracing::warn!(%err, model = %config.embeddings_model, "embedding model failed to load; degrading to keyword-only search");
            None
        }
    };

    let reranker = match &config.reranker_model {
        None => None,
        Some(model) => match fastembed_impl::FastembedReranker::load(model, cache_dir) {
            Ok(reranker) => Some(Arc::new(reranker) as Arc<dyn Reranker>),
            Err(err) => {
                tracing::warn!(%err, model = %model, "reranker model failed to load; continuing without reranking");
                None
            }
        },
    };

    ModelPorts { embedder, reranker }
}

#[cfg(not(feature = "fastembed"))]
pub fn load_model_ports(
    config: &memcp_config::AppConfig,
    _cache_dir: &std::path::Path,
) -> ModelPorts {
    tracing::warn!(
        model = %config.embeddings_model,
        "built without the 'fastembed' feature; semantic search is disabled unless an embedder is injected"
    );
    ModelPorts {
        embedder: None,
        reranker: None,
    }
}

#[cfg(feature = "fastembed")]
mod fastembed_impl {
    use std::path::Path;
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use fastembed::{
        EmbeddingModel, InitOptions, RerankInitOptions, RerankerModel, TextEmbedding, TextRerank,
    };
    use tracing::{info, warn};

    use super::{Embedder, Reranker, normalize};
    use crate::error::{MemoryError, Result};

    fn embedding_model_for(name: &str) -> EmbeddingModel {
        let lowered = name.to_lowercase();
        if lowered.contains("minilm") {
            EmbeddingModel::AllMiniLML6V2
        } else if lowered.contains("bge-small") {
            EmbeddingModel::BGESmallENV15
        } else if lowered.contains("bge-base") {
            EmbeddingModel::BGEBaseENV15
        } else if lowered.contains("e5-small") {
            EmbeddingModel::MultilingualE5Small
        } else {
            warn!(model = name, "unrecognised embeddings model; using all-MiniLM-L6-v2");
            EmbeddingModel::AllMiniLML6V2
        }
    }

    fn reranker_model_for(name: &str) -> RerankerModel {
        let lowered = name.to_lowercase();
        if lowered.contains("v2-m3") {
            RerankerModel::BGERerankerV2M3
        } else if lowered.contains("bge-reranker") {
            RerankerModel::BGERerankerBase
        } else {
            warn!(model = name, "unrecognised reranker model; using bge-reranker-base");
            RerankerModel::BGERerankerBase
        }
    }

    pub struct FastembedEmbedder {
        model: Arc<Mutex<TextEmbedding>>,
        dim: usize,
    }

    impl FastembedEmbedder {
        pub fn load(model_name: &str, cache_dir: &Path) -> Result<Self> {
            let selected = embedding_model_for(model_name);
            let options = InitOptions::new(selected.clone())
                .with_cache_dir(cache_dir.to_path_buf())
                .with_show_download_progress(false);
            let model = TextEmbedding::try_new(options)
                .map_err(|err| MemoryError::Model(err.to_string()))?;

            // Probe once instead of trusting a static table: the dimension
            // must match what this exact model emits.
            let model = Arc::new(Mutex::new(model));
            let probe = {
                let mut guard = model.lock().expect("embedding model lock poisoned");
                guard
                    .embed(vec!["dimension probe".to_string()], None)
                    .map_err(|err| MemoryError::Model(err.to_string()))?
            };
            let dim = probe.first().map(Vec::len).unwrap_or(0);
            if dim == 0 {
                return Err(MemoryError::Model("embedding model produced no output".into()));
            }
            info!(model = ?selected, dim, "embedding model loaded");
            Ok(Self { model, dim })
        }
    }

    #[async_trait]
    impl Embedder for FastembedEmbedder {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            let model = Arc::clone(&self.model);
            let texts = texts.to_vec();
            let mut vectors = tokio::task::spawn_blocking(move || {
                let mut guard = model.lock().expect("embedding model lock poisoned");
                guard.embed(texts, None)
            })
            .await
            .map_err(|err| MemoryError::Model(format!("embedding task panicked: {err}")))?
            .map_err(|err| MemoryError::Model(err.to_string()))?;

            for vector in &mut vectors {
                normalize(vector);
            }
            Ok(vectors)
        }

        fn dimension(&self) -> usize {
            self.dim
        }
    }

    pub struct FastembedReranker {
        model: Arc<Mutex<TextRerank>>,
    }

    impl FastembedReranker {
        pub fn load(model_name: &str, cache_dir: &Path) -> Result<Self> {
            let selected = reranker_model_for(model_name);
            let options = RerankInitOptions::new(selected.clone())
                .with_cache_dir(cache_dir.to_path_buf())
                .with_show_download_progress(false);
            let model =
                TextRerank::try_new(options).map_err(|err| MemoryError::Model(err.to_string()))?;
            info!(model = ?selected, "reranker model loaded");
            Ok(Self {
                model: Arc::new(Mutex::new(model)),
            })
        }
    }

    #[async_trait]
    impl Reranker for FastembedReranker {
        async fn score(&self, query: &str, docs: &[String]) -> Result<Vec<f32>> {
            if docs.is_empty() {
                return Ok(Vec::new());
            }
            let model = Arc::clone(&self.model);
            let query = query.to_string();
            let docs = docs.to_vec();
            let results = tokio::task::spawn_blocking(move || {
                let mut guard = model.lock().expect("reranker model lock poisoned");
                let documents: Vec<&str> = docs.iter().map(String::as_str).collect();
                guard.rerank(query.as_str(), documents, false, None)
            })
            .await
            .map_err(|err| MemoryError::Model(format!("rerank task panicked: {err}")))?
            .map_err(|err| MemoryError::Model(err.to_string()))?;

            // Results come back relevance-ordered; restore document order.
            let mut scores = vec![0.0_f32; results.len()];
            for result in results {
                if let Some(slot) = scores.get_mut(result.index) {
                    *slot = result.score;
                }
            }
            Ok(scores)
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

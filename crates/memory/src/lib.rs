pub mod context;
pub mod dedup;
pub mod embed;
pub mod engine;
pub mod error;
pub mod keys;
pub mod maintenance;
pub mod oplog;
pub mod registry;
pub mod schema;
pub mod search;
pub mod store;
pub mod timeframe;
pub mod vector;

pub use context::{ContextStore, ContextUpdate, PersonaContext};
pub use embed::{Embedder, ModelPorts, Reranker, load_model_ports};
pub use engine::{
    CreateOutcome, CreateRequest, DeleteOutcome, MemoryEngine, SessionContext, StatsReport,
    UpdateOutcome, UpdateRequest,
};
pub use error::{MemoryError, Result};
pub use maintenance::spawn_workers;
pub use oplog::OperationLog;
pub use registry::{PersonaRegistry, PersonaState, resolve_persona, sanitize_persona};
pub use schema::{CleanupReport, CleanupSuggestion, Memory, MemoryPreview, OperationRecord, truncate_str};
pub use search::{SearchPipeline, SearchRequest, SearchResultItem};
pub use store::{RelationalStore, StoreStats};
pub use timeframe::DateRange;
pub use vector::{EmbeddedIndex, PayloadFilter, SearchHit, VectorIndex, VectorPoint};

#[cfg(feature = "qdrant")]
pub use vector::qdrant::QdrantIndex;

//! Persona resolution and the per-persona resource bundles.
//!
//! A persona name arrives with every request (explicit argument, bearer
//! token, or header) and maps to a lazily constructed, never-evicted
//! bundle: the SQLite store, the context file, the vector collection name,
//! the write/rebuild mutexes, and the atomic timestamps the maintenance
//! workers key off. Once published a bundle is immutable.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, RwLock};

use chrono::Utc;
use tokio::sync::Mutex;

use crate::context::ContextStore;
use crate::error::Result;
use crate::store::RelationalStore;
use crate::vector::collection_name;

/// Reserved fallback persona.
pub const DEFAULT_PERSONA: &str = "default";

/// Resolve the persona for a request. Priority: explicit argument >
/// `Authorization: Bearer <persona>` > `X-Persona` header > `"default"`.
pub fn resolve_persona(
    explicit: Option<&str>,
    authorization: Option<&str>,
    x_persona: Option<&str>,
) -> String {
    let raw = explicit
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .or_else(|| authorization.and_then(bearer_persona))
        .or_else(|| x_persona.map(str::trim).filter(|s| !s.is_empty()))
        .unwrap_or(DEFAULT_PERSONA);
    sanitize_persona(raw)
}

fn bearer_persona(header: &str) -> Option<&str> {
    header
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Persona names become directory names, so path separators are neutralised.
pub fn sanitize_persona(raw: &str) -> String {
    let cleaned = raw.trim().replace(['/', '\\'], "_");
    if cleaned.is_empty() {
        DEFAULT_PERSONA.to_string()
    } else {
        cleaned
    }
}

/// Observable side of the per-persona maintenance state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PersonaState {
    Clean,
    Dirty,
    Rebuilding,
}

pub struct PersonaHandle {
    pub name: String,
    pub store: RelationalStore,
    pub context: ContextStore,
    /// Vector collection for this persona (`memory_<persona>`).
    pub collection: String,
    persona_dir: PathBuf,
    /// Serialises writes to C2/C5, index mutations, and state transitions.
    pub write_lock: Mutex<()>,
    /// Prevents overlapping rebuilds; held for the whole drain-and-reindex.
    pub rebuild_lock: Mutex<()>,
    dirty: AtomicBool,
    last_write: AtomicI64,
    last_rebuild: AtomicI64,
    last_duplicate_scan: AtomicI64,
}

impl PersonaHandle {
    fn open(name: &str, persona_dir: PathBuf) -> Result<Self> {
        let store = RelationalStore::open(persona_dir.join("memories.db"))?;
        let context = ContextStore::new(persona_dir.join("persona_context"));
        Ok(Self {
            name: name.to_string(),
            store,
            context,
            collection: collection_name(name),
            persona_dir,
            write_lock: Mutex::new(()),
            rebuild_lock: Mutex::new(()),
            dirty: AtomicBool::new(false),
            last_write: AtomicI64::new(0),
            last_rebuild: AtomicI64::new(0),
            last_duplicate_scan: AtomicI64::new(0),
        })
    }

    pub fn suggestions_path(&self) -> PathBuf {
        self.persona_dir.join("cleanup_suggestions")
    }

    /// Any successful write: Clean → Dirty, stamp `last_write`.
    /// Timestamps only move forward.
    pub fn mark_write(&self) {
        self.dirty.store(true, Ordering::SeqCst);
        self.last_write.fetch_max(Utc::now().timestamp(), Ordering::SeqCst);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    /// Rebuilding → Dirty is implicit: a write during the rebuild re-sets
    /// the flag after this clear.
    pub fn clear_dirty(&self) {
        self.dirty.store(false, Ordering::SeqCst);
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }

    pub fn note_rebuild(&self) {
        self.last_rebuild.fetch_max(Utc::now().timestamp(), Ordering::SeqCst);
    }

    pub fn note_duplicate_scan(&self) {
        self.last_duplicate_scan
            .fetch_max(Utc::now().timestamp(), Ordering::SeqCst);
    }

    /// Unix seconds of the most recent write; 0 = never.
    pub fn last_write_secs(&self) -> i64 {
        self.last_write.load(Ordering::SeqCst)
    }

    pub fn last_rebuild_secs(&self) -> i64 {
        self.last_rebuild.load(Ordering::SeqCst)
    }

    pub fn last_duplicate_scan_secs(&self) -> i64 {
        self.last_duplicate_scan.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> PersonaState {
        match self.rebuild_lock.try_lock() {
            Err(_) => PersonaState::Rebuilding,
            Ok(_guard) => {
                if self.is_dirty() {
                    PersonaState::Dirty
                } else {
                    PersonaState::Clean
                }
            }
        }
    }
}

/// Process-wide persona table. Entries are created on first use and live
/// for the rest of the process.
pub struct PersonaRegistry {
    data_dir: PathBuf,
    personas: RwLock<HashMap<String, Arc<PersonaHandle>>>,
}

impl PersonaRegistry {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            personas: RwLock::new(HashMap::new()),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Fetch (or lazily construct) the bundle for a persona.
    pub fn handle(&self, persona: &str) -> Result<Arc<PersonaHandle>> {
        let persona = sanitize_persona(persona);

        if let Some(handle) = self
            .personas
            .read()
            .expect("registry lock poisoned")
            .get(&persona)
        {
            return Ok(Arc::clone(handle));
        }

        // Construct outside the write lock; a racing constructor for the
        // same persona loses and drops its copy.
        let persona_dir = self.data_dir.join("memory").join(&persona);
        let built = Arc::new(PersonaHandle::open(&persona, persona_dir)?);

        let mut personas = self.personas.write().expect("registry lock poisoned");
        let handle = personas.entry(persona).or_insert(built);
        Ok(Arc::clone(handle))
    }

    /// All personas seen so far; the maintenance workers iterate this.
    pub fn live(&self) -> Vec<Arc<PersonaHandle>> {
        self.personas
            .read()
            .expect("registry lock poisoned")
            .values()
            .map(Arc::clone)
            .collect()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

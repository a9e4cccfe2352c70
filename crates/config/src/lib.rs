//! Layered configuration for the memcp service.
//!
//! Resolution order, later layers overriding earlier ones:
//!
//! 1. code defaults ([`AppConfig::default`])
//! 2. environment variables (`MEMORY_MCP_*`, nested keys flattened with
//!    single underscores, e.g. `MEMORY_MCP_VECTOR_REBUILD_IDLE_SECONDS`)
//! 3. an optional JSON file
//!
//! `server_host` / `server_port` are the one exception: the environment
//! overrides the file for those two keys, so a deployment can repoint a
//! service without editing its config file.
//!
//! Unknown top-level keys in the file are preserved (and ignored) so a
//! newer file can be read by an older binary without data loss on rewrite.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use std::time::SystemTime;

use anyhow::{Context, Result, bail};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

/// Prefix for all recognised environment overrides.
pub const ENV_PREFIX: &str = "MEMORY_MCP_";

/// Vector index rebuild policy for the idle maintenance worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RebuildMode {
    /// Rebuild automatically once a persona has been idle long enough.
    Idle,
    /// Rebuild only on an explicit `rebuild_index` call.
    Manual,
    /// Never rebuild.
    Disabled,
}

impl FromStr for RebuildMode {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "idle" => Ok(Self::Idle),
            "manual" => Ok(Self::Manual),
            "disabled" => Ok(Self::Disabled),
            other => bail!("unknown rebuild mode '{other}' (expected idle|manual|disabled)"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct VectorRebuildConfig {
    pub mode: RebuildMode,
    /// Seconds a persona must stay write-free before a rebuild is considered.
    pub idle_seconds: u64,
    /// Minimum seconds between two rebuilds of the same persona.
    pub min_interval: u64,
}

impl Default for VectorRebuildConfig {
    fn default() -> Self {
        Self {
            mode: RebuildMode::Idle,
            idle_seconds: 30,
            min_interval: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AutoCleanupConfig {
    pub enabled: bool,
    /// Minutes of persona inactivity before a duplicate scan may run.
    pub idle_minutes: u64,
    /// Seconds between wake-ups of the duplicate worker.
    pub check_interval_seconds: u64,
    /// Minimum pairwise similarity for cluster membership.
    pub duplicate_threshold: f32,
    /// Pairs below this similarity are never surfaced.
    pub min_similarity_to_report: f32,
    pub max_suggestions_per_run: usize,
}

impl Default for AutoCleanupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            idle_minutes: 30,
            check_interval_seconds: 60,
            duplicate_threshold: 0.90,
            min_similarity_to_report: 0.85,
            max_suggestions_per_run: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AppConfig {
    pub embeddings_model: String,
    pub embeddings_device: String,
    /// Cross-encoder model name; `None` disables reranking.
    pub reranker_model: Option<String>,
    /// Number of top candidates handed to the reranker.
    pub reranker_top_n: usize,
    pub server_host: String,
    pub server_port: u16,
    /// IANA timezone used to resolve natural-language date expressions.
    pub timezone: String,
    /// Root directory for per-persona stores, logs, and model caches.
    pub data_dir: String,
    /// gRPC URL of an external Qdrant instance (honoured by the `qdrant`
    /// feature of the memory crate).
    pub qdrant_url: Option<String>,
    /// Number of recent memories included in a stats report.
    pub stats_recent_count: usize,
    pub vector_rebuild: VectorRebuildConfig,
    pub auto_cleanup: AutoCleanupConfig,
    /// Top-level file keys this build does not recognise. Preserved so a
    /// round-trip never drops them; otherwise ignored.
    #[serde(skip_serializing_if = "serde_json::Map::is_empty")]
    pub extra: serde_json::Map<String, Value>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            embeddings_model: "sentence-transformers/all-MiniLM-L6-v2".to_string(),
            embeddings_device: "cpu".to_string(),
            reranker_model: None,
            reranker_top_n: 10,
            server_host: "127.0.0.1".to_string(),
            server_port: 8931,
            timezone: "UTC".to_string(),
            data_dir: "data".to_string(),
            qdrant_url: None,
            stats_recent_count: 10,
            vector_rebuild: VectorRebuildConfig::default(),
            auto_cleanup: AutoCleanupConfig::default(),
            extra: serde_json::Map::new(),
        }
    }
}

impl AppConfig {
    /// Build the effective configuration: defaults ← env ← optional file,
    /// with the `server_host`/`server_port` env exception applied last.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default();
        config.apply_env_pairs(env::vars());

        if let Some(path) = path
            && path.exists()
        {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("reading config file {}", path.display()))?;
            config
                .apply_file(&raw)
                .with_context(|| format!("parsing config file {}", path.display()))?;

            // Deployment exception: the environment wins for the bind address.
            config.apply_env_pairs(env::vars().filter(|(k, _)| {
                k == "MEMORY_MCP_SERVER_HOST" || k == "MEMORY_MCP_SERVER_PORT"
            }));
        }

        Ok(config)
    }

    /// Apply `MEMORY_MCP_*` overrides from an iterator of key/value pairs.
    /// Unparseable values are skipped with a warning, keeping the prior value.
    pub fn apply_env_pairs(&mut self, vars: impl IntoIterator<Item = (String, String)>) {
        for (key, value) in vars {
            let Some(suffix) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            match suffix {
                "EMBEDDINGS_MODEL" => self.embeddings_model = value,
                "EMBEDDINGS_DEVICE" => self.embeddings_device = value,
                "RERANKER_MODEL" => {
                    self.reranker_model = if value.is_empty() { None } else { Some(value) };
                }
                "RERANKER_TOP_N" => set_parsed(&key, &value, &mut self.reranker_top_n),
                "SERVER_HOST" => self.server_host = value,
                "SERVER_PORT" => set_parsed(&key, &value, &mut self.server_port),
                "TIMEZONE" => self.timezone = value,
                "DATA_DIR" => self.data_dir = value,
                "QDRANT_URL" => {
                    self.qdrant_url = if value.is_empty() { None } else { Some(value) };
                }
                "STATS_RECENT_COUNT" => set_parsed(&key, &value, &mut self.stats_recent_count),
                "VECTOR_REBUILD_MODE" => set_parsed(&key, &value, &mut self.vector_rebuild.mode),
                "VECTOR_REBUILD_IDLE_SECONDS" => {
                    set_parsed(&key, &value, &mut self.vector_rebuild.idle_seconds);
                }
                "VECTOR_REBUILD_MIN_INTERVAL" => {
                    set_parsed(&key, &value, &mut self.vector_rebuild.min_interval);
                }
                "AUTO_CLEANUP_ENABLED" => set_parsed(&key, &value, &mut self.auto_cleanup.enabled),
                "AUTO_CLEANUP_IDLE_MINUTES" => {
                    set_parsed(&key, &value, &mut self.auto_cleanup.idle_minutes);
                }
                "AUTO_CLEANUP_CHECK_INTERVAL_SECONDS" => {
                    set_parsed(&key, &value, &mut self.auto_cleanup.check_interval_seconds);
                }
                "AUTO_CLEANUP_DUPLICATE_THRESHOLD" => {
                    set_parsed(&key, &value, &mut self.auto_cleanup.duplicate_threshold);
                }
                "AUTO_CLEANUP_MIN_SIMILARITY_TO_REPORT" => {
                    set_parsed(&key, &value, &mut self.auto_cleanup.min_similarity_to_report);
                }
                "AUTO_CLEANUP_MAX_SUGGESTIONS_PER_RUN" => {
                    set_parsed(&key, &value, &mut self.auto_cleanup.max_suggestions_per_run);
                }
                other => debug!(key = other, "ignoring unrecognised MEMORY_MCP_ variable"),
            }
        }
    }

    /// Merge a JSON config file over the current values. Only keys present
    /// in the file are touched; nested sections merge key-wise.
    pub fn apply_file(&mut self, raw: &str) -> Result<()> {
        let value: Value = serde_json::from_str(raw)?;
        let Value::Object(entries) = value else {
            bail!("config file root must be a JSON object");
        };

        for (key, value) in entries {
            match key.as_str() {
                "embeddings_model" => apply_string(&key, &value, &mut self.embeddings_model),
                "embeddings_device" => apply_string(&key, &value, &mut self.embeddings_device),
                "reranker_model" => {
                    self.reranker_model = value.as_str().map(str::to_string);
                }
                "reranker_top_n" => apply_usize(&key, &value, &mut self.reranker_top_n),
                "server_host" => apply_string(&key, &value, &mut self.server_host),
                "server_port" => {
                    if let Some(port) = value.as_u64().and_then(|p| u16::try_from(p).ok()) {
                        self.server_port = port;
                    } else {
                        warn!(%value, "config key 'server_port' is not a valid port; keeping previous value");
                    }
                }
                "timezone" => apply_string(&key, &value, &mut self.timezone),
                "data_dir" => apply_string(&key, &value, &mut self.data_dir),
                "qdrant_url" => {
                    self.qdrant_url = value.as_str().map(str::to_string);
                }
                "stats_recent_count" => apply_usize(&key, &value, &mut self.stats_recent_count),
                "vector_rebuild" => self.apply_vector_rebuild(&value),
                "auto_cleanup" => self.apply_auto_cleanup(&value),
                _ => {
                    debug!(key = %key, "preserving unrecognised config key");
                    self.extra.insert(key, value);
                }
            }
        }

        Ok(())
    }

    fn apply_vector_rebuild(&mut self, value: &Value) {
        let Some(section) = value.as_object() else {
            warn!("config key 'vector_rebuild' must be an object; ignoring");
            return;
        };
        for (key, value) in section {
            match key.as_str() {
                "mode" => {
                    if let Some(raw) = value.as_str() {
                        match raw.parse() {
                            Ok(mode) => self.vector_rebuild.mode = mode,
                            Err(err) => {
                                warn!(%err, "invalid vector_rebuild.mode; keeping previous value");
                            }
                        }
                    }
                }
                "idle_seconds" => apply_u64(key, value, &mut self.vector_rebuild.idle_seconds),
                "min_interval" => apply_u64(key, value, &mut self.vector_rebuild.min_interval),
                other => debug!(key = other, "ignoring unrecognised vector_rebuild key"),
            }
        }
    }

    fn apply_auto_cleanup(&mut self, value: &Value) {
        let Some(section) = value.as_object() else {
            warn!("config key 'auto_cleanup' must be an object; ignoring");
            return;
        };
        for (key, value) in section {
            match key.as_str() {
                "enabled" => {
                    if let Some(flag) = value.as_bool() {
                        self.auto_cleanup.enabled = flag;
                    }
                }
                "idle_minutes" => apply_u64(key, value, &mut self.auto_cleanup.idle_minutes),
                "check_interval_seconds" => {
                    apply_u64(key, value, &mut self.auto_cleanup.check_interval_seconds);
                }
                "duplicate_threshold" => {
                    apply_f32(key, value, &mut self.auto_cleanup.duplicate_threshold);
                }
                "min_similarity_to_report" => {
                    apply_f32(key, value, &mut self.auto_cleanup.min_similarity_to_report);
                }
                "max_suggestions_per_run" => {
                    apply_usize(key, value, &mut self.auto_cleanup.max_suggestions_per_run);
                }
                other => debug!(key = other, "ignoring unrecognised auto_cleanup key"),
            }
        }
    }

    /// Reject configurations the service cannot start with.
    pub fn validate(&self) -> Result<()> {
        if chrono_tz::Tz::from_str(&self.timezone).is_err() {
            bail!("'{}' is not a valid IANA timezone", self.timezone);
        }
        if self.data_dir.trim().is_empty() {
            bail!("data_dir must not be empty");
        }
        if self.reranker_top_n == 0 {
            bail!("reranker_top_n must be at least 1");
        }
        if self.vector_rebuild.idle_seconds == 0 {
            bail!("vector_rebuild.idle_seconds must be at least 1");
        }
        for (name, v) in [
            (
                "auto_cleanup.duplicate_threshold",
                self.auto_cleanup.duplicate_threshold,
            ),
            (
                "auto_cleanup.min_similarity_to_report",
                self.auto_cleanup.min_similarity_to_report,
            ),
        ] {
            if !(0.0..=1.0).contains(&v) {
                bail!("{name} must be within [0.0, 1.0], got {v}");
            }
        }
        Ok(())
    }

    /// Parsed timezone. Falls back to UTC for values that slipped past
    /// validation (e.g. a hot-reloaded file edit).
    pub fn tz(&self) -> chrono_tz::Tz {
        chrono_tz::Tz::from_str(&self.timezone).unwrap_or(chrono_tz::Tz::UTC)
    }

    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(&self.data_dir)
    }
}

fn set_parsed<T: FromStr>(key: &str, value: &str, slot: &mut T) {
    match value.parse() {
        Ok(parsed) => *slot = parsed,
        Err(_) => {
            warn!(key, value, "unparseable environment override; keeping previous value");
        }
    }
}

fn apply_string(key: &str, value: &Value, slot: &mut String) {
    if let Some(raw) = value.as_str() {
        *slot = raw.to_string();
    } else {
        warn!(key, "expected a string; keeping previous value");
    }
}

fn apply_u64(key: &str, value: &Value, slot: &mut u64) {
    if let Some(raw) = value.as_u64() {
        *slot = raw;
    } else {
        warn!(key, "expected an unsigned integer; keeping previous value");
    }
}

fn apply_usize(key: &str, value: &Value, slot: &mut usize) {
    if let Some(raw) = value.as_u64() {
        *slot = raw as usize;
    } else {
        warn!(key, "expected an unsigned integer; keeping previous value");
    }
}

fn apply_f32(key: &str, value: &Value, slot: &mut f32) {
    if let Some(raw) = value.as_f64() {
        *slot = raw as f32;
    } else {
        warn!(key, "expected a number; keeping previous value");
    }
}

// ── Hot reload ────────────────────────────────────────────────────────────────

struct WatchState {
    mtime: Option<SystemTime>,
    current: Arc<AppConfig>,
}

/// Shared handle to the live configuration.
///
/// [`ConfigHandle::current`] re-checks the file's mtime and reloads on
/// change, so every reader sees fresh values without a restart. Resources
/// bound at startup (listen sockets, open log files, store handles) are
/// intentionally *not* re-opened on reload.
pub struct ConfigHandle {
    path: Option<PathBuf>,
    state: RwLock<WatchState>,
}

impl ConfigHandle {
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config = AppConfig::load(path.as_deref())?;
        config.validate()?;
        let mtime = path.as_deref().and_then(file_mtime);
        Ok(Self {
            path,
            state: RwLock::new(WatchState {
                mtime,
                current: Arc::new(config),
            }),
        })
    }

    /// In-memory handle for tests and embedded use; never reloads.
    pub fn fixed(config: AppConfig) -> Self {
        Self {
            path: None,
            state: RwLock::new(WatchState {
                mtime: None,
                current: Arc::new(config),
            }),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Current configuration snapshot, reloading the file first if its
    /// mtime moved. A file that fails to parse or validate is skipped with
    /// a warning and the previous snapshot stays live.
    pub fn current(&self) -> Arc<AppConfig> {
        self.reload_if_changed();
        self.state
            .read()
            .expect("config lock poisoned")
            .current
            .clone()
    }

    fn reload_if_changed(&self) {
        let Some(path) = self.path.as_deref() else {
            return;
        };
        let mtime = file_mtime(path);
        {
            let state = self.state.read().expect("config lock poisoned");
            if state.mtime == mtime {
                return;
            }
        }

        match AppConfig::load(Some(path)).and_then(|c| c.validate().map(|()| c)) {
            Ok(config) => {
                let mut state = self.state.write().expect("config lock poisoned");
                state.mtime = mtime;
                state.current = Arc::new(config);
                debug!(path = %path.display(), "configuration reloaded");
            }
            Err(err) => {
                warn!(%err, path = %path.display(), "config reload failed; keeping previous configuration");
                let mut state = self.state.write().expect("config lock poisoned");
                state.mtime = mtime;
            }
        }
    }
}

fn file_mtime(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

// ── Tests ─────────────────────────────────────────────────────────────────────

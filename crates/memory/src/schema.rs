use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const DEFAULT_IMPORTANCE: f32 = 0.5;
pub const DEFAULT_EMOTION: &str = "neutral";
pub const DEFAULT_PHYSICAL_STATE: &str = "normal";
pub const DEFAULT_MENTAL_STATE: &str = "calm";
pub const DEFAULT_ENVIRONMENT: &str = "unknown";
pub const DEFAULT_RELATIONSHIP_STATUS: &str = "normal";

/// A single recorded observation, owned by exactly one persona.
///
/// `key` is assigned at creation and never changes. `created_at` is
/// immutable; every content or metadata change refreshes `updated_at`.
/// The serde defaults let rows written by older builds deserialize with the
/// documented field defaults instead of failing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Memory {
    pub key: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default = "default_importance")]
    pub importance: f32,
    #[serde(default = "default_emotion")]
    pub emotion: String,
    #[serde(default = "default_physical_state")]
    pub physical_state: String,
    #[serde(default = "default_mental_state")]
    pub mental_state: String,
    #[serde(default = "default_environment")]
    pub environment: String,
    #[serde(default = "default_relationship_status")]
    pub relationship_status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_tag: Option<String>,
}

fn default_importance() -> f32 {
    DEFAULT_IMPORTANCE
}
fn default_emotion() -> String {
    DEFAULT_EMOTION.to_string()
}
fn default_physical_state() -> String {
    DEFAULT_PHYSICAL_STATE.to_string()
}
fn default_mental_state() -> String {
    DEFAULT_MENTAL_STATE.to_string()
}
fn default_environment() -> String {
    DEFAULT_ENVIRONMENT.to_string()
}
fn default_relationship_status() -> String {
    DEFAULT_RELATIONSHIP_STATUS.to_string()
}

impl Memory {
    /// Fresh memory with the documented defaults, `created_at == updated_at`.
    pub fn new(key: impl Into<String>, content: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            key: key.into(),
            content: content.into(),
            created_at: now,
            updated_at: now,
            tags: BTreeSet::new(),
            importance: DEFAULT_IMPORTANCE,
            emotion: DEFAULT_EMOTION.to_string(),
            physical_state: DEFAULT_PHYSICAL_STATE.to_string(),
            mental_state: DEFAULT_MENTAL_STATE.to_string(),
            environment: DEFAULT_ENVIRONMENT.to_string(),
            relationship_status: DEFAULT_RELATIONSHIP_STATUS.to_string(),
            action_tag: None,
        }
    }
}

/// Clamp importance into `[0.0, 1.0]`; non-finite input falls back to the
/// default rather than poisoning score arithmetic.
pub fn clamp_importance(raw: f32) -> f32 {
    if raw.is_finite() {
        raw.clamp(0.0, 1.0)
    } else {
        DEFAULT_IMPORTANCE
    }
}

/// Trim, drop empties, and collapse duplicate tags.
pub fn collapse_tags<I, S>(tags: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    tags.into_iter()
        .map(|t| t.as_ref().trim().to_string())
        .filter(|t| !t.is_empty())
        .collect()
}

/// Char-safe prefix with an ellipsis marker when content was cut.
pub fn truncate_str(raw: &str, max_chars: usize) -> String {
    if raw.chars().count() <= max_chars {
        return raw.to_string();
    }
    let mut out: String = raw.chars().take(max_chars).collect();
    out.push('…');
    out
}

// ── Audit trail ───────────────────────────────────────────────────────────────

/// One entry in the append-only operation log; exactly one is written per
/// attempted mutating call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationRecord {
    pub timestamp: DateTime<Utc>,
    pub op_id: Uuid,
    pub persona: String,
    pub op: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<Memory>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<Memory>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

// ── Duplicate suggestions ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CleanupPriority {
    High,
    Medium,
    Low,
}

impl CleanupPriority {
    pub fn from_score(score: f32) -> Self {
        if score >= 0.95 {
            Self::High
        } else if score >= 0.90 {
            Self::Medium
        } else {
            Self::Low
        }
    }
}

/// A group of memory keys judged near-duplicates. Advisory only — the
/// duplicate worker never deletes or merges.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupSuggestion {
    pub keys: Vec<String>,
    /// Minimum pairwise similarity across the group.
    pub score: f32,
    pub priority: CleanupPriority,
}

/// Durable output of one duplicate-detector run for one persona.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupReport {
    pub persona: String,
    pub generated_at: DateTime<Utc>,
    pub suggestions: Vec<CleanupSuggestion>,
}

/// Compact projection of a memory for stats and session-context output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryPreview {
    pub key: String,
    pub preview: String,
    pub created_at: DateTime<Utc>,
    pub importance: f32,
    pub emotion: String,
}

impl MemoryPreview {
    pub fn from_memory(memory: &Memory, preview_chars: usize) -> Self {
        Self {
            key: memory.key.clone(),
            preview: truncate_str(&memory.content, preview_chars),
            created_at: memory.created_at,
            importance: memory.importance,
            emotion: memory.emotion.clone(),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

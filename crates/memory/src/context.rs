//! Per-persona mutable state, held in a human-readable JSON file.
//!
//! Reads are frequent and lock-free; writes go through the persona mutex
//! in the engine. Merge semantics are deliberately per-field (scalars
//! overwrite, favourites de-dup append, promises/goals append,
//! anniversaries upsert by name, equipment merges key-wise) — callers
//! depend on these differences, so they are not generalised. Unknown keys
//! found in the stored file round-trip untouched.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{MemoryError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimedNote {
    pub at: DateTime<Utc>,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anniversary {
    pub name: String,
    /// Free-form date string (`"2020-03-14"`, `"03-14"`, …); the service
    /// stores what the caller said rather than normalising it.
    pub date: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmotionFlowEntry {
    pub at: DateTime<Utc>,
    pub emotion: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensationEntry {
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub physical_state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mental_state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersonaContext {
    pub user_name: Option<String>,
    pub persona_name: Option<String>,
    pub current_emotion: Option<String>,
    pub physical_state: Option<String>,
    pub mental_state: Option<String>,
    pub environment: Option<String>,
    pub relationship_status: Option<String>,
    pub last_conversation_time: Option<DateTime<Utc>>,
    pub equipment: BTreeMap<String, String>,
    pub favourites: Vec<String>,
    pub promises: Vec<TimedNote>,
    pub goals: Vec<TimedNote>,
    pub anniversaries: Vec<Anniversary>,
    pub emotion_flow: Vec<EmotionFlowEntry>,
    pub sensations: Vec<SensationEntry>,
    /// Fields written by other (possibly newer) builds. Never dropped.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Scalar state fields a caller may overwrite in one call — either via the
/// dedicated `update_context` operation or piggybacked on `create`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextUpdate {
    pub user_name: Option<String>,
    pub persona_name: Option<String>,
    pub emotion: Option<String>,
    pub physical_state: Option<String>,
    pub mental_state: Option<String>,
    pub environment: Option<String>,
    pub relationship_status: Option<String>,
    pub last_conversation_time: Option<DateTime<Utc>>,
}

impl ContextUpdate {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

impl PersonaContext {
    /// Overwrite the scalar fields present in `update`; absent fields keep
    /// their value.
    pub fn apply(&mut self, update: &ContextUpdate) {
        if let Some(v) = &update.user_name {
            self.user_name = Some(v.clone());
        }
        if let Some(v) = &update.persona_name {
            self.persona_name = Some(v.clone());
        }
        if let Some(v) = &update.emotion {
            self.current_emotion = Some(v.clone());
        }
        if let Some(v) = &update.physical_state {
            self.physical_state = Some(v.clone());
        }
        if let Some(v) = &update.mental_state {
            self.mental_state = Some(v.clone());
        }
        if let Some(v) = &update.environment {
            self.environment = Some(v.clone());
        }
        if let Some(v) = &update.relationship_status {
            self.relationship_status = Some(v.clone());
        }
        if let Some(v) = update.last_conversation_time {
            self.last_conversation_time = Some(v);
        }
    }

    /// De-duplicated append; comparison is case-insensitive.
    pub fn add_favourite(&mut self, item: &str) -> bool {
        let item = item.trim();
        if item.is_empty() {
            return false;
        }
        let exists = self
            .favourites
            .iter()
            .any(|f| f.eq_ignore_ascii_case(item));
        if exists {
            return false;
        }
        self.favourites.push(item.to_string());
        true
    }

    pub fn add_promise(&mut self, text: &str, at: DateTime<Utc>) {
        self.promises.push(TimedNote {
            at,
            text: text.to_string(),
        });
    }

    pub fn add_goal(&mut self, text: &str, at: DateTime<Utc>) {
        self.goals.push(TimedNote {
            at,
            text: text.to_string(),
        });
    }

    /// Upsert by name: a second anniversary with the same name replaces the
    /// first instead of accumulating.
    pub fn add_anniversary(&mut self, name: &str, date: &str, note: Option<&str>) {
        let entry = Anniversary {
            name: name.to_string(),
            date: date.to_string(),
            note: note.map(str::to_string),
        };
        if let Some(existing) = self.anniversaries.iter_mut().find(|a| a.name == name) {
            *existing = entry;
        } else {
            self.anniversaries.push(entry);
        }
    }

    /// Append to the emotion timeline and move the current emotion.
    pub fn record_emotion_flow(&mut self, emotion: &str, trigger: Option<&str>, at: DateTime<Utc>) {
        self.current_emotion = Some(emotion.to_string());
        self.emotion_flow.push(EmotionFlowEntry {
            at,
            emotion: emotion.to_string(),
            trigger: trigger.map(str::to_string),
        });
    }

    /// Append to the sensation timeline and overwrite the current state
    /// scalars that were supplied.
    pub fn record_sensation(
        &mut self,
        physical_state: Option<&str>,
        mental_state: Option<&str>,
        note: Option<&str>,
        at: DateTime<Utc>,
    ) {
        if let Some(v) = physical_state {
            self.physical_state = Some(v.to_string());
        }
        if let Some(v) = mental_state {
            self.mental_state = Some(v.to_string());
        }
        self.sensations.push(SensationEntry {
            at,
            physical_state: physical_state.map(str::to_string),
            mental_state: mental_state.map(str::to_string),
            note: note.map(str::to_string),
        });
    }

    /// Key-wise merge; existing keys are overwritten, others untouched.
    pub fn merge_equipment(&mut self, items: &BTreeMap<String, String>) {
        for (k, v) in items {
            self.equipment.insert(k.clone(), v.clone());
        }
    }
}

// ── File-backed store ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ContextStore {
    path: PathBuf,
}

impl ContextStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Missing file reads as the default context.
    pub fn load(&self) -> Result<PersonaContext> {
        if !self.path.exists() {
            return Ok(PersonaContext::default());
        }
        let raw = std::fs::read_to_string(&self.path)?;
        serde_json::from_str(&raw)
            .map_err(|err| MemoryError::DataStore(format!("bad persona context file: {err}")))
    }

    /// Atomic replace: write a `.tmp` sibling, then rename over the
    /// original. A crash mid-write leaves the previous file intact.
    pub fn save(&self, context: &PersonaContext) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp_path = {
            let filename = self
                .path
                .file_name()
                .map(|f| f.to_string_lossy().to_string())
                .unwrap_or_else(|| "persona_context".to_string());
            self.path.with_file_name(format!("{filename}.tmp"))
        };

        let rendered = serde_json::to_string_pretty(context)?;
        if let Err(err) = std::fs::write(&tmp_path, rendered) {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(err.into());
        }
        if let Err(err) = std::fs::rename(&tmp_path, &self.path) {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(err.into());
        }
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

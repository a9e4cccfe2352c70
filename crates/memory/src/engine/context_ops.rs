//! Context-oriented operations: everything that mutates the persona
//! context without touching the memory tables. Same persona-mutex
//! discipline and audit trail as the memory operations.

use std::collections::BTreeMap;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::context::{ContextUpdate, PersonaContext};
use crate::error::{MemoryError, Result};
use crate::schema::MemoryPreview;

use super::{MemoryEngine, PREVIEW_CHARS};

/// Read-only snapshot handed to the RPC layer at conversation start.
#[derive(Debug, Clone, Serialize)]
pub struct SessionContext {
    pub persona: String,
    pub context: PersonaContext,
    pub recent: Vec<MemoryPreview>,
}

impl MemoryEngine {
    /// Overwrite the supplied scalar context fields.
    pub async fn update_context(
        &self,
        persona: &str,
        update: ContextUpdate,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.context_op(persona, "update_context", cancel, move |context| {
            if update.is_empty() {
                return Err(MemoryError::Validation("context update carries no fields".into()));
            }
            context.apply(&update);
            Ok(())
        })
        .await
    }

    pub async fn set_promise(
        &self,
        persona: &str,
        text: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let text = text.to_string();
        let now = chrono::Utc::now();
        self.context_op(persona, "set_promise", cancel, move |context| {
            let text = require_text(&text, "promise")?;
            context.add_promise(&text, now);
            Ok(())
        })
        .await
    }

    pub async fn set_goal(
        &self,
        persona: &str,
        text: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let text = text.to_string();
        let now = chrono::Utc::now();
        self.context_op(persona, "set_goal", cancel, move |context| {
            let text = require_text(&text, "goal")?;
            context.add_goal(&text, now);
            Ok(())
        })
        .await
    }

    /// Returns `false` when the favourite was already present.
    pub async fn add_favourite(
        &self,
        persona: &str,
        item: &str,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let item = item.to_string();
        self.context_op(persona, "add_favourite", cancel, move |context| {
            let item = require_text(&item, "favourite")?;
            Ok(context.add_favourite(&item))
        })
        .await
    }

    pub async fn add_anniversary(
        &self,
        persona: &str,
        name: &str,
        date: &str,
        note: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let name = name.to_string();
        let date = date.to_string();
        let note = note.map(str::to_string);
        self.context_op(persona, "add_anniversary", cancel, move |context| {
            let name = require_text(&name, "anniversary name")?;
            let date = require_text(&date, "anniversary date")?;
            context.add_anniversary(&name, &date, note.as_deref());
            Ok(())
        })
        .await
    }

    pub async fn record_sensation(
        &self,
        persona: &str,
        physical_state: Option<&str>,
        mental_state: Option<&str>,
        note: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let physical = physical_state.map(str::to_string);
        let mental = mental_state.map(str::to_string);
        let note = note.map(str::to_string);
        let now = chrono::Utc::now();
        self.context_op(persona, "record_sensation", cancel, move |context| {
            if physical.is_none() && mental.is_none() {
                return Err(MemoryError::Validation(
                    "a sensation needs a physical or mental state".into(),
                ));
            }
            context.record_sensation(physical.as_deref(), mental.as_deref(), note.as_deref(), now);
            Ok(())
        })
        .await
    }

    /// Key-wise merge into the equipment map: supplied keys overwrite,
    /// everything else is left alone.
    pub async fn update_equipment(
        &self,
        persona: &str,
        items: BTreeMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.context_op(persona, "update_equipment", cancel, move |context| {
            if items.is_empty() {
                return Err(MemoryError::Validation("equipment update carries no items".into()));
            }
            context.merge_equipment(&items);
            Ok(())
        })
        .await
    }

    pub async fn record_emotion_flow(
        &self,
        persona: &str,
        emotion: &str,
        trigger: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let emotion = emotion.to_string();
        let trigger = trigger.map(str::to_string);
        let now = chrono::Utc::now();
        self.context_op(persona, "record_emotion_flow", cancel, move |context| {
            let emotion = require_text(&emotion, "emotion")?;
            context.record_emotion_flow(&emotion, trigger.as_deref(), now);
            Ok(())
        })
        .await
    }

    /// Read-only: the persona context plus recent memory previews. Not a
    /// mutation, so no operation record.
    pub async fn get_session_context(&self, persona: &str) -> Result<SessionContext> {
        let handle = self.registry().handle(persona)?;
        let config = self.config().current();
        let context = handle.context.load()?;
        let recent = handle
            .store
            .list(0, config.stats_recent_count as u64)
            .await?
            .iter()
            .map(|m| MemoryPreview::from_memory(m, PREVIEW_CHARS))
            .collect();
        Ok(SessionContext {
            persona: handle.name.clone(),
            context,
            recent,
        })
    }

    /// Shared body for the context mutators: persona mutex, load, mutate
    /// (which also validates), atomic save, exactly one op record either
    /// way.
    async fn context_op<F, T>(
        &self,
        persona: &str,
        op: &str,
        cancel: &CancellationToken,
        mutate: F,
    ) -> Result<T>
    where
        F: FnOnce(&mut PersonaContext) -> Result<T>,
    {
        let result: Result<T> = async {
            if cancel.is_cancelled() {
                return Err(MemoryError::Cancelled);
            }
            let handle = self.registry().handle(persona)?;
            let _guard = handle.write_lock.lock().await;
            let mut context = handle.context.load()?;
            let value = mutate(&mut context)?;
            handle.context.save(&context)?;
            debug!(persona = %handle.name, op, "persona context updated");
            Ok(value)
        }
        .await;

        self.record_op(persona, op, None, None, None, &result).await?;
        result
    }
}

fn require_text(raw: &str, what: &str) -> Result<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(MemoryError::Validation(format!("{what} must not be empty")));
    }
    Ok(trimmed.to_string())
}

//! Background maintenance: idle vector rebuild and duplicate detection.
//!
//! Both workers are plain `tokio::spawn` loops that sleep, wake, consult
//! the live config, and select on a shared shutdown channel. They talk to
//! request handlers only through the per-persona atomic timestamps and
//! mutexes — no queues.
//!
//! Per-persona state machine: `Clean → Dirty` on any write,
//! `Dirty → Rebuilding` when the idle condition holds and the rebuild
//! mutex is taken, `Rebuilding → Clean` on success, `Rebuilding → Dirty`
//! when the rebuild fails or a write lands mid-rebuild (the dirty flag is
//! cleared before draining, so such a write simply re-sets it).

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use memcp_config::RebuildMode;

use crate::dedup::{self, ScanItem};
use crate::embed::normalized;
use crate::engine::MemoryEngine;
use crate::error::{MemoryError, Result};
use crate::registry::PersonaHandle;
use crate::schema::CleanupReport;
use crate::vector::{VectorIndex, VectorPoint};

/// Memories drained from the store per rebuild batch.
const REBUILD_BATCH: u64 = 256;

/// Floor between two duplicate scans of the same persona.
const DUPLICATE_SCAN_MIN_INTERVAL_SECS: i64 = 5 * 60;

/// Spawn the rebuild worker and the duplicate detector. Both exit when
/// `shutdown` flips to `true`.
pub fn spawn_workers(
    engine: Arc<MemoryEngine>,
    shutdown: &watch::Sender<bool>,
) -> Vec<JoinHandle<()>> {
    vec![
        spawn_rebuild_worker(Arc::clone(&engine), shutdown),
        spawn_duplicate_worker(engine, shutdown),
    ]
}

fn spawn_rebuild_worker(
    engine: Arc<MemoryEngine>,
    shutdown: &watch::Sender<bool>,
) -> JoinHandle<()> {
    let mut rx = shutdown.subscribe();
    tokio::spawn(async move {
        loop {
            let config = engine.config().current();
            let poll = Duration::from_secs(config.vector_rebuild.idle_seconds.max(1));
            tokio::select! {
                _ = tokio::time::sleep(poll) => {}
                changed = rx.changed() => {
                    if changed.is_err() || *rx.borrow() {
                        break;
                    }
                    continue;
                }
            }

            let config = engine.config().current();
            if config.vector_rebuild.mode != RebuildMode::Idle {
                continue;
            }
            let idle = config.vector_rebuild.idle_seconds as i64;
            let min_interval = config.vector_rebuild.min_interval as i64;
            let now = Utc::now().timestamp();

            for handle in engine.registry().live() {
                if !handle.is_dirty() {
                    continue;
                }
                let last_write = handle.last_write_secs();
                if last_write == 0 || now - last_write < idle {
                    continue;
                }
                if now - handle.last_rebuild_secs() < min_interval {
                    continue;
                }

                match rebuild_persona(&engine, &handle).await {
                    Ok(indexed) => {
                        info!(persona = %handle.name, indexed, "idle vector rebuild complete");
                    }
                    Err(err) => {
                        // dirty stays set; the next cycle retries.
                        warn!(%err, persona = %handle.name, "idle vector rebuild failed");
                    }
                }
            }
        }
        debug!("rebuild worker stopped");
    })
}

/// Drain the relational store, re-embed everything, and swap the persona
/// collection wholesale. Holds the rebuild mutex for the duration.
pub(crate) async fn rebuild_persona(
    engine: &MemoryEngine,
    handle: &PersonaHandle,
) -> Result<usize> {
    let Some(embedder) = engine.embedder() else {
        debug!(persona = %handle.name, "no embedder; skipping rebuild");
        return Ok(0);
    };
    let embedder = Arc::clone(embedder);

    let _rebuild_guard = handle.rebuild_lock.lock().await;
    // Clear before draining: a write that lands during the rebuild re-sets
    // the flag, which is exactly the Rebuilding → Dirty transition.
    handle.clear_dirty();

    let result: Result<usize> = async {
        let mut points = Vec::new();
        let mut offset = 0u64;
        loop {
            let batch = handle.store.list(offset, REBUILD_BATCH).await?;
            if batch.is_empty() {
                break;
            }
            offset += batch.len() as u64;

            let contents: Vec<String> = batch.iter().map(|m| m.content.clone()).collect();
            let vectors = embedder.embed(&contents).await?;
            if vectors.len() != batch.len() {
                return Err(MemoryError::Model(format!(
                    "embedder returned {} vectors for {} texts",
                    vectors.len(),
                    batch.len()
                )));
            }
            for (memory, vector) in batch.into_iter().zip(vectors) {
                points.push(VectorPoint {
                    key: memory.key.clone(),
                    vector: normalized(vector),
                    payload: memory,
                });
            }
        }

        let indexed = points.len();
        engine
            .vector()
            .ensure_collection(&handle.collection, embedder.dimension())
            .await?;
        engine.vector().rebuild(&handle.collection, points).await?;
        Ok(indexed)
    }
    .await;

    match result {
        Ok(indexed) => {
            handle.note_rebuild();
            Ok(indexed)
        }
        Err(err) => {
            handle.mark_dirty();
            Err(err)
        }
    }
}

fn spawn_duplicate_worker(
    engine: Arc<MemoryEngine>,
    shutdown: &watch::Sender<bool>,
) -> JoinHandle<()> {
    let mut rx = shutdown.subscribe();
    tokio::spawn(async move {
        loop {
            let config = engine.config().current();
            let poll = Duration::from_secs(config.auto_cleanup.check_interval_seconds.max(1));
            tokio::select! {
                _ = tokio::time::sleep(poll) => {}
                changed = rx.changed() => {
                    if changed.is_err() || *rx.borrow() {
                        break;
                    }
                    continue;
                }
            }

            let config = engine.config().current();
            if !config.auto_cleanup.enabled {
                continue;
            }
            let idle_secs = (config.auto_cleanup.idle_minutes * 60) as i64;
            let now = Utc::now().timestamp();

            for handle in engine.registry().live() {
                let last_write = handle.last_write_secs();
                if last_write == 0 || now - last_write < idle_secs {
                    continue;
                }
                if now - handle.last_duplicate_scan_secs() < DUPLICATE_SCAN_MIN_INTERVAL_SECS {
                    continue;
                }

                match run_duplicate_scan(&engine, &handle).await {
                    Ok(suggestions) if suggestions > 0 => {
                        info!(persona = %handle.name, suggestions, "duplicate scan wrote cleanup suggestions");
                    }
                    Ok(_) => {
                        debug!(persona = %handle.name, "duplicate scan found nothing to report");
                    }
                    Err(err) => {
                        warn!(%err, persona = %handle.name, "duplicate scan failed");
                    }
                }
            }
        }
        debug!("duplicate worker stopped");
    })
}

/// One duplicate pass for one persona. Advisory only: the output is a
/// suggestions file, never a deletion.
pub(crate) async fn run_duplicate_scan(
    engine: &MemoryEngine,
    handle: &PersonaHandle,
) -> Result<usize> {
    let config = engine.config().current();
    let memories = handle.store.all().await?;

    let exported: std::collections::HashMap<String, Vec<f32>> = engine
        .vector()
        .export(&handle.collection)
        .await
        .unwrap_or_default()
        .into_iter()
        .collect();

    let items: Vec<ScanItem> = memories
        .iter()
        .map(|memory| ScanItem {
            key: memory.key.clone(),
            content_hash: dedup::content_fingerprint(&memory.content),
            vector: exported.get(&memory.key).cloned(),
        })
        .collect();

    let suggestions = dedup::find_duplicate_clusters(
        &items,
        config.auto_cleanup.duplicate_threshold,
        config.auto_cleanup.min_similarity_to_report,
        config.auto_cleanup.max_suggestions_per_run,
    );

    let report = CleanupReport {
        persona: handle.name.clone(),
        generated_at: Utc::now(),
        suggestions,
    };
    let rendered = serde_json::to_string_pretty(&report)?;
    std::fs::write(handle.suggestions_path(), rendered)?;

    handle.note_duplicate_scan();
    Ok(report.suggestions.len())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

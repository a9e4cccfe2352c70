//! Per-persona durable memory store on SQLite — the source of truth.
//!
//! The vector index (C3) is derived state and can always be rebuilt from
//! this store. Writes are serialised by the engine through the persona
//! mutex; concurrent readers see post-commit state thanks to WAL mode.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use tokio::sync::Mutex;
use tracing::info;

use crate::error::{MemoryError, Result};
use crate::schema::Memory;

/// Canonical column list. On open, any column missing from an existing
/// database is added in place with its documented default; the backfill
/// statement patches legacy NULLs so non-null-default fields never read
/// back as null. Both steps are idempotent and run on every startup.
const CANONICAL_COLUMNS: &[(&str, &str, Option<&str>)] = &[
    ("tags", "tags TEXT NOT NULL DEFAULT '[]'", Some("UPDATE memories SET tags = '[]' WHERE tags IS NULL")),
    ("importance", "importance REAL NOT NULL DEFAULT 0.5", Some("UPDATE memories SET importance = 0.5 WHERE importance IS NULL")),
    ("emotion", "emotion TEXT NOT NULL DEFAULT 'neutral'", Some("UPDATE memories SET emotion = 'neutral' WHERE emotion IS NULL")),
    ("physical_state", "physical_state TEXT NOT NULL DEFAULT 'normal'", Some("UPDATE memories SET physical_state = 'normal' WHERE physical_state IS NULL")),
    ("mental_state", "mental_state TEXT NOT NULL DEFAULT 'calm'", Some("UPDATE memories SET mental_state = 'calm' WHERE mental_state IS NULL")),
    ("environment", "environment TEXT NOT NULL DEFAULT 'unknown'", Some("UPDATE memories SET environment = 'unknown' WHERE environment IS NULL")),
    ("relationship_status", "relationship_status TEXT NOT NULL DEFAULT 'normal'", Some("UPDATE memories SET relationship_status = 'normal' WHERE relationship_status IS NULL")),
    ("action_tag", "action_tag TEXT", None),
];

/// Aggregate view over one persona's memories.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct StoreStats {
    pub count: u64,
    pub total_chars: u64,
    pub earliest: Option<DateTime<Utc>>,
    pub latest: Option<DateTime<Utc>>,
    pub tag_histogram: BTreeMap<String, u64>,
    pub emotion_histogram: BTreeMap<String, u64>,
    pub importance_buckets: ImportanceBuckets,
}

/// Importance split into thirds of the unit interval.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct ImportanceBuckets {
    pub low: u64,
    pub medium: u64,
    pub high: u64,
}

#[derive(Clone)]
pub struct RelationalStore {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl RelationalStore {
    /// Open (or create) the persona database and bring its schema up to
    /// date.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(&path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS memories (
                key TEXT PRIMARY KEY,
                content TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                tags TEXT NOT NULL DEFAULT '[]',
                importance REAL NOT NULL DEFAULT 0.5,
                emotion TEXT NOT NULL DEFAULT 'neutral',
                physical_state TEXT NOT NULL DEFAULT 'normal',
                mental_state TEXT NOT NULL DEFAULT 'calm',
                environment TEXT NOT NULL DEFAULT 'unknown',
                relationship_status TEXT NOT NULL DEFAULT 'normal',
                action_tag TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_memories_created ON memories(created_at DESC);
            "#,
        )?;
        migrate_schema(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Insert or replace by key.
    pub async fn put(&self, memory: &Memory) -> Result<()> {
        let conn = self.conn.lock().await;
        let tags_json = serde_json::to_string(&memory.tags)?;
        conn.execute(
            r#"INSERT OR REPLACE INTO memories
               (key, content, created_at, updated_at, tags, importance, emotion,
                physical_state, mental_state, environment, relationship_status, action_tag)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"#,
            params![
                memory.key,
                memory.content,
                encode_instant(memory.created_at),
                encode_instant(memory.updated_at),
                tags_json,
                memory.importance as f64,
                memory.emotion,
                memory.physical_state,
                memory.mental_state,
                memory.environment,
                memory.relationship_status,
                memory.action_tag,
            ],
        )?;
        Ok(())
    }

    pub async fn get(&self, key: &str) -> Result<Option<Memory>> {
        let conn = self.conn.lock().await;
        let raw = conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM memories WHERE key = ?1"),
                params![key],
                RawRow::from_row,
            )
            .optional()?;
        raw.map(RawRow::into_memory).transpose()
    }

    /// Remove by key; `false` when the key did not exist.
    pub async fn delete(&self, key: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        let affected = conn.execute("DELETE FROM memories WHERE key = ?1", params![key])?;
        Ok(affected > 0)
    }

    /// One page of memories, newest first.
    pub async fn list(&self, offset: u64, limit: u64) -> Result<Vec<Memory>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {COLUMNS} FROM memories ORDER BY created_at DESC, key DESC LIMIT ?1 OFFSET ?2"
        ))?;
        let rows = stmt
            .query_map(params![limit as i64, offset as i64], RawRow::from_row)?
            .collect::<std::result::Result<Vec<_>, rusqlite::Error>>()?;
        drop(stmt);
        drop(conn);
        rows.into_iter().map(RawRow::into_memory).collect()
    }

    /// Drain every memory, newest first, paging internally.
    pub async fn all(&self) -> Result<Vec<Memory>> {
        const PAGE: u64 = 512;
        let mut out = Vec::new();
        let mut offset = 0;
        loop {
            let page = self.list(offset, PAGE).await?;
            let fetched = page.len() as u64;
            out.extend(page);
            if fetched < PAGE {
                return Ok(out);
            }
            offset += fetched;
        }
    }

    pub async fn count(&self) -> Result<u64> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM memories", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    pub async fn stats(&self) -> Result<StoreStats> {
        let conn = self.conn.lock().await;

        let (count, total_chars, earliest, latest) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(LENGTH(content)), 0), MIN(created_at), MAX(created_at) FROM memories",
            [],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                ))
            },
        )?;

        let mut stats = StoreStats {
            count: count as u64,
            total_chars: total_chars as u64,
            earliest: earliest.as_deref().map(decode_instant).transpose()?,
            latest: latest.as_deref().map(decode_instant).transpose()?,
            ..StoreStats::default()
        };

        let mut stmt = conn.prepare_cached("SELECT tags, emotion, importance FROM memories")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, f64>(2)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, rusqlite::Error>>()?;

        for (tags_json, emotion, importance) in rows {
            let tags: Vec<String> = serde_json::from_str(&tags_json).unwrap_or_default();
            for tag in tags {
                *stats.tag_histogram.entry(tag).or_default() += 1;
            }
            *stats.emotion_histogram.entry(emotion).or_default() += 1;
            if importance < 1.0 / 3.0 {
                stats.importance_buckets.low += 1;
            } else if importance < 2.0 / 3.0 {
                stats.importance_buckets.medium += 1;
            } else {
                stats.importance_buckets.high += 1;
            }
        }

        Ok(stats)
    }
}

const COLUMNS: &str = "key, content, created_at, updated_at, tags, importance, emotion, \
                       physical_state, mental_state, environment, relationship_status, action_tag";

fn migrate_schema(conn: &Connection) -> Result<()> {
    let mut stmt = conn.prepare("PRAGMA table_info(memories)")?;
    let existing: HashSet<String> = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<std::result::Result<_, rusqlite::Error>>()?;
    drop(stmt);

    for (name, ddl, _) in CANONICAL_COLUMNS {
        if existing.contains(*name) {
            continue;
        }
        conn.execute_batch(&format!("ALTER TABLE memories ADD COLUMN {ddl};"))?;
        info!(column = name, "added missing memories column");
    }

    // Legacy rows may hold NULL in columns that predate the defaults.
    for (_, _, backfill) in CANONICAL_COLUMNS {
        if let Some(sql) = backfill {
            conn.execute(sql, [])?;
        }
    }

    Ok(())
}

fn encode_instant(at: DateTime<Utc>) -> String {
    // Fixed-width rendering keeps lexicographic and chronological order
    // identical, which `ORDER BY created_at` relies on.
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn decode_instant(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| MemoryError::DataStore(format!("bad timestamp '{raw}': {err}")))
}

/// Column-typed row image; timestamp/tag parsing happens outside the
/// rusqlite closure so errors surface as [`MemoryError::DataStore`].
struct RawRow {
    key: String,
    content: String,
    created_at: String,
    updated_at: String,
    tags: String,
    importance: f64,
    emotion: String,
    physical_state: String,
    mental_state: String,
    environment: String,
    relationship_status: String,
    action_tag: Option<String>,
}

impl RawRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            key: row.get(0)?,
            content: row.get(1)?,
            created_at: row.get(2)?,
            updated_at: row.get(3)?,
            tags: row.get(4)?,
            importance: row.get(5)?,
            emotion: row.get(6)?,
            physical_state: row.get(7)?,
            mental_state: row.get(8)?,
            environment: row.get(9)?,
            relationship_status: row.get(10)?,
            action_tag: row.get(11)?,
        })
    }

    fn into_memory(self) -> Result<Memory> {
        Ok(Memory {
            key: self.key,
            content: self.content,
            created_at: decode_instant(&self.created_at)?,
            updated_at: decode_instant(&self.updated_at)?,
            tags: serde_json::from_str(&self.tags)
                .map_err(|err| MemoryError::DataStore(format!("bad tags column: {err}")))?,
            importance: self.importance as f32,
            emotion: self.emotion,
            physical_state: self.physical_state,
            mental_state: self.mental_state,
            environment: self.environment,
            relationship_status: self.relationship_status,
            action_tag: self.action_tag,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use chrono::TimeZone;

    use super::*;
    use crate::schema::collapse_tags;

    fn sample(key: &str, content: &str) -> Memory {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        let mut memory = Memory::new(key, content, now);
        memory.tags = collapse_tags(["food", "travel"]);
        memory.importance = 0.8;
        memory
    }

    #[tokio::test]
    async fn round_trips_a_memory() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = RelationalStore::open(dir.path().join("memories.db"))?;

        let memory = sample("memory_20240501100000", "likes strawberries");
        store.put(&memory).await?;

        let loaded = store.get("memory_20240501100000").await?.unwrap();
        assert_eq!(loaded, memory);
        Ok(())
    }

    #[tokio::test]
    async fn delete_reports_existence() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = RelationalStore::open(dir.path().join("memories.db"))?;
        store.put(&sample("memory_a", "one")).await?;

        assert!(store.delete("memory_a").await?);
        assert!(!store.delete("memory_a").await?);
        assert_eq!(store.count().await?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn list_orders_newest_first() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = RelationalStore::open(dir.path().join("memories.db"))?;

        for (i, key) in ["memory_1", "memory_2", "memory_3"].iter().enumerate() {
            let mut memory = sample(key, "entry");
            memory.created_at = Utc.with_ymd_and_hms(2024, 5, 1, 10, i as u32, 0).unwrap();
            memory.updated_at = memory.created_at;
            store.put(&memory).await?;
        }

        let listed = store.list(0, 10).await?;
        let keys: Vec<_> = listed.iter().map(|m| m.key.as_str()).collect();
        assert_eq!(keys, vec!["memory_3", "memory_2", "memory_1"]);
        Ok(())
    }

    #[tokio::test]
    async fn migration_adds_missing_columns_with_defaults() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("memories.db");

        // A database from a build that predated the metadata columns.
        {
            let conn = Connection::open(&path)?;
            conn.execute_batch(
                r#"
                CREATE TABLE memories (
                    key TEXT PRIMARY KEY,
                    content TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );
                INSERT INTO memories VALUES
                    ('memory_old', 'legacy row',
                     '2023-11-05T08:00:00.000000Z', '2023-11-05T08:00:00.000000Z');
                "#,
            )?;
        }

        let store = RelationalStore::open(&path)?;
        let loaded = store.get("memory_old").await?.unwrap();
        assert_eq!(loaded.importance, 0.5);
        assert_eq!(loaded.emotion, "neutral");
        assert_eq!(loaded.mental_state, "calm");
        assert!(loaded.tags.is_empty());
        assert!(loaded.action_tag.is_none());

        // Running the migration again must be a no-op.
        drop(store);
        let reopened = RelationalStore::open(&path)?;
        assert_eq!(reopened.count().await?, 1);
        Ok(())
    }

    #[tokio::test]
    async fn stats_aggregate_tags_emotions_and_importance() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = RelationalStore::open(dir.path().join("memories.db"))?;

        let mut a = sample("memory_a", "short");
        a.importance = 0.1;
        a.emotion = "joy".to_string();
        let mut b = sample("memory_b", "a longer content line");
        b.importance = 0.9;
        b.emotion = "joy".to_string();
        store.put(&a).await?;
        store.put(&b).await?;

        let stats = store.stats().await?;
        assert_eq!(stats.count, 2);
        assert_eq!(stats.total_chars, ("short".len() + "a longer content line".len()) as u64);
        assert_eq!(stats.emotion_histogram.get("joy"), Some(&2));
        assert_eq!(stats.tag_histogram.get("food"), Some(&2));
        assert_eq!(stats.importance_buckets.low, 1);
        assert_eq!(stats.importance_buckets.high, 1);
        assert!(stats.earliest.is_some());
        Ok(())
    }
}

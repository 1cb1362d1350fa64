//! SQLite-backed cache for validated blind judgements.
//!
//! Keyed by everything that makes a judgement reproducible: judge model,
//! rubric and card versions, role, the story card, and the full anchor card
//! set. Because score inference is deterministic, replaying from cache gives
//! bit-identical results. Purely a filesystem artifact; runs work fine
//! without it.

use async_trait::async_trait;
use fs2::FileExt;
use rusqlite::{params, Connection};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::review::inference::Comparison;

#[derive(Debug, Clone)]
pub struct JudgementCacheKey {
    pub model: String,
    pub rubric_version: String,
    pub card_version: String,
    pub role: String,
    pub story_card_hash: String,
    pub anchor_set_hash: String,
    pub key_hash: String,
}

impl JudgementCacheKey {
    pub fn new(
        model: &str,
        rubric_version: &str,
        card_version: &str,
        role: &str,
        story_card_json: &str,
        anchor_cards_json: &str,
    ) -> Self {
        let story_card_hash = hash_text(story_card_json);
        let anchor_set_hash = hash_text(anchor_cards_json);
        let key_hash = hash_fields(&[
            model,
            rubric_version,
            card_version,
            role,
            &story_card_hash,
            &anchor_set_hash,
        ]);
        Self {
            model: model.to_string(),
            rubric_version: rubric_version.to_string(),
            card_version: card_version.to_string(),
            role: role.to_string(),
            story_card_hash,
            anchor_set_hash,
            key_hash,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cache lock poisoned")]
    Poisoned,
    #[error("task join error: {0}")]
    Join(String),
    #[error("serialization error: {0}")]
    Serde(String),
}

#[async_trait]
pub trait JudgementCache: Send + Sync {
    async fn get(&self, key: &JudgementCacheKey) -> Result<Option<Vec<Comparison>>, CacheError>;
    async fn put(&self, key: &JudgementCacheKey, value: &[Comparison]) -> Result<(), CacheError>;
}

#[derive(Clone)]
pub struct SqliteJudgementCache {
    path: PathBuf,
    conn: Arc<Mutex<Connection>>,
}

impl SqliteJudgementCache {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, CacheError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(&path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;\
             PRAGMA synchronous=NORMAL;\
             CREATE TABLE IF NOT EXISTS judgement_cache (\
               key_hash TEXT PRIMARY KEY,\
               model TEXT NOT NULL,\
               rubric_version TEXT NOT NULL,\
               card_version TEXT NOT NULL,\
               role TEXT NOT NULL,\
               story_card_hash TEXT NOT NULL,\
               anchor_set_hash TEXT NOT NULL,\
               comparisons_json TEXT NOT NULL,\
               created_at INTEGER NOT NULL,\
               updated_at INTEGER NOT NULL,\
               hit_count INTEGER NOT NULL DEFAULT 0\
             );",
        )?;

        Ok(Self {
            path,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Take an exclusive advisory lock next to the database file; used by
    /// maintenance commands that rewrite the cache.
    pub fn lock_exclusive(&self) -> Result<CacheLock, CacheError> {
        CacheLock::new(&self.path)
    }

    fn with_conn<F, R>(&self, f: F) -> Result<R, CacheError>
    where
        F: FnOnce(&Connection) -> Result<R, CacheError>,
    {
        let guard = self.conn.lock().map_err(|_| CacheError::Poisoned)?;
        f(&guard)
    }
}

#[async_trait]
impl JudgementCache for SqliteJudgementCache {
    async fn get(&self, key: &JudgementCacheKey) -> Result<Option<Vec<Comparison>>, CacheError> {
        let key_hash = key.key_hash.clone();
        let cache = self.clone();
        tokio::task::spawn_blocking(move || {
            cache.with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT comparisons_json FROM judgement_cache WHERE key_hash = ?1",
                )?;
                let mut rows = stmt.query(params![key_hash])?;
                if let Some(row) = rows.next()? {
                    let raw: String = row.get(0)?;
                    let comparisons: Vec<Comparison> = serde_json::from_str(&raw)
                        .map_err(|e| CacheError::Serde(e.to_string()))?;
                    conn.execute(
                        "UPDATE judgement_cache \
                         SET hit_count = hit_count + 1, updated_at = ?1 \
                         WHERE key_hash = ?2",
                        params![now_epoch(), key_hash],
                    )?;
                    Ok(Some(comparisons))
                } else {
                    Ok(None)
                }
            })
        })
        .await
        .map_err(|e| CacheError::Join(e.to_string()))?
    }

    async fn put(&self, key: &JudgementCacheKey, value: &[Comparison]) -> Result<(), CacheError> {
        let key = key.clone();
        let raw = serde_json::to_string(value).map_err(|e| CacheError::Serde(e.to_string()))?;
        let cache = self.clone();
        tokio::task::spawn_blocking(move || {
            cache.with_conn(|conn| {
                let now = now_epoch();
                conn.execute(
                    "INSERT INTO judgement_cache ( \
                        key_hash, model, rubric_version, card_version, role, \
                        story_card_hash, anchor_set_hash, comparisons_json, \
                        created_at, updated_at \
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10) \
                     ON CONFLICT(key_hash) DO UPDATE SET \
                        comparisons_json = excluded.comparisons_json, \
                        updated_at = excluded.updated_at",
                    params![
                        key.key_hash,
                        key.model,
                        key.rubric_version,
                        key.card_version,
                        key.role,
                        key.story_card_hash,
                        key.anchor_set_hash,
                        raw,
                        now,
                        now,
                    ],
                )?;
                Ok(())
            })
        })
        .await
        .map_err(|e| CacheError::Join(e.to_string()))?
    }
}

#[derive(Debug)]
pub struct CacheLock {
    _file: std::fs::File,
}

impl CacheLock {
    fn new(db_path: &Path) -> Result<Self, CacheError> {
        let mut lock_path = db_path.to_path_buf();
        lock_path.set_extension("lock");
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(lock_path)?;
        file.lock_exclusive()?;
        Ok(Self { _file: file })
    }
}

/// Delete rows older than `max_age_days`; returns (deleted, remaining).
#[derive(Debug, Clone)]
pub struct CachePruneStats {
    pub deleted: usize,
    pub remaining: usize,
}

impl SqliteJudgementCache {
    pub async fn prune(&self, max_age_days: u64) -> Result<CachePruneStats, CacheError> {
        let cache = self.clone();
        tokio::task::spawn_blocking(move || {
            cache.with_conn(|conn| {
                let cutoff = now_epoch().saturating_sub((max_age_days as i64).saturating_mul(86_400));
                let deleted = conn.execute(
                    "DELETE FROM judgement_cache WHERE updated_at < ?1",
                    params![cutoff],
                )?;
                let remaining: i64 =
                    conn.query_row("SELECT COUNT(*) FROM judgement_cache", [], |row| row.get(0))?;
                Ok(CachePruneStats {
                    deleted,
                    remaining: remaining.max(0) as usize,
                })
            })
        })
        .await
        .map_err(|e| CacheError::Join(e.to_string()))?
    }
}

fn hash_text(text: &str) -> String {
    blake3::hash(text.as_bytes()).to_hex().to_string()
}

fn hash_fields(fields: &[&str]) -> String {
    let mut hasher = blake3::Hasher::new();
    for (idx, field) in fields.iter().enumerate() {
        if idx > 0 {
            hasher.update(b"|");
        }
        hasher.update(field.as_bytes());
    }
    hasher.finalize().to_hex().to_string()
}

fn now_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_hash_varies_with_role_and_cards() {
        let a = JudgementCacheKey::new("m", "r1", "c1", "Novelty", "{card}", "[anchors]");
        let b = JudgementCacheKey::new("m", "r1", "c1", "Methodology", "{card}", "[anchors]");
        let c = JudgementCacheKey::new("m", "r1", "c1", "Novelty", "{other}", "[anchors]");
        assert_ne!(a.key_hash, b.key_hash);
        assert_ne!(a.key_hash, c.key_hash);

        let a2 = JudgementCacheKey::new("m", "r1", "c1", "Novelty", "{card}", "[anchors]");
        assert_eq!(a.key_hash, a2.key_hash);
    }
}

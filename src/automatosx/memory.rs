//! Embedded full-text-searchable long-term memory.
//!
//! The memory manager wraps a single SQLite database (WAL mode, 5 s busy
//! timeout) holding one `memory_entries` table and one `memory_fts` FTS5
//! index kept synchronized through insert/delete/update triggers. There
//! is deliberately no vector search: retrieval is keyword-based BM25 with
//! metadata filtering.
//!
//! ```text
//! MemoryManager
//!   ├─ memory_entries   id | content | metadata(JSON) | created_at | last_accessed_at | access_count
//!   ├─ memory_fts       FTS5 over (content, metadata), trigger-synced
//!   └─ entry_count      in-memory mirror, updated only after commit
//! ```
//!
//! Inserts run inside a transaction that first applies *smart cleanup*
//! when the entry count crosses the configured trigger ratio, evicting
//! down to the target ratio under the selected strategy. The in-memory
//! counter is updated only after the transaction commits, so a failed
//! insert never skews accounting.
//!
//! # Example
//!
//! ```rust,no_run
//! use automatosx::memory::{
//!     MemoryEntryType, MemoryManager, MemoryManagerConfig, MemoryMetadata, MemorySearchQuery,
//! };
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = MemoryManager::new(MemoryManagerConfig {
//!     db_path: ".automatosx/memory/memory.db".into(),
//!     ..Default::default()
//! })?;
//!
//! let id = manager
//!     .add(
//!         "The auth service uses JWT refresh tokens",
//!         MemoryMetadata::new(MemoryEntryType::Document, "design-doc"),
//!     )
//!     .await?;
//!
//! let hits = manager
//!     .search(MemorySearchQuery {
//!         text: "refresh tokens".to_string(),
//!         ..Default::default()
//!     })
//!     .await?;
//! assert_eq!(hits[0].entry.id, id);
//! # Ok(())
//! # }
//! ```

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::error::Error;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

/// Export document version written by [`MemoryManager::export`].
pub const EXPORT_VERSION: &str = "2.0";

/// Export versions accepted on import, newest first.
pub const ACCEPTED_IMPORT_VERSIONS: &[&str] = &["2.0", "1.1", "1.0"];

/// Errors raised by the memory manager.
#[derive(Debug)]
pub enum MemoryError {
    /// Underlying SQLite failure.
    Database(String),
    /// A search query could not be executed.
    Query(String),
    /// No entry exists with the given id.
    EntryNotFound(i64),
    /// The store is full and cleanup could not make room.
    Limit { max_entries: usize },
    /// The cleanup or manager configuration violates its bounds.
    Config(String),
    /// Filesystem failure during backup/restore/export/import.
    Io(String),
    /// An import document has an unacceptable version or shape.
    InvalidFormat(String),
}

impl MemoryError {
    /// Machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            MemoryError::Database(_) => "DatabaseError",
            MemoryError::Query(_) => "QueryError",
            MemoryError::EntryNotFound(_) => "EntryNotFound",
            MemoryError::Limit { .. } => "MemoryLimit",
            MemoryError::Config(_) => "ConfigError",
            MemoryError::Io(_) => "MemoryIoError",
            MemoryError::InvalidFormat(_) => "ImportFormatError",
        }
    }
}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryError::Database(message) => write!(f, "Database error: {}", message),
            MemoryError::Query(message) => write!(f, "Query error: {}", message),
            MemoryError::EntryNotFound(id) => write!(f, "Memory entry {} not found", id),
            MemoryError::Limit { max_entries } => {
                write!(f, "Memory limit of {} entries reached", max_entries)
            }
            MemoryError::Config(message) => write!(f, "Invalid memory config: {}", message),
            MemoryError::Io(message) => write!(f, "Memory I/O error: {}", message),
            MemoryError::InvalidFormat(message) => {
                write!(f, "Invalid import document: {}", message)
            }
        }
    }
}

impl Error for MemoryError {}

impl From<rusqlite::Error> for MemoryError {
    fn from(err: rusqlite::Error) -> Self {
        MemoryError::Database(err.to_string())
    }
}

/// Eviction strategy for smart cleanup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupStrategy {
    /// Evict the oldest entries by creation time.
    Oldest,
    /// Evict the least recently/frequently accessed entries. Requires
    /// access tracking; falls back to `Oldest` when tracking is off.
    LeastAccessed,
    /// Evict by access count, breaking ties on creation time.
    Hybrid,
}

impl Default for CleanupStrategy {
    fn default() -> Self {
        CleanupStrategy::Oldest
    }
}

/// Smart-cleanup policy under `memory.cleanup`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryCleanupConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub strategy: CleanupStrategy,
    /// Cleanup triggers when `entry_count / max_entries` reaches this
    /// ratio. Must be within `[0.5, 1.0]`.
    #[serde(default = "default_trigger_threshold")]
    pub trigger_threshold: f64,
    /// Cleanup evicts down to `target_threshold * max_entries`. Must be
    /// within `[0.1, 0.9]` and strictly below the trigger.
    #[serde(default = "default_target_threshold")]
    pub target_threshold: f64,
    /// Lower bound on entries removed per cleanup. Must be ≥ 1.
    #[serde(default = "default_min_cleanup")]
    pub min_cleanup_count: usize,
    /// Upper bound on entries removed per cleanup. Must be ≥ the minimum.
    #[serde(default = "default_max_cleanup")]
    pub max_cleanup_count: usize,
    /// Retention window for age-based cleanup. Must be ≥ 1.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

impl Default for MemoryCleanupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            strategy: CleanupStrategy::default(),
            trigger_threshold: default_trigger_threshold(),
            target_threshold: default_target_threshold(),
            min_cleanup_count: default_min_cleanup(),
            max_cleanup_count: default_max_cleanup(),
            retention_days: default_retention_days(),
        }
    }
}

impl MemoryCleanupConfig {
    /// Enforce the documented bounds.
    pub fn validate(&self) -> Result<(), MemoryError> {
        if !(0.5..=1.0).contains(&self.trigger_threshold) {
            return Err(MemoryError::Config(
                "triggerThreshold must be within [0.5, 1.0]".to_string(),
            ));
        }
        if !(0.1..=0.9).contains(&self.target_threshold) {
            return Err(MemoryError::Config(
                "targetThreshold must be within [0.1, 0.9]".to_string(),
            ));
        }
        if self.target_threshold >= self.trigger_threshold {
            return Err(MemoryError::Config(
                "targetThreshold must be below triggerThreshold".to_string(),
            ));
        }
        if self.min_cleanup_count < 1 {
            return Err(MemoryError::Config(
                "minCleanupCount must be at least 1".to_string(),
            ));
        }
        if self.max_cleanup_count < self.min_cleanup_count {
            return Err(MemoryError::Config(
                "maxCleanupCount must be at least minCleanupCount".to_string(),
            ));
        }
        if self.retention_days < 1 {
            return Err(MemoryError::Config(
                "retentionDays must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}

fn default_trigger_threshold() -> f64 {
    0.9
}

fn default_target_threshold() -> f64 {
    0.7
}

fn default_min_cleanup() -> usize {
    1
}

fn default_max_cleanup() -> usize {
    1_000
}

fn default_retention_days() -> u32 {
    30
}

/// Full manager configuration.
#[derive(Debug, Clone)]
pub struct MemoryManagerConfig {
    /// SQLite database path; parent directories are created on demand.
    pub db_path: PathBuf,
    /// Hard cap on stored entries.
    pub max_entries: usize,
    /// Whether searches bump access counters.
    pub track_access: bool,
    /// Smart-cleanup policy.
    pub cleanup: MemoryCleanupConfig,
}

impl Default for MemoryManagerConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(".automatosx/memory/memory.db"),
            max_entries: 10_000,
            track_access: true,
            cleanup: MemoryCleanupConfig::default(),
        }
    }
}

/// Category of a memory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryEntryType {
    Conversation,
    Code,
    Document,
    Task,
    Other,
}

/// Typed entry metadata stored as JSON alongside the content.
///
/// Unknown keys survive round trips through the `extra` slot, so foreign
/// metadata written by newer versions is preserved verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryMetadata {
    #[serde(rename = "type")]
    pub entry_type: MemoryEntryType,
    /// Where the entry came from (agent name, "import", "cli", ...).
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub importance: Option<f64>,
    /// Forward-compatibility slot for keys this version does not model.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl MemoryMetadata {
    /// Minimal metadata with a type and source.
    pub fn new(entry_type: MemoryEntryType, source: impl Into<String>) -> Self {
        Self {
            entry_type,
            source: source.into(),
            agent_id: None,
            session_id: None,
            tags: Vec::new(),
            importance: None,
            extra: serde_json::Map::new(),
        }
    }

    /// Attach an agent id (builder pattern).
    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    /// Attach a session id (builder pattern).
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Attach a tag (builder pattern).
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Set the importance score (builder pattern).
    pub fn with_importance(mut self, importance: f64) -> Self {
        self.importance = Some(importance);
        self
    }
}

/// One stored memory entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryEntry {
    pub id: i64,
    pub content: String,
    pub metadata: MemoryMetadata,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_accessed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub access_count: u32,
}

/// Inclusive creation-time window for search filtering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DateRange {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

/// Metadata filters applied conjunctively to search results.
#[derive(Debug, Clone, Default)]
pub struct MemorySearchFilters {
    /// Entry type must be one of these.
    pub types: Option<Vec<MemoryEntryType>>,
    /// Source must be one of these.
    pub sources: Option<Vec<String>>,
    /// Exact agent id match.
    pub agent_id: Option<String>,
    /// Exact session id match.
    pub session_id: Option<String>,
    /// Every listed tag must be present on the entry.
    pub tags: Option<Vec<String>>,
    /// Creation time must fall inside the range.
    pub date_range: Option<DateRange>,
    /// Importance must be at least this value.
    pub min_importance: Option<f64>,
}

impl MemorySearchFilters {
    fn matches(&self, entry: &MemoryEntry) -> bool {
        if let Some(types) = &self.types {
            if !types.contains(&entry.metadata.entry_type) {
                return false;
            }
        }
        if let Some(sources) = &self.sources {
            if !sources.iter().any(|s| s == &entry.metadata.source) {
                return false;
            }
        }
        if let Some(agent_id) = &self.agent_id {
            if entry.metadata.agent_id.as_deref() != Some(agent_id.as_str()) {
                return false;
            }
        }
        if let Some(session_id) = &self.session_id {
            if entry.metadata.session_id.as_deref() != Some(session_id.as_str()) {
                return false;
            }
        }
        if let Some(tags) = &self.tags {
            if !tags.iter().all(|t| entry.metadata.tags.contains(t)) {
                return false;
            }
        }
        if let Some(range) = &self.date_range {
            if entry.created_at < range.from || entry.created_at > range.to {
                return false;
            }
        }
        if let Some(min) = self.min_importance {
            if entry.metadata.importance.unwrap_or(0.0) < min {
                return false;
            }
        }
        true
    }
}

/// A full-text search request.
#[derive(Debug, Clone)]
pub struct MemorySearchQuery {
    /// Free-text query; sanitized before reaching the FTS index.
    pub text: String,
    /// Optional metadata filters.
    pub filters: Option<MemorySearchFilters>,
    /// Maximum hits returned.
    pub limit: usize,
    /// Minimum similarity in `[0, 1]`; hits below are dropped.
    pub threshold: Option<f64>,
}

impl Default for MemorySearchQuery {
    fn default() -> Self {
        Self {
            text: String::new(),
            filters: None,
            limit: 10,
            threshold: None,
        }
    }
}

/// A search hit with its similarity score.
#[derive(Debug, Clone)]
pub struct MemorySearchHit {
    pub entry: MemoryEntry,
    /// `1 / (1 + |bm25 rank|)`, bounded to `(0, 1]`.
    pub similarity: f64,
}

/// Aggregate statistics over the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryStats {
    pub total_entries: usize,
    pub db_size_bytes: u64,
    pub oldest_entry: Option<DateTime<Utc>>,
    pub newest_entry: Option<DateTime<Utc>>,
}

/// Serialized export document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryExport {
    pub version: String,
    pub metadata: MemoryExportMetadata,
    pub entries: Vec<MemoryEntry>,
}

/// Export header metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryExportMetadata {
    pub exported_at: DateTime<Utc>,
    pub total_entries: usize,
    /// Always false; the store has no vector embeddings.
    pub includes_embeddings: bool,
}

/// Options for [`MemoryManager::import`].
#[derive(Debug, Clone, Default)]
pub struct ImportOptions {
    /// Skip entries whose content hash already exists in the store.
    pub skip_duplicates: bool,
    /// Reject entries with empty content.
    pub validate: bool,
    /// Drop every existing entry before importing.
    pub clear_existing: bool,
}

/// Outcome of an import; per-entry errors are collected, never thrown.
#[derive(Debug, Clone, Default)]
pub struct ImportReport {
    pub imported: usize,
    pub skipped_duplicates: usize,
    pub errors: Vec<String>,
}

/// Cheap duplicate-detection hash: length plus the first and last 100
/// characters of the content.
pub fn content_hash(content: &str) -> String {
    let chars: Vec<char> = content.chars().collect();
    let take = chars.len().min(100);
    let head: String = chars[..take].iter().collect();
    let tail: String = chars[chars.len() - take..].iter().collect();
    format!("{}:{}:{}", chars.len(), head, tail)
}

/// Replace FTS5 metacharacters and boolean keywords with spaces and
/// collapse whitespace. An empty result means the query matches nothing.
///
/// # Example
///
/// ```rust
/// use automatosx::memory::sanitize_fts_query;
///
/// assert_eq!(sanitize_fts_query("jwt AND (refresh OR access)"), "jwt refresh access");
/// assert_eq!(sanitize_fts_query("NOT * ^ :"), "");
/// ```
pub fn sanitize_fts_query(text: &str) -> String {
    let cleaned: String = text
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    cleaned
        .split_whitespace()
        .filter(|token| {
            let upper = token.to_uppercase();
            upper != "AND" && upper != "OR" && upper != "NOT"
        })
        .collect::<Vec<_>>()
        .join(" ")
}

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS memory_entries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    content TEXT NOT NULL,
    metadata TEXT NOT NULL,
    created_at TEXT NOT NULL,
    last_accessed_at TEXT,
    access_count INTEGER NOT NULL DEFAULT 0
);
CREATE VIRTUAL TABLE IF NOT EXISTS memory_fts USING fts5(
    content,
    metadata,
    content='memory_entries',
    content_rowid='id'
);
CREATE TRIGGER IF NOT EXISTS memory_entries_ai AFTER INSERT ON memory_entries BEGIN
    INSERT INTO memory_fts(rowid, content, metadata)
    VALUES (new.id, new.content, new.metadata);
END;
CREATE TRIGGER IF NOT EXISTS memory_entries_ad AFTER DELETE ON memory_entries BEGIN
    INSERT INTO memory_fts(memory_fts, rowid, content, metadata)
    VALUES ('delete', old.id, old.content, old.metadata);
END;
CREATE TRIGGER IF NOT EXISTS memory_entries_au AFTER UPDATE ON memory_entries BEGIN
    INSERT INTO memory_fts(memory_fts, rowid, content, metadata)
    VALUES ('delete', old.id, old.content, old.metadata);
    INSERT INTO memory_fts(rowid, content, metadata)
    VALUES (new.id, new.content, new.metadata);
END;
";

/// The embedded memory store. See the module docs for the data model.
pub struct MemoryManager {
    conn: Mutex<Connection>,
    db_path: PathBuf,
    config: MemoryManagerConfig,
    entry_count: AtomicUsize,
}

impl MemoryManager {
    /// Open (or create) the database and prepare the schema.
    pub fn new(config: MemoryManagerConfig) -> Result<Self, MemoryError> {
        config.cleanup.validate()?;
        if let Some(parent) = config.db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| MemoryError::Io(e.to_string()))?;
        }
        let conn = open_database(&config.db_path)?;
        let count: usize =
            conn.query_row("SELECT COUNT(*) FROM memory_entries", [], |row| row.get(0))?;
        log::debug!(
            "Memory store opened at {} with {} entries",
            config.db_path.display(),
            count
        );
        Ok(Self {
            conn: Mutex::new(conn),
            db_path: config.db_path.clone(),
            config,
            entry_count: AtomicUsize::new(count),
        })
    }

    /// Number of entries, mirrored in memory.
    pub fn entry_count(&self) -> usize {
        self.entry_count.load(Ordering::SeqCst)
    }

    /// Insert an entry, applying smart cleanup first when the store is
    /// close to its cap. Returns the new entry's id.
    pub async fn add(
        &self,
        content: &str,
        metadata: MemoryMetadata,
    ) -> Result<i64, MemoryError> {
        let metadata_json = serde_json::to_string(&metadata)
            .map_err(|e| MemoryError::InvalidFormat(e.to_string()))?;

        let mut conn = self.conn.lock().await;
        let count = self.entry_count.load(Ordering::SeqCst);
        let tx = conn.transaction()?;

        let mut removed = 0usize;
        if self.config.cleanup.enabled && self.config.max_entries > 0 {
            let ratio = count as f64 / self.config.max_entries as f64;
            if ratio >= self.config.cleanup.trigger_threshold {
                removed = run_smart_cleanup(&tx, &self.config, count)?;
                log::info!(
                    "Smart cleanup removed {} entries ({} -> {})",
                    removed,
                    count,
                    count - removed
                );
            }
        }

        let remaining = count - removed;
        if remaining >= self.config.max_entries {
            // Roll back any cleanup rather than committing a delete that
            // still cannot make room.
            drop(tx);
            return Err(MemoryError::Limit {
                max_entries: self.config.max_entries,
            });
        }

        let now = Utc::now().to_rfc3339();
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO memory_entries (content, metadata, created_at, last_accessed_at, access_count)
                 VALUES (?1, ?2, ?3, ?3, 0)",
            )?;
            stmt.execute(rusqlite::params![content, metadata_json, now])?;
        }
        let id = tx.last_insert_rowid();
        tx.commit()?;

        self.entry_count.store(remaining + 1, Ordering::SeqCst);
        Ok(id)
    }

    /// Fetch one entry by id.
    pub async fn get(&self, id: i64) -> Result<MemoryEntry, MemoryError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, content, metadata, created_at, last_accessed_at, access_count
             FROM memory_entries WHERE id = ?1",
        )?;
        let entry = stmt
            .query_row([id], row_to_entry)
            .map_err(|err| match err {
                rusqlite::Error::QueryReturnedNoRows => MemoryError::EntryNotFound(id),
                other => MemoryError::from(other),
            })?;
        Ok(entry)
    }

    /// Delete one entry by id.
    pub async fn delete(&self, id: i64) -> Result<(), MemoryError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached("DELETE FROM memory_entries WHERE id = ?1")?;
        let changed = stmt.execute([id])?;
        if changed == 0 {
            return Err(MemoryError::EntryNotFound(id));
        }
        self.entry_count.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }

    /// Drop every entry.
    pub async fn clear_all(&self) -> Result<usize, MemoryError> {
        let conn = self.conn.lock().await;
        let removed = conn.execute("DELETE FROM memory_entries", [])?;
        self.entry_count.store(0, Ordering::SeqCst);
        Ok(removed)
    }

    /// Delete entries created before the retention cutoff.
    pub async fn cleanup_older_than(&self, days: u32) -> Result<usize, MemoryError> {
        let cutoff = (Utc::now() - ChronoDuration::days(i64::from(days))).to_rfc3339();
        let conn = self.conn.lock().await;
        let mut stmt =
            conn.prepare_cached("DELETE FROM memory_entries WHERE created_at < ?1")?;
        let removed = stmt.execute([cutoff])?;
        if removed > 0 {
            let count: usize =
                conn.query_row("SELECT COUNT(*) FROM memory_entries", [], |row| row.get(0))?;
            self.entry_count.store(count, Ordering::SeqCst);
        }
        Ok(removed)
    }

    /// Full-text search with metadata filtering.
    ///
    /// The raw query is sanitized first; an empty sanitized query returns
    /// no hits without touching the index. Hits come back ordered by BM25
    /// rank ascending (most relevant first) with the rank mapped onto a
    /// bounded similarity score.
    pub async fn search(
        &self,
        query: MemorySearchQuery,
    ) -> Result<Vec<MemorySearchHit>, MemoryError> {
        let sanitized = sanitize_fts_query(&query.text);
        if sanitized.is_empty() {
            return Ok(Vec::new());
        }

        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare_cached(
                "SELECT e.id, e.content, e.metadata, e.created_at, e.last_accessed_at,
                        e.access_count, bm25(memory_fts) AS rank
                 FROM memory_fts
                 JOIN memory_entries e ON e.id = memory_fts.rowid
                 WHERE memory_fts MATCH ?1
                 ORDER BY rank ASC",
            )
            .map_err(|e| MemoryError::Query(e.to_string()))?;

        let rows = stmt
            .query_map([&sanitized], |row| {
                let entry = row_to_entry(row)?;
                let rank: f64 = row.get(6)?;
                Ok((entry, rank))
            })
            .map_err(|e| MemoryError::Query(e.to_string()))?;

        let mut hits = Vec::new();
        for row in rows {
            let (entry, rank) = row.map_err(|e| MemoryError::Query(e.to_string()))?;
            if let Some(filters) = &query.filters {
                if !filters.matches(&entry) {
                    continue;
                }
            }
            let similarity = 1.0 / (1.0 + rank.abs());
            if let Some(threshold) = query.threshold {
                if similarity < threshold {
                    continue;
                }
            }
            hits.push(MemorySearchHit { entry, similarity });
            if hits.len() >= query.limit {
                break;
            }
        }

        if self.config.track_access && !hits.is_empty() {
            let ids: Vec<String> = hits.iter().map(|h| h.entry.id.to_string()).collect();
            let now = Utc::now().to_rfc3339();
            // One batch update for all returned ids.
            let sql = format!(
                "UPDATE memory_entries
                 SET access_count = access_count + 1, last_accessed_at = ?1
                 WHERE id IN ({})",
                ids.join(",")
            );
            conn.execute(&sql, [&now])?;
        }

        Ok(hits)
    }

    /// Page through entries, newest first. Backs listing surfaces that
    /// browse memory without a search query.
    pub async fn list_recent(
        &self,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<MemoryEntry>, MemoryError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, content, metadata, created_at, last_accessed_at, access_count
             FROM memory_entries ORDER BY created_at DESC, id DESC LIMIT ?1 OFFSET ?2",
        )?;
        let rows = stmt.query_map([limit as i64, offset as i64], row_to_entry)?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    /// Store statistics.
    pub async fn get_stats(&self) -> Result<MemoryStats, MemoryError> {
        let conn = self.conn.lock().await;
        let (oldest, newest): (Option<String>, Option<String>) = conn.query_row(
            "SELECT MIN(created_at), MAX(created_at) FROM memory_entries",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let db_size_bytes = std::fs::metadata(&self.db_path)
            .map(|m| m.len())
            .unwrap_or(0);
        Ok(MemoryStats {
            total_entries: self.entry_count.load(Ordering::SeqCst),
            db_size_bytes,
            oldest_entry: oldest.and_then(|s| parse_timestamp(&s).ok()),
            newest_entry: newest.and_then(|s| parse_timestamp(&s).ok()),
        })
    }

    /// Copy the live database to `dest` atomically.
    ///
    /// The WAL is checkpointed first so the copied file is complete, then
    /// the copy lands via a temp file + rename.
    pub async fn backup(&self, dest: &Path) -> Result<(), MemoryError> {
        let conn = self.conn.lock().await;
        conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?;
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent).map_err(|e| MemoryError::Io(e.to_string()))?;
        }
        let tmp = dest.with_extension("db.tmp");
        std::fs::copy(&self.db_path, &tmp).map_err(|e| MemoryError::Io(e.to_string()))?;
        std::fs::rename(&tmp, dest).map_err(|e| {
            let _ = std::fs::remove_file(&tmp);
            MemoryError::Io(e.to_string())
        })?;
        log::info!("Memory backup written to {}", dest.display());
        Ok(())
    }

    /// Replace the live database with a backup file.
    ///
    /// Closes the current handle, copies `source` over the database path,
    /// reopens with identical pragmas, and recounts entries. On failure
    /// the manager attempts to reopen its previous database and the error
    /// is propagated.
    pub async fn restore(&self, source: &Path) -> Result<(), MemoryError> {
        if !source.exists() {
            return Err(MemoryError::Io(format!(
                "backup file {} does not exist",
                source.display()
            )));
        }

        let mut guard = self.conn.lock().await;
        // Drop the live handle before overwriting the file.
        let placeholder = Connection::open_in_memory()?;
        let old = std::mem::replace(&mut *guard, placeholder);
        drop(old);

        let result = (|| -> Result<Connection, MemoryError> {
            std::fs::copy(source, &self.db_path).map_err(|e| MemoryError::Io(e.to_string()))?;
            // The restored file replaces the WAL/SHM sidecars wholesale.
            let _ = std::fs::remove_file(self.db_path.with_extension("db-wal"));
            let _ = std::fs::remove_file(self.db_path.with_extension("db-shm"));
            open_database(&self.db_path)
        })();

        match result {
            Ok(conn) => {
                let count: usize =
                    conn.query_row("SELECT COUNT(*) FROM memory_entries", [], |row| row.get(0))?;
                *guard = conn;
                self.entry_count.store(count, Ordering::SeqCst);
                log::info!("Memory restored from {} ({} entries)", source.display(), count);
                Ok(())
            }
            Err(err) => {
                // Best effort: reopen whatever is on disk so the manager
                // is not left with a dead in-memory handle.
                if let Ok(conn) = open_database(&self.db_path) {
                    let count: usize = conn
                        .query_row("SELECT COUNT(*) FROM memory_entries", [], |row| row.get(0))
                        .unwrap_or(0);
                    *guard = conn;
                    self.entry_count.store(count, Ordering::SeqCst);
                } else {
                    self.entry_count.store(0, Ordering::SeqCst);
                }
                Err(err)
            }
        }
    }

    /// Export entries (optionally filtered) as a JSON document.
    pub async fn export(
        &self,
        filters: Option<&MemorySearchFilters>,
    ) -> Result<MemoryExport, MemoryError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, content, metadata, created_at, last_accessed_at, access_count
             FROM memory_entries ORDER BY id ASC",
        )?;
        let rows = stmt.query_map([], row_to_entry)?;

        let mut entries = Vec::new();
        for row in rows {
            let entry = row?;
            if let Some(filters) = filters {
                if !filters.matches(&entry) {
                    continue;
                }
            }
            entries.push(entry);
        }

        Ok(MemoryExport {
            version: EXPORT_VERSION.to_string(),
            metadata: MemoryExportMetadata {
                exported_at: Utc::now(),
                total_entries: entries.len(),
                includes_embeddings: false,
            },
            entries,
        })
    }

    /// Export to a JSON file.
    pub async fn export_to_file(
        &self,
        path: &Path,
        filters: Option<&MemorySearchFilters>,
    ) -> Result<usize, MemoryError> {
        let export = self.export(filters).await?;
        let json = serde_json::to_string_pretty(&export)
            .map_err(|e| MemoryError::InvalidFormat(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| MemoryError::Io(e.to_string()))?;
        }
        std::fs::write(path, json).map_err(|e| MemoryError::Io(e.to_string()))?;
        Ok(export.entries.len())
    }

    /// Import an export document.
    ///
    /// The version must be in [`ACCEPTED_IMPORT_VERSIONS`]; a mismatch is
    /// an integrity failure and is never swallowed. Per-entry failures
    /// are collected into the report instead of aborting the batch.
    pub async fn import(
        &self,
        export: &MemoryExport,
        options: &ImportOptions,
    ) -> Result<ImportReport, MemoryError> {
        if !ACCEPTED_IMPORT_VERSIONS.contains(&export.version.as_str()) {
            return Err(MemoryError::InvalidFormat(format!(
                "unsupported export version '{}' (accepted: {})",
                export.version,
                ACCEPTED_IMPORT_VERSIONS.join(", ")
            )));
        }

        if options.clear_existing {
            self.clear_all().await?;
        }

        let mut existing_hashes: HashSet<String> = HashSet::new();
        if options.skip_duplicates {
            let conn = self.conn.lock().await;
            let mut stmt = conn.prepare_cached("SELECT content FROM memory_entries")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            for content in rows {
                existing_hashes.insert(content_hash(&content?));
            }
        }

        let mut report = ImportReport::default();
        for (index, entry) in export.entries.iter().enumerate() {
            if options.validate && entry.content.trim().is_empty() {
                report
                    .errors
                    .push(format!("entry {}: empty content", index));
                continue;
            }
            if options.skip_duplicates {
                let hash = content_hash(&entry.content);
                if existing_hashes.contains(&hash) {
                    report.skipped_duplicates += 1;
                    continue;
                }
                existing_hashes.insert(hash);
            }
            match self.add(&entry.content, entry.metadata.clone()).await {
                Ok(_) => report.imported += 1,
                Err(err) => report.errors.push(format!("entry {}: {}", index, err)),
            }
        }

        log::info!(
            "Memory import: {} imported, {} duplicates skipped, {} errors",
            report.imported,
            report.skipped_duplicates,
            report.errors.len()
        );
        Ok(report)
    }

    /// Import from a JSON file.
    pub async fn import_from_file(
        &self,
        path: &Path,
        options: &ImportOptions,
    ) -> Result<ImportReport, MemoryError> {
        let raw = std::fs::read_to_string(path).map_err(|e| MemoryError::Io(e.to_string()))?;
        let export: MemoryExport = serde_json::from_str(&raw)
            .map_err(|e| MemoryError::InvalidFormat(e.to_string()))?;
        self.import(&export, options).await
    }
}

fn open_database(path: &Path) -> Result<Connection, MemoryError> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(Duration::from_secs(5))?;
    // PRAGMA journal_mode returns a row; query_row discards it.
    conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
    conn.execute("PRAGMA synchronous = NORMAL", [])?;
    conn.execute_batch(SCHEMA_SQL)?;
    Ok(conn)
}

fn run_smart_cleanup(
    tx: &rusqlite::Transaction<'_>,
    config: &MemoryManagerConfig,
    count: usize,
) -> Result<usize, MemoryError> {
    let target = (config.cleanup.target_threshold * config.max_entries as f64).floor() as usize;
    let mut to_remove = count.saturating_sub(target);
    to_remove = to_remove.clamp(
        config.cleanup.min_cleanup_count,
        config.cleanup.max_cleanup_count,
    );
    to_remove = to_remove.min(count);
    if to_remove == 0 {
        return Ok(0);
    }

    let strategy = match config.cleanup.strategy {
        CleanupStrategy::LeastAccessed if !config.track_access => {
            log::debug!("least_accessed cleanup without access tracking; using oldest");
            CleanupStrategy::Oldest
        }
        other => other,
    };

    let order_clause = match strategy {
        CleanupStrategy::Oldest => "created_at ASC, id ASC",
        CleanupStrategy::LeastAccessed => "access_count ASC, last_accessed_at ASC, id ASC",
        CleanupStrategy::Hybrid => "access_count ASC, created_at ASC, id ASC",
    };

    let sql = format!(
        "DELETE FROM memory_entries WHERE id IN (
            SELECT id FROM memory_entries ORDER BY {} LIMIT ?1
        )",
        order_clause
    );
    let removed = tx.execute(&sql, [to_remove as i64])?;
    Ok(removed)
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<MemoryEntry> {
    let id: i64 = row.get(0)?;
    let content: String = row.get(1)?;
    let metadata_json: String = row.get(2)?;
    let created_at: String = row.get(3)?;
    let last_accessed_at: Option<String> = row.get(4)?;
    let access_count: u32 = row.get(5)?;

    let metadata: MemoryMetadata = serde_json::from_str(&metadata_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let created_at = parse_timestamp(&created_at).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let last_accessed_at = match last_accessed_at {
        Some(s) => Some(parse_timestamp(&s).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
        })?),
        None => None,
    };

    Ok(MemoryEntry {
        id,
        content,
        metadata,
        created_at,
        last_accessed_at,
        access_count,
    })
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(s).map(|dt| dt.with_timezone(&Utc))
}

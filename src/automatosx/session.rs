//! Multi-agent collaboration sessions.
//!
//! A session groups the agents that participated in one delegation tree
//! around a task. The manager keeps a bounded working set in memory and,
//! when configured with a journal path, persists it with a 100 ms
//! debounce: every mutation schedules a save, rapid mutations coalesce
//! into one write, and the write itself is atomic (`<path>.tmp` + rename)
//! so a crash can never leave a torn journal.
//!
//! On startup the journal is loaded record by record; records that fail
//! validation (malformed id, unparseable timestamps) are skipped with a
//! warning. A journal that cannot be parsed at all is quarantined to
//! `<path>.corrupted.<timestamp>` and the manager starts fresh.
//!
//! # Example
//!
//! ```rust,no_run
//! use automatosx::session::{SessionManager, SessionManagerConfig};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = SessionManager::new(SessionManagerConfig {
//!     persist_path: Some(".automatosx/sessions/sessions.json".into()),
//!     ..Default::default()
//! })?;
//!
//! let session = manager.create_session("Ship the login page", "backend").await?;
//! manager.add_agent(&session.id, "frontend").await?;
//! manager.complete_session(&session.id).await?;
//! manager.destroy().await;
//! # Ok(())
//! # }
//! ```

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use uuid::Uuid;

lazy_static! {
    static ref UUID_V4_RE: Regex = Regex::new(
        r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-4[0-9a-fA-F]{3}-[89abAB][0-9a-fA-F]{3}-[0-9a-fA-F]{12}$"
    )
    .unwrap();
}

/// Metadata byte budget per session (10 KiB of serialized JSON).
pub const MAX_METADATA_BYTES: usize = 10 * 1024;

/// Errors raised by the session manager.
#[derive(Debug)]
pub enum SessionError {
    /// The id is not a UUIDv4.
    InvalidFormat(String),
    /// No session exists with the given id.
    NotFound(String),
    /// The merged metadata exceeds [`MAX_METADATA_BYTES`].
    MetadataTooLarge { bytes: usize },
    /// A session could not be created.
    CreationFailed(String),
    /// Journal I/O failure.
    Io(String),
}

impl SessionError {
    /// Machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            SessionError::InvalidFormat(_) => "InvalidFormat",
            SessionError::NotFound(_) => "NotFound",
            SessionError::MetadataTooLarge { .. } => "MetadataTooLarge",
            SessionError::CreationFailed(_) => "CreationFailed",
            SessionError::Io(_) => "SessionIoError",
        }
    }
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::InvalidFormat(id) => write!(f, "Invalid session id '{}'", id),
            SessionError::NotFound(id) => write!(f, "Session '{}' not found", id),
            SessionError::MetadataTooLarge { bytes } => write!(
                f,
                "Session metadata is {} bytes, over the {} byte limit",
                bytes, MAX_METADATA_BYTES
            ),
            SessionError::CreationFailed(message) => {
                write!(f, "Session creation failed: {}", message)
            }
            SessionError::Io(message) => write!(f, "Session journal error: {}", message),
        }
    }
}

impl Error for SessionError {}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Completed,
    Failed,
}

/// A persisted collaboration session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// UUIDv4 identifier.
    pub id: String,
    /// Agent that started the session.
    pub initiator: String,
    /// The task the session revolves around.
    pub task: String,
    /// Participating agents; unique, initiator first.
    pub agents: Vec<String>,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// JSON metadata bounded at [`MAX_METADATA_BYTES`].
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// Failure description when status is `failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Check an id against the UUIDv4 rule.
pub fn is_valid_session_id(id: &str) -> bool {
    UUID_V4_RE.is_match(id)
}

/// Manager configuration.
#[derive(Debug, Clone)]
pub struct SessionManagerConfig {
    /// Working-set cap; creating past it evicts finished sessions first.
    pub max_sessions: usize,
    /// Journal file path. `None` keeps sessions in memory only.
    pub persist_path: Option<PathBuf>,
    /// Save debounce window in milliseconds.
    pub debounce_ms: u64,
}

impl Default for SessionManagerConfig {
    fn default() -> Self {
        Self {
            max_sessions: 100,
            persist_path: None,
            debounce_ms: 100,
        }
    }
}

struct SessionState {
    config: SessionManagerConfig,
    sessions: RwLock<HashMap<String, Session>>,
    pending_save: StdMutex<Option<JoinHandle<()>>>,
}

/// Persistent map of collaboration sessions. Cheap to clone; clones share
/// state.
#[derive(Clone)]
pub struct SessionManager {
    state: Arc<SessionState>,
}

impl SessionManager {
    /// Create a manager, loading the journal when a path is configured.
    pub fn new(config: SessionManagerConfig) -> Result<Self, SessionError> {
        let sessions = match &config.persist_path {
            Some(path) => load_journal(path)?,
            None => HashMap::new(),
        };
        Ok(Self {
            state: Arc::new(SessionState {
                config,
                sessions: RwLock::new(sessions),
                pending_save: StdMutex::new(None),
            }),
        })
    }

    /// Create a new active session. Runs capacity cleanup first and
    /// age-based cleanup (7 days) afterwards.
    pub async fn create_session(
        &self,
        task: &str,
        initiator: &str,
    ) -> Result<Session, SessionError> {
        if task.trim().is_empty() {
            return Err(SessionError::CreationFailed("task is empty".to_string()));
        }

        {
            let sessions = self.state.sessions.read().await;
            if sessions.len() >= self.state.config.max_sessions {
                drop(sessions);
                self.cleanup().await;
            }
        }

        let now = Utc::now();
        let session = Session {
            id: Uuid::new_v4().to_string(),
            initiator: initiator.to_string(),
            task: task.to_string(),
            agents: vec![initiator.to_string()],
            status: SessionStatus::Active,
            created_at: now,
            updated_at: now,
            metadata: Map::new(),
            error: None,
        };

        self.state
            .sessions
            .write()
            .await
            .insert(session.id.clone(), session.clone());
        log::debug!("Session {} created by '{}'", session.id, initiator);

        self.cleanup_old_sessions(7).await;
        self.schedule_save();
        Ok(session)
    }

    /// Add an agent to a session's participant list.
    pub async fn add_agent(&self, id: &str, agent: &str) -> Result<(), SessionError> {
        if !is_valid_session_id(id) {
            return Err(SessionError::InvalidFormat(id.to_string()));
        }
        let mut sessions = self.state.sessions.write().await;
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        if !session.agents.iter().any(|a| a == agent) {
            session.agents.push(agent.to_string());
        }
        touch(session);
        drop(sessions);
        self.schedule_save();
        Ok(())
    }

    /// Fetch a session by id. Malformed ids read as absent rather than
    /// erroring.
    pub async fn get_session(&self, id: &str) -> Option<Session> {
        if !is_valid_session_id(id) {
            return None;
        }
        self.state.sessions.read().await.get(id).cloned()
    }

    /// All sessions with `active` status.
    pub async fn get_active_sessions(&self) -> Vec<Session> {
        self.state
            .sessions
            .read()
            .await
            .values()
            .filter(|s| s.status == SessionStatus::Active)
            .cloned()
            .collect()
    }

    /// Active sessions a given agent participates in.
    pub async fn get_active_sessions_for_agent(&self, agent: &str) -> Vec<Session> {
        self.state
            .sessions
            .read()
            .await
            .values()
            .filter(|s| s.status == SessionStatus::Active && s.agents.iter().any(|a| a == agent))
            .cloned()
            .collect()
    }

    /// Mark a session completed.
    pub async fn complete_session(&self, id: &str) -> Result<(), SessionError> {
        self.set_status(id, SessionStatus::Completed, None).await
    }

    /// Mark a session failed with an error description.
    pub async fn fail_session(&self, id: &str, error: &str) -> Result<(), SessionError> {
        self.set_status(id, SessionStatus::Failed, Some(error.to_string()))
            .await
    }

    /// Merge a metadata patch into a session.
    ///
    /// The merged metadata's JSON encoding must stay within
    /// [`MAX_METADATA_BYTES`] of UTF-8, otherwise the patch is rejected
    /// and the session is left untouched. (`serde_json::Value` cannot
    /// express reference cycles, so the serializability failure mode of
    /// dynamic-language metadata reduces to the size check here.)
    pub async fn update_metadata(
        &self,
        id: &str,
        patch: Map<String, Value>,
    ) -> Result<(), SessionError> {
        if !is_valid_session_id(id) {
            return Err(SessionError::InvalidFormat(id.to_string()));
        }
        let mut sessions = self.state.sessions.write().await;
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;

        let mut merged = session.metadata.clone();
        for (key, value) in patch {
            merged.insert(key, value);
        }
        let encoded = serde_json::to_string(&merged)
            .map_err(|e| SessionError::Io(e.to_string()))?;
        if encoded.len() > MAX_METADATA_BYTES {
            return Err(SessionError::MetadataTooLarge {
                bytes: encoded.len(),
            });
        }

        session.metadata = merged;
        touch(session);
        drop(sessions);
        self.schedule_save();
        Ok(())
    }

    /// Evict finished and stale sessions down to the configured capacity.
    ///
    /// Eviction order: completed/failed sessions first, then oldest
    /// `updated_at` first.
    pub async fn cleanup(&self) {
        let mut sessions = self.state.sessions.write().await;
        let max = self.state.config.max_sessions;
        if sessions.len() < max {
            return;
        }

        let mut candidates: Vec<(String, SessionStatus, DateTime<Utc>)> = sessions
            .values()
            .map(|s| (s.id.clone(), s.status, s.updated_at))
            .collect();
        candidates.sort_by(|a, b| {
            let a_active = a.1 == SessionStatus::Active;
            let b_active = b.1 == SessionStatus::Active;
            a_active.cmp(&b_active).then(a.2.cmp(&b.2))
        });

        let mut evicted = 0;
        for (id, _, _) in candidates {
            if sessions.len() < max {
                break;
            }
            sessions.remove(&id);
            evicted += 1;
        }
        if evicted > 0 {
            log::info!("Session cleanup evicted {} sessions", evicted);
        }
    }

    /// Drop completed/failed sessions whose last update is older than the
    /// given number of days. Returns how many were removed.
    pub async fn cleanup_old_sessions(&self, max_age_days: u32) -> usize {
        let cutoff = Utc::now() - ChronoDuration::days(i64::from(max_age_days));
        let mut sessions = self.state.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, s| s.status == SessionStatus::Active || s.updated_at >= cutoff);
        before - sessions.len()
    }

    /// Number of sessions currently held.
    pub async fn session_count(&self) -> usize {
        self.state.sessions.read().await.len()
    }

    /// Flush the journal immediately, bypassing the debounce.
    pub async fn save_to_file(&self) -> Result<(), SessionError> {
        flush(&self.state).await
    }

    /// Cancel any pending debounced save and flush once.
    pub async fn destroy(&self) {
        if let Some(handle) = self.state.pending_save.lock().unwrap().take() {
            handle.abort();
        }
        if let Err(err) = flush(&self.state).await {
            log::error!("Final session flush failed: {}", err);
        }
    }

    async fn set_status(
        &self,
        id: &str,
        status: SessionStatus,
        error: Option<String>,
    ) -> Result<(), SessionError> {
        if !is_valid_session_id(id) {
            return Err(SessionError::InvalidFormat(id.to_string()));
        }
        let mut sessions = self.state.sessions.write().await;
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        session.status = status;
        session.error = error;
        touch(session);
        drop(sessions);
        self.schedule_save();
        Ok(())
    }

    /// Coalescing writer: any save request (re)arms a single timer; the
    /// write happens once the window elapses with no further requests.
    fn schedule_save(&self) {
        if self.state.config.persist_path.is_none() {
            return;
        }
        let mut pending = self.state.pending_save.lock().unwrap();
        if let Some(handle) = pending.take() {
            handle.abort();
        }
        let state = self.state.clone();
        let debounce = Duration::from_millis(state.config.debounce_ms);
        *pending = Some(tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            if let Err(err) = flush(&state).await {
                log::error!("Debounced session save failed: {}", err);
            }
        }));
    }
}

fn touch(session: &mut Session) {
    let now = Utc::now();
    // updated_at is monotonic within a session even under clock jitter.
    session.updated_at = if now > session.updated_at {
        now
    } else {
        session.updated_at + ChronoDuration::milliseconds(1)
    };
}

async fn flush(state: &SessionState) -> Result<(), SessionError> {
    let Some(path) = &state.config.persist_path else {
        return Ok(());
    };

    let snapshot: Vec<Session> = {
        let sessions = state.sessions.read().await;
        let mut list: Vec<Session> = sessions.values().cloned().collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        list
    };

    let json = serde_json::to_string_pretty(&snapshot)
        .map_err(|e| SessionError::Io(e.to_string()))?;

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| SessionError::Io(e.to_string()))?;
    }

    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, json)
        .await
        .map_err(|e| SessionError::Io(e.to_string()))?;
    if let Err(err) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(SessionError::Io(err.to_string()));
    }
    log::trace!("Session journal flushed ({} sessions)", snapshot.len());
    Ok(())
}

fn load_journal(path: &PathBuf) -> Result<HashMap<String, Session>, SessionError> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(HashMap::new());
        }
        Err(err) => {
            quarantine(path);
            log::warn!("Cannot read session journal ({}); starting fresh", err);
            return Ok(HashMap::new());
        }
    };

    let records: Vec<Value> = match serde_json::from_str(&raw) {
        Ok(records) => records,
        Err(err) => {
            quarantine(path);
            log::warn!("Session journal is corrupt ({}); starting fresh", err);
            return Ok(HashMap::new());
        }
    };

    let mut sessions = HashMap::new();
    let mut skipped = 0;
    for record in records {
        match serde_json::from_value::<Session>(record) {
            Ok(session) if is_valid_session_id(&session.id) => {
                sessions.insert(session.id.clone(), session);
            }
            Ok(session) => {
                skipped += 1;
                log::warn!("Skipping session with malformed id '{}'", session.id);
            }
            Err(err) => {
                skipped += 1;
                log::warn!("Skipping invalid session record: {}", err);
            }
        }
    }
    if skipped > 0 {
        log::warn!("Dropped {} invalid session records on load", skipped);
    }
    Ok(sessions)
}

fn quarantine(path: &PathBuf) {
    let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3f");
    let dest = PathBuf::from(format!("{}.corrupted.{}", path.display(), stamp));
    if let Err(err) = std::fs::copy(path, &dest) {
        log::error!("Cannot quarantine corrupt journal: {}", err);
    } else {
        log::warn!("Corrupt session journal copied to {}", dest.display());
    }
}

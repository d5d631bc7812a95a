//! Durable, versioned multi-session persistence.
//!
//! The whole store is one JSON document written via temp-file + atomic
//! rename, so a crash mid-write never corrupts the previously-good file.
//! The prior good document is rotated to a `.bak` the loader can fall back
//! to, and a legacy single-session `state.json` from the predecessor tool
//! is migrated on first access.
//!
//! Persistence failures are logged and swallowed: losing one save is
//! recoverable (the next save retries), crashing mid-pipeline is not.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::session::SharedSession;
use tandem_core::{
    Config, Id, LogEntry, LogRole, ModelConfig, Session, Stage, StoreDoc, STORE_VERSION,
};

/// Directory under the project root holding all engine state.
pub const STORE_DIR: &str = ".tandem";

const STORE_FILE: &str = "sessions.json";
const TMP_FILE: &str = "sessions.json.tmp";
const BAK_FILE: &str = "sessions.json.bak";
const LEGACY_FILE: &str = "state.json";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("session not found: {0}")]
    NotFound(String),
    #[error("cannot delete the active session: {0}")]
    ActiveSession(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Store shared between the driver and the host's command handlers.
pub type SharedStore = Arc<Mutex<SessionStore>>;

/// Save a session snapshot through a shared store handle, swallowing both
/// lock poisoning and persistence failures.
pub fn save_snapshot(store: &SharedStore, session: &Session) {
    match store.lock() {
        Ok(mut store) => store.save(session),
        Err(_) => warn!("session store lock poisoned; save skipped"),
    }
}

/// Save the current state of a shared session cell.
pub fn save_shared(store: &SharedStore, session: &SharedSession) {
    save_snapshot(store, &session.snapshot());
}

/// Durable record of every pipeline session for one project.
#[derive(Debug)]
pub struct SessionStore {
    dir: PathBuf,
    doc: StoreDoc,
    max_sessions: usize,
    max_log_entries: usize,
}

impl SessionStore {
    /// Establish the storage location under the project root and load (or
    /// synthesize) the store document.
    pub fn initialize(project_root: &Path, config: &Config) -> Result<Self> {
        let dir = project_root.join(STORE_DIR);
        std::fs::create_dir_all(&dir)?;
        let doc = Self::load_doc(&dir);
        Ok(Self {
            dir,
            doc,
            max_sessions: config.max_sessions,
            max_log_entries: config.max_log_entries,
        })
    }

    fn load_doc(dir: &Path) -> StoreDoc {
        let target = dir.join(STORE_FILE);
        match Self::read_doc(&target) {
            Ok(Some(doc)) => return doc,
            Ok(None) => {}
            Err(err) => {
                warn!(error = %err, "store load failed; trying backup");
                match Self::read_doc(&dir.join(BAK_FILE)) {
                    Ok(Some(doc)) => return doc,
                    Ok(None) => {}
                    Err(err) => warn!(error = %err, "backup load failed"),
                }
            }
        }
        if let Some(session) = Self::migrate_legacy(dir) {
            info!(session = %session.id, "migrated legacy single-session state");
            return StoreDoc {
                version: STORE_VERSION,
                active_session_id: Some(session.id.clone()),
                sessions: vec![session],
            };
        }
        StoreDoc::default()
    }

    /// Read and validate a store document. `Ok(None)` means the file does
    /// not exist or carries a version this loader refuses to use.
    fn read_doc(path: &Path) -> Result<Option<StoreDoc>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(path)?;
        let doc: StoreDoc = serde_json::from_str(&content)?;
        if doc.version != STORE_VERSION {
            warn!(
                found = doc.version,
                expected = STORE_VERSION,
                "refusing store document with mismatched version"
            );
            return Ok(None);
        }
        Ok(Some(doc))
    }

    fn migrate_legacy(dir: &Path) -> Option<Session> {
        let path = dir.join(LEGACY_FILE);
        let content = std::fs::read_to_string(path).ok()?;
        let legacy: LegacyState = match serde_json::from_str(&content) {
            Ok(l) => l,
            Err(err) => {
                warn!(error = %err, "legacy state unreadable; starting empty");
                return None;
            }
        };
        Some(legacy.into_session())
    }

    /// Reuse the most recently created session when it is still empty
    /// (updating its model configuration); otherwise create a new one.
    pub fn get_or_create_session(&mut self, project_path: &str, models: ModelConfig) -> Session {
        let newest = self
            .doc
            .sessions
            .iter_mut()
            .max_by_key(|s| s.created_at);
        if let Some(session) = newest {
            if session.is_empty() {
                session.models = models;
                session.project_path = project_path.to_string();
                let reused = session.clone();
                self.doc.active_session_id = Some(reused.id.clone());
                self.persist_logged();
                return reused;
            }
        }

        let session = Session::new(project_path, models);
        self.doc.active_session_id = Some(session.id.clone());
        self.doc.sessions.push(session.clone());
        self.evict_over_capacity();
        self.persist_logged();
        session
    }

    /// Evict oldest-created sessions beyond capacity, sparing the active one.
    fn evict_over_capacity(&mut self) {
        while self.doc.sessions.len() > self.max_sessions {
            let active = self.doc.active_session_id.clone();
            let oldest = self
                .doc
                .sessions
                .iter()
                .filter(|s| Some(&s.id) != active.as_ref())
                .min_by_key(|s| s.created_at)
                .map(|s| s.id.clone());
            let Some(id) = oldest else { break };
            info!(session = %id, "evicting oldest session over capacity");
            self.doc.sessions.retain(|s| s.id != id);
        }
    }

    /// Upsert a session and persist the whole store atomically.
    pub fn save(&mut self, session: &Session) {
        let mut session = session.clone();
        session.truncate_log(self.max_log_entries);
        session.modified_at = Utc::now();

        match self.doc.sessions.iter_mut().find(|s| s.id == session.id) {
            Some(slot) => *slot = session,
            None => {
                self.doc.active_session_id = Some(session.id.clone());
                self.doc.sessions.push(session);
                self.evict_over_capacity();
            }
        }
        self.persist_logged();
    }

    /// The active session, if any.
    pub fn load(&self) -> Option<Session> {
        self.doc.active().cloned()
    }

    /// The most recently modified session that shows real progress.
    pub fn load_most_recently_modified(&self) -> Option<Session> {
        self.doc
            .sessions
            .iter()
            .filter(|s| !s.is_empty())
            .max_by_key(|s| s.modified_at)
            .cloned()
    }

    pub fn list_sessions(&self) -> &[Session] {
        &self.doc.sessions
    }

    pub fn active_session_id(&self) -> Option<&Id> {
        self.doc.active_session_id.as_ref()
    }

    /// Mark another session active.
    pub fn switch_session(&mut self, id: &Id) -> Result<Session> {
        let session = self
            .doc
            .sessions
            .iter()
            .find(|s| &s.id == id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        self.doc.active_session_id = Some(id.clone());
        self.persist_logged();
        Ok(session)
    }

    /// Delete a session. The active session is never deleted.
    pub fn delete_session(&mut self, id: &Id) -> Result<()> {
        if self.doc.active_session_id.as_ref() == Some(id) {
            return Err(StoreError::ActiveSession(id.to_string()));
        }
        let before = self.doc.sessions.len();
        self.doc.sessions.retain(|s| &s.id != id);
        if self.doc.sessions.len() == before {
            return Err(StoreError::NotFound(id.to_string()));
        }
        self.persist_logged();
        Ok(())
    }

    pub fn rename_session(&mut self, id: &Id, name: Option<String>) -> Result<()> {
        let session = self
            .doc
            .sessions
            .iter_mut()
            .find(|s| &s.id == id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        session.name = name;
        session.modified_at = Utc::now();
        self.persist_logged();
        Ok(())
    }

    /// Serialize to a temp file, rotate the current file to `.bak`, then
    /// rename the temp file over the target.
    fn persist(&self) -> Result<()> {
        let tmp = self.dir.join(TMP_FILE);
        let target = self.dir.join(STORE_FILE);
        let content = serde_json::to_string_pretty(&self.doc)?;
        std::fs::write(&tmp, content)?;
        if target.exists() {
            // Best effort; the atomic rename below is what matters.
            let _ = std::fs::rename(&target, self.dir.join(BAK_FILE));
        }
        std::fs::rename(&tmp, &target)?;
        Ok(())
    }

    fn persist_logged(&self) {
        if let Err(err) = self.persist() {
            warn!(error = %err, "session store save failed");
        }
    }
}

// --- Legacy single-session format (predecessor tool) ---

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyState {
    project_path: String,
    #[serde(default)]
    codex_thread_id: Option<String>,
    #[serde(default)]
    claude_session_id: Option<String>,
    #[serde(default)]
    stage: Option<Stage>,
    #[serde(default)]
    paused_at: Option<Stage>,
    #[serde(default)]
    spec: Option<String>,
    #[serde(default)]
    plan: Option<String>,
    #[serde(default)]
    feedback: Option<String>,
    #[serde(default)]
    plan_reviews: u32,
    #[serde(default)]
    impl_reviews: u32,
    #[serde(default)]
    log: Vec<LegacyLogEntry>,
    /// Epoch milliseconds in the legacy format.
    #[serde(default)]
    started_at: Option<i64>,
    #[serde(default)]
    codex_ms: u64,
    #[serde(default)]
    claude_ms: u64,
    #[serde(default)]
    cancelled: bool,
    #[serde(default)]
    auto_approve: bool,
}

#[derive(Debug, Deserialize)]
struct LegacyLogEntry {
    role: String,
    content: String,
    #[serde(default)]
    ts: Option<String>,
}

impl LegacyState {
    fn into_session(self) -> Session {
        let models = ModelConfig::default();
        let mut session = Session::new(self.project_path, models);
        // Legacy continuity tokens were keyed by agent kind; the default
        // role mapping puts claude on planning and codex on review.
        session.planner_thread = self.claude_session_id;
        session.reviewer_thread = self.codex_thread_id;
        session.restore_position(self.stage.unwrap_or(Stage::Idle), self.paused_at);
        session.spec = self.spec;
        session.plan = self.plan;
        session.feedback = self.feedback;
        session.plan_reviews = self.plan_reviews;
        session.impl_reviews = self.impl_reviews;
        session.log = self
            .log
            .into_iter()
            .filter_map(|entry| {
                let role = match entry.role.as_str() {
                    "user" => LogRole::User,
                    "claude" => LogRole::Claude,
                    "codex" => LogRole::Codex,
                    _ => return None,
                };
                let timestamp = entry
                    .ts
                    .as_deref()
                    .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
                    .map_or_else(Utc::now, |dt| dt.with_timezone(&Utc));
                Some(LogEntry {
                    role,
                    content: entry.content,
                    timestamp,
                })
            })
            .collect();
        session.started_at = self
            .started_at
            .and_then(|ms| DateTime::from_timestamp_millis(ms))
            .or(session.started_at);
        session.claude_ms = self.claude_ms;
        session.codex_ms = self.codex_ms;
        session.cancelled = self.cancelled;
        session.auto_approve = self.auto_approve;
        session
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_core::AgentKind;
    use tempfile::TempDir;

    fn store_in(dir: &TempDir) -> SessionStore {
        SessionStore::initialize(dir.path(), &Config::default()).unwrap()
    }

    fn small_store(dir: &TempDir, max_sessions: usize) -> SessionStore {
        let mut config = Config::default();
        config.max_sessions = max_sessions;
        SessionStore::initialize(dir.path(), &config).unwrap()
    }

    #[test]
    fn save_and_reload_roundtrips() {
        let dir = TempDir::new().unwrap();
        let mut store = store_in(&dir);
        let mut session = store.get_or_create_session("/tmp/p", ModelConfig::default());
        session.spec = Some("# A task".into());
        session.record(LogRole::User, "build it");
        store.save(&session);

        let reloaded_store = store_in(&dir);
        let loaded = reloaded_store.load().unwrap();
        assert_eq!(loaded.id, session.id);
        assert_eq!(loaded.spec, session.spec);
        assert_eq!(loaded.log, session.log);
        assert!(loaded.modified_at >= session.modified_at);
    }

    #[test]
    fn empty_session_is_reused_not_proliferated() {
        let dir = TempDir::new().unwrap();
        let mut store = store_in(&dir);
        let first = store.get_or_create_session("/tmp/p", ModelConfig::default());
        let models = ModelConfig {
            planner: AgentKind::Codex,
            reviewer: AgentKind::Codex,
        };
        let second = store.get_or_create_session("/tmp/p", models);
        assert_eq!(first.id, second.id);
        assert_eq!(second.models, models);
        assert_eq!(store.list_sessions().len(), 1);
    }

    #[test]
    fn sessions_with_progress_are_not_reused() {
        let dir = TempDir::new().unwrap();
        let mut store = store_in(&dir);
        let mut first = store.get_or_create_session("/tmp/p", ModelConfig::default());
        first.record(LogRole::User, "hello");
        store.save(&first);
        let second = store.get_or_create_session("/tmp/p", ModelConfig::default());
        assert_ne!(first.id, second.id);
        assert_eq!(store.list_sessions().len(), 2);
    }

    #[test]
    fn capacity_evicts_oldest_first() {
        let dir = TempDir::new().unwrap();
        let mut store = small_store(&dir, 2);

        let mut a = store.get_or_create_session("/tmp/p", ModelConfig::default());
        a.record(LogRole::User, "a");
        store.save(&a);
        let mut b = store.get_or_create_session("/tmp/p", ModelConfig::default());
        b.record(LogRole::User, "b");
        store.save(&b);
        let c = store.get_or_create_session("/tmp/p", ModelConfig::default());

        let ids: Vec<_> = store.list_sessions().iter().map(|s| s.id.clone()).collect();
        assert_eq!(ids.len(), 2);
        assert!(!ids.contains(&a.id), "oldest session evicted");
        assert!(ids.contains(&b.id));
        assert!(ids.contains(&c.id));
    }

    #[test]
    fn active_session_is_never_evicted() {
        let dir = TempDir::new().unwrap();
        // Zero capacity: eviction would remove everything, but the active
        // session must survive.
        let mut store = small_store(&dir, 0);
        let session = store.get_or_create_session("/tmp/p", ModelConfig::default());
        assert_eq!(store.list_sessions().len(), 1);
        assert_eq!(store.load().unwrap().id, session.id);
    }

    #[test]
    fn delete_refuses_active_session() {
        let dir = TempDir::new().unwrap();
        let mut store = store_in(&dir);
        let session = store.get_or_create_session("/tmp/p", ModelConfig::default());
        assert!(matches!(
            store.delete_session(&session.id),
            Err(StoreError::ActiveSession(_))
        ));
    }

    #[test]
    fn switch_delete_and_rename() {
        let dir = TempDir::new().unwrap();
        let mut store = store_in(&dir);
        let mut a = store.get_or_create_session("/tmp/p", ModelConfig::default());
        a.record(LogRole::User, "a");
        store.save(&a);
        let b = store.get_or_create_session("/tmp/p", ModelConfig::default());

        store.rename_session(&a.id, Some("first attempt".into())).unwrap();
        let renamed = store.switch_session(&a.id).unwrap();
        assert_eq!(renamed.name.as_deref(), Some("first attempt"));

        store.delete_session(&b.id).unwrap();
        assert_eq!(store.list_sessions().len(), 1);
        assert!(matches!(
            store.delete_session(&b.id),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn log_truncated_to_cap_on_save() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.max_log_entries = 5;
        let mut store = SessionStore::initialize(dir.path(), &config).unwrap();
        let mut session = store.get_or_create_session("/tmp/p", ModelConfig::default());
        for i in 0..20 {
            session.record(LogRole::User, format!("msg {i}"));
        }
        store.save(&session);
        let loaded = store.load().unwrap();
        assert_eq!(loaded.log.len(), 5);
        assert_eq!(loaded.log[0].content, "msg 15");
    }

    #[test]
    fn corrupt_primary_falls_back_to_backup() {
        let dir = TempDir::new().unwrap();
        let mut store = store_in(&dir);
        let mut session = store.get_or_create_session("/tmp/p", ModelConfig::default());
        session.spec = Some("kept".into());
        store.save(&session);
        // A second save rotates the good document into the backup.
        store.save(&session);

        std::fs::write(dir.path().join(STORE_DIR).join(STORE_FILE), "{ not json").unwrap();
        let recovered = store_in(&dir);
        assert_eq!(recovered.load().unwrap().spec.as_deref(), Some("kept"));
    }

    #[test]
    fn version_mismatch_refuses_document() {
        let dir = TempDir::new().unwrap();
        let store_dir = dir.path().join(STORE_DIR);
        std::fs::create_dir_all(&store_dir).unwrap();
        std::fs::write(
            store_dir.join(STORE_FILE),
            r#"{"version": 99, "active_session_id": null, "sessions": []}"#,
        )
        .unwrap();
        let store = store_in(&dir);
        assert!(store.list_sessions().is_empty());
        assert!(store.load().is_none());
    }

    #[test]
    fn legacy_single_session_state_is_migrated() {
        let dir = TempDir::new().unwrap();
        let store_dir = dir.path().join(STORE_DIR);
        std::fs::create_dir_all(&store_dir).unwrap();
        std::fs::write(
            store_dir.join(LEGACY_FILE),
            r#"{
                "projectPath": "/old/project",
                "codexThreadId": "thread-1",
                "claudeSessionId": "sess-1",
                "stage": "PAUSED",
                "pausedAt": "IMPLEMENT",
                "spec": "old spec",
                "plan": "old plan",
                "feedback": null,
                "planReviews": 2,
                "implReviews": 0,
                "log": [
                    {"role": "user", "content": "hi", "ts": "2024-05-01T10:00:00Z"},
                    {"role": "codex", "content": "ok"}
                ],
                "startedAt": 1714557600000,
                "codexMs": 1200,
                "claudeMs": 3400,
                "cancelled": false,
                "autoApprove": true
            }"#,
        )
        .unwrap();

        let store = store_in(&dir);
        let session = store.load().expect("migrated session is active");
        assert_eq!(session.project_path, "/old/project");
        assert_eq!(session.reviewer_thread.as_deref(), Some("thread-1"));
        assert_eq!(session.planner_thread.as_deref(), Some("sess-1"));
        assert_eq!(session.stage(), Stage::Paused);
        assert_eq!(session.paused_at(), Some(Stage::Implement));
        assert_eq!(session.spec.as_deref(), Some("old spec"));
        assert_eq!(session.plan_reviews, 2);
        assert_eq!(session.log.len(), 2);
        assert_eq!(session.log[1].role, LogRole::Codex);
        assert_eq!(session.claude_ms, 3400);
        assert!(session.auto_approve);
    }

    #[test]
    fn load_most_recently_modified_skips_empty_sessions() {
        let dir = TempDir::new().unwrap();
        let mut store = store_in(&dir);
        let mut with_progress = store.get_or_create_session("/tmp/p", ModelConfig::default());
        with_progress.record(LogRole::User, "work");
        store.save(&with_progress);
        // Freshly created empty session is newer but shows no progress.
        let empty = store.get_or_create_session("/tmp/p", ModelConfig::default());
        assert_ne!(empty.id, with_progress.id);

        let loaded = store.load_most_recently_modified().unwrap();
        assert_eq!(loaded.id, with_progress.id);
    }
}

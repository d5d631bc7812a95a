//! Core types for the pipeline engine.
//!
//! The session is the unit of persisted pipeline state; its `stage` and
//! `paused_at` fields are private so that every stage change goes through
//! the guarded transition methods below.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for sessions.
/// Uses `UUIDv7` for time-ordered lexicographic sorting.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(pub String);

impl Id {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Id {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// The two interchangeable external reasoning agents.
///
/// The variant name doubles as the name of the executable to spawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    Claude,
    Codex,
}

impl AgentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Claude => "claude",
            Self::Codex => "codex",
        }
    }

    /// Name of the external binary for this agent kind.
    pub fn binary(&self) -> &'static str {
        self.as_str()
    }
}

impl std::fmt::Display for AgentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which agent kind plays which role in the pipeline.
///
/// Planner generates (plan, implementation, commit); reviewer reviews and
/// distills the spec. The two roles may be served by the same kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub planner: AgentKind,
    pub reviewer: AgentKind,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            planner: AgentKind::Claude,
            reviewer: AgentKind::Codex,
        }
    }
}

/// Pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    Idle,
    Spec,
    Plan,
    PlanReview,
    Implement,
    ImplReview,
    Commit,
    Done,
    Paused,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Spec => "SPEC",
            Self::Plan => "PLAN",
            Self::PlanReview => "PLAN_REVIEW",
            Self::Implement => "IMPLEMENT",
            Self::ImplReview => "IMPL_REVIEW",
            Self::Commit => "COMMIT",
            Self::Done => "DONE",
            Self::Paused => "PAUSED",
        }
    }

    /// Allowed targets for a transition out of this stage.
    pub fn allowed_transitions(&self) -> &'static [Stage] {
        match self {
            Self::Idle => &[Stage::Spec],
            Self::Spec => &[Stage::Plan],
            Self::Plan => &[Stage::PlanReview],
            Self::PlanReview => &[Stage::Plan, Stage::Implement, Stage::Paused],
            Self::Implement => &[Stage::ImplReview],
            Self::ImplReview => &[Stage::Implement, Stage::Commit, Stage::Paused],
            Self::Commit => &[Stage::Done],
            Self::Paused => &[Stage::Plan, Stage::Implement, Stage::Commit, Stage::Idle],
            Self::Done => &[Stage::Idle],
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which half of the review/gate loop is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Plan,
    Impl,
}

impl Phase {
    /// Stage entered when this phase's artifact is (re)generated.
    pub fn generation_stage(&self) -> Stage {
        match self {
            Self::Plan => Stage::Plan,
            Self::Impl => Stage::Implement,
        }
    }

    /// Stage entered while this phase's artifact is under review.
    pub fn review_stage(&self) -> Stage {
        match self {
            Self::Plan => Stage::PlanReview,
            Self::Impl => Stage::ImplReview,
        }
    }

    /// Stage entered once this phase's artifact is approved.
    pub fn approved_stage(&self) -> Stage {
        match self {
            Self::Plan => Stage::Implement,
            Self::Impl => Stage::Commit,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Plan => "PLAN",
            Self::Impl => "IMPLEMENT",
        }
    }

    pub fn review_label(&self) -> &'static str {
        match self {
            Self::Plan => "PLAN REVIEW",
            Self::Impl => "CODE REVIEW",
        }
    }
}

/// Who authored a conversation log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogRole {
    User,
    Claude,
    Codex,
}

impl From<AgentKind> for LogRole {
    fn from(kind: AgentKind) -> Self {
        match kind {
            AgentKind::Claude => Self::Claude,
            AgentKind::Codex => Self::Codex,
        }
    }
}

impl LogRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Claude => "claude",
            Self::Codex => "codex",
        }
    }
}

/// One entry in the session's conversation log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub role: LogRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// One complete, persisted run of the pipeline against one project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: Id,
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    /// Filesystem root the agents operate on.
    pub project_path: String,
    /// Continuity token for the planner role's agent.
    pub planner_thread: Option<String>,
    /// Continuity token for the reviewer role's agent.
    pub reviewer_thread: Option<String>,
    stage: Stage,
    /// Stage to resume into; set only while `stage == Paused`.
    paused_at: Option<Stage>,
    pub spec: Option<String>,
    pub plan: Option<String>,
    /// Pending revision note fed into the next generation call.
    pub feedback: Option<String>,
    pub plan_reviews: u32,
    pub impl_reviews: u32,
    pub log: Vec<LogEntry>,
    pub started_at: Option<DateTime<Utc>>,
    pub claude_ms: u64,
    pub codex_ms: u64,
    pub cancelled: bool,
    pub pause_requested: bool,
    pub auto_approve: bool,
    pub models: ModelConfig,
}

impl Session {
    pub fn new(project_path: impl Into<String>, models: ModelConfig) -> Self {
        let now = Utc::now();
        Self {
            id: Id::new(),
            name: None,
            created_at: now,
            modified_at: now,
            project_path: project_path.into(),
            planner_thread: None,
            reviewer_thread: None,
            stage: Stage::Idle,
            paused_at: None,
            spec: None,
            plan: None,
            feedback: None,
            plan_reviews: 0,
            impl_reviews: 0,
            log: Vec::new(),
            started_at: Some(now),
            claude_ms: 0,
            codex_ms: 0,
            cancelled: false,
            pause_requested: false,
            auto_approve: false,
            models,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn paused_at(&self) -> Option<Stage> {
        self.paused_at
    }

    /// Request a stage transition.
    ///
    /// Requests outside the transition table are rejected: the attempt is
    /// logged and the state left unchanged. Re-requesting the current stage
    /// is an idempotent success (resumed sessions re-enter their generation
    /// stage without an edge for it).
    pub fn transition_to(&mut self, next: Stage) -> bool {
        if next == self.stage {
            return true;
        }
        if !self.stage.allowed_transitions().contains(&next) {
            tracing::warn!(
                session = %self.id,
                from = %self.stage,
                to = %next,
                "invalid stage transition rejected"
            );
            return false;
        }
        if self.stage == Stage::Paused {
            self.paused_at = None;
        }
        self.stage = next;
        true
    }

    /// Enter `Paused` from a review point, recording where to resume.
    pub fn pause_to(&mut self, resume_to: Stage) -> bool {
        if !self.transition_to(Stage::Paused) {
            return false;
        }
        self.paused_at = Some(resume_to);
        true
    }

    /// Host-initiated pause. Routes to `Paused` through the nearest review
    /// point so every stage change stays on the transition table.
    ///
    /// Returns `false` when the current stage has no pause route
    /// (`Idle`, `Done`, `Commit`).
    pub fn interrupt(&mut self) -> bool {
        match self.stage {
            Stage::Paused => true,
            Stage::Idle | Stage::Done | Stage::Commit => false,
            Stage::Spec => {
                self.transition_to(Stage::Plan)
                    && self.transition_to(Stage::PlanReview)
                    && self.pause_to(Stage::Plan)
            }
            Stage::Plan => self.transition_to(Stage::PlanReview) && self.pause_to(Stage::Plan),
            Stage::PlanReview => self.pause_to(Stage::Plan),
            Stage::Implement => {
                self.transition_to(Stage::ImplReview) && self.pause_to(Stage::Implement)
            }
            Stage::ImplReview => self.pause_to(Stage::Implement),
        }
    }

    /// Leave `Paused` for the recorded resume stage, clearing interrupt flags.
    ///
    /// Returns the stage resumed into, or `None` when there is nothing to
    /// resume.
    pub fn resume(&mut self) -> Option<Stage> {
        if self.stage != Stage::Paused {
            return None;
        }
        let target = self.paused_at?;
        if !self.transition_to(target) {
            return None;
        }
        self.paused_at = None;
        self.cancelled = false;
        self.pause_requested = false;
        Some(target)
    }

    /// Failure rollback: force the session back to `Idle`.
    ///
    /// This is the driver's outer-catch primitive, not a transition request.
    pub fn reset_to_idle(&mut self) {
        self.stage = Stage::Idle;
        self.paused_at = None;
    }

    /// Restore a persisted pipeline position without a transition request.
    ///
    /// Used by store migration; the `paused_at` invariant is enforced.
    pub fn restore_position(&mut self, stage: Stage, paused_at: Option<Stage>) {
        self.stage = stage;
        self.paused_at = if stage == Stage::Paused { paused_at } else { None };
    }

    /// Continuity token held for the given agent kind, resolved through the
    /// role mapping.
    pub fn thread_for(&self, kind: AgentKind) -> Option<&str> {
        if self.models.planner == kind {
            self.planner_thread.as_deref()
        } else if self.models.reviewer == kind {
            self.reviewer_thread.as_deref()
        } else {
            None
        }
    }

    /// Record a fresh continuity token for the given agent kind. When both
    /// roles are served by the same kind, both tokens are updated.
    pub fn set_thread_for(&mut self, kind: AgentKind, token: impl Into<String>) {
        let token = token.into();
        if self.models.planner == kind {
            self.planner_thread = Some(token.clone());
        }
        if self.models.reviewer == kind {
            self.reviewer_thread = Some(token);
        }
    }

    /// Full reset to a pristine session (keeps identity and project path).
    pub fn reset(&mut self) {
        self.reset_to_idle();
        self.spec = None;
        self.plan = None;
        self.feedback = None;
        self.plan_reviews = 0;
        self.impl_reviews = 0;
        self.log.clear();
        self.planner_thread = None;
        self.reviewer_thread = None;
        self.started_at = Some(Utc::now());
        self.claude_ms = 0;
        self.codex_ms = 0;
        self.cancelled = false;
        self.pause_requested = false;
    }

    /// A session with no stage progress, log, artifacts, or continuity
    /// tokens. Empty sessions are reused instead of proliferated.
    pub fn is_empty(&self) -> bool {
        self.stage == Stage::Idle
            && self.log.is_empty()
            && self.spec.is_none()
            && self.plan.is_none()
            && self.planner_thread.is_none()
            && self.reviewer_thread.is_none()
    }

    /// True when the pipeline should stop at the next checkpoint.
    pub fn halt_requested(&self) -> bool {
        self.cancelled || self.pause_requested || self.stage == Stage::Paused
    }

    pub fn record(&mut self, role: LogRole, content: impl Into<String>) {
        self.log.push(LogEntry {
            role,
            content: content.into(),
            timestamp: Utc::now(),
        });
    }

    pub fn add_elapsed(&mut self, kind: AgentKind, ms: u64) {
        match kind {
            AgentKind::Claude => self.claude_ms += ms,
            AgentKind::Codex => self.codex_ms += ms,
        }
    }

    /// Truncate the conversation log to the configured cap, oldest first.
    pub fn truncate_log(&mut self, max_entries: usize) {
        if self.log.len() > max_entries {
            let drop = self.log.len() - max_entries;
            self.log.drain(..drop);
        }
    }
}

/// Current version of the persisted store document.
pub const STORE_VERSION: u32 = 1;

/// The persisted multi-session store document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreDoc {
    pub version: u32,
    pub active_session_id: Option<Id>,
    pub sessions: Vec<Session>,
}

impl Default for StoreDoc {
    fn default() -> Self {
        Self {
            version: STORE_VERSION,
            active_session_id: None,
            sessions: Vec::new(),
        }
    }
}

impl StoreDoc {
    /// The session currently marked active, if any.
    pub fn active(&self) -> Option<&Session> {
        let id = self.active_session_id.as_ref()?;
        self.sessions.iter().find(|s| &s.id == id)
    }
}

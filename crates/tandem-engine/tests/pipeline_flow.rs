//! End-to-end driver scenarios against stubbed agents.

use std::collections::VecDeque;
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::mpsc::unbounded_channel;

use tandem_core::{
    AgentKind, Config, LogRole, ModelConfig, PipelineOutcome, Stage,
};
use tandem_engine::runner::Result as RunnerResult;
use tandem_engine::{
    commands, run_pipeline, AgentExec, AgentReply, NoopNotifier, PipelineCtx, RunOptions,
    RunnerError, SessionStore, SharedSession,
};

const APPROVE: &str = r#"{"approved":true,"action":"approve","feedback":"ok"}"#;
const REVISE: &str =
    r#"{"approved":false,"action":"revise","feedback":"tighten it","changes":["step 2"]}"#;

/// Stub agent pair routed by prompt shape. Gate restatements pop from a
/// queue, repeating `default_gate` once drained.
struct StubAgents {
    default_gate: String,
    gate_verdicts: Mutex<VecDeque<String>>,
    calls: AtomicUsize,
    plan_calls: AtomicUsize,
    impl_calls: AtomicUsize,
    commit_calls: AtomicUsize,
    /// When set, flips `cancelled` on this session during the spec call.
    cancel_on_spec: Mutex<Option<SharedSession>>,
    fail_on_plan: bool,
}

impl StubAgents {
    fn with_gate(default_gate: &str) -> Self {
        Self {
            default_gate: default_gate.to_string(),
            gate_verdicts: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
            plan_calls: AtomicUsize::new(0),
            impl_calls: AtomicUsize::new(0),
            commit_calls: AtomicUsize::new(0),
            cancel_on_spec: Mutex::new(None),
            fail_on_plan: false,
        }
    }

    fn approving() -> Self {
        Self::with_gate(APPROVE)
    }

    fn revising() -> Self {
        Self::with_gate(REVISE)
    }
}

#[async_trait]
impl AgentExec for StubAgents {
    async fn run(
        &self,
        kind: AgentKind,
        prompt: &str,
        _opts: RunOptions,
    ) -> RunnerResult<AgentReply> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let text = if prompt.starts_with("Distill") {
            if let Some(session) = self.cancel_on_spec.lock().unwrap().as_ref() {
                session.update(|s| s.cancelled = true);
            }
            "# Build a widget\nStub specification.".to_string()
        } else if prompt.starts_with("Write a step-by-step") {
            if self.fail_on_plan {
                return Err(RunnerError::Failed {
                    kind,
                    detail: "stub planner crashed".into(),
                });
            }
            self.plan_calls.fetch_add(1, Ordering::SeqCst);
            "1. carve the widget\n2. polish it".to_string()
        } else if prompt.starts_with("Implement the plan") {
            self.impl_calls.fetch_add(1, Ordering::SeqCst);
            "implemented the widget".to_string()
        } else if prompt.starts_with("Review this implementation plan") {
            "VERDICT: APPROVE\nplan looks right".to_string()
        } else if prompt.starts_with("Review this implementation against") {
            "VERDICT: APPROVE\ncode looks right".to_string()
        } else if prompt.starts_with("Restate the review") {
            let mut queue = self.gate_verdicts.lock().unwrap();
            queue
                .pop_front()
                .unwrap_or_else(|| self.default_gate.clone())
        } else if prompt.starts_with("Stage and commit") {
            self.commit_calls.fetch_add(1, Ordering::SeqCst);
            "committed".to_string()
        } else {
            format!("echo: {prompt}")
        };
        Ok(AgentReply {
            full_text: text.clone(),
            text,
            continuity: Some(format!("{kind}-thread")),
        })
    }
}

fn make_ctx(
    dir: &TempDir,
    agents: Arc<dyn AgentExec>,
    config: Config,
    auto_approve: bool,
) -> PipelineCtx {
    let mut store = SessionStore::initialize(dir.path(), &config).unwrap();
    let mut session =
        store.get_or_create_session(dir.path().to_str().unwrap(), ModelConfig::default());
    session.record(LogRole::User, "build a widget");
    session.auto_approve = auto_approve;
    store.save(&session);
    PipelineCtx {
        config,
        agents,
        session: SharedSession::new(session),
        store: Arc::new(Mutex::new(store)),
        notifier: Arc::new(NoopNotifier),
        messages: unbounded_channel().0,
        agent_events: None,
    }
}

fn init_git_repo(dir: &TempDir) {
    for args in [
        vec!["init"],
        vec!["config", "user.email", "test@test.com"],
        vec!["config", "user.name", "Test"],
    ] {
        Command::new("git")
            .args(&args)
            .current_dir(dir.path())
            .output()
            .unwrap();
    }
    std::fs::write(dir.path().join("README.md"), "# Widget").unwrap();
    Command::new("git")
        .args(["add", "."])
        .current_dir(dir.path())
        .output()
        .unwrap();
    Command::new("git")
        .args(["commit", "-m", "Initial commit"])
        .current_dir(dir.path())
        .output()
        .unwrap();
}

#[tokio::test]
async fn manual_plan_approval_pauses_then_accept_resumes() {
    let dir = TempDir::new().unwrap();
    let agents = Arc::new(StubAgents::approving());
    let ctx = make_ctx(&dir, Arc::clone(&agents) as Arc<dyn AgentExec>, Config::default(), false);

    let outcome = run_pipeline(&ctx).await;
    match outcome {
        PipelineOutcome::Paused { question } => assert!(question.contains("PLAN approved")),
        other => panic!("expected paused, got {other:?}"),
    }

    let snap = ctx.session.snapshot();
    assert_eq!(snap.stage(), Stage::Paused);
    assert_eq!(snap.paused_at(), Some(Stage::Implement));
    assert!(snap.spec.is_some());
    assert!(snap.plan.is_some());
    assert_eq!(snap.plan_reviews, 1);
    // Continuity tokens flowed back into the role slots.
    assert_eq!(snap.planner_thread.as_deref(), Some("claude-thread"));
    assert_eq!(snap.reviewer_thread.as_deref(), Some("codex-thread"));

    // The pause survived persistence.
    let persisted = ctx.store.lock().unwrap().load().unwrap();
    assert_eq!(persisted.stage(), Stage::Paused);
    assert_eq!(persisted.paused_at(), Some(Stage::Implement));

    // Human accepts; the driver resumes into implementation and pauses
    // again at the commit gate.
    let stage = commands::accept(&ctx.session, &ctx.store).unwrap();
    assert_eq!(stage, Stage::Implement);
    assert_eq!(ctx.session.snapshot().paused_at(), None);

    let outcome = run_pipeline(&ctx).await;
    match outcome {
        PipelineOutcome::Paused { question } => assert!(question.contains("IMPLEMENT approved")),
        other => panic!("expected paused, got {other:?}"),
    }
    let snap = ctx.session.snapshot();
    assert_eq!(snap.stage(), Stage::Paused);
    assert_eq!(snap.paused_at(), Some(Stage::Commit));
    assert_eq!(agents.impl_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn auto_approve_runs_to_done() {
    let dir = TempDir::new().unwrap();
    init_git_repo(&dir);
    // Leave an uncommitted change for the commit stage to pick up.
    std::fs::write(dir.path().join("widget.rs"), "pub struct Widget;").unwrap();

    let agents = Arc::new(StubAgents::approving());
    let ctx = make_ctx(&dir, Arc::clone(&agents) as Arc<dyn AgentExec>, Config::default(), true);

    let outcome = run_pipeline(&ctx).await;
    assert_eq!(outcome, PipelineOutcome::Done);

    let snap = ctx.session.snapshot();
    assert_eq!(snap.stage(), Stage::Done);
    assert_eq!(snap.plan_reviews, 1);
    assert_eq!(snap.impl_reviews, 1);
    assert_eq!(agents.plan_calls.load(Ordering::SeqCst), 1);
    assert_eq!(agents.impl_calls.load(Ordering::SeqCst), 1);
    assert_eq!(agents.commit_calls.load(Ordering::SeqCst), 1);
    // Agent time was accounted to both kinds.
    assert!(snap.claude_ms > 0 || snap.codex_ms > 0);
}

#[tokio::test]
async fn revise_verdicts_exhaust_budget_and_pause() {
    let dir = TempDir::new().unwrap();
    let agents = Arc::new(StubAgents::revising());
    let mut config = Config::default();
    config.max_reviews = 2;
    let ctx = make_ctx(&dir, Arc::clone(&agents) as Arc<dyn AgentExec>, config, true);

    let outcome = run_pipeline(&ctx).await;
    match outcome {
        PipelineOutcome::Paused { question } => assert!(question.contains("Max reviews (2)")),
        other => panic!("expected paused, got {other:?}"),
    }

    let snap = ctx.session.snapshot();
    assert_eq!(snap.stage(), Stage::Paused);
    assert_eq!(snap.paused_at(), Some(Stage::Plan));
    assert_eq!(snap.plan_reviews, 2);
    assert_eq!(agents.plan_calls.load(Ordering::SeqCst), 2);
    // The pending feedback from the last revise verdict is kept for the
    // next generation, itemized changes included.
    let feedback = snap.feedback.unwrap();
    assert!(feedback.contains("tighten it"));
    assert!(feedback.contains("- step 2"));
}

#[tokio::test]
async fn cancellation_at_checkpoint_stops_further_calls() {
    let dir = TempDir::new().unwrap();
    let agents = Arc::new(StubAgents::approving());
    let ctx = make_ctx(&dir, Arc::clone(&agents) as Arc<dyn AgentExec>, Config::default(), true);
    *agents.cancel_on_spec.lock().unwrap() = Some(ctx.session.clone());

    let outcome = run_pipeline(&ctx).await;
    assert_eq!(
        outcome,
        PipelineOutcome::Paused {
            question: "Pipeline cancelled.".into()
        }
    );
    // Only the spec call went out; the checkpoint halted the loop before
    // any generation or review call.
    assert_eq!(agents.calls.load(Ordering::SeqCst), 1);
    let snap = ctx.session.snapshot();
    assert_eq!(snap.stage(), Stage::Paused);
    assert_eq!(snap.paused_at(), Some(Stage::Plan));
}

#[tokio::test]
async fn agent_failure_rolls_back_to_idle() {
    let dir = TempDir::new().unwrap();
    let mut agents = StubAgents::approving();
    agents.fail_on_plan = true;
    let agents = Arc::new(agents);
    let ctx = make_ctx(&dir, Arc::clone(&agents) as Arc<dyn AgentExec>, Config::default(), true);

    let outcome = run_pipeline(&ctx).await;
    match outcome {
        PipelineOutcome::Error { message } => assert!(message.contains("stub planner crashed")),
        other => panic!("expected error, got {other:?}"),
    }
    let snap = ctx.session.snapshot();
    assert_eq!(snap.stage(), Stage::Idle);
    assert_eq!(snap.paused_at(), None);
    // The rollback was persisted.
    let persisted = ctx.store.lock().unwrap().load().unwrap();
    assert_eq!(persisted.stage(), Stage::Idle);
}

#[tokio::test]
async fn commit_outside_git_repo_fails_cleanly() {
    let dir = TempDir::new().unwrap();
    let agents = Arc::new(StubAgents::approving());
    let ctx = make_ctx(&dir, Arc::clone(&agents) as Arc<dyn AgentExec>, Config::default(), true);

    let outcome = run_pipeline(&ctx).await;
    match outcome {
        PipelineOutcome::Error { message } => assert!(message.contains("not a git repository")),
        other => panic!("expected error, got {other:?}"),
    }
    assert_eq!(ctx.session.snapshot().stage(), Stage::Idle);
    assert_eq!(agents.commit_calls.load(Ordering::SeqCst), 0);
}

//! Host-facing session operations.
//!
//! These are the narrow entry points a hosting application calls between
//! (or during) driver runs: pause, cancel, resume, accept, reset,
//! conversation recording, one-off agent questions, and project context
//! initialization. The host is responsible for serializing them against a
//! running pipeline; each operation mutates through the shared session
//! cell so an in-flight loop observes the change at its next checkpoint.

use std::path::Path;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::info;

use crate::runner::{AgentExec, RunOptions, RunnerError, RunnerRegistry};
use crate::session::SharedSession;
use crate::store::{save_shared, SharedStore};
use tandem_core::prompt::{init_claude_prompt, init_codex_prompt};
use tandem_core::{AgentKind, LogRole, Stage};

/// Bounded wait for cancelled agent processes to die.
const KILL_WAIT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum CommandError {
    /// Nothing to do; no state was changed.
    #[error("{0}")]
    Precondition(String),
    #[error(transparent)]
    Runner(#[from] RunnerError),
}

pub type Result<T> = std::result::Result<T, CommandError>;

fn precondition<T>(msg: &str) -> Result<T> {
    Err(CommandError::Precondition(msg.to_string()))
}

/// Request a cooperative pause after the current step.
pub fn pause(session: &SharedSession) -> Result<String> {
    let snap = session.snapshot();
    match snap.stage() {
        Stage::Idle | Stage::Done => precondition("Nothing running to pause."),
        Stage::Paused => precondition("Already paused."),
        _ => {
            session.update(|s| s.pause_requested = true);
            Ok("Pausing after current step...".to_string())
        }
    }
}

/// Cancel the run: set the flag, force-kill every registered agent
/// process (waiting for confirmed exits), and park the session.
pub async fn cancel(
    session: &SharedSession,
    store: &SharedStore,
    registry: &RunnerRegistry,
) -> Result<String> {
    let snap = session.snapshot();
    if matches!(snap.stage(), Stage::Idle | Stage::Done) {
        return precondition("Nothing running to cancel.");
    }
    session.update(|s| {
        s.cancelled = true;
        s.interrupt();
    });
    registry.kill_all_and_wait(KILL_WAIT).await;
    save_shared(store, session);
    Ok("Cancelling...".to_string())
}

/// Resume a paused session into its recorded stage. The caller re-runs the
/// driver afterwards.
pub fn resume(session: &SharedSession, store: &SharedStore) -> Result<Stage> {
    let resumed = session.update(|s| s.resume());
    match resumed {
        Some(stage) => {
            save_shared(store, session);
            info!(stage = %stage, "session resumed");
            Ok(stage)
        }
        None => precondition("Nothing to resume."),
    }
}

/// Accept the pending artifact at a pause point and advance the session.
/// The caller re-runs the driver afterwards.
pub fn accept(session: &SharedSession, store: &SharedStore) -> Result<Stage> {
    let snap = session.snapshot();
    if snap.stage() != Stage::Paused {
        return precondition("Nothing to accept.");
    }
    let target = match snap.paused_at() {
        None => return precondition("Nothing to accept."),
        Some(Stage::Implement) => Stage::Implement,
        Some(Stage::Commit) => Stage::Commit,
        // Force-accept a plan that was paused for revision.
        Some(Stage::Plan) => {
            if snap.plan.is_none() {
                return precondition("No plan to accept.");
            }
            Stage::Implement
        }
        Some(other) => other,
    };
    session.update(|s| {
        s.transition_to(target);
        s.feedback = None;
        s.cancelled = false;
        s.pause_requested = false;
    });
    save_shared(store, session);
    info!(stage = %target, "pause point accepted");
    Ok(target)
}

/// Roll the session back to a pristine idle state.
pub fn reset(session: &SharedSession, store: &SharedStore) -> String {
    session.update(|s| s.reset());
    save_shared(store, session);
    "Session reset.".to_string()
}

/// Append a user turn to the conversation log.
pub fn record_user_message(session: &SharedSession, store: &SharedStore, content: &str) {
    session.update(|s| s.record(LogRole::User, content));
    save_shared(store, session);
}

/// One conversational, read-only question to an agent kind. Both sides are
/// logged and the kind's continuity token is refreshed.
pub async fn ask(
    agents: &dyn AgentExec,
    session: &SharedSession,
    store: &SharedStore,
    kind: AgentKind,
    message: &str,
) -> Result<String> {
    let snap = session.snapshot();
    session.update(|s| s.record(LogRole::User, message));
    let opts = RunOptions {
        cwd: Some(snap.project_path.clone()),
        continuity: snap.thread_for(kind).map(str::to_string),
        read_only: true,
        ..Default::default()
    };
    let start = Instant::now();
    let reply = agents.run(kind, message, opts).await?;
    let elapsed_ms = start.elapsed().as_millis() as u64;
    session.update(|s| {
        s.add_elapsed(kind, elapsed_ms);
        if let Some(token) = &reply.continuity {
            s.set_thread_for(kind, token.clone());
        }
        s.record(LogRole::from(kind), reply.text.clone());
    });
    save_shared(store, session);
    Ok(reply.text)
}

/// Per-agent outcome of project context initialization.
#[derive(Debug)]
pub struct InitReport {
    pub claude: std::result::Result<(), String>,
    pub codex: std::result::Result<(), String>,
}

/// Generate (or refresh) both agents' project context files.
///
/// The only point in the engine where two agent processes run
/// concurrently by design; each call settles independently.
pub async fn init_project(
    agents: &dyn AgentExec,
    session: &SharedSession,
    store: &SharedStore,
) -> InitReport {
    let snap = session.snapshot();
    let project = Path::new(&snap.project_path);
    let claude_md_exists = project.join("CLAUDE.md").exists();
    let agents_md_exists = project.join("AGENTS.md").exists();

    let claude_opts = RunOptions {
        cwd: Some(snap.project_path.clone()),
        continuity: snap.thread_for(AgentKind::Claude).map(str::to_string),
        ..Default::default()
    };
    let codex_opts = RunOptions {
        cwd: Some(snap.project_path.clone()),
        continuity: snap.thread_for(AgentKind::Codex).map(str::to_string),
        ..Default::default()
    };

    let claude_prompt = init_claude_prompt(claude_md_exists);
    let codex_prompt = init_codex_prompt(agents_md_exists);
    let (claude_result, codex_result) = tokio::join!(
        agents.run(AgentKind::Claude, &claude_prompt, claude_opts),
        agents.run(AgentKind::Codex, &codex_prompt, codex_opts),
    );

    let claude = match claude_result {
        Ok(reply) => {
            if let Some(token) = &reply.continuity {
                session.update(|s| s.set_thread_for(AgentKind::Claude, token.clone()));
            }
            Ok(())
        }
        Err(err) => Err(err.to_string()),
    };
    let codex = match codex_result {
        Ok(reply) => {
            if let Some(token) = &reply.continuity {
                session.update(|s| s.set_thread_for(AgentKind::Codex, token.clone()));
            }
            Ok(())
        }
        Err(err) => Err(err.to_string()),
    };
    save_shared(store, session);
    InitReport { claude, codex }
}

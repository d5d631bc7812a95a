//! The pipeline driver: stage state machine plus the review/gate loop.
//!
//! One invocation of [`run_pipeline`] drives a session from its current
//! stage to a terminal outcome: `Done`, `Paused` (awaiting the human), or
//! `Error`. The driver never panics past its own boundary; every internal
//! failure rolls the session back to `Idle`, persists, and surfaces as an
//! `Error` outcome.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tracing::error;

use crate::gate::parse_gate;
use crate::git;
use crate::notify::Notifier;
use crate::runner::{AgentExec, AgentReply, RunOptions, RunnerError};
use crate::session::SharedSession;
use crate::store::{save_shared, SharedStore};
use tandem_core::events::fmt_ms;
use tandem_core::prompt;
use tandem_core::{
    AgentEvent, Config, Phase, PipelineMessage, PipelineOutcome, Stage, VerdictAction,
};

#[derive(Debug, Error)]
enum PipelineError {
    #[error(transparent)]
    Runner(#[from] RunnerError),
    #[error("not a git repository: {0}")]
    NotGitRepo(String),
    #[error("missing {0} artifact")]
    MissingArtifact(&'static str),
}

type Result<T> = std::result::Result<T, PipelineError>;

/// Everything one driver invocation needs, threaded explicitly.
pub struct PipelineCtx {
    pub config: Config,
    pub agents: Arc<dyn AgentExec>,
    pub session: SharedSession,
    pub store: SharedStore,
    pub notifier: Arc<dyn Notifier>,
    pub messages: UnboundedSender<PipelineMessage>,
    /// Forwarded to every agent call; advisory only.
    pub agent_events: Option<UnboundedSender<AgentEvent>>,
}

impl std::fmt::Debug for PipelineCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineCtx").finish_non_exhaustive()
    }
}

/// Which role an agent call is made on behalf of.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Planner,
    Reviewer,
}

/// Drive the session to a terminal outcome.
pub async fn run_pipeline(ctx: &PipelineCtx) -> PipelineOutcome {
    match drive(ctx).await {
        Ok(outcome) => outcome,
        Err(err) => fail(ctx, &err.to_string()),
    }
}

async fn drive(ctx: &PipelineCtx) -> Result<PipelineOutcome> {
    ctx.session.update(|s| {
        s.cancelled = false;
        s.pause_requested = false;
        s.plan_reviews = 0;
        s.impl_reviews = 0;
        if s.stage() == Stage::Done {
            s.transition_to(Stage::Idle);
        }
    });
    msg(ctx, PipelineMessage::Sep);

    let snap = ctx.session.snapshot();
    if snap.stage() == Stage::Implement {
        return match review_loop(ctx, Phase::Impl).await? {
            Some(halt) => Ok(halt),
            None => run_commit(ctx).await,
        };
    }
    if snap.stage() == Stage::Commit {
        return run_commit(ctx).await;
    }

    // Fresh run: distill the conversation into a spec first.
    msg(
        ctx,
        PipelineMessage::StageSummary {
            stage: "SPEC".into(),
            verdict: None,
            attempt: None,
            elapsed: None,
            detail: Some("Distilling conversation...".into()),
        },
    );
    msg(
        ctx,
        PipelineMessage::AgentSwitch {
            agent: snap.models.reviewer,
        },
    );
    let history = snap
        .log
        .iter()
        .map(|e| format!("{}: {}", e.role.as_str(), e.content))
        .collect::<Vec<_>>()
        .join("\n");
    let reply = timed_call(ctx, Role::Reviewer, &prompt::spec_prompt(&history), false).await?;
    ctx.session.update(|s| {
        s.spec = Some(reply.text.clone());
        s.transition_to(Stage::Spec);
    });
    save_shared(&ctx.store, &ctx.session);
    msg(
        ctx,
        PipelineMessage::Text {
            agent: snap.models.reviewer,
            text: reply.text,
        },
    );
    msg(
        ctx,
        PipelineMessage::Ok {
            text: "Spec created".into(),
        },
    );

    if let Some(halt) = checkpoint(ctx) {
        return Ok(halt);
    }
    if let Some(halt) = review_loop(ctx, Phase::Plan).await? {
        return Ok(halt);
    }
    if let Some(halt) = review_loop(ctx, Phase::Impl).await? {
        return Ok(halt);
    }
    run_commit(ctx).await
}

/// One phase of the generate -> review -> verdict loop.
///
/// Returns `Ok(None)` when the phase was approved and the driver should
/// proceed, `Ok(Some(outcome))` when this invocation is over.
async fn review_loop(ctx: &PipelineCtx, phase: Phase) -> Result<Option<PipelineOutcome>> {
    let max_reviews = ctx.config.max_reviews;

    loop {
        let snap = ctx.session.snapshot();
        let counter = match phase {
            Phase::Plan => snap.plan_reviews,
            Phase::Impl => snap.impl_reviews,
        };
        if counter >= max_reviews {
            break;
        }

        if let Some(halt) = checkpoint(ctx) {
            return Ok(Some(halt));
        }

        msg(
            ctx,
            PipelineMessage::StageSummary {
                stage: phase.label().into(),
                verdict: None,
                attempt: None,
                elapsed: None,
                detail: snap.feedback.is_some().then(|| "Revising...".into()),
            },
        );
        msg(
            ctx,
            PipelineMessage::AgentSwitch {
                agent: snap.models.planner,
            },
        );

        let stage_start = Instant::now();
        let spec = snap
            .spec
            .clone()
            .ok_or(PipelineError::MissingArtifact("spec"))?;
        let generation_prompt = match phase {
            Phase::Plan => prompt::plan_prompt(&spec, snap.feedback.as_deref()),
            Phase::Impl => {
                let plan = snap
                    .plan
                    .clone()
                    .ok_or(PipelineError::MissingArtifact("plan"))?;
                prompt::implement_prompt(&spec, &plan, snap.feedback.as_deref())
            }
        };
        let reply = timed_call(ctx, Role::Planner, &generation_prompt, false).await?;

        let shown = if reply.full_text.is_empty() {
            reply.text.clone()
        } else {
            reply.full_text.clone()
        };
        ctx.session.update(|s| {
            if phase == Phase::Plan {
                s.plan = Some(shown.clone());
            }
            s.feedback = None;
            s.transition_to(phase.generation_stage());
        });
        save_shared(&ctx.store, &ctx.session);
        msg(
            ctx,
            PipelineMessage::Text {
                agent: snap.models.planner,
                text: if phase == Phase::Plan { shown } else { reply.text },
            },
        );

        // The generation call may have taken arbitrarily long.
        if let Some(halt) = checkpoint(ctx) {
            return Ok(Some(halt));
        }

        let attempt_no = ctx.session.update(|s| {
            let counter = match phase {
                Phase::Plan => &mut s.plan_reviews,
                Phase::Impl => &mut s.impl_reviews,
            };
            *counter += 1;
            let attempt = *counter;
            s.transition_to(phase.review_stage());
            attempt
        });
        save_shared(&ctx.store, &ctx.session);
        msg(
            ctx,
            PipelineMessage::AgentSwitch {
                agent: snap.models.reviewer,
            },
        );

        let snap = ctx.session.snapshot();
        let spec = snap
            .spec
            .clone()
            .ok_or(PipelineError::MissingArtifact("spec"))?;
        let plan = snap
            .plan
            .clone()
            .ok_or(PipelineError::MissingArtifact("plan"))?;
        let review_prompt = match phase {
            Phase::Plan => prompt::plan_review_prompt(&spec, &plan),
            Phase::Impl => {
                let diff = git::head_diff(
                    Path::new(&snap.project_path),
                    ctx.config.max_diff_bytes(),
                );
                prompt::impl_review_prompt(&spec, &plan, &diff)
            }
        };
        let review = timed_call(ctx, Role::Reviewer, &review_prompt, false).await?;

        msg(
            ctx,
            PipelineMessage::Status {
                text: "Parsing verdict...".into(),
            },
        );
        let verdict = parse_gate(
            ctx.agents.as_ref(),
            snap.models.reviewer,
            &snap.project_path,
            &review.text,
            &ctx.messages,
        )
        .await;

        let attempt = format!("{attempt_no}/{max_reviews}");
        let elapsed = fmt_ms(stage_start.elapsed().as_millis() as u64);

        match verdict.action {
            VerdictAction::Approve => {
                if !snap.auto_approve {
                    ctx.session.update(|s| s.pause_to(phase.approved_stage()));
                    save_shared(&ctx.store, &ctx.session);
                    let question =
                        format!("{} approved. Review and accept to continue.", phase.label());
                    msg(
                        ctx,
                        PipelineMessage::StageSummary {
                            stage: phase.review_label().into(),
                            verdict: Some(VerdictAction::Approve.as_str().into()),
                            attempt: Some(attempt),
                            elapsed: Some(elapsed),
                            detail: Some("Waiting for human confirmation".into()),
                        },
                    );
                    notify(ctx, &question);
                    return Ok(Some(PipelineOutcome::Paused { question }));
                }
                msg(
                    ctx,
                    PipelineMessage::StageSummary {
                        stage: phase.review_label().into(),
                        verdict: Some(VerdictAction::Approve.as_str().into()),
                        attempt: Some(attempt),
                        elapsed: Some(elapsed),
                        detail: Some(verdict.feedback),
                    },
                );
                ctx.session
                    .update(|s| s.transition_to(phase.approved_stage()));
                save_shared(&ctx.store, &ctx.session);
                return Ok(None);
            }
            VerdictAction::AskUser => {
                ctx.session.update(|s| s.pause_to(phase.generation_stage()));
                save_shared(&ctx.store, &ctx.session);
                msg(
                    ctx,
                    PipelineMessage::StageSummary {
                        stage: phase.review_label().into(),
                        verdict: Some(VerdictAction::AskUser.as_str().into()),
                        attempt: Some(attempt),
                        elapsed: None,
                        detail: Some(verdict.feedback.clone()),
                    },
                );
                let brief: String = verdict.feedback.chars().take(100).collect();
                notify(ctx, &format!("Pipeline paused: {brief}"));
                return Ok(Some(PipelineOutcome::Paused {
                    question: verdict.feedback,
                }));
            }
            VerdictAction::Revise => {
                msg(
                    ctx,
                    PipelineMessage::StageSummary {
                        stage: phase.review_label().into(),
                        verdict: Some(VerdictAction::Revise.as_str().into()),
                        attempt: Some(attempt),
                        elapsed: Some(elapsed),
                        detail: Some(verdict.feedback.clone()),
                    },
                );
                ctx.session
                    .update(|s| s.feedback = Some(verdict.combined_feedback()));
            }
        }
    }

    // Review budget exhausted: pause at the generation stage rather than
    // silently continuing.
    ctx.session.update(|s| s.pause_to(phase.generation_stage()));
    save_shared(&ctx.store, &ctx.session);
    notify(ctx, &format!("Max reviews reached ({max_reviews})"));
    Ok(Some(PipelineOutcome::Paused {
        question: format!("Max reviews ({max_reviews}) reached. Resume or accept to continue."),
    }))
}

async fn run_commit(ctx: &PipelineCtx) -> Result<PipelineOutcome> {
    let snap = ctx.session.snapshot();
    msg(
        ctx,
        PipelineMessage::StageSummary {
            stage: "COMMIT".into(),
            verdict: None,
            attempt: None,
            elapsed: None,
            detail: Some("Committing...".into()),
        },
    );
    msg(
        ctx,
        PipelineMessage::AgentSwitch {
            agent: snap.models.planner,
        },
    );
    ctx.session.update(|s| s.transition_to(Stage::Commit));

    let project = Path::new(&snap.project_path);
    if !git::is_git_repo(project) {
        return Err(PipelineError::NotGitRepo(snap.project_path.clone()));
    }
    if !git::has_changes(project) {
        msg(
            ctx,
            PipelineMessage::Warn {
                text: "No changes to commit".into(),
            },
        );
        ctx.session.update(|s| s.transition_to(Stage::Done));
        save_shared(&ctx.store, &ctx.session);
        emit_duration(ctx);
        return Ok(PipelineOutcome::Done);
    }

    let title = prompt::commit_title(snap.spec.as_deref().unwrap_or(""));
    timed_call(ctx, Role::Planner, &prompt::commit_prompt(&title), false).await?;

    ctx.session.update(|s| s.transition_to(Stage::Done));
    save_shared(&ctx.store, &ctx.session);
    msg(
        ctx,
        PipelineMessage::Ok {
            text: "Committed!".into(),
        },
    );
    emit_duration(ctx);
    notify(ctx, "Pipeline complete! Code committed.");
    Ok(PipelineOutcome::Done)
}

/// Cancellation/pause check at a loop boundary.
///
/// Re-reads the latest session snapshot; when a halt is requested the
/// session is parked in `Paused` (via the legal review-point route) and a
/// `Paused` outcome is returned.
fn checkpoint(ctx: &PipelineCtx) -> Option<PipelineOutcome> {
    let snap = ctx.session.snapshot();
    if !snap.halt_requested() {
        return None;
    }
    if snap.stage() != Stage::Paused {
        ctx.session.update(|s| {
            s.interrupt();
            s.pause_requested = false;
        });
        save_shared(&ctx.store, &ctx.session);
    }
    Some(PipelineOutcome::Paused {
        question: "Pipeline cancelled.".into(),
    })
}

/// Single failure funnel: roll back to `Idle`, persist, report.
fn fail(ctx: &PipelineCtx, message: &str) -> PipelineOutcome {
    error!(error = message, "pipeline failed");
    ctx.session.update(|s| s.reset_to_idle());
    save_shared(&ctx.store, &ctx.session);
    msg(
        ctx,
        PipelineMessage::Error {
            text: message.to_string(),
        },
    );
    let brief: String = message.chars().take(100).collect();
    notify(ctx, &format!("Error: {brief}"));
    PipelineOutcome::Error {
        message: message.to_string(),
    }
}

/// Invoke the agent serving `role`, timing it and threading the role's
/// continuity token through the call.
async fn timed_call(
    ctx: &PipelineCtx,
    role: Role,
    prompt_text: &str,
    read_only: bool,
) -> Result<AgentReply> {
    let snap = ctx.session.snapshot();
    let (kind, continuity) = match role {
        Role::Planner => (snap.models.planner, snap.planner_thread.clone()),
        Role::Reviewer => (snap.models.reviewer, snap.reviewer_thread.clone()),
    };
    let opts = RunOptions {
        cwd: Some(snap.project_path.clone()),
        continuity,
        read_only,
        events: ctx.agent_events.clone(),
    };
    let start = Instant::now();
    let reply = ctx.agents.run(kind, prompt_text, opts).await?;
    let elapsed_ms = start.elapsed().as_millis() as u64;
    ctx.session.update(|s| {
        s.add_elapsed(kind, elapsed_ms);
        if let Some(token) = &reply.continuity {
            match role {
                Role::Planner => s.planner_thread = Some(token.clone()),
                Role::Reviewer => s.reviewer_thread = Some(token.clone()),
            }
        }
    });
    Ok(reply)
}

fn emit_duration(ctx: &PipelineCtx) {
    let snap = ctx.session.snapshot();
    let session_elapsed = snap
        .started_at
        .map_or_else(|| "-".to_string(), |started| {
            let ms = (chrono::Utc::now() - started).num_milliseconds().max(0) as u64;
            fmt_ms(ms)
        });
    msg(
        ctx,
        PipelineMessage::Duration {
            session: session_elapsed,
            claude: fmt_ms(snap.claude_ms),
            codex: fmt_ms(snap.codex_ms),
        },
    );
}

fn msg(ctx: &PipelineCtx, message: PipelineMessage) {
    let _ = ctx.messages.send(message);
}

fn notify(ctx: &PipelineCtx, body: &str) {
    ctx.notifier.notify("tandem", body);
}

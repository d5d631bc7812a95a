//! Verdict parsing gate.
//!
//! Converts a reviewer's free-form text into a structured [`Verdict`] by
//! asking the reviewing agent itself to restate the review as JSON. The
//! restatement call is fresh (no continuity token) and read-only. After a
//! bounded number of failed attempts the gate degrades to an `ask_user`
//! escalation that still carries the raw review, so the human always sees
//! the agent's reasoning.

use tokio::sync::mpsc::UnboundedSender;
use tracing::warn;

use crate::runner::{AgentExec, RunOptions};
use tandem_core::prompt::gate_prompt;
use tandem_core::{extract_json, AgentKind, PipelineMessage, Verdict};

/// Restatement attempts before degrading to `ask_user`.
const GATE_ATTEMPTS: u32 = 3;

/// Characters of the raw review embedded in the fallback verdict.
const RAW_REVIEW_CHARS: usize = 500;

pub async fn parse_gate(
    agents: &dyn AgentExec,
    reviewer: AgentKind,
    cwd: &str,
    review_text: &str,
    messages: &UnboundedSender<PipelineMessage>,
) -> Verdict {
    for attempt in 1..=GATE_ATTEMPTS {
        let _ = messages.send(PipelineMessage::Status {
            text: format!("Gate parse attempt {attempt}/{GATE_ATTEMPTS}"),
        });
        let opts = RunOptions {
            cwd: Some(cwd.to_string()),
            read_only: true,
            ..Default::default()
        };
        match agents.run(reviewer, &gate_prompt(review_text), opts).await {
            Ok(reply) => match parse_verdict(&reply.text) {
                Some(verdict) => return verdict,
                None => warn!(attempt, "gate restatement did not contain a valid verdict"),
            },
            Err(err) => warn!(attempt, error = %err, "gate restatement call failed"),
        }
        if attempt < GATE_ATTEMPTS {
            let _ = messages.send(PipelineMessage::Warn {
                text: "Retrying...".into(),
            });
        }
    }

    let raw: String = review_text.chars().take(RAW_REVIEW_CHARS).collect();
    Verdict::ask_user(format!("Could not parse review verdict. Raw review:\n{raw}"))
}

fn parse_verdict(text: &str) -> Option<Verdict> {
    let span = extract_json(text)?;
    serde_json::from_str(span).ok()
}

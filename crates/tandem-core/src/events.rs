//! Typed event and message families.
//!
//! Two distinct streams flow out of the engine: `AgentEvent`s are advisory
//! progress events surfaced while an agent process runs; `PipelineMessage`s
//! narrate the pipeline driver itself. Both are consumed by the hosting
//! application over unbounded channels and must never be required for
//! correctness.

use serde::{Deserialize, Serialize};

use crate::types::AgentKind;

/// Advisory progress event emitted while an agent process is running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentEvent {
    pub agent: AgentKind,
    pub payload: AgentEventPayload,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEventPayload {
    Status { text: String },
    ToolUse { tool: String, detail: Option<String> },
    ToolResult { tool: String, detail: Option<String> },
    Error { message: String },
}

impl AgentEvent {
    pub fn status(agent: AgentKind, text: impl Into<String>) -> Self {
        Self {
            agent,
            payload: AgentEventPayload::Status { text: text.into() },
        }
    }

    pub fn tool_use(agent: AgentKind, tool: impl Into<String>, detail: Option<String>) -> Self {
        Self {
            agent,
            payload: AgentEventPayload::ToolUse {
                tool: tool.into(),
                detail,
            },
        }
    }

    pub fn tool_result(agent: AgentKind, tool: impl Into<String>, detail: Option<String>) -> Self {
        Self {
            agent,
            payload: AgentEventPayload::ToolResult {
                tool: tool.into(),
                detail,
            },
        }
    }

    pub fn error(agent: AgentKind, message: impl Into<String>) -> Self {
        Self {
            agent,
            payload: AgentEventPayload::Error {
                message: message.into(),
            },
        }
    }
}

/// Message from the pipeline driver to the hosting application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineMessage {
    StageSummary {
        stage: String,
        verdict: Option<String>,
        attempt: Option<String>,
        elapsed: Option<String>,
        detail: Option<String>,
    },
    AgentSwitch {
        agent: AgentKind,
    },
    Text {
        agent: AgentKind,
        text: String,
    },
    Status {
        text: String,
    },
    Ok {
        text: String,
    },
    Warn {
        text: String,
    },
    Error {
        text: String,
    },
    Sep,
    Duration {
        session: String,
        claude: String,
        codex: String,
    },
}

/// Terminal outcome of one driver invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineOutcome {
    Done,
    Paused { question: String },
    Error { message: String },
}

/// Human-readable duration, e.g. `850ms`, `42s`, `3m 05s`.
pub fn fmt_ms(ms: u64) -> String {
    if ms < 1_000 {
        format!("{ms}ms")
    } else if ms < 60_000 {
        format!("{}s", ms / 1_000)
    } else {
        format!("{}m {:02}s", ms / 60_000, (ms % 60_000) / 1_000)
    }
}

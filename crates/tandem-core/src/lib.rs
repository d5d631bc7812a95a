pub mod config;
pub mod events;
pub mod prompt;
pub mod types;
pub mod verdict;

pub use config::Config;
pub use events::{AgentEvent, AgentEventPayload, PipelineMessage, PipelineOutcome};
pub use types::*;
pub use verdict::{extract_json, Verdict, VerdictAction};

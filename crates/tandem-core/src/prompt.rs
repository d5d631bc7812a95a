//! Prompt assembly for the pipeline stages.
//!
//! Wording here is deliberately plain; the structure (which artifacts each
//! stage receives) is the contract.

/// Distill the conversation so far into a task specification.
pub fn spec_prompt(history: &str) -> String {
    format!(
        "Distill the following conversation into a concise task specification. \
         Capture the goal, constraints, and acceptance criteria. Respond with \
         the specification only, starting with a one-line title.\n\n\
         Conversation:\n{history}"
    )
}

/// Produce or revise an implementation plan for the spec.
pub fn plan_prompt(spec: &str, feedback: Option<&str>) -> String {
    let mut p = format!(
        "Write a step-by-step implementation plan for this specification. \
         Do not modify any files yet.\n\nSpecification:\n{spec}"
    );
    if let Some(fb) = feedback {
        p.push_str(&format!(
            "\n\nA previous plan was reviewed. Address this feedback:\n{fb}"
        ));
    }
    p
}

/// Implement (or revise) the plan against the working tree.
pub fn implement_prompt(spec: &str, plan: &str, feedback: Option<&str>) -> String {
    let mut p = format!(
        "Implement the plan below. Make the code changes directly in the \
         working tree. Do not commit.\n\nSpecification:\n{spec}\n\nPlan:\n{plan}"
    );
    if let Some(fb) = feedback {
        p.push_str(&format!(
            "\n\nA previous implementation was reviewed. Address this feedback:\n{fb}"
        ));
    }
    p
}

/// Review a plan against its spec.
pub fn plan_review_prompt(spec: &str, plan: &str) -> String {
    format!(
        "Review this implementation plan against the specification. Consider \
         completeness, correctness, and risk. End with a verdict line: \
         VERDICT: APPROVE, VERDICT: REVISE, or VERDICT: ASK_USER, followed by \
         your reasoning and any specific changes required.\n\n\
         Specification:\n{spec}\n\nPlan:\n{plan}"
    )
}

/// Review an implementation diff against its spec and plan.
pub fn impl_review_prompt(spec: &str, plan: &str, diff: &str) -> String {
    format!(
        "Review this implementation against the specification and plan. The \
         diff of the working tree follows. End with a verdict line: \
         VERDICT: APPROVE, VERDICT: REVISE, or VERDICT: ASK_USER, followed by \
         your reasoning and any specific changes required.\n\n\
         Specification:\n{spec}\n\nPlan:\n{plan}\n\nDiff:\n{diff}"
    )
}

/// Ask the reviewer to restate its own review as a single JSON object.
pub fn gate_prompt(review: &str) -> String {
    format!(
        "Restate the review below as a single JSON object and nothing else. \
         Fields: \"approved\" (boolean), \"action\" (one of \"approve\", \
         \"revise\", \"ask_user\"), \"feedback\" (string), and optionally \
         \"changes\" (array of strings).\n\nReview:\n{review}"
    )
}

/// Generate or refresh the claude context file.
pub fn init_claude_prompt(exists: bool) -> String {
    let verb = if exists { "Update" } else { "Generate" };
    format!(
        "{verb} CLAUDE.md at the repository root: a concise orientation for an \
         AI coding agent covering build commands, layout, and conventions."
    )
}

/// Generate or refresh the codex context file.
pub fn init_codex_prompt(exists: bool) -> String {
    let verb = if exists { "Update" } else { "Generate" };
    format!(
        "{verb} AGENTS.md at the repository root: a concise orientation for an \
         AI coding agent covering build commands, layout, and conventions."
    )
}

/// Instruct the planner agent to stage and commit the working tree.
pub fn commit_prompt(title: &str) -> String {
    format!(
        "Stage and commit all changes from this task. Use a clear commit \
         message based on this title: \"{title}\". Run `git add -A` then \
         `git commit`. Do not push."
    )
}

/// Derive a commit title from the spec: first line, leading markup
/// stripped, truncated to 72 characters.
pub fn commit_title(spec: &str) -> String {
    let first = spec.lines().next().unwrap_or("");
    let stripped = first.trim_start_matches(['#', '*', ' ', '\t']);
    let title: String = stripped.chars().take(72).collect();
    if title.is_empty() {
        "automated change".to_string()
    } else {
        title
    }
}

//! Structured review verdicts and JSON span extraction.

use serde::{Deserialize, Serialize};

/// Outcome of a review: proceed, revise, or escalate to the human.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictAction {
    Approve,
    Revise,
    AskUser,
}

impl VerdictAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approve => "APPROVE",
            Self::Revise => "REVISE",
            Self::AskUser => "ASK_USER",
        }
    }
}

/// Structured restatement of a free-form review.
///
/// This is the JSON shape the reviewing agent is asked to echo back;
/// unknown fields are tolerated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub approved: bool,
    pub action: VerdictAction,
    pub feedback: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changes: Option<Vec<String>>,
}

impl Verdict {
    /// Synthetic escalation verdict used when structured parsing fails.
    pub fn ask_user(feedback: impl Into<String>) -> Self {
        Self {
            approved: false,
            action: VerdictAction::AskUser,
            feedback: feedback.into(),
            changes: None,
        }
    }

    /// Feedback plus any itemized changes, one per line.
    pub fn combined_feedback(&self) -> String {
        match &self.changes {
            Some(changes) if !changes.is_empty() => {
                let items: Vec<String> = changes.iter().map(|c| format!("- {c}")).collect();
                format!("{}\n{}", self.feedback, items.join("\n"))
            }
            _ => self.feedback.clone(),
        }
    }
}

/// Extract the first balanced top-level `{...}` span from free-form text.
///
/// Brace depth is counted outside string literals only: a quote opens a
/// string, a backslash escapes the next character, and braces inside
/// strings do not affect depth. Returns `None` when no span closes.
pub fn extract_json(text: &str) -> Option<&str> {
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut start = None;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' if depth > 0 => in_string = true,
            b'{' => {
                if depth == 0 {
                    start = Some(i);
                }
                depth += 1;
            }
            b'}' => {
                if depth > 0 {
                    depth -= 1;
                    if depth == 0 {
                        if let Some(s) = start {
                            return Some(&text[s..=i]);
                        }
                    }
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_first_balanced_span() {
        assert_eq!(
            extract_json("noise {a:{b:1}} trailing"),
            Some("{a:{b:1}}")
        );
    }

    #[test]
    fn nested_braces_counted_correctly() {
        assert_eq!(
            extract_json("{\"a\":{\"b\":{\"c\":1}}} {\"second\":2}"),
            Some("{\"a\":{\"b\":{\"c\":1}}}")
        );
    }

    #[test]
    fn braces_inside_string_literals_ignored() {
        let text = r#"ok {"feedback":"contains a } brace"} done"#;
        assert_eq!(extract_json(text), Some(r#"{"feedback":"contains a } brace"}"#));
    }

    #[test]
    fn escaped_quote_does_not_close_string() {
        let text = r#"{"feedback":"a \" quote and a } brace"}"#;
        assert_eq!(extract_json(text), Some(text));
    }

    #[test]
    fn no_span_returns_none() {
        assert_eq!(extract_json("no json here"), None);
        assert_eq!(extract_json("unbalanced { only"), None);
    }

    #[test]
    fn quotes_before_first_brace_ignored() {
        let text = r#"he said "hi" then {"action":"approve"}"#;
        assert_eq!(extract_json(text), Some(r#"{"action":"approve"}"#));
    }

    #[test]
    fn verdict_deserializes_expected_shape() {
        let v: Verdict =
            serde_json::from_str(r#"{"approved":true,"action":"approve","feedback":"ok"}"#)
                .unwrap();
        assert!(v.approved);
        assert_eq!(v.action, VerdictAction::Approve);
        assert_eq!(v.feedback, "ok");
        assert!(v.changes.is_none());
    }

    #[test]
    fn verdict_rejects_unknown_action() {
        let result = serde_json::from_str::<Verdict>(
            r#"{"approved":false,"action":"maybe","feedback":"hm"}"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn combined_feedback_itemizes_changes() {
        let v = Verdict {
            approved: false,
            action: VerdictAction::Revise,
            feedback: "needs work".into(),
            changes: Some(vec!["fix a".into(), "fix b".into()]),
        };
        assert_eq!(v.combined_feedback(), "needs work\n- fix a\n- fix b");
    }
}

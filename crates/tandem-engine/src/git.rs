//! Git collaborator queries for the commit stage and the impl review.
//!
//! The engine never stages or commits itself: it only asks whether the
//! working tree is a repository, whether it has changes, and what the
//! current diff looks like. Committing is delegated to the planner agent.

use std::path::Path;
use std::process::Command;

use tracing::debug;

/// Whether `cwd` is inside a git working tree.
pub fn is_git_repo(cwd: &Path) -> bool {
    Command::new("git")
        .args(["rev-parse", "--is-inside-work-tree"])
        .current_dir(cwd)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Whether the working tree has uncommitted changes.
pub fn has_changes(cwd: &Path) -> bool {
    Command::new("git")
        .args(["status", "--porcelain"])
        .current_dir(cwd)
        .output()
        .map(|o| o.status.success() && !String::from_utf8_lossy(&o.stdout).trim().is_empty())
        .unwrap_or(false)
}

/// Diff of the working tree against HEAD, bounded in size.
///
/// Falls back to a plain `git diff` when HEAD does not resolve (fresh
/// repository), and to an empty string when git itself fails. Oversized
/// diffs are truncated with a marker.
pub fn head_diff(cwd: &Path, max_bytes: usize) -> String {
    let diff = run_diff(cwd, &["diff", "HEAD"])
        .or_else(|| run_diff(cwd, &["diff"]))
        .unwrap_or_default();
    truncate_diff(diff, max_bytes)
}

fn run_diff(cwd: &Path, args: &[&str]) -> Option<String> {
    let output = Command::new("git").args(args).current_dir(cwd).output().ok()?;
    if !output.status.success() {
        debug!(args = ?args, "git diff failed");
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).to_string())
}

fn truncate_diff(diff: String, max_bytes: usize) -> String {
    if diff.len() <= max_bytes {
        return diff;
    }
    let mut end = max_bytes;
    while !diff.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n\n... [TRUNCATED] ...", &diff[..end])
}

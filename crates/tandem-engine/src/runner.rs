//! Agent process supervision.
//!
//! Runs exactly one external agent invocation per call: spawn the kind's
//! binary, write the prompt to stdin, incrementally parse the streaming
//! line-delimited event protocol, and reduce it to a single result.
//! Key responsibilities:
//! - Per-kind argument building and event vocabularies (claude stream-json,
//!   codex exec JSONL)
//! - Per-kind timeouts; killed processes are always reaped
//! - A process-wide registry so cancellation can terminate every running
//!   agent and wait for confirmed exits

use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Notify;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use tandem_core::{AgentEvent, AgentKind, Config};

/// Timeout for draining stdout/stderr after the process exits or is killed.
///
/// Normally I/O completes immediately after process death, but if pipes
/// are backed up we don't want to hang forever.
const IO_CAPTURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum bytes of stderr kept for diagnostics.
const MAX_STDERR_BYTES: usize = 64 * 1024;

/// Characters of stderr included in error messages.
const STDERR_PREFIX_CHARS: usize = 300;

/// Characters of tool input/output included in progress events.
const TOOL_DETAIL_CHARS: usize = 120;

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("{0} CLI not found")]
    BinaryNotFound(AgentKind),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{kind} failed: {detail}")]
    Failed { kind: AgentKind, detail: String },
    #[error("{0} timed out after {1}s")]
    Timeout(AgentKind, u64),
    #[error("{0} cancelled")]
    Cancelled(AgentKind),
}

pub type Result<T> = std::result::Result<T, RunnerError>;

/// Options for a single agent invocation.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Working directory the agent operates in.
    pub cwd: Option<String>,
    /// Continuity token from a prior call to the same agent, to resume its
    /// own conversational context.
    pub continuity: Option<String>,
    /// Run the agent without write access (gate parsing, conversational Q&A).
    pub read_only: bool,
    /// Advisory progress events; never required for correctness.
    pub events: Option<UnboundedSender<AgentEvent>>,
}

/// Final result of one agent invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentReply {
    /// The agent's final answer.
    pub text: String,
    /// All assistant text produced during the call (claude emits interim
    /// messages between tool calls; codex does not distinguish).
    pub full_text: String,
    /// Fresh continuity token, when the protocol surfaced one.
    pub continuity: Option<String>,
}

/// The seam between the pipeline and real agent processes.
#[async_trait]
pub trait AgentExec: Send + Sync {
    async fn run(&self, kind: AgentKind, prompt: &str, opts: RunOptions) -> Result<AgentReply>;
}

/// Process-wide registry of running agent children.
///
/// Each invocation registers itself and listens on the registry's
/// cancellation token; `kill_all` cancels the token so every in-flight call
/// kills and reaps its own child. A fresh token is installed immediately so
/// later calls are unaffected.
#[derive(Debug)]
pub struct RunnerRegistry {
    token: Mutex<CancellationToken>,
    active: AtomicUsize,
    drained: Notify,
}

impl Default for RunnerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RunnerRegistry {
    pub fn new() -> Self {
        Self {
            token: Mutex::new(CancellationToken::new()),
            active: AtomicUsize::new(0),
            drained: Notify::new(),
        }
    }

    fn current_token(&self) -> CancellationToken {
        self.token.lock().expect("runner registry poisoned").clone()
    }

    fn enter(&self) -> RunGuard<'_> {
        self.active.fetch_add(1, Ordering::SeqCst);
        RunGuard(self)
    }

    /// Number of agent processes currently running.
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Signal every running agent process to terminate.
    pub fn kill_all(&self) {
        let mut token = self.token.lock().expect("runner registry poisoned");
        token.cancel();
        *token = CancellationToken::new();
    }

    /// Signal termination and wait (bounded) until every child has been
    /// confirmed dead. Returns `false` when the wait timed out.
    pub async fn kill_all_and_wait(&self, wait: Duration) -> bool {
        self.kill_all();
        let deadline = Instant::now() + wait;
        while self.active_count() > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!(
                    active = self.active_count(),
                    "agent processes still running after kill wait"
                );
                return false;
            }
            let _ = timeout(remaining, self.drained.notified()).await;
        }
        true
    }
}

struct RunGuard<'a>(&'a RunnerRegistry);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
        self.0.drained.notify_waiters();
    }
}

/// How the process wait loop terminated.
enum ProcessOutcome {
    Completed(std::process::ExitStatus),
    TimedOut,
    Cancelled,
}

/// Spawns and supervises real agent processes.
#[derive(Debug)]
pub struct AgentRunner {
    config: Config,
    registry: Arc<RunnerRegistry>,
}

#[async_trait]
impl AgentExec for AgentRunner {
    async fn run(&self, kind: AgentKind, prompt: &str, opts: RunOptions) -> Result<AgentReply> {
        let cmd = build_command(kind, &opts);
        self.execute(kind, cmd, prompt, &opts).await
    }
}

impl AgentRunner {
    pub fn new(config: Config, registry: Arc<RunnerRegistry>) -> Self {
        Self { config, registry }
    }

    pub fn registry(&self) -> &Arc<RunnerRegistry> {
        &self.registry
    }

    /// Supervise one spawned agent process to completion.
    async fn execute(
        &self,
        kind: AgentKind,
        mut cmd: Command,
        prompt: &str,
        opts: &RunOptions,
    ) -> Result<AgentReply> {
        let token = self.registry.current_token();
        let _guard = self.registry.enter();

        debug!(agent = %kind, "spawning agent process");
        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                RunnerError::BinaryNotFound(kind)
            } else {
                RunnerError::Io(e)
            }
        })?;

        // Write the prompt and close the input channel. Runs as its own task
        // so a prompt larger than the pipe buffer cannot deadlock against a
        // child that is already writing stdout. Best effort: a child that
        // exits without reading stdin must not fail the call.
        if let Some(mut stdin) = child.stdin.take() {
            let prompt = prompt.to_string();
            tokio::spawn(async move {
                let _ = stdin.write_all(prompt.as_bytes()).await;
                let _ = stdin.shutdown().await;
            });
        }

        let events = opts.events.clone();
        let stdout_task = child
            .stdout
            .take()
            .map(|out| tokio::spawn(parse_stream(kind, out, events)));
        let stderr_task = child
            .stderr
            .take()
            .map(|err| tokio::spawn(read_bounded(err, MAX_STDERR_BYTES)));

        let limit = self.config.timeout_for(kind);
        let outcome = tokio::select! {
            status = child.wait() => ProcessOutcome::Completed(status?),
            () = token.cancelled() => {
                if let Err(err) = child.kill().await {
                    warn!(agent = %kind, error = %err, "failed to kill cancelled process");
                }
                let _ = child.wait().await;
                ProcessOutcome::Cancelled
            }
            () = tokio::time::sleep(limit) => {
                warn!(agent = %kind, timeout_sec = limit.as_secs(), "process timed out; killing");
                if let Err(err) = child.kill().await {
                    warn!(agent = %kind, error = %err, "failed to kill timed-out process");
                }
                let _ = child.wait().await;
                ProcessOutcome::TimedOut
            }
        };

        // Pipes close after exit or kill, so the reader tasks finish quickly.
        let accum = match stdout_task {
            Some(task) => match timeout(IO_CAPTURE_TIMEOUT, task).await {
                Ok(Ok(Ok(accum))) => accum,
                Ok(Ok(Err(err))) => {
                    warn!(agent = %kind, error = %err, "stdout capture failed");
                    StreamAccum::default()
                }
                Ok(Err(err)) => {
                    warn!(agent = %kind, error = %err, "stdout task panicked");
                    StreamAccum::default()
                }
                Err(_) => {
                    warn!(agent = %kind, "stdout capture timed out");
                    StreamAccum::default()
                }
            },
            None => StreamAccum::default(),
        };
        let stderr = match stderr_task {
            Some(task) => match timeout(IO_CAPTURE_TIMEOUT, task).await {
                Ok(Ok(Ok(buf))) => String::from_utf8_lossy(&buf).to_string(),
                _ => String::new(),
            },
            None => String::new(),
        };

        match outcome {
            ProcessOutcome::TimedOut => Err(RunnerError::Timeout(kind, limit.as_secs())),
            ProcessOutcome::Cancelled => Err(RunnerError::Cancelled(kind)),
            ProcessOutcome::Completed(status) => {
                accum.into_reply(kind, status.code(), &stderr)
            }
        }
    }
}

/// Build the spawn command for an agent kind.
fn build_command(kind: AgentKind, opts: &RunOptions) -> Command {
    let mut cmd = Command::new(kind.binary());
    match kind {
        AgentKind::Claude => {
            cmd.args(["-p", "--output-format", "stream-json", "--verbose"]);
            if !opts.read_only {
                cmd.arg("--dangerously-skip-permissions");
            }
            if let Some(token) = &opts.continuity {
                cmd.args(["--resume", token]);
            }
            cmd.env("CLAUDECODE", "");
        }
        AgentKind::Codex => {
            if let Some(token) = &opts.continuity {
                cmd.args(["exec", "resume", "--json", "--skip-git-repo-check", "--full-auto"]);
                cmd.arg(token);
            } else {
                cmd.args(["exec", "--json", "--skip-git-repo-check"]);
                if opts.read_only {
                    cmd.args(["--sandbox", "read-only"]);
                } else {
                    cmd.arg("--full-auto");
                }
                if let Some(cwd) = &opts.cwd {
                    cmd.args(["-C", cwd]);
                }
            }
            // Read the prompt from stdin.
            cmd.arg("-");
        }
    }
    if let Some(cwd) = &opts.cwd {
        cmd.current_dir(cwd);
    }
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    cmd
}

/// Read from an async reader up to `max_bytes`, draining the rest.
async fn read_bounded<R: tokio::io::AsyncRead + Unpin>(
    mut reader: R,
    max_bytes: usize,
) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(8192);
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        let remaining = max_bytes.saturating_sub(buf.len());
        if remaining == 0 {
            while reader.read(&mut chunk).await? > 0 {}
            break;
        }
        buf.extend_from_slice(&chunk[..n.min(remaining)]);
    }
    Ok(buf)
}

/// Accumulated state of one agent's output stream.
#[derive(Debug, Default)]
struct StreamAccum {
    /// Final answer text (claude: last assistant block or terminal result;
    /// codex: concatenated agent messages).
    text: String,
    /// All assistant text joined with blank lines (claude only).
    all_text: String,
    /// Raw text deltas, kept as a fallback when no block-level text arrived.
    stream_text: String,
    continuity: Option<String>,
    /// Claude's terminal `result` event was seen.
    completed: bool,
}

impl StreamAccum {
    /// Reduce the accumulated stream to a reply, or a typed failure.
    fn into_reply(self, kind: AgentKind, exit_code: Option<i32>, stderr: &str) -> Result<AgentReply> {
        let detail = || {
            let prefix: String = stderr.chars().take(STDERR_PREFIX_CHARS).collect();
            if prefix.trim().is_empty() {
                format!("exit {}", exit_code.map_or_else(|| "?".into(), |c| c.to_string()))
            } else {
                prefix
            }
        };
        match kind {
            AgentKind::Claude => {
                if !self.completed {
                    return Err(RunnerError::Failed {
                        kind,
                        detail: detail(),
                    });
                }
                let text = if self.text.is_empty() {
                    self.stream_text.clone()
                } else {
                    self.text
                };
                let full_text = if self.all_text.is_empty() {
                    self.stream_text
                } else {
                    self.all_text
                };
                Ok(AgentReply {
                    text,
                    full_text,
                    continuity: self.continuity,
                })
            }
            AgentKind::Codex => {
                let message = self.text.trim().to_string();
                if exit_code != Some(0) && message.is_empty() {
                    return Err(RunnerError::Failed {
                        kind,
                        detail: detail(),
                    });
                }
                Ok(AgentReply {
                    full_text: message.clone(),
                    text: message,
                    continuity: self.continuity,
                })
            }
        }
    }
}

/// Parse a line-delimited JSON event stream, accumulating the result and
/// emitting advisory progress events. Unparseable lines are skipped: the
/// protocol may interleave non-JSON noise.
async fn parse_stream<R: tokio::io::AsyncRead + Unpin>(
    kind: AgentKind,
    reader: R,
    events: Option<UnboundedSender<AgentEvent>>,
) -> std::io::Result<StreamAccum> {
    let mut lines = BufReader::new(reader).lines();
    let mut accum = StreamAccum::default();
    while let Some(line) = lines.next_line().await? {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let event: serde_json::Value = match serde_json::from_str(trimmed) {
            Ok(v) => v,
            Err(err) => {
                debug!(agent = %kind, error = %err, "ignoring unparseable stream line");
                continue;
            }
        };
        match kind {
            AgentKind::Claude => apply_claude_event(&mut accum, &event, &events),
            AgentKind::Codex => apply_codex_event(&mut accum, &event, &events),
        }
    }
    Ok(accum)
}

fn emit(events: &Option<UnboundedSender<AgentEvent>>, event: AgentEvent) {
    if let Some(tx) = events {
        let _ = tx.send(event);
    }
}

fn str_field<'a>(value: &'a serde_json::Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(|v| v.as_str())
}

fn prefix(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

/// One claude stream-json event.
///
/// No event kind is assumed to occur at most once; later `session_id`s and
/// assistant blocks simply overwrite or extend earlier state.
fn apply_claude_event(
    accum: &mut StreamAccum,
    event: &serde_json::Value,
    events: &Option<UnboundedSender<AgentEvent>>,
) {
    let agent = AgentKind::Claude;
    match str_field(event, "type").unwrap_or("") {
        "system" => {
            if str_field(event, "subtype") == Some("init") {
                if let Some(sid) = str_field(event, "session_id") {
                    accum.continuity = Some(sid.to_string());
                }
                let model = str_field(event, "model").unwrap_or("default");
                emit(events, AgentEvent::status(agent, format!("Session started ({model})")));
            }
        }
        "stream_event" => {
            if let Some(delta) = event.pointer("/event/delta") {
                match str_field(delta, "type") {
                    Some("text_delta") => {
                        if let Some(text) = str_field(delta, "text") {
                            accum.stream_text.push_str(text);
                        }
                    }
                    Some("thinking_delta") => {
                        emit(events, AgentEvent::status(agent, "thinking..."));
                    }
                    _ => {}
                }
            }
        }
        "assistant" => {
            let blocks = event
                .pointer("/message/content")
                .or_else(|| event.get("content"))
                .and_then(|c| c.as_array());
            for block in blocks.into_iter().flatten() {
                match str_field(block, "type") {
                    Some("text") => {
                        let text = str_field(block, "text").unwrap_or("");
                        if !text.is_empty() {
                            accum.text = text.to_string();
                            if !accum.all_text.is_empty() {
                                accum.all_text.push_str("\n\n");
                            }
                            accum.all_text.push_str(text);
                        }
                    }
                    Some("tool_use") => {
                        let name = str_field(block, "name").unwrap_or("");
                        let detail = tool_summary(name, block.get("input"));
                        emit(events, AgentEvent::tool_use(agent, name, detail));
                    }
                    _ => {}
                }
            }
        }
        "user" => {
            let blocks = event
                .pointer("/message/content")
                .or_else(|| event.get("content"))
                .and_then(|c| c.as_array());
            for block in blocks.into_iter().flatten() {
                if str_field(block, "type") == Some("tool_result") {
                    let detail = block
                        .get("content")
                        .map(|c| prefix(&content_to_string(c), 200));
                    emit(events, AgentEvent::tool_result(agent, "result", detail));
                }
            }
        }
        "result" => {
            accum.completed = true;
            if let Some(result) = event.get("result") {
                let text = extract_result_text(result);
                if !text.is_empty() {
                    accum.text = text;
                }
            }
            if let Some(sid) = str_field(event, "session_id") {
                accum.continuity = Some(sid.to_string());
            }
        }
        _ => {}
    }
}

/// One codex exec JSONL event.
fn apply_codex_event(
    accum: &mut StreamAccum,
    event: &serde_json::Value,
    events: &Option<UnboundedSender<AgentEvent>>,
) {
    let agent = AgentKind::Codex;
    match str_field(event, "type").unwrap_or("") {
        "thread.started" => {
            if let Some(tid) = str_field(event, "thread_id") {
                accum.continuity = Some(tid.to_string());
                emit(events, AgentEvent::status(agent, format!("Thread {}...", prefix(tid, 12))));
            }
        }
        "turn.started" => emit(events, AgentEvent::status(agent, "Turn started")),
        "turn.completed" => emit(events, AgentEvent::status(agent, "Turn done")),
        "turn.failed" => {
            let message = event
                .pointer("/error/message")
                .and_then(|m| m.as_str())
                .unwrap_or("Turn failed");
            emit(events, AgentEvent::error(agent, message));
        }
        "item.started" => {
            let Some(item) = event.get("item") else { return };
            match str_field(item, "type") {
                Some("command_execution") => {
                    let cmd = prefix(str_field(item, "command").unwrap_or(""), TOOL_DETAIL_CHARS);
                    emit(events, AgentEvent::tool_use(agent, "exec", Some(cmd)));
                }
                Some("mcp_tool_call") => {
                    let detail = format!(
                        "{}/{}",
                        str_field(item, "server").unwrap_or(""),
                        str_field(item, "tool").unwrap_or("")
                    );
                    emit(events, AgentEvent::tool_use(agent, "mcp", Some(detail)));
                }
                _ => {}
            }
        }
        "item.completed" => {
            let Some(item) = event.get("item") else { return };
            match str_field(item, "type") {
                Some("agent_message") => {
                    accum.text.push_str(str_field(item, "text").unwrap_or(""));
                }
                Some("reasoning") => {
                    let text = prefix(str_field(item, "text").unwrap_or(""), 80);
                    emit(events, AgentEvent::status(agent, format!("thinking: {text}")));
                }
                Some("command_execution") => {
                    let cmd = prefix(str_field(item, "command").unwrap_or(""), 80);
                    let out = prefix(str_field(item, "aggregated_output").unwrap_or(""), 100);
                    let code = item
                        .get("exit_code")
                        .map_or_else(|| "?".to_string(), |c| c.to_string());
                    emit(
                        events,
                        AgentEvent::tool_result(agent, format!("exec ({code})"), Some(format!("{cmd} -> {out}"))),
                    );
                }
                Some("file_change") => {
                    let changes = item.get("changes").and_then(|c| c.as_array());
                    for change in changes.into_iter().flatten() {
                        let detail = format!(
                            "{}: {}",
                            str_field(change, "kind").unwrap_or(""),
                            str_field(change, "path").unwrap_or("")
                        );
                        emit(events, AgentEvent::tool_use(agent, "file", Some(detail)));
                    }
                }
                Some("mcp_tool_call") => {
                    let result = item
                        .get("result")
                        .or_else(|| item.get("error"))
                        .map(content_to_string)
                        .unwrap_or_default();
                    let detail = format!(
                        "{}/{}: {}",
                        str_field(item, "server").unwrap_or(""),
                        str_field(item, "tool").unwrap_or(""),
                        prefix(&result, 100)
                    );
                    emit(events, AgentEvent::tool_result(agent, "mcp", Some(detail)));
                }
                Some("web_search") => {
                    let query = str_field(item, "query").unwrap_or("").to_string();
                    emit(events, AgentEvent::tool_use(agent, "search", Some(query)));
                }
                Some("error") => {
                    let message = prefix(str_field(item, "message").unwrap_or(""), 100);
                    emit(events, AgentEvent::error(agent, message));
                }
                _ => {}
            }
        }
        _ => {}
    }
}

/// Flatten a claude `result` payload to plain text. The field may be a
/// string, a content-block array, or an object wrapping either.
fn extract_result_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Array(blocks) => blocks
            .iter()
            .filter(|b| str_field(b, "type") == Some("text"))
            .filter_map(|b| str_field(b, "text"))
            .collect::<Vec<_>>()
            .join("\n"),
        serde_json::Value::Object(obj) => {
            if let Some(text) = obj.get("text").and_then(|t| t.as_str()) {
                text.to_string()
            } else if let Some(content) = obj.get("content") {
                extract_result_text(content)
            } else {
                String::new()
            }
        }
        _ => String::new(),
    }
}

fn content_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Summarize a tool invocation's input for progress display.
fn tool_summary(name: &str, input: Option<&serde_json::Value>) -> Option<String> {
    let input = input?;
    let field = match name {
        "Read" | "Write" | "Edit" => "file_path",
        "Glob" | "Grep" => "pattern",
        "Bash" => "command",
        "WebFetch" => "url",
        "WebSearch" => "query",
        "Task" => "description",
        _ => {
            return Some(prefix(&input.to_string(), TOOL_DETAIL_CHARS));
        }
    };
    Some(prefix(str_field(input, field).unwrap_or(""), TOOL_DETAIL_CHARS))
}

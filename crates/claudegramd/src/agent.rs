//! One turn against the Claude Code agent.
//!
//! The agent is modelled as a finite ordered stream of tagged events ending
//! in a `result` event. The production stream wraps the `claude` CLI in
//! stream-json mode; tests substitute scripted streams. All bookkeeping
//! between events is synchronous, so the session id, compaction flag and
//! cache-read watermark are consistent with everything observed by the time
//! the terminal event lands.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::Notify;

pub const OAUTH_TOKEN_KEY: &str = "CLAUDE_CODE_OAUTH_TOKEN";
pub const API_KEY_KEY: &str = "ANTHROPIC_API_KEY";

pub const CANCELLED_REPLY: &str = "Okay, I stopped that request.";
pub const TIMEOUT_REPLY: &str =
    "That took too long and I gave up on it. Try again, or break the request into smaller steps.";
const GENERIC_FAILURE_REPLY: &str = "Something went wrong while handling that. Please try again.";
const AUTH_FAILURE_REPLY: &str =
    "I can't reach the agent right now: authentication failed. Check the configured credentials.";
const BILLING_FAILURE_REPLY: &str =
    "I can't reach the agent right now: there is a billing problem on the account.";
const MAX_TURNS_REPLY: &str =
    "I hit the turn limit before finishing. Try narrowing the request or send it again.";
const MAX_BUDGET_REPLY: &str = "I hit the cost budget for this request and stopped.";
const STRUCTURED_OUTPUT_REPLY: &str =
    "The agent kept producing malformed output and gave up. Try rephrasing the request.";

#[derive(Debug, thiserror::Error)]
#[error("agent error: {message}")]
pub struct AgentError {
    message: String,
}

impl AgentError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Cooperative cancellation: cheap to clone, trippable exactly once.
#[derive(Clone, Default)]
pub struct CancelHandle {
    inner: Arc<CancelInner>,
}

#[derive(Default)]
struct CancelInner {
    flag: AtomicBool,
    notify: Notify,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// Whether two handles share the same trip wire.
    pub fn same_as(&self, other: &CancelHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

#[derive(Clone, Debug)]
pub struct AssistantError {
    pub kind: String,
    pub message: String,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_input_tokens: u64,
    pub total_cost_usd: f64,
}

#[derive(Clone, Debug, Default)]
pub struct ResultEvent {
    pub subtype: String,
    pub result: Option<String>,
    pub errors: Vec<String>,
    pub total_cost_usd: f64,
    pub num_turns: u32,
    pub usage: Option<TokenUsage>,
}

/// The event kinds the runner interprets; everything else folds to `Other`.
#[derive(Clone, Debug)]
pub enum AgentEvent {
    SystemInit {
        session_id: String,
        model: String,
    },
    CompactBoundary {
        pre_compact_tokens: Option<u64>,
    },
    Assistant {
        cache_read_input_tokens: Option<u64>,
        error: Option<AssistantError>,
    },
    AuthStatus {
        error: Option<String>,
    },
    Result(ResultEvent),
    Other,
}

#[async_trait]
pub trait AgentStream: Send {
    /// The next event, `None` on clean end-of-stream. Driving this is the
    /// runner's only suspension point.
    async fn next_event(&mut self) -> Result<Option<AgentEvent>, AgentError>;
}

#[async_trait]
pub trait AgentClient: Send + Sync {
    async fn start(
        &self,
        prompt: &str,
        session_id: Option<&str>,
        env: HashMap<String, String>,
    ) -> Result<Box<dyn AgentStream>, AgentError>;
}

/// Invoked once per observed event. Panics are caught at the call site and
/// never escape the runner.
pub type ProgressFn = Arc<dyn Fn(&AgentEvent) + Send + Sync>;

#[derive(Default)]
pub struct TurnRequest {
    pub message: String,
    pub session_id: Option<String>,
    pub extra_env: HashMap<String, String>,
    pub cancel: Option<CancelHandle>,
    pub on_progress: Option<ProgressFn>,
}

#[derive(Clone, Debug, Default)]
pub struct TurnOutcome {
    pub text: String,
    pub session_id: Option<String>,
    pub cost_usd: f64,
    pub duration_ms: u64,
    pub num_turns: u32,
    pub usage: Option<TokenUsage>,
    pub did_compact: bool,
    pub pre_compact_tokens: Option<u64>,
    pub last_cache_read: u64,
    pub error: Option<String>,
}

pub struct AgentRunner {
    client: Arc<dyn AgentClient>,
    env_path: PathBuf,
    timeout: Duration,
}

impl AgentRunner {
    pub fn new(client: Arc<dyn AgentClient>, env_path: PathBuf, timeout_ms: u64) -> Self {
        Self {
            client,
            env_path,
            timeout: Duration::from_millis(timeout_ms.max(1)),
        }
    }

    /// Credentials travel from the env file straight into the subprocess
    /// environment; the gateway's own process env is never written.
    fn turn_env(&self, extra: &HashMap<String, String>) -> HashMap<String, String> {
        let file_env = common::envfile::parse_env_file(&self.env_path);
        let mut env = HashMap::new();
        for key in [OAUTH_TOKEN_KEY, API_KEY_KEY] {
            if let Some(value) = file_env.get(key) {
                if !value.is_empty() {
                    env.insert(key.to_string(), value.clone());
                }
            }
        }
        for (key, value) in extra {
            env.insert(key.clone(), value.clone());
        }
        env
    }

    pub async fn run(&self, request: TurnRequest) -> TurnOutcome {
        let started = Instant::now();

        if let Some(cancel) = &request.cancel {
            if cancel.is_cancelled() {
                return TurnOutcome {
                    text: CANCELLED_REPLY.to_string(),
                    error: Some("cancelled".to_string()),
                    duration_ms: elapsed_ms(started),
                    ..Default::default()
                };
            }
        }

        let env = self.turn_env(&request.extra_env);
        let mut stream = match self
            .client
            .start(&request.message, request.session_id.as_deref(), env)
            .await
        {
            Ok(stream) => stream,
            Err(err) => {
                return TurnOutcome {
                    text: GENERIC_FAILURE_REPLY.to_string(),
                    error: Some(err.to_string()),
                    duration_ms: elapsed_ms(started),
                    ..Default::default()
                };
            }
        };

        let timer = tokio::time::sleep(self.timeout);
        tokio::pin!(timer);
        let external = request.cancel.clone();
        let mut fold = TurnFold::default();

        loop {
            tokio::select! {
                event = stream.next_event() => match event {
                    Ok(Some(event)) => {
                        if let Some(on_progress) = &request.on_progress {
                            // The callback must never unwind into the event
                            // loop; a panic is swallowed and logged.
                            let guarded = std::panic::catch_unwind(
                                std::panic::AssertUnwindSafe(|| on_progress(&event)),
                            );
                            if guarded.is_err() {
                                tracing::error!("progress callback panicked; ignoring");
                            }
                        }
                        if fold.observe(event) {
                            break;
                        }
                    }
                    Ok(None) => {
                        if !fold.terminal {
                            fold.fail("agent stream ended without a result", GENERIC_FAILURE_REPLY);
                        }
                        break;
                    }
                    Err(err) => {
                        fold.fail(err.to_string(), GENERIC_FAILURE_REPLY);
                        break;
                    }
                },
                _ = &mut timer => {
                    fold.fail("timeout", TIMEOUT_REPLY);
                    break;
                }
                _ = wait_cancelled(&external) => {
                    fold.fail("cancelled", CANCELLED_REPLY);
                    break;
                }
            }
        }
        // Dropping the stream is the internal cancellation: the CLI stream
        // kills its subprocess on drop.
        drop(stream);

        fold.into_outcome(elapsed_ms(started))
    }
}

async fn wait_cancelled(handle: &Option<CancelHandle>) {
    match handle {
        Some(handle) => handle.cancelled().await,
        None => std::future::pending::<()>().await,
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

/// Synchronous accumulation of everything the event stream reveals.
#[derive(Default)]
struct TurnFold {
    text: String,
    session_id: Option<String>,
    cost_usd: f64,
    num_turns: u32,
    usage: Option<TokenUsage>,
    did_compact: bool,
    pre_compact_tokens: Option<u64>,
    last_cache_read: u64,
    error: Option<String>,
    terminal: bool,
}

impl TurnFold {
    /// Returns true when the event is terminal.
    fn observe(&mut self, event: AgentEvent) -> bool {
        match event {
            AgentEvent::SystemInit { session_id, model } => {
                tracing::debug!("agent session {session_id} started (model {model})");
                self.session_id = Some(session_id);
                false
            }
            AgentEvent::CompactBoundary { pre_compact_tokens } => {
                tracing::info!(
                    "agent auto-compacted its context (pre-compact tokens: {pre_compact_tokens:?})"
                );
                self.did_compact = true;
                self.pre_compact_tokens = pre_compact_tokens;
                false
            }
            AgentEvent::Assistant {
                cache_read_input_tokens,
                error,
            } => {
                if let Some(read) = cache_read_input_tokens {
                    if read > 0 {
                        self.last_cache_read = read;
                    }
                }
                match error {
                    None => false,
                    Some(error) => match error.kind.as_str() {
                        "authentication_failed" => {
                            self.fail(format!("auth: {}", error.message), AUTH_FAILURE_REPLY);
                            true
                        }
                        "billing_error" => {
                            self.fail(format!("billing: {}", error.message), BILLING_FAILURE_REPLY);
                            true
                        }
                        // rate_limit, server_error, max_output_tokens: the
                        // stream keeps going and usually recovers.
                        kind => {
                            tracing::warn!(
                                "agent reported a non-terminal error kind={kind}: {}",
                                error.message
                            );
                            false
                        }
                    },
                }
            }
            AgentEvent::AuthStatus { error: Some(message) } => {
                self.fail(format!("auth: {message}"), AUTH_FAILURE_REPLY);
                true
            }
            AgentEvent::AuthStatus { error: None } => false,
            AgentEvent::Result(result) => {
                self.finish(result);
                true
            }
            AgentEvent::Other => false,
        }
    }

    fn finish(&mut self, result: ResultEvent) {
        self.terminal = true;
        self.cost_usd = result.total_cost_usd;
        self.num_turns = result.num_turns;
        self.usage = result.usage;
        match result.subtype.as_str() {
            "success" => {
                self.text = result.result.unwrap_or_default();
            }
            "error_max_turns" => {
                self.error = Some("max_turns".to_string());
                self.text = MAX_TURNS_REPLY.to_string();
            }
            "error_max_budget_usd" => {
                self.error = Some("max_budget_usd".to_string());
                self.text = MAX_BUDGET_REPLY.to_string();
            }
            "error_during_execution" => {
                self.error = Some("error_during_execution".to_string());
                self.text = if result.errors.is_empty() {
                    GENERIC_FAILURE_REPLY.to_string()
                } else {
                    result.errors.join("\n")
                };
            }
            "error_max_structured_output_retries" => {
                self.error = Some("max_structured_output_retries".to_string());
                self.text = STRUCTURED_OUTPUT_REPLY.to_string();
            }
            other => {
                self.error = Some(other.to_string());
                self.text = GENERIC_FAILURE_REPLY.to_string();
            }
        }
    }

    fn fail(&mut self, error: impl Into<String>, text: &str) {
        self.terminal = true;
        self.error = Some(error.into());
        self.text = text.to_string();
    }

    fn into_outcome(self, duration_ms: u64) -> TurnOutcome {
        TurnOutcome {
            text: self.text,
            session_id: self.session_id,
            cost_usd: self.cost_usd,
            duration_ms,
            num_turns: self.num_turns,
            usage: self.usage,
            did_compact: self.did_compact,
            pre_compact_tokens: self.pre_compact_tokens,
            last_cache_read: self.last_cache_read,
            error: self.error,
        }
    }
}

/// Production client: spawns the `claude` CLI in stream-json mode.
pub struct CliAgentClient {
    binary: String,
    system_prompt_append: String,
    workdir: Option<PathBuf>,
}

impl CliAgentClient {
    pub fn new(binary: impl Into<String>, system_prompt_append: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            system_prompt_append: system_prompt_append.into(),
            workdir: None,
        }
    }

    pub fn with_workdir(mut self, workdir: PathBuf) -> Self {
        self.workdir = Some(workdir);
        self
    }
}

#[async_trait]
impl AgentClient for CliAgentClient {
    async fn start(
        &self,
        prompt: &str,
        session_id: Option<&str>,
        env: HashMap<String, String>,
    ) -> Result<Box<dyn AgentStream>, AgentError> {
        let mut command = Command::new(&self.binary);
        command
            .arg("-p")
            .arg(prompt)
            .arg("--output-format")
            .arg("stream-json")
            .arg("--verbose");
        if !self.system_prompt_append.is_empty() {
            command
                .arg("--append-system-prompt")
                .arg(&self.system_prompt_append);
        }
        if let Some(session_id) = session_id {
            command.arg("--resume").arg(session_id);
        }
        if let Some(workdir) = &self.workdir {
            command.current_dir(workdir);
        }
        command
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|err| AgentError::new(format!("agent spawn failed: {err}")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AgentError::new("agent stdout missing"))?;
        Ok(Box::new(CliAgentStream {
            child,
            lines: BufReader::new(stdout).lines(),
        }))
    }
}

struct CliAgentStream {
    child: Child,
    lines: Lines<BufReader<ChildStdout>>,
}

#[async_trait]
impl AgentStream for CliAgentStream {
    async fn next_event(&mut self) -> Result<Option<AgentEvent>, AgentError> {
        loop {
            let line = self
                .lines
                .next_line()
                .await
                .map_err(|err| AgentError::new(format!("agent stdout read failed: {err}")))?;
            match line {
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => return Ok(Some(parse_event(&line))),
                None => {
                    let status = self
                        .child
                        .wait()
                        .await
                        .map_err(|err| AgentError::new(format!("agent wait failed: {err}")))?;
                    if status.success() {
                        return Ok(None);
                    }
                    let code = status.code().unwrap_or(-1);
                    return Err(AgentError::new(format!(
                        "agent process exited with code {code}"
                    )));
                }
            }
        }
    }
}

/// Decode one stream-json line. Unknown or malformed lines become `Other`;
/// the stream keeps its terminal-event invariant either way.
pub fn parse_event(line: &str) -> AgentEvent {
    let value: Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(err) => {
            tracing::debug!("skipping unparseable agent event: {err}");
            return AgentEvent::Other;
        }
    };
    let kind = value.get("type").and_then(Value::as_str).unwrap_or("");
    match kind {
        "system" => match value.get("subtype").and_then(Value::as_str) {
            Some("init") => AgentEvent::SystemInit {
                session_id: string_field(&value, "session_id"),
                model: string_field(&value, "model"),
            },
            Some("compact_boundary") => AgentEvent::CompactBoundary {
                pre_compact_tokens: value
                    .pointer("/compact_metadata/pre_tokens")
                    .and_then(Value::as_u64),
            },
            _ => AgentEvent::Other,
        },
        "assistant" => AgentEvent::Assistant {
            cache_read_input_tokens: value
                .pointer("/message/usage/cache_read_input_tokens")
                .and_then(Value::as_u64),
            error: value.get("error").map(|error| AssistantError {
                kind: error
                    .get("type")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string(),
                message: error
                    .get("message")
                    .and_then(Value::as_str)
                    .or_else(|| error.as_str())
                    .unwrap_or_default()
                    .to_string(),
            }),
        },
        "auth_status" => AgentEvent::AuthStatus {
            error: value
                .get("error")
                .and_then(Value::as_str)
                .map(str::to_string),
        },
        "result" => AgentEvent::Result(ResultEvent {
            subtype: string_field(&value, "subtype"),
            result: value
                .get("result")
                .and_then(Value::as_str)
                .map(str::to_string),
            errors: value
                .get("errors")
                .and_then(Value::as_array)
                .map(|errors| {
                    errors
                        .iter()
                        .map(|entry| match entry.as_str() {
                            Some(text) => text.to_string(),
                            None => entry.to_string(),
                        })
                        .collect()
                })
                .unwrap_or_default(),
            total_cost_usd: value
                .get("total_cost_usd")
                .and_then(Value::as_f64)
                .unwrap_or(0.0),
            num_turns: value.get("num_turns").and_then(Value::as_u64).unwrap_or(0) as u32,
            usage: value.get("usage").map(|usage| TokenUsage {
                input_tokens: usage
                    .get("input_tokens")
                    .and_then(Value::as_u64)
                    .unwrap_or(0),
                output_tokens: usage
                    .get("output_tokens")
                    .and_then(Value::as_u64)
                    .unwrap_or(0),
                cache_read_input_tokens: usage
                    .get("cache_read_input_tokens")
                    .and_then(Value::as_u64)
                    .unwrap_or(0),
                total_cost_usd: value
                    .get("total_cost_usd")
                    .and_then(Value::as_f64)
                    .unwrap_or(0.0),
            }),
        }),
        _ => AgentEvent::Other,
    }
}

fn string_field(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
#[path = "agent_test.rs"]
mod agent_test;

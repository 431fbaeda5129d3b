//! Agent invoker: runs the external code-generation agent and reads back the
//! result document it must write.
//!
//! The [`Agent`] trait decouples the controller from the actual agent CLI.
//! Tests use scripted agents that write predetermined documents without
//! spawning processes.
//!
//! Protocol per invocation:
//! 1. delete any stale result document at the expected path;
//! 2. run the agent with the task description on stdin, bounded by a deadline;
//! 3. require a successful exit *and* a freshly written document that parses,
//!    matches the embedded JSON Schema, and names the expected phase.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use jsonschema::validator_for;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::core::types::{
    AgentMode, CommandSpec, ImplementationResult, ImplementationStatus, VerificationReport,
};
use crate::error::AttemptError;
use crate::io::process::{RunOptions, run_command};

const IMPLEMENTATION_RESULT_SCHEMA: &str =
    include_str!("../../schemas/implementation_result.schema.json");
const VERIFICATION_RESULT_SCHEMA: &str =
    include_str!("../../schemas/verification_result.schema.json");

/// Embedded schema for the result document of `mode`.
pub fn schema_for(mode: AgentMode) -> &'static str {
    match mode {
        AgentMode::Implement | AgentMode::Fix => IMPLEMENTATION_RESULT_SCHEMA,
        AgentMode::Verify => VERIFICATION_RESULT_SCHEMA,
    }
}

/// Parameters for one agent invocation.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub phase_id: String,
    pub mode: AgentMode,
    /// Working directory for the agent process.
    pub work_dir: PathBuf,
    /// Task description fed on stdin.
    pub prompt: String,
    pub schema_path: PathBuf,
    /// Where the agent must write its result document.
    pub result_path: PathBuf,
    /// Agent stdout/stderr, streamed as it arrives.
    pub log_path: PathBuf,
    /// Records the agent's process group while it runs.
    pub pgid_marker: PathBuf,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

/// Abstraction over agent backends.
///
/// Implementations return [`AttemptError::InvocationTimeout`] or
/// [`AttemptError::InvocationFailed`] for unsuccessful runs. They must not
/// touch `result_path` other than by writing the document.
pub trait Agent {
    fn exec(&self, request: &AgentRequest) -> Result<()>;
}

/// Agent reached through a configured CLI.
#[derive(Debug, Clone)]
pub struct CommandAgent {
    command: CommandSpec,
}

impl CommandAgent {
    pub fn new(command: CommandSpec) -> Self {
        Self { command }
    }
}

impl Agent for CommandAgent {
    #[instrument(skip_all, fields(phase = %request.phase_id, mode = %request.mode, timeout_secs = request.timeout.as_secs()))]
    fn exec(&self, request: &AgentRequest) -> Result<()> {
        let program = self
            .command
            .program()
            .ok_or_else(|| anyhow!("agent command is empty"))?;
        info!(command = %self.command, work_dir = %request.work_dir.display(), "starting agent");

        let mut cmd = Command::new(program);
        cmd.args(self.command.args())
            .current_dir(&request.work_dir)
            .env("PHASER_PHASE", &request.phase_id)
            .env("PHASER_MODE", request.mode.as_str())
            .env("PHASER_RESULT_PATH", &request.result_path)
            .env("PHASER_SCHEMA_PATH", &request.schema_path);

        let opts = RunOptions {
            stdin: Some(request.prompt.as_bytes()),
            stream_path: Some(&request.log_path),
            pgid_marker: Some(&request.pgid_marker),
            ..RunOptions::new(request.timeout, request.output_limit_bytes)
        };
        let output = match run_command(cmd, &opts) {
            Ok(output) => output,
            Err(err) => {
                warn!(err = %format!("{err:#}"), "agent could not be started");
                return Err(anyhow::Error::new(AttemptError::InvocationFailed(None))
                    .context(format!("start agent `{}`: {err:#}", self.command)));
            }
        };

        if output.timed_out {
            warn!("agent timed out");
            return Err(AttemptError::InvocationTimeout(request.timeout).into());
        }
        if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "agent exited unsuccessfully");
            return Err(AttemptError::InvocationFailed(output.status.code()).into());
        }
        debug!("agent exited successfully");
        Ok(())
    }
}

/// Run the agent in implement or fix mode.
///
/// Fails with [`AttemptError::AgentReportedFailure`] unless the document's
/// status is `complete`.
pub fn invoke_implementation<A: Agent + ?Sized>(
    agent: &A,
    request: &AgentRequest,
) -> Result<ImplementationResult> {
    let result: ImplementationResult = invoke(agent, request)?;
    if result.status != ImplementationStatus::Complete {
        let errors = if result.errors.is_empty() {
            vec!["agent reported status 'failed' without details".to_string()]
        } else {
            result.errors
        };
        return Err(AttemptError::AgentReportedFailure(errors).into());
    }
    info!(deliverables = result.deliverables.len(), "agent reported completion");
    Ok(result)
}

/// Run the agent in verify mode. A `fail` verdict is returned, not raised.
pub fn invoke_verification<A: Agent + ?Sized>(
    agent: &A,
    request: &AgentRequest,
) -> Result<VerificationReport> {
    let report: VerificationReport = invoke(agent, request)?;
    info!(status = ?report.status, issues = report.issues.len(), "agent verification finished");
    Ok(report)
}

#[instrument(skip_all, fields(phase = %request.phase_id, mode = %request.mode))]
fn invoke<A: Agent + ?Sized, T: DeserializeOwned>(agent: &A, request: &AgentRequest) -> Result<T> {
    let schema = schema_for(request.mode);
    prepare(request, schema)?;
    agent.exec(request)?;
    load_result(request, schema)
}

fn prepare(request: &AgentRequest, schema: &str) -> Result<()> {
    match fs::remove_file(&request.result_path) {
        Ok(()) => debug!(path = %request.result_path.display(), "removed stale result document"),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => {
            return Err(err).with_context(|| {
                format!("remove stale result {}", request.result_path.display())
            });
        }
    }
    for dir in [request.result_path.parent(), request.schema_path.parent()]
        .into_iter()
        .flatten()
    {
        fs::create_dir_all(dir).with_context(|| format!("create directory {}", dir.display()))?;
    }
    fs::write(&request.schema_path, schema)
        .with_context(|| format!("write schema {}", request.schema_path.display()))
}

fn load_result<T: DeserializeOwned>(request: &AgentRequest, schema: &str) -> Result<T> {
    let path = &request.result_path;
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Err(violation(format!("no result document at {}", path.display())));
        }
        Err(err) => return Err(err).with_context(|| format!("read result {}", path.display())),
    };
    let value: Value = serde_json::from_str(&contents)
        .map_err(|err| violation(format!("result document is not JSON: {err}")))?;
    validate_schema(schema, &value)?;
    let phase = value.get("phase").and_then(Value::as_str).unwrap_or_default();
    if phase != request.phase_id {
        return Err(violation(format!(
            "result document names phase '{phase}', expected '{}'",
            request.phase_id
        )));
    }
    serde_json::from_value(value)
        .map_err(|err| violation(format!("result document has unexpected shape: {err}")))
}

fn validate_schema(schema: &str, instance: &Value) -> Result<()> {
    let schema_value: Value = serde_json::from_str(schema).context("parse embedded schema")?;
    let compiled =
        validator_for(&schema_value).map_err(|err| anyhow!("invalid schema: {}", err))?;
    let messages: Vec<String> = compiled
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        return Err(violation(format!(
            "result document failed schema validation: {}",
            messages.join("; ")
        )));
    }
    Ok(())
}

fn violation(message: String) -> anyhow::Error {
    AttemptError::InvocationProtocolViolation(message).into()
}

/// Write a result document the way an agent would. Used by scripted agents.
pub fn write_result_document<T: serde::Serialize>(path: &Path, document: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create result dir {}", parent.display()))?;
    }
    let mut buf = serde_json::to_string_pretty(document).context("serialize result")?;
    buf.push('\n');
    fs::write(path, buf).with_context(|| format!("write result {}", path.display()))
}

//! Shared deterministic types for the phase engine.
//!
//! These types define the stable document contracts between the engine and the
//! external agent, and between the verification pipeline and its readers.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Purpose of an agent invocation. All modes share one invocation protocol and
/// differ only in task description and expected result document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentMode {
    Implement,
    Verify,
    Fix,
}

impl AgentMode {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentMode::Implement => "implement",
            AgentMode::Verify => "verify",
            AgentMode::Fix => "fix",
        }
    }
}

impl fmt::Display for AgentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status declared in an implementation or fix result document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImplementationStatus {
    Complete,
    Failed,
}

/// Result document written by the agent in implement and fix modes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImplementationResult {
    pub phase: String,
    pub status: ImplementationStatus,
    #[serde(default)]
    pub deliverables: Vec<String>,
    #[serde(default)]
    pub errors: Vec<String>,
}

/// Pass/fail verdict shared by agent verification and the check pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerifyStatus {
    Pass,
    Fail,
}

/// Result document written by the agent in verify mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationReport {
    pub phase: String,
    pub status: VerifyStatus,
    #[serde(default)]
    pub issues: Vec<String>,
    #[serde(default)]
    pub checks_passed: u32,
    #[serde(default)]
    pub checks_failed: u32,
}

/// One slot of the verification pipeline, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckKind {
    Build,
    Typecheck,
    Lint,
    Test,
}

impl CheckKind {
    /// Pipeline execution order.
    pub const ALL: [CheckKind; 4] = [
        CheckKind::Build,
        CheckKind::Typecheck,
        CheckKind::Lint,
        CheckKind::Test,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CheckKind::Build => "build",
            CheckKind::Typecheck => "typecheck",
            CheckKind::Lint => "lint",
            CheckKind::Test => "test",
        }
    }
}

impl fmt::Display for CheckKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classified outcome of a single check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CheckStatus {
    Pass,
    Fail,
    /// A failing test check on a test-authoring phase; does not fail the phase.
    AcceptedFail,
}

/// Raw process outcome of a check before phase-kind policy is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckOutcome {
    pub passed: bool,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
}

impl CheckOutcome {
    pub fn pass() -> Self {
        Self {
            passed: true,
            exit_code: Some(0),
            timed_out: false,
        }
    }

    pub fn fail(exit_code: i32) -> Self {
        Self {
            passed: false,
            exit_code: Some(exit_code),
            timed_out: false,
        }
    }

    pub fn timed_out() -> Self {
        Self {
            passed: false,
            exit_code: None,
            timed_out: true,
        }
    }
}

/// Recorded result of one configured check within a verification run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResult {
    pub kind: CheckKind,
    pub status: CheckStatus,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    /// Combined stdout/stderr captured for this check.
    pub log_path: PathBuf,
}

/// Aggregate outcome of the verification pipeline for one phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub phase: String,
    pub status: VerifyStatus,
    pub issues: Vec<String>,
    pub checks_passed: u32,
    pub checks_failed: u32,
    pub checks: Vec<CheckResult>,
}

impl VerificationResult {
    pub fn passed(&self) -> bool {
        self.status == VerifyStatus::Pass
    }

    pub fn check(&self, kind: CheckKind) -> Option<&CheckResult> {
        self.checks.iter().find(|check| check.kind == kind)
    }
}

/// A command as a structured argument vector; never interpreted by a shell.
///
/// Deserializes from either an array (`["cargo", "test"]`) or a string, which is
/// split on whitespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "CommandSpecRepr", into = "Vec<String>")]
pub struct CommandSpec(Vec<String>);

#[derive(Deserialize)]
#[serde(untagged)]
enum CommandSpecRepr {
    Args(Vec<String>),
    Line(String),
}

impl From<CommandSpecRepr> for CommandSpec {
    fn from(repr: CommandSpecRepr) -> Self {
        match repr {
            CommandSpecRepr::Args(args) => CommandSpec(args),
            CommandSpecRepr::Line(line) => CommandSpec::from_line(&line),
        }
    }
}

impl From<CommandSpec> for Vec<String> {
    fn from(spec: CommandSpec) -> Self {
        spec.0
    }
}

impl CommandSpec {
    pub fn new<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        CommandSpec(args.into_iter().map(Into::into).collect())
    }

    pub fn from_line(line: &str) -> Self {
        CommandSpec(line.split_whitespace().map(str::to_string).collect())
    }

    /// True if there is no program to run.
    pub fn is_empty(&self) -> bool {
        self.0.first().is_none_or(|program| program.trim().is_empty())
    }

    pub fn program(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    pub fn args(&self) -> &[String] {
        self.0.get(1..).unwrap_or_default()
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join(" "))
    }
}

/// Resolved verification commands; each slot is optional and a missing slot
/// means the check is skipped.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolConfig {
    #[serde(default)]
    pub build_command: Option<CommandSpec>,
    #[serde(default)]
    pub lint_command: Option<CommandSpec>,
    #[serde(default)]
    pub typecheck_command: Option<CommandSpec>,
    #[serde(default)]
    pub test_command: Option<CommandSpec>,
}

impl ToolConfig {
    pub fn get(&self, kind: CheckKind) -> Option<&CommandSpec> {
        let slot = match kind {
            CheckKind::Build => &self.build_command,
            CheckKind::Typecheck => &self.typecheck_command,
            CheckKind::Lint => &self.lint_command,
            CheckKind::Test => &self.test_command,
        };
        slot.as_ref().filter(|spec| !spec.is_empty())
    }

    pub fn slot_mut(&mut self, kind: CheckKind) -> &mut Option<CommandSpec> {
        match kind {
            CheckKind::Build => &mut self.build_command,
            CheckKind::Typecheck => &mut self.typecheck_command,
            CheckKind::Lint => &mut self.lint_command,
            CheckKind::Test => &mut self.test_command,
        }
    }

    /// Configured, non-empty checks in pipeline order.
    pub fn configured(&self) -> Vec<(CheckKind, &CommandSpec)> {
        CheckKind::ALL
            .into_iter()
            .filter_map(|kind| self.get(kind).map(|spec| (kind, spec)))
            .collect()
    }
}

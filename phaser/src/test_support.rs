//! Test-only fakes and fixtures: scripted agent and check backends plus a
//! throwaway plan/work directory pair.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tempfile::TempDir;

use crate::control::{InitOutcome, init, plan_paths};
use crate::core::types::{
    AgentMode, CheckKind, CheckOutcome, ImplementationResult, ImplementationStatus,
    VerificationReport, VerifyStatus,
};
use crate::error::AttemptError;
use crate::io::agent::{Agent, AgentRequest, write_result_document};
use crate::io::checks::{CheckRequest, CheckRunner};
use crate::io::paths::PhaserPaths;
use crate::io::run_state::{RunState, load_run_state};

/// What a scripted agent does for one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentReply {
    /// Write `status: complete`.
    Complete,
    /// Write `status: failed` with these errors.
    Failed(Vec<String>),
    /// Write a passing verification document.
    Pass,
    /// Write a failing verification document with these issues.
    Fail(Vec<String>),
    /// Exit successfully without writing anything.
    NoDocument,
    Timeout,
    Exit(i32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentCall {
    pub phase: String,
    pub mode: AgentMode,
    pub prompt: String,
}

/// Agent that replays queued replies per (phase, mode).
///
/// An empty queue falls back to [`AgentReply::Complete`] for implement/fix and
/// [`AgentReply::Pass`] for verify.
#[derive(Debug, Default)]
pub struct ScriptedAgent {
    replies: RefCell<HashMap<(String, AgentMode), VecDeque<AgentReply>>>,
    calls: RefCell<Vec<AgentCall>>,
}

impl ScriptedAgent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue replies for `phase` in `mode`.
    pub fn script(
        self,
        phase: &str,
        mode: AgentMode,
        replies: impl IntoIterator<Item = AgentReply>,
    ) -> Self {
        self.replies
            .borrow_mut()
            .entry((phase.to_string(), mode))
            .or_default()
            .extend(replies);
        self
    }

    pub fn calls(&self) -> Vec<AgentCall> {
        self.calls.borrow().clone()
    }

    pub fn count(&self, phase: &str, mode: AgentMode) -> usize {
        self.calls
            .borrow()
            .iter()
            .filter(|call| call.phase == phase && call.mode == mode)
            .count()
    }

    /// Phases in the order they first received an invocation.
    pub fn phases_touched(&self) -> Vec<String> {
        let mut phases: Vec<String> = Vec::new();
        for call in self.calls.borrow().iter() {
            if !phases.contains(&call.phase) {
                phases.push(call.phase.clone());
            }
        }
        phases
    }

    fn next_reply(&self, phase: &str, mode: AgentMode) -> AgentReply {
        self.replies
            .borrow_mut()
            .get_mut(&(phase.to_string(), mode))
            .and_then(VecDeque::pop_front)
            .unwrap_or(match mode {
                AgentMode::Implement | AgentMode::Fix => AgentReply::Complete,
                AgentMode::Verify => AgentReply::Pass,
            })
    }
}

impl Agent for ScriptedAgent {
    fn exec(&self, request: &AgentRequest) -> Result<()> {
        self.calls.borrow_mut().push(AgentCall {
            phase: request.phase_id.clone(),
            mode: request.mode,
            prompt: request.prompt.clone(),
        });
        let phase = request.phase_id.clone();
        match self.next_reply(&request.phase_id, request.mode) {
            AgentReply::Complete => write_result_document(
                &request.result_path,
                &ImplementationResult {
                    phase,
                    status: ImplementationStatus::Complete,
                    deliverables: vec!["src/lib.rs".to_string()],
                    errors: Vec::new(),
                },
            ),
            AgentReply::Failed(errors) => write_result_document(
                &request.result_path,
                &ImplementationResult {
                    phase,
                    status: ImplementationStatus::Failed,
                    deliverables: Vec::new(),
                    errors,
                },
            ),
            AgentReply::Pass => write_result_document(
                &request.result_path,
                &VerificationReport {
                    phase,
                    status: VerifyStatus::Pass,
                    issues: Vec::new(),
                    checks_passed: 1,
                    checks_failed: 0,
                },
            ),
            AgentReply::Fail(issues) => write_result_document(
                &request.result_path,
                &VerificationReport {
                    phase,
                    status: VerifyStatus::Fail,
                    checks_passed: 0,
                    checks_failed: u32::try_from(issues.len()).unwrap_or(u32::MAX),
                    issues,
                },
            ),
            AgentReply::NoDocument => Ok(()),
            AgentReply::Timeout => Err(AttemptError::InvocationTimeout(request.timeout).into()),
            AgentReply::Exit(code) => Err(AttemptError::InvocationFailed(Some(code)).into()),
        }
    }
}

/// Check runner that replays queued pass/fail results per (phase, check).
///
/// An empty queue passes. Every run writes a log like the process runner does.
#[derive(Debug, Default)]
pub struct ScriptedCheckRunner {
    results: RefCell<HashMap<(String, CheckKind), VecDeque<bool>>>,
    calls: RefCell<Vec<(String, CheckKind)>>,
}

impl ScriptedCheckRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(
        self,
        phase: &str,
        kind: CheckKind,
        results: impl IntoIterator<Item = bool>,
    ) -> Self {
        self.results
            .borrow_mut()
            .entry((phase.to_string(), kind))
            .or_default()
            .extend(results);
        self
    }

    pub fn calls(&self) -> Vec<(String, CheckKind)> {
        self.calls.borrow().clone()
    }

    pub fn count(&self, phase: &str, kind: CheckKind) -> usize {
        self.calls
            .borrow()
            .iter()
            .filter(|(id, k)| id == phase && *k == kind)
            .count()
    }
}

impl CheckRunner for ScriptedCheckRunner {
    fn run(&self, request: &CheckRequest) -> Result<CheckOutcome> {
        self.calls
            .borrow_mut()
            .push((request.phase_id.clone(), request.kind));
        let passed = self
            .results
            .borrow_mut()
            .get_mut(&(request.phase_id.clone(), request.kind))
            .and_then(VecDeque::pop_front)
            .unwrap_or(true);

        if let Some(parent) = request.log_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let log = if passed {
            format!("$ {}\n{} ok\n", request.command, request.kind)
        } else {
            format!("$ {}\nerror: {} failed for {}\n", request.command, request.kind, request.phase_id)
        };
        fs::write(&request.log_path, log)?;

        Ok(if passed {
            CheckOutcome::pass()
        } else {
            CheckOutcome::fail(1)
        })
    }
}

/// Config that configures every check slot, so scripted checks all run.
pub const ALL_CHECKS_CONFIG: &str = r#"
build_command = "make build"
typecheck_command = "make typecheck"
lint_command = "make lint"
test_command = "make test"
"#;

/// Temporary plan and work directories.
pub struct TestPlan {
    temp: TempDir,
    plan_dir: PathBuf,
    work_dir: PathBuf,
}

impl TestPlan {
    pub fn new() -> Result<Self> {
        let temp = tempfile::tempdir().context("create tempdir")?;
        let plan_dir = temp.path().join("plan");
        let work_dir = temp.path().join("work");
        fs::create_dir_all(&plan_dir).context("create plan dir")?;
        fs::create_dir_all(&work_dir).context("create work dir")?;
        Ok(Self {
            temp,
            plan_dir,
            work_dir,
        })
    }

    pub fn root(&self) -> &Path {
        self.temp.path()
    }

    pub fn plan_dir(&self) -> &Path {
        &self.plan_dir
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Write `<plan>/<id>.md`.
    pub fn phase(&self, id: &str, body: &str) -> Result<()> {
        let path = self.plan_dir.join(format!("{id}.md"));
        fs::write(&path, body).with_context(|| format!("write {}", path.display()))
    }

    /// Write several phases with placeholder instructions.
    pub fn phases(&self, ids: &[&str]) -> Result<()> {
        for id in ids {
            self.phase(id, &format!("Instructions for {id}."))?;
        }
        Ok(())
    }

    pub fn init(&self) -> Result<InitOutcome> {
        init(&self.plan_dir, &self.work_dir, None)
    }

    /// Initialize with a config file holding `toml`.
    pub fn init_with_config(&self, toml: &str) -> Result<InitOutcome> {
        let path = self.temp.path().join("phaser.toml");
        fs::write(&path, toml).context("write config")?;
        init(&self.plan_dir, &self.work_dir, Some(path.as_path()))
    }

    pub fn paths(&self) -> Result<PhaserPaths> {
        plan_paths(&self.plan_dir)
    }

    pub fn state(&self) -> Result<RunState> {
        load_run_state(&self.paths()?.run_state_path)
    }
}

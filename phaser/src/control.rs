//! Control surface: the operations behind each CLI subcommand.
//!
//! Everything here is a thin composition of the plan loader, the run state
//! store, the controller lock and [`crate::controller`]. Operations that mutate
//! run state refuse to run while a live controller holds the plan.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::Serialize;
use tracing::{info, warn};

use crate::controller::{RunOutcome, run_plan};
use crate::error::EngineError;
use crate::io::agent::{Agent, CommandAgent};
use crate::io::checks::{CheckRunner, ProcessCheckRunner};
use crate::io::config::{PhaserConfig, load_config, write_config};
use crate::io::lock::{ControllerLock, live_holder, terminate_controller};
use crate::io::paths::PhaserPaths;
use crate::io::plan::{Plan, load_plan};
use crate::io::process::reap_orphaned_group;
use crate::io::run_state::{
    FailureRecord, RunState, load_run_state, update_run_state, write_run_state,
};
use crate::io::signals::SignalForwarder;
use crate::io::tools::resolve_tools;

/// Result of `init`.
#[derive(Debug, Clone)]
pub struct InitOutcome {
    pub paths: PhaserPaths,
    pub state: RunState,
    pub phase_count: usize,
}

/// Resolve `plan_dir` to its canonical engine paths.
///
/// Fails with [`EngineError::PlanNotFound`] if the directory does not exist.
pub fn plan_paths(plan_dir: &Path) -> Result<PhaserPaths> {
    if !plan_dir.is_dir() {
        return Err(EngineError::PlanNotFound(plan_dir.to_path_buf()).into());
    }
    let canonical = plan_dir
        .canonicalize()
        .with_context(|| format!("resolve plan dir {}", plan_dir.display()))?;
    Ok(PhaserPaths::new(canonical))
}

/// Create the run state for `plan_dir`, resolving the tool commands for
/// `work_dir` once. An explicit `config_path` is copied into the state dir.
pub fn init(plan_dir: &Path, work_dir: &Path, config_path: Option<&Path>) -> Result<InitOutcome> {
    let paths = plan_paths(plan_dir)?;
    let plan = load_plan(&paths.plan_dir)?;
    if paths.run_state_path.exists() {
        return Err(EngineError::AlreadyInitialized(paths.run_state_path.clone()).into());
    }

    let config = match config_path {
        Some(path) if !path.is_file() => {
            return Err(anyhow!("config file not found: {}", path.display()));
        }
        Some(path) => load_config(path)?,
        None => PhaserConfig::default(),
    };
    write_config(&paths.config_path, &config)?;

    fs::create_dir_all(work_dir)
        .with_context(|| format!("create work dir {}", work_dir.display()))?;
    let work_location = work_dir
        .canonicalize()
        .with_context(|| format!("resolve work dir {}", work_dir.display()))?;
    let tools = resolve_tools(&work_location, &config.tool_overrides());
    for (kind, command) in tools.configured() {
        info!(check = %kind, command = %command, "tool resolved");
    }

    let state = RunState::new(paths.plan_dir.clone(), work_location, tools);
    write_run_state(&paths.run_state_path, &state)?;
    info!(
        plan = %paths.plan_dir.display(),
        phases = plan.len(),
        "run initialized"
    );
    Ok(InitOutcome {
        phase_count: plan.len(),
        paths,
        state,
    })
}

/// Run the plan with the configured agent CLI and process-backed checks.
///
/// A termination signal to this process kills the in-flight child group
/// before the controller exits.
pub fn start(plan_dir: &Path) -> Result<RunOutcome> {
    let paths = plan_paths(plan_dir)?;
    let config = load_config(&paths.config_path)?;
    let agent = CommandAgent::new(config.agent.command.clone());
    let _signals = SignalForwarder::install(&paths.child_pgid_path)?;
    start_with(plan_dir, &agent, &ProcessCheckRunner)
}

/// Run the plan with explicit backends, holding the controller lock throughout.
pub fn start_with<A: Agent + ?Sized, C: CheckRunner + ?Sized>(
    plan_dir: &Path,
    agent: &A,
    checks: &C,
) -> Result<RunOutcome> {
    let paths = plan_paths(plan_dir)?;
    load_run_state(&paths.run_state_path)?;
    let _lock = ControllerLock::acquire(&paths.lock_path, &paths.plan_dir)?;
    reap_orphaned_group(&paths.child_pgid_path);

    let plan = load_plan(&paths.plan_dir)?;
    let config = load_config(&paths.config_path)?;
    info!(
        phases = plan.len(),
        max_retries = config.max_retries,
        "starting controller"
    );
    run_plan(&paths, &plan, &config, agent, checks)
}

/// Result of `stop`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    NotRunning,
    Stopped { pid: u32 },
    /// No controller was running, but a child it left behind was killed.
    OrphanKilled { pgid: i32 },
}

/// Terminate the live controller for `plan_dir` and its in-flight child.
pub fn stop(plan_dir: &Path) -> Result<StopOutcome> {
    let paths = plan_paths(plan_dir)?;
    let Some(holder) = live_holder(&paths.lock_path, &paths.plan_dir) else {
        return Ok(match reap_orphaned_group(&paths.child_pgid_path) {
            Some(pgid) => StopOutcome::OrphanKilled { pgid },
            None => StopOutcome::NotRunning,
        });
    };
    let pid = holder.pid().ok_or_else(|| {
        anyhow!(
            "{} is held by a controller that has not recorded its pid yet",
            paths.lock_path.display()
        )
    })?;
    terminate_controller(pid, &paths.child_pgid_path)?;
    Ok(StopOutcome::Stopped { pid })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedPhase {
    pub id: String,
    pub attempts: u32,
    pub last_error: String,
}

/// Snapshot of run progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub running: bool,
    pub pid: Option<u32>,
    /// Plan phases already completed.
    pub completed: usize,
    pub total: usize,
    pub current_phase: Option<String>,
    pub completed_phases: Vec<String>,
    /// Phases with recorded failures that have not completed.
    pub failed: Vec<FailedPhase>,
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.pid {
            Some(pid) if self.running => writeln!(f, "controller: running (pid {pid})")?,
            _ => writeln!(f, "controller: stopped")?,
        }
        writeln!(f, "progress: {}/{} phases completed", self.completed, self.total)?;
        writeln!(
            f,
            "current phase: {}",
            self.current_phase.as_deref().unwrap_or("-")
        )?;
        for failed in &self.failed {
            writeln!(
                f,
                "failed: {} ({} attempts): {}",
                failed.id, failed.attempts, failed.last_error
            )?;
        }
        Ok(())
    }
}

/// Read-only progress snapshot; never blocks a running controller.
pub fn status(plan_dir: &Path) -> Result<StatusReport> {
    let paths = plan_paths(plan_dir)?;
    let state = load_run_state(&paths.run_state_path)?;
    let plan = load_plan(&paths.plan_dir)?;
    let holder = live_holder(&paths.lock_path, &paths.plan_dir);

    let completed = plan
        .phases
        .iter()
        .filter(|phase| state.is_completed(&phase.id))
        .count();
    let failed = state
        .failed_attempts
        .iter()
        .filter(|(id, _)| !state.is_completed(id))
        .map(|(id, record)| FailedPhase {
            id: id.clone(),
            attempts: record.attempts,
            last_error: record.last_error.clone(),
        })
        .collect();
    Ok(StatusReport {
        running: holder.is_some(),
        pid: holder.and_then(|holder| holder.pid()),
        completed,
        total: plan.len(),
        current_phase: state.current_phase.clone(),
        completed_phases: state.completed_phases.clone(),
        failed,
    })
}

/// Discard all progress and start over with freshly resolved tools.
pub fn reset(plan_dir: &Path) -> Result<RunState> {
    let paths = idle_paths(plan_dir)?;
    let previous = load_run_state(&paths.run_state_path)?;
    let config = load_config(&paths.config_path)?;
    let tools = resolve_tools(&previous.work_location, &config.tool_overrides());
    let state = RunState::new(previous.plan_location, previous.work_location, tools);
    write_run_state(&paths.run_state_path, &state)?;

    match fs::remove_dir_all(&paths.results_dir) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => {
            return Err(err)
                .with_context(|| format!("remove results {}", paths.results_dir.display()));
        }
    }
    info!("run reset");
    Ok(state)
}

/// Forget completion and failures of one phase so it runs again.
pub fn reset_phase(plan_dir: &Path, phase_id: &str) -> Result<RunState> {
    let (paths, _) = idle_plan(plan_dir, phase_id)?;
    let (state, ()) = update_run_state(&paths.run_state_path, |state| {
        state.reset_phase(phase_id);
        Ok(())
    })?;
    info!(phase = %phase_id, "phase reset");
    Ok(state)
}

/// Mark a phase completed without running it.
///
/// Returns `false` if it was already completed.
pub fn skip_phase(plan_dir: &Path, phase_id: &str) -> Result<bool> {
    let (paths, _) = idle_plan(plan_dir, phase_id)?;
    let (_, newly) = update_run_state(&paths.run_state_path, |state| {
        let newly = !state.is_completed(phase_id);
        state.mark_completed(phase_id);
        Ok(newly)
    })?;
    if newly {
        warn!(phase = %phase_id, "phase skipped without execution");
    }
    Ok(newly)
}

/// Clear the accumulated failure state of the current phase only.
///
/// Returns the current phase id and the record that was cleared, if any.
pub fn retry_current(plan_dir: &Path) -> Result<(String, Option<FailureRecord>)> {
    let paths = idle_paths(plan_dir)?;
    let (_, cleared) = update_run_state(&paths.run_state_path, |state| {
        let current = state
            .current_phase
            .clone()
            .ok_or(EngineError::NoCurrentPhase)?;
        let record = state.clear_failure(&current);
        Ok((current, record))
    })?;
    info!(phase = %cleared.0, "failure state cleared");
    Ok(cleared)
}

/// Controller log, or every log file of one phase with a header per file.
pub fn logs(plan_dir: &Path, phase_id: Option<&str>) -> Result<String> {
    let paths = plan_paths(plan_dir)?;
    let Some(phase_id) = phase_id else {
        return read_optional(&paths.controller_log_path);
    };
    let plan = load_plan(&paths.plan_dir)?;
    if !plan.contains(phase_id) {
        return Err(EngineError::UnknownPhase(phase_id.to_string()).into());
    }

    let dir = paths.phase_log_dir(phase_id);
    let mut files: Vec<PathBuf> = match fs::read_dir(&dir) {
        Ok(entries) => entries
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .filter(|path| path.is_file())
            .collect(),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Vec::new(),
        Err(err) => {
            return Err(err).with_context(|| format!("read log dir {}", dir.display()));
        }
    };
    files.sort();

    let mut out = String::new();
    for path in files {
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        out.push_str(&format!("==> {name} <==\n"));
        out.push_str(&read_optional(&path)?);
        if !out.ends_with('\n') {
            out.push('\n');
        }
    }
    Ok(out)
}

fn read_optional(path: &Path) -> Result<String> {
    match fs::read(path) {
        Ok(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(String::new()),
        Err(err) => Err(err).with_context(|| format!("read {}", path.display())),
    }
}

fn idle_paths(plan_dir: &Path) -> Result<PhaserPaths> {
    let paths = plan_paths(plan_dir)?;
    if let Some(holder) = live_holder(&paths.lock_path, &paths.plan_dir) {
        return Err(EngineError::ControllerAlreadyRunning {
            plan: paths.plan_dir.clone(),
            pid: holder.pid(),
        }
        .into());
    }
    Ok(paths)
}

fn idle_plan(plan_dir: &Path, phase_id: &str) -> Result<(PhaserPaths, Plan)> {
    let paths = idle_paths(plan_dir)?;
    let plan = load_plan(&paths.plan_dir)?;
    if !plan.contains(phase_id) {
        return Err(EngineError::UnknownPhase(phase_id.to_string()).into());
    }
    Ok((paths, plan))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::CommandSpec;
    use crate::test_support::TestPlan;

    fn engine_error(err: &anyhow::Error) -> &EngineError {
        err.downcast_ref::<EngineError>().expect("engine error")
    }

    #[test]
    fn init_twice_is_already_initialized() {
        let plan = TestPlan::new().expect("plan");
        plan.phase("01-stub", "stub it").expect("phase");
        plan.init().expect("init");

        let err = init(plan.plan_dir(), plan.work_dir(), None).expect_err("second init");
        assert!(matches!(
            engine_error(&err),
            EngineError::AlreadyInitialized(_)
        ));
    }

    #[test]
    fn init_missing_plan_is_plan_not_found() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = init(&temp.path().join("nope"), temp.path(), None).expect_err("missing");
        assert!(matches!(engine_error(&err), EngineError::PlanNotFound(_)));
    }

    #[test]
    fn init_copies_config_and_prefers_overrides() {
        let plan = TestPlan::new().expect("plan");
        plan.phase("01-stub", "x").expect("phase");
        let config_path = plan.root().join("phaser.toml");
        fs::write(&config_path, "test_command = \"make check\"\nmax_retries = 1\n")
            .expect("config");

        let outcome =
            init(plan.plan_dir(), plan.work_dir(), Some(config_path.as_path())).expect("init");
        assert_eq!(
            outcome.state.tools.test_command,
            Some(CommandSpec::new(["make", "check"]))
        );
        let copied = load_config(&outcome.paths.config_path).expect("copied config");
        assert_eq!(copied.max_retries, 1);
    }

    #[test]
    fn status_counts_plan_phases() {
        let plan = TestPlan::new().expect("plan");
        plan.phase("01-stub", "x").expect("phase");
        plan.phase("02-tests", "y").expect("phase");
        plan.init().expect("init");
        skip_phase(plan.plan_dir(), "01-stub").expect("skip");

        let report = status(plan.plan_dir()).expect("status");
        assert!(!report.running);
        assert_eq!(report.completed, 1);
        assert_eq!(report.total, 2);
        assert_eq!(report.current_phase, None);
        assert!(report.to_string().contains("1/2 phases completed"));
    }

    #[test]
    fn phase_operations_reject_unknown_ids() {
        let plan = TestPlan::new().expect("plan");
        plan.phase("01-stub", "x").expect("phase");
        plan.init().expect("init");

        for err in [
            skip_phase(plan.plan_dir(), "09-nope").expect_err("skip"),
            reset_phase(plan.plan_dir(), "09-nope").map(|_| ()).expect_err("reset"),
            logs(plan.plan_dir(), Some("09-nope")).map(|_| ()).expect_err("logs"),
        ] {
            assert!(matches!(engine_error(&err), EngineError::UnknownPhase(_)));
        }
    }

    #[test]
    fn retry_without_current_phase_is_refused() {
        let plan = TestPlan::new().expect("plan");
        plan.phase("01-stub", "x").expect("phase");
        plan.init().expect("init");
        let err = retry_current(plan.plan_dir()).expect_err("no current");
        assert!(matches!(engine_error(&err), EngineError::NoCurrentPhase));
    }

    #[test]
    fn logs_concatenate_phase_files() {
        let plan = TestPlan::new().expect("plan");
        plan.phase("01-stub", "x").expect("phase");
        plan.init().expect("init");
        let paths = plan.paths().expect("paths");
        let dir = paths.phase_log_dir("01-stub");
        fs::create_dir_all(&dir).expect("mkdir");
        fs::write(dir.join("build.log"), "built").expect("write");
        fs::write(dir.join("test.log"), "tested\n").expect("write");

        let out = logs(plan.plan_dir(), Some("01-stub")).expect("logs");
        assert_eq!(out, "==> build.log <==\nbuilt\n==> test.log <==\ntested\n");
        assert_eq!(logs(plan.plan_dir(), None).expect("controller log"), "");
    }

    #[cfg(unix)]
    #[test]
    fn stop_without_controller_kills_leftover_child_group() {
        use std::os::unix::process::CommandExt;
        use std::process::Command;

        let plan = TestPlan::new().expect("plan");
        plan.phase("01-stub", "x").expect("phase");
        plan.init().expect("init");
        let paths = plan.paths().expect("paths");
        assert_eq!(stop(plan.plan_dir()).expect("stop"), StopOutcome::NotRunning);

        let mut orphan = Command::new("sleep")
            .arg("30")
            .process_group(0)
            .spawn()
            .expect("spawn");
        fs::write(&paths.child_pgid_path, format!("{}\n", orphan.id())).expect("marker");

        let outcome = stop(plan.plan_dir()).expect("stop");
        let pgid = i32::try_from(orphan.id()).expect("pid");
        assert_eq!(outcome, StopOutcome::OrphanKilled { pgid });
        assert!(!orphan.wait().expect("wait").success());
        assert!(!paths.child_pgid_path.exists());
    }
}

//! Canonical paths within `<plan>/.phaser/`.

use std::path::{Path, PathBuf};

use crate::core::types::{AgentMode, CheckKind};

pub const STATE_DIR_NAME: &str = ".phaser";

/// All engine-owned paths for one plan directory.
#[derive(Debug, Clone)]
pub struct PhaserPaths {
    pub plan_dir: PathBuf,
    pub state_dir: PathBuf,
    pub run_state_path: PathBuf,
    pub config_path: PathBuf,
    pub lock_path: PathBuf,
    /// Process group of the in-flight child, present only while one runs.
    pub child_pgid_path: PathBuf,
    pub schemas_dir: PathBuf,
    pub results_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub controller_log_path: PathBuf,
}

impl PhaserPaths {
    pub fn new(plan_dir: impl Into<PathBuf>) -> Self {
        let plan_dir = plan_dir.into();
        let state_dir = plan_dir.join(STATE_DIR_NAME);
        let logs_dir = state_dir.join("logs");
        Self {
            plan_dir: plan_dir.clone(),
            state_dir: state_dir.clone(),
            run_state_path: state_dir.join("state.json"),
            config_path: state_dir.join("config.toml"),
            lock_path: state_dir.join("controller.lock"),
            child_pgid_path: state_dir.join("child.pgid"),
            schemas_dir: state_dir.join("schemas"),
            results_dir: state_dir.join("results"),
            controller_log_path: logs_dir.join("controller.log"),
            logs_dir,
        }
    }

    pub fn phase_log_dir(&self, phase_id: &str) -> PathBuf {
        self.logs_dir.join(phase_id)
    }

    pub fn check_log_path(&self, phase_id: &str, kind: CheckKind) -> PathBuf {
        self.phase_log_dir(phase_id)
            .join(format!("{}.log", kind.as_str()))
    }

    pub fn verification_summary_path(&self, phase_id: &str) -> PathBuf {
        self.phase_log_dir(phase_id).join("verification.json")
    }

    pub fn agent_log_path(&self, phase_id: &str, mode: AgentMode) -> PathBuf {
        self.phase_log_dir(phase_id)
            .join(format!("agent.{}.log", mode.as_str()))
    }

    pub fn result_path(&self, phase_id: &str, mode: AgentMode) -> PathBuf {
        self.results_dir
            .join(format!("{phase_id}.{}.json", mode.as_str()))
    }

    pub fn schema_path(&self, mode: AgentMode) -> PathBuf {
        let name = match mode {
            AgentMode::Implement | AgentMode::Fix => "implementation_result.schema.json",
            AgentMode::Verify => "verification_result.schema.json",
        };
        self.schemas_dir.join(name)
    }

    pub fn plan_dir(&self) -> &Path {
        &self.plan_dir
    }
}

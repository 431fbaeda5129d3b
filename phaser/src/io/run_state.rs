//! Run state store: the crash-safe progress document (`.phaser/state.json`).
//!
//! Every mutation is a read-modify-write of the whole document, written to a
//! temp file and renamed over the original, so readers only ever observe
//! complete snapshots.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::invariants::validate_progress;
use crate::core::types::ToolConfig;
use crate::error::EngineError;

/// Accumulated failure state of one phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    /// Failed Executing/Verifying cycles so far.
    pub attempts: u32,
    pub last_error: String,
    pub timestamp: DateTime<Utc>,
}

/// Persisted progress of one plan execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunState {
    pub plan_location: PathBuf,
    pub work_location: PathBuf,
    pub current_phase: Option<String>,
    /// Completed phase ids in completion order.
    pub completed_phases: Vec<String>,
    #[serde(default)]
    pub failed_attempts: BTreeMap<String, FailureRecord>,
    pub created_at: DateTime<Utc>,
    /// Resolved once at init and reused on every resume.
    #[serde(flatten)]
    pub tools: ToolConfig,
}

impl RunState {
    pub fn new(plan_location: PathBuf, work_location: PathBuf, tools: ToolConfig) -> Self {
        Self {
            plan_location,
            work_location,
            current_phase: None,
            completed_phases: Vec::new(),
            failed_attempts: BTreeMap::new(),
            created_at: Utc::now(),
            tools,
        }
    }

    pub fn is_completed(&self, phase_id: &str) -> bool {
        self.completed_phases.iter().any(|id| id == phase_id)
    }

    pub fn attempts(&self, phase_id: &str) -> u32 {
        self.failed_attempts
            .get(phase_id)
            .map_or(0, |record| record.attempts)
    }

    pub fn last_error(&self, phase_id: &str) -> Option<&str> {
        self.failed_attempts
            .get(phase_id)
            .map(|record| record.last_error.as_str())
    }

    /// Record one failed cycle; returns the new attempt count.
    pub fn record_failure(&mut self, phase_id: &str, error: impl Into<String>) -> u32 {
        let record = self
            .failed_attempts
            .entry(phase_id.to_string())
            .or_insert_with(|| FailureRecord {
                attempts: 0,
                last_error: String::new(),
                timestamp: Utc::now(),
            });
        record.attempts += 1;
        record.last_error = error.into();
        record.timestamp = Utc::now();
        record.attempts
    }

    /// Append to `completed_phases` (once) and clear `current_phase` if it
    /// names this phase. Failure records are kept.
    pub fn mark_completed(&mut self, phase_id: &str) {
        if !self.is_completed(phase_id) {
            self.completed_phases.push(phase_id.to_string());
        }
        if self.current_phase.as_deref() == Some(phase_id) {
            self.current_phase = None;
        }
    }

    pub fn clear_failure(&mut self, phase_id: &str) -> Option<FailureRecord> {
        self.failed_attempts.remove(phase_id)
    }

    /// Forget everything about a phase so it runs again from scratch.
    pub fn reset_phase(&mut self, phase_id: &str) {
        self.completed_phases.retain(|id| id != phase_id);
        self.failed_attempts.remove(phase_id);
        if self.current_phase.as_deref() == Some(phase_id) {
            self.current_phase = None;
        }
    }

    pub fn validate(&self) -> Vec<String> {
        validate_progress(&self.completed_phases, self.current_phase.as_deref())
    }
}

/// Load run state from disk.
///
/// A missing document is [`EngineError::NotInitialized`]; an unreadable,
/// malformed, or invariant-violating one is [`EngineError::StateCorruption`].
pub fn load_run_state(path: &Path) -> Result<RunState> {
    debug!(path = %path.display(), "loading run state");
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Err(EngineError::NotInitialized(path.to_path_buf()).into());
        }
        Err(err) => return Err(corruption(path, err.to_string())),
    };
    let state: RunState =
        serde_json::from_str(&contents).map_err(|err| corruption(path, err.to_string()))?;
    let errors = state.validate();
    if !errors.is_empty() {
        return Err(corruption(path, errors.join("; ")));
    }
    debug!(
        completed = state.completed_phases.len(),
        current = ?state.current_phase,
        "run state loaded"
    );
    Ok(state)
}

/// Load the document, creating it with `create` if absent.
pub fn load_or_create_run_state(
    path: &Path,
    create: impl FnOnce() -> RunState,
) -> Result<RunState> {
    if path.exists() {
        return load_run_state(path);
    }
    let state = create();
    write_run_state(path, &state)?;
    Ok(state)
}

/// Atomic read-modify-write of the whole document.
pub fn update_run_state<T>(
    path: &Path,
    mutate: impl FnOnce(&mut RunState) -> Result<T>,
) -> Result<(RunState, T)> {
    let mut state = load_run_state(path)?;
    let value = mutate(&mut state)?;
    write_run_state(path, &state)?;
    Ok((state, value))
}

/// Atomically write run state to disk (temp file + rename).
pub fn write_run_state(path: &Path, state: &RunState) -> Result<()> {
    let errors = state.validate();
    if !errors.is_empty() {
        anyhow::bail!("refusing to write invalid run state: {}", errors.join("; "));
    }
    debug!(
        path = %path.display(),
        completed = state.completed_phases.len(),
        current = ?state.current_phase,
        "writing run state"
    );
    let mut buf = serde_json::to_string_pretty(state)?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn corruption(path: &Path, reason: String) -> anyhow::Error {
    EngineError::StateCorruption {
        path: path.to_path_buf(),
        reason,
    }
    .into()
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("run state path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("json.tmp");
    let mut tmp = File::create(&tmp_path)
        .with_context(|| format!("create temp run state {}", tmp_path.display()))?;
    tmp.write_all(contents.as_bytes())
        .and_then(|()| tmp.sync_all())
        .with_context(|| format!("write temp run state {}", tmp_path.display()))?;
    drop(tmp);
    fs::rename(&tmp_path, path).with_context(|| format!("replace run state {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::CommandSpec;
    use serde_json::Value;

    fn sample() -> RunState {
        RunState::new(
            PathBuf::from("/plan"),
            PathBuf::from("/work"),
            ToolConfig {
                test_command: Some(CommandSpec::new(["cargo", "test"])),
                ..ToolConfig::default()
            },
        )
    }

    #[test]
    fn run_state_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("state.json");

        let mut state = sample();
        state.current_phase = Some("02-tests".to_string());
        state.mark_completed("01-stub");
        state.record_failure("02-tests", "lint check failed");

        write_run_state(&path, &state).expect("write");
        let loaded = load_run_state(&path).expect("load");
        assert_eq!(loaded, state);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn leftover_temp_file_from_interrupted_write_is_replaced() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("state.json");
        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, "{\"plan_location\": \"/pl").expect("partial temp");

        write_run_state(&path, &sample()).expect("write");
        assert_eq!(load_run_state(&path).expect("load"), sample());
        assert!(!tmp_path.exists());
    }

    #[test]
    fn document_uses_flat_tool_fields() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("state.json");
        write_run_state(&path, &sample()).expect("write");

        let value: Value =
            serde_json::from_str(&fs::read_to_string(&path).expect("read")).expect("json");
        assert_eq!(value["test_command"], serde_json::json!(["cargo", "test"]));
        assert_eq!(value["build_command"], Value::Null);
        assert_eq!(value["current_phase"], Value::Null);
        assert_eq!(value["completed_phases"], serde_json::json!([]));
        assert!(value["created_at"].is_string());
    }

    #[test]
    fn malformed_document_is_state_corruption() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("state.json");
        fs::write(&path, "{\"plan_location\": ").expect("write");
        let err = load_run_state(&path).expect_err("corrupt");
        assert!(matches!(
            err.downcast_ref::<EngineError>(),
            Some(EngineError::StateCorruption { .. })
        ));
    }

    #[test]
    fn invariant_violation_is_state_corruption() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("state.json");
        let mut state = sample();
        state.mark_completed("01-stub");
        let mut value = serde_json::to_value(&state).expect("value");
        value["current_phase"] = Value::String("01-stub".to_string());
        fs::write(&path, value.to_string()).expect("write");

        let err = load_run_state(&path).expect_err("invalid");
        assert!(err.to_string().contains("already in completed_phases"));
    }

    #[test]
    fn missing_document_is_not_initialized() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = load_run_state(&temp.path().join("state.json")).expect_err("missing");
        assert!(matches!(
            err.downcast_ref::<EngineError>(),
            Some(EngineError::NotInitialized(_))
        ));
    }

    #[test]
    fn attempts_increase_by_one_per_failure() {
        let mut state = sample();
        assert_eq!(state.attempts("03-impl"), 0);
        assert_eq!(state.record_failure("03-impl", "first"), 1);
        assert_eq!(state.record_failure("03-impl", "second"), 2);
        assert_eq!(state.last_error("03-impl"), Some("second"));

        state.current_phase = Some("03-impl".to_string());
        state.mark_completed("03-impl");
        assert_eq!(state.current_phase, None);
        assert_eq!(state.attempts("03-impl"), 2);
    }

    #[test]
    fn update_is_read_modify_write() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("state.json");
        load_or_create_run_state(&path, sample).expect("create");

        let (state, attempts) = update_run_state(&path, |state| {
            state.current_phase = Some("01-stub".to_string());
            Ok(state.record_failure("01-stub", "boom"))
        })
        .expect("update");
        assert_eq!(attempts, 1);
        assert_eq!(load_run_state(&path).expect("load"), state);
    }

    #[test]
    fn reset_phase_forgets_completion_and_failures() {
        let mut state = sample();
        state.record_failure("01-stub", "boom");
        state.mark_completed("01-stub");
        state.reset_phase("01-stub");
        assert!(!state.is_completed("01-stub"));
        assert_eq!(state.attempts("01-stub"), 0);
    }
}

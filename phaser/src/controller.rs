//! Retry/fix controller: drives each remaining phase through
//! implement → verify → (fix → verify)* under a retry budget.
//!
//! Phases run strictly in plan order. The first phase that exhausts its budget
//! stops the run; nothing after it leaves Pending.

use std::path::Path;

use anyhow::Result;
use tracing::{debug, info, info_span, warn};

use crate::core::retry::{RetryDecision, after_failed_cycle, has_budget};
use crate::core::state_machine::{PhaseMachine, PhaseState};
use crate::core::types::{AgentMode, ToolConfig, VerifyStatus};
use crate::core::verdict::compose_fix_issues;
use crate::error::{AttemptError, EngineError, attempt_error};
use crate::io::agent::{Agent, AgentRequest, invoke_implementation, invoke_verification};
use crate::io::checks::{CheckRunner, PipelineRequest, failing_excerpts, run_verification};
use crate::io::config::PhaserConfig;
use crate::io::paths::PhaserPaths;
use crate::io::plan::{Phase, Plan};
use crate::io::prompt::{PromptBuilder, TaskInputs};
use crate::io::run_state::{RunState, load_run_state, update_run_state};

/// Why a run stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStop {
    /// Every plan phase is completed.
    Completed,
    /// A phase exhausted its retry budget; later phases were not started.
    Failed {
        phase: String,
        attempts: u32,
        last_error: String,
    },
}

/// Summary of one controller run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    /// Phases completed during this run, in order.
    pub completed: Vec<String>,
    /// Phases skipped because an earlier run already completed them.
    pub resumed_past: Vec<String>,
    pub stop: RunStop,
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        self.stop == RunStop::Completed
    }

    /// The run-level error for a failed run.
    pub fn failure(&self) -> Option<EngineError> {
        match &self.stop {
            RunStop::Completed => None,
            RunStop::Failed {
                phase,
                attempts,
                last_error,
            } => Some(EngineError::RetryBudgetExhausted {
                phase: phase.clone(),
                attempts: *attempts,
                last_error: last_error.clone(),
            }),
        }
    }
}

enum PhaseOutcome {
    Completed,
    Failed { attempts: u32, last_error: String },
}

/// Outcome of one Verifying step across both verification layers.
struct CycleVerdict {
    passed: bool,
    /// Short description recorded as the failure's `last_error`.
    summary: String,
    /// Feedback for the fix invocation.
    fix_issues: Vec<String>,
}

/// Run every remaining phase of `plan` to completion or first failure.
pub fn run_plan<A: Agent + ?Sized, C: CheckRunner + ?Sized>(
    paths: &PhaserPaths,
    plan: &Plan,
    config: &PhaserConfig,
    agent: &A,
    checks: &C,
) -> Result<RunOutcome> {
    Controller::new(paths, plan, config, agent, checks).run()
}

/// Drives phases for one plan. Holds no mutable state of its own; progress
/// lives in the run state document.
pub struct Controller<'a, A: Agent + ?Sized, C: CheckRunner + ?Sized> {
    paths: &'a PhaserPaths,
    plan: &'a Plan,
    config: &'a PhaserConfig,
    agent: &'a A,
    checks: &'a C,
}

impl<'a, A: Agent + ?Sized, C: CheckRunner + ?Sized> Controller<'a, A, C> {
    pub fn new(
        paths: &'a PhaserPaths,
        plan: &'a Plan,
        config: &'a PhaserConfig,
        agent: &'a A,
        checks: &'a C,
    ) -> Self {
        Self {
            paths,
            plan,
            config,
            agent,
            checks,
        }
    }

    /// Run every phase not yet completed, resuming from the run state.
    pub fn run(&self) -> Result<RunOutcome> {
        let state = load_run_state(&self.paths.run_state_path)?;
        for id in &state.completed_phases {
            if !self.plan.contains(id) {
                warn!(phase = %id, "completed phase is no longer in the plan");
            }
        }
        let resumed_past: Vec<String> = self
            .plan
            .phases
            .iter()
            .filter(|phase| state.is_completed(&phase.id))
            .map(|phase| phase.id.clone())
            .collect();
        if !resumed_past.is_empty() {
            info!(count = resumed_past.len(), "resuming past completed phases");
        }

        let mut completed = Vec::new();
        for phase in self.plan.remaining(&state.completed_phases) {
            let span = info_span!("phase", id = %phase.id);
            let _enter = span.enter();
            match self.run_phase(phase)? {
                PhaseOutcome::Completed => completed.push(phase.id.clone()),
                PhaseOutcome::Failed {
                    attempts,
                    last_error,
                } => {
                    warn!(attempts, "phase failed; stopping run");
                    return Ok(RunOutcome {
                        completed,
                        resumed_past,
                        stop: RunStop::Failed {
                            phase: phase.id.clone(),
                            attempts,
                            last_error,
                        },
                    });
                }
            }
        }
        info!(completed = completed.len(), "all phases completed");
        Ok(RunOutcome {
            completed,
            resumed_past,
            stop: RunStop::Completed,
        })
    }

    fn run_phase(&self, phase: &Phase) -> Result<PhaseOutcome> {
        let (state, ()) = update_run_state(&self.paths.run_state_path, |state| {
            state.current_phase = Some(phase.id.clone());
            Ok(())
        })?;
        let step = Step {
            phase,
            tools: &state.tools,
            work_dir: &state.work_location,
        };
        let mut machine = PhaseMachine::new(&phase.id);

        let prior = state.attempts(&phase.id);
        if !has_budget(prior, self.config.max_retries) {
            machine.transition(PhaseState::Failed)?;
            return Ok(PhaseOutcome::Failed {
                attempts: prior,
                last_error: state.last_error(&phase.id).unwrap_or_default().to_string(),
            });
        }
        if prior > 0 {
            info!(attempts = prior, "resuming phase with recorded failures");
        }

        self.enter(&mut machine, PhaseState::Executing)?;
        loop {
            match self.implement(&step) {
                Ok(()) => break,
                Err(err) => {
                    let Some(attempt) = attempt_error(&err) else {
                        return Err(err);
                    };
                    let last_error = format!("implement: {attempt}");
                    warn!(error = %last_error, "implement invocation failed");
                    if let Some(failed) = self.record_failure(&mut machine, phase, last_error)? {
                        return Ok(failed);
                    }
                    self.enter(&mut machine, PhaseState::Executing)?;
                }
            }
        }

        self.enter(&mut machine, PhaseState::Verifying)?;
        loop {
            let verdict = self.verify(&step)?;
            if verdict.passed {
                self.enter(&mut machine, PhaseState::Completed)?;
                update_run_state(&self.paths.run_state_path, |state| {
                    state.mark_completed(&phase.id);
                    Ok(())
                })?;
                info!("phase completed");
                return Ok(PhaseOutcome::Completed);
            }
            if let Some(failed) = self.record_failure(&mut machine, phase, verdict.summary)? {
                return Ok(failed);
            }
            self.enter(&mut machine, PhaseState::Fixing)?;
            self.fix(&step, &verdict.fix_issues)?;
            self.enter(&mut machine, PhaseState::Verifying)?;
        }
    }

    fn enter(&self, machine: &mut PhaseMachine, to: PhaseState) -> Result<()> {
        let from = machine.transition(to)?;
        debug!(%from, %to, "phase transition");
        Ok(())
    }

    /// Persist one failed cycle. Returns the final outcome if the budget is spent.
    fn record_failure(
        &self,
        machine: &mut PhaseMachine,
        phase: &Phase,
        last_error: String,
    ) -> Result<Option<PhaseOutcome>> {
        let (_, attempts) = update_run_state(&self.paths.run_state_path, |state| {
            Ok(state.record_failure(&phase.id, last_error.clone()))
        })?;
        match after_failed_cycle(attempts, self.config.max_retries) {
            RetryDecision::Retry => {
                info!(
                    attempts,
                    max_retries = self.config.max_retries,
                    "cycle failed; retrying"
                );
                Ok(None)
            }
            RetryDecision::Exhausted => {
                self.enter(machine, PhaseState::Failed)?;
                Ok(Some(PhaseOutcome::Failed {
                    attempts,
                    last_error,
                }))
            }
        }
    }

    fn implement(&self, step: &Step<'_>) -> Result<()> {
        // Reloaded per attempt so the prompt carries the latest failure.
        let state = load_run_state(&self.paths.run_state_path)?;
        let overview = plan_overview(self.plan, &state);
        let request = self.request(
            step,
            AgentMode::Implement,
            Extras {
                previous_error: state.last_error(&step.phase.id),
                plan_overview: Some(overview.as_str()),
                ..Extras::default()
            },
        )?;
        invoke_implementation(self.agent, &request)?;
        Ok(())
    }

    fn verify(&self, step: &Step<'_>) -> Result<CycleVerdict> {
        let phase = step.phase;
        let mut agent_issues = Vec::new();
        let mut agent_passed = true;
        if let Some(verification) = &phase.verification {
            let request = self.request(
                step,
                AgentMode::Verify,
                Extras {
                    verification: Some((
                        verification.id.as_str(),
                        verification.instructions.as_str(),
                    )),
                    ..Extras::default()
                },
            )?;
            match invoke_verification(self.agent, &request) {
                Ok(report) if report.status == VerifyStatus::Pass => {
                    debug!(verification = %verification.id, "agent verification passed");
                }
                Ok(report) => {
                    agent_passed = false;
                    agent_issues = if report.issues.is_empty() {
                        vec![format!("{} reported failure", verification.id)]
                    } else {
                        report.issues
                    };
                }
                Err(err) => {
                    let Some(attempt) = attempt_error(&err) else {
                        return Err(err);
                    };
                    agent_passed = false;
                    agent_issues = vec![format!("{}: {attempt}", verification.id)];
                }
            }
        }

        let pipeline = run_verification(
            self.checks,
            &PipelineRequest {
                phase_id: &phase.id,
                phase_kind: phase.kind,
                tools: step.tools,
                work_dir: step.work_dir,
                paths: self.paths,
                timeout: self.config.check_timeout(),
                output_limit_bytes: self.config.output_limit_bytes,
            },
        )?;

        let mut summary_issues = agent_issues.clone();
        summary_issues.extend(pipeline.issues.iter().cloned());
        let excerpts = failing_excerpts(&pipeline, self.config.failure_excerpt_bytes);
        Ok(CycleVerdict {
            passed: agent_passed && pipeline.passed(),
            summary: AttemptError::VerificationFailure(summary_issues).to_string(),
            fix_issues: compose_fix_issues(&agent_issues, &excerpts),
        })
    }

    /// A fix invocation's own outcome never decides the phase; the next
    /// Verifying step does.
    fn fix(&self, step: &Step<'_>, issues: &[String]) -> Result<()> {
        let request = self.request(
            step,
            AgentMode::Fix,
            Extras {
                issues,
                ..Extras::default()
            },
        )?;
        match invoke_implementation(self.agent, &request) {
            Ok(_) => Ok(()),
            Err(err) => match attempt_error(&err) {
                Some(attempt) => {
                    warn!(error = %attempt, "fix invocation failed; re-verifying anyway");
                    Ok(())
                }
                None => Err(err),
            },
        }
    }

    fn request(&self, step: &Step<'_>, mode: AgentMode, extras: Extras<'_>) -> Result<AgentRequest> {
        let phase_id = step.phase.id.as_str();
        let result_path = self.paths.result_path(phase_id, mode);
        let schema_path = self.paths.schema_path(mode);
        let inputs = TaskInputs {
            phase_id,
            phase_instructions: &step.phase.instructions,
            work_dir: step.work_dir,
            result_path: &result_path,
            schema_path: &schema_path,
            verification: extras.verification,
            previous_error: extras.previous_error,
            issues: extras.issues,
            plan_overview: extras.plan_overview,
        };
        let prompt = PromptBuilder::new(self.config.prompt_budget_bytes).build(mode, &inputs)?;
        Ok(AgentRequest {
            phase_id: phase_id.to_string(),
            mode,
            work_dir: step.work_dir.to_path_buf(),
            prompt,
            log_path: self.paths.agent_log_path(phase_id, mode),
            pgid_marker: self.paths.child_pgid_path.clone(),
            timeout: self.config.agent_timeout(),
            output_limit_bytes: self.config.output_limit_bytes,
            result_path,
            schema_path,
        })
    }
}

/// What one phase runs against.
struct Step<'a> {
    phase: &'a Phase,
    tools: &'a ToolConfig,
    work_dir: &'a Path,
}

/// Mode-specific prompt inputs.
#[derive(Default)]
struct Extras<'a> {
    verification: Option<(&'a str, &'a str)>,
    previous_error: Option<&'a str>,
    issues: &'a [String],
    plan_overview: Option<&'a str>,
}

fn plan_overview(plan: &Plan, state: &RunState) -> String {
    plan.phases
        .iter()
        .map(|phase| {
            let marker = if state.is_completed(&phase.id) {
                " (completed)"
            } else if state.current_phase.as_deref() == Some(phase.id.as_str()) {
                " (current)"
            } else {
                ""
            };
            format!("- {}{marker}", phase.id)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

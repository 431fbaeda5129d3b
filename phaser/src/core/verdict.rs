//! Aggregation of check outcomes into one verification verdict, and the
//! feedback handed to fix invocations.

use std::collections::HashSet;

use crate::core::phase::PhaseKind;
use crate::core::types::{
    CheckKind, CheckOutcome, CheckResult, CheckStatus, VerificationResult, VerifyStatus,
};

/// Apply the phase-kind policy to a raw check outcome.
///
/// Only the test check of a test-authoring phase may fail without failing the phase.
pub fn classify_check(kind: CheckKind, outcome: &CheckOutcome, phase_kind: PhaseKind) -> CheckStatus {
    if outcome.passed {
        return CheckStatus::Pass;
    }
    if kind == CheckKind::Test && phase_kind == PhaseKind::TestAuthoring {
        return CheckStatus::AcceptedFail;
    }
    CheckStatus::Fail
}

/// Aggregate per-check results. Pass iff no check has status `Fail`;
/// unconfigured checks are simply absent and never influence the verdict.
pub fn aggregate(phase_id: &str, checks: Vec<CheckResult>) -> VerificationResult {
    let mut issues = Vec::new();
    let mut checks_passed = 0u32;
    let mut checks_failed = 0u32;
    for check in &checks {
        match check.status {
            CheckStatus::Pass => checks_passed += 1,
            CheckStatus::Fail => {
                checks_failed += 1;
                issues.push(describe_failure(check));
            }
            CheckStatus::AcceptedFail => {}
        }
    }
    let status = if checks_failed == 0 {
        VerifyStatus::Pass
    } else {
        VerifyStatus::Fail
    };
    VerificationResult {
        phase: phase_id.to_string(),
        status,
        issues,
        checks_passed,
        checks_failed,
        checks,
    }
}

fn describe_failure(check: &CheckResult) -> String {
    let reason = if check.timed_out {
        "timed out".to_string()
    } else {
        match check.exit_code {
            Some(code) => format!("exit code {code}"),
            None => "terminated by signal".to_string(),
        }
    };
    format!(
        "{} check failed ({reason}); log: {}",
        check.kind,
        check.log_path.display()
    )
}

/// Keep the last `max_bytes` of `text`, cut at a line (or char) boundary.
pub fn tail_excerpt(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut start = text.len() - max_bytes;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    if let Some(offset) = text[start..].find('\n') {
        let line_start = start + offset + 1;
        if line_start < text.len() {
            start = line_start;
        }
    }
    format!("[... {} bytes truncated]\n{}", start, &text[start..])
}

/// Output excerpt of a failing pipeline check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailingCheck {
    pub kind: CheckKind,
    pub excerpt: String,
}

/// Union of the verification agent's issues and failing-check excerpts,
/// de-duplicated in first-seen order.
pub fn compose_fix_issues(agent_issues: &[String], failing: &[FailingCheck]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut issues = Vec::new();
    for issue in agent_issues {
        let trimmed = issue.trim();
        if !trimmed.is_empty() && seen.insert(trimmed.to_string()) {
            issues.push(trimmed.to_string());
        }
    }
    for check in failing {
        let entry = format!("{} check failed:\n{}", check.kind, check.excerpt.trim_end());
        if seen.insert(entry.clone()) {
            issues.push(entry);
        }
    }
    issues
}

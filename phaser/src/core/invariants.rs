//! Run-progress invariants not expressible via serde alone.

use std::collections::HashSet;

/// Check progress invariants:
/// - completed phase ids are unique and non-empty
/// - the current phase, if set, is not already completed
pub fn validate_progress(completed: &[String], current: Option<&str>) -> Vec<String> {
    let mut errors = Vec::new();
    let mut seen = HashSet::new();
    for id in completed {
        if id.trim().is_empty() {
            errors.push("completed_phases contains an empty id".to_string());
            continue;
        }
        if !seen.insert(id.as_str()) {
            errors.push(format!("duplicate completed phase '{id}'"));
        }
    }
    if let Some(current) = current
        && seen.contains(current)
    {
        errors.push(format!(
            "current_phase '{current}' is already in completed_phases"
        ));
    }
    errors
}

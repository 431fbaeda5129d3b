//! Task descriptions handed to the agent on stdin.
//!
//! Templates mark their sections with `<!-- section:KEY required|droppable -->`.
//! When a rendered description exceeds the byte budget, droppable sections are
//! removed in a fixed order and the last remaining section is truncated.

use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use regex::Regex;
use serde::Serialize;
use tracing::debug;

use crate::core::types::AgentMode;

const IMPLEMENT_TEMPLATE: &str = include_str!("prompts/implement.md");
const VERIFY_TEMPLATE: &str = include_str!("prompts/verify.md");
const FIX_TEMPLATE: &str = include_str!("prompts/fix.md");

/// Droppable sections, least important first.
const DROP_ORDER: [&str; 3] = ["plan", "previous", "phase"];

const TRUNCATION_MARKER: &str = "\n[truncated]";

#[derive(Debug, Clone, Serialize)]
struct SectionDoc<'a> {
    id: &'a str,
    instructions: &'a str,
}

/// Everything a task description can mention.
#[derive(Debug, Clone, Copy)]
pub struct TaskInputs<'a> {
    pub phase_id: &'a str,
    pub phase_instructions: &'a str,
    pub work_dir: &'a Path,
    pub result_path: &'a Path,
    pub schema_path: &'a Path,
    /// Paired verification phase `(id, instructions)`; used in verify mode.
    pub verification: Option<(&'a str, &'a str)>,
    /// Last recorded error of this phase; used in implement mode.
    pub previous_error: Option<&'a str>,
    /// Issues to fix; used in fix mode.
    pub issues: &'a [String],
    pub plan_overview: Option<&'a str>,
}

struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    fn new() -> Self {
        let mut env = Environment::new();
        env.add_template("implement", IMPLEMENT_TEMPLATE)
            .expect("implement template should be valid");
        env.add_template("verify", VERIFY_TEMPLATE)
            .expect("verify template should be valid");
        env.add_template("fix", FIX_TEMPLATE)
            .expect("fix template should be valid");
        Self { env }
    }

    fn render(&self, mode: AgentMode, input: &TaskInputs<'_>) -> Result<String> {
        let template = self.env.get_template(mode.as_str())?;
        let (verification_id, verification_instructions) =
            input.verification.unwrap_or_default();
        let rendered = template.render(context! {
            phase => SectionDoc { id: input.phase_id, instructions: input.phase_instructions.trim() },
            verification => SectionDoc { id: verification_id, instructions: verification_instructions.trim() },
            work_dir => input.work_dir.display().to_string(),
            result_path => input.result_path.display().to_string(),
            schema_path => input.schema_path.display().to_string(),
            previous_error => input.previous_error.map(str::trim).filter(|s| !s.is_empty()),
            issues => input.issues,
            plan_overview => input.plan_overview.map(str::trim).filter(|s| !s.is_empty()),
        })?;
        Ok(rendered)
    }
}

#[derive(Debug, Clone)]
struct ParsedSection {
    key: String,
    required: bool,
    content: String,
}

fn parse_sections(rendered: &str) -> Vec<ParsedSection> {
    static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->").expect("section regex")
    });

    let markers: Vec<_> = SECTION_RE
        .captures_iter(rendered)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            Some((
                caps.get(1)?.as_str().to_string(),
                caps.get(2)?.as_str() == "required",
                whole.start(),
                whole.end(),
            ))
        })
        .collect();

    let mut sections = Vec::new();
    for (i, (key, required, _, content_start)) in markers.iter().enumerate() {
        let end = markers
            .get(i + 1)
            .map_or(rendered.len(), |(_, _, next_start, _)| *next_start);
        let content = rendered[*content_start..end].trim().to_string();
        if !content.is_empty() || *required {
            sections.push(ParsedSection {
                key: key.clone(),
                required: *required,
                content,
            });
        }
    }
    sections
}

fn apply_budget(sections: &mut Vec<ParsedSection>, budget: usize) {
    let total_len = |secs: &[ParsedSection]| -> usize { secs.iter().map(|s| s.content.len()).sum() };

    for key in DROP_ORDER {
        if total_len(sections) <= budget {
            return;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == key && !s.required) {
            debug!(
                section = key,
                bytes_dropped = sections[idx].content.len(),
                "dropped section for budget"
            );
            sections.remove(idx);
        }
    }

    if total_len(sections) <= budget {
        return;
    }
    let Some((last, rest)) = sections.split_last_mut() else {
        return;
    };
    let other_len: usize = rest.iter().map(|s| s.content.len()).sum();
    let allowed = budget.saturating_sub(other_len);
    let before_len = last.content.len();
    let keep = if allowed > TRUNCATION_MARKER.len() {
        allowed - TRUNCATION_MARKER.len()
    } else {
        allowed
    };
    let cut = floor_char_boundary(&last.content, keep);
    last.content.truncate(cut);
    if allowed > TRUNCATION_MARKER.len() {
        last.content.push_str(TRUNCATION_MARKER);
    }
    debug!(
        section = %last.key,
        before_len,
        after_len = last.content.len(),
        "truncated section for budget"
    );
}

fn floor_char_boundary(text: &str, index: usize) -> usize {
    if index >= text.len() {
        return text.len();
    }
    let mut idx = index;
    while !text.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

fn render_sections(sections: &[ParsedSection]) -> String {
    let mut out = sections
        .iter()
        .map(|s| s.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");
    out.push('\n');
    out
}

/// Renders task descriptions within a byte budget.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    budget_bytes: usize,
}

impl PromptBuilder {
    pub fn new(budget_bytes: usize) -> Self {
        Self { budget_bytes }
    }

    pub fn build(&self, mode: AgentMode, input: &TaskInputs<'_>) -> Result<String> {
        let rendered = PromptEngine::new()
            .render(mode, input)
            .with_context(|| format!("render {mode} task description"))?;
        let mut sections = parse_sections(&rendered);
        apply_budget(&mut sections, self.budget_bytes);
        Ok(render_sections(&sections))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs<'a>(issues: &'a [String]) -> TaskInputs<'a> {
        TaskInputs {
            phase_id: "03-impl",
            phase_instructions: "Implement the parser.",
            work_dir: Path::new("/work"),
            result_path: Path::new("/plan/.phaser/results/03-impl.implement.json"),
            schema_path: Path::new("/plan/.phaser/schemas/implementation_result.schema.json"),
            verification: Some(("03a-impl-verify", "Parser handles empty input.")),
            previous_error: Some("build check failed"),
            issues,
            plan_overview: Some("- 01-stub (completed)\n- 03-impl"),
        }
    }

    #[test]
    fn implement_mentions_result_path_and_sections_in_order() {
        let text = PromptBuilder::new(10_000)
            .build(AgentMode::Implement, &inputs(&[]))
            .expect("build");
        let contract = text.find("### Implement Contract").expect("contract");
        let phase = text.find("### Phase Instructions").expect("phase");
        let previous = text.find("### Previous Attempt").expect("previous");
        let plan = text.find("### Plan Overview").expect("plan");
        assert!(contract < phase && phase < previous && previous < plan);
        assert!(text.contains("/plan/.phaser/results/03-impl.implement.json"));
        assert!(!text.contains("<!-- section:"));
    }

    #[test]
    fn verify_includes_verification_instructions() {
        let text = PromptBuilder::new(10_000)
            .build(AgentMode::Verify, &inputs(&[]))
            .expect("build");
        assert!(text.contains("<verification id=\"03a-impl-verify\">"));
        assert!(text.contains("Parser handles empty input."));
        assert!(text.contains("\"pass\" | \"fail\""));
    }

    #[test]
    fn fix_lists_every_issue() {
        let issues = vec!["missing fn parse".to_string(), "test check failed:\nboom".to_string()];
        let text = PromptBuilder::new(10_000)
            .build(AgentMode::Fix, &inputs(&issues))
            .expect("build");
        assert!(text.contains("- missing fn parse"));
        assert!(text.contains("boom"));
    }

    #[test]
    fn budget_drops_plan_before_previous_and_keeps_contract() {
        let overview = "- phase\n".repeat(200);
        let mut input = inputs(&[]);
        input.plan_overview = Some(overview.as_str());
        let text = PromptBuilder::new(1_200)
            .build(AgentMode::Implement, &input)
            .expect("build");
        assert!(!text.contains("### Plan Overview"));
        assert!(text.contains("### Previous Attempt"));
        assert!(text.contains("### Implement Contract"));
    }

    #[test]
    fn oversized_issues_are_truncated() {
        let issues = vec!["x".repeat(5_000)];
        let text = PromptBuilder::new(1_500)
            .build(AgentMode::Fix, &inputs(&issues))
            .expect("build");
        assert!(!text.contains("### Phase Instructions"));
        assert!(text.trim_end().ends_with("[truncated]"));
        assert!(text.len() < 1_600);
    }
}

//! Plan loader: turns a directory of phase files into an ordered phase sequence.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

use crate::core::phase::{PhaseKind, PhaseName, parse_phase_file_name};
use crate::error::EngineError;
use crate::io::frontmatter;

/// A schedulable unit of plan work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Phase {
    pub id: String,
    pub order: u32,
    pub kind: PhaseKind,
    pub path: PathBuf,
    /// Opaque instruction text, handed to the agent verbatim.
    pub instructions: String,
    pub verification: Option<VerificationPhase>,
}

/// Companion phase whose only purpose is checking its base phase's deliverables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationPhase {
    pub id: String,
    pub path: PathBuf,
    pub instructions: String,
}

/// Ordered phases of one plan directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    pub dir: PathBuf,
    pub phases: Vec<Phase>,
}

impl Plan {
    pub fn get(&self, id: &str) -> Option<&Phase> {
        self.phases.iter().find(|phase| phase.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.phases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }

    /// Phases not yet in `completed`, in plan order. This diff is the only
    /// resume bookkeeping.
    pub fn remaining<'a>(&'a self, completed: &[String]) -> Vec<&'a Phase> {
        self.phases
            .iter()
            .filter(|phase| !completed.iter().any(|id| id == &phase.id))
            .collect()
    }
}

/// Load the plan in `dir`.
///
/// Fails with [`EngineError::PlanNotFound`] if `dir` does not exist. A directory
/// without phase files yields an empty plan.
#[instrument(skip_all, fields(dir = %dir.display()))]
pub fn load_plan(dir: &Path) -> Result<Plan> {
    if !dir.is_dir() {
        return Err(EngineError::PlanNotFound(dir.to_path_buf()).into());
    }

    let mut names = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("read plan dir {}", dir.display()))? {
        let entry = entry.context("read plan entry")?;
        if !entry.file_type().context("stat plan entry")?.is_file() {
            continue;
        }
        let file_name = entry.file_name();
        let Some(name) = file_name.to_str().and_then(parse_phase_file_name) else {
            continue;
        };
        if name.is_bootstrap() {
            debug!(id = %name.id, "skipping bootstrap entry");
            continue;
        }
        names.push(name);
    }
    names.sort_by(|a, b| (a.order, a.suffix, &a.id).cmp(&(b.order, b.suffix, &b.id)));

    let mut bases: BTreeMap<u32, Phase> = BTreeMap::new();
    let mut verifications: Vec<PhaseName> = Vec::new();
    for name in names {
        if name.is_verification() {
            verifications.push(name);
            continue;
        }
        if let Some(existing) = bases.get(&name.order) {
            return Err(anyhow!(
                "phases '{}' and '{}' share numeric prefix {}",
                existing.id,
                name.id,
                name.order
            ));
        }
        let phase = load_base_phase(dir, &name)?;
        bases.insert(name.order, phase);
    }

    for name in verifications {
        let Some(base) = bases.get_mut(&name.order) else {
            warn!(id = %name.id, "verification phase has no base phase; ignoring");
            continue;
        };
        if let Some(existing) = &base.verification {
            warn!(
                id = %name.id,
                base = %base.id,
                kept = %existing.id,
                "base phase already has a verification phase; ignoring"
            );
            continue;
        }
        let path = dir.join(format!("{}.md", name.id));
        let contents = read_phase_file(&path)?;
        base.verification = Some(VerificationPhase {
            id: name.id,
            path,
            instructions: frontmatter::parse(&contents).body.to_string(),
        });
    }

    let phases: Vec<Phase> = bases.into_values().collect();
    debug!(count = phases.len(), "plan loaded");
    Ok(Plan {
        dir: dir.to_path_buf(),
        phases,
    })
}

fn load_base_phase(dir: &Path, name: &PhaseName) -> Result<Phase> {
    let path = dir.join(format!("{}.md", name.id));
    let contents = read_phase_file(&path)?;
    let doc = frontmatter::parse(&contents);
    let kind = match doc.get("kind") {
        Some(declared) => declared
            .parse()
            .with_context(|| format!("phase {}", name.id))?,
        None => PhaseKind::infer_from_id(&name.id),
    };
    Ok(Phase {
        id: name.id.clone(),
        order: name.order,
        kind,
        instructions: doc.body.to_string(),
        path,
        verification: None,
    })
}

fn read_phase_file(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("read phase {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, name: &str, contents: &str) {
        fs::write(dir.join(name), contents).expect("write phase");
    }

    #[test]
    fn missing_dir_is_plan_not_found() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = load_plan(&temp.path().join("nope")).expect_err("missing");
        assert!(matches!(
            err.downcast_ref::<EngineError>(),
            Some(EngineError::PlanNotFound(_))
        ));
    }

    #[test]
    fn empty_dir_yields_empty_plan() {
        let temp = tempfile::tempdir().expect("tempdir");
        write(temp.path(), "notes.txt", "not a phase");
        let plan = load_plan(temp.path()).expect("plan");
        assert!(plan.is_empty());
    }

    #[test]
    fn orders_phases_and_attaches_verification() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dir = temp.path();
        write(dir, "10-polish.md", "polish");
        write(dir, "02-tests.md", "tests");
        write(dir, "01-stub.md", "stub");
        write(dir, "01a-stub-verify.md", "check stub");
        write(dir, "00-overview.md", "bootstrap");
        write(dir, "03-impl.md", "impl");

        let plan = load_plan(dir).expect("plan");
        let ids: Vec<&str> = plan.phases.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["01-stub", "02-tests", "03-impl", "10-polish"]);

        let stub = plan.get("01-stub").expect("stub");
        let verification = stub.verification.as_ref().expect("verification");
        assert_eq!(verification.id, "01a-stub-verify");
        assert_eq!(verification.instructions, "check stub");
        assert!(!plan.contains("01a-stub-verify"));
        assert!(!plan.contains("00-overview"));
    }

    #[test]
    fn kind_comes_from_frontmatter_before_heuristic() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dir = temp.path();
        write(dir, "01-tests.md", "---\nkind: standard\n---\nbody");
        write(dir, "02-specs.md", "---\nkind: test-authoring\n---\nbody");
        write(dir, "03-tests.md", "body");

        let plan = load_plan(dir).expect("plan");
        assert_eq!(plan.get("01-tests").expect("p").kind, PhaseKind::Standard);
        assert_eq!(plan.get("01-tests").expect("p").instructions, "body");
        assert_eq!(
            plan.get("02-specs").expect("p").kind,
            PhaseKind::TestAuthoring
        );
        assert_eq!(
            plan.get("03-tests").expect("p").kind,
            PhaseKind::TestAuthoring
        );
    }

    #[test]
    fn orphan_verification_is_ignored() {
        let temp = tempfile::tempdir().expect("tempdir");
        write(temp.path(), "04a-orphan-verify.md", "x");
        let plan = load_plan(temp.path()).expect("plan");
        assert!(plan.is_empty());
    }

    #[test]
    fn duplicate_prefix_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        write(temp.path(), "01-a.md", "x");
        write(temp.path(), "01-b.md", "y");
        let err = load_plan(temp.path()).expect_err("duplicate");
        assert!(err.to_string().contains("share numeric prefix 1"));
    }

    #[test]
    fn remaining_skips_completed() {
        let temp = tempfile::tempdir().expect("tempdir");
        write(temp.path(), "01-stub.md", "x");
        write(temp.path(), "02-tests.md", "y");
        let plan = load_plan(temp.path()).expect("plan");
        let remaining = plan.remaining(&["01-stub".to_string()]);
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, "02-tests");
    }
}

//! Phase file-name grammar and phase kinds.
//!
//! A phase file is named `NN-slug.md`; its verification phase shares the
//! numeric prefix and adds one lowercase letter: `NNa-slug.md`. The numeric
//! prefix orders phases; `00` is reserved for bootstrap material and never
//! scheduled.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use anyhow::{Result, anyhow};
use regex::Regex;
use serde::{Deserialize, Serialize};

static PHASE_FILE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d+)([a-z])?-([A-Za-z0-9][A-Za-z0-9._-]*)\.md$").expect("phase file regex")
});

/// Identifier tokens that mark a phase as test-authoring when no explicit kind
/// is declared.
const TEST_AUTHORING_TOKENS: [&str; 2] = ["test", "tests"];

/// Parsed components of a phase file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseName {
    /// Phase id: the file stem, e.g. `01a-stub-verify`.
    pub id: String,
    /// Numeric ordering key.
    pub order: u32,
    /// Verification suffix letter, if any.
    pub suffix: Option<char>,
    pub slug: String,
}

impl PhaseName {
    pub fn is_verification(&self) -> bool {
        self.suffix.is_some()
    }

    /// Bootstrap entries (prefix `00`) are never auto-executed.
    pub fn is_bootstrap(&self) -> bool {
        self.order == 0
    }
}

/// Parse a phase file name. Returns `None` for anything that is not a phase file.
pub fn parse_phase_file_name(file_name: &str) -> Option<PhaseName> {
    let caps = PHASE_FILE_RE.captures(file_name)?;
    let order: u32 = caps.get(1)?.as_str().parse().ok()?;
    let suffix = caps.get(2).and_then(|m| m.as_str().chars().next());
    let slug = caps.get(3)?.as_str().to_string();
    let id = file_name.strip_suffix(".md")?.to_string();
    Some(PhaseName {
        id,
        order,
        suffix,
        slug,
    })
}

/// Declared role of a phase; drives the test-check exemption.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PhaseKind {
    #[default]
    Standard,
    /// The phase writes tests ahead of the implementation, so a failing test
    /// check is expected and accepted.
    TestAuthoring,
}

impl PhaseKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PhaseKind::Standard => "standard",
            PhaseKind::TestAuthoring => "test-authoring",
        }
    }

    /// Fallback classification from the identifier when no kind is declared.
    pub fn infer_from_id(id: &str) -> Self {
        let authoring = id
            .split(['-', '_', '.'])
            .any(|token| TEST_AUTHORING_TOKENS.contains(&token.to_ascii_lowercase().as_str()));
        if authoring {
            PhaseKind::TestAuthoring
        } else {
            PhaseKind::Standard
        }
    }
}

impl fmt::Display for PhaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PhaseKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "standard" => Ok(PhaseKind::Standard),
            "test-authoring" | "test_authoring" | "tests" => Ok(PhaseKind::TestAuthoring),
            other => Err(anyhow!(
                "unknown phase kind '{other}' (expected 'standard' or 'test-authoring')"
            )),
        }
    }
}

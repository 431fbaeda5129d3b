//! Tool detector: resolves build/typecheck/lint/test commands for a work area.
//!
//! Explicit overrides always win. Remaining slots are filled from the first
//! recognized project manifest; anything unresolved stays empty and its check
//! is skipped by the pipeline.

use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;
use tracing::{debug, info, instrument};

use crate::core::types::{CheckKind, CommandSpec, ToolConfig};

/// Ecosystems recognized by their manifests, in probe priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ecosystem {
    Cargo,
    Node(NodeManager),
    Python,
    Go,
    Make,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeManager {
    Npm,
    Pnpm,
    Yarn,
    Bun,
}

impl NodeManager {
    fn program(self) -> &'static str {
        match self {
            NodeManager::Npm => "npm",
            NodeManager::Pnpm => "pnpm",
            NodeManager::Yarn => "yarn",
            NodeManager::Bun => "bun",
        }
    }

    fn detect(work_dir: &Path) -> Self {
        if work_dir.join("pnpm-lock.yaml").exists() {
            NodeManager::Pnpm
        } else if work_dir.join("yarn.lock").exists() {
            NodeManager::Yarn
        } else if work_dir.join("bun.lockb").exists() || work_dir.join("bun.lock").exists() {
            NodeManager::Bun
        } else {
            NodeManager::Npm
        }
    }
}

/// Placeholder `test` script written by `npm init`; it always fails.
const NPM_PLACEHOLDER_TEST: &str = "no test specified";

/// Probe manifests in priority order.
pub fn detect_ecosystem(work_dir: &Path) -> Option<Ecosystem> {
    if work_dir.join("Cargo.toml").is_file() {
        return Some(Ecosystem::Cargo);
    }
    if work_dir.join("package.json").is_file() {
        return Some(Ecosystem::Node(NodeManager::detect(work_dir)));
    }
    if work_dir.join("pyproject.toml").is_file() || work_dir.join("setup.py").is_file() {
        return Some(Ecosystem::Python);
    }
    if work_dir.join("go.mod").is_file() {
        return Some(Ecosystem::Go);
    }
    if work_dir.join("Makefile").is_file() {
        return Some(Ecosystem::Make);
    }
    None
}

/// Best-effort detection of commands from the work area alone.
pub fn detect_tools(work_dir: &Path) -> ToolConfig {
    match detect_ecosystem(work_dir) {
        Some(Ecosystem::Cargo) => ToolConfig {
            build_command: Some(CommandSpec::new(["cargo", "build", "--all-targets"])),
            lint_command: Some(CommandSpec::new([
                "cargo",
                "clippy",
                "--all-targets",
                "--",
                "-D",
                "warnings",
            ])),
            // `cargo build` already type-checks.
            typecheck_command: None,
            test_command: Some(CommandSpec::new(["cargo", "test"])),
        },
        Some(Ecosystem::Node(manager)) => detect_node(work_dir, manager),
        Some(Ecosystem::Python) => detect_python(work_dir),
        Some(Ecosystem::Go) => ToolConfig {
            build_command: Some(CommandSpec::new(["go", "build", "./..."])),
            lint_command: None,
            typecheck_command: Some(CommandSpec::new(["go", "vet", "./..."])),
            test_command: Some(CommandSpec::new(["go", "test", "./..."])),
        },
        Some(Ecosystem::Make) => detect_make(work_dir),
        None => ToolConfig::default(),
    }
}

/// Combine explicit overrides with detection. Overrides are never replaced.
#[instrument(skip_all, fields(work_dir = %work_dir.display()))]
pub fn resolve_tools(work_dir: &Path, overrides: &ToolConfig) -> ToolConfig {
    let detected = detect_tools(work_dir);
    let mut resolved = ToolConfig::default();
    for kind in CheckKind::ALL {
        let chosen = match overrides.get(kind) {
            Some(spec) => {
                debug!(check = %kind, command = %spec, "using override");
                Some(spec.clone())
            }
            None => detected.get(kind).cloned(),
        };
        *resolved.slot_mut(kind) = chosen;
    }
    info!(
        build = resolved.get(CheckKind::Build).is_some(),
        typecheck = resolved.get(CheckKind::Typecheck).is_some(),
        lint = resolved.get(CheckKind::Lint).is_some(),
        test = resolved.get(CheckKind::Test).is_some(),
        "resolved tool config"
    );
    resolved
}

fn detect_node(work_dir: &Path, manager: NodeManager) -> ToolConfig {
    let scripts = fs::read_to_string(work_dir.join("package.json"))
        .ok()
        .and_then(|raw| serde_json::from_str::<Value>(&raw).ok())
        .and_then(|pkg| pkg.get("scripts").cloned())
        .unwrap_or(Value::Null);
    let script = |name: &str| scripts.get(name).and_then(Value::as_str);
    let run = |name: &str| {
        script(name).map(|_| CommandSpec::new([manager.program(), "run", name]))
    };

    let typecheck = run("typecheck").or_else(|| {
        work_dir
            .join("tsconfig.json")
            .is_file()
            .then(|| CommandSpec::new(["npx", "tsc", "--noEmit"]))
    });
    let test = script("test")
        .filter(|body| !body.contains(NPM_PLACEHOLDER_TEST))
        .map(|_| CommandSpec::new([manager.program(), "test"]));

    ToolConfig {
        build_command: run("build"),
        lint_command: run("lint"),
        typecheck_command: typecheck,
        test_command: test,
    }
}

fn detect_python(work_dir: &Path) -> ToolConfig {
    let pyproject = fs::read_to_string(work_dir.join("pyproject.toml"))
        .ok()
        .and_then(|raw| raw.parse::<toml::Table>().ok())
        .unwrap_or_default();
    let tool_table = |name: &str| {
        pyproject
            .get("tool")
            .and_then(|tool| tool.get(name))
            .is_some()
    };

    let lint = (tool_table("ruff") || work_dir.join("ruff.toml").is_file())
        .then(|| CommandSpec::new(["ruff", "check", "."]));
    let typecheck = (tool_table("mypy") || work_dir.join("mypy.ini").is_file())
        .then(|| CommandSpec::new(["mypy", "."]));

    ToolConfig {
        build_command: None,
        lint_command: lint,
        typecheck_command: typecheck,
        test_command: Some(CommandSpec::new(["python", "-m", "pytest"])),
    }
}

fn detect_make(work_dir: &Path) -> ToolConfig {
    static TARGET_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?m)^([A-Za-z][A-Za-z0-9_-]*)\s*:").expect("target regex"));

    let makefile = fs::read_to_string(work_dir.join("Makefile")).unwrap_or_default();
    let has_target = |target: &str| {
        TARGET_RE
            .captures_iter(&makefile)
            .any(|caps| caps.get(1).is_some_and(|m| m.as_str() == target))
    };
    let make = |target: &str| has_target(target).then(|| CommandSpec::new(["make", target]));

    ToolConfig {
        build_command: make("build"),
        lint_command: make("lint"),
        typecheck_command: make("typecheck"),
        test_command: make("test"),
    }
}

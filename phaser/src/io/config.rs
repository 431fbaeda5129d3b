//! Engine configuration stored under `<plan>/.phaser/config.toml`.

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::types::{CheckKind, CommandSpec, ToolConfig};

/// Engine configuration (TOML).
///
/// Every key is optional. Tool command keys override auto-detection; absent
/// ones are detected or left empty.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PhaserConfig {
    pub build_command: Option<CommandSpec>,
    pub lint_command: Option<CommandSpec>,
    pub test_command: Option<CommandSpec>,
    pub typecheck_command: Option<CommandSpec>,

    /// Wall-clock deadline for each agent invocation, in seconds.
    pub timeout_seconds: u64,

    /// Failed cycles tolerated per phase before it is marked failed.
    pub max_retries: u32,

    /// Deadline for each verification command; defaults to `timeout_seconds`.
    pub check_timeout_seconds: Option<u64>,

    /// Truncate agent and check logs beyond this many bytes.
    pub output_limit_bytes: usize,

    /// Maximum bytes for a rendered task description before dropping sections.
    pub prompt_budget_bytes: usize,

    /// Tail bytes of each failing check log handed to fix invocations.
    pub failure_excerpt_bytes: usize,

    pub agent: AgentConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// Agent CLI as an argument vector; the task description is fed on stdin.
    pub command: CommandSpec,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: CommandSpec::new(["claude", "--print", "--dangerously-skip-permissions"]),
        }
    }
}

impl Default for PhaserConfig {
    fn default() -> Self {
        Self {
            build_command: None,
            lint_command: None,
            test_command: None,
            typecheck_command: None,
            timeout_seconds: 600,
            max_retries: 3,
            check_timeout_seconds: None,
            output_limit_bytes: 1_000_000,
            prompt_budget_bytes: 40_000,
            failure_excerpt_bytes: 4_000,
            agent: AgentConfig::default(),
        }
    }
}

impl PhaserConfig {
    pub fn validate(&self) -> Result<()> {
        if self.timeout_seconds == 0 {
            return Err(anyhow!("timeout_seconds must be > 0"));
        }
        if self.check_timeout_seconds == Some(0) {
            return Err(anyhow!("check_timeout_seconds must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.prompt_budget_bytes == 0 {
            return Err(anyhow!("prompt_budget_bytes must be > 0"));
        }
        if self.failure_excerpt_bytes == 0 {
            return Err(anyhow!("failure_excerpt_bytes must be > 0"));
        }
        if self.agent.command.is_empty() {
            return Err(anyhow!("agent.command must be a non-empty array"));
        }
        Ok(())
    }

    pub fn agent_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn check_timeout(&self) -> Duration {
        Duration::from_secs(self.check_timeout_seconds.unwrap_or(self.timeout_seconds))
    }

    /// Explicit tool overrides; empty commands count as unset.
    pub fn tool_overrides(&self) -> ToolConfig {
        let mut tools = ToolConfig {
            build_command: self.build_command.clone(),
            lint_command: self.lint_command.clone(),
            test_command: self.test_command.clone(),
            typecheck_command: self.typecheck_command.clone(),
        };
        for kind in CheckKind::ALL {
            let slot = tools.slot_mut(kind);
            if slot.as_ref().is_some_and(CommandSpec::is_empty) {
                *slot = None;
            }
        }
        tools
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `PhaserConfig::default()`.
pub fn load_config(path: &Path) -> Result<PhaserConfig> {
    if !path.exists() {
        let cfg = PhaserConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: PhaserConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &PhaserConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    let mut tmp = File::create(&tmp_path)
        .with_context(|| format!("create temp config {}", tmp_path.display()))?;
    tmp.write_all(contents.as_bytes())
        .and_then(|()| tmp.sync_all())
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    drop(tmp);
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, PhaserConfig::default());
        assert_eq!(cfg.timeout_seconds, 600);
        assert_eq!(cfg.max_retries, 3);
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let cfg = PhaserConfig {
            test_command: Some(CommandSpec::new(["cargo", "test"])),
            max_retries: 1,
            ..PhaserConfig::default()
        };
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn commands_accept_strings_and_arrays() {
        let cfg: PhaserConfig = toml::from_str(
            r#"
build_command = "npm run build"
lint_command = ["npx", "eslint", "."]
timeout_seconds = 30
"#,
        )
        .expect("parse");
        assert_eq!(
            cfg.build_command,
            Some(CommandSpec::new(["npm", "run", "build"]))
        );
        assert_eq!(
            cfg.lint_command,
            Some(CommandSpec::new(["npx", "eslint", "."]))
        );
        assert_eq!(cfg.agent_timeout(), Duration::from_secs(30));
        assert_eq!(cfg.check_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn empty_override_counts_as_unset() {
        let cfg = PhaserConfig {
            typecheck_command: Some(CommandSpec::from_line("   ")),
            ..PhaserConfig::default()
        };
        assert_eq!(cfg.tool_overrides().typecheck_command, None);
    }

    #[test]
    fn rejects_zero_timeout() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "timeout_seconds = 0\n").expect("write");
        let err = load_config(&path).expect_err("invalid");
        assert!(format!("{err:#}").contains("timeout_seconds must be > 0"));
    }
}

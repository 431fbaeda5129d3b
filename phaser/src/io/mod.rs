//! I/O helpers for the phase engine.

pub mod agent;
pub mod checks;
pub mod config;
pub mod frontmatter;
pub mod lock;
pub mod paths;
pub mod plan;
pub mod process;
pub mod prompt;
pub mod run_state;
pub mod signals;
pub mod tools;

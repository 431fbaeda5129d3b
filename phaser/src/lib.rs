//! Phase-sequenced build engine.
//!
//! Drives an opaque code-generation agent through an ordered plan of phases.
//! Each phase is implemented, verified by the project's own build/typecheck/
//! lint/test commands (and an optional agent verification phase), and fixed in
//! place until it passes or its retry budget runs out. Progress is persisted
//! crash-safely so an interrupted run resumes at the first incomplete phase.
//!
//! - **[`core`]**: Pure, deterministic logic (phase grammar, state machine,
//!   retry budget, verdict aggregation). No I/O.
//! - **[`io`]**: Side-effecting operations (plan files, run state, child
//!   processes, agent invocations, locks).
//!
//! Orchestration modules ([`controller`], [`control`]) coordinate core logic
//! with I/O to implement CLI commands.

pub mod control;
pub mod controller;
pub mod core;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

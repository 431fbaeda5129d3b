//! Deterministic, pure logic shared by the phase engine.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod invariants;
pub mod phase;
pub mod retry;
pub mod state_machine;
pub mod types;
pub mod verdict;

//! Deterministic, pure logic shared by the orchestrator.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! plans and return deterministic outputs suitable for tests.

pub mod frontier;
pub mod idle;
pub mod plan_check;
pub mod placeholders;
pub mod state_update;
pub mod types;

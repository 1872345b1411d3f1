//! Generation-backed collaborators of the orchestrator.
//!
//! Each agent sits behind a trait so the scheduler can be driven by scripted
//! fakes in tests and by the configured model CLI in production.

pub mod monitor;
pub mod planner;
pub mod selector;

//! Autonomous goal-execution agent.
//!
//! Producers queue natural-language goals in a shared SQLite store. A single
//! orchestrator loop plans each goal into a dependency graph of steps and
//! works through it one goal at a time, under per-tier request budgets.
//!
//! - **[`core`]**: Pure, deterministic logic (plan checks, frontier, step
//!   transitions, placeholders). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (database, model process, prompts,
//!   config, wake file). Isolated to enable fakes in tests.
//!
//! [`cycle`] and [`looping`] drive the orchestrator; [`producer`] holds the
//! operations the CLI exposes to everyone else.

pub mod agents;
pub mod core;
pub mod cycle;
pub mod dispatch;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod looping;
pub mod producer;
pub mod react;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod tools;

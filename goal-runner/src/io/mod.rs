//! I/O helpers for the orchestrator and producers.

pub mod config;
pub mod db;
pub mod generator;
pub mod goal_store;
pub mod init;
pub mod process;
pub mod prompt;
pub mod rate_limiter;
pub mod wake;

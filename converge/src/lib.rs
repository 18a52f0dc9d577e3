//! Fact-cache / diff / parallel-execution reconciliation engine.
//!
//! Operations declare desired state; facts describe current state. The
//! engine gathers facts once per host and cache generation, diffs each
//! operation against them, and runs the resulting command batches across
//! the fleet with per-host ordering and a fleet-wide failure threshold.
//!
//! - **[`core`]**: Pure, deterministic logic (fact parsing, diffing,
//!   inventory resolution, threshold arithmetic). No I/O.
//! - **[`io`]**: Side-effecting adapters (child processes, connectors,
//!   config/inventory/deploy files, report writing).
//!
//! Orchestration modules ([`fact_store`], [`planner`], [`executor`],
//! [`pipeline`]) coordinate core logic with I/O to implement a run.

pub mod core;
pub mod error;
pub mod events;
pub mod executor;
pub mod exit_codes;
pub mod fact_store;
pub mod io;
pub mod logging;
pub mod pipeline;
pub mod planner;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

//! Automated source-tree conversion pipeline.
//!
//! Porter orchestrates multi-step transformation of a source repository
//! into a target repository by delegating conversion steps to pluggable
//! external engines, under a strict write-safety and audit discipline.
//! The architecture enforces a separation:
//!
//! - **[`core`]**: pure, deterministic logic (plan model, merge
//!   strategies, semantic heuristics, scoring, convergence). No I/O,
//!   fully testable in isolation.
//! - **[`io`]**: side-effecting operations (stores, process execution,
//!   prompts, audit artifacts). Isolated to enable scripting in tests.
//!
//! Orchestration modules ([`executor`], [`arbitration`], [`integrity`],
//! [`replay`], [`planner`], [`validate`]) coordinate core logic with I/O
//! to implement the CLI commands.

pub mod arbitration;
pub mod core;
pub mod executor;
pub mod exit_codes;
pub mod integrity;
pub mod io;
pub mod logging;
pub mod planner;
pub mod replay;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod validate;

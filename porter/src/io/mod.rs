//! Side-effecting operations: filesystem stores, process execution,
//! prompt assembly, audit artifacts. Isolated from `core` to keep the
//! deterministic logic testable without I/O.

pub mod audit;
pub mod config;
pub mod decision_store;
pub mod engine;
pub mod hash_store;
pub mod lock;
pub mod paths;
pub mod plan_store;
pub mod process;
pub mod prompt;
pub mod run_store;
pub mod write_safety;

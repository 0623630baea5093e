//! Batch runner for parameterized calculations.
//!
//! Cases are enumerated from a design, probed against previously persisted results and then
//! dispatched over a pool of calculators (local shell, ssh, cache, discovered daemons).
//! Outcomes are collected into one table; a single failing case never aborts the run.

pub mod calculators;
pub mod case;
pub mod config;
pub mod daemon;
pub mod design;
pub mod discovery;
pub mod dispatcher;
pub mod extract;
pub mod protocol;
pub mod render;
pub mod report;
pub mod resolve;
pub mod store;

#[cfg(test)]
mod testing;

//! The reconciliation engine: per-partition extraction, staging, matching and
//! classification, plus row-level checking and fix synthesis.
//!
//! Each partition runs two extraction workers (optionally feeding loader tasks)
//! and one matching observer, coordinated through a [`gate::Gate`].

pub mod check;
pub mod classify;
pub mod extract;
pub mod fix;
pub mod gate;
pub mod loader;
pub mod observer;
pub mod orchestrator;

pub use orchestrator::{Reconciler, RunContext, RunSummary};

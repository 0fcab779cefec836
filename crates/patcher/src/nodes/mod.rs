//! Workflow nodes. Each `run` is a pure function of the current state
//! (side effects go through the injected collaborators) returning a
//! `NodeDecision` for the driver to apply.

pub mod build;
pub mod context;
pub mod create_patch;
pub mod reflection;
pub mod root_cause;
pub mod run_pov;
pub mod run_tests;
pub mod validate;

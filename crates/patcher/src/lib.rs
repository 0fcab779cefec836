#![warn(clippy::pedantic)]
// Allow common pedantic lints that don't affect correctness
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::uninlined_format_args)]

//! # Buttercup patcher
//!
//! A per-vulnerability workflow that turns a confirmed vulnerability into
//! a verified source patch:
//!
//! root cause -> create patch -> build -> run PoVs -> run tests -> validate
//!
//! The workflow is an explicit driver loop over node decisions; each node
//! is a function of the current state that returns where to go next plus a
//! delta to fold into the state. Failures route through a reflection node
//! that decides whether to retry, gather more context, or start over.

pub mod codequery;
pub mod config;
pub mod language;
pub mod llm;
pub mod machine;
pub mod nodes;
pub mod state;
pub mod upatch;

pub use config::PatcherConfig;
pub use machine::PatcherWorkflow;
pub use state::{PatchAttempt, PatchStatus, PatcherState};

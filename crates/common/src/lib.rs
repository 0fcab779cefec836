#![warn(clippy::pedantic)]
// Allow common pedantic lints that don't affect correctness
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::map_unwrap_or)]

//! # Buttercup common
//!
//! Shared infrastructure for the Buttercup Cyber-Reasoning System:
//!
//! - Task records and lifecycle sets on the shared key/value store
//! - Reliable at-least-once queues with consumer-group fan-out
//! - Node-local staging of shared-filesystem artifacts
//! - Content-addressed corpus and crash stores
//! - Challenge task directories, patch application and cached builds
//! - Stack-trace fingerprints for crash deduplication

pub mod challenge_task;
pub mod constants;
pub mod corpus;
pub mod error;
pub mod locks;
pub mod maps;
pub mod messages;
pub mod node_local;
pub mod pov_status;
pub mod queue;
pub mod stacktrace;
pub mod task_registry;
pub mod telemetry;

pub use error::{CommonError, Result};
pub use messages::{
    BuildOutput, BuildRequest, BuildType, ConfirmedVulnerability, Crash, FunctionCoverage, Patch,
    POVReproduceRequest, SourceDetail, SourceType, Task, TaskType, TracedCrash, WeightedHarness,
};
pub use node_local::NodeLocal;
pub use queue::{QueueFactory, RQItem, ReliableQueue};
pub use task_registry::TaskRegistry;

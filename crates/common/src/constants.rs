//! Central name tables and tuning knobs shared by every service.

/// Redis hash holding serialized task records, keyed by lowercase task id.
pub const TASKS_HASH: &str = "tasks";

/// Redis set of cancelled task ids. Authoritative for the cancelled state.
pub const CANCELLED_TASKS_SET: &str = "cancelled_tasks";

/// Redis set of task ids whose PoV+patch bundle was accepted downstream.
pub const SUCCEEDED_TASKS_SET: &str = "succeeded_tasks";

/// Redis set of task ids that failed terminally.
pub const ERRORED_TASKS_SET: &str = "errored_tasks";

/// Redis hash of build outputs keyed by (task, build type, sanitizer, patch id).
pub const BUILD_MAP_HASH: &str = "build_map";

/// Redis hash of weighted harnesses keyed by (task, package, harness).
pub const HARNESS_WEIGHTS_HASH: &str = "harness_weights";

/// Redis hash of per-harness function coverage.
pub const COVERAGE_MAP_HASH: &str = "coverage_map";

/// Reliable queue names. One stream per queue.
pub mod queue_names {
    pub const TASKS: &str = "tasks_queue";
    pub const READY_TASKS: &str = "ready_tasks_queue";
    pub const BUILDS: &str = "build_requests_queue";
    pub const BUILD_OUTPUTS: &str = "build_outputs_queue";
    pub const CRASHES: &str = "crashes_queue";
    pub const TRACED_VULNERABILITIES: &str = "traced_vulnerabilities_queue";
    pub const CONFIRMED_VULNERABILITIES: &str = "confirmed_vulnerabilities_queue";
    pub const PATCHES: &str = "patches_queue";
}

/// Consumer group names. Each group sees every message on its queue.
pub mod group_names {
    pub const DOWNLOADER: &str = "downloader_group";
    pub const SCHEDULER: &str = "scheduler_group";
    pub const BUILDER: &str = "builder_group";
    pub const TRACER: &str = "tracer_group";
    pub const CONFIRMER: &str = "confirmer_group";
    pub const PATCHER: &str = "patcher_group";
    pub const SUBMITTER: &str = "submitter_group";
}

/// Sanitizer used preferentially for merges and tracing.
pub const ADDRESS_SANITIZER: &str = "address";

/// Default fuzzing engine.
pub const LIBFUZZER_ENGINE: &str = "libfuzzer";

/// TTL for the per-harness corpus merge lock. Also used as the queue
/// visibility timeout for long-running build items.
pub const MERGING_LOCK_TIMEOUT_SECONDS: u64 = 600;

/// Default queue visibility timeout before an unacked item is redelivered.
pub const DEFAULT_VISIBILITY_TIMEOUT_MS: u64 = 60_000;

/// Deliveries after which a repeatedly failing queue item is dropped.
pub const MAX_TRIES: u64 = 3;

/// Upper bound on local-only corpus files staged into a single merge round.
pub const MAX_LOCAL_FILES: usize = 500;

/// Crash inputs larger than this are not eligible for PoV submission.
pub const MAX_POV_SIZE: u64 = 2 * 1024 * 1024;

/// Cap on related crash variants replayed per (pov token, sanitizer).
pub const MAX_POV_VARIANTS_PER_TOKEN_SANITIZER: usize = 3;

/// Seconds past expiry before a task's scratch space becomes collectable.
pub const DELETE_OLD_TASKS_DELTA_SECONDS: i64 = 1800;

//! Keyed maps on the shared key/value store: build outputs, harness
//! weights and function coverage.

use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use crate::constants::{BUILD_MAP_HASH, COVERAGE_MAP_HASH, HARNESS_WEIGHTS_HASH};
use crate::error::Result;
use crate::messages::{BuildOutput, BuildType, FunctionCoverage, WeightedHarness};

/// Build outputs keyed by (task, build type, sanitizer, internal patch id).
/// FUZZER and PATCH builds of the same task coexist under distinct keys.
#[derive(Clone)]
pub struct BuildMap {
    conn: ConnectionManager,
}

impl BuildMap {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    fn field(task_id: &str, build_type: BuildType, sanitizer: &str, patch_id: &str) -> String {
        format!(
            "{}:{}:{}:{}",
            task_id.to_lowercase(),
            build_type.as_str(),
            sanitizer,
            patch_id
        )
    }

    /// Record a build output, replacing any previous one under its key.
    pub async fn add_build(&self, build: &BuildOutput) -> Result<()> {
        let field = Self::field(
            &build.task_id,
            build.build_type,
            &build.sanitizer,
            &build.internal_patch_id,
        );
        let bytes = serde_json::to_vec(build)?;
        let mut conn = self.conn.clone();
        let _: () = conn.hset(BUILD_MAP_HASH, field, bytes).await?;
        Ok(())
    }

    /// The latest build for an exact (task, type, sanitizer, patch id) key.
    pub async fn get_build_from_san(
        &self,
        task_id: &str,
        build_type: BuildType,
        sanitizer: &str,
        internal_patch_id: &str,
    ) -> Result<Option<BuildOutput>> {
        let field = Self::field(task_id, build_type, sanitizer, internal_patch_id);
        let mut conn = self.conn.clone();
        let bytes: Option<Vec<u8>> = conn.hget(BUILD_MAP_HASH, field).await?;
        match bytes {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// All builds of one type for a task, across sanitizers and patch ids.
    pub async fn get_builds(&self, task_id: &str, build_type: BuildType) -> Result<Vec<BuildOutput>> {
        let prefix = format!("{}:{}:", task_id.to_lowercase(), build_type.as_str());
        let mut conn = self.conn.clone();
        let entries: Vec<(String, Vec<u8>)> = conn.hgetall(BUILD_MAP_HASH).await?;
        let mut builds = Vec::new();
        for (field, bytes) in entries {
            if field.starts_with(&prefix) {
                builds.push(serde_json::from_slice(&bytes)?);
            }
        }
        Ok(builds)
    }
}

/// Scheduling weights per harness. Weight 0 suppresses scheduling.
#[derive(Clone)]
pub struct HarnessWeights {
    conn: ConnectionManager,
}

impl HarnessWeights {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    fn field(harness: &WeightedHarness) -> String {
        format!(
            "{}:{}:{}",
            harness.task_id.to_lowercase(),
            harness.package_name,
            harness.harness_name
        )
    }

    /// Insert or replace a harness entry.
    pub async fn push_harness(&self, harness: &WeightedHarness) -> Result<()> {
        let bytes = serde_json::to_vec(harness)?;
        let mut conn = self.conn.clone();
        let _: () = conn
            .hset(HARNESS_WEIGHTS_HASH, Self::field(harness), bytes)
            .await?;
        Ok(())
    }

    /// Every known harness, including weight-0 ones.
    pub async fn list_harnesses(&self) -> Result<Vec<WeightedHarness>> {
        let mut conn = self.conn.clone();
        let entries: Vec<(String, Vec<u8>)> = conn.hgetall(HARNESS_WEIGHTS_HASH).await?;
        let mut harnesses = Vec::with_capacity(entries.len());
        for (_, bytes) in entries {
            harnesses.push(serde_json::from_slice(&bytes)?);
        }
        Ok(harnesses)
    }

    /// Set every harness of a task to weight 0 so nothing schedules it.
    pub async fn suppress_task(&self, task_id: &str) -> Result<usize> {
        let mut suppressed = 0;
        for mut harness in self.list_harnesses().await? {
            if harness.task_id.eq_ignore_ascii_case(task_id) && harness.weight > 0.0 {
                harness.weight = 0.0;
                self.push_harness(&harness).await?;
                suppressed += 1;
            }
        }
        Ok(suppressed)
    }
}

/// Per-harness function coverage, append/overwrite only.
#[derive(Clone)]
pub struct CoverageMap {
    conn: ConnectionManager,
}

impl CoverageMap {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    fn field(task_id: &str, harness_name: &str) -> String {
        format!("{}:{}", task_id.to_lowercase(), harness_name)
    }

    pub async fn set_function_coverage(
        &self,
        task_id: &str,
        harness_name: &str,
        coverage: &[FunctionCoverage],
    ) -> Result<()> {
        let bytes = serde_json::to_vec(coverage)?;
        let mut conn = self.conn.clone();
        let _: () = conn
            .hset(COVERAGE_MAP_HASH, Self::field(task_id, harness_name), bytes)
            .await?;
        Ok(())
    }

    pub async fn get_function_coverage(
        &self,
        task_id: &str,
        harness_name: &str,
    ) -> Result<Vec<FunctionCoverage>> {
        let mut conn = self.conn.clone();
        let bytes: Option<Vec<u8>> = conn
            .hget(COVERAGE_MAP_HASH, Self::field(task_id, harness_name))
            .await?;
        match bytes {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn build_field_distinguishes_patch_ids() {
        let fuzzer = BuildMap::field("T1", BuildType::Fuzzer, "address", "");
        let patch = BuildMap::field("t1", BuildType::Patch, "address", "p1");
        assert_eq!(fuzzer, "t1:fuzzer:address:");
        assert_eq!(patch, "t1:patch:address:p1");
        assert_ne!(fuzzer, patch);
    }

    #[test]
    fn build_output_serializes_for_storage() {
        let build = BuildOutput {
            task_id: "t1".into(),
            engine: "libfuzzer".into(),
            sanitizer: "address".into(),
            build_type: BuildType::Fuzzer,
            internal_patch_id: String::new(),
            task_dir: PathBuf::from("/tasks/t1"),
        };
        let bytes = serde_json::to_vec(&build).unwrap();
        let back: BuildOutput = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(build, back);
    }

    #[test]
    fn harness_field_is_case_insensitive_on_task() {
        let a = HarnessWeights::field(&WeightedHarness {
            task_id: "T1".into(),
            package_name: "libpng".into(),
            harness_name: "read_fuzzer".into(),
            weight: 1.0,
        });
        let b = HarnessWeights::field(&WeightedHarness {
            task_id: "t1".into(),
            package_name: "libpng".into(),
            harness_name: "read_fuzzer".into(),
            weight: 0.0,
        });
        assert_eq!(a, b);
    }
}

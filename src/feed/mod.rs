//! CI metadata feed: provider contract, materialized commit data, the
//! per-run commit cache and pure lookups over it.

pub mod cache;
pub mod evergreen;
pub mod lookup;

use std::future::Future;

use serde::{Deserialize, Serialize};

use crate::error::StreakError;
use crate::model::Commit;

/// Task-level outcome as reported by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TaskStatus {
    Success,
    Failed,
    Other(String),
}

impl TaskStatus {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Other(s) => s,
        }
    }
}

impl From<String> for TaskStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "success" => Self::Success,
            "failed" => Self::Failed,
            _ => Self::Other(s),
        }
    }
}

impl From<TaskStatus> for String {
    fn from(status: TaskStatus) -> Self {
        status.as_str().to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    Pass,
    Fail,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestResult {
    pub test_file: String,
    pub status: TestStatus,
}

impl TestResult {
    pub fn new(test_file: impl Into<String>, status: TestStatus) -> Self {
        Self {
            test_file: test_file.into(),
            status,
        }
    }
}

/// One execution of a task at one commit, with its test outcomes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRun {
    pub task_id: String,
    pub display_name: String,
    pub build_variant: String,
    pub order: i64,
    pub version_id: String,
    pub status: TaskStatus,
    pub timed_out: bool,
    pub tests: Vec<TestResult>,
}

impl TaskRun {
    pub fn commit(&self) -> Commit {
        Commit::new(&self.version_id, self.order)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Build {
    pub build_id: String,
    pub build_variant: String,
    pub display_name: String,
    /// Only materialized for required builds.
    pub tasks: Vec<TaskRun>,
}

/// A commit's CI metadata, fully materialized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    pub version_id: String,
    pub order: i64,
    pub project: String,
    pub builds: Vec<Build>,
}

impl Version {
    pub fn build_by_variant(&self, build_variant: &str) -> Option<&Build> {
        self.builds.iter().find(|b| b.build_variant == build_variant)
    }
}

/// Listing entry for a version before its builds are loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionRef {
    pub version_id: String,
    pub order: i64,
    pub project: String,
    pub build_ids: Vec<String>,
}

/// Read-only source of CI results.
pub trait CiProvider: Send + Sync + 'static {
    /// The `limit` most recent versions of `project`, ascending by order.
    fn recent_versions(
        &self,
        project: &str,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<VersionRef>, StreakError>> + Send;

    /// Load a version's builds. Tasks and test results are only fetched for
    /// builds whose display name starts with `required_marker`.
    fn load_version(
        &self,
        version: &VersionRef,
        required_marker: &str,
    ) -> impl Future<Output = Result<Version, StreakError>> + Send;
}

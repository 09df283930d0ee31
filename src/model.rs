use std::fmt;

use serde::{Deserialize, Serialize};

/// A position in the project's integration sequence.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Commit {
    pub version_id: String,
    pub order: i64,
}

impl Commit {
    pub fn new(version_id: impl Into<String>, order: i64) -> Self {
        Self {
            version_id: version_id.into(),
            order,
        }
    }
}

/// Identity of a streak family: one test in one task on one build variant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreakKey {
    pub project: String,
    pub build_variant: String,
    pub task: String,
    pub test: String,
}

impl StreakKey {
    pub fn new(
        project: impl Into<String>,
        build_variant: impl Into<String>,
        task: impl Into<String>,
        test: impl Into<String>,
    ) -> Self {
        Self {
            project: project.into(),
            build_variant: build_variant.into(),
            task: task.into(),
            test: test.into(),
        }
    }
}

impl fmt::Display for StreakKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.project, self.build_variant, self.task, self.test
        )
    }
}

/// A persisted run of consecutive commits in which one test kept failing.
///
/// Absent boundaries are omitted from the serialized document rather than
/// written as `null`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureStreak {
    pub project: String,
    pub build_variant: String,
    pub task: String,
    pub test: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub beginning_commit: Option<Commit>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ending_commit: Option<Commit>,
    pub failing_versions: Vec<Commit>,
}

impl FailureStreak {
    pub fn new(key: &StreakKey, failing_versions: Vec<Commit>) -> Self {
        Self {
            project: key.project.clone(),
            build_variant: key.build_variant.clone(),
            task: key.task.clone(),
            test: key.test.clone(),
            beginning_commit: None,
            ending_commit: None,
            failing_versions,
        }
    }

    pub fn key(&self) -> StreakKey {
        StreakKey::new(&self.project, &self.build_variant, &self.task, &self.test)
    }

    pub fn matches(&self, key: &StreakKey) -> bool {
        self.project == key.project
            && self.build_variant == key.build_variant
            && self.task == key.task
            && self.test == key.test
    }

    pub fn first_order(&self) -> Option<i64> {
        self.failing_versions.first().map(|c| c.order)
    }

    /// Order of the most recent failing commit.
    pub fn last_order(&self) -> Option<i64> {
        self.failing_versions.last().map(|c| c.order)
    }

    pub fn contains_order(&self, order: i64) -> bool {
        self.failing_versions.iter().any(|c| c.order == order)
    }

    /// A streak is open until an ending commit has been recorded.
    pub fn is_open(&self) -> bool {
        self.ending_commit.is_none()
    }

    /// True when `failing_versions` is non-empty and strictly increasing.
    pub fn is_well_formed(&self) -> bool {
        !self.failing_versions.is_empty()
            && self
                .failing_versions
                .windows(2)
                .all(|w| w[0].order < w[1].order)
    }

    /// Append `commit` if it keeps the sequence strictly increasing.
    /// Returns false (and leaves the streak untouched) otherwise.
    pub fn append(&mut self, commit: Commit) -> bool {
        if self.last_order().is_some_and(|last| commit.order <= last) {
            return false;
        }
        self.failing_versions.push(commit);
        true
    }
}

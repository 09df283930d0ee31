use serde::Serialize;

use super::boundary;
use crate::config::DetectionPolicy;
use crate::feed::cache::CommitFeedCache;
use crate::feed::lookup::{find_task, is_test_failing};
use crate::feed::{TaskRun, Version};
use crate::model::{FailureStreak, StreakKey};

/// Why a task's failures could not start a streak at this commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Rejection {
    /// The commit is cached but the task did not run there.
    TaskMissing { order: i64 },
    /// The task ran but did not fail at the task level.
    TaskNotFailed { order: i64, status: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Detection {
    /// A commit inside the confirmation window is not cached yet. Not an
    /// error: the same failure must be evaluated again once it is.
    Deferred { missing_order: i64 },
    /// The task-level window check failed for every test of the task.
    NotConfirmed(Rejection),
    /// The window was confirmed at the task level. `minted` holds one new
    /// streak per test that kept failing; `rejected` the tests that did not.
    Evaluated {
        minted: Vec<FailureStreak>,
        rejected: Vec<String>,
    },
}

/// Decides whether unmatched failures are the start of a new streak.
///
/// A failure at commit `C` qualifies when the same task failed at the task
/// level at every commit of `C+1..C+window-1` and the test itself failed in
/// each of those runs. This filters out single-commit flakes.
#[derive(Debug, Clone)]
pub struct StreakDetector {
    policy: DetectionPolicy,
}

impl StreakDetector {
    pub fn new(policy: DetectionPolicy) -> Self {
        Self { policy }
    }

    pub fn window(&self) -> usize {
        self.policy.confirmation_window
    }

    /// Evaluate `tests` (all failing in `task`) for new streaks.
    ///
    /// `earlier` is the commit preceding `task`'s commit, used to resolve the
    /// beginning boundary. The ending boundary is resolved from the commit
    /// right after the window when it is cached, and left open otherwise.
    pub fn detect(
        &self,
        cache: &CommitFeedCache,
        task: &TaskRun,
        tests: &[String],
        earlier: Option<&Version>,
    ) -> Detection {
        let window = match self.lookahead(cache, task) {
            Ok(window) => window,
            Err(detection) => return detection,
        };

        let after_window = task.order + self.window() as i64;
        let later = cache.get(after_window).map(|v| v.as_ref());

        let mut minted = Vec::new();
        let mut rejected = Vec::new();
        for test in tests {
            if !window.iter().all(|run| is_test_failing(run, test)) {
                rejected.push(test.clone());
                continue;
            }

            let key = StreakKey::new(
                &self.policy.project,
                &task.build_variant,
                &task.display_name,
                test,
            );
            let mut failing_versions = Vec::with_capacity(window.len() + 1);
            failing_versions.push(task.commit());
            failing_versions.extend(window.iter().map(|run| run.commit()));

            let mut streak = FailureStreak::new(&key, failing_versions);
            streak.beginning_commit = boundary::beginning_commit(test, task, earlier);
            streak.ending_commit = boundary::ending_commit(test, task, later);
            minted.push(streak);
        }

        Detection::Evaluated { minted, rejected }
    }

    /// Task runs at `C+1..C+window-1`, each required to have failed at the
    /// task level.
    fn lookahead<'a>(
        &self,
        cache: &'a CommitFeedCache,
        task: &TaskRun,
    ) -> Result<Vec<&'a TaskRun>, Detection> {
        let mut runs = Vec::with_capacity(self.window().saturating_sub(1));
        for ahead in 1..self.window() as i64 {
            let order = task.order + ahead;
            let Some(version) = cache.get(order) else {
                return Err(Detection::Deferred {
                    missing_order: order,
                });
            };
            let Some(run) = find_task(version, &task.build_variant, &task.display_name) else {
                return Err(Detection::NotConfirmed(Rejection::TaskMissing { order }));
            };
            if !self.policy.is_failure_status(run.status.as_str()) {
                return Err(Detection::NotConfirmed(Rejection::TaskNotFailed {
                    order,
                    status: run.status.as_str().to_string(),
                }));
            }
            runs.push(run);
        }
        Ok(runs)
    }
}

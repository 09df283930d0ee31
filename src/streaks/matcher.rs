use std::sync::Arc;

use super::boundary;
use crate::config::DetectionPolicy;
use crate::error::StreakError;
use crate::feed::{TaskRun, Version};
use crate::model::StreakKey;
use crate::store::{ExtendOutcome, StreakStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchOutcome {
    /// Appended to the open streak that ended one commit earlier.
    Extended,
    /// This commit is already part of a stored streak.
    AlreadyRecorded,
    /// No streak to continue; evaluate as a new candidate.
    Unmatched,
}

/// Per-task summary of `match_failures`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MatchReport {
    pub extended: usize,
    pub already_recorded: usize,
    pub unmatched: Vec<String>,
}

/// Continues existing streaks with newly observed failures.
pub struct StreakMatcher<S> {
    store: Arc<S>,
    project: String,
}

impl<S: StreakStore> StreakMatcher<S> {
    pub fn new(store: Arc<S>, policy: &DetectionPolicy) -> Self {
        Self {
            store,
            project: policy.project.clone(),
        }
    }

    /// Try to append `task`'s commit to the streak of `test`.
    ///
    /// The append is one conditional store call. If it does not match (no
    /// open streak ends one commit earlier, or another writer got there
    /// first) the failure is reported as unmatched so it still reaches the
    /// detector.
    pub async fn match_failure(
        &self,
        task: &TaskRun,
        test: &str,
        earlier: Option<&Version>,
    ) -> Result<MatchOutcome, StreakError> {
        let key = StreakKey::new(&self.project, &task.build_variant, &task.display_name, test);
        let commit = task.commit();
        let beginning = boundary::beginning_commit(test, task, earlier);

        let outcome = self
            .store
            .try_extend(&key, &commit, beginning.as_ref())
            .await?;

        Ok(match outcome {
            ExtendOutcome::Extended => {
                tracing::debug!(
                    order = commit.order,
                    build_variant = %key.build_variant,
                    task = %key.task,
                    test = %key.test,
                    "extended streak"
                );
                MatchOutcome::Extended
            }
            ExtendOutcome::AlreadyRecorded => MatchOutcome::AlreadyRecorded,
            ExtendOutcome::NoMatch => MatchOutcome::Unmatched,
        })
    }

    pub async fn match_failures(
        &self,
        task: &TaskRun,
        tests: &[String],
        earlier: Option<&Version>,
    ) -> Result<MatchReport, StreakError> {
        let mut report = MatchReport::default();
        for test in tests {
            match self.match_failure(task, test, earlier).await? {
                MatchOutcome::Extended => report.extended += 1,
                MatchOutcome::AlreadyRecorded => report.already_recorded += 1,
                MatchOutcome::Unmatched => report.unmatched.push(test.clone()),
            }
        }
        Ok(report)
    }
}

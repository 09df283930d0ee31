use tokio::sync::Mutex;

use super::{CreateOutcome, ExtendOutcome, StreakStore, check_new_streak};
use crate::error::StreakError;
use crate::model::{Commit, FailureStreak, StreakKey};

/// Process-local streak store.
///
/// Every operation holds the internal Mutex for its whole duration, so the
/// match predicate and the mutation are observed atomically by concurrent
/// callers.
#[derive(Default)]
pub struct MemoryStreakStore {
    streaks: Mutex<Vec<FailureStreak>>,
}

impl MemoryStreakStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store with existing records (for tests and dry runs).
    pub fn with_streaks(streaks: Vec<FailureStreak>) -> Self {
        Self {
            streaks: Mutex::new(streaks),
        }
    }

    pub async fn len(&self) -> usize {
        self.streaks.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.streaks.lock().await.is_empty()
    }
}

impl StreakStore for MemoryStreakStore {
    async fn try_extend(
        &self,
        key: &StreakKey,
        commit: &Commit,
        beginning: Option<&Commit>,
    ) -> Result<ExtendOutcome, StreakError> {
        let mut streaks = self.streaks.lock().await;

        if streaks
            .iter()
            .any(|s| s.matches(key) && s.contains_order(commit.order))
        {
            return Ok(ExtendOutcome::AlreadyRecorded);
        }

        let previous = commit.order - 1;
        let Some(streak) = streaks
            .iter_mut()
            .find(|s| s.matches(key) && s.is_open() && s.last_order() == Some(previous))
        else {
            return Ok(ExtendOutcome::NoMatch);
        };

        if !streak.append(commit.clone()) {
            return Ok(ExtendOutcome::NoMatch);
        }
        if streak.beginning_commit.is_none() {
            streak.beginning_commit = beginning.cloned();
        }
        Ok(ExtendOutcome::Extended)
    }

    async fn create_new(&self, streak: &FailureStreak) -> Result<CreateOutcome, StreakError> {
        check_new_streak(streak)?;
        let key = streak.key();
        let mut streaks = self.streaks.lock().await;

        let claimed = streaks.iter().any(|existing| {
            existing.matches(&key)
                && streak
                    .failing_versions
                    .iter()
                    .any(|c| existing.contains_order(c.order))
        });
        if claimed {
            return Ok(CreateOutcome::Duplicate);
        }

        streaks.push(streak.clone());
        Ok(CreateOutcome::Created)
    }

    async fn try_close(&self, key: &StreakKey, commit: &Commit) -> Result<bool, StreakError> {
        let mut streaks = self.streaks.lock().await;
        let previous = commit.order - 1;
        match streaks
            .iter_mut()
            .find(|s| s.matches(key) && s.is_open() && s.last_order() == Some(previous))
        {
            Some(streak) => {
                streak.ending_commit = Some(commit.clone());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn streaks_for(&self, key: &StreakKey) -> Result<Vec<FailureStreak>, StreakError> {
        let streaks = self.streaks.lock().await;
        let mut found: Vec<FailureStreak> =
            streaks.iter().filter(|s| s.matches(key)).cloned().collect();
        found.sort_by_key(|s| s.first_order());
        Ok(found)
    }

    async fn list(&self, project: &str) -> Result<Vec<FailureStreak>, StreakError> {
        let streaks = self.streaks.lock().await;
        let mut found: Vec<FailureStreak> = streaks
            .iter()
            .filter(|s| s.project == project)
            .cloned()
            .collect();
        found.sort_by(|a, b| {
            (&a.build_variant, &a.task, &a.test, a.first_order()).cmp(&(
                &b.build_variant,
                &b.task,
                &b.test,
                b.first_order(),
            ))
        });
        Ok(found)
    }
}

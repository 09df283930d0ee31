//! Streak persistence.
//!
//! `StreakStore` is the only way the core mutates state. Every operation is
//! a single atomic call against the backend: the match predicate and the
//! mutation are never split into a read followed by a separate write.
//!
//! Backends:
//! - `MemoryStreakStore` - process-local, used by tests and dry runs
//! - `DuckDbStreakStore` - durable, behind the `duckdb-store` feature (default)

pub mod memory;

#[cfg(feature = "duckdb-store")]
pub mod duckdb_store;
#[cfg(feature = "duckdb-store")]
pub mod schema;

use std::future::Future;

use serde::Serialize;

use crate::error::StreakError;
use crate::model::{Commit, FailureStreak, StreakKey};

pub use memory::MemoryStreakStore;

#[cfg(feature = "duckdb-store")]
pub use duckdb_store::DuckDbStreakStore;

/// Result of a conditional append.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtendOutcome {
    /// The open streak ending at `order - 1` now ends at `order`.
    Extended,
    /// A streak for this key already claims `order`; nothing changed.
    AlreadyRecorded,
    /// No open streak ends at `order - 1`.
    NoMatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CreateOutcome {
    Created,
    /// Some order of the new streak is already claimed by a record with the
    /// same key; nothing was written.
    Duplicate,
}

pub trait StreakStore: Send + Sync + 'static {
    /// Append `commit` to the open streak for `key` whose most recent
    /// failing order is `commit.order - 1`. When `beginning` is given and the
    /// stored streak has no beginning commit, it is set in the same update.
    fn try_extend(
        &self,
        key: &StreakKey,
        commit: &Commit,
        beginning: Option<&Commit>,
    ) -> impl Future<Output = Result<ExtendOutcome, StreakError>> + Send;

    /// Insert a freshly minted streak.
    fn create_new(
        &self,
        streak: &FailureStreak,
    ) -> impl Future<Output = Result<CreateOutcome, StreakError>> + Send;

    /// Record `commit` as the ending of the open streak for `key` whose most
    /// recent failing order is `commit.order - 1`. An existing ending is
    /// never replaced. Returns whether a streak was closed.
    fn try_close(
        &self,
        key: &StreakKey,
        commit: &Commit,
    ) -> impl Future<Output = Result<bool, StreakError>> + Send;

    /// All streaks for `key`, oldest first.
    fn streaks_for(
        &self,
        key: &StreakKey,
    ) -> impl Future<Output = Result<Vec<FailureStreak>, StreakError>> + Send;

    /// All streaks for `project`, ordered by key then first failing order.
    fn list(
        &self,
        project: &str,
    ) -> impl Future<Output = Result<Vec<FailureStreak>, StreakError>> + Send;
}

/// Reject streaks that would break the ordering invariants before they reach
/// a backend.
pub(crate) fn check_new_streak(streak: &FailureStreak) -> Result<(), StreakError> {
    if !streak.is_well_formed() {
        return Err(StreakError::Store(format!(
            "refusing to store streak for {} with empty or non-increasing failing_versions",
            streak.key()
        )));
    }
    Ok(())
}

/// Store chosen at runtime from configuration.
pub enum ConfiguredStore {
    Memory(MemoryStreakStore),
    #[cfg(feature = "duckdb-store")]
    Duckdb(DuckDbStreakStore),
}

impl StreakStore for ConfiguredStore {
    async fn try_extend(
        &self,
        key: &StreakKey,
        commit: &Commit,
        beginning: Option<&Commit>,
    ) -> Result<ExtendOutcome, StreakError> {
        match self {
            Self::Memory(s) => s.try_extend(key, commit, beginning).await,
            #[cfg(feature = "duckdb-store")]
            Self::Duckdb(s) => s.try_extend(key, commit, beginning).await,
        }
    }

    async fn create_new(&self, streak: &FailureStreak) -> Result<CreateOutcome, StreakError> {
        match self {
            Self::Memory(s) => s.create_new(streak).await,
            #[cfg(feature = "duckdb-store")]
            Self::Duckdb(s) => s.create_new(streak).await,
        }
    }

    async fn try_close(&self, key: &StreakKey, commit: &Commit) -> Result<bool, StreakError> {
        match self {
            Self::Memory(s) => s.try_close(key, commit).await,
            #[cfg(feature = "duckdb-store")]
            Self::Duckdb(s) => s.try_close(key, commit).await,
        }
    }

    async fn streaks_for(&self, key: &StreakKey) -> Result<Vec<FailureStreak>, StreakError> {
        match self {
            Self::Memory(s) => s.streaks_for(key).await,
            #[cfg(feature = "duckdb-store")]
            Self::Duckdb(s) => s.streaks_for(key).await,
        }
    }

    async fn list(&self, project: &str) -> Result<Vec<FailureStreak>, StreakError> {
        match self {
            Self::Memory(s) => s.list(project).await,
            #[cfg(feature = "duckdb-store")]
            Self::Duckdb(s) => s.list(project).await,
        }
    }
}

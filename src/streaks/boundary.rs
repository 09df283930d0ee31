//! Beginning/ending commit checks. Both are pure lookups: when the answer is
//! not determinable (commit not cached, task missing, test not reported as
//! passing) they return `None`.

use crate::feed::lookup::{find_task, is_test_passing};
use crate::feed::{TaskRun, Version};
use crate::model::Commit;

/// The last known passing commit before a failure at `task`'s commit.
///
/// `earlier` is the commit immediately preceding the one being evaluated,
/// as handed in by the scanner.
pub fn beginning_commit(test: &str, task: &TaskRun, earlier: Option<&Version>) -> Option<Commit> {
    passing_commit(test, task, earlier?)
}

/// The first passing commit after the last known failing one. `later` is
/// the commit one step past it.
pub fn ending_commit(test: &str, task: &TaskRun, later: Option<&Version>) -> Option<Commit> {
    passing_commit(test, task, later?)
}

fn passing_commit(test: &str, task: &TaskRun, version: &Version) -> Option<Commit> {
    let run = find_task(version, &task.build_variant, &task.display_name)?;
    is_test_passing(run, test).then(|| run.commit())
}

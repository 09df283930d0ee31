//! Scripted CI feed shared by the integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use failure_streaks::error::StreakError;
use failure_streaks::feed::{
    Build, CiProvider, TaskRun, TaskStatus, TestResult, TestStatus, Version, VersionRef,
};

pub const PROJECT: &str = "proj";

/// In-memory feed. Versions can be appended between scans to simulate new
/// commits landing.
#[derive(Default)]
pub struct ScriptedFeed {
    versions: Mutex<BTreeMap<i64, Version>>,
    loads: AtomicUsize,
}

impl ScriptedFeed {
    pub fn new(versions: Vec<Version>) -> Self {
        let feed = Self::default();
        for v in versions {
            feed.push(v);
        }
        feed
    }

    pub fn push(&self, version: Version) {
        self.versions
            .lock()
            .unwrap()
            .insert(version.order, version);
    }

    /// Number of `load_version` calls served so far.
    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

impl CiProvider for ScriptedFeed {
    async fn recent_versions(
        &self,
        project: &str,
        limit: usize,
    ) -> Result<Vec<VersionRef>, StreakError> {
        let versions = self.versions.lock().unwrap();
        let refs: Vec<VersionRef> = versions
            .values()
            .filter(|v| v.project == project)
            .map(|v| VersionRef {
                version_id: v.version_id.clone(),
                order: v.order,
                project: v.project.clone(),
                build_ids: v.builds.iter().map(|b| b.build_id.clone()).collect(),
            })
            .collect();
        let skip = refs.len().saturating_sub(limit);
        Ok(refs.into_iter().skip(skip).collect())
    }

    async fn load_version(
        &self,
        version: &VersionRef,
        _required_marker: &str,
    ) -> Result<Version, StreakError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        self.versions
            .lock()
            .unwrap()
            .get(&version.order)
            .cloned()
            .ok_or_else(|| StreakError::Upstream {
                message: format!("no version at order {}", version.order),
                status: Some(404),
            })
    }
}

// ===========================================================================
// Builders
// ===========================================================================

pub fn task(variant: &str, name: &str, order: i64, failing: &[&str], passing: &[&str]) -> TaskRun {
    let status = if failing.is_empty() {
        TaskStatus::Success
    } else {
        TaskStatus::Failed
    };
    let tests = failing
        .iter()
        .map(|t| TestResult::new(*t, TestStatus::Fail))
        .chain(passing.iter().map(|t| TestResult::new(*t, TestStatus::Pass)))
        .collect();
    TaskRun {
        task_id: format!("{variant}_{name}_{order}"),
        display_name: name.to_string(),
        build_variant: variant.to_string(),
        order,
        version_id: format!("v{order}"),
        status,
        timed_out: false,
        tests,
    }
}

pub fn build(variant: &str, display_name: &str, tasks: Vec<TaskRun>) -> Build {
    Build {
        build_id: format!("{variant}_{}", tasks.first().map_or(0, |t| t.order)),
        build_variant: variant.to_string(),
        display_name: display_name.to_string(),
        tasks,
    }
}

pub fn version(order: i64, builds: Vec<Build>) -> Version {
    Version {
        version_id: format!("v{order}"),
        order,
        project: PROJECT.to_string(),
        builds,
    }
}

/// One required `linux` build with a `jsCore` task where `a.js` fails or
/// passes.
pub fn linux(order: i64, a_fails: bool) -> Version {
    let run = if a_fails {
        task("linux", "jsCore", order, &["a.js"], &[])
    } else {
        task("linux", "jsCore", order, &[], &["a.js"])
    };
    version(order, vec![build("linux", "! Linux", vec![run])])
}

/// `linux` versions for `range`, failing at the orders listed in `failing`.
pub fn linux_run(range: std::ops::RangeInclusive<i64>, failing: &[i64]) -> Vec<Version> {
    range.map(|o| linux(o, failing.contains(&o))).collect()
}

//! Scans against the DuckDB store.
//!
//! All tests gated with #[cfg(feature = "duckdb-store")].
//!
//! These cover what the in-memory tests cannot:
//! - streaks written by one scan are visible to a scan in a later process
//! - concurrent per-task workers funnel through the single DuckDB worker

#![cfg(feature = "duckdb-store")]

mod common;

use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use common::{PROJECT, ScriptedFeed, build, linux, linux_run, task, version};
use failure_streaks::config::{DetectionPolicy, ScanConfig};
use failure_streaks::model::{Commit, StreakKey};
use failure_streaks::scan::StreakScanner;
use failure_streaks::store::{DuckDbStreakStore, StreakStore};

// ===========================================================================
// Helpers
// ===========================================================================

/// Create a temp directory for a test, returning its path.
fn test_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir()
        .join("failure-streaks-test")
        .join(name)
        .join(format!("{}_{}", std::process::id(), timestamp_nanos()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

/// Nanosecond timestamp for unique directory names.
fn timestamp_nanos() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

fn a_js() -> StreakKey {
    StreakKey::new(PROJECT, "linux", "jsCore", "a.js")
}

async fn scan(feed: &Arc<ScriptedFeed>, store: &Arc<DuckDbStreakStore>, policy: DetectionPolicy) {
    StreakScanner::new(feed.clone(), store.clone(), policy, 8)
        .run(&ScanConfig::default(), &CancellationToken::new())
        .await
        .unwrap();
}

// ===========================================================================
// Tests
// ===========================================================================

#[tokio::test]
async fn test_streak_survives_restart_and_keeps_growing() {
    let dir = test_dir("restart");
    let db_path = dir.join("streaks.duckdb");
    let feed = Arc::new(ScriptedFeed::new(linux_run(99..=102, &[100, 101, 102])));
    let policy = DetectionPolicy::for_project(PROJECT).with_close_on_pass(true);

    {
        let store = Arc::new(DuckDbStreakStore::open(db_path.clone()).unwrap());
        scan(&feed, &store, policy.clone()).await;
        let streaks = store.streaks_for(&a_js()).await.unwrap();
        assert_eq!(streaks.len(), 1);
        assert!(streaks[0].is_open());
    }

    // New commits land: one more failure, then a pass.
    feed.push(linux(103, true));
    feed.push(linux(104, false));

    let store = Arc::new(DuckDbStreakStore::open(db_path).unwrap());
    scan(&feed, &store, policy).await;

    let streaks = store.streaks_for(&a_js()).await.unwrap();
    assert_eq!(streaks.len(), 1);
    let orders: Vec<i64> = streaks[0].failing_versions.iter().map(|c| c.order).collect();
    assert_eq!(orders, vec![100, 101, 102, 103]);
    assert_eq!(streaks[0].beginning_commit, Some(Commit::new("v99", 99)));
    assert_eq!(streaks[0].ending_commit, Some(Commit::new("v104", 104)));

    drop(store);
    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn test_many_tasks_per_commit() {
    let dir = test_dir("many_tasks");
    let tasks: Vec<String> = (0..12).map(|i| format!("task_{i:02}")).collect();
    let versions = (99..=103)
        .map(|o| {
            let failing = (100..=102).contains(&o);
            let runs = tasks
                .iter()
                .map(|name| {
                    if failing {
                        task("linux", name, o, &["a.js"], &[])
                    } else {
                        task("linux", name, o, &[], &["a.js"])
                    }
                })
                .collect();
            version(o, vec![build("linux", "! Linux", runs)])
        })
        .collect();
    let feed = Arc::new(ScriptedFeed::new(versions));
    let store = Arc::new(DuckDbStreakStore::open(dir.join("streaks.duckdb")).unwrap());

    scan(&feed, &store, DetectionPolicy::for_project(PROJECT)).await;
    // Second pass must not add or grow anything.
    scan(&feed, &store, DetectionPolicy::for_project(PROJECT)).await;

    let streaks = store.list(PROJECT).await.unwrap();
    assert_eq!(streaks.len(), tasks.len());
    for streak in &streaks {
        let orders: Vec<i64> = streak.failing_versions.iter().map(|c| c.order).collect();
        assert_eq!(orders, vec![100, 101, 102]);
        assert_eq!(streak.beginning_commit, Some(Commit::new("v99", 99)));
        assert_eq!(streak.ending_commit, Some(Commit::new("v103", 103)));
    }

    drop(store);
    let _ = std::fs::remove_dir_all(&dir);
}

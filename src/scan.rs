use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use futures_util::future::try_join_all;
use serde::Serialize;
use tokio::sync::{RwLock, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::{DetectionPolicy, ScanConfig};
use crate::error::StreakError;
use crate::feed::cache::CommitFeedCache;
use crate::feed::lookup::{failing_tests, passing_tests};
use crate::feed::{CiProvider, TaskRun, Version, VersionRef};
use crate::model::StreakKey;
use crate::store::{CreateOutcome, StreakStore};
use crate::streaks::{Detection, StreakDetector, StreakMatcher};

/// Upper bound on per-commit workers, whatever the config says.
pub const MAX_CONCURRENT_CAP: usize = 64;

/// Counters for one scan (or one commit of a scan).
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct ScanSummary {
    pub commits_scanned: usize,
    pub tasks_evaluated: usize,
    pub extended: usize,
    pub already_recorded: usize,
    pub created: usize,
    pub duplicates: usize,
    /// Failing tests whose confirmation window is not fully cached yet.
    pub deferred: usize,
    /// Failing tests that did not qualify as a new streak.
    pub not_confirmed: usize,
    pub closed: usize,
    pub cancelled: bool,
}

impl ScanSummary {
    fn absorb(&mut self, other: &ScanSummary) {
        self.commits_scanned += other.commits_scanned;
        self.tasks_evaluated += other.tasks_evaluated;
        self.extended += other.extended;
        self.already_recorded += other.already_recorded;
        self.created += other.created;
        self.duplicates += other.duplicates;
        self.deferred += other.deferred;
        self.not_confirmed += other.not_confirmed;
        self.closed += other.closed;
    }
}

/// Walks the feed in increasing order and maintains streaks.
///
/// Commits are processed strictly one after another. Within a commit every
/// (build variant, task) pair is an independent unit of work and runs on a
/// `JoinSet`, bounded by a semaphore. All units of a commit finish before the
/// next commit starts, so each streak sees its commits in order.
pub struct StreakScanner<P, S> {
    provider: Arc<P>,
    store: Arc<S>,
    policy: Arc<DetectionPolicy>,
    matcher: Arc<StreakMatcher<S>>,
    detector: Arc<StreakDetector>,
    cache: Arc<RwLock<CommitFeedCache>>,
    semaphore: Arc<Semaphore>,
}

/// Everything a per-task worker needs for one commit.
struct CommitContext<S> {
    current: Arc<Version>,
    earlier: Option<Arc<Version>>,
    store: Arc<S>,
    policy: Arc<DetectionPolicy>,
    matcher: Arc<StreakMatcher<S>>,
    detector: Arc<StreakDetector>,
    cache: Arc<RwLock<CommitFeedCache>>,
    semaphore: Arc<Semaphore>,
}

impl<P: CiProvider, S: StreakStore> StreakScanner<P, S> {
    pub fn new(
        provider: Arc<P>,
        store: Arc<S>,
        policy: DetectionPolicy,
        max_concurrent: usize,
    ) -> Self {
        let max_concurrent = max_concurrent.clamp(1, MAX_CONCURRENT_CAP);
        Self {
            provider,
            matcher: Arc::new(StreakMatcher::new(store.clone(), &policy)),
            detector: Arc::new(StreakDetector::new(policy.clone())),
            store,
            policy: Arc::new(policy),
            cache: Arc::new(RwLock::new(CommitFeedCache::new())),
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
        }
    }

    /// Scan the most recent `scan.lookback_versions` commits.
    ///
    /// Cancellation is checked between commits; a cancelled scan returns the
    /// counters accumulated so far with `cancelled` set. Every store
    /// mutation is idempotent, so the next run picks up where this one
    /// stopped.
    pub async fn run(
        &self,
        scan: &ScanConfig,
        cancel: &CancellationToken,
    ) -> Result<ScanSummary, StreakError> {
        let start = Instant::now();
        let refs = self
            .provider
            .recent_versions(&self.policy.project, scan.lookback_versions)
            .await?;
        let by_order: HashMap<i64, &VersionRef> = refs.iter().map(|r| (r.order, r)).collect();

        tracing::info!(
            project = %self.policy.project,
            versions = refs.len(),
            window = self.detector.window(),
            "scan starting"
        );

        let mut summary = ScanSummary::default();
        for version in &refs {
            if cancel.is_cancelled() {
                tracing::info!(order = version.order, "scan cancelled");
                summary.cancelled = true;
                break;
            }
            if scan.max_order.is_some_and(|max| version.order > max) {
                continue;
            }

            // Previous commit, the commit itself, the confirmation window and
            // the commit right after it.
            let wanted: Vec<&VersionRef> = (version.order - 1
                ..=version.order + self.detector.window() as i64)
                .filter_map(|order| by_order.get(&order).copied())
                .collect();
            self.load(&wanted).await?;

            let commit_summary = self.scan_commit(version.order).await?;
            summary.absorb(&commit_summary);
        }

        tracing::info!(
            elapsed_ms = start.elapsed().as_millis() as u64,
            commits = summary.commits_scanned,
            created = summary.created,
            extended = summary.extended,
            deferred = summary.deferred,
            closed = summary.closed,
            "scan finished"
        );
        Ok(summary)
    }

    /// Load the given versions into the cache, skipping cached ones.
    pub async fn load(&self, refs: &[&VersionRef]) -> Result<(), StreakError> {
        let missing: Vec<&VersionRef> = {
            let cache = self.cache.read().await;
            refs.iter()
                .copied()
                .filter(|r| !cache.contains(r.order))
                .collect()
        };
        if missing.is_empty() {
            return Ok(());
        }

        let marker = self.policy.required_marker.as_str();
        let loaded = try_join_all(
            missing
                .iter()
                .map(|r| self.provider.load_version(r, marker)),
        )
        .await?;

        let mut cache = self.cache.write().await;
        for version in loaded {
            cache.insert(version);
        }
        Ok(())
    }

    /// Evaluate every required failing (or timed-out) task of the cached
    /// commit at `order`.
    ///
    /// The commit before it is used for beginning boundaries, the commits
    /// after it for confirmation. Whatever of those is not cached simply
    /// leaves the corresponding decision open.
    pub async fn scan_commit(&self, order: i64) -> Result<ScanSummary, StreakError> {
        let (current, earlier) = {
            let cache = self.cache.read().await;
            (cache.get_arc(order), cache.get_arc(order - 1))
        };
        let Some(current) = current else {
            tracing::warn!(order, "commit not cached, skipping");
            return Ok(ScanSummary::default());
        };

        let ctx = Arc::new(CommitContext {
            current,
            earlier,
            store: self.store.clone(),
            policy: self.policy.clone(),
            matcher: self.matcher.clone(),
            detector: self.detector.clone(),
            cache: self.cache.clone(),
            semaphore: self.semaphore.clone(),
        });

        let mut set = JoinSet::new();
        for (build_idx, build) in ctx.current.builds.iter().enumerate() {
            if !self.policy.is_required(&build.display_name) {
                continue;
            }
            for (task_idx, task) in build.tasks.iter().enumerate() {
                if !is_failure(&self.policy, task) && !self.policy.close_on_pass {
                    continue;
                }
                let ctx = ctx.clone();
                set.spawn(async move { evaluate_task(ctx, build_idx, task_idx).await });
            }
        }

        let mut summary = ScanSummary {
            commits_scanned: 1,
            ..ScanSummary::default()
        };
        let mut first_error = None;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok(task_summary)) => summary.absorb(&task_summary),
                Ok(Err(e)) => {
                    tracing::error!(order, reason = e.reason(), "task evaluation failed: {e}");
                    first_error.get_or_insert(e);
                }
                Err(join_err) => {
                    tracing::error!(order, "task evaluation panicked: {join_err}");
                    first_error.get_or_insert(StreakError::Other(format!(
                        "task evaluation panicked: {join_err}"
                    )));
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        tracing::debug!(
            order,
            tasks = summary.tasks_evaluated,
            created = summary.created,
            extended = summary.extended,
            "commit scanned"
        );
        Ok(summary)
    }
}

fn is_failure(policy: &DetectionPolicy, task: &TaskRun) -> bool {
    policy.is_failure_status(task.status.as_str()) || task.timed_out
}

/// Test ids in report order with duplicates removed.
fn unique(tests: Vec<&str>) -> Vec<String> {
    let mut seen = HashSet::new();
    tests
        .into_iter()
        .filter(|t| seen.insert(*t))
        .map(str::to_string)
        .collect()
}

async fn evaluate_task<S: StreakStore>(
    ctx: Arc<CommitContext<S>>,
    build_idx: usize,
    task_idx: usize,
) -> Result<ScanSummary, StreakError> {
    let _permit = ctx
        .semaphore
        .acquire()
        .await
        .map_err(|e| StreakError::Other(format!("worker pool closed: {e}")))?;

    let task = &ctx.current.builds[build_idx].tasks[task_idx];
    let earlier = ctx.earlier.as_deref();
    let mut summary = ScanSummary {
        tasks_evaluated: 1,
        ..ScanSummary::default()
    };

    if is_failure(&ctx.policy, task) {
        let tests = unique(failing_tests(task));
        let report = ctx.matcher.match_failures(task, &tests, earlier).await?;
        summary.extended += report.extended;
        summary.already_recorded += report.already_recorded;

        if !report.unmatched.is_empty() {
            let detection = {
                let cache = ctx.cache.read().await;
                ctx.detector.detect(&cache, task, &report.unmatched, earlier)
            };
            match detection {
                Detection::Deferred { missing_order } => {
                    tracing::debug!(
                        order = task.order,
                        build_variant = %task.build_variant,
                        task = %task.display_name,
                        missing_order,
                        "confirmation window not cached yet"
                    );
                    summary.deferred += report.unmatched.len();
                }
                Detection::NotConfirmed(rejection) => {
                    tracing::debug!(
                        order = task.order,
                        build_variant = %task.build_variant,
                        task = %task.display_name,
                        ?rejection,
                        "failures not confirmed"
                    );
                    summary.not_confirmed += report.unmatched.len();
                }
                Detection::Evaluated { minted, rejected } => {
                    summary.not_confirmed += rejected.len();
                    for streak in minted {
                        match ctx.store.create_new(&streak).await? {
                            CreateOutcome::Created => {
                                tracing::info!(
                                    order = task.order,
                                    build_variant = %streak.build_variant,
                                    task = %streak.task,
                                    test = %streak.test,
                                    closed = !streak.is_open(),
                                    "new failure streak"
                                );
                                summary.created += 1;
                            }
                            CreateOutcome::Duplicate => summary.duplicates += 1,
                        }
                    }
                }
            }
        }
    }

    if ctx.policy.close_on_pass {
        let commit = task.commit();
        for test in unique(passing_tests(task)) {
            let key = StreakKey::new(
                &ctx.policy.project,
                &task.build_variant,
                &task.display_name,
                &test,
            );
            if ctx.store.try_close(&key, &commit).await? {
                tracing::info!(order = commit.order, streak = %key, "streak closed");
                summary.closed += 1;
            }
        }
    }

    Ok(summary)
}

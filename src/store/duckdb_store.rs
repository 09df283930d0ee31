//! Durable streak store backed by DuckDB.
//!
//! Architecture:
//! - `DuckDbStreakStore` is the public handle, holding an `mpsc::SyncSender<DbCommand>`
//! - `DbWorker` runs on `std::thread::spawn` (DuckDB is sync), owns the connection
//! - Every command runs inside one DuckDB transaction, and the worker handles
//!   one command at a time, so each store call is atomic with respect to all
//!   other callers
//! - Replies travel back over `tokio::sync::oneshot`
//!
//! All code is gated with `#[cfg(feature = "duckdb-store")]` at the module level.

use std::path::{Path, PathBuf};
use std::sync::mpsc;

use duckdb::params;
use tokio::sync::oneshot;

use super::schema::{self, epoch_ms, streak_id};
use super::{CreateOutcome, ExtendOutcome, StreakStore, check_new_streak};
use crate::error::StreakError;
use crate::model::{Commit, FailureStreak, StreakKey};

/// Bounded channel: callers are limited by the scanner's worker pool, so
/// this is never expected to fill.
const COMMAND_CHANNEL_CAPACITY: usize = 128;

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Handle to the DuckDB worker thread.
pub struct DuckDbStreakStore {
    tx: mpsc::SyncSender<DbCommand>,
    worker_handle: Option<std::thread::JoinHandle<()>>,
}

type Reply<T> = oneshot::Sender<Result<T, StreakError>>;

enum DbCommand {
    TryExtend {
        key: StreakKey,
        commit: Commit,
        beginning: Option<Commit>,
        reply: Reply<ExtendOutcome>,
    },
    CreateNew {
        streak: FailureStreak,
        reply: Reply<CreateOutcome>,
    },
    TryClose {
        key: StreakKey,
        commit: Commit,
        reply: Reply<bool>,
    },
    StreaksFor {
        key: StreakKey,
        reply: Reply<Vec<FailureStreak>>,
    },
    List {
        project: String,
        reply: Reply<Vec<FailureStreak>>,
    },
    Shutdown,
}

impl DuckDbStreakStore {
    /// Open (or create) the database at `db_path` and start the worker.
    pub fn open(db_path: PathBuf) -> Result<Self, StreakError> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Self::spawn(Some(db_path))
    }

    /// Non-durable database, for tests and dry runs.
    pub fn in_memory() -> Result<Self, StreakError> {
        Self::spawn(None)
    }

    fn spawn(db_path: Option<PathBuf>) -> Result<Self, StreakError> {
        let (tx, rx) = mpsc::sync_channel(COMMAND_CHANNEL_CAPACITY);
        let (ready_tx, ready_rx) = mpsc::channel();

        let builder = std::thread::Builder::new().name("streaks-duckdb".into());
        let handle = builder.spawn(move || {
            let conn = match open_connection(db_path.as_deref()) {
                Ok(conn) => {
                    let _ = ready_tx.send(Ok(()));
                    conn
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            DbWorker { rx, conn }.run();
        })?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                tx,
                worker_handle: Some(handle),
            }),
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                let _ = handle.join();
                Err(StreakError::StoreUnavailable(
                    "duckdb worker exited during startup".into(),
                ))
            }
        }
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> DbCommand,
    ) -> Result<T, StreakError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .map_err(|e| StreakError::StoreUnavailable(format!("worker dead: {e}")))?;
        reply_rx
            .await
            .map_err(|_| StreakError::StoreUnavailable("worker dropped reply".into()))?
    }
}

impl StreakStore for DuckDbStreakStore {
    async fn try_extend(
        &self,
        key: &StreakKey,
        commit: &Commit,
        beginning: Option<&Commit>,
    ) -> Result<ExtendOutcome, StreakError> {
        self.request(|reply| DbCommand::TryExtend {
            key: key.clone(),
            commit: commit.clone(),
            beginning: beginning.cloned(),
            reply,
        })
        .await
    }

    async fn create_new(&self, streak: &FailureStreak) -> Result<CreateOutcome, StreakError> {
        check_new_streak(streak)?;
        self.request(|reply| DbCommand::CreateNew {
            streak: streak.clone(),
            reply,
        })
        .await
    }

    async fn try_close(&self, key: &StreakKey, commit: &Commit) -> Result<bool, StreakError> {
        self.request(|reply| DbCommand::TryClose {
            key: key.clone(),
            commit: commit.clone(),
            reply,
        })
        .await
    }

    async fn streaks_for(&self, key: &StreakKey) -> Result<Vec<FailureStreak>, StreakError> {
        self.request(|reply| DbCommand::StreaksFor {
            key: key.clone(),
            reply,
        })
        .await
    }

    async fn list(&self, project: &str) -> Result<Vec<FailureStreak>, StreakError> {
        self.request(|reply| DbCommand::List {
            project: project.to_string(),
            reply,
        })
        .await
    }
}

impl Drop for DuckDbStreakStore {
    fn drop(&mut self) {
        let _ = self.tx.send(DbCommand::Shutdown);
        if let Some(handle) = self.worker_handle.take() {
            let _ = handle.join();
        }
    }
}

// ---------------------------------------------------------------------------
// Background worker
// ---------------------------------------------------------------------------

struct DbWorker {
    rx: mpsc::Receiver<DbCommand>,
    conn: duckdb::Connection,
}

fn open_connection(db_path: Option<&Path>) -> Result<duckdb::Connection, StreakError> {
    let conn = match db_path {
        Some(path) => duckdb::Connection::open(path),
        None => duckdb::Connection::open_in_memory(),
    }
    .map_err(|e| StreakError::StoreUnavailable(format!("failed to open DuckDB: {e}")))?;
    schema::apply_migrations(&conn).map_err(|e| StreakError::StoreUnavailable(e.to_string()))?;
    Ok(conn)
}

fn db_err(e: duckdb::Error) -> StreakError {
    StreakError::Store(e.to_string())
}

fn doc_err(e: serde_json::Error) -> StreakError {
    StreakError::Store(format!("bad streak document: {e}"))
}

impl DbWorker {
    fn run(mut self) {
        loop {
            match self.rx.recv() {
                Ok(DbCommand::TryExtend {
                    key,
                    commit,
                    beginning,
                    reply,
                }) => {
                    let _ = reply.send(self.try_extend(&key, &commit, beginning));
                }
                Ok(DbCommand::CreateNew { streak, reply }) => {
                    let _ = reply.send(self.create_new(&streak));
                }
                Ok(DbCommand::TryClose { key, commit, reply }) => {
                    let _ = reply.send(self.try_close(&key, &commit));
                }
                Ok(DbCommand::StreaksFor { key, reply }) => {
                    let _ = reply.send(self.streaks_for(&key));
                }
                Ok(DbCommand::List { project, reply }) => {
                    let _ = reply.send(self.list(&project));
                }
                Ok(DbCommand::Shutdown) => {
                    tracing::debug!("streak store: worker shutting down");
                    break;
                }
                Err(_) => {
                    tracing::debug!("streak store: channel closed, worker exiting");
                    break;
                }
            }
        }
    }

    fn try_extend(
        &mut self,
        key: &StreakKey,
        commit: &Commit,
        beginning: Option<Commit>,
    ) -> Result<ExtendOutcome, StreakError> {
        let tx = self.conn.transaction().map_err(db_err)?;

        if is_claimed(&tx, key, commit.order)? {
            return Ok(ExtendOutcome::AlreadyRecorded);
        }

        let previous = commit.order - 1;
        let Some((id, mut streak)) = find_open_ending_at(&tx, key, previous)? else {
            return Ok(ExtendOutcome::NoMatch);
        };
        if !streak.append(commit.clone()) {
            return Ok(ExtendOutcome::NoMatch);
        }
        if streak.beginning_commit.is_none() {
            streak.beginning_commit = beginning;
        }
        let document = serde_json::to_string(&streak).map_err(doc_err)?;

        let updated = tx
            .execute(
                "UPDATE failure_streaks SET last_order = ?, document = ?, updated_ts = ? \
                 WHERE streak_id = ? AND last_order = ? AND NOT closed",
                params![commit.order, document, epoch_ms(), id, previous],
            )
            .map_err(db_err)?;
        if updated != 1 {
            return Ok(ExtendOutcome::NoMatch);
        }
        claim(&tx, key, commit.order, &id)?;

        tx.commit().map_err(db_err)?;
        Ok(ExtendOutcome::Extended)
    }

    fn create_new(&mut self, streak: &FailureStreak) -> Result<CreateOutcome, StreakError> {
        let key = streak.key();
        let tx = self.conn.transaction().map_err(db_err)?;

        for commit in &streak.failing_versions {
            if is_claimed(&tx, &key, commit.order)? {
                return Ok(CreateOutcome::Duplicate);
            }
        }

        let first_order = streak.first_order().unwrap_or_default();
        let last_order = streak.last_order().unwrap_or_default();
        let id = streak_id(&key, first_order);
        let document = serde_json::to_string(streak).map_err(doc_err)?;

        let inserted = tx
            .execute(
                "INSERT INTO failure_streaks \
                 (streak_id, project, build_variant, task, test, first_order, last_order, \
                  closed, document, updated_ts) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
                 ON CONFLICT (streak_id) DO NOTHING",
                params![
                    id,
                    key.project,
                    key.build_variant,
                    key.task,
                    key.test,
                    first_order,
                    last_order,
                    !streak.is_open(),
                    document,
                    epoch_ms(),
                ],
            )
            .map_err(db_err)?;
        if inserted == 0 {
            return Ok(CreateOutcome::Duplicate);
        }
        for commit in &streak.failing_versions {
            claim(&tx, &key, commit.order, &id)?;
        }

        tx.commit().map_err(db_err)?;
        Ok(CreateOutcome::Created)
    }

    fn try_close(&mut self, key: &StreakKey, commit: &Commit) -> Result<bool, StreakError> {
        let tx = self.conn.transaction().map_err(db_err)?;

        let previous = commit.order - 1;
        let Some((id, mut streak)) = find_open_ending_at(&tx, key, previous)? else {
            return Ok(false);
        };
        streak.ending_commit = Some(commit.clone());
        let document = serde_json::to_string(&streak).map_err(doc_err)?;

        let updated = tx
            .execute(
                "UPDATE failure_streaks SET closed = TRUE, document = ?, updated_ts = ? \
                 WHERE streak_id = ? AND NOT closed",
                params![document, epoch_ms(), id],
            )
            .map_err(db_err)?;

        tx.commit().map_err(db_err)?;
        Ok(updated == 1)
    }

    fn streaks_for(&self, key: &StreakKey) -> Result<Vec<FailureStreak>, StreakError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT document FROM failure_streaks \
                 WHERE project = ? AND build_variant = ? AND task = ? AND test = ? \
                 ORDER BY first_order",
            )
            .map_err(db_err)?;
        let mut rows = stmt
            .query(params![key.project, key.build_variant, key.task, key.test])
            .map_err(db_err)?;
        collect_documents(&mut rows)
    }

    fn list(&self, project: &str) -> Result<Vec<FailureStreak>, StreakError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT document FROM failure_streaks WHERE project = ? \
                 ORDER BY build_variant, task, test, first_order",
            )
            .map_err(db_err)?;
        let mut rows = stmt.query(params![project]).map_err(db_err)?;
        collect_documents(&mut rows)
    }
}

fn is_claimed(
    conn: &duckdb::Connection,
    key: &StreakKey,
    order: i64,
) -> Result<bool, StreakError> {
    let count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM streak_commits \
             WHERE project = ? AND build_variant = ? AND task = ? AND test = ? \
             AND version_order = ?",
            params![key.project, key.build_variant, key.task, key.test, order],
            |row| row.get(0),
        )
        .map_err(db_err)?;
    Ok(count > 0)
}

fn claim(
    conn: &duckdb::Connection,
    key: &StreakKey,
    order: i64,
    id: &str,
) -> Result<(), StreakError> {
    conn.execute(
        "INSERT INTO streak_commits \
         (project, build_variant, task, test, version_order, streak_id) \
         VALUES (?, ?, ?, ?, ?, ?)",
        params![key.project, key.build_variant, key.task, key.test, order, id],
    )
    .map_err(db_err)?;
    Ok(())
}

/// The open streak for `key` whose most recent failing order is `last_order`.
fn find_open_ending_at(
    conn: &duckdb::Connection,
    key: &StreakKey,
    last_order: i64,
) -> Result<Option<(String, FailureStreak)>, StreakError> {
    let mut stmt = conn
        .prepare(
            "SELECT streak_id, document FROM failure_streaks \
             WHERE project = ? AND build_variant = ? AND task = ? AND test = ? \
             AND last_order = ? AND NOT closed \
             ORDER BY first_order DESC LIMIT 1",
        )
        .map_err(db_err)?;
    let mut rows = stmt
        .query(params![
            key.project,
            key.build_variant,
            key.task,
            key.test,
            last_order
        ])
        .map_err(db_err)?;
    let Some(row) = rows.next().map_err(db_err)? else {
        return Ok(None);
    };
    let id: String = row.get(0).map_err(db_err)?;
    let document: String = row.get(1).map_err(db_err)?;
    let streak = serde_json::from_str(&document).map_err(doc_err)?;
    Ok(Some((id, streak)))
}

fn collect_documents(rows: &mut duckdb::Rows<'_>) -> Result<Vec<FailureStreak>, StreakError> {
    let mut streaks = Vec::new();
    while let Some(row) = rows.next().map_err(db_err)? {
        let document: String = row.get(0).map_err(db_err)?;
        streaks.push(serde_json::from_str(&document).map_err(doc_err)?);
    }
    Ok(streaks)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn temp_dir(name: &str) -> PathBuf {
        let ts = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let dir = std::env::temp_dir()
            .join("failure-streaks-duckdb-test")
            .join(format!("{name}_{}_{ts}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn key() -> StreakKey {
        StreakKey::new("proj", "linux", "jsCore", "a.js")
    }

    fn streak(orders: &[i64]) -> FailureStreak {
        FailureStreak::new(
            &key(),
            orders.iter().map(|o| Commit::new(format!("v{o}"), *o)).collect(),
        )
    }

    #[tokio::test]
    async fn create_then_extend() {
        let store = DuckDbStreakStore::in_memory().unwrap();
        let mut minted = streak(&[100, 101, 102]);
        minted.beginning_commit = Some(Commit::new("v99", 99));
        assert_eq!(store.create_new(&minted).await.unwrap(), CreateOutcome::Created);

        let outcome = store
            .try_extend(&key(), &Commit::new("v103", 103), None)
            .await
            .unwrap();
        assert_eq!(outcome, ExtendOutcome::Extended);

        let stored = store.streaks_for(&key()).await.unwrap();
        assert_eq!(stored.len(), 1);
        let orders: Vec<i64> = stored[0].failing_versions.iter().map(|c| c.order).collect();
        assert_eq!(orders, vec![100, 101, 102, 103]);
        assert_eq!(stored[0].beginning_commit, Some(Commit::new("v99", 99)));
        assert_eq!(stored[0].ending_commit, None);
    }

    #[tokio::test]
    async fn recorded_orders_are_not_reclaimed() {
        let store = DuckDbStreakStore::in_memory().unwrap();
        store.create_new(&streak(&[100, 101, 102])).await.unwrap();

        assert_eq!(
            store
                .try_extend(&key(), &Commit::new("v101", 101), None)
                .await
                .unwrap(),
            ExtendOutcome::AlreadyRecorded
        );
        assert_eq!(
            store.create_new(&streak(&[100, 101, 102])).await.unwrap(),
            CreateOutcome::Duplicate
        );
        assert_eq!(
            store.create_new(&streak(&[102, 103, 104])).await.unwrap(),
            CreateOutcome::Duplicate
        );
        assert_eq!(store.list("proj").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn closed_streak_is_final() {
        let store = DuckDbStreakStore::in_memory().unwrap();
        store.create_new(&streak(&[100, 101, 102])).await.unwrap();

        assert!(store.try_close(&key(), &Commit::new("v103", 103)).await.unwrap());
        assert!(!store.try_close(&key(), &Commit::new("v103", 103)).await.unwrap());
        assert_eq!(
            store
                .try_extend(&key(), &Commit::new("v103", 103), None)
                .await
                .unwrap(),
            ExtendOutcome::NoMatch
        );

        let stored = store.streaks_for(&key()).await.unwrap();
        assert_eq!(stored[0].ending_commit, Some(Commit::new("v103", 103)));
    }

    #[tokio::test]
    async fn minted_with_ending_is_not_extended() {
        let store = DuckDbStreakStore::in_memory().unwrap();
        let mut minted = streak(&[100, 101, 102]);
        minted.ending_commit = Some(Commit::new("v103", 103));
        store.create_new(&minted).await.unwrap();
        assert_eq!(
            store
                .try_extend(&key(), &Commit::new("v103", 103), None)
                .await
                .unwrap(),
            ExtendOutcome::NoMatch
        );
    }

    #[tokio::test]
    async fn stored_documents_are_sparse() {
        let dir = temp_dir("sparse");
        let db_path = dir.join("streaks.duckdb");
        {
            let store = DuckDbStreakStore::open(db_path.clone()).unwrap();
            store.create_new(&streak(&[100, 101, 102])).await.unwrap();
        }

        let conn = duckdb::Connection::open(&db_path).unwrap();
        let document: String = conn
            .query_row("SELECT document FROM failure_streaks", [], |row| row.get(0))
            .unwrap();
        assert!(!document.contains("null"));
        assert!(!document.contains("ending_commit"));
        drop(conn);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn state_survives_reopen() {
        let dir = temp_dir("reopen");
        let db_path = dir.join("nested").join("streaks.duckdb");
        {
            let store = DuckDbStreakStore::open(db_path.clone()).unwrap();
            store.create_new(&streak(&[100, 101, 102])).await.unwrap();
        }
        {
            let store = DuckDbStreakStore::open(db_path.clone()).unwrap();
            assert_eq!(
                store
                    .try_extend(&key(), &Commit::new("v103", 103), None)
                    .await
                    .unwrap(),
                ExtendOutcome::Extended
            );
        }
        let store = DuckDbStreakStore::open(db_path).unwrap();
        let stored = store.streaks_for(&key()).await.unwrap();
        assert_eq!(stored[0].failing_versions.len(), 4);
        drop(store);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn concurrent_extends_append_once() {
        let store = Arc::new(DuckDbStreakStore::in_memory().unwrap());
        store.create_new(&streak(&[100, 101, 102])).await.unwrap();

        let mut set = tokio::task::JoinSet::new();
        for _ in 0..6 {
            let store = store.clone();
            set.spawn(async move {
                store
                    .try_extend(&key(), &Commit::new("v103", 103), None)
                    .await
                    .unwrap()
            });
        }
        let mut outcomes = Vec::new();
        while let Some(outcome) = set.join_next().await {
            outcomes.push(outcome.unwrap());
        }
        assert_eq!(
            outcomes
                .iter()
                .filter(|o| **o == ExtendOutcome::Extended)
                .count(),
            1
        );
        assert!(
            outcomes
                .iter()
                .all(|o| matches!(o, ExtendOutcome::Extended | ExtendOutcome::AlreadyRecorded))
        );
    }
}

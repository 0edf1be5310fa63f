//! 작업 큐 (durable)
//!
//! The `tasks` table is the only record of in-progress work. Every transition
//! is a single guarded UPDATE, so a crash at any point leaves each task in
//! exactly one state and the next `claim` picks up from there.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use tracing::{debug, info, warn};

use crate::domain::errors::{PipelineError, PipelineResult};
use crate::domain::task::{NewTask, QueueStats, Task, TaskId, TaskKind, TaskState};
use crate::infrastructure::codec::{from_millis, now, to_millis};
use crate::infrastructure::config::QueueConfig;
use crate::infrastructure::database_connection::DatabaseConnection;
use crate::infrastructure::retry_manager::{RetryDecision, RetryPolicy};

const TASK_COLUMNS: &str = "id, kind, cursor, parent_id, state, attempts, last_error, \
     not_before, claimed_at, created_at, updated_at, payload";

#[derive(Clone)]
pub struct WorkQueue {
    db: DatabaseConnection,
    policy: RetryPolicy,
    liveness_timeout: chrono::Duration,
}

impl WorkQueue {
    pub fn new(db: DatabaseConnection, config: &QueueConfig) -> Self {
        Self {
            db,
            policy: RetryPolicy::from_config(config),
            liveness_timeout: config.liveness_timeout(),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// 작업 추가
    pub async fn enqueue(&self, task: &NewTask) -> PipelineResult<TaskId> {
        let mut tx = self.db.begin_write().await?;
        let id = enqueue_in(tx.conn(), task, now()).await?;
        tx.commit().await?;
        Ok(id)
    }

    pub async fn claim(&self, kind: TaskKind) -> PipelineResult<Option<Task>> {
        self.claim_at(kind, now()).await
    }

    /// Claim the oldest eligible task of `kind` as of `at`
    ///
    /// In-flight tasks whose claim is older than the liveness timeout are first
    /// returned to `pending`. Aggregate tasks are handed out one at a time.
    pub async fn claim_at(&self, kind: TaskKind, at: DateTime<Utc>) -> PipelineResult<Option<Task>> {
        let mut tx = self.db.begin_write().await?;
        let reaped = reap_abandoned_in(tx.conn(), at - self.liveness_timeout, at).await?;
        if reaped > 0 {
            warn!("Re-queued {} abandoned in-flight task(s)", reaped);
        }
        let task = claim_in(tx.conn(), kind, at).await?;
        tx.commit().await?;

        if let Some(task) = &task {
            debug!(task_id = task.id, kind = %task.kind, cursor = %task.cursor, "Claimed task");
        }
        Ok(task)
    }

    pub async fn commit(&self, task_id: TaskId) -> PipelineResult<()> {
        let mut tx = self.db.begin_write().await?;
        commit_in(tx.conn(), task_id, now()).await?;
        tx.commit().await
    }

    /// Record a failure and either schedule a retry or mark the task failed for good
    pub async fn fail(&self, task_id: TaskId, error: &str) -> PipelineResult<TaskState> {
        self.fail_at(task_id, error, now()).await
    }

    pub async fn fail_at(&self, task_id: TaskId, error: &str, at: DateTime<Utc>) -> PipelineResult<TaskState> {
        let mut tx = self.db.begin_write().await?;
        let state = fail_in(tx.conn(), &self.policy, task_id, error, at).await?;
        tx.commit().await?;
        Ok(state)
    }

    pub async fn get(&self, task_id: TaskId) -> PipelineResult<Option<Task>> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?");
        let row = sqlx::query(&sql).bind(task_id).fetch_optional(self.db.pool()).await?;
        row.as_ref().map(task_from_row).transpose()
    }

    pub async fn list(&self, kind: TaskKind, state: TaskState) -> PipelineResult<Vec<Task>> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE kind = ? AND state = ? ORDER BY id");
        let rows = sqlx::query(&sql)
            .bind(kind.as_str())
            .bind(state.as_str())
            .fetch_all(self.db.pool())
            .await?;
        rows.iter().map(task_from_row).collect()
    }

    /// Pending or in-flight work of `kind` exists
    pub async fn has_outstanding(&self, kind: TaskKind) -> PipelineResult<bool> {
        let mut conn = self.db.pool().acquire().await?;
        has_outstanding_in(&mut conn, kind).await
    }

    /// 작업 큐 통계
    pub async fn stats(&self) -> PipelineResult<QueueStats> {
        let rows = sqlx::query("SELECT state, COUNT(*) AS n FROM tasks GROUP BY state")
            .fetch_all(self.db.pool())
            .await?;

        let mut stats = QueueStats::default();
        for row in rows {
            let state: String = row.try_get("state")?;
            let n: i64 = row.try_get("n")?;
            let n = n as u64;
            match TaskState::parse(&state)? {
                TaskState::Pending => stats.pending = n,
                TaskState::InFlight => stats.in_flight = n,
                TaskState::Done => stats.done = n,
                TaskState::Failed => stats.failed = n,
            }
        }
        Ok(stats)
    }

    /// Delete finished tasks last touched before `older_than` that no snapshot cites
    pub async fn purge_finished(&self, older_than: DateTime<Utc>) -> PipelineResult<u64> {
        let mut tx = self.db.begin_write().await?;
        let result = sqlx::query(
            "DELETE FROM tasks
             WHERE state IN ('done', 'failed')
               AND updated_at < ?
               AND id NOT IN (SELECT last_task_id FROM snapshots WHERE last_task_id IS NOT NULL)",
        )
        .bind(to_millis(older_than))
        .execute(tx.conn())
        .await?;
        tx.commit().await?;

        let purged = result.rows_affected();
        if purged > 0 {
            info!("Purged {} finished task(s)", purged);
        }
        Ok(purged)
    }
}

/// Insert a task; an aggregate task requires its parent scrape task to be done already
pub async fn enqueue_in(conn: &mut SqliteConnection, task: &NewTask, at: DateTime<Utc>) -> PipelineResult<TaskId> {
    if task.kind == TaskKind::AggregateBatch {
        let parent = task.parent_id.ok_or_else(|| {
            PipelineError::InvalidTransition("aggregate task without a parent scrape task".to_string())
        })?;
        let parent_state: Option<String> = sqlx::query_scalar("SELECT state FROM tasks WHERE id = ?")
            .bind(parent)
            .fetch_optional(&mut *conn)
            .await?;
        if parent_state.as_deref() != Some(TaskState::Done.as_str()) {
            return Err(PipelineError::InvalidTransition(format!(
                "parent task {parent} is not done"
            )));
        }
    }

    let millis = to_millis(at);
    let result = sqlx::query(
        "INSERT INTO tasks (kind, cursor, parent_id, state, attempts, not_before, created_at, updated_at, payload)
         VALUES (?, ?, ?, 'pending', 0, ?, ?, ?, ?)",
    )
    .bind(task.kind.as_str())
    .bind(&task.cursor)
    .bind(task.parent_id)
    .bind(millis)
    .bind(millis)
    .bind(millis)
    .bind(task.payload.as_deref())
    .execute(&mut *conn)
    .await?;

    let id = result.last_insert_rowid();
    debug!(task_id = id, kind = %task.kind, cursor = %task.cursor, "Enqueued task");
    Ok(id)
}

pub async fn has_outstanding_in(conn: &mut SqliteConnection, kind: TaskKind) -> PipelineResult<bool> {
    let found: Option<i64> =
        sqlx::query_scalar("SELECT 1 FROM tasks WHERE kind = ? AND state IN ('pending', 'in_flight') LIMIT 1")
            .bind(kind.as_str())
            .fetch_optional(&mut *conn)
            .await?;
    Ok(found.is_some())
}

/// Return in-flight tasks claimed before `claimed_before` to `pending`
///
/// An abandoned claim is not counted as an attempt.
pub async fn reap_abandoned_in(
    conn: &mut SqliteConnection,
    claimed_before: DateTime<Utc>,
    at: DateTime<Utc>,
) -> PipelineResult<u64> {
    let result = sqlx::query(
        "UPDATE tasks SET state = 'pending', claimed_at = NULL, updated_at = ?
         WHERE state = 'in_flight' AND claimed_at < ?",
    )
    .bind(to_millis(at))
    .bind(to_millis(claimed_before))
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected())
}

/// Atomically move the oldest eligible pending task of `kind` to `in_flight`
pub async fn claim_in(conn: &mut SqliteConnection, kind: TaskKind, at: DateTime<Utc>) -> PipelineResult<Option<Task>> {
    let millis = to_millis(at);
    let sql = format!(
        "UPDATE tasks SET state = 'in_flight', claimed_at = ?, updated_at = ?
         WHERE id = (
             SELECT id FROM tasks
             WHERE kind = ? AND state = 'pending' AND not_before <= ?
             ORDER BY id LIMIT 1
         )
         AND (? = 'scrape_page'
              OR NOT EXISTS (SELECT 1 FROM tasks WHERE kind = 'aggregate_batch' AND state = 'in_flight'))
         RETURNING {TASK_COLUMNS}"
    );
    let row = sqlx::query(&sql)
        .bind(millis)
        .bind(millis)
        .bind(kind.as_str())
        .bind(millis)
        .bind(kind.as_str())
        .fetch_optional(&mut *conn)
        .await?;
    row.as_ref().map(task_from_row).transpose()
}

/// `in_flight -> done`; the payload is no longer needed once the task is done
pub async fn commit_in(conn: &mut SqliteConnection, task_id: TaskId, at: DateTime<Utc>) -> PipelineResult<()> {
    let result = sqlx::query(
        "UPDATE tasks SET state = 'done', payload = NULL, last_error = NULL, updated_at = ?
         WHERE id = ? AND state = 'in_flight'",
    )
    .bind(to_millis(at))
    .bind(task_id)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(PipelineError::InvalidTransition(format!(
            "task {task_id} is not in flight"
        )));
    }
    Ok(())
}

pub async fn fail_in(
    conn: &mut SqliteConnection,
    policy: &RetryPolicy,
    task_id: TaskId,
    error: &str,
    at: DateTime<Utc>,
) -> PipelineResult<TaskState> {
    let attempts: Option<i64> = sqlx::query_scalar("SELECT attempts FROM tasks WHERE id = ? AND state = 'in_flight'")
        .bind(task_id)
        .fetch_optional(&mut *conn)
        .await?;
    let attempts = attempts.ok_or_else(|| {
        PipelineError::InvalidTransition(format!("task {task_id} is not in flight"))
    })? as u32
        + 1;

    let (state, not_before) = match policy.decide(attempts) {
        RetryDecision::RetryAfter(delay) => {
            let delay = chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::days(365));
            (TaskState::Pending, at.checked_add_signed(delay).unwrap_or(at))
        }
        RetryDecision::GiveUp => (TaskState::Failed, at),
    };

    sqlx::query(
        "UPDATE tasks SET state = ?, attempts = ?, last_error = ?, not_before = ?, claimed_at = NULL, updated_at = ?
         WHERE id = ?",
    )
    .bind(state.as_str())
    .bind(i64::from(attempts))
    .bind(error)
    .bind(to_millis(not_before))
    .bind(to_millis(at))
    .bind(task_id)
    .execute(&mut *conn)
    .await?;

    match state {
        TaskState::Failed => warn!(task_id, attempts, error, "Task permanently failed"),
        _ => info!(task_id, attempts, error, retry_at = %not_before, "Task failed, retry scheduled"),
    }
    Ok(state)
}

fn task_from_row(row: &SqliteRow) -> PipelineResult<Task> {
    let kind: String = row.try_get("kind")?;
    let state: String = row.try_get("state")?;
    let attempts: i64 = row.try_get("attempts")?;
    let claimed_at: Option<i64> = row.try_get("claimed_at")?;

    Ok(Task {
        id: row.try_get("id")?,
        kind: TaskKind::parse(&kind)?,
        cursor: row.try_get("cursor")?,
        parent_id: row.try_get("parent_id")?,
        state: TaskState::parse(&state)?,
        attempts: attempts as u32,
        last_error: row.try_get("last_error")?,
        not_before: from_millis(row.try_get("not_before")?)?,
        claimed_at: claimed_at.map(from_millis).transpose()?,
        created_at: from_millis(row.try_get("created_at")?)?,
        updated_at: from_millis(row.try_get("updated_at")?)?,
        payload: row.try_get("payload")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn queue_with(config: QueueConfig) -> (TempDir, WorkQueue) {
        let dir = tempfile::tempdir().unwrap();
        let db = DatabaseConnection::open(&dir.path().join("queue.db")).await.unwrap();
        (dir, WorkQueue::new(db, &config))
    }

    async fn queue() -> (TempDir, WorkQueue) {
        queue_with(QueueConfig::default()).await
    }

    #[tokio::test]
    async fn claims_are_fifo_within_a_kind() {
        let (_dir, queue) = queue().await;
        let first = queue.enqueue(&NewTask::scrape_page("0")).await.unwrap();
        let second = queue.enqueue(&NewTask::scrape_page("50")).await.unwrap();

        assert!(queue.claim(TaskKind::AggregateBatch).await.unwrap().is_none());
        let a = queue.claim(TaskKind::ScrapePage).await.unwrap().unwrap();
        let b = queue.claim(TaskKind::ScrapePage).await.unwrap().unwrap();
        assert_eq!((a.id, b.id), (first, second));
        assert_eq!(a.state, TaskState::InFlight);
        assert!(a.claimed_at.is_some());
        assert!(queue.claim(TaskKind::ScrapePage).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn concurrent_claimants_never_share_a_task() {
        let (_dir, queue) = queue().await;
        for i in 0..20 {
            queue.enqueue(&NewTask::scrape_page(i.to_string())).await.unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..8 {
            let queue = queue.clone();
            handles.push(tokio::spawn(async move {
                let mut mine = Vec::new();
                while let Some(task) = queue.claim(TaskKind::ScrapePage).await.unwrap() {
                    mine.push(task.id);
                }
                mine
            }));
        }

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }
        all.sort_unstable();
        let before = all.len();
        all.dedup();
        assert_eq!(before, 20);
        assert_eq!(all.len(), 20);
    }

    #[tokio::test]
    async fn commit_requires_in_flight() {
        let (_dir, queue) = queue().await;
        let id = queue.enqueue(&NewTask::scrape_page("0")).await.unwrap();
        assert!(matches!(queue.commit(id).await, Err(PipelineError::InvalidTransition(_))));

        queue.claim(TaskKind::ScrapePage).await.unwrap().unwrap();
        queue.commit(id).await.unwrap();
        assert_eq!(queue.get(id).await.unwrap().unwrap().state, TaskState::Done);
        assert!(queue.commit(id).await.is_err());
    }

    #[tokio::test]
    async fn failure_backs_off_then_gives_up() {
        let (_dir, queue) = queue_with(QueueConfig {
            max_attempts: 3,
            ..QueueConfig::default()
        })
        .await;
        let id = queue.enqueue(&NewTask::scrape_page("0")).await.unwrap();
        let start = now();

        let task = queue.claim_at(TaskKind::ScrapePage, start).await.unwrap().unwrap();
        assert_eq!(queue.fail_at(task.id, "503", start).await.unwrap(), TaskState::Pending);
        let stored = queue.get(id).await.unwrap().unwrap();
        assert_eq!(stored.attempts, 1);
        assert_eq!(stored.not_before, start + chrono::Duration::seconds(60));
        assert_eq!(stored.last_error.as_deref(), Some("503"));

        // Not eligible until the backoff expires
        assert!(queue.claim_at(TaskKind::ScrapePage, start).await.unwrap().is_none());

        let later = start + chrono::Duration::seconds(61);
        queue.claim_at(TaskKind::ScrapePage, later).await.unwrap().unwrap();
        assert_eq!(queue.fail_at(id, "503", later).await.unwrap(), TaskState::Pending);

        let much_later = later + chrono::Duration::hours(1);
        queue.claim_at(TaskKind::ScrapePage, much_later).await.unwrap().unwrap();
        assert_eq!(queue.fail_at(id, "503", much_later).await.unwrap(), TaskState::Failed);

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.failed, 1);
        assert!(queue.claim_at(TaskKind::ScrapePage, much_later + chrono::Duration::days(1)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn abandoned_claims_are_requeued_after_liveness_timeout() {
        let (_dir, queue) = queue().await;
        let id = queue.enqueue(&NewTask::scrape_page("0")).await.unwrap();
        let start = now();
        queue.claim_at(TaskKind::ScrapePage, start).await.unwrap().unwrap();

        // Still within the liveness window: nothing to hand out
        let soon = start + chrono::Duration::seconds(30);
        assert!(queue.claim_at(TaskKind::ScrapePage, soon).await.unwrap().is_none());

        let later = start + chrono::Duration::seconds(601);
        let again = queue.claim_at(TaskKind::ScrapePage, later).await.unwrap().unwrap();
        assert_eq!(again.id, id);
        assert_eq!(again.attempts, 0);
    }

    #[tokio::test]
    async fn aggregate_tasks_need_a_done_parent_and_run_one_at_a_time() {
        let (_dir, queue) = queue().await;
        let parent = queue.enqueue(&NewTask::scrape_page("0")).await.unwrap();
        let orphan = queue.enqueue(&NewTask::aggregate_batch(parent, "0", vec![])).await;
        assert!(matches!(orphan, Err(PipelineError::InvalidTransition(_))));

        queue.claim(TaskKind::ScrapePage).await.unwrap().unwrap();
        queue.commit(parent).await.unwrap();
        let a = queue.enqueue(&NewTask::aggregate_batch(parent, "0", vec![1])).await.unwrap();
        let b = queue.enqueue(&NewTask::aggregate_batch(parent, "1", vec![2])).await.unwrap();

        let first = queue.claim(TaskKind::AggregateBatch).await.unwrap().unwrap();
        assert_eq!(first.id, a);
        assert_eq!(first.payload.as_deref(), Some(&[1u8][..]));
        assert!(queue.claim(TaskKind::AggregateBatch).await.unwrap().is_none());

        queue.commit(a).await.unwrap();
        assert_eq!(queue.get(a).await.unwrap().unwrap().payload, None);
        assert_eq!(queue.claim(TaskKind::AggregateBatch).await.unwrap().unwrap().id, b);
    }

    #[tokio::test]
    async fn purge_removes_only_old_finished_tasks() {
        let (_dir, queue) = queue().await;
        let done = queue.enqueue(&NewTask::scrape_page("0")).await.unwrap();
        let pending = queue.enqueue(&NewTask::scrape_page("1")).await.unwrap();
        queue.claim(TaskKind::ScrapePage).await.unwrap().unwrap();
        queue.commit(done).await.unwrap();

        assert_eq!(queue.purge_finished(now() - chrono::Duration::days(1)).await.unwrap(), 0);
        assert_eq!(queue.purge_finished(now() + chrono::Duration::seconds(1)).await.unwrap(), 1);
        assert!(queue.get(done).await.unwrap().is_none());
        assert!(queue.get(pending).await.unwrap().is_some());
        assert!(queue.has_outstanding(TaskKind::ScrapePage).await.unwrap());
    }
}

// Database connection and pool management
// SQLite through sqlx: WAL journal, one writer at a time, many readers

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Sqlite, SqliteConnection, SqlitePool, Transaction};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info};

use crate::domain::errors::PipelineResult;

const SCHEMA_SQL: &str = r"
CREATE TABLE IF NOT EXISTS tasks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    kind TEXT NOT NULL,
    cursor TEXT NOT NULL,
    parent_id INTEGER REFERENCES tasks (id) ON DELETE SET NULL,
    state TEXT NOT NULL DEFAULT 'pending',
    attempts INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    not_before INTEGER NOT NULL,
    claimed_at INTEGER,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    payload BLOB
);

CREATE TABLE IF NOT EXISTS listings (
    id TEXT PRIMARY KEY,
    make TEXT NOT NULL,
    model TEXT NOT NULL,
    year INTEGER,
    price INTEGER,
    mileage INTEGER,
    status TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    first_seen INTEGER NOT NULL,
    last_seen INTEGER NOT NULL,
    body BLOB NOT NULL,
    CHECK (last_seen >= first_seen)
);

CREATE TABLE IF NOT EXISTS snapshots (
    metric TEXT NOT NULL,
    dimension TEXT NOT NULL,
    time_window TEXT NOT NULL,
    count INTEGER NOT NULL,
    sum INTEGER NOT NULL,
    sum_squares REAL NOT NULL,
    min_value INTEGER,
    max_value INTEGER,
    version INTEGER NOT NULL,
    last_task_id INTEGER REFERENCES tasks (id),
    updated_at INTEGER NOT NULL,
    checksum TEXT NOT NULL,
    PRIMARY KEY (metric, dimension, time_window)
);

CREATE TABLE IF NOT EXISTS contributions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    listing_id TEXT NOT NULL,
    task_id INTEGER NOT NULL,
    make TEXT NOT NULL,
    model TEXT NOT NULL,
    time_window TEXT NOT NULL,
    price INTEGER,
    mileage INTEGER,
    recorded_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS pipeline_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_tasks_claim ON tasks (kind, state, not_before, id);
CREATE INDEX IF NOT EXISTS idx_tasks_state_updated ON tasks (state, updated_at);
CREATE INDEX IF NOT EXISTS idx_listings_make_model_year ON listings (make, model, year);
CREATE INDEX IF NOT EXISTS idx_listings_last_seen ON listings (last_seen);
CREATE INDEX IF NOT EXISTS idx_snapshots_dimension ON snapshots (dimension, time_window);
CREATE INDEX IF NOT EXISTS idx_snapshots_window ON snapshots (time_window);
CREATE INDEX IF NOT EXISTS idx_contributions_dimension ON contributions (make, model, time_window);
CREATE INDEX IF NOT EXISTS idx_contributions_listing ON contributions (listing_id);
";

/// Write transaction holding the process-wide writer slot until it ends
pub struct WriteTransaction {
    tx: Transaction<'static, Sqlite>,
    _writer: OwnedMutexGuard<()>,
}

impl WriteTransaction {
    pub fn conn(&mut self) -> &mut SqliteConnection {
        &mut *self.tx
    }

    pub async fn commit(self) -> PipelineResult<()> {
        self.tx.commit().await?;
        Ok(())
    }
}

#[derive(Clone)]
pub struct DatabaseConnection {
    pool: SqlitePool,
    writer: Arc<Mutex<()>>,
    path: PathBuf,
}

impl DatabaseConnection {
    /// Open (creating if needed) the database file and apply the schema
    pub async fn open(path: &Path) -> PipelineResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        let db = Self {
            pool,
            writer: Arc::new(Mutex::new(())),
            path: path.to_path_buf(),
        };
        db.migrate().await?;
        info!("Opened listing database at {}", path.display());
        Ok(db)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Idempotent schema creation
    pub async fn migrate(&self) -> PipelineResult<()> {
        sqlx::raw_sql(SCHEMA_SQL).execute(&self.pool).await?;
        debug!("Schema ensured");
        Ok(())
    }

    /// Begin a transaction once no other writer in this process holds one
    pub async fn begin_write(&self) -> PipelineResult<WriteTransaction> {
        let writer = Arc::clone(&self.writer).lock_owned().await;
        let tx = self.pool.begin().await?;
        Ok(WriteTransaction { tx, _writer: writer })
    }

    /// Size of the main database file plus its WAL
    pub async fn file_size_bytes(&self) -> u64 {
        let mut total = 0;
        let wal = PathBuf::from(format!("{}-wal", self.path.display()));
        for file in [self.path.clone(), wal] {
            if let Ok(meta) = tokio::fs::metadata(&file).await {
                total += meta.len();
            }
        }
        total
    }

    pub async fn vacuum(&self) -> PipelineResult<()> {
        let _writer = self.writer.lock().await;
        sqlx::query("VACUUM").execute(&self.pool).await?;
        sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_open_creates_file_and_tables() -> PipelineResult<()> {
        let temp_dir = tempdir()?;
        let db_path = temp_dir.path().join("nested").join("pipeline.db");

        let db = DatabaseConnection::open(&db_path).await?;
        assert!(!db.pool().is_closed());
        assert!(db_path.exists());

        for table in ["listings", "snapshots", "contributions", "tasks", "pipeline_meta"] {
            let found = sqlx::query("SELECT name FROM sqlite_master WHERE type='table' AND name = ?")
                .bind(table)
                .fetch_optional(db.pool())
                .await?;
            assert!(found.is_some(), "missing table {table}");
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_migrate_is_idempotent() -> PipelineResult<()> {
        let temp_dir = tempdir()?;
        let db = DatabaseConnection::open(&temp_dir.path().join("pipeline.db")).await?;
        db.migrate().await?;
        db.migrate().await?;
        assert!(db.file_size_bytes().await > 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_uncommitted_write_rolls_back() -> PipelineResult<()> {
        let temp_dir = tempdir()?;
        let db = DatabaseConnection::open(&temp_dir.path().join("pipeline.db")).await?;
        {
            let mut tx = db.begin_write().await?;
            sqlx::query("INSERT INTO pipeline_meta (key, value) VALUES ('k', 'v')")
                .execute(tx.conn())
                .await?;
        }
        let row = sqlx::query("SELECT value FROM pipeline_meta WHERE key = 'k'")
            .fetch_optional(db.pool())
            .await?;
        assert!(row.is_none());
        Ok(())
    }
}

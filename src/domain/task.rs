//! 작업 큐 항목 정의
//!
//! A task is one durable unit of scrape or aggregation work. Its state column is
//! the only record of progress, so a restarted process resumes exactly where
//! the previous one stopped.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::errors::PipelineError;

pub type TaskId = i64;

/// 작업 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Fetch one bounded batch starting at `cursor`
    ScrapePage,
    /// Fold the changed listings committed by a scrape task into snapshots
    AggregateBatch,
}

impl TaskKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ScrapePage => "scrape_page",
            Self::AggregateBatch => "aggregate_batch",
        }
    }

    pub fn parse(value: &str) -> Result<Self, PipelineError> {
        match value {
            "scrape_page" => Ok(Self::ScrapePage),
            "aggregate_batch" => Ok(Self::AggregateBatch),
            other => Err(PipelineError::Serialization(format!("unknown task kind '{other}'"))),
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 작업 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    InFlight,
    Done,
    /// Terminal: attempts reached the ceiling
    Failed,
}

impl TaskState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InFlight => "in_flight",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Result<Self, PipelineError> {
        match value {
            "pending" => Ok(Self::Pending),
            "in_flight" => Ok(Self::InFlight),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            other => Err(PipelineError::Serialization(format!("unknown task state '{other}'"))),
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

/// 작업 항목 (작업 + 메타데이터)
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub id: TaskId,
    pub kind: TaskKind,
    /// Page token for scrape tasks, batch label for aggregate tasks
    pub cursor: String,
    /// Scrape task whose commit produced this aggregate task
    pub parent_id: Option<TaskId>,
    pub state: TaskState,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub not_before: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Compressed payload; cleared once the task is done
    pub payload: Option<Vec<u8>>,
}

/// 큐에 넣을 새 작업
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTask {
    pub kind: TaskKind,
    pub cursor: String,
    pub parent_id: Option<TaskId>,
    pub payload: Option<Vec<u8>>,
}

impl NewTask {
    pub fn scrape_page(cursor: impl Into<String>) -> Self {
        Self {
            kind: TaskKind::ScrapePage,
            cursor: cursor.into(),
            parent_id: None,
            payload: None,
        }
    }

    pub fn aggregate_batch(parent: TaskId, cursor: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            kind: TaskKind::AggregateBatch,
            cursor: cursor.into(),
            parent_id: Some(parent),
            payload: Some(payload),
        }
    }
}

/// 작업 큐 통계
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: u64,
    pub in_flight: u64,
    pub done: u64,
    pub failed: u64,
}

impl QueueStats {
    pub fn total(&self) -> u64 {
        self.pending + self.in_flight + self.done + self.failed
    }

    pub fn has_outstanding_work(&self) -> bool {
        self.pending + self.in_flight > 0
    }
}

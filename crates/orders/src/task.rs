//! Production tasks generated when an order is confirmed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use atelier_core::UserId;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskKind {
    Design,
    ScreenPreparation,
    Printing,
    Drying,
    QualityCheck,
    Packaging,
}

impl TaskKind {
    pub fn default_name(self) -> &'static str {
        match self {
            TaskKind::Design => "Artwork design",
            TaskKind::ScreenPreparation => "Screen preparation",
            TaskKind::Printing => "Screen printing",
            TaskKind::Drying => "Drying",
            TaskKind::QualityCheck => "Quality check",
            TaskKind::Packaging => "Packaging",
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Cancelled,
}

impl TaskStatus {
    /// Forward-only moves a worker may request. Cancellation is reserved to the order.
    pub fn can_move_to(self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (TaskStatus::Pending, TaskStatus::InProgress)
                | (TaskStatus::Pending, TaskStatus::Completed)
                | (TaskStatus::InProgress, TaskStatus::Completed)
        )
    }

    pub fn is_open(self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::InProgress)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductionTask {
    /// 1-based position within the order.
    pub task_no: u32,
    pub kind: TaskKind,
    pub name: String,
    pub status: TaskStatus,
    /// Staff member responsible for the task.
    #[serde(default)]
    pub assigned_to: Option<UserId>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ProductionTask {
    pub fn new(task_no: u32, kind: TaskKind) -> Self {
        Self {
            task_no,
            kind,
            name: kind.default_name().to_string(),
            status: TaskStatus::Pending,
            assigned_to: None,
            started_at: None,
            completed_at: None,
        }
    }

    /// Apply a status change at `at`, stamping start/completion times.
    pub fn set_status(&mut self, status: TaskStatus, at: DateTime<Utc>) {
        if status == TaskStatus::InProgress && self.started_at.is_none() {
            self.started_at = Some(at);
        }
        if status == TaskStatus::Completed {
            self.started_at.get_or_insert(at);
            self.completed_at = Some(at);
        }
        self.status = status;
    }
}

/// The six default tasks of a screen-printing job, all PENDING.
pub fn default_task_set() -> Vec<ProductionTask> {
    [
        TaskKind::Design,
        TaskKind::ScreenPreparation,
        TaskKind::Printing,
        TaskKind::Drying,
        TaskKind::QualityCheck,
        TaskKind::Packaging,
    ]
    .into_iter()
    .zip(1..)
    .map(|(kind, task_no)| ProductionTask::new(task_no, kind))
    .collect()
}

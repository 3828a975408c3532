//! User tasks and their lifecycle.
//!
//! ```text
//! pending ──► routed ──► done
//!    │           │
//!    └───────────┴─────► failed
//! ```
//!
//! `done` and `failed` are terminal. A failed task is never resurrected;
//! [`Task::retry`] creates a new task that names the old one as its cause.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{HarnessError, Result};

/// The tag that marks a task as gap-filling research.
pub const GAP_TAG: &str = "gap";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TaskKind {
    Ask,
    Lookup,
    Research,
    Feedback,
    Ingest,
    /// Anything else; kept verbatim so the error can name it.
    Unknown(String),
}

impl From<String> for TaskKind {
    fn from(raw: String) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "ask" => TaskKind::Ask,
            "lookup" => TaskKind::Lookup,
            "research" => TaskKind::Research,
            "feedback" => TaskKind::Feedback,
            "ingest" => TaskKind::Ingest,
            _ => TaskKind::Unknown(raw),
        }
    }
}

impl From<TaskKind> for String {
    fn from(kind: TaskKind) -> Self {
        kind.to_string()
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskKind::Ask => f.write_str("ask"),
            TaskKind::Lookup => f.write_str("lookup"),
            TaskKind::Research => f.write_str("research"),
            TaskKind::Feedback => f.write_str("feedback"),
            TaskKind::Ingest => f.write_str("ingest"),
            TaskKind::Unknown(raw) => f.write_str(raw),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Routed,
    Done,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Routed => "routed",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: TaskKind,
    /// Query text, a file path, or a structured object (feedback).
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "pending")]
    pub status: TaskStatus,
    #[serde(default)]
    pub caused_by: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

fn pending() -> TaskStatus {
    TaskStatus::Pending
}

impl Task {
    pub fn new(kind: TaskKind, payload: impl Into<serde_json::Value>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            payload: payload.into(),
            tags: Vec::new(),
            status: TaskStatus::Pending,
            caused_by: None,
            failure: None,
        }
    }

    pub fn with_tags(mut self, tags: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Parse a task from JSON such as `{"type": "ask", "payload": "..."}`.
    /// The task always starts `pending`, whatever the input says.
    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        let mut task: Task = serde_json::from_str(raw)?;
        task.status = TaskStatus::Pending;
        task.failure = None;
        Ok(task)
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t.eq_ignore_ascii_case(tag))
    }

    /// Payload as plain text, when it is a string.
    pub fn text(&self) -> Option<&str> {
        self.payload.as_str()
    }

    fn transition(&mut self, to: TaskStatus) -> Result<()> {
        let allowed = matches!(
            (self.status, to),
            (TaskStatus::Pending, TaskStatus::Routed)
                | (TaskStatus::Pending, TaskStatus::Failed)
                | (TaskStatus::Routed, TaskStatus::Done)
                | (TaskStatus::Routed, TaskStatus::Failed)
        );
        if !allowed {
            return Err(HarnessError::InvalidTransition {
                task_id: self.id,
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        tracing::debug!(task_id = %self.id, from = %self.status, to = %to, "task transition");
        self.status = to;
        Ok(())
    }

    pub fn mark_routed(&mut self) -> Result<()> {
        self.transition(TaskStatus::Routed)
    }

    pub fn complete(&mut self) -> Result<()> {
        self.transition(TaskStatus::Done)
    }

    pub fn fail(&mut self, reason: impl Into<String>) -> Result<()> {
        self.transition(TaskStatus::Failed)?;
        self.failure = Some(reason.into());
        Ok(())
    }

    /// A fresh pending copy of a failed task, caused by this one.
    pub fn retry(&self) -> Result<Task> {
        if self.status != TaskStatus::Failed {
            return Err(HarnessError::InvalidTransition {
                task_id: self.id,
                from: self.status.to_string(),
                to: "retry".to_string(),
            });
        }
        Ok(Task {
            id: Uuid::new_v4(),
            kind: self.kind.clone(),
            payload: self.payload.clone(),
            tags: self.tags.clone(),
            status: TaskStatus::Pending,
            caused_by: Some(self.id),
            failure: None,
        })
    }
}

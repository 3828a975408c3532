//! Task routing: a pure mapping from (task type, tags) to a handler.
//!
//! | Type | Tags | Handler |
//! |------|------|---------|
//! | `ask`, `lookup` | no `gap` | [`Handler::Retriever`] |
//! | `ask`, `lookup` | `gap` | [`Handler::Research`] |
//! | `research` | any | [`Handler::Research`] |
//! | `feedback` | any | [`Handler::Feedback`] |
//! | `ingest` | any | [`Handler::Ingest`] |
//! | anything else | any | `UnroutableTask` |

use std::fmt;

use crate::error::{HarnessError, Result};
use crate::task::{Task, TaskKind, GAP_TAG};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handler {
    Retriever,
    Research,
    Feedback,
    Ingest,
}

impl fmt::Display for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Handler::Retriever => "retriever",
            Handler::Research => "research",
            Handler::Feedback => "feedback",
            Handler::Ingest => "ingest",
        };
        f.write_str(s)
    }
}

/// Classify a task. Never touches task state.
pub fn route(task: &Task) -> Result<Handler> {
    match &task.kind {
        TaskKind::Ask | TaskKind::Lookup if task.has_tag(GAP_TAG) => Ok(Handler::Research),
        TaskKind::Ask | TaskKind::Lookup => Ok(Handler::Retriever),
        TaskKind::Research => Ok(Handler::Research),
        TaskKind::Feedback => Ok(Handler::Feedback),
        TaskKind::Ingest => Ok(Handler::Ingest),
        TaskKind::Unknown(kind) => Err(HarnessError::UnroutableTask {
            task_id: task.id,
            kind: kind.clone(),
        }),
    }
}

/// Route a pending task and record the outcome on it: `routed` on success,
/// `failed` when no handler accepts it.
pub fn dispatch(task: &mut Task) -> Result<Handler> {
    match route(task) {
        Ok(handler) => {
            task.mark_routed()?;
            tracing::info!(task_id = %task.id, kind = %task.kind, handler = %handler, "task routed");
            Ok(handler)
        }
        Err(err) => {
            task.fail(err.to_string())?;
            tracing::warn!(task_id = %task.id, kind = %task.kind, "task unroutable");
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskStatus;

    #[test]
    fn test_ask_routes_to_retriever() {
        let task = Task::from_json(r#"{"type": "ask"}"#).unwrap();
        assert_eq!(route(&task).unwrap(), Handler::Retriever);
        let lookup = Task::new(TaskKind::Lookup, "x");
        assert_eq!(route(&lookup).unwrap(), Handler::Retriever);
    }

    #[test]
    fn test_research_with_gap_tag_routes_to_research() {
        let task = Task::from_json(r#"{"type":"research","tags":["gap"]}"#).unwrap();
        assert_eq!(route(&task).unwrap(), Handler::Research);
        let ask_gap = Task::new(TaskKind::Ask, "x").with_tags(["gap"]);
        assert_eq!(route(&ask_gap).unwrap(), Handler::Research);
    }

    #[test]
    fn test_feedback_and_ingest() {
        assert_eq!(
            route(&Task::new(TaskKind::Feedback, serde_json::Value::Null)).unwrap(),
            Handler::Feedback
        );
        assert_eq!(
            route(&Task::new(TaskKind::Ingest, "reports/x.md")).unwrap(),
            Handler::Ingest
        );
    }

    #[test]
    fn test_unknown_type_is_unroutable_and_fails_task() {
        let mut task = Task::from_json(r#"{"type":"translate"}"#).unwrap();
        let err = dispatch(&mut task).unwrap_err();
        assert!(matches!(err, HarnessError::UnroutableTask { ref kind, .. } if kind == "translate"));
        assert_eq!(task.status, TaskStatus::Failed);
    }

    #[test]
    fn test_dispatch_marks_routed() {
        let mut task = Task::new(TaskKind::Ask, "q");
        dispatch(&mut task).unwrap();
        assert_eq!(task.status, TaskStatus::Routed);
        // Routing twice is a lifecycle error.
        assert!(dispatch(&mut task).is_err());
    }
}

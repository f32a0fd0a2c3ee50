//! Error types.
//!
//! [`SchedError`] is a contract violation: the caller broke a lifecycle rule
//! and the operation was refused. [`TaskException`] is a failure raised by a
//! task body; it is routed through handlers and only becomes a `SchedError`
//! when nobody handled it.

use crate::task::{TaskInfo, TaskState};
use std::fmt::Write as _;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedError {
    #[error("stale {kind} handle (slot {index}, generation {generation})")]
    StaleHandle {
        kind: &'static str,
        index: u32,
        generation: u32,
    },

    #[error("reference count underflow on {kind} slot {index}")]
    RefUnderflow { kind: &'static str, index: u32 },

    #[error("{kind} slot {index} freed while still referenced ({refs} refs)")]
    StillReferenced {
        kind: &'static str,
        index: u32,
        refs: u32,
    },

    #[error("pool `{kind}` exhausted (max {max} slots)")]
    PoolExhausted { kind: &'static str, max: usize },

    #[error("cannot {op} task `{task}` while {state:?}")]
    InvalidState {
        op: &'static str,
        task: String,
        state: TaskState,
    },

    #[error("pooled task `{0}` can only be started through the scheduler")]
    PooledManualStart(String),

    #[error("task `{0}` released while still in the active list")]
    StillQueued(String),

    #[error("task body suspended on a value that is not a suspension primitive")]
    UnsupportedSuspension,

    #[error("reentrancy stack mismatch: leaving `{leaving}` but top is {top:?}")]
    ReentrancyMismatch { leaving: String, top: Option<String> },

    #[error("tick called while a tick or task is already running")]
    ReentrantTick,

    #[error("scheduler has been dropped")]
    SchedulerDropped,

    #[error("callback completed without a value")]
    CallbackEmpty,

    #[error(transparent)]
    Unhandled(Box<TaskException>),
}

impl From<TaskException> for SchedError {
    fn from(e: TaskException) -> Self {
        SchedError::Unhandled(Box::new(e))
    }
}

/// A failure raised inside a task, with the task chain it travelled through.
#[derive(Debug, Error)]
#[error("task `{task}` failed: {source}")]
pub struct TaskException {
    task: String,
    stack: Vec<TaskInfo>,
    #[source]
    source: anyhow::Error,
}

impl TaskException {
    pub(crate) fn new(task: String, stack: Vec<TaskInfo>, source: anyhow::Error) -> Self {
        Self {
            task,
            stack,
            source,
        }
    }

    /// Name of the task that raised the error.
    pub fn task(&self) -> &str {
        &self.task
    }

    /// The failing task first, then each ancestor.
    pub fn call_stack(&self) -> &[TaskInfo] {
        &self.stack
    }

    pub fn stack_trace(&self) -> String {
        render_stack(&self.stack)
    }

    pub fn inner(&self) -> &anyhow::Error {
        &self.source
    }

    /// Try to view the underlying error as a concrete type.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: std::fmt::Display + std::fmt::Debug + Send + Sync + 'static,
    {
        self.source.downcast_ref::<E>()
    }
}

pub(crate) fn render_stack(stack: &[TaskInfo]) -> String {
    let mut out = String::new();
    for info in stack {
        let _ = writeln!(out, "\t{}", info);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TimeSource;

    #[test]
    fn test_stack_trace_lists_each_frame() {
        let stack = vec![
            TaskInfo {
                name: "child".into(),
                state: TaskState::Stopped,
                time_source: TimeSource::Scaled,
            },
            TaskInfo {
                name: "parent".into(),
                state: TaskState::Running,
                time_source: TimeSource::Real,
            },
        ];
        let exc = TaskException::new("child".into(), stack, anyhow::anyhow!("boom"));
        assert_eq!(exc.stack_trace(), "\tchild\n\tparent\n");
        assert_eq!(exc.to_string(), "task `child` failed: boom");
    }

    #[test]
    fn test_unhandled_wraps_exception() {
        let exc = TaskException::new("t".into(), Vec::new(), anyhow::anyhow!("bad"));
        let err: SchedError = exc.into();
        assert!(matches!(err, SchedError::Unhandled(_)));
        assert_eq!(err.to_string(), "task `t` failed: bad");
    }
}

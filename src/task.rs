//! Task records: state, lifecycle listeners, options and diagnostics.
//!
//! A task lives in the scheduler's task pool. Everything here is plain data;
//! the state machine that moves a task between states is in
//! [`scheduler`](crate::scheduler).

use crate::body::TaskBody;
use crate::clock::TimeSource;
use crate::error::TaskException;
use crate::pool::{Handle, Poolable};
use crate::primitive::{Payload, Suspension};
use crate::scheduler::Scheduler;
use std::fmt;
use std::rc::Rc;

pub type TaskHandle = Handle<Task>;

/// Ordered so that everything below `Running` skips the per-tick hook.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TaskState {
    /// A manual task whose last reference is gone. Terminal.
    Disposed,
    /// A pooled task back in its pool.
    Freed,
    /// Acquired but not started yet.
    InUse,
    Stopped,
    Paused,
    Running,
}

impl TaskState {
    /// Running, paused, or waiting to be started.
    pub fn is_alive(self) -> bool {
        matches!(self, TaskState::InUse | TaskState::Paused | TaskState::Running)
    }

    /// Counts as finished when waited on.
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            TaskState::Stopped | TaskState::Freed | TaskState::Disposed
        )
    }
}

/// One frame of a task call stack.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskInfo {
    pub name: String,
    pub state: TaskState,
    pub time_source: TimeSource,
}

impl fmt::Display for TaskInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

pub type TaskListener = Rc<dyn Fn(&Scheduler, TaskHandle)>;
/// Per-tick hook. Receives the current suspension; an error fails the task.
pub type UpdateListener = Rc<dyn Fn(&Scheduler, TaskHandle, Option<Suspension>) -> anyhow::Result<()>>;
pub type YieldDoneListener = Rc<dyn Fn(&Scheduler, TaskHandle, Suspension)>;
pub type CompleteListener = Rc<dyn Fn(&Scheduler, TaskHandle, Option<&Payload>)>;
pub type ExceptionListener = Rc<dyn Fn(&Scheduler, TaskHandle, &TaskException)>;

/// Lifecycle listeners for one task.
#[derive(Clone, Default)]
pub struct TaskHooks {
    pub on_start: Option<TaskListener>,
    pub on_update: Option<UpdateListener>,
    pub on_yield_done: Option<YieldDoneListener>,
    /// Fires on completion and on stop.
    pub on_stop: Option<TaskListener>,
    /// Fires on normal completion only, with the return payload if any.
    pub on_complete: Option<CompleteListener>,
    /// Handles exceptions raised by this task or bubbled up from children.
    pub on_exception: Option<ExceptionListener>,
}

/// Options for starting a task.
#[derive(Clone, Default)]
pub struct TaskOptions {
    pub name: Option<String>,
    pub time_source: TimeSource,
    pub hooks: TaskHooks,
}

impl TaskOptions {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn real_time(mut self) -> Self {
        self.time_source = TimeSource::Real;
        self
    }

    pub fn on_start(mut self, f: impl Fn(&Scheduler, TaskHandle) + 'static) -> Self {
        self.hooks.on_start = Some(Rc::new(f));
        self
    }

    pub fn on_update(
        mut self,
        f: impl Fn(&Scheduler, TaskHandle, Option<Suspension>) -> anyhow::Result<()> + 'static,
    ) -> Self {
        self.hooks.on_update = Some(Rc::new(f));
        self
    }

    pub fn on_yield_done(mut self, f: impl Fn(&Scheduler, TaskHandle, Suspension) + 'static) -> Self {
        self.hooks.on_yield_done = Some(Rc::new(f));
        self
    }

    pub fn on_stop(mut self, f: impl Fn(&Scheduler, TaskHandle) + 'static) -> Self {
        self.hooks.on_stop = Some(Rc::new(f));
        self
    }

    pub fn on_complete(
        mut self,
        f: impl Fn(&Scheduler, TaskHandle, Option<&Payload>) + 'static,
    ) -> Self {
        self.hooks.on_complete = Some(Rc::new(f));
        self
    }

    pub fn on_exception(
        mut self,
        f: impl Fn(&Scheduler, TaskHandle, &TaskException) + 'static,
    ) -> Self {
        self.hooks.on_exception = Some(Rc::new(f));
        self
    }
}

/// A task slot.
pub struct Task {
    pub(crate) name: String,
    pub(crate) state: TaskState,
    pub(crate) pooled: bool,
    pub(crate) auto_release: bool,
    pub(crate) time_source: TimeSource,
    pub(crate) in_queue: bool,
    pub(crate) parent: Option<TaskHandle>,
    pub(crate) live_children: u32,
    pub(crate) current: Option<Suspension>,
    pub(crate) body: Option<Box<dyn TaskBody>>,
    pub(crate) result: Option<Payload>,
    pub(crate) manually_stopped: bool,
    /// Bumped on every start and stop, so a body can tell whether its task
    /// was stopped or restarted while it ran.
    pub(crate) epoch: u64,
    pub(crate) hooks: TaskHooks,
}

impl Default for Task {
    fn default() -> Self {
        Self {
            name: String::new(),
            state: TaskState::Freed,
            pooled: true,
            auto_release: true,
            time_source: TimeSource::Scaled,
            in_queue: false,
            parent: None,
            live_children: 0,
            current: None,
            body: None,
            result: None,
            manually_stopped: false,
            epoch: 0,
            hooks: TaskHooks::default(),
        }
    }
}

impl Poolable for Task {
    const KIND: &'static str = "task";

    // Name and state survive so a stale handle can still report how the
    // task ended until its slot is reused.
    fn reset(&mut self) {
        self.auto_release = true;
        self.in_queue = false;
        self.parent = None;
        self.live_children = 0;
        self.current = None;
        self.body = None;
        self.result = None;
        self.manually_stopped = false;
        self.hooks = TaskHooks::default();
    }
}

impl Task {
    pub(crate) fn init(&mut self, name: String, pooled: bool, opts: TaskOptions) {
        self.name = name;
        self.state = TaskState::InUse;
        self.pooled = pooled;
        self.auto_release = true;
        self.time_source = opts.time_source;
        self.hooks = opts.hooks;
    }

    pub(crate) fn info(&self) -> TaskInfo {
        TaskInfo {
            name: self.name.clone(),
            state: self.state,
            time_source: self.time_source,
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("state", &self.state)
            .field("pooled", &self.pooled)
            .field("current", &self.current)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_order_matches_update_gate() {
        assert!(TaskState::Paused < TaskState::Running);
        assert!(TaskState::Stopped < TaskState::Paused);
        assert!(TaskState::Disposed < TaskState::Freed);
    }

    #[test]
    fn test_alive_and_finished_partition() {
        use TaskState::*;
        for s in [Disposed, Freed, InUse, Stopped, Paused, Running] {
            assert_ne!(s.is_alive(), s.is_finished(), "{s:?}");
        }
    }

    #[test]
    fn test_reset_keeps_name_and_state() {
        let mut t = Task::default();
        t.init("loader".into(), true, TaskOptions::named("ignored").real_time());
        t.state = TaskState::Freed;
        t.live_children = 3;
        t.reset();
        assert_eq!(t.name, "loader");
        assert_eq!(t.state, TaskState::Freed);
        assert_eq!(t.live_children, 0);
        assert_eq!(t.info().time_source, TimeSource::Real);
    }
}

//! Scheduler
//!
//! Owns the task registry, one pool per primitive type plus one for tasks,
//! the reentrancy stack and the single `tick` entry point. Everything runs
//! on the caller's thread: a task's code between two suspensions runs to
//! completion inside one `tick` (or `start_task`) call.
//!
//! Borrow discipline: the core is only borrowed for short data operations.
//! Bodies, predicates, hooks and listeners are always called with the core
//! released, so user code may call back into the scheduler freely.
//!
//! Reference counts:
//! - the active list holds one reference per queued task;
//! - a task holds one reference on its current suspension;
//! - a child holds one reference on its parent while it is alive;
//! - a combinator holds one reference on each child;
//! - `add_task`, `set_auto_release(false)` and `retain` hold one for the
//!   caller.

use crate::body::{Step, TaskBody, TaskCx};
use crate::callback::WaitCallback;
use crate::clock::TimeSource;
use crate::config::SchedulerConfig;
use crate::error::{render_stack, SchedError, TaskException};
use crate::multi::WaitMulti;
use crate::pool::{Handle, Pool, PoolStats};
use crate::primitive::{
    Payload, Primitive, ReturnValue, Suspension, SuspensionKind, WaitEvent, WaitFrame, WaitTime,
    WaitUntil,
};
use crate::task::{Task, TaskHandle, TaskHooks, TaskInfo, TaskOptions, TaskState};
use crate::trace::{debug, error, trace, warn};
use std::any::Any;
use std::cell::{RefCell, RefMut};
use std::rc::{Rc, Weak};

type UnhandledHook = Rc<dyn Fn(&Scheduler, &TaskException)>;

/// Failure while driving a task: a task-level exception to be routed, or a
/// contract violation to be returned to the caller.
enum Fault {
    Task(anyhow::Error),
    Sched(SchedError),
}

impl From<SchedError> for Fault {
    fn from(e: SchedError) -> Self {
        Fault::Sched(e)
    }
}

pub(crate) struct Core {
    pub(crate) tasks: Pool<Task>,
    pub(crate) times: Pool<WaitTime>,
    pub(crate) untils: Pool<WaitUntil>,
    pub(crate) events: Pool<WaitEvent>,
    pub(crate) frames: Pool<WaitFrame>,
    pub(crate) returns: Pool<ReturnValue>,
    pub(crate) callbacks: Pool<WaitCallback>,
    pub(crate) multis: Pool<WaitMulti>,

    /// Registered tasks, visited once per tick.
    active: Vec<TaskHandle>,
    /// Tasks registered during the current tick; merged at the next one.
    staged: Vec<TaskHandle>,
    /// Chain of tasks whose code is executing. Top is the current task.
    stack: Vec<TaskHandle>,

    scaled_time: f64,
    real_time: f64,
    in_tick: bool,

    unhandled: Vec<TaskException>,
    next_id: u64,
}

pub(crate) struct Inner {
    core: RefCell<Core>,
    unhandled_hook: RefCell<Option<UnhandledHook>>,
}

/// Handle to a scheduler. Clones share the same scheduler.
#[derive(Clone)]
pub struct Scheduler(Rc<Inner>);

/// Non-owning scheduler handle.
#[derive(Clone)]
pub struct WeakScheduler(Weak<Inner>);

impl WeakScheduler {
    pub fn upgrade(&self) -> Option<Scheduler> {
        self.0.upgrade().map(Scheduler)
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(SchedulerConfig::default())
    }
}

impl Core {
    fn new(config: &SchedulerConfig) -> Self {
        Self {
            tasks: Pool::new(config.tasks),
            times: Pool::new(config.wait_time),
            untils: Pool::new(config.wait_until),
            events: Pool::new(config.wait_event),
            frames: Pool::new(config.wait_frame),
            returns: Pool::new(config.return_value),
            callbacks: Pool::new(config.callback),
            multis: Pool::new(config.multi),
            active: Vec::new(),
            staged: Vec::new(),
            stack: Vec::new(),
            scaled_time: 0.0,
            real_time: 0.0,
            in_tick: false,
            unhandled: Vec::new(),
            next_id: 0,
        }
    }

    fn now(&self, source: TimeSource) -> f64 {
        match source {
            TimeSource::Scaled => self.scaled_time,
            TimeSource::Real => self.real_time,
        }
    }

    fn next_name(&mut self) -> String {
        let id = self.next_id;
        self.next_id += 1;
        format!("task:{id}")
    }

    pub(crate) fn task(&self, h: TaskHandle) -> Result<&Task, SchedError> {
        self.tasks.get(h)
    }

    pub(crate) fn task_mut(&mut self, h: TaskHandle) -> Result<&mut Task, SchedError> {
        self.tasks.get_mut(h)
    }

    fn task_now(&self, h: TaskHandle) -> Result<f64, SchedError> {
        Ok(self.now(self.task(h)?.time_source))
    }

    /// State of a live task, or the final state of a released one whose slot
    /// has not been reused.
    fn task_state(&self, h: TaskHandle) -> Result<TaskState, SchedError> {
        match self.tasks.get(h) {
            Ok(t) => Ok(t.state),
            Err(e) => self.tasks.released(h).map(|t| t.state).ok_or(e),
        }
    }

    fn invalid(&self, op: &'static str, h: TaskHandle) -> SchedError {
        match self.task(h) {
            Ok(t) => SchedError::InvalidState {
                op,
                task: t.name.clone(),
                state: t.state,
            },
            Err(e) => e,
        }
    }

    fn name_of(&self, h: TaskHandle) -> String {
        self.task(h)
            .map(|t| t.name.clone())
            .unwrap_or_else(|_| format!("{h:?}"))
    }

    // --- Primitive dispatch ---

    fn prim(&self, s: Suspension) -> Result<Option<&dyn Primitive>, SchedError> {
        let p: &dyn Primitive = match s {
            Suspension::Time(h) => self.times.get(h)?,
            Suspension::Until(h) => self.untils.get(h)?,
            Suspension::Event(h) => self.events.get(h)?,
            Suspension::Frame(h) => self.frames.get(h)?,
            Suspension::Return(h) => self.returns.get(h)?,
            Suspension::Callback(h) => self.callbacks.get(h)?,
            Suspension::Multi(h) => self.multis.get(h)?,
            Suspension::Task(_) | Suspension::Children(_) => return Ok(None),
        };
        Ok(Some(p))
    }

    fn prim_mut(&mut self, s: Suspension) -> Result<Option<&mut dyn Primitive>, SchedError> {
        let p: &mut dyn Primitive = match s {
            Suspension::Time(h) => self.times.get_mut(h)?,
            Suspension::Until(h) => self.untils.get_mut(h)?,
            Suspension::Event(h) => self.events.get_mut(h)?,
            Suspension::Frame(h) => self.frames.get_mut(h)?,
            Suspension::Return(h) => self.returns.get_mut(h)?,
            Suspension::Callback(h) => self.callbacks.get_mut(h)?,
            Suspension::Multi(h) => self.multis.get_mut(h)?,
            Suspension::Task(_) | Suspension::Children(_) => return Ok(None),
        };
        Ok(Some(p))
    }

    fn contains(&self, s: Suspension) -> bool {
        match s {
            Suspension::Task(h) | Suspension::Children(h) => self.tasks.contains(h),
            _ => self.prim(s).is_ok(),
        }
    }

    pub(crate) fn refs(&self, s: Suspension) -> Result<u32, SchedError> {
        match s {
            Suspension::Time(h) => self.times.refs(h),
            Suspension::Until(h) => self.untils.refs(h),
            Suspension::Event(h) => self.events.refs(h),
            Suspension::Frame(h) => self.frames.refs(h),
            Suspension::Return(h) => self.returns.refs(h),
            Suspension::Callback(h) => self.callbacks.refs(h),
            Suspension::Multi(h) => self.multis.refs(h),
            Suspension::Task(h) | Suspension::Children(h) => self.tasks.refs(h),
        }
    }

    pub(crate) fn incref(&mut self, s: Suspension) -> Result<u32, SchedError> {
        match s {
            Suspension::Time(h) => self.times.incref(h),
            Suspension::Until(h) => self.untils.incref(h),
            Suspension::Event(h) => self.events.incref(h),
            Suspension::Frame(h) => self.frames.incref(h),
            Suspension::Return(h) => self.returns.incref(h),
            Suspension::Callback(h) => self.callbacks.incref(h),
            Suspension::Multi(h) => self.multis.incref(h),
            Suspension::Task(h) | Suspension::Children(h) => self.tasks.incref(h),
        }
    }

    fn decref(&mut self, s: Suspension) -> Result<u32, SchedError> {
        match s {
            Suspension::Time(h) => self.times.decref(h),
            Suspension::Until(h) => self.untils.decref(h),
            Suspension::Event(h) => self.events.decref(h),
            Suspension::Frame(h) => self.frames.decref(h),
            Suspension::Return(h) => self.returns.decref(h),
            Suspension::Callback(h) => self.callbacks.decref(h),
            Suspension::Multi(h) => self.multis.decref(h),
            Suspension::Task(h) | Suspension::Children(h) => self.tasks.decref(h),
        }
    }

    fn free_prim(&mut self, s: Suspension) -> Result<(), SchedError> {
        match s {
            Suspension::Time(h) => self.times.free(h),
            Suspension::Until(h) => self.untils.free(h),
            Suspension::Event(h) => self.events.free(h),
            Suspension::Frame(h) => self.frames.free(h),
            Suspension::Return(h) => self.returns.free(h),
            Suspension::Callback(h) => self.callbacks.free(h),
            Suspension::Multi(h) => self.multis.free(h),
            Suspension::Task(_) | Suspension::Children(_) => Ok(()),
        }
    }

    fn is_done(&self, s: Suspension) -> Result<bool, SchedError> {
        match s {
            Suspension::Task(h) => Ok(self.task_state(h)?.is_finished()),
            Suspension::Children(h) => Ok(self.task(h)?.live_children == 0),
            _ => Ok(self.prim(s)?.is_none_or(|p| p.is_done())),
        }
    }

    fn is_timed_out(&self, s: Suspension) -> Result<bool, SchedError> {
        Ok(self.prim(s)?.is_some_and(|p| p.is_timed_out()))
    }

    fn settle(&mut self, m: Handle<WaitMulti>) -> Result<(), SchedError> {
        let children = self.multis.get(m)?.children().to_vec();
        let done = children
            .iter()
            .map(|c| self.is_done(*c))
            .collect::<Result<Vec<_>, _>>()?;
        self.multis.get_mut(m)?.settle(&done);
        Ok(())
    }

    fn start_prim(&mut self, s: Suspension, now: f64) -> Result<(), SchedError> {
        if let Suspension::Multi(m) = s {
            for c in self.multis.get(m)?.children().to_vec() {
                self.start_prim(c, now)?;
            }
            return self.settle(m);
        }
        if let Some(p) = self.prim_mut(s)? {
            p.start(now);
        }
        Ok(())
    }

    fn pause_prim(&mut self, s: Suspension, now: f64) -> Result<(), SchedError> {
        match s {
            Suspension::Multi(m) => {
                for c in self.multis.get(m)?.children().to_vec() {
                    self.pause_prim(c, now)?;
                }
            }
            Suspension::Task(t) => {
                if self.task(t)?.state == TaskState::Running {
                    self.pause_task(t)?;
                }
            }
            Suspension::Children(_) => {}
            _ => {
                if let Some(p) = self.prim_mut(s)? {
                    p.pause(now);
                }
            }
        }
        Ok(())
    }

    fn resume_prim(&mut self, s: Suspension, now: f64) -> Result<(), SchedError> {
        match s {
            Suspension::Multi(m) => {
                for c in self.multis.get(m)?.children().to_vec() {
                    self.resume_prim(c, now)?;
                }
            }
            Suspension::Task(t) => {
                if self.task(t)?.state == TaskState::Paused {
                    self.resume_task(t)?;
                }
            }
            Suspension::Children(_) => {}
            _ => {
                if let Some(p) = self.prim_mut(s)? {
                    p.resume(now);
                }
            }
        }
        Ok(())
    }

    fn pause_task(&mut self, h: TaskHandle) -> Result<(), SchedError> {
        let now = self.task_now(h)?;
        let t = self.task_mut(h)?;
        if t.state != TaskState::Running {
            return Err(self.invalid("pause", h));
        }
        t.state = TaskState::Paused;
        if let Some(cur) = t.current {
            self.pause_prim(cur, now)?;
        }
        Ok(())
    }

    fn resume_task(&mut self, h: TaskHandle) -> Result<(), SchedError> {
        let now = self.task_now(h)?;
        let t = self.task_mut(h)?;
        if t.state != TaskState::Paused {
            return Err(self.invalid("resume", h));
        }
        t.state = TaskState::Running;
        if let Some(cur) = t.current {
            self.resume_prim(cur, now)?;
        }
        Ok(())
    }

    fn pool_stats(&self) -> Vec<PoolStats> {
        vec![
            self.tasks.stats(),
            self.times.stats(),
            self.untils.stats(),
            self.events.stats(),
            self.frames.stats(),
            self.returns.stats(),
            self.callbacks.stats(),
            self.multis.stats(),
        ]
    }
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self(Rc::new(Inner {
            core: RefCell::new(Core::new(&config)),
            unhandled_hook: RefCell::new(None),
        }))
    }

    pub fn downgrade(&self) -> WeakScheduler {
        WeakScheduler(Rc::downgrade(&self.0))
    }

    pub(crate) fn core(&self) -> RefMut<'_, Core> {
        self.0.core.borrow_mut()
    }

    // --- Time ---

    pub fn scaled_time(&self) -> f64 {
        self.core().scaled_time
    }

    pub fn real_time(&self) -> f64 {
        self.core().real_time
    }

    /// Current time on the task's clock.
    pub fn task_time(&self, h: TaskHandle) -> Result<f64, SchedError> {
        self.core().task_now(h)
    }

    // --- Tick ---

    /// Advance every registered task by one step.
    ///
    /// Tasks registered since the previous tick are merged first. Each task
    /// is visited once; dead ones are swap-removed and their registry
    /// reference dropped. An unhandled task exception raised during the pass
    /// is returned after the pass completes.
    pub fn tick(&self, scaled: f64, real: f64) -> Result<(), SchedError> {
        {
            let mut core = self.core();
            if core.in_tick || !core.stack.is_empty() {
                return Err(SchedError::ReentrantTick);
            }
            core.in_tick = true;
            core.scaled_time = scaled;
            core.real_time = real;
            let staged = std::mem::take(&mut core.staged);
            core.active.extend(staged);
            trace!(active = core.active.len(), scaled, real, "tick");
        }

        let pass = self.run_pass();
        self.core().in_tick = false;
        pass?;
        self.surface_unhandled()
    }

    fn run_pass(&self) -> Result<(), SchedError> {
        let mut i = 0;
        loop {
            let h = {
                let core = self.core();
                match core.active.get(i) {
                    Some(h) => *h,
                    None => break,
                }
            };
            if self.tick_task(h)? {
                {
                    let mut core = self.core();
                    core.active.swap_remove(i);
                    core.task_mut(h)?.in_queue = false;
                }
                self.decref(Suspension::Task(h))?;
            } else {
                i += 1;
            }
        }
        Ok(())
    }

    /// Returns whether the task is dead.
    fn tick_task(&self, h: TaskHandle) -> Result<bool, SchedError> {
        let (state, hook, current) = {
            let core = self.core();
            let t = core.task(h)?;
            (t.state, t.hooks.on_update.clone(), t.current)
        };
        if state == TaskState::Running {
            if let Some(hook) = hook {
                if let Err(e) = hook(self, h, current) {
                    self.fail_task(h, e)?;
                    return Ok(true);
                }
            }
        }

        let state = self.core().task(h)?.state;
        match state {
            TaskState::Running => {}
            TaskState::Paused | TaskState::InUse => return Ok(false),
            TaskState::Stopped | TaskState::Freed | TaskState::Disposed => return Ok(true),
        }

        self.push_stack(h);
        let stepped = self.step_task(h);
        let popped = self.pop_stack(h);
        let dead = match stepped {
            Ok(dead) => dead,
            Err(Fault::Task(e)) => {
                self.fail_task(h, e)?;
                true
            }
            Err(Fault::Sched(e)) => return Err(e),
        };
        popped?;
        Ok(dead)
    }

    fn step_task(&self, h: TaskHandle) -> Result<bool, Fault> {
        let (current, now, on_yield_done) = {
            let core = self.core();
            let t = core.task(h)?;
            (t.current, core.now(t.time_source), t.hooks.on_yield_done.clone())
        };
        let Some(cur) = current else {
            return Err(self.core().invalid("tick", h).into());
        };

        if cur.kind() == SuspensionKind::ReturnValue {
            let payload = self.payload_of(cur)?;
            self.core().task_mut(h)?.current = None;
            self.decref(cur)?;
            self.complete(h, payload)?;
            return Ok(true);
        }

        self.update_suspension(cur, now)?;
        let done = self.core().is_done(cur)?;
        if !done {
            return Ok(false);
        }

        if let Some(cb) = on_yield_done {
            cb(self, h, cur);
            // The listener may have stopped the task, which released `cur`.
            let state = self.core().task(h)?.state;
            if state.is_finished() {
                return Ok(true);
            }
        }

        self.stop_suspension(cur)?;
        match self.resume_body(h, Some(cur))? {
            None => Ok(self.core().task_state(h)?.is_finished()),
            Some(Step::Done) => {
                self.core().task_mut(h)?.current = None;
                self.decref(cur)?;
                self.complete(h, None)?;
                Ok(true)
            }
            Some(Step::Yield(next)) => {
                self.adopt(h, next, now, Some(cur))?;
                Ok(false)
            }
        }
    }

    /// Run the body once. `None` means the task was stopped or restarted
    /// from inside its own body; whatever it yielded is discarded.
    fn resume_body(
        &self,
        h: TaskHandle,
        finished: Option<Suspension>,
    ) -> Result<Option<Step>, Fault> {
        let (body, epoch, now) = {
            let mut core = self.core();
            let now = core.task_now(h)?;
            let t = core.task_mut(h)?;
            (t.body.take(), t.epoch, now)
        };
        let Some(mut body) = body else {
            return Err(self.core().invalid("resume", h).into());
        };

        let result = body.resume(&TaskCx::new(self, h, finished, now));

        let stale = self.core().task(h)?.epoch != epoch;
        if stale {
            drop(body);
            if let Ok(Step::Yield(s)) = result {
                self.discard(s)?;
            }
            return Ok(None);
        }
        match result {
            Ok(Step::Yield(s)) => {
                self.core().task_mut(h)?.body = Some(body);
                Ok(Some(Step::Yield(s)))
            }
            Ok(Step::Done) => Ok(Some(Step::Done)),
            Err(e) => Err(Fault::Task(e)),
        }
    }

    /// Make `next` the task's current suspension and start it. `old` is
    /// released afterwards, so re-yielding the same suspension is safe.
    fn adopt(
        &self,
        h: TaskHandle,
        next: Suspension,
        now: f64,
        old: Option<Suspension>,
    ) -> Result<(), Fault> {
        {
            let mut core = self.core();
            if let Err(e) = core.refs(next) {
                return Err(Fault::Task(e.into()));
            }
            if next == Suspension::Task(h) {
                return Err(Fault::Task(SchedError::UnsupportedSuspension.into()));
            }
            core.task_mut(h)?.current = Some(next);
            core.incref(next)?;
            core.start_prim(next, now)?;
            // Paused from inside its own body.
            if core.task(h)?.state == TaskState::Paused {
                core.pause_prim(next, now)?;
            }
        }
        if let Some(old) = old {
            self.decref(old)?;
        }
        Ok(())
    }

    fn payload_of(&self, s: Suspension) -> Result<Option<Payload>, SchedError> {
        match s {
            Suspension::Return(r) => Ok(self.core().returns.get(r)?.payload.clone()),
            _ => Ok(None),
        }
    }

    // --- Starting ---

    /// Acquire a pooled task and start it.
    ///
    /// The body runs up to its first suspension before this returns, so the
    /// returned task may already be stopped. Started from inside another
    /// task, the new task becomes that task's child.
    pub fn start_task<B: TaskBody + 'static>(
        &self,
        body: B,
        mut opts: TaskOptions,
    ) -> Result<TaskHandle, SchedError> {
        let h = {
            let mut core = self.core();
            let h = core.tasks.acquire()?;
            let name = opts.name.take().unwrap_or_else(|| core.next_name());
            core.task_mut(h)?.init(name, true, opts);
            h
        };
        self.start_internal(h, Box::new(body))?;
        self.surface_unhandled()?;
        Ok(h)
    }

    /// Create a manual task. The caller holds one reference until
    /// [`remove_task`](Self::remove_task).
    pub fn add_task(&self, mut opts: TaskOptions) -> Result<TaskHandle, SchedError> {
        let mut core = self.core();
        let h = core.tasks.acquire()?;
        let name = opts.name.take().unwrap_or_else(|| core.next_name());
        core.task_mut(h)?.init(name, false, opts);
        core.tasks.incref(h)?;
        Ok(h)
    }

    /// Start (or restart) a manual task.
    pub fn start_manual<B: TaskBody + 'static>(
        &self,
        h: TaskHandle,
        body: B,
    ) -> Result<(), SchedError> {
        {
            let core = self.core();
            let t = core.task(h)?;
            if t.pooled {
                return Err(SchedError::PooledManualStart(t.name.clone()));
            }
        }
        self.start_internal(h, Box::new(body))?;
        self.surface_unhandled()
    }

    /// Drop the caller's reference on a manual task. With `dispose`, the
    /// task must not be running; it becomes `Disposed` once nothing else
    /// references it.
    pub fn remove_task(&self, h: TaskHandle, dispose: bool) -> Result<(), SchedError> {
        {
            let core = self.core();
            let t = core.task(h)?;
            if t.pooled {
                return Err(core.invalid("remove pooled", h));
            }
            if dispose && matches!(t.state, TaskState::Running | TaskState::Paused) {
                return Err(core.invalid("dispose", h));
            }
        }
        self.decref(Suspension::Task(h))
    }

    fn start_internal(&self, h: TaskHandle, body: Box<dyn TaskBody>) -> Result<(), SchedError> {
        let state = self.core().task(h)?.state;
        match state {
            TaskState::Running | TaskState::Paused => self.stop_task(h)?,
            TaskState::InUse | TaskState::Stopped => {}
            TaskState::Freed | TaskState::Disposed => return Err(self.core().invalid("start", h)),
        }

        let (now, on_start) = {
            let mut core = self.core();
            let parent = core.stack.last().copied().filter(|p| *p != h);
            if let Some(p) = parent {
                core.tasks.incref(p)?;
                core.task_mut(p)?.live_children += 1;
            }
            let in_tick = core.in_tick;
            let t = core.task_mut(h)?;
            t.parent = parent;
            t.body = Some(body);
            t.current = None;
            t.result = None;
            t.manually_stopped = false;
            let on_start = t.hooks.on_start.clone();
            let enqueue = !t.in_queue;
            t.in_queue = true;
            if enqueue {
                core.tasks.incref(h)?;
                if in_tick {
                    core.staged.push(h);
                } else {
                    core.active.push(h);
                }
            }
            debug!(
                task = %core.name_of(h),
                parent = ?parent.map(|p| core.name_of(p)),
                "task started"
            );
            (core.task_now(h)?, on_start)
        };

        self.push_stack(h);
        if let Some(cb) = on_start {
            cb(self, h);
        }
        {
            let mut core = self.core();
            let t = core.task_mut(h)?;
            t.state = TaskState::Running;
            t.epoch += 1;
        }

        let outcome = match self.resume_body(h, None) {
            Ok(None) => Ok(()),
            Ok(Some(Step::Done)) => self.complete(h, None).map_err(Fault::from),
            Ok(Some(Step::Yield(s))) if s.kind() == SuspensionKind::ReturnValue => {
                self.return_now(h, s).map_err(Fault::from)
            }
            Ok(Some(Step::Yield(s))) => self.adopt(h, s, now, None),
            Err(f) => Err(f),
        };
        let outcome = match outcome {
            Ok(()) => Ok(()),
            Err(Fault::Task(e)) => self.fail_task(h, e),
            Err(Fault::Sched(e)) => Err(e),
        };
        let popped = self.pop_stack(h);
        outcome?;
        popped
    }

    /// First yield was the return marker: complete before `start` returns.
    fn return_now(&self, h: TaskHandle, marker: Suspension) -> Result<(), SchedError> {
        let payload = self.payload_of(marker)?;
        self.discard(marker)?;
        self.complete(h, payload)
    }

    // --- Lifecycle ---

    fn complete(&self, h: TaskHandle, payload: Option<Payload>) -> Result<(), SchedError> {
        let (on_complete, body) = {
            let mut core = self.core();
            let t = core.task_mut(h)?;
            t.state = TaskState::Stopped;
            t.epoch += 1;
            t.result = payload.clone();
            let out = (t.hooks.on_complete.clone(), t.body.take());
            debug!(task = %t.name, "task completed");
            out
        };
        drop(body);
        if let Some(cb) = on_complete {
            cb(self, h, payload.as_ref());
        }
        self.finish_stop(h)
    }

    /// Stop the task and release its current suspension. Returns whether it
    /// was alive.
    fn halt(&self, h: TaskHandle) -> Result<bool, SchedError> {
        let (was_alive, current, body) = {
            let mut core = self.core();
            let t = core.task_mut(h)?;
            let alive = t.state.is_alive();
            if alive {
                t.state = TaskState::Stopped;
                t.epoch += 1;
            }
            (alive, t.current.take(), t.body.take())
        };
        drop(body);
        if let Some(cur) = current {
            self.stop_suspension(cur)?;
            self.decref(cur)?;
        }
        Ok(was_alive)
    }

    /// Stop listener, then detach from the parent.
    fn finish_stop(&self, h: TaskHandle) -> Result<(), SchedError> {
        let on_stop = self.core().task(h)?.hooks.on_stop.clone();
        if let Some(cb) = on_stop {
            cb(self, h);
        }
        self.detach_parent(h)
    }

    fn detach_parent(&self, h: TaskHandle) -> Result<(), SchedError> {
        let parent = {
            let mut core = self.core();
            let parent = core.task_mut(h)?.parent.take();
            if let Some(p) = parent {
                let pt = core.task_mut(p)?;
                pt.live_children = pt.live_children.saturating_sub(1);
            }
            parent
        };
        if let Some(p) = parent {
            self.decref(Suspension::Task(p))?;
        }
        Ok(())
    }

    /// Stop a running or paused task. Stopping a task that is not running
    /// does nothing.
    ///
    /// The stop listener fires before this returns; the task leaves the
    /// registry at the next sweep.
    pub fn stop_task(&self, h: TaskHandle) -> Result<(), SchedError> {
        {
            let mut core = self.core();
            let t = core.task_mut(h)?;
            if !matches!(t.state, TaskState::Running | TaskState::Paused) {
                return Ok(());
            }
            t.manually_stopped = true;
            debug!(task = %t.name, "task stopped");
        }
        self.halt(h)?;
        self.finish_stop(h)
    }

    pub fn pause_task(&self, h: TaskHandle) -> Result<(), SchedError> {
        self.core().pause_task(h)
    }

    pub fn resume_task(&self, h: TaskHandle) -> Result<(), SchedError> {
        self.core().resume_task(h)
    }

    /// Pooled tasks only. `false` holds an extra reference so the handle
    /// stays valid after the task dies; `true` drops it again, freeing a
    /// dead task nothing else holds.
    pub fn set_auto_release(&self, h: TaskHandle, on: bool) -> Result<(), SchedError> {
        {
            let mut core = self.core();
            let t = core.task_mut(h)?;
            if !t.pooled {
                warn!(task = %t.name, "set_auto_release on a manual task has no effect");
                return Ok(());
            }
            if t.auto_release == on {
                return Ok(());
            }
            // Holding a dead task would keep its slot with nothing to release it.
            if !on && !t.state.is_alive() {
                return Err(core.invalid("set_auto_release", h));
            }
            t.auto_release = on;
            if !on {
                core.tasks.incref(h)?;
                return Ok(());
            }
        }
        self.decref(Suspension::Task(h))
    }

    /// Stop a pooled task held with auto-release off and drop the extra
    /// reference, returning it to the pool once nothing else holds it.
    pub fn release_task(&self, h: TaskHandle) -> Result<(), SchedError> {
        {
            let core = self.core();
            let t = core.task(h)?;
            if !t.pooled || t.auto_release {
                return Err(core.invalid("release", h));
            }
        }
        self.stop_task(h)?;
        self.core().task_mut(h)?.auto_release = true;
        self.decref(Suspension::Task(h))
    }

    /// Edit a task's listeners.
    pub fn set_hooks(
        &self,
        h: TaskHandle,
        edit: impl FnOnce(&mut TaskHooks),
    ) -> Result<(), SchedError> {
        let mut hooks = std::mem::take(&mut self.core().task_mut(h)?.hooks);
        edit(&mut hooks);
        self.core().task_mut(h)?.hooks = hooks;
        Ok(())
    }

    // --- Exceptions ---

    fn fail_task(&self, h: TaskHandle, source: anyhow::Error) -> Result<(), SchedError> {
        let stack = self.call_stack(h)?;
        let name = stack.first().map(|i| i.name.clone()).unwrap_or_default();
        warn!(task = %name, error = %source, "task failed");
        self.route_exception(h, TaskException::new(name, stack, source))
    }

    /// Stop `h`, then hand the exception to its handler, else its parent
    /// (which is stopped in turn), else the unhandled channel.
    fn route_exception(&self, h: TaskHandle, exc: TaskException) -> Result<(), SchedError> {
        let was_alive = self.halt(h)?;
        let (handler, parent) = {
            let core = self.core();
            let t = core.task(h)?;
            (t.hooks.on_exception.clone(), t.parent)
        };
        if let Some(handler) = handler {
            handler(self, h, &exc);
        } else if let Some(p) = parent {
            self.route_exception(p, exc)?;
        } else {
            self.raise_unhandled(exc);
        }
        if was_alive {
            self.finish_stop(h)?;
        }
        Ok(())
    }

    fn raise_unhandled(&self, exc: TaskException) {
        let hook = self.0.unhandled_hook.borrow().clone();
        match hook {
            Some(hook) => hook(self, &exc),
            None => {
                error!(task = exc.task(), error = %exc, "unhandled task exception");
                self.core().unhandled.push(exc);
            }
        }
    }

    /// At the outermost call, turn the oldest queued unhandled exception
    /// into an error for the caller. The rest stay queued for later calls.
    fn surface_unhandled(&self) -> Result<(), SchedError> {
        let mut core = self.core();
        if core.in_tick || !core.stack.is_empty() || core.unhandled.is_empty() {
            return Ok(());
        }
        let first = core.unhandled.remove(0);
        if !core.unhandled.is_empty() {
            debug!(left = core.unhandled.len(), "more unhandled exceptions queued");
        }
        Err(first.into())
    }

    /// Exceptions still queued after the last outermost call returned one.
    pub fn pending_unhandled(&self) -> usize {
        self.core().unhandled.len()
    }

    /// Drain the queued unhandled exceptions without waiting for further
    /// `tick` calls to return them one at a time.
    pub fn take_unhandled(&self) -> Vec<TaskException> {
        std::mem::take(&mut self.core().unhandled)
    }

    /// Receive every exception no task handled. Without a hook they are
    /// returned from `tick`/`start_task`.
    pub fn set_unhandled_hook(&self, hook: impl Fn(&Scheduler, &TaskException) + 'static) {
        *self.0.unhandled_hook.borrow_mut() = Some(Rc::new(hook));
    }

    pub fn clear_unhandled_hook(&self) {
        self.0.unhandled_hook.borrow_mut().take();
    }

    // --- Suspensions ---

    fn update_suspension(&self, s: Suspension, now: f64) -> Result<(), Fault> {
        match s {
            Suspension::Until(w) => {
                let (cond, hook) = {
                    let core = self.core();
                    let p = core.untils.get(w)?;
                    (p.cond.clone(), p.hook.clone())
                };
                if let Some(hook) = hook {
                    hook().map_err(Fault::Task)?;
                }
                let met = cond.is_some_and(|c| c.check());
                let mut core = self.core();
                let p = core.untils.get_mut(w)?;
                p.met = met;
                p.update(now);
            }
            Suspension::Event(w) => {
                let hook = self.core().events.get(w)?.hook.clone();
                if let Some(hook) = hook {
                    hook().map_err(Fault::Task)?;
                }
                self.core().events.get_mut(w)?.update(now);
            }
            Suspension::Callback(w) => {
                let hook = self.core().callbacks.get(w)?.hook.clone();
                if let Some(hook) = hook {
                    hook().map_err(Fault::Task)?;
                }
            }
            Suspension::Multi(m) => {
                let children = self.core().multis.get(m)?.children().to_vec();
                for c in children {
                    self.update_suspension(c, now)?;
                }
                self.core().settle(m)?;
            }
            Suspension::Time(_) | Suspension::Frame(_) => {
                let mut core = self.core();
                if let Some(p) = core.prim_mut(s)? {
                    p.update(now);
                }
            }
            Suspension::Return(_) | Suspension::Task(_) | Suspension::Children(_) => {}
        }
        Ok(())
    }

    fn stop_suspension(&self, s: Suspension) -> Result<(), SchedError> {
        match s {
            Suspension::Task(t) => self.stop_task(t),
            Suspension::Children(_) | Suspension::Multi(_) => Ok(()),
            _ => {
                let mut core = self.core();
                if let Some(p) = core.prim_mut(s)? {
                    p.stop();
                }
                Ok(())
            }
        }
    }

    fn decref(&self, s: Suspension) -> Result<(), SchedError> {
        let refs = self.core().decref(s)?;
        if refs == 0 {
            self.release_zero(s)?;
        }
        Ok(())
    }

    /// Run the release logic of an object whose count reached zero.
    fn release_zero(&self, s: Suspension) -> Result<(), SchedError> {
        match s {
            Suspension::Multi(m) => {
                let children = self.core().multis.get_mut(m)?.take_children();
                for c in children {
                    self.stop_suspension(c)?;
                    self.decref(c)?;
                }
                self.core().multis.free(m)
            }
            Suspension::Task(t) | Suspension::Children(t) => self.free_task(t),
            _ => self.core().free_prim(s),
        }
    }

    fn free_task(&self, h: TaskHandle) -> Result<(), SchedError> {
        let (hooks, body, result) = {
            let mut core = self.core();
            let t = core.task_mut(h)?;
            if t.in_queue {
                return Err(SchedError::StillQueued(t.name.clone()));
            }
            if matches!(t.state, TaskState::Running | TaskState::Paused) {
                return Err(core.invalid("free", h));
            }
            t.state = if t.pooled {
                TaskState::Freed
            } else {
                TaskState::Disposed
            };
            debug!(task = %t.name, state = ?t.state, "task released");
            let out = (
                std::mem::take(&mut t.hooks),
                t.body.take(),
                t.result.take(),
            );
            core.tasks.free(h)?;
            out
        };
        drop((hooks, body, result));
        Ok(())
    }

    /// Free `s` if nobody took a reference on it.
    pub(crate) fn discard(&self, s: Suspension) -> Result<(), SchedError> {
        let refs = self.core().refs(s)?;
        if refs == 0 {
            self.release_zero(s)?;
        }
        Ok(())
    }

    /// Take a reference on `s` so it outlives the task that waits on it.
    pub fn retain(&self, s: impl Into<Suspension>) -> Result<u32, SchedError> {
        self.core().incref(s.into())
    }

    /// Drop a reference taken with [`retain`](Self::retain).
    pub fn release(&self, s: impl Into<Suspension>) -> Result<(), SchedError> {
        self.decref(s.into())
    }

    pub fn refs(&self, s: impl Into<Suspension>) -> Result<u32, SchedError> {
        self.core().refs(s.into())
    }

    pub fn contains(&self, s: impl Into<Suspension>) -> bool {
        self.core().contains(s.into())
    }

    pub fn is_done(&self, s: impl Into<Suspension>) -> Result<bool, SchedError> {
        self.core().is_done(s.into())
    }

    pub fn is_timed_out(&self, s: impl Into<Suspension>) -> Result<bool, SchedError> {
        self.core().is_timed_out(s.into())
    }

    /// First child seen done by a `OneOf` wait.
    pub fn first_done(&self, s: Suspension) -> Result<Option<usize>, SchedError> {
        match s {
            Suspension::Multi(m) => Ok(self.core().multis.get(m)?.first_done()),
            _ => Ok(None),
        }
    }

    /// Children recorded when a `NumOf` wait latched.
    pub fn done_set(&self, s: Suspension) -> Result<Vec<usize>, SchedError> {
        match s {
            Suspension::Multi(m) => Ok(self.core().multis.get(m)?.done_set().to_vec()),
            _ => Ok(Vec::new()),
        }
    }

    /// Start a suspension outside any task, for hosts that poll it directly.
    pub fn arm(&self, s: Suspension, now: f64) -> Result<(), SchedError> {
        self.core().start_prim(s, now)
    }

    /// Update a suspension and report whether it is done. Hook and
    /// predicate errors are returned as-is.
    pub fn poll(&self, s: Suspension, now: f64) -> anyhow::Result<bool> {
        match self.update_suspension(s, now) {
            Ok(()) => {}
            Err(Fault::Task(e)) => return Err(e),
            Err(Fault::Sched(e)) => return Err(e.into()),
        }
        Ok(self.core().is_done(s)?)
    }

    // --- Queries ---

    pub fn task_state(&self, h: TaskHandle) -> Result<TaskState, SchedError> {
        self.core().task_state(h)
    }

    pub fn task_name(&self, h: TaskHandle) -> Result<String, SchedError> {
        match self.core().tasks.get(h) {
            Ok(t) => Ok(t.name.clone()),
            Err(e) => Err(e),
        }
    }

    pub fn is_alive(&self, h: TaskHandle) -> bool {
        self.task_state(h).is_ok_and(TaskState::is_alive)
    }

    pub fn current_of(&self, h: TaskHandle) -> Result<Option<Suspension>, SchedError> {
        Ok(self.core().task(h)?.current)
    }

    pub fn parent_of(&self, h: TaskHandle) -> Result<Option<TaskHandle>, SchedError> {
        Ok(self.core().task(h)?.parent)
    }

    pub fn live_children(&self, h: TaskHandle) -> Result<u32, SchedError> {
        Ok(self.core().task(h)?.live_children)
    }

    /// Whether the task was stopped by `stop_task` rather than finishing.
    pub fn was_stopped(&self, h: TaskHandle) -> Result<bool, SchedError> {
        Ok(self.core().task(h)?.manually_stopped)
    }

    /// Payload the task completed with. Readable until the task is freed.
    pub fn task_payload(&self, h: TaskHandle) -> Result<Option<Payload>, SchedError> {
        Ok(self.core().task(h)?.result.clone())
    }

    /// Typed view of [`task_payload`](Self::task_payload).
    pub fn task_result<T: Any>(&self, h: TaskHandle) -> Result<Option<Rc<T>>, SchedError> {
        Ok(self.task_payload(h)?.and_then(|p| p.downcast::<T>().ok()))
    }

    // --- Diagnostics ---

    /// The task first, then each ancestor.
    pub fn call_stack(&self, h: TaskHandle) -> Result<Vec<TaskInfo>, SchedError> {
        let core = self.core();
        let mut t = core.task(h)?;
        let mut out = vec![t.info()];
        while let Some(p) = t.parent {
            t = core.task(p)?;
            out.push(t.info());
        }
        Ok(out)
    }

    pub fn stack_trace(&self, h: TaskHandle) -> Result<String, SchedError> {
        Ok(render_stack(&self.call_stack(h)?))
    }

    /// The task whose code is executing right now.
    pub fn current_task(&self) -> Option<TaskHandle> {
        self.core().stack.last().copied()
    }

    /// Registered tasks, including those waiting for the next merge.
    pub fn active_count(&self) -> usize {
        let core = self.core();
        core.active.len() + core.staged.len()
    }

    pub fn pool_report(&self) -> Vec<PoolStats> {
        self.core().pool_stats()
    }

    /// Objects currently handed out across all pools. Zero when idle and
    /// nothing leaked.
    pub fn used_total(&self) -> usize {
        self.core().pool_stats().iter().map(|s| s.used).sum()
    }

    fn push_stack(&self, h: TaskHandle) {
        self.core().stack.push(h);
    }

    fn pop_stack(&self, h: TaskHandle) -> Result<(), SchedError> {
        let mut core = self.core();
        let top = core.stack.pop();
        if top == Some(h) {
            return Ok(());
        }
        Err(SchedError::ReentrancyMismatch {
            leaving: core.name_of(h),
            top: top.map(|t| core.name_of(t)),
        })
    }
}

//! Task bodies
//!
//! A body is a resumable step sequence: each call to [`TaskBody::resume`]
//! runs the task's code up to its next suspension and returns it, or reports
//! that the task is finished. Two adapters cover the common shapes:
//!
//! - [`from_fn`] wraps an explicit state machine closure.
//! - [`from_async`] wraps `async` code. The future is polled once per resume
//!   with a no-op waker; awaiting a [`Yield`] hands its suspension to the
//!   scheduler and parks the future until that suspension is done. Awaiting
//!   anything else that returns `Pending` is an unsupported suspension.

use crate::callback::OnDone;
use crate::condition::Condition;
use crate::error::SchedError;
use crate::event::Event;
use crate::primitive::{Payload, Suspension};
use crate::scheduler::{Scheduler, WeakScheduler};
use crate::task::{TaskHandle, TaskOptions};
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

/// Result of one resume.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    Yield(Suspension),
    Done,
}

impl From<Suspension> for Step {
    fn from(s: Suspension) -> Self {
        Step::Yield(s)
    }
}

pub trait TaskBody {
    /// Run until the next suspension. An error fails the task.
    fn resume(&mut self, cx: &TaskCx<'_>) -> anyhow::Result<Step>;
}

/// What a body sees while it runs.
pub struct TaskCx<'a> {
    sched: &'a Scheduler,
    task: TaskHandle,
    finished: Option<Suspension>,
    now: f64,
}

impl<'a> TaskCx<'a> {
    pub(crate) fn new(
        sched: &'a Scheduler,
        task: TaskHandle,
        finished: Option<Suspension>,
        now: f64,
    ) -> Self {
        Self {
            sched,
            task,
            finished,
            now,
        }
    }

    pub fn scheduler(&self) -> &'a Scheduler {
        self.sched
    }

    pub fn task(&self) -> TaskHandle {
        self.task
    }

    /// The suspension that just completed. `None` on the first resume.
    ///
    /// It stays valid for the duration of this resume, so its outcome
    /// (timeout, first-done child, ...) can still be queried.
    pub fn finished(&self) -> Option<Suspension> {
        self.finished
    }

    /// Current time on the task's clock.
    pub fn now(&self) -> f64 {
        self.now
    }
}

// --- Closure bodies ---

pub struct FnBody<F>(F);

impl<F> TaskBody for FnBody<F>
where
    F: FnMut(&TaskCx<'_>) -> anyhow::Result<Step>,
{
    fn resume(&mut self, cx: &TaskCx<'_>) -> anyhow::Result<Step> {
        (self.0)(cx)
    }
}

/// Body from a state machine closure.
pub fn from_fn<F>(f: F) -> FnBody<F>
where
    F: FnMut(&TaskCx<'_>) -> anyhow::Result<Step>,
{
    FnBody(f)
}

// --- Async bodies ---

type BoxFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>>>>;

/// Hand-off point between a [`Yield`] and the body polling it.
#[derive(Default)]
pub(crate) struct YieldSlot {
    pending: Cell<Option<Suspension>>,
    /// Offered while another suspension was already pending.
    rejected: RefCell<Vec<Suspension>>,
}

impl YieldSlot {
    fn offer(&self, s: Suspension) {
        if self.pending.get().is_some() {
            self.rejected.borrow_mut().push(s);
        } else {
            self.pending.set(Some(s));
        }
    }
}

/// Future that suspends the task on one suspension.
///
/// Resolves on the resume after the suspension is done.
#[must_use = "a suspension only takes effect when awaited"]
pub struct Yield {
    slot: Rc<YieldSlot>,
    suspension: Suspension,
    handed_off: bool,
}

impl Future for Yield {
    type Output = Result<(), SchedError>;

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.handed_off {
            return Poll::Ready(Ok(()));
        }
        self.slot.offer(self.suspension);
        self.handed_off = true;
        Poll::Pending
    }
}

pub struct AsyncBody {
    init: Option<Box<dyn FnOnce(Co) -> BoxFuture>>,
    fut: Option<BoxFuture>,
    slot: Rc<YieldSlot>,
}

/// Body from `async` code. The closure receives the task's [`Co`].
pub fn from_async<F, Fut>(f: F) -> AsyncBody
where
    F: FnOnce(Co) -> Fut + 'static,
    Fut: Future<Output = anyhow::Result<()>> + 'static,
{
    AsyncBody {
        init: Some(Box::new(move |co| Box::pin(f(co)))),
        fut: None,
        slot: Rc::new(YieldSlot::default()),
    }
}

impl TaskBody for AsyncBody {
    fn resume(&mut self, cx: &TaskCx<'_>) -> anyhow::Result<Step> {
        if let Some(init) = self.init.take() {
            let co = Co {
                sched: cx.scheduler().downgrade(),
                task: cx.task(),
                slot: self.slot.clone(),
            };
            self.fut = Some(init(co));
        }
        let Some(fut) = self.fut.as_mut() else {
            return Ok(Step::Done);
        };

        let mut pcx = Context::from_waker(Waker::noop());
        let poll = fut.as_mut().poll(&mut pcx);
        let pending = self.slot.pending.take();
        let rejected = std::mem::take(&mut *self.slot.rejected.borrow_mut());

        // Only a lone pending suspension is a valid hand-off.
        let handed = match (&poll, pending) {
            (Poll::Pending, Some(s)) if rejected.is_empty() => return Ok(Step::Yield(s)),
            (_, pending) => pending,
        };
        for s in handed.into_iter().chain(rejected) {
            cx.scheduler().discard(s)?;
        }
        match poll {
            Poll::Ready(result) => {
                self.fut = None;
                result.map(|()| Step::Done)
            }
            Poll::Pending => Err(SchedError::UnsupportedSuspension.into()),
        }
    }
}

/// Handle given to `async` bodies.
///
/// Holds the scheduler weakly; a body suspended in a dropped scheduler gets
/// [`SchedError::SchedulerDropped`] from every call.
#[derive(Clone)]
pub struct Co {
    sched: WeakScheduler,
    task: TaskHandle,
    slot: Rc<YieldSlot>,
}

impl Co {
    pub fn task(&self) -> TaskHandle {
        self.task
    }

    pub fn scheduler(&self) -> Result<Scheduler, SchedError> {
        self.sched.upgrade().ok_or(SchedError::SchedulerDropped)
    }

    pub fn now(&self) -> Result<f64, SchedError> {
        self.scheduler()?.task_time(self.task)
    }

    /// Suspend on `s`. Completes once `s` is done.
    pub fn suspend(&self, s: impl Into<Suspension>) -> Yield {
        Yield {
            slot: self.slot.clone(),
            suspension: s.into(),
            handed_off: false,
        }
    }

    pub async fn wait_time(&self, secs: f64) -> Result<(), SchedError> {
        let s = self.scheduler()?.wait_time(secs)?;
        self.suspend(s).await
    }

    /// Defer by exactly one tick.
    pub async fn frame(&self) -> Result<(), SchedError> {
        let s = self.scheduler()?.wait_frame()?;
        self.suspend(s).await
    }

    /// `true` if the condition held, `false` on timeout.
    pub async fn wait_until(
        &self,
        cond: impl Condition + 'static,
        timeout: f64,
    ) -> Result<bool, SchedError> {
        let s = self.scheduler()?.wait_until(cond, timeout)?;
        self.suspend(s).await?;
        Ok(!self.scheduler()?.is_timed_out(s)?)
    }

    /// The emitted value, or `None` on timeout.
    pub async fn wait_event<T: Clone + 'static>(
        &self,
        event: &Event<T>,
        timeout: f64,
    ) -> Result<Option<T>, SchedError> {
        let s = self.scheduler()?.wait_event(event, timeout)?;
        self.suspend(s).await?;
        if self.scheduler()?.is_timed_out(s)? {
            Ok(None)
        } else {
            Ok(event.data())
        }
    }

    pub async fn wait_all(&self, children: Vec<Suspension>) -> Result<(), SchedError> {
        let s = self.scheduler()?.wait_all(children)?;
        self.suspend(s).await
    }

    /// Index of the first child seen done. `None` only if the wait was
    /// released without finishing, which cannot happen to an awaited wait.
    pub async fn wait_one_of(&self, children: Vec<Suspension>) -> Result<Option<usize>, SchedError> {
        let s = self.scheduler()?.wait_one_of(children)?;
        self.suspend(s).await?;
        self.scheduler()?.first_done(s)
    }

    /// Indices of the children done when `n` was first reached.
    pub async fn wait_num_of(
        &self,
        n: i64,
        children: Vec<Suspension>,
    ) -> Result<Vec<usize>, SchedError> {
        let s = self.scheduler()?.wait_num_of(n, children)?;
        self.suspend(s).await?;
        self.scheduler()?.done_set(s)
    }

    /// Wait for `task` to stop. Returns its payload if it completed with one.
    pub async fn join(&self, task: TaskHandle) -> Result<Option<Payload>, SchedError> {
        self.suspend(Suspension::Task(task)).await?;
        self.scheduler()?.task_payload(task)
    }

    /// Wait until every task started from this one has stopped.
    pub async fn join_children(&self) -> Result<(), SchedError> {
        let s = self.scheduler()?.join_children(self.task)?;
        self.suspend(s).await
    }

    /// Complete the task with `value`. The body is not resumed again.
    pub async fn ret<T: Any>(&self, value: T) -> Result<(), SchedError> {
        let s = self.scheduler()?.ret(value)?;
        self.suspend(s).await
    }

    /// Start a child task.
    pub fn start<B: TaskBody + 'static>(
        &self,
        body: B,
        opts: TaskOptions,
    ) -> Result<TaskHandle, SchedError> {
        self.scheduler()?.start_task(body, opts)
    }

    /// Start an `async` child task.
    pub fn spawn<F, Fut>(&self, name: &str, f: F) -> Result<TaskHandle, SchedError>
    where
        F: FnOnce(Co) -> Fut + 'static,
        Fut: Future<Output = anyhow::Result<()>> + 'static,
    {
        self.start(from_async(f), TaskOptions::named(name))
    }

    pub async fn call1<P1, R, F>(&self, f: F, p1: P1) -> Result<R, SchedError>
    where
        F: FnOnce(P1, OnDone<R>),
        R: 'static,
    {
        let wait = self.scheduler()?.call1(f, p1)?;
        self.suspend(wait.suspension()).await?;
        wait.take().ok_or(SchedError::CallbackEmpty)
    }

    pub async fn call2<P1, P2, R, F>(&self, f: F, p1: P1, p2: P2) -> Result<R, SchedError>
    where
        F: FnOnce(P1, P2, OnDone<R>),
        R: 'static,
    {
        let wait = self.scheduler()?.call2(f, p1, p2)?;
        self.suspend(wait.suspension()).await?;
        wait.take().ok_or(SchedError::CallbackEmpty)
    }

    pub async fn call3<P1, P2, P3, R, F>(
        &self,
        f: F,
        p1: P1,
        p2: P2,
        p3: P3,
    ) -> Result<R, SchedError>
    where
        F: FnOnce(P1, P2, P3, OnDone<R>),
        R: 'static,
    {
        let wait = self.scheduler()?.call3(f, p1, p2, p3)?;
        self.suspend(wait.suspension()).await?;
        wait.take().ok_or(SchedError::CallbackEmpty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskState;
    use std::cell::RefCell;

    #[test]
    fn test_fn_body_steps_through_states() {
        let sched = Scheduler::default();
        let log = Rc::new(RefCell::new(Vec::new()));
        let l = log.clone();
        let mut stage = 0;
        let task = sched
            .start_task(
                from_fn(move |cx| {
                    stage += 1;
                    l.borrow_mut().push((stage, cx.finished().is_some()));
                    match stage {
                        1 => Ok(cx.scheduler().wait_frame()?.into()),
                        _ => Ok(Step::Done),
                    }
                }),
                TaskOptions::named("fsm"),
            )
            .unwrap();

        assert_eq!(*log.borrow(), vec![(1, false)]);
        sched.tick(0.0, 0.0).unwrap();
        assert_eq!(*log.borrow(), vec![(1, false), (2, true)]);
        // Completed during the tick, so it was swept and pooled again.
        assert_eq!(sched.task_state(task).unwrap(), TaskState::Freed);
    }

    #[test]
    fn test_async_body_yields_and_resumes() {
        let sched = Scheduler::default();
        let log = Rc::new(RefCell::new(Vec::new()));
        let l = log.clone();
        sched
            .spawn("async", move |co| async move {
                l.borrow_mut().push(co.now()?);
                co.wait_time(1.0).await?;
                l.borrow_mut().push(co.now()?);
                Ok(())
            })
            .unwrap();

        for t in [0.5, 1.0, 1.5] {
            sched.tick(t, t).unwrap();
        }
        assert_eq!(*log.borrow(), vec![0.0, 1.0]);
        assert_eq!(sched.active_count(), 0);
    }

    #[test]
    fn test_foreign_pending_is_unsupported() {
        let sched = Scheduler::default();
        let seen = Rc::new(RefCell::new(None));
        let s = seen.clone();
        let task = sched
            .start_task(
                from_async(|_co| async move {
                    std::future::pending::<()>().await;
                    Ok(())
                }),
                TaskOptions::named("bad").on_exception(move |_, _, e| {
                    *s.borrow_mut() = e.downcast_ref::<SchedError>().map(|e| e.to_string());
                }),
            )
            .unwrap();
        assert_eq!(sched.task_state(task).unwrap(), TaskState::Stopped);
        assert_eq!(
            seen.borrow().as_deref(),
            Some(SchedError::UnsupportedSuspension.to_string().as_str())
        );
    }

    #[test]
    fn test_two_concurrent_yields_conflict() {
        let sched = Scheduler::default();
        let failed = Rc::new(Cell::new(false));
        let f = failed.clone();
        sched
            .start_task(
                from_async(|co| async move {
                    let a = co.suspend(co.scheduler()?.wait_frame()?);
                    let b = co.suspend(co.scheduler()?.wait_frame()?);
                    let mut a = Box::pin(a);
                    let mut b = Box::pin(b);
                    std::future::poll_fn(|cx| {
                        let _ = a.as_mut().poll(cx);
                        let _ = b.as_mut().poll(cx);
                        Poll::<()>::Pending
                    })
                    .await;
                    Ok(())
                }),
                TaskOptions::named("conflict").on_exception(move |_, _, _| f.set(true)),
            )
            .unwrap();
        assert!(failed.get());
        sched.tick(0.0, 0.0).unwrap();
        assert_eq!(sched.used_total(), 0);
    }
}

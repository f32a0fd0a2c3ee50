//! Wait factories and start sugar
//!
//! Every factory takes a primitive from its pool and hands back the
//! [`Suspension`] with no references on it. Yield it from a body, attach it
//! to a combinator, or [`retain`](Scheduler::retain) it; the holder's
//! reference decides when the slot goes back to the pool.

use crate::body::{from_async, Co, Step, TaskBody, TaskCx};
use crate::callback::{CallbackSlot, CallbackWait, OnDone};
use crate::condition::{self, Condition, SharedCondition};
use crate::error::SchedError;
use crate::event::Event;
use crate::multi::MultiMode;
use crate::primitive::{Suspension, UpdateFn};
use crate::scheduler::Scheduler;
use crate::task::{TaskHandle, TaskOptions};
use std::any::Any;
use std::future::Future;
use std::rc::Rc;

impl Scheduler {
    // --- Leaf waits ---

    /// Done once `secs` of task time have elapsed since the wait started.
    pub fn wait_time(&self, secs: f64) -> Result<Suspension, SchedError> {
        let mut core = self.core();
        let h = core.times.acquire()?;
        core.times.get_mut(h)?.arm(secs);
        Ok(Suspension::Time(h))
    }

    /// Done after one tick.
    pub fn wait_frame(&self) -> Result<Suspension, SchedError> {
        let h = self.core().frames.acquire()?;
        Ok(Suspension::Frame(h))
    }

    /// Done when `cond` holds or `timeout` elapses. Use `f64::INFINITY` for
    /// no timeout.
    pub fn wait_until(
        &self,
        cond: impl Condition + 'static,
        timeout: f64,
    ) -> Result<Suspension, SchedError> {
        self.wait_until_with(cond, timeout, None)
    }

    /// [`wait_until`](Self::wait_until) with a hook run every tick before the
    /// condition is checked.
    pub fn wait_until_with(
        &self,
        cond: impl Condition + 'static,
        timeout: f64,
        hook: Option<UpdateFn>,
    ) -> Result<Suspension, SchedError> {
        let mut core = self.core();
        let h = core.untils.acquire()?;
        core.untils
            .get_mut(h)?
            .arm(condition::shared(cond), timeout, hook);
        Ok(Suspension::Until(h))
    }

    pub fn wait_until_all(
        &self,
        conds: Vec<SharedCondition>,
        timeout: f64,
    ) -> Result<Suspension, SchedError> {
        self.wait_until(condition::all(conds), timeout)
    }

    pub fn wait_until_any(
        &self,
        conds: Vec<SharedCondition>,
        timeout: f64,
    ) -> Result<Suspension, SchedError> {
        self.wait_until(condition::any(conds), timeout)
    }

    pub fn wait_until_num_of(
        &self,
        n: usize,
        conds: Vec<SharedCondition>,
        timeout: f64,
    ) -> Result<Suspension, SchedError> {
        self.wait_until(condition::at_least(n, conds), timeout)
    }

    /// Done when `event` is emitted or `timeout` elapses. The subscription is
    /// dropped on timeout, stop and release.
    pub fn wait_event<T: 'static>(
        &self,
        event: &Event<T>,
        timeout: f64,
    ) -> Result<Suspension, SchedError> {
        self.wait_event_with(event, timeout, None)
    }

    pub fn wait_event_with<T: 'static>(
        &self,
        event: &Event<T>,
        timeout: f64,
        hook: Option<UpdateFn>,
    ) -> Result<Suspension, SchedError> {
        let mut core = self.core();
        let h = core.events.acquire()?;
        core.events.get_mut(h)?.arm(event.subscribe(), timeout, hook);
        Ok(Suspension::Event(h))
    }

    /// Return marker: the yielding task completes with `value`.
    pub fn ret<T: Any>(&self, value: T) -> Result<Suspension, SchedError> {
        let mut core = self.core();
        let h = core.returns.acquire()?;
        core.returns.get_mut(h)?.payload = Some(Rc::new(value));
        Ok(Suspension::Return(h))
    }

    /// Done once `task` has no live children.
    pub fn join_children(&self, task: TaskHandle) -> Result<Suspension, SchedError> {
        self.core().task(task)?;
        Ok(Suspension::Children(task))
    }

    // --- Combinators ---

    /// Takes one reference on each child. Children that are tasks are
    /// stopped when the combinator is released.
    pub fn wait_multi(
        &self,
        mode: MultiMode,
        children: Vec<Suspension>,
    ) -> Result<Suspension, SchedError> {
        let mut core = self.core();
        for c in &children {
            core.refs(*c)?;
        }
        let h = core.multis.acquire()?;
        for c in &children {
            core.incref(*c)?;
        }
        core.multis.get_mut(h)?.attach(mode, children);
        Ok(Suspension::Multi(h))
    }

    pub fn wait_all(&self, children: Vec<Suspension>) -> Result<Suspension, SchedError> {
        self.wait_multi(MultiMode::All, children)
    }

    /// Query the winner with [`first_done`](Self::first_done).
    pub fn wait_one_of(&self, children: Vec<Suspension>) -> Result<Suspension, SchedError> {
        self.wait_multi(MultiMode::OneOf, children)
    }

    /// Query the latched set with [`done_set`](Self::done_set).
    pub fn wait_num_of(
        &self,
        n: i64,
        children: Vec<Suspension>,
    ) -> Result<Suspension, SchedError> {
        self.wait_multi(MultiMode::NumOf(n), children)
    }

    // --- Callback adapters ---

    /// A wait completed by the returned [`OnDone`]. `hook` runs every tick
    /// while the task waits.
    pub fn callback<R: 'static>(
        &self,
        hook: Option<UpdateFn>,
    ) -> Result<(CallbackWait<R>, OnDone<R>), SchedError> {
        let slot = CallbackSlot::new();
        let h = {
            let mut core = self.core();
            let h = core.callbacks.acquire()?;
            let w = core.callbacks.get_mut(h)?;
            w.done = Some(slot.done.clone());
            w.hook = hook;
            h
        };
        Ok((
            CallbackWait::new(Suspension::Callback(h), slot.clone()),
            OnDone::new(slot),
        ))
    }

    /// Call `f(p1, on_done)` now and return something to wait on.
    pub fn call1<P1, R, F>(&self, f: F, p1: P1) -> Result<CallbackWait<R>, SchedError>
    where
        F: FnOnce(P1, OnDone<R>),
        R: 'static,
    {
        let (wait, on_done) = self.callback(None)?;
        f(p1, on_done);
        Ok(wait)
    }

    pub fn call2<P1, P2, R, F>(&self, f: F, p1: P1, p2: P2) -> Result<CallbackWait<R>, SchedError>
    where
        F: FnOnce(P1, P2, OnDone<R>),
        R: 'static,
    {
        let (wait, on_done) = self.callback(None)?;
        f(p1, p2, on_done);
        Ok(wait)
    }

    pub fn call3<P1, P2, P3, R, F>(
        &self,
        f: F,
        p1: P1,
        p2: P2,
        p3: P3,
    ) -> Result<CallbackWait<R>, SchedError>
    where
        F: FnOnce(P1, P2, P3, OnDone<R>),
        R: 'static,
    {
        let (wait, on_done) = self.callback(None)?;
        f(p1, p2, p3, on_done);
        Ok(wait)
    }

    // --- Start sugar ---

    /// Start an anonymous pooled task.
    pub fn start<B: TaskBody + 'static>(&self, body: B) -> Result<TaskHandle, SchedError> {
        self.start_task(body, TaskOptions::default())
    }

    /// Start a named `async` task.
    pub fn spawn<F, Fut>(&self, name: &str, f: F) -> Result<TaskHandle, SchedError>
    where
        F: FnOnce(Co) -> Fut + 'static,
        Fut: Future<Output = anyhow::Result<()>> + 'static,
    {
        self.start_task(from_async(f), TaskOptions::named(name))
    }

    pub fn spawn_with<F, Fut>(&self, opts: TaskOptions, f: F) -> Result<TaskHandle, SchedError>
    where
        F: FnOnce(Co) -> Fut + 'static,
        Fut: Future<Output = anyhow::Result<()>> + 'static,
    {
        self.start_task(from_async(f), opts)
    }

    /// Call `handler(i)` at `start + i * interval` for `i` in `1..=count`,
    /// then complete. A negative `count` repeats until the task is stopped.
    pub fn repeat<F>(&self, count: i64, interval: f64, handler: F) -> Result<TaskHandle, SchedError>
    where
        F: FnMut(&TaskCx<'_>, u64) -> anyhow::Result<()> + 'static,
    {
        self.start_task(
            RepeatBody::new(count, interval, handler),
            TaskOptions::named("repeat"),
        )
    }
}

/// Fires on a fixed grid anchored at the first resume. Each wait is armed
/// for the time left until the next due instant.
pub struct RepeatBody<F> {
    count: i64,
    interval: f64,
    handler: F,
    origin: f64,
    fired: u64,
}

impl<F> RepeatBody<F> {
    pub fn new(count: i64, interval: f64, handler: F) -> Self {
        Self {
            count,
            interval: interval.max(0.0),
            handler,
            origin: 0.0,
            fired: 0,
        }
    }

    fn next_wait(&self, cx: &TaskCx<'_>) -> anyhow::Result<Step> {
        let due = self.origin + (self.fired + 1) as f64 * self.interval;
        Ok(cx.scheduler().wait_time(due - cx.now())?.into())
    }
}

impl<F> TaskBody for RepeatBody<F>
where
    F: FnMut(&TaskCx<'_>, u64) -> anyhow::Result<()>,
{
    fn resume(&mut self, cx: &TaskCx<'_>) -> anyhow::Result<Step> {
        if cx.finished().is_none() {
            if self.count == 0 {
                return Ok(Step::Done);
            }
            self.origin = cx.now();
            return self.next_wait(cx);
        }
        self.fired += 1;
        (self.handler)(cx, self.fired)?;
        if self.count >= 0 && self.fired >= self.count as u64 {
            return Ok(Step::Done);
        }
        self.next_wait(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::from_fn;
    use crate::task::TaskState;
    use std::cell::{Cell, RefCell};

    fn ticks(sched: &Scheduler, times: &[f64]) {
        for t in times {
            sched.tick(*t, *t).unwrap();
        }
    }

    #[test]
    fn test_factories_start_with_no_refs() {
        let sched = Scheduler::default();
        let ev: Event<()> = Event::new();
        let all = [
            sched.wait_time(1.0).unwrap(),
            sched.wait_frame().unwrap(),
            sched.wait_until(|| true, f64::INFINITY).unwrap(),
            sched.wait_event(&ev, 1.0).unwrap(),
            sched.ret(5_u8).unwrap(),
        ];
        for s in all {
            assert_eq!(sched.refs(s).unwrap(), 0);
            sched.retain(s).unwrap();
            sched.release(s).unwrap();
            assert!(!sched.contains(s));
        }
        assert_eq!(ev.subscriber_count(), 0);
        assert_eq!(sched.used_total(), 0);
    }

    #[test]
    fn test_multi_rejects_stale_child() {
        let sched = Scheduler::default();
        let s = sched.wait_frame().unwrap();
        sched.retain(s).unwrap();
        sched.release(s).unwrap();
        assert!(matches!(
            sched.wait_all(vec![s]),
            Err(SchedError::StaleHandle { .. })
        ));
        assert_eq!(sched.used_total(), 0);
    }

    #[test]
    fn test_multi_release_frees_children() {
        let sched = Scheduler::default();
        let a = sched.wait_time(1.0).unwrap();
        let b = sched.wait_frame().unwrap();
        let m = sched.wait_one_of(vec![a, b]).unwrap();
        assert_eq!(sched.refs(a).unwrap(), 1);
        sched.retain(m).unwrap();
        sched.release(m).unwrap();
        assert!(!sched.contains(a));
        assert!(!sched.contains(b));
        assert_eq!(sched.used_total(), 0);
    }

    #[test]
    fn test_callback_completes_wait() {
        let sched = Scheduler::default();
        let pending: Rc<RefCell<Option<OnDone<String>>>> = Rc::new(RefCell::new(None));
        let p = pending.clone();
        let got = Rc::new(RefCell::new(None));
        let g = got.clone();
        let rpc = move |req: &str, done: OnDone<String>| {
            assert_eq!(req, "ping");
            *p.borrow_mut() = Some(done);
        };
        sched
            .spawn("rpc", move |co| async move {
                let reply = co.call1(rpc, "ping").await?;
                *g.borrow_mut() = Some(reply);
                Ok(())
            })
            .unwrap();

        sched.tick(0.1, 0.1).unwrap();
        assert!(got.borrow().is_none());
        if let Some(done) = pending.borrow_mut().take() {
            done.done("pong".to_string());
        }
        sched.tick(0.2, 0.2).unwrap();
        assert_eq!(got.borrow().as_deref(), Some("pong"));
        assert_eq!(sched.used_total(), 0);
    }

    #[test]
    fn test_callback_hook_runs_each_tick() {
        let sched = Scheduler::default();
        let polls = Rc::new(Cell::new(0));
        let p = polls.clone();
        let (wait, on_done) = sched
            .callback::<u32>(Some(Rc::new(move || {
                p.set(p.get() + 1);
                Ok(())
            })))
            .unwrap();
        let s = wait.suspension();
        sched
            .start(from_fn(move |cx| match cx.finished() {
                None => Ok(s.into()),
                Some(_) => Ok(Step::Done),
            }))
            .unwrap();
        ticks(&sched, &[0.1, 0.2]);
        assert_eq!(polls.get(), 2);
        on_done.done(9);
        ticks(&sched, &[0.3]);
        assert_eq!(wait.take(), Some(9));
        assert_eq!(sched.active_count(), 0);
    }

    #[test]
    fn test_repeat_fires_on_grid() {
        let sched = Scheduler::default();
        let fired = Rc::new(RefCell::new(Vec::new()));
        let f = fired.clone();
        let h = sched
            .repeat(3, 1.0, move |cx, i| {
                f.borrow_mut().push((i, cx.now()));
                Ok(())
            })
            .unwrap();
        ticks(&sched, &[0.5, 1.0, 1.5, 2.0, 2.5, 3.0, 3.5, 4.0]);
        assert_eq!(*fired.borrow(), vec![(1, 1.0), (2, 2.0), (3, 3.0)]);
        assert!(sched.task_state(h).unwrap().is_finished());
    }

    #[test]
    fn test_repeat_does_not_drift_with_coarse_ticks() {
        let sched = Scheduler::default();
        let fired = Rc::new(RefCell::new(Vec::new()));
        let f = fired.clone();
        sched
            .repeat(-1, 1.0, move |cx, _| {
                f.borrow_mut().push(cx.now());
                Ok(())
            })
            .unwrap();
        ticks(&sched, &[1.25, 2.0, 3.5, 4.0]);
        assert_eq!(*fired.borrow(), vec![1.25, 2.0, 3.5, 4.0]);
    }

    #[test]
    fn test_repeat_zero_completes_at_start() {
        let sched = Scheduler::default();
        let h = sched.repeat(0, 1.0, |_, _| Ok(())).unwrap();
        assert_eq!(sched.task_state(h).unwrap(), TaskState::Stopped);
    }
}

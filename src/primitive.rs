//! Suspension primitives
//!
//! A task suspends by yielding a [`Suspension`]: a generation-checked handle
//! to a pooled primitive, or to another task. The set of variants is closed,
//! so a body cannot yield something the scheduler does not know how to
//! drive.
//!
//! The leaf primitives are plain data implementing [`Primitive`]. They never
//! read a clock or call user code themselves; the scheduler feeds them the
//! current time and evaluates predicates and hooks around them.

use crate::callback::WaitCallback;
use crate::clock::Deadline;
use crate::condition::SharedCondition;
use crate::event::Subscription;
use crate::multi::WaitMulti;
use crate::pool::{Handle, Poolable};
use crate::task::TaskHandle;
use std::any::Any;
use std::rc::Rc;

/// Value carried by the return marker and stored on a completed task.
pub type Payload = Rc<dyn Any>;

/// Per-tick hook attached to a wait. An error fails the waiting task.
pub type UpdateFn = Rc<dyn Fn() -> anyhow::Result<()>>;

/// How the task driver treats a suspension.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SuspensionKind {
    Ordinary,
    /// Completes the task with a payload instead of being polled.
    ReturnValue,
    /// Another task; done when that task stops.
    Task,
}

/// Everything a task body can suspend on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Suspension {
    Time(Handle<WaitTime>),
    Until(Handle<WaitUntil>),
    Event(Handle<WaitEvent>),
    Frame(Handle<WaitFrame>),
    Return(Handle<ReturnValue>),
    Callback(Handle<WaitCallback>),
    Multi(Handle<WaitMulti>),
    Task(TaskHandle),
    /// Done once the task has no live children.
    Children(TaskHandle),
}

impl Suspension {
    pub fn kind(&self) -> SuspensionKind {
        match self {
            Suspension::Return(_) => SuspensionKind::ReturnValue,
            Suspension::Task(_) => SuspensionKind::Task,
            _ => SuspensionKind::Ordinary,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Suspension::Time(_) => WaitTime::KIND,
            Suspension::Until(_) => WaitUntil::KIND,
            Suspension::Event(_) => WaitEvent::KIND,
            Suspension::Frame(_) => WaitFrame::KIND,
            Suspension::Return(_) => ReturnValue::KIND,
            Suspension::Callback(_) => WaitCallback::KIND,
            Suspension::Multi(_) => WaitMulti::KIND,
            Suspension::Task(_) => "task",
            Suspension::Children(_) => "children",
        }
    }
}

impl From<TaskHandle> for Suspension {
    fn from(task: TaskHandle) -> Self {
        Suspension::Task(task)
    }
}

/// The pollable contract shared by every primitive.
///
/// Defaults describe a primitive that is done immediately and ignores time.
pub trait Primitive {
    fn start(&mut self, _now: f64) {}
    fn update(&mut self, _now: f64) {}
    fn pause(&mut self, _now: f64) {}
    fn resume(&mut self, _now: f64) {}
    fn stop(&mut self) {}

    fn is_done(&self) -> bool {
        true
    }

    /// Done because time ran out rather than because the awaited thing
    /// happened.
    fn is_timed_out(&self) -> bool {
        false
    }

    fn kind(&self) -> SuspensionKind {
        SuspensionKind::Ordinary
    }
}

// --- Wait for time ---

#[derive(Debug, Default)]
pub struct WaitTime {
    pub(crate) deadline: Deadline,
}

impl WaitTime {
    pub(crate) fn arm(&mut self, secs: f64) {
        self.deadline = Deadline::new(secs);
    }
}

impl Poolable for WaitTime {
    const KIND: &'static str = "wait_time";

    fn reset(&mut self) {
        self.deadline = Deadline::default();
    }
}

impl Primitive for WaitTime {
    fn start(&mut self, now: f64) {
        self.deadline.start(now);
    }

    fn update(&mut self, now: f64) {
        self.deadline.update(now);
    }

    fn pause(&mut self, now: f64) {
        self.deadline.pause(now);
    }

    fn resume(&mut self, now: f64) {
        self.deadline.resume(now);
    }

    fn is_done(&self) -> bool {
        self.deadline.expired()
    }
}

// --- Wait for a predicate ---

#[derive(Default)]
pub struct WaitUntil {
    pub(crate) cond: Option<SharedCondition>,
    pub(crate) hook: Option<UpdateFn>,
    pub(crate) deadline: Deadline,
    pub(crate) met: bool,
}

impl WaitUntil {
    pub(crate) fn arm(&mut self, cond: SharedCondition, timeout: f64, hook: Option<UpdateFn>) {
        self.cond = Some(cond);
        self.hook = hook;
        self.deadline = Deadline::new(timeout);
        self.met = false;
    }
}

impl Poolable for WaitUntil {
    const KIND: &'static str = "wait_until";

    fn reset(&mut self) {
        self.cond = None;
        self.hook = None;
        self.deadline = Deadline::default();
        self.met = false;
    }
}

impl Primitive for WaitUntil {
    fn start(&mut self, now: f64) {
        self.deadline.start(now);
    }

    fn update(&mut self, now: f64) {
        self.deadline.update(now);
    }

    fn pause(&mut self, now: f64) {
        self.deadline.pause(now);
    }

    fn resume(&mut self, now: f64) {
        self.deadline.resume(now);
    }

    fn is_done(&self) -> bool {
        self.met || self.deadline.expired()
    }

    fn is_timed_out(&self) -> bool {
        !self.met && self.deadline.expired()
    }
}

// --- Wait for an event ---

#[derive(Default)]
pub struct WaitEvent {
    pub(crate) sub: Option<Subscription>,
    pub(crate) hook: Option<UpdateFn>,
    pub(crate) deadline: Deadline,
}

impl WaitEvent {
    pub(crate) fn arm(&mut self, sub: Subscription, timeout: f64, hook: Option<UpdateFn>) {
        self.sub = Some(sub);
        self.hook = hook;
        self.deadline = Deadline::new(timeout);
    }

    pub(crate) fn fired(&self) -> bool {
        self.sub.as_ref().is_some_and(|s| s.fired.get())
    }

    fn unsubscribe(&self) {
        if let Some(sub) = &self.sub {
            sub.cancel();
        }
    }
}

impl Poolable for WaitEvent {
    const KIND: &'static str = "wait_event";

    fn reset(&mut self) {
        self.unsubscribe();
        self.sub = None;
        self.hook = None;
        self.deadline = Deadline::default();
    }
}

impl Primitive for WaitEvent {
    fn start(&mut self, now: f64) {
        self.deadline.start(now);
    }

    fn update(&mut self, now: f64) {
        self.deadline.update(now);
        if self.deadline.expired() && !self.fired() {
            self.unsubscribe();
        }
    }

    fn pause(&mut self, now: f64) {
        self.deadline.pause(now);
    }

    fn resume(&mut self, now: f64) {
        self.deadline.resume(now);
    }

    fn stop(&mut self) {
        self.unsubscribe();
    }

    fn is_done(&self) -> bool {
        self.fired() || self.deadline.expired()
    }

    fn is_timed_out(&self) -> bool {
        !self.fired() && self.deadline.expired()
    }
}

// --- Wait one tick ---

#[derive(Debug, Default)]
pub struct WaitFrame {
    updates: u32,
}

impl Poolable for WaitFrame {
    const KIND: &'static str = "wait_frame";

    fn reset(&mut self) {
        self.updates = 0;
    }
}

impl Primitive for WaitFrame {
    fn start(&mut self, _now: f64) {
        self.updates = 0;
    }

    fn update(&mut self, _now: f64) {
        self.updates += 1;
    }

    fn is_done(&self) -> bool {
        self.updates > 0
    }
}

// --- Return marker ---

#[derive(Default)]
pub struct ReturnValue {
    pub(crate) payload: Option<Payload>,
}

impl Poolable for ReturnValue {
    const KIND: &'static str = "return_value";

    fn reset(&mut self) {
        self.payload = None;
    }
}

impl Primitive for ReturnValue {
    fn kind(&self) -> SuspensionKind {
        SuspensionKind::ReturnValue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;
    use std::cell::Cell;

    #[test]
    fn test_wait_time_not_done_before_timeout() {
        let mut w = WaitTime::default();
        w.arm(1.0);
        assert!(!w.is_done());
        w.start(2.0);
        for t in [2.0, 2.5, 2.999] {
            w.update(t);
            assert!(!w.is_done());
        }
        w.update(3.0);
        assert!(w.is_done());
        assert!(!w.is_timed_out());
    }

    #[test]
    fn test_wait_time_pause_resume_keeps_armed_duration() {
        let mut w = WaitTime::default();
        w.arm(1.0);
        w.start(0.0);
        w.update(0.5);
        w.pause(0.5);
        w.resume(3.5);
        w.update(3.9);
        assert!(!w.is_done());
        w.update(4.0);
        assert!(w.is_done());
    }

    #[test]
    fn test_wait_until_distinguishes_met_from_timeout() {
        let mut w = WaitUntil::default();
        w.arm(crate::condition::shared(|| false), 1.0, None);
        w.start(0.0);
        w.update(0.5);
        assert!(!w.is_done());
        w.met = true;
        assert!(w.is_done());
        assert!(!w.is_timed_out());

        w.met = false;
        w.update(1.0);
        assert!(w.is_done());
        assert!(w.is_timed_out());
    }

    #[test]
    fn test_wait_event_unsubscribes_on_timeout() {
        let ev: Event<u32> = Event::new();
        let mut w = WaitEvent::default();
        w.arm(ev.subscribe(), 0.5, None);
        w.start(0.0);
        w.update(0.25);
        assert_eq!(ev.subscriber_count(), 1);
        w.update(0.5);
        assert!(w.is_done());
        assert!(w.is_timed_out());
        assert_eq!(ev.subscriber_count(), 0);
    }

    #[test]
    fn test_wait_event_fires() {
        let ev: Event<u32> = Event::new();
        let mut w = WaitEvent::default();
        w.arm(ev.subscribe(), f64::INFINITY, None);
        w.start(0.0);
        ev.emit(3);
        w.update(0.1);
        assert!(w.is_done());
        assert!(!w.is_timed_out());
    }

    #[test]
    fn test_wait_event_stop_and_reset_unsubscribe() {
        let ev: Event<()> = Event::new();
        let mut w = WaitEvent::default();
        w.arm(ev.subscribe(), 1.0, None);
        w.stop();
        assert_eq!(ev.subscriber_count(), 0);

        let hits = Rc::new(Cell::new(0));
        let h = hits.clone();
        w.arm(
            ev.subscribe(),
            1.0,
            Some(Rc::new(move || {
                h.set(h.get() + 1);
                Ok(())
            })),
        );
        w.reset();
        assert_eq!(ev.subscriber_count(), 0);
        assert!(w.hook.is_none());
        assert_eq!(hits.get(), 0);
    }

    #[test]
    fn test_wait_frame_done_after_one_update() {
        let mut w = WaitFrame::default();
        w.start(0.0);
        assert!(!w.is_done());
        w.update(0.0);
        assert!(w.is_done());
    }

    #[test]
    fn test_suspension_kinds() {
        let r: Handle<ReturnValue> = {
            let mut pool = crate::pool::Pool::new(crate::config::PoolConfig::new(1));
            pool.acquire().unwrap()
        };
        assert_eq!(Suspension::Return(r).kind(), SuspensionKind::ReturnValue);
        assert_eq!(ReturnValue::default().kind(), SuspensionKind::ReturnValue);
        assert!(ReturnValue::default().is_done());
    }
}

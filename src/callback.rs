//! Callback adapters: turn a push-style `f(params..., on_done)` call into
//! something a task can wait on.
//!
//! The pooled [`WaitCallback`] only tracks the shared done flag and an
//! optional per-tick hook. The typed result travels in a slot shared by the
//! caller-side [`CallbackWait`] and the [`OnDone`] handed to `f`.

use crate::pool::Poolable;
use crate::primitive::{Primitive, Suspension, UpdateFn};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

#[derive(Default)]
pub struct WaitCallback {
    pub(crate) done: Option<Rc<Cell<bool>>>,
    pub(crate) hook: Option<UpdateFn>,
}

impl Poolable for WaitCallback {
    const KIND: &'static str = "wait_callback";

    fn reset(&mut self) {
        self.done = None;
        self.hook = None;
    }
}

impl Primitive for WaitCallback {
    fn is_done(&self) -> bool {
        self.done.as_ref().is_some_and(|d| d.get())
    }
}

pub(crate) struct CallbackSlot<R> {
    pub(crate) done: Rc<Cell<bool>>,
    value: RefCell<Option<R>>,
}

impl<R> CallbackSlot<R> {
    pub(crate) fn new() -> Rc<Self> {
        Rc::new(Self {
            done: Rc::new(Cell::new(false)),
            value: RefCell::new(None),
        })
    }
}

/// Completion handle given to the wrapped call.
pub struct OnDone<R> {
    slot: Rc<CallbackSlot<R>>,
}

impl<R> OnDone<R> {
    pub(crate) fn new(slot: Rc<CallbackSlot<R>>) -> Self {
        Self { slot }
    }

    /// Deliver the result. The waiting task sees it on its next tick.
    pub fn done(self, value: R) {
        *self.slot.value.borrow_mut() = Some(value);
        self.slot.done.set(true);
    }
}

impl<A, B> OnDone<(A, B)> {
    /// Two-value form.
    pub fn done2(self, a: A, b: B) {
        self.done((a, b));
    }
}

impl<R> fmt::Debug for OnDone<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OnDone")
            .field("done", &self.slot.done.get())
            .finish()
    }
}

/// Caller side of a callback adapter.
pub struct CallbackWait<R> {
    suspension: Suspension,
    slot: Rc<CallbackSlot<R>>,
}

impl<R> Clone for CallbackWait<R> {
    fn clone(&self) -> Self {
        Self {
            suspension: self.suspension,
            slot: self.slot.clone(),
        }
    }
}

impl<R> CallbackWait<R> {
    pub(crate) fn new(suspension: Suspension, slot: Rc<CallbackSlot<R>>) -> Self {
        Self { suspension, slot }
    }

    pub fn suspension(&self) -> Suspension {
        self.suspension
    }

    pub fn is_done(&self) -> bool {
        self.slot.done.get()
    }

    /// Take the delivered result, if any.
    pub fn take(&self) -> Option<R> {
        self.slot.value.borrow_mut().take()
    }
}

impl<R> From<&CallbackWait<R>> for Suspension {
    fn from(w: &CallbackWait<R>) -> Self {
        w.suspension
    }
}

impl<R> fmt::Debug for CallbackWait<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackWait")
            .field("suspension", &self.suspension)
            .field("done", &self.slot.done.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::pool::Pool;

    fn pair<R>() -> (WaitCallback, CallbackWait<R>, OnDone<R>) {
        let mut pool: Pool<WaitCallback> = Pool::new(PoolConfig::new(1));
        let h = pool.acquire().unwrap();
        let slot = CallbackSlot::new();
        let w = WaitCallback {
            done: Some(slot.done.clone()),
            hook: None,
        };
        (
            w,
            CallbackWait::new(Suspension::Callback(h), slot.clone()),
            OnDone::new(slot),
        )
    }

    #[test]
    fn test_done_flips_flag_and_stores_value() {
        let (w, wait, on_done) = pair::<String>();
        assert!(!w.is_done());
        assert!(!wait.is_done());
        on_done.done("ok".to_string());
        assert!(w.is_done());
        assert_eq!(wait.take().as_deref(), Some("ok"));
        assert_eq!(wait.take(), None);
    }

    #[test]
    fn test_two_value_form() {
        let (_w, wait, on_done) = pair::<(u32, bool)>();
        on_done.done2(4, true);
        assert_eq!(wait.take(), Some((4, true)));
    }

    #[test]
    fn test_reset_detaches_flag() {
        let (mut w, _wait, on_done) = pair::<()>();
        w.reset();
        on_done.done(());
        assert!(!w.is_done());
    }
}

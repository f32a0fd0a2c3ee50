//! Events - one-shot broadcasts that tasks can wait on
//!
//! An [`Event`] keeps a list of subscribers. `emit` stores the value, marks
//! every current subscriber as fired and drops the list, so each subscription
//! fires at most once. Waiters that give up (timeout or stop) unsubscribe
//! themselves; `subscriber_count` makes leftovers visible.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

/// Type-erased side of an event, used by wait primitives to unsubscribe.
pub(crate) trait EventSource {
    fn unsubscribe(&self, id: u64);
}

struct EventInner<T> {
    data: Option<T>,
    emits: u64,
    next_id: u64,
    subscribers: Vec<Subscriber>,
}

struct Subscriber {
    id: u64,
    fired: Rc<Cell<bool>>,
}

struct EventShared<T> {
    inner: RefCell<EventInner<T>>,
}

impl<T> EventSource for EventShared<T> {
    fn unsubscribe(&self, id: u64) {
        self.inner.borrow_mut().subscribers.retain(|s| s.id != id);
    }
}

/// Handed to a wait primitive by [`Event::subscribe`].
pub(crate) struct Subscription {
    pub(crate) id: u64,
    pub(crate) fired: Rc<Cell<bool>>,
    pub(crate) source: Weak<dyn EventSource>,
}

impl Subscription {
    pub(crate) fn cancel(&self) {
        if let Some(source) = self.source.upgrade() {
            source.unsubscribe(self.id);
        }
    }
}

/// Broadcast source. Clones share the same subscriber list.
pub struct Event<T> {
    shared: Rc<EventShared<T>>,
}

impl<T> Clone for Event<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: 'static> Default for Event<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Event<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.shared.inner.borrow();
        f.debug_struct("Event")
            .field("emits", &inner.emits)
            .field("subscribers", &inner.subscribers.len())
            .finish()
    }
}

impl<T: 'static> Event<T> {
    pub fn new() -> Self {
        Self {
            shared: Rc::new(EventShared {
                inner: RefCell::new(EventInner {
                    data: None,
                    emits: 0,
                    next_id: 0,
                    subscribers: Vec::new(),
                }),
            }),
        }
    }

    /// Store `value` and fire every current subscriber once.
    pub fn emit(&self, value: T) {
        let fired = {
            let mut inner = self.shared.inner.borrow_mut();
            inner.data = Some(value);
            inner.emits += 1;
            std::mem::take(&mut inner.subscribers)
        };
        for sub in fired {
            sub.fired.set(true);
        }
    }

    /// Last emitted value.
    pub fn data(&self) -> Option<T>
    where
        T: Clone,
    {
        self.shared.inner.borrow().data.clone()
    }

    pub fn emit_count(&self) -> u64 {
        self.shared.inner.borrow().emits
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.inner.borrow().subscribers.len()
    }

    /// Forget the last value. Subscribers are kept.
    pub fn reset(&self) {
        self.shared.inner.borrow_mut().data = None;
    }

    pub(crate) fn subscribe(&self) -> Subscription {
        let fired = Rc::new(Cell::new(false));
        let id = {
            let mut inner = self.shared.inner.borrow_mut();
            let id = inner.next_id;
            inner.next_id += 1;
            inner.subscribers.push(Subscriber {
                id,
                fired: fired.clone(),
            });
            id
        };
        let source: Rc<dyn EventSource> = self.shared.clone();
        Subscription {
            id,
            fired,
            source: Rc::downgrade(&source),
        }
    }
}

//! Reusable object pool with generation-checked handles.
//!
//! Every pooled object lives in a slot of a [`Pool`]. A slot hands out a
//! [`Handle`] carrying the slot index and the slot's generation; freeing the
//! slot bumps the generation, so handles that outlive their object are
//! rejected instead of aliasing whatever reuses the slot next.
//!
//! Slots carry a reference count. `acquire` returns a slot with count 0, each
//! holder calls `incref`, and `decref` reports when the count reaches zero so
//! the owner can run its release logic and `free` the slot.

use crate::config::PoolConfig;
use crate::error::SchedError;
use std::collections::VecDeque;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

/// Objects that can live in a [`Pool`].
pub trait Poolable: Default {
    /// Short name used in diagnostics and errors.
    const KIND: &'static str;

    /// Drop per-use state before the slot goes back on the free list.
    fn reset(&mut self);
}

/// Generation-checked reference to a pooled object.
pub struct Handle<T> {
    index: u32,
    generation: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    fn new(index: u32, generation: u32) -> Self {
        Self {
            index,
            generation,
            _marker: PhantomData,
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

// Manual impls: derives would add `T: Clone` etc. bounds.
impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}

impl<T> Eq for Handle<T> {}

impl<T> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.index.hash(state);
        self.generation.hash(state);
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}v{}", self.index, self.generation)
    }
}

struct Slot<T> {
    generation: u32,
    refs: u32,
    in_use: bool,
    value: T,
}

/// Counters for leak checks.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub kind: &'static str,
    /// Slots allocated so far.
    pub capacity: usize,
    /// Slots currently handed out.
    pub used: usize,
    pub acquires: u64,
    pub frees: u64,
    pub increfs: u64,
    pub decrefs: u64,
}

pub struct Pool<T: Poolable> {
    slots: Vec<Slot<T>>,
    free: VecDeque<u32>,
    max: usize,
    grow: usize,
    stats: PoolStats,
}

impl<T: Poolable> Pool<T> {
    pub fn new(config: PoolConfig) -> Self {
        let mut pool = Self {
            slots: Vec::with_capacity(config.initial),
            free: VecDeque::with_capacity(config.initial),
            max: config.max.max(1),
            grow: config.grow.max(1),
            stats: PoolStats {
                kind: T::KIND,
                ..PoolStats::default()
            },
        };
        pool.expand(config.initial.min(pool.max));
        pool
    }

    fn expand(&mut self, n: usize) {
        for _ in 0..n {
            let index = self.slots.len() as u32;
            self.slots.push(Slot {
                generation: 0,
                refs: 0,
                in_use: false,
                value: T::default(),
            });
            self.free.push_back(index);
        }
        self.stats.capacity = self.slots.len();
    }

    /// Take a free slot, growing the pool in bulk if none is left.
    pub fn acquire(&mut self) -> Result<Handle<T>, SchedError> {
        if self.free.is_empty() {
            let room = self.max - self.slots.len();
            if room == 0 {
                return Err(SchedError::PoolExhausted {
                    kind: T::KIND,
                    max: self.max,
                });
            }
            self.expand(self.grow.min(room));
        }

        let index = match self.free.pop_front() {
            Some(index) => index,
            None => {
                return Err(SchedError::PoolExhausted {
                    kind: T::KIND,
                    max: self.max,
                })
            }
        };
        let slot = &mut self.slots[index as usize];
        debug_assert!(!slot.in_use && slot.refs == 0);
        slot.in_use = true;
        self.stats.used += 1;
        self.stats.acquires += 1;
        Ok(Handle::new(index, slot.generation))
    }

    fn slot(&self, h: Handle<T>) -> Result<&Slot<T>, SchedError> {
        match self.slots.get(h.index as usize) {
            Some(slot) if slot.in_use && slot.generation == h.generation => Ok(slot),
            _ => Err(stale::<T>(h)),
        }
    }

    fn slot_mut(&mut self, h: Handle<T>) -> Result<&mut Slot<T>, SchedError> {
        match self.slots.get_mut(h.index as usize) {
            Some(slot) if slot.in_use && slot.generation == h.generation => Ok(slot),
            _ => Err(stale::<T>(h)),
        }
    }

    pub fn contains(&self, h: Handle<T>) -> bool {
        self.slot(h).is_ok()
    }

    pub fn get(&self, h: Handle<T>) -> Result<&T, SchedError> {
        self.slot(h).map(|s| &s.value)
    }

    pub fn get_mut(&mut self, h: Handle<T>) -> Result<&mut T, SchedError> {
        self.slot_mut(h).map(|s| &mut s.value)
    }

    pub fn refs(&self, h: Handle<T>) -> Result<u32, SchedError> {
        self.slot(h).map(|s| s.refs)
    }

    /// Returns the new count.
    pub fn incref(&mut self, h: Handle<T>) -> Result<u32, SchedError> {
        let slot = self.slot_mut(h)?;
        slot.refs += 1;
        let refs = slot.refs;
        self.stats.increfs += 1;
        Ok(refs)
    }

    /// Returns the new count. Reaching zero does not free the slot; the
    /// owner runs its release logic and then calls [`Pool::free`].
    pub fn decref(&mut self, h: Handle<T>) -> Result<u32, SchedError> {
        let slot = self.slot_mut(h)?;
        if slot.refs == 0 {
            return Err(SchedError::RefUnderflow {
                kind: T::KIND,
                index: h.index,
            });
        }
        slot.refs -= 1;
        let refs = slot.refs;
        self.stats.decrefs += 1;
        Ok(refs)
    }

    /// Return an unreferenced slot to the free list.
    pub fn free(&mut self, h: Handle<T>) -> Result<(), SchedError> {
        let slot = self.slot_mut(h)?;
        if slot.refs != 0 {
            return Err(SchedError::StillReferenced {
                kind: T::KIND,
                index: h.index,
                refs: slot.refs,
            });
        }
        slot.value.reset();
        slot.in_use = false;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push_back(h.index);
        self.stats.used -= 1;
        self.stats.frees += 1;
        Ok(())
    }

    /// Value left behind in a freed slot, as long as the slot has not been
    /// handed out again. Used to report the final state of dead tasks.
    pub fn released(&self, h: Handle<T>) -> Option<&T> {
        let slot = self.slots.get(h.index as usize)?;
        if !slot.in_use && slot.generation == h.generation.wrapping_add(1) {
            Some(&slot.value)
        } else {
            None
        }
    }

    pub fn used_count(&self) -> usize {
        self.stats.used
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn stats(&self) -> PoolStats {
        self.stats
    }
}

fn stale<T: Poolable>(h: Handle<T>) -> SchedError {
    SchedError::StaleHandle {
        kind: T::KIND,
        index: h.index,
        generation: h.generation,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Item {
        value: i32,
        resets: u32,
    }

    impl Poolable for Item {
        const KIND: &'static str = "item";

        fn reset(&mut self) {
            self.value = 0;
            self.resets += 1;
        }
    }

    #[test]
    fn test_acquire_release_reuses_slot() {
        let mut pool: Pool<Item> = Pool::new(PoolConfig::new(2));
        assert_eq!(pool.capacity(), 2);

        let h = pool.acquire().unwrap();
        pool.get_mut(h).unwrap().value = 7;
        assert_eq!(pool.used_count(), 1);

        pool.incref(h).unwrap();
        assert_eq!(pool.decref(h).unwrap(), 0);
        pool.free(h).unwrap();
        assert_eq!(pool.used_count(), 0);

        // Freed value was reset and the old handle is now stale.
        assert!(pool.get(h).is_err());
        assert_eq!(pool.released(h).map(|i| i.resets), Some(1));

        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        let reused = if a.index() == h.index() { a } else { b };
        assert_ne!(reused, h);
        assert_eq!(pool.get(reused).unwrap().value, 0);
        assert!(pool.released(h).is_none());
    }

    #[test]
    fn test_decref_at_zero_is_underflow() {
        let mut pool: Pool<Item> = Pool::new(PoolConfig::new(1));
        let h = pool.acquire().unwrap();
        let err = pool.decref(h).unwrap_err();
        assert!(matches!(err, SchedError::RefUnderflow { kind: "item", .. }));
    }

    #[test]
    fn test_free_still_referenced_is_rejected() {
        let mut pool: Pool<Item> = Pool::new(PoolConfig::new(1));
        let h = pool.acquire().unwrap();
        pool.incref(h).unwrap();
        let err = pool.free(h).unwrap_err();
        assert!(matches!(err, SchedError::StillReferenced { refs: 1, .. }));
        assert!(pool.contains(h));
    }

    #[test]
    fn test_double_free_is_stale() {
        let mut pool: Pool<Item> = Pool::new(PoolConfig::new(1));
        let h = pool.acquire().unwrap();
        pool.free(h).unwrap();
        assert!(matches!(
            pool.free(h).unwrap_err(),
            SchedError::StaleHandle { .. }
        ));
        assert_eq!(pool.free_count(), 1);
    }

    #[test]
    fn test_grows_in_bulk_up_to_cap() {
        let mut pool: Pool<Item> = Pool::new(PoolConfig {
            initial: 1,
            max: 5,
            grow: 3,
        });
        let _a = pool.acquire().unwrap();
        let _b = pool.acquire().unwrap();
        assert_eq!(pool.capacity(), 4);
        let _c = pool.acquire().unwrap();
        let _d = pool.acquire().unwrap();
        let _e = pool.acquire().unwrap();
        assert_eq!(pool.capacity(), 5);
        assert!(matches!(
            pool.acquire().unwrap_err(),
            SchedError::PoolExhausted { max: 5, .. }
        ));
    }

    #[test]
    fn test_stats_balance_over_lifecycle() {
        let mut pool: Pool<Item> = Pool::new(PoolConfig::new(4));
        for _ in 0..3 {
            let h = pool.acquire().unwrap();
            pool.incref(h).unwrap();
            pool.incref(h).unwrap();
            pool.decref(h).unwrap();
            pool.decref(h).unwrap();
            pool.free(h).unwrap();
        }
        let stats = pool.stats();
        assert_eq!(stats.increfs, stats.decrefs);
        assert_eq!(stats.acquires, stats.frees);
        assert_eq!(stats.used, 0);
    }
}

//! `All` / `OneOf` / `NumOf(n)` over child suspensions.
//!
//! The combinator owns one reference on each child from attach until
//! release. The scheduler updates the children, then hands [`WaitMulti::settle`]
//! a snapshot of which children are done; the combinator keeps its own
//! verdict so parents and queries see a consistent answer between polls.

use crate::pool::Poolable;
use crate::primitive::{Primitive, Suspension};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MultiMode {
    /// Every child done. Empty is done.
    #[default]
    All,
    /// Any child done; the first one in array order is recorded. Empty is
    /// never done.
    OneOf,
    /// At least `n` children done on the same poll. Latches on first
    /// detection. `n <= 0` is done immediately.
    NumOf(i64),
}

#[derive(Debug, Default)]
pub struct WaitMulti {
    mode: MultiMode,
    children: Vec<Suspension>,
    done: bool,
    first_done: Option<usize>,
    done_set: Vec<usize>,
    latched: bool,
}

impl WaitMulti {
    pub(crate) fn attach(&mut self, mode: MultiMode, children: Vec<Suspension>) {
        self.mode = mode;
        self.children = children;
        self.done = false;
        self.first_done = None;
        self.done_set.clear();
        self.latched = false;
    }

    pub fn mode(&self) -> MultiMode {
        self.mode
    }

    pub fn children(&self) -> &[Suspension] {
        &self.children
    }

    pub(crate) fn take_children(&mut self) -> Vec<Suspension> {
        std::mem::take(&mut self.children)
    }

    /// Index of the first child seen done (`OneOf`).
    pub fn first_done(&self) -> Option<usize> {
        self.first_done
    }

    /// Indices of the children that were done when the combinator latched
    /// (`NumOf`).
    pub fn done_set(&self) -> &[usize] {
        &self.done_set
    }

    /// `child_done[i]` tells whether `children[i]` is done right now.
    pub(crate) fn settle(&mut self, child_done: &[bool]) {
        debug_assert_eq!(child_done.len(), self.children.len());
        self.done = match self.mode {
            MultiMode::All => child_done.iter().all(|d| *d),
            MultiMode::OneOf => {
                if self.first_done.is_none() {
                    self.first_done = child_done.iter().position(|d| *d);
                }
                self.first_done.is_some()
            }
            MultiMode::NumOf(n) => {
                if !self.latched {
                    if n <= 0 {
                        self.latched = true;
                    } else {
                        let hits: Vec<usize> = child_done
                            .iter()
                            .enumerate()
                            .filter_map(|(i, d)| d.then_some(i))
                            .collect();
                        if hits.len() as i64 >= n {
                            self.done_set = hits;
                            self.latched = true;
                        }
                    }
                }
                self.latched
            }
        };
    }
}

impl Poolable for WaitMulti {
    const KIND: &'static str = "wait_multi";

    fn reset(&mut self) {
        debug_assert!(self.children.is_empty(), "children must be released first");
        self.children.clear();
        self.mode = MultiMode::All;
        self.done = false;
        self.first_done = None;
        self.done_set.clear();
        self.latched = false;
    }
}

impl Primitive for WaitMulti {
    fn is_done(&self) -> bool {
        self.done
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::pool::Pool;
    use crate::primitive::WaitFrame;

    fn children(n: usize) -> Vec<Suspension> {
        let mut pool: Pool<WaitFrame> = Pool::new(PoolConfig::new(n));
        (0..n).map(|_| Suspension::Frame(pool.acquire().unwrap())).collect()
    }

    fn multi(mode: MultiMode, n: usize) -> WaitMulti {
        let mut m = WaitMulti::default();
        m.attach(mode, children(n));
        m
    }

    #[test]
    fn test_all() {
        let mut m = multi(MultiMode::All, 2);
        m.settle(&[true, true]);
        assert!(m.is_done());

        let mut m = multi(MultiMode::All, 2);
        m.settle(&[true, false]);
        assert!(!m.is_done());

        let mut m = multi(MultiMode::All, 0);
        m.settle(&[]);
        assert!(m.is_done());
    }

    #[test]
    fn test_one_of_records_first_done() {
        let mut m = multi(MultiMode::OneOf, 3);
        m.settle(&[false, false, false]);
        assert!(!m.is_done());
        m.settle(&[false, true, true]);
        assert!(m.is_done());
        assert_eq!(m.first_done(), Some(1));
        m.settle(&[true, true, true]);
        assert_eq!(m.first_done(), Some(1));
    }

    #[test]
    fn test_one_of_empty_never_done() {
        let mut m = multi(MultiMode::OneOf, 0);
        m.settle(&[]);
        assert!(!m.is_done());
        assert_eq!(m.first_done(), None);
    }

    #[test]
    fn test_num_of_latches_first_detection() {
        let mut m = multi(MultiMode::NumOf(2), 3);
        m.settle(&[true, false, false]);
        assert!(!m.is_done());
        m.settle(&[true, false, true]);
        assert!(m.is_done());
        assert_eq!(m.done_set(), &[0, 2]);

        m.settle(&[true, true, true]);
        assert!(m.is_done());
        assert_eq!(m.done_set(), &[0, 2]);

        // Still latched if children later report not done.
        m.settle(&[false, false, false]);
        assert!(m.is_done());
    }

    #[test]
    fn test_num_of_records_every_done_child() {
        let mut m = multi(MultiMode::NumOf(1), 3);
        m.settle(&[true, true, false]);
        assert_eq!(m.done_set(), &[0, 1]);
    }

    #[test]
    fn test_num_of_non_positive_is_immediate() {
        for n in [0, -3] {
            let mut m = multi(MultiMode::NumOf(n), 2);
            m.settle(&[false, false]);
            assert!(m.is_done());
            assert!(m.done_set().is_empty());
        }
    }

    #[test]
    fn test_reattach_clears_latch() {
        let mut m = multi(MultiMode::NumOf(1), 1);
        m.settle(&[true]);
        assert!(m.is_done());
        let kids = m.take_children();
        m.reset();
        m.attach(MultiMode::NumOf(1), kids);
        m.settle(&[false]);
        assert!(!m.is_done());
        assert!(m.done_set().is_empty());
    }
}

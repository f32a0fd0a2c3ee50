//! Boolean conditions that wait primitives poll once per tick.
//!
//! Any `Fn() -> bool` closure is a [`Condition`]. The combinators here build
//! composite conditions without allocating a closure per combination.

use std::rc::Rc;

pub trait Condition {
    fn check(&self) -> bool;
}

impl<F> Condition for F
where
    F: Fn() -> bool,
{
    fn check(&self) -> bool {
        self()
    }
}

/// Shared, type-erased condition.
pub type SharedCondition = Rc<dyn Condition>;

pub fn shared(cond: impl Condition + 'static) -> SharedCondition {
    Rc::new(cond)
}

#[derive(Clone, Copy, Debug, Default)]
pub struct AlwaysTrue;

impl Condition for AlwaysTrue {
    fn check(&self) -> bool {
        true
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct AlwaysFalse;

impl Condition for AlwaysFalse {
    fn check(&self) -> bool {
        false
    }
}

pub struct Not<C>(C);

impl<C: Condition> Condition for Not<C> {
    fn check(&self) -> bool {
        !self.0.check()
    }
}

pub fn not<C: Condition>(cond: C) -> Not<C> {
    Not(cond)
}

/// True once at least `n` of the inner conditions hold.
///
/// `all` and `any` are the `n == len` and `n == 1` cases. Evaluation stops as
/// soon as the answer is known.
pub struct AtLeast {
    n: usize,
    conds: Vec<SharedCondition>,
}

impl Condition for AtLeast {
    fn check(&self) -> bool {
        if self.n == 0 {
            return true;
        }
        let mut hits = 0;
        for (i, cond) in self.conds.iter().enumerate() {
            if cond.check() {
                hits += 1;
                if hits >= self.n {
                    return true;
                }
            }
            // Not enough left to reach n.
            if hits + (self.conds.len() - i - 1) < self.n {
                return false;
            }
        }
        false
    }
}

pub fn at_least(n: usize, conds: Vec<SharedCondition>) -> AtLeast {
    AtLeast { n, conds }
}

/// Every condition holds. Empty is true.
pub fn all(conds: Vec<SharedCondition>) -> AtLeast {
    let n = conds.len();
    AtLeast { n, conds }
}

/// At least one condition holds. Empty is false.
pub fn any(conds: Vec<SharedCondition>) -> AtLeast {
    AtLeast { n: 1, conds }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn flag(v: bool) -> (Rc<Cell<bool>>, SharedCondition) {
        let f = Rc::new(Cell::new(v));
        let g = f.clone();
        (f, shared(move || g.get()))
    }

    #[test]
    fn test_closure_and_constants() {
        assert!(AlwaysTrue.check());
        assert!(!AlwaysFalse.check());
        assert!(not(AlwaysFalse).check());
        let x = 3;
        assert!((move || x == 3).check());
    }

    #[test]
    fn test_all_any() {
        let (a, ca) = flag(true);
        let (_b, cb) = flag(false);
        let both = all(vec![ca.clone(), cb.clone()]);
        let either = any(vec![ca, cb]);
        assert!(!both.check());
        assert!(either.check());
        a.set(false);
        assert!(!either.check());

        assert!(all(Vec::new()).check());
        assert!(!any(Vec::new()).check());
    }

    #[test]
    fn test_at_least_short_circuits() {
        let calls = Rc::new(Cell::new(0));
        let counting = |v: bool| {
            let calls = calls.clone();
            shared(move || {
                calls.set(calls.get() + 1);
                v
            })
        };
        let c = at_least(2, vec![counting(true), counting(true), counting(true)]);
        assert!(c.check());
        assert_eq!(calls.get(), 2);

        calls.set(0);
        let c = at_least(2, vec![counting(false), counting(false), counting(true)]);
        assert!(!c.check());
        assert_eq!(calls.get(), 2);

        assert!(at_least(0, Vec::new()).check());
    }
}

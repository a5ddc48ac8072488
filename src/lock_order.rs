//! Mutexes tagged with their place in the global acquisition order.
//!
//! Order: registry, backend, connection, operation link, operation state.
//! A thread may only take a lock whose level is strictly later than every
//! lock it already holds; violations trip a debug assertion. Guards are
//! `!Send`, so they never live across an `.await`.

use parking_lot::{Mutex, MutexGuard};
use std::cell::Cell;
use std::fmt;
use std::ops::{Deref, DerefMut};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LockLevel {
    /// Backend registry and the client list.
    Registry = 0,
    Backend = 1,
    Connection = 2,
    OperationLink = 3,
    OperationState = 4,
}

impl LockLevel {
    fn bit(self) -> u8 {
        1 << (self as u8)
    }

    /// Bits of this level and every later one.
    fn at_or_after(self) -> u8 {
        !(self.bit() - 1)
    }
}

thread_local! {
    static HELD: Cell<u8> = const { Cell::new(0) };
}

fn acquire(level: LockLevel) {
    HELD.with(|held| {
        let current = held.get();
        debug_assert!(
            current & level.at_or_after() == 0,
            "lock order violation: taking {:?} while holding levels {:#07b}",
            level,
            current
        );
        held.set(current | level.bit());
    });
}

fn released(level: LockLevel) {
    HELD.with(|held| held.set(held.get() & !level.bit()));
}

pub struct OrderedMutex<T> {
    level: LockLevel,
    inner: Mutex<T>,
}

impl<T> OrderedMutex<T> {
    pub fn new(level: LockLevel, value: T) -> Self {
        Self {
            level,
            inner: Mutex::new(value),
        }
    }

    pub fn lock(&self) -> OrderedGuard<'_, T> {
        acquire(self.level);
        OrderedGuard {
            guard: self.inner.lock(),
            level: self.level,
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for OrderedMutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrderedMutex")
            .field("level", &self.level)
            .finish_non_exhaustive()
    }
}

pub struct OrderedGuard<'a, T> {
    guard: MutexGuard<'a, T>,
    level: LockLevel,
}

impl<T> Deref for OrderedGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for OrderedGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for OrderedGuard<'_, T> {
    fn drop(&mut self) {
        released(self.level);
    }
}

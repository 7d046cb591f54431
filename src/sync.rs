//! Poison-free locking, and a completion counter built on it.
//!
//! [`std::sync::Mutex`] poisons itself when a thread panics while holding the lock. Panics in
//! tasks are already contained and reported as failures, so poisoning would only turn one
//! contained panic into knock-on panics in unrelated threads. The [`Mutex`] and [`Condvar`] here
//! ignore poisoning instead.

use std::{
    fmt,
    ops::{Deref, DerefMut},
    sync::{
        self,
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

#[derive(Default)]
pub struct Mutex<T: ?Sized> {
    inner: sync::Mutex<T>,
}

impl<T> Mutex<T> {
    pub const fn new(t: T) -> Mutex<T> {
        Self {
            inner: sync::Mutex::new(t),
        }
    }
}

impl<T: ?Sized> Mutex<T> {
    pub fn lock(&self) -> MutexGuard<'_, T> {
        let guard = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poison) => poison.into_inner(),
        };

        MutexGuard { inner: guard }
    }
}

impl<T: ?Sized> fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutex").finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub struct MutexGuard<'a, T: ?Sized + 'a> {
    inner: sync::MutexGuard<'a, T>,
}

impl<'a, T: ?Sized + 'a> Deref for MutexGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl<'a, T: ?Sized + 'a> DerefMut for MutexGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

#[derive(Debug, Default)]
pub struct Condvar {
    inner: sync::Condvar,
}

impl Condvar {
    pub fn wait_while<'a, T, F>(&self, guard: MutexGuard<'a, T>, condition: F) -> MutexGuard<'a, T>
    where
        F: FnMut(&mut T) -> bool,
    {
        let guard = match self.inner.wait_while(guard.inner, condition) {
            Ok(guard) => guard,
            Err(poison) => poison.into_inner(),
        };
        MutexGuard { inner: guard }
    }

    pub fn notify_all(&self) {
        self.inner.notify_all();
    }
}

/// Counts in-flight tasks and lets a thread block until none remain.
///
/// Increments and decrements are atomic. The mutex only guards the sleeping side, so that a waiter
/// can't miss the transition to zero.
#[derive(Debug, Default)]
pub struct WaitCounter {
    count: AtomicUsize,
    lock: Mutex<()>,
    condvar: Condvar,
}

impl WaitCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers one more in-flight task.
    pub fn add(&self) {
        self.count.fetch_add(1, Ordering::AcqRel);
    }

    /// Marks one task as finished, waking waiters if it was the last one.
    pub fn done(&self) {
        let prev = self.count.fetch_sub(1, Ordering::AcqRel);
        assert_ne!(prev, 0, "`WaitCounter::done` called more often than `add`");
        if prev == 1 {
            // Taking the lock orders this notification after any waiter's check of the count.
            drop(self.lock.lock());
            self.condvar.notify_all();
        }
    }

    /// Returns the number of tasks currently registered.
    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Blocks until the count drops to zero.
    pub fn wait(&self) {
        let guard = self.lock.lock();
        drop(
            self.condvar
                .wait_while(guard, |_| self.count.load(Ordering::Acquire) != 0),
        );
    }
}

/// A registration with a [`WaitCounter`] that is released when dropped.
#[must_use = "dropping a `Registration` immediately releases it"]
pub struct Registration(Option<Arc<WaitCounter>>);

impl Registration {
    pub fn new(counter: Option<Arc<WaitCounter>>) -> Self {
        if let Some(counter) = &counter {
            counter.add();
        }
        Self(counter)
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Some(counter) = self.0.take() {
            counter.done();
        }
    }
}

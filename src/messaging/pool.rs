//! Bounded object pools for hot-path buffers.
//!
//! Objects are recycled when they come back, so whatever [`Pool::acquire`] or
//! [`Pool::take`] hands out is always in its reset state.

use parking_lot::Mutex;
use std::ops::{Deref, DerefMut};

/// Reset hook run on every object returned to a [`Pool`].
pub trait Recycle {
    fn recycle(&mut self);
}

type Factory<T> = Box<dyn Fn() -> T + Send + Sync>;

pub struct Pool<T> {
    idle: Mutex<Vec<T>>,
    max_idle: usize,
    factory: Factory<T>,
}

impl<T: Recycle> Pool<T> {
    /// Pool keeping at most `max_idle` returned objects; extra returns are dropped.
    pub fn new<F>(max_idle: usize, factory: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self {
            idle: Mutex::new(Vec::with_capacity(max_idle)),
            max_idle,
            factory: Box::new(factory),
        }
    }

    /// Scoped acquisition; the object returns to the pool when the guard drops,
    /// including during unwinding.
    pub fn acquire(&self) -> Pooled<'_, T> {
        Pooled {
            pool: self,
            item: Some(self.take()),
        }
    }

    /// Detached acquisition for objects that outlive the caller's scope. Pair
    /// with [`Pool::release`].
    pub fn take(&self) -> T {
        let reused = self.idle.lock().pop();
        reused.unwrap_or_else(|| (self.factory)())
    }

    pub fn release(&self, mut item: T) {
        item.recycle();
        let mut idle = self.idle.lock();
        if idle.len() < self.max_idle {
            idle.push(item);
        }
    }

    /// Objects currently parked in the pool.
    pub fn idle(&self) -> usize {
        self.idle.lock().len()
    }
}

/// Guard returned by [`Pool::acquire`].
pub struct Pooled<'a, T: Recycle> {
    pool: &'a Pool<T>,
    item: Option<T>,
}

impl<T: Recycle> Deref for Pooled<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.item.as_ref().expect("pooled item present until drop")
    }
}

impl<T: Recycle> DerefMut for Pooled<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.item.as_mut().expect("pooled item present until drop")
    }
}

impl<T: Recycle> Drop for Pooled<'_, T> {
    fn drop(&mut self) {
        if let Some(item) = self.item.take() {
            self.pool.release(item);
        }
    }
}

//! Thin mutex wrapper exposing the non-blocking `try_lock` poll the
//! periodic timer and the connection registry rely on.
//!
//! Recursive locking is not required anywhere in this crate, so this
//! wraps `std::sync::Mutex` directly rather than reimplementing lock
//! semantics.

use std::sync::{self, TryLockError};

pub struct Mutex<T>(sync::Mutex<T>);

pub struct MutexGuard<'a, T>(sync::MutexGuard<'a, T>);

impl<T> std::ops::Deref for MutexGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T> std::ops::DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.0
    }
}

impl<T> Mutex<T> {
    pub const fn new(value: T) -> Self {
        Mutex(sync::Mutex::new(value))
    }

    /// Block until the lock is acquired. Poisoning is treated as a logic
    /// error elsewhere in the process (a held lock should never panic);
    /// recovering the inner value keeps a single bad caller from wedging
    /// every subsequent lock attempt.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        match self.0.lock() {
            Ok(g) => MutexGuard(g),
            Err(poisoned) => MutexGuard(poisoned.into_inner()),
        }
    }

    /// Non-blocking poll, mirroring the original's try-lock-and-bail
    /// pattern used by the periodic timer callback.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        match self.0.try_lock() {
            Ok(g) => Some(MutexGuard(g)),
            Err(TryLockError::WouldBlock) => None,
            Err(TryLockError::Poisoned(poisoned)) => Some(MutexGuard(poisoned.into_inner())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn try_lock_fails_while_held() {
        let m = Arc::new(Mutex::new(0));
        let guard = m.lock();
        assert!(m.try_lock().is_none());
        drop(guard);
        assert!(m.try_lock().is_some());
    }

    #[test]
    fn lock_mutates_through_guard() {
        let m = Mutex::new(5);
        *m.lock() += 1;
        assert_eq!(*m.lock(), 6);
    }
}

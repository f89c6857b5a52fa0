use std::sync::{Mutex, MutexGuard};

/// Lock a mutex, taking the data even if another thread panicked while
/// holding it. Every guarded structure here stays consistent between
/// statements, so a poisoned lock carries no torn state.
pub(crate) fn lock_or_recover<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

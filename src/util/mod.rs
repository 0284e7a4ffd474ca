//! Small helpers shared by the engine and by handler implementations.

pub mod gatherer;

pub use gatherer::InputGatherer;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Locks a mutex, recovering the guard if a previous holder panicked.
///
/// Handler code runs under several of the engine's locks; a panicking
/// handler closes its connection but must not wedge the locks for the
/// teardown that follows.
#[inline]
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

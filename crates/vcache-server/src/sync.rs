//! Mutex helpers.
//!
//! A poisoned mutex means a thread panicked mid-update of shared state, so
//! the invariants it guards can no longer be trusted: log and abort.

use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

use vcache_config::log_server_error;

#[cold]
fn poisoned(what: &'static str) -> ! {
    log_server_error!("Mutex poisoned, aborting", guard = what);
    std::process::abort()
}

pub(crate) fn lock<'a, T>(mutex: &'a Mutex<T>, what: &'static str) -> MutexGuard<'a, T> {
    mutex.lock().unwrap_or_else(|_| poisoned(what))
}

pub(crate) fn wait<'a, T>(
    condvar: &Condvar,
    guard: MutexGuard<'a, T>,
    what: &'static str,
) -> MutexGuard<'a, T> {
    condvar.wait(guard).unwrap_or_else(|_| poisoned(what))
}

pub(crate) fn wait_timeout<'a, T>(
    condvar: &Condvar,
    guard: MutexGuard<'a, T>,
    timeout: Duration,
    what: &'static str,
) -> MutexGuard<'a, T> {
    match condvar.wait_timeout(guard, timeout) {
        Ok((guard, _)) => guard,
        Err(_) => poisoned(what),
    }
}

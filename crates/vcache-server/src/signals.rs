//! Process signal handling.
//!
//! SIGINT and SIGQUIT request an immediate stop, SIGHUP a drain. SIGPIPE is
//! ignored so a client vanishing mid-reply only fails that write. The
//! handler records the request in an atomic and pokes the acceptor's waker
//! socket; everything else happens on the acceptor thread.

use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicI32, AtomicU8, Ordering};

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

use crate::ShutdownMode;

const NONE: u8 = 0;
const DRAIN: u8 = 1;
const STOP: u8 = 2;

static REQUESTED: AtomicU8 = AtomicU8::new(NONE);
static WAKE_FD: AtomicI32 = AtomicI32::new(-1);

const SHUTDOWN_SIGNALS: [Signal; 3] = [Signal::SIGINT, Signal::SIGQUIT, Signal::SIGHUP];

/// Encode a mode so that the stronger request wins under `fetch_max`.
pub(crate) fn encode(mode: ShutdownMode) -> u8 {
    match mode {
        ShutdownMode::Drain => DRAIN,
        ShutdownMode::Stop => STOP,
    }
}

pub(crate) fn decode(code: u8) -> Option<ShutdownMode> {
    match code {
        DRAIN => Some(ShutdownMode::Drain),
        STOP => Some(ShutdownMode::Stop),
        _ => None,
    }
}

extern "C" fn on_signal(signal: libc::c_int) {
    let mode = if signal == libc::SIGHUP { DRAIN } else { STOP };
    REQUESTED.fetch_max(mode, Ordering::SeqCst);

    let fd: RawFd = WAKE_FD.load(Ordering::SeqCst);
    if fd >= 0 {
        let byte = 1u8;
        // SAFETY: write(2) is async-signal-safe; the buffer outlives the call
        unsafe {
            libc::write(fd, (&byte as *const u8).cast(), 1);
        }
    }
}

/// Install the handlers. `waker` must stay open until [`uninstall`].
pub fn install(waker: &UnixStream) -> nix::Result<()> {
    REQUESTED.store(NONE, Ordering::SeqCst);
    WAKE_FD.store(waker.as_raw_fd(), Ordering::SeqCst);

    // no SA_RESTART: a blocked poll in the acceptor returns EINTR
    let action = SigAction::new(SigHandler::Handler(on_signal), SaFlags::empty(), SigSet::empty());
    let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
    // SAFETY: the handler only touches atomics and calls write(2)
    unsafe {
        for signal in SHUTDOWN_SIGNALS {
            sigaction(signal, &action)?;
        }
        sigaction(Signal::SIGPIPE, &ignore)?;
    }
    Ok(())
}

/// Restore default dispositions and forget the waker.
pub fn uninstall() {
    WAKE_FD.store(-1, Ordering::SeqCst);
    let default = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
    for signal in SHUTDOWN_SIGNALS {
        // SAFETY: restoring the default disposition
        let _ = unsafe { sigaction(signal, &default) };
    }
}

/// Shutdown requested by a signal, if any.
pub fn requested() -> Option<ShutdownMode> {
    decode(REQUESTED.load(Ordering::SeqCst))
}

/// Blocks the shutdown signals on the current thread while alive, so that
/// threads spawned meanwhile inherit the mask and the signals are always
/// delivered to the acceptor.
pub struct BlockedSignals(SigSet);

impl BlockedSignals {
    pub fn block() -> nix::Result<Self> {
        let mut set = SigSet::empty();
        for signal in SHUTDOWN_SIGNALS {
            set.add(signal);
        }
        set.thread_block()?;
        Ok(Self(set))
    }
}

impl Drop for BlockedSignals {
    fn drop(&mut self) {
        let _ = self.0.thread_unblock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_outranks_drain() {
        let flag = AtomicU8::new(NONE);
        flag.fetch_max(encode(ShutdownMode::Drain), Ordering::SeqCst);
        flag.fetch_max(encode(ShutdownMode::Stop), Ordering::SeqCst);
        flag.fetch_max(encode(ShutdownMode::Drain), Ordering::SeqCst);
        assert_eq!(decode(flag.load(Ordering::SeqCst)), Some(ShutdownMode::Stop));
        assert_eq!(decode(NONE), None);
    }

    #[test]
    fn test_block_guard_restores_mask() {
        let guard = BlockedSignals::block().unwrap();
        let mask = SigSet::thread_get_mask().unwrap();
        assert!(mask.contains(Signal::SIGHUP));
        drop(guard);
        let mask = SigSet::thread_get_mask().unwrap();
        assert!(!mask.contains(Signal::SIGHUP));
    }
}

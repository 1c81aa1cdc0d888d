//! SIGINT redirection.
//!
//! A transmission loop installs its own SIGINT handler so that an interrupt
//! arriving mid-syscall can flip the global [`crate::status`] to
//! `StoppedShouldAbort` and unblock a `poll`/`select` call, instead of being
//! swallowed by EINTR handling somewhere in the middle of a partial read.
//!
//! The handler restores the previous disposition and re-raises the signal
//! before returning, so a host process that was relying on the original
//! handler (or the default terminating action) still observes it.
//!
//! Only ever touched from the loop's own thread: the thread that calls
//! [`redirect_sigint`] is the same thread the signal interrupts, so there is
//! no cross-thread synchronization to get right, only cross-signal
//! re-entrancy, which `SA_NODEFER` deliberately allows for.

use crate::status::{LoopStatus, STATUS};
use std::cell::UnsafeCell;

struct OldSigact(UnsafeCell<Option<libc::sigaction>>);
unsafe impl Sync for OldSigact {}

static OLD_SIGACT: OldSigact = OldSigact(UnsafeCell::new(None));

/// Installs the SIGINT handler, saving whatever disposition was previously
/// in effect. Safe to call again after a previous loop iteration exited:
/// the handler always restores the prior disposition before re-raising, so
/// there is never a stacked handler to unwind.
pub fn redirect_sigint() {
    let mut act: libc::sigaction = unsafe { std::mem::zeroed() };
    act.sa_sigaction = handle_sigint as usize;
    unsafe {
        libc::sigemptyset(&mut act.sa_mask);
    }
    act.sa_flags = libc::SA_NODEFER;

    let mut old: libc::sigaction = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::sigaction(libc::SIGINT, &act, &mut old) };
    assert_eq!(rc, 0, "sigaction(SIGINT) install failed: {}", std::io::Error::last_os_error());

    let slot = unsafe { &mut *OLD_SIGACT.0.get() };
    *slot = Some(old);
}

extern "C" fn handle_sigint(sig: libc::c_int) {
    let slot = unsafe { &*OLD_SIGACT.0.get() };
    if let Some(old) = slot {
        unsafe {
            libc::sigaction(libc::SIGINT, old, std::ptr::null_mut());
        }
    }
    STATUS.set(LoopStatus::StoppedShouldAbort);
    unsafe {
        libc::raise(sig);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn redirect_sigint_saves_previous_disposition() {
        redirect_sigint();
        let slot = unsafe { &*OLD_SIGACT.0.get() };
        assert!(slot.is_some());

        // Restore default disposition so later tests in this process aren't
        // affected by a handler left installed from this one.
        let mut default_act: libc::sigaction = unsafe { std::mem::zeroed() };
        default_act.sa_sigaction = libc::SIG_DFL;
        unsafe {
            libc::sigaction(libc::SIGINT, &default_act, std::ptr::null_mut());
        }
    }
}

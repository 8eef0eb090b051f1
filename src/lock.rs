//! Per-page advisory locking.
//!
//! Every page is guarded by an exclusive fcntl byte-range lock over
//! exactly its `[page * page_size, (page + 1) * page_size)` span of
//! the share file, so operations on different pages proceed fully in
//! parallel across processes while same-page operations are totally
//! ordered by lock acquisition.
//!
//! The blocking `F_SETLKW` call is wrapped in a soft alarm: a no-op
//! `SIGALRM` handler is installed (without `SA_RESTART`, so the wait
//! returns `EINTR`) and `alarm()` armed around the call. A wait
//! interrupted by some other signal is retried with the remaining
//! alarm budget; interruption by the alarm itself fails the lock with
//! [`Error::LockTimeout`]. The prior handler and any prior pending
//! alarm are restored on every exit path.

use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::ptr;

use crate::error::{Error, Result};

/// Soft budget for acquiring a single page lock.
pub const LOCK_TIMEOUT_SECS: u32 = 10;

extern "C" fn alarm_noop(_sig: libc::c_int) {}

/// Saved `SIGALRM` state to put back once the lock call returns.
struct AlarmGuard {
    old_action: libc::sigaction,
    old_alarm: libc::c_uint,
}

impl AlarmGuard {
    /// Install the no-op handler and arm the alarm.
    fn arm(secs: u32) -> Self {
        unsafe {
            let mut action: libc::sigaction = mem::zeroed();
            action.sa_sigaction = alarm_noop as extern "C" fn(libc::c_int) as libc::sighandler_t;
            libc::sigemptyset(&mut action.sa_mask);
            // No SA_RESTART: fcntl must come back with EINTR.
            action.sa_flags = 0;
            let mut old_action: libc::sigaction = mem::zeroed();
            libc::sigaction(libc::SIGALRM, &action, &mut old_action);
            let old_alarm = libc::alarm(secs);
            AlarmGuard {
                old_action,
                old_alarm,
            }
        }
    }
}

impl Drop for AlarmGuard {
    fn drop(&mut self) {
        unsafe {
            libc::alarm(self.old_alarm);
            libc::sigaction(libc::SIGALRM, &self.old_action, ptr::null_mut());
        }
    }
}

fn flock_for(offset: u64, len: u64, l_type: libc::c_int) -> libc::flock {
    let mut fl: libc::flock = unsafe { mem::zeroed() };
    fl.l_type = l_type as libc::c_short;
    fl.l_whence = libc::SEEK_SET as libc::c_short;
    fl.l_start = offset as libc::off_t;
    fl.l_len = len as libc::off_t;
    fl
}

/// Block until the byte range of `page` is exclusively locked, or the
/// alarm budget runs out.
pub fn lock_range(fd: RawFd, page: u32, offset: u64, len: u64) -> Result<()> {
    let fl = flock_for(offset, len, libc::F_WRLCK);
    let _alarm = AlarmGuard::arm(LOCK_TIMEOUT_SECS);

    loop {
        let res = unsafe { libc::fcntl(fd, libc::F_SETLKW, &fl) };
        if res == 0 {
            return Ok(());
        }

        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EINTR) {
            // Some signal interrupted the wait. If the alarm has not
            // fired yet, re-arm with whatever budget is left and retry.
            let left = unsafe { libc::alarm(0) };
            if left > 0 {
                unsafe { libc::alarm(left) };
                continue;
            }
            return Err(Error::LockTimeout { page });
        }

        return Err(Error::Io(err));
    }
}

/// Release the byte range of a previously locked page.
///
/// Unlocking a range this process holds cannot meaningfully fail, and
/// no error escapes here; a failure would mean the fd went away, which
/// the next operation will report.
pub fn unlock_range(fd: RawFd, offset: u64, len: u64) {
    let fl = flock_for(offset, len, libc::F_UNLCK);
    let res = unsafe { libc::fcntl(fd, libc::F_SETLKW, &fl) };
    debug_assert_eq!(res, 0, "F_UNLCK failed: {}", io::Error::last_os_error());
}

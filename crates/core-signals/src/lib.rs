//! Job-control and terminal signal hub.
//!
//! Handlers follow one discipline: touch nothing but atomics and short
//! async-signal-safe syscalls, and defer all real work to the main loop.
//! The hub owns four pieces of shared state:
//!
//! * `NEED_NEW_SIZE`: window changed (or we were continued); the loop
//!   re-queries the terminal before the next display tick.
//! * `STOP_TIME_US` / `STOPPED_OFFSET_US`: when a stop was typed at the
//!   tty we stamp the time and self-raise `SIGSTOP`; on continue the
//!   stopped interval is folded into the offset the loop subtracts from
//!   elapsed time.
//! * `SAVED_STDERR`: while backgrounded, standard error points at
//!   `/dev/null` and the original descriptor is parked here; it is
//!   restored on continue or by the once-per-second background check.
//! * `CURSOR_REINIT`: a saturating counter the cursor coordinator drains;
//!   bumped by 2 per continue so a lost cursor-position reply is absorbed
//!   by a second attempt.
//!
//! Nothing in a handler body emits tracing events; install-time and
//! main-loop paths may.

use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, Ordering};
use tracing::debug;

static NEED_NEW_SIZE: AtomicBool = AtomicBool::new(false);
static STOP_TIME_US: AtomicI64 = AtomicI64::new(0);
static STOPPED_OFFSET_US: AtomicI64 = AtomicI64::new(0);
static SAVED_STDERR: AtomicI32 = AtomicI32::new(-1);
static CURSOR_REINIT: AtomicI32 = AtomicI32::new(0);
static NEXT_BG_CHECK_S: AtomicI64 = AtomicI64::new(0);

/// Wall-clock microseconds. The same time source the handlers use, so
/// elapsed-time arithmetic in the main loop stays consistent with the
/// stop/continue offsets.
pub fn now_micros() -> i64 {
    let mut tv = libc::timeval {
        tv_sec: 0,
        tv_usec: 0,
    };
    unsafe { libc::gettimeofday(&mut tv, std::ptr::null_mut()) };
    tv.tv_sec as i64 * 1_000_000 + tv.tv_usec as i64
}

fn assert_tostop() {
    unsafe {
        let mut t: libc::termios = std::mem::zeroed();
        if libc::tcgetattr(libc::STDERR_FILENO, &mut t) == 0 {
            t.c_lflag |= libc::TOSTOP;
            libc::tcsetattr(libc::STDERR_FILENO, libc::TCSANOW, &t);
        }
    }
}

/// Tty output attempted while backgrounded: park standard error on
/// `/dev/null` so the shell's terminal stays clean, saving the original
/// descriptor exactly once.
extern "C" fn handle_ttou(_: libc::c_int) {
    unsafe {
        let fd = libc::open(c"/dev/null".as_ptr(), libc::O_RDWR);
        if fd < 0 {
            return;
        }
        if SAVED_STDERR.load(Ordering::Relaxed) == -1 {
            SAVED_STDERR.store(libc::dup(libc::STDERR_FILENO), Ordering::Relaxed);
        }
        libc::dup2(fd, libc::STDERR_FILENO);
        libc::close(fd);
    }
}

/// Stop typed at the tty: remember when, then actually stop.
extern "C" fn handle_tstp(_: libc::c_int) {
    STOP_TIME_US.store(now_micros(), Ordering::Relaxed);
    unsafe {
        libc::raise(libc::SIGSTOP);
    }
}

/// Continued: fold the stopped interval into the offset, take standard
/// error back from `/dev/null`, and ask the cursor layer to re-anchor.
extern "C" fn handle_cont(_: libc::c_int) {
    NEED_NEW_SIZE.store(true, Ordering::Relaxed);

    let stopped_at = STOP_TIME_US.swap(0, Ordering::Relaxed);
    if stopped_at == 0 {
        // Foreground continue without a recorded stop (e.g. `kill -CONT`):
        // nothing to account for, but the tty flags may have been reset.
        assert_tostop();
        request_cursor_reinit();
        return;
    }

    STOPPED_OFFSET_US.fetch_add(now_micros() - stopped_at, Ordering::Relaxed);

    let saved = SAVED_STDERR.swap(-1, Ordering::Relaxed);
    if saved != -1 {
        unsafe {
            libc::dup2(saved, libc::STDERR_FILENO);
            libc::close(saved);
        }
    }

    assert_tostop();
    request_cursor_reinit();
}

extern "C" fn handle_winch(_: libc::c_int) {
    NEED_NEW_SIZE.store(true, Ordering::Relaxed);
}

fn action(handler: SigHandler) -> SigAction {
    SigAction::new(handler, SaFlags::empty(), SigSet::empty())
}

/// Install the full handler set. Broken-pipe is ignored outright; the
/// transfer engine sees `EPIPE` from `write` instead and treats it as a
/// clean end of transfer.
pub fn install() {
    unsafe {
        let _ = sigaction(Signal::SIGPIPE, &action(SigHandler::SigIgn));
        let _ = sigaction(Signal::SIGTTOU, &action(SigHandler::Handler(handle_ttou)));
        let _ = sigaction(Signal::SIGTSTP, &action(SigHandler::Handler(handle_tstp)));
        let _ = sigaction(Signal::SIGCONT, &action(SigHandler::Handler(handle_cont)));
        let _ = sigaction(Signal::SIGWINCH, &action(SigHandler::Handler(handle_winch)));
    }
    debug!(target: "signal", "handlers_installed");
}

/// Stop reacting to stop/continue. Used while the main loop re-anchors
/// the start time for wait-until-first-byte mode, so a stop arriving
/// mid-reset cannot corrupt the offset accounting.
pub fn pause_disable() {
    unsafe {
        let _ = sigaction(Signal::SIGTSTP, &action(SigHandler::SigIgn));
        let _ = sigaction(Signal::SIGCONT, &action(SigHandler::SigDfl));
    }
}

/// Start catching stop/continue again.
pub fn pause_enable() {
    unsafe {
        let _ = sigaction(Signal::SIGTSTP, &action(SigHandler::Handler(handle_tstp)));
        let _ = sigaction(Signal::SIGCONT, &action(SigHandler::Handler(handle_cont)));
    }
}

/// Opportunistically restore standard error after a background stint.
/// Called once per display update; rate-limited to once a second.
pub fn check_background() {
    let now_s = now_micros() / 1_000_000;
    if now_s < NEXT_BG_CHECK_S.load(Ordering::Relaxed) {
        return;
    }
    NEXT_BG_CHECK_S.store(now_s + 1, Ordering::Relaxed);

    let saved = SAVED_STDERR.swap(-1, Ordering::Relaxed);
    if saved == -1 {
        return;
    }
    unsafe {
        libc::dup2(saved, libc::STDERR_FILENO);
        libc::close(saved);
    }
    assert_tostop();
    request_cursor_reinit();
    debug!(target: "signal", "stderr_restored_from_background");
}

/// Read and clear the window-size flag.
pub fn take_need_new_size() -> bool {
    NEED_NEW_SIZE.swap(false, Ordering::Relaxed)
}

/// Total time spent stopped, in microseconds.
pub fn stopped_offset_micros() -> i64 {
    STOPPED_OFFSET_US.load(Ordering::Relaxed)
}

/// Forget any accumulated stopped time. Only called under
/// [`pause_disable`] so it cannot race the continue handler.
pub fn clear_stopped_offset() {
    STOPPED_OFFSET_US.store(0, Ordering::Relaxed);
}

/// Bump the cursor-reinit counter by 2, saturating at 3.
pub fn request_cursor_reinit() {
    let _ = CURSOR_REINIT.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
        Some((v + 2).min(3))
    });
}

pub fn cursor_reinit_pending() -> bool {
    CURSOR_REINIT.load(Ordering::Relaxed) > 0
}

/// Take one step of reinit work; returns the remaining count.
pub fn cursor_reinit_decrement() -> i32 {
    CURSOR_REINIT.fetch_sub(1, Ordering::Relaxed) - 1
}

pub fn cursor_reinit_clear() {
    CURSOR_REINIT.store(0, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn winch_sets_and_take_clears() {
        handle_winch(libc::SIGWINCH);
        assert!(take_need_new_size());
        assert!(!take_need_new_size());
    }

    #[test]
    fn reinit_counter_saturates_and_drains() {
        cursor_reinit_clear();
        request_cursor_reinit();
        request_cursor_reinit();
        request_cursor_reinit();
        assert!(cursor_reinit_pending());
        // Saturated at 3: three decrements drain it completely.
        assert_eq!(cursor_reinit_decrement(), 2);
        assert_eq!(cursor_reinit_decrement(), 1);
        assert_eq!(cursor_reinit_decrement(), 0);
        assert!(!cursor_reinit_pending());
    }

    #[test]
    fn stopped_offset_clears() {
        clear_stopped_offset();
        assert_eq!(stopped_offset_micros(), 0);
    }

    #[test]
    fn clock_is_monotonic_enough() {
        let a = now_micros();
        let b = now_micros();
        assert!(b >= a);
    }
}

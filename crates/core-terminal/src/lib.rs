//! Terminal primitives shared by the display and cursor layers.
//!
//! Everything here targets a specific file descriptor: the window-size
//! query and `TOSTOP` assert act on standard error, the advisory lock and
//! the cursor-position-report exchange act on whatever descriptor the
//! cursor coordinator opened for the controlling terminal. The lock is a
//! file-system record lock on byte 0 so it is visible across unrelated
//! processes sharing the terminal; some BSD-family kernels refuse record
//! locks on ttys, which callers treat as "coordination unavailable", not
//! as a fatal error.

use nix::sys::termios::{self, LocalFlags, SetArg, Termios};
use std::ffi::{CStr, OsString};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::os::unix::ffi::OsStringExt;
use std::path::PathBuf;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum TermError {
    #[error("failed to lock terminal: {0}")]
    Lock(std::io::Error),
    #[error("cursor position query failed: {0}")]
    Cpr(std::io::Error),
    #[error("terminal attribute access failed: {0}")]
    Termios(#[from] nix::Error),
}

/// Whether standard error is attached to a terminal at all. A display
/// aimed at a pipe or file is suppressed unless forced.
pub fn stderr_is_tty() -> bool {
    unsafe { libc::isatty(libc::STDERR_FILENO) == 1 }
}

/// Current terminal dimensions (columns, rows) of standard error, when it
/// is a terminal. Queried at startup and again after every window-change
/// signal.
pub fn screen_size() -> Option<(u32, u32)> {
    if !stderr_is_tty() {
        return None;
    }
    let mut wsz: libc::winsize = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::ioctl(libc::STDERR_FILENO, libc::TIOCGWINSZ, &mut wsz) };
    if rc != 0 {
        return None;
    }
    Some((u32::from(wsz.ws_col), u32::from(wsz.ws_row)))
}

/// Path of the terminal device behind standard error, if any.
pub fn tty_path() -> Option<PathBuf> {
    let mut buf = [0 as libc::c_char; 256];
    let rc = unsafe { libc::ttyname_r(libc::STDERR_FILENO, buf.as_mut_ptr(), buf.len()) };
    if rc != 0 {
        return None;
    }
    let bytes = unsafe { CStr::from_ptr(buf.as_ptr()) }.to_bytes().to_vec();
    Some(PathBuf::from(OsString::from_vec(bytes)))
}

fn record_lock(kind: libc::c_short) -> libc::flock {
    let mut fl: libc::flock = unsafe { std::mem::zeroed() };
    fl.l_type = kind;
    fl.l_whence = libc::SEEK_SET as libc::c_short;
    fl.l_start = 0;
    fl.l_len = 1;
    fl
}

/// Advisory exclusive lock on byte 0 of the terminal device, released on
/// drop. Serializes cursor movement between cooperating instances.
pub struct TtyLock<'fd> {
    fd: BorrowedFd<'fd>,
}

impl<'fd> TtyLock<'fd> {
    /// Block until the lock is granted. `EINTR` retries; any other
    /// refusal is returned so the caller can disable coordination.
    pub fn acquire(fd: BorrowedFd<'fd>) -> Result<Self, TermError> {
        let fl = record_lock(libc::F_WRLCK as libc::c_short);
        loop {
            let rc = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETLKW, &fl) };
            if rc == 0 {
                return Ok(Self { fd });
            }
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            debug!(target: "terminal", error = %err, "tty_lock_refused");
            return Err(TermError::Lock(err));
        }
    }
}

impl Drop for TtyLock<'_> {
    fn drop(&mut self) {
        let fl = record_lock(libc::F_UNLCK as libc::c_short);
        unsafe { libc::fcntl(self.fd.as_raw_fd(), libc::F_SETLK, &fl) };
    }
}

/// Saves the terminal attributes on creation and restores them on drop,
/// so a failed cursor-position exchange cannot leave the terminal in
/// non-canonical mode.
struct TermiosGuard<'fd> {
    fd: BorrowedFd<'fd>,
    saved: Termios,
}

impl<'fd> TermiosGuard<'fd> {
    fn raw(fd: BorrowedFd<'fd>) -> Result<Self, TermError> {
        let saved = termios::tcgetattr(fd)?;
        let mut tty = saved.clone();
        tty.local_flags
            .remove(LocalFlags::ICANON | LocalFlags::ECHO);
        termios::tcsetattr(fd, SetArg::TCSAFLUSH, &tty)?;
        Ok(Self { fd, saved })
    }
}

impl Drop for TermiosGuard<'_> {
    fn drop(&mut self) {
        let _ = termios::tcsetattr(self.fd, SetArg::TCSAFLUSH, &self.saved);
    }
}

/// Ask the terminal where the cursor is and return the reported row.
///
/// Emits `ESC[6n` with the terminal transiently in non-canonical no-echo
/// mode and parses the `ESC[row;colR` reply. A leading newline can be
/// requested to guarantee the row below the prompt exists before asking.
/// Returns 0 when the terminal did not answer with a usable row; the
/// caller decides whether that disables cursor positioning.
pub fn query_cursor_row(fd: BorrowedFd<'_>, leading_newline: bool) -> Result<u32, TermError> {
    let _guard = TermiosGuard::raw(fd)?;

    let query: &[u8] = if leading_newline {
        b"\n\x1b[6n"
    } else {
        b"\x1b[6n"
    };
    write_all(fd, query).map_err(TermError::Cpr)?;

    let mut reply = [0u8; 16];
    let mut used = 0;
    while used < reply.len() {
        let n = unsafe {
            libc::read(
                fd.as_raw_fd(),
                reply[used..].as_mut_ptr().cast(),
                reply.len() - used,
            )
        };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(TermError::Cpr(err));
        }
        if n == 0 {
            break;
        }
        used += n as usize;
        if reply[..used].contains(&b'R') {
            break;
        }
    }

    let row = core_units::parse_u32(&String::from_utf8_lossy(&reply[..used]));
    debug!(target: "terminal", row, reply_len = used, "cursor_position_report");
    Ok(row)
}

/// Set `TOSTOP` on the given terminal so a backgrounded writer receives
/// `SIGTTOU` instead of scribbling over the foreground job.
pub fn set_tostop(fd: BorrowedFd<'_>) -> Result<(), TermError> {
    let mut tty = termios::tcgetattr(fd)?;
    tty.local_flags.insert(LocalFlags::TOSTOP);
    termios::tcsetattr(fd, SetArg::TCSANOW, &tty)?;
    Ok(())
}

/// OR `O_NONBLOCK` onto the descriptor's flags (used on standard output
/// so a saturated pipe never wedges the readiness loop).
pub fn set_nonblocking<Fd: AsFd>(fd: Fd) -> std::io::Result<()> {
    let raw = fd.as_fd().as_raw_fd();
    let flags = unsafe { libc::fcntl(raw, libc::F_GETFL) };
    if flags < 0 {
        return Err(std::io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(raw, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Write the whole buffer, retrying on `EINTR` and short writes.
pub fn write_all(fd: BorrowedFd<'_>, mut buf: &[u8]) -> std::io::Result<()> {
    while !buf.is_empty() {
        let n = unsafe { libc::write(fd.as_raw_fd(), buf.as_ptr().cast(), buf.len()) };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(err);
        }
        buf = &buf[n as usize..];
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::fd::AsFd;

    #[test]
    fn record_lock_round_trip_on_regular_file() {
        // Record locks behave the same on a regular file as on a tty that
        // permits them, which keeps this testable without a terminal.
        let file = tempfile::NamedTempFile::new().unwrap();
        let lock = TtyLock::acquire(file.as_file().as_fd()).unwrap();
        drop(lock);
        // Re-acquire after release to prove the unlock happened.
        let lock = TtyLock::acquire(file.as_file().as_fd()).unwrap();
        drop(lock);
    }

    #[test]
    fn write_all_handles_short_writes() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let payload = vec![0xA5u8; 128 * 1024];
        write_all(file.as_file().as_fd(), &payload).unwrap();
        file.flush().unwrap();
        assert_eq!(
            file.as_file().metadata().unwrap().len(),
            payload.len() as u64
        );
    }

    #[test]
    fn screen_size_without_tty_is_none_or_sane() {
        // Under a test harness stderr is usually a pipe; when it is a real
        // terminal the dimensions must at least be nonzero.
        if let Some((cols, rows)) = screen_size() {
            assert!(cols > 0 && rows > 0);
        }
    }
}

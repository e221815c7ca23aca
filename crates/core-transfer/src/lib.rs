//! The transfer engine: one buffer, two descriptors, no blocking.
//!
//! Each call waits up to 90 ms for the input to become readable or the
//! output writable, moves whatever is ready, and hands control back to
//! the main loop so pacing and display stay responsive. The single
//! buffer is compacted after every partial drain, which keeps each read
//! as large as the kernel will allow.
//!
//! Transient conditions (`EINTR`, `EAGAIN`) are absorbed with a short
//! pause and report zero progress; `EPIPE` from the output means the
//! reader downstream is done and quietly ends the transfer. Anything
//! else is a hard error: both end-of-file flags are set so the stream
//! cannot limp on half-closed, and the error is returned for the caller
//! to diagnose and fail the run with.

use core_config::Config;
use nix::errno::Errno;
use nix::sys::select::{FdSet, select};
use nix::sys::time::{TimeVal, TimeValLike};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, trace};

/// Default transfer buffer size in bytes.
pub const DEFAULT_BUFFER_SIZE: usize = 409_600;
/// Hard cap applied to automatic sizing; an explicit `--buffer-size`
/// bypasses it.
pub const MAX_BUFFER_SIZE: usize = 524_288;

const READY_TIMEOUT_US: i64 = 90_000;
const TRANSIENT_PAUSE: Duration = Duration::from_millis(10);

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("buffer allocation failed")]
    BufferAlloc,
    #[error("select call failed: {0}")]
    Select(Errno),
    #[error("read failed: {0}")]
    Read(std::io::Error),
    #[error("write failed: {0}")]
    Write(std::io::Error),
}

/// End-of-stream flags for the current input.
///
/// `input` is set when a read returns zero or fails hard; `output` is set
/// once everything read has been written (or the output failed). Both set
/// means this input is finished and the loop may rotate to the next one.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EofState {
    pub input: bool,
    pub output: bool,
}

impl EofState {
    pub fn done(&self) -> bool {
        self.input && self.output
    }

    /// Fresh flags for the next input in the list.
    pub fn reset(&mut self) {
        *self = EofState::default();
    }
}

/// Bytes (and, for line mode, newlines) written by one engine call.
#[derive(Debug, Default, Clone, Copy)]
pub struct Progress {
    pub bytes: u64,
    pub lines: u64,
}

/// The engine itself, owning the output descriptor and the transfer
/// buffer for the whole run. Dropping it releases both.
pub struct Transfer<W: AsFd> {
    out: W,
    buf: Vec<u8>,
    filled: usize,
    consumed: usize,
    size: usize,
}

fn raw_read(fd: BorrowedFd<'_>, buf: &mut [u8]) -> std::io::Result<usize> {
    let n = unsafe { libc::read(fd.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len()) };
    if n < 0 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

fn raw_write(fd: BorrowedFd<'_>, buf: &[u8]) -> std::io::Result<usize> {
    let n = unsafe { libc::write(fd.as_raw_fd(), buf.as_ptr().cast(), buf.len()) };
    if n < 0 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

fn is_transient(err: &std::io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EINTR) | Some(libc::EAGAIN)
    )
}

impl<W: AsFd> Transfer<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            buf: Vec::new(),
            filled: 0,
            consumed: 0,
            size: DEFAULT_BUFFER_SIZE,
        }
    }

    /// Adjust the buffer size before the first transfer. Automatic sizing
    /// (from the input's preferred block size) is capped; an explicit
    /// user override is not. Ignored once the buffer exists.
    pub fn set_buffer_size(&mut self, size: usize, force: bool) {
        if !self.buf.is_empty() || size == 0 {
            return;
        }
        let capped = if size > MAX_BUFFER_SIZE && !force {
            MAX_BUFFER_SIZE
        } else {
            size
        };
        self.size = capped;
        debug!(target: "transfer", size = capped, force, "buffer_size_set");
    }

    pub fn buffer_size(&self) -> usize {
        self.size
    }

    /// Move data from `input` toward the output, honouring `allowed` when
    /// a rate limit is active. Returns the progress made by this call;
    /// zero progress is normal (nothing was ready, or a transient error
    /// was absorbed).
    pub fn transfer(
        &mut self,
        cfg: &Config,
        input: BorrowedFd<'_>,
        eof: &mut EofState,
        allowed: u64,
    ) -> Result<Progress, TransferError> {
        if self.buf.is_empty() {
            let mut fresh = Vec::new();
            fresh
                .try_reserve_exact(self.size)
                .map_err(|_| TransferError::BufferAlloc)?;
            fresh.resize(self.size, 0);
            self.buf = fresh;
        }

        let Transfer {
            out,
            buf,
            filled,
            consumed,
            size,
        } = self;
        let out_fd = out.as_fd();

        let mut readfds = FdSet::new();
        let mut writefds = FdSet::new();

        if !eof.input && *filled < *size {
            readfds.insert(input);
        }

        let mut to_write = *filled - *consumed;
        if cfg.rate_limit > 0 {
            to_write = to_write.min(allowed as usize);
        }
        if !eof.output && to_write > 0 {
            writefds.insert(out_fd);
        }

        if eof.done() {
            return Ok(Progress::default());
        }

        let mut timeout = TimeVal::microseconds(READY_TIMEOUT_US);
        match select(None, &mut readfds, &mut writefds, None, &mut timeout) {
            Ok(_) => {}
            Err(Errno::EINTR) => return Ok(Progress::default()),
            Err(err) => return Err(TransferError::Select(err)),
        }

        if readfds.contains(input) {
            match raw_read(input, &mut buf[*filled..*size]) {
                Ok(0) => {
                    eof.input = true;
                    if *consumed >= *filled {
                        eof.output = true;
                    }
                    trace!(target: "transfer", "input_eof");
                }
                Ok(n) => {
                    *filled += n;
                }
                Err(err) if is_transient(&err) => {
                    std::thread::sleep(TRANSIENT_PAUSE);
                    return Ok(Progress::default());
                }
                Err(err) => {
                    eof.input = true;
                    if *consumed >= *filled {
                        eof.output = true;
                    }
                    return Err(TransferError::Read(err));
                }
            }
        }

        let mut progress = Progress::default();

        if to_write > 0 && writefds.contains(out_fd) && *filled > *consumed {
            // A pathologically slow sink could otherwise wedge this write
            // past the readiness timeout.
            unsafe {
                libc::signal(libc::SIGALRM, libc::SIG_IGN);
                libc::alarm(1);
            }
            let result = raw_write(out_fd, &buf[*consumed..*consumed + to_write]);
            unsafe {
                libc::alarm(0);
            }

            match result {
                Ok(0) => {
                    eof.output = true;
                }
                Ok(written) => {
                    if cfg.line_mode {
                        progress.lines = buf[*consumed..*consumed + written]
                            .iter()
                            .filter(|&&b| b == b'\n')
                            .count() as u64;
                    }
                    progress.bytes = written as u64;
                    *consumed += written;
                    if *consumed >= *filled {
                        *consumed = 0;
                        *filled = 0;
                        if eof.input {
                            eof.output = true;
                        }
                    }
                }
                Err(err) if is_transient(&err) => {
                    std::thread::sleep(TRANSIENT_PAUSE);
                    return Ok(Progress::default());
                }
                Err(err) if err.raw_os_error() == Some(libc::EPIPE) => {
                    // The reader hung up; that is its prerogative, not an
                    // error worth reporting.
                    eof.input = true;
                    eof.output = true;
                    trace!(target: "transfer", "output_epipe");
                    return Ok(Progress::default());
                }
                Err(err) => {
                    eof.output = true;
                    return Err(TransferError::Write(err));
                }
            }
        }

        // Rotate written bytes out so the next read can fill the whole
        // buffer.
        if *consumed > 0 {
            if *consumed < *filled {
                buf.copy_within(*consumed..*filled, 0);
                *filled -= *consumed;
            } else {
                *filled = 0;
            }
            *consumed = 0;
        }

        Ok(progress)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::OwnedFd;

    fn pipe_pair() -> (OwnedFd, OwnedFd) {
        nix::unistd::pipe().expect("pipe")
    }

    fn cfg() -> Config {
        Config::default()
    }

    #[test]
    fn buffer_size_capped_unless_forced() {
        let (_r, w) = pipe_pair();
        let mut engine = Transfer::new(w);
        engine.set_buffer_size(10 * MAX_BUFFER_SIZE, false);
        assert_eq!(engine.buffer_size(), MAX_BUFFER_SIZE);

        let (_r, w) = pipe_pair();
        let mut engine = Transfer::new(w);
        engine.set_buffer_size(10 * MAX_BUFFER_SIZE, true);
        assert_eq!(engine.buffer_size(), 10 * MAX_BUFFER_SIZE);
    }

    #[test]
    fn zero_size_request_keeps_default() {
        let (_r, w) = pipe_pair();
        let mut engine = Transfer::new(w);
        engine.set_buffer_size(0, false);
        assert_eq!(engine.buffer_size(), DEFAULT_BUFFER_SIZE);
    }

    #[test]
    fn double_eof_short_circuits() {
        let (in_r, _in_w) = pipe_pair();
        let (_out_r, out_w) = pipe_pair();
        let mut engine = Transfer::new(out_w);
        let mut eof = EofState {
            input: true,
            output: true,
        };
        let progress = engine
            .transfer(&cfg(), in_r.as_fd(), &mut eof, 0)
            .unwrap();
        assert_eq!(progress.bytes, 0);
    }

    #[test]
    fn indices_stay_ordered_across_partial_drains() {
        let (in_r, in_w) = pipe_pair();
        let (out_r, out_w) = pipe_pair();
        raw_write(in_w.as_fd(), b"0123456789").unwrap();
        drop(in_w);

        let mut config = cfg();
        config.rate_limit = 1; // enable clamping so `allowed` applies
        let mut engine = Transfer::new(out_w);
        let mut eof = EofState::default();
        let mut moved = 0u64;

        for _ in 0..64 {
            let progress = engine
                .transfer(&config, in_r.as_fd(), &mut eof, 3)
                .unwrap();
            assert!(progress.bytes <= 3, "rate clamp exceeded");
            moved += progress.bytes;
            assert!(engine.consumed <= engine.filled);
            assert!(engine.filled <= engine.buffer_size());
            if eof.done() {
                break;
            }
        }

        assert!(eof.done());
        assert_eq!(moved, 10);
        drop(engine);
        let mut sink = Vec::new();
        let mut chunk = [0u8; 64];
        loop {
            match raw_read(out_r.as_fd(), &mut chunk) {
                Ok(0) => break,
                Ok(n) => sink.extend_from_slice(&chunk[..n]),
                Err(e) => panic!("read back failed: {e}"),
            }
        }
        assert_eq!(sink, b"0123456789");
    }
}

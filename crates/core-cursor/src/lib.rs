//! Cursor positioning across concurrent instances.
//!
//! Several transfers piping through the same terminal each want their own
//! status row. Coordination happens through a one-integer System V shared
//! memory segment keyed off the terminal device (`ftok(tty, 'p')`): the
//! integer holds the row of the topmost instance, the segment's attach
//! count assigns each newcomer the next row down, and the terminal's
//! advisory record lock serializes both the attach-and-check dance and
//! every escape-sequence write.
//!
//! When shared memory or terminal locking is unavailable (BSD-family
//! kernels refuse record locks on ttys), coordination degrades to a
//! single-instance cursor-position query with a leading newline; each
//! instance simply overwrites its own row and ignores the others.

use core_config::Config;
use core_terminal::{TtyLock, query_cursor_row, tty_path, write_all};
use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use tracing::{debug, warn};

const ROW_LIMIT: i32 = 999_999;

/// Clamp a computed row into the range the escape sequence can express.
fn clamp_row(row: i32) -> i32 {
    if !(1..=ROW_LIMIT).contains(&row) { 1 } else { row }
}

/// How many rows the tile set hangs past the bottom of the screen.
fn scroll_excess(y_start: i32, instances: i32, height: i32) -> i32 {
    (y_start + instances - height).max(0)
}

struct SharedRow {
    shmid: i32,
    ptr: *mut i32,
}

impl SharedRow {
    fn attach(key: libc::key_t) -> Option<Self> {
        let shmid = unsafe {
            libc::shmget(key, std::mem::size_of::<i32>(), 0o600 | libc::IPC_CREAT)
        };
        if shmid < 0 {
            return None;
        }
        let ptr = unsafe { libc::shmat(shmid, std::ptr::null(), 0) };
        if ptr as isize == -1 {
            return None;
        }
        Some(Self {
            shmid,
            ptr: ptr.cast(),
        })
    }

    /// Number of processes currently attached, from `IPC_STAT`.
    fn attach_count(&self) -> i32 {
        let mut ds: libc::shmid_ds = unsafe { std::mem::zeroed() };
        unsafe {
            libc::shmctl(self.shmid, libc::IPC_STAT, &mut ds);
        }
        ds.shm_nattch as i32
    }

    fn read_top(&self) -> i32 {
        unsafe { std::ptr::read_volatile(self.ptr) }
    }

    fn write_top(&self, row: i32) {
        unsafe {
            std::ptr::write_volatile(self.ptr, row);
        }
    }

    /// Detach, removing the segment when we were the last user.
    fn detach(self) {
        let last = self.attach_count() < 2;
        unsafe {
            libc::shmdt(self.ptr.cast());
            if last {
                libc::shmctl(self.shmid, libc::IPC_RMID, std::ptr::null_mut());
            }
        }
    }
}

/// Per-instance cursor state. Built by [`CursorState::init`]; the main
/// loop routes every display line through [`CursorState::update`] and
/// calls [`CursorState::fini`] once the transfer ends.
pub struct CursorState {
    active: bool,
    /// Row of the topmost instance.
    y_start: i32,
    /// Our distance below it (0 for the first instance).
    y_offset: i32,
    /// Last top-row value seen in the shared cell.
    y_lastread: i32,
    /// Current and highest-seen attach counts.
    instance_count: i32,
    max_instances: i32,
    shared: Option<SharedRow>,
    /// Cleared once the terminal refuses a record lock, so we stop
    /// retrying a lock that will never be granted.
    lock_usable: bool,
}

impl CursorState {
    fn inactive() -> Self {
        Self {
            active: false,
            y_start: 0,
            y_offset: 0,
            y_lastread: 0,
            instance_count: 1,
            max_instances: 0,
            shared: None,
            lock_usable: true,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Set up cursor positioning. On any failure the `cursor` option is
    /// cleared and the caller falls back to carriage-return overwrite.
    pub fn init(cfg: &mut Config) -> Self {
        let mut state = Self::inactive();
        if !cfg.cursor {
            return state;
        }

        let Some(path) = tty_path() else {
            cfg.cursor = false;
            return state;
        };

        let tty = match OpenOptions::new().read(true).write(true).open(&path) {
            Ok(file) => file,
            Err(err) => {
                eprintln!(
                    "{}: failed to open terminal: {}: {}",
                    cfg.program_name,
                    path.display(),
                    err
                );
                cfg.cursor = false;
                return state;
            }
        };

        if !state.ipc_init(&path, &tty) {
            // Single-instance fallback: the leading newline guarantees
            // the row we are about to claim exists.
            let _lock = state.lock(tty.as_fd());
            match query_cursor_row(tty.as_fd(), true) {
                Ok(row) if row >= 1 => {
                    state.y_start = row as i32;
                }
                _ => {
                    cfg.cursor = false;
                    return state;
                }
            }
        }

        state.active = true;
        debug!(
            target: "cursor",
            y_start = state.y_start,
            y_offset = state.y_offset,
            coordinated = state.shared.is_some(),
            "cursor_initialised"
        );
        state
    }

    /// Attach to (or create) the shared row cell. Returns false when
    /// coordination is unavailable and the caller should fall back.
    fn ipc_init(&mut self, path: &Path, tty: &File) -> bool {
        let Ok(c_path) = CString::new(path.as_os_str().as_bytes()) else {
            return false;
        };
        let key = unsafe { libc::ftok(c_path.as_ptr(), 'p' as libc::c_int) };
        if key == -1 {
            warn!(target: "cursor", path = %path.display(), "ftok_failed");
            return false;
        }

        // The attach-and-check must be atomic across instances, or two
        // newcomers could both see an attach count of one and fight over
        // the top row.
        let Some(lock) = self.lock(tty.as_fd()) else {
            return false;
        };

        let Some(shared) = SharedRow::attach(key) else {
            warn!(target: "cursor", "shm_attach_failed");
            drop(lock);
            return false;
        };

        self.instance_count = shared.attach_count();
        self.max_instances = self.max_instances.max(self.instance_count);

        if self.instance_count < 2 {
            // First instance: ask the terminal where we are and publish it.
            if let Ok(row) = query_cursor_row(tty.as_fd(), false) {
                self.y_start = row as i32;
            }
            shared.write_top(self.y_start);
            self.y_lastread = self.y_start;
        }

        self.y_offset = (self.instance_count - 1).max(0);

        if self.instance_count > 1 {
            self.y_start = shared.read_top();
            self.y_lastread = self.y_start;
        }

        self.shared = Some(shared);
        drop(lock);
        true
    }

    fn lock<'fd>(&mut self, fd: BorrowedFd<'fd>) -> Option<TtyLock<'fd>> {
        if !self.lock_usable {
            return None;
        }
        match TtyLock::acquire(fd) {
            Ok(lock) => Some(lock),
            Err(_) => {
                self.lock_usable = false;
                None
            }
        }
    }

    /// Re-anchor after a continue signal. The first instance re-queries
    /// the terminal immediately; followers burn one extra update first so
    /// a cursor-position reply lost to the stop cannot misplace them.
    fn reinit(&mut self, fd: BorrowedFd<'_>) {
        let _lock = self.lock(fd);

        core_signals::cursor_reinit_decrement();
        if self.y_offset < 1 {
            core_signals::cursor_reinit_clear();
        }
        if core_signals::cursor_reinit_pending() {
            return;
        }

        if let Ok(row) = query_cursor_row(fd, false) {
            self.y_start = row as i32;
        }

        if self.y_offset < 1
            && let Some(shared) = &self.shared
        {
            shared.write_top(self.y_start);
        }
        self.y_lastread = self.y_start;
    }

    /// Write one display line at this instance's row.
    pub fn update(&mut self, cfg: &Config, line: &str) {
        if !self.active {
            return;
        }
        let stderr = std::io::stderr();
        let fd = stderr.as_fd();

        if self.shared.is_some() {
            if core_signals::cursor_reinit_pending() {
                self.reinit(fd);
            }

            if let Some(shared) = &self.shared {
                self.instance_count = shared.attach_count();
                self.max_instances = self.max_instances.max(self.instance_count);
                let top = shared.read_top();
                if self.y_lastread != top {
                    self.y_start = top;
                    self.y_lastread = top;
                }
            }

            if core_signals::cursor_reinit_pending() {
                return;
            }

            // Tiles about to run off the bottom: the first instance
            // scrolls the screen and everyone shifts up.
            let excess = scroll_excess(self.y_start, self.max_instances, cfg.height as i32);
            if excess > 0 {
                self.y_start = (self.y_start - excess).max(1);
                if self.y_offset == 0 {
                    let _lock = self.lock(fd);
                    let mut seq = format!("\x1b[{};1H", cfg.height);
                    for _ in 0..excess {
                        seq.push('\n');
                    }
                    let _ = write_all(fd, seq.as_bytes());
                }
            }
        }

        let row = if self.shared.is_some() {
            self.y_start + self.y_offset
        } else {
            self.y_start
        };
        let row = clamp_row(row);

        let _lock = self.lock(fd);
        let mut seq = format!("\x1b[{row};1H");
        seq.push_str(line);
        let _ = write_all(fd, seq.as_bytes());
    }

    /// Park the cursor below the tile set and detach from the shared
    /// segment, removing it if we were the last instance out.
    pub fn fini(&mut self, cfg: &Config) {
        if !self.active {
            return;
        }
        self.active = false;

        let stderr = std::io::stderr();
        let fd = stderr.as_fd();

        let mut row = self.y_start;
        if self.shared.is_some() && self.max_instances > 0 {
            row += self.max_instances - 1;
        }
        row = clamp_row(row.min(cfg.height as i32));

        let _lock = self.lock(fd);
        let _ = write_all(fd, format!("\x1b[{row};1H\n").as_bytes());

        if let Some(shared) = self.shared.take() {
            shared.detach();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_clamping() {
        assert_eq!(clamp_row(0), 1);
        assert_eq!(clamp_row(-5), 1);
        assert_eq!(clamp_row(1), 1);
        assert_eq!(clamp_row(42), 42);
        assert_eq!(clamp_row(ROW_LIMIT), ROW_LIMIT);
        assert_eq!(clamp_row(ROW_LIMIT + 1), 1);
    }

    #[test]
    fn scroll_excess_only_past_the_bottom() {
        assert_eq!(scroll_excess(20, 3, 25), 0);
        assert_eq!(scroll_excess(24, 3, 25), 2);
        assert_eq!(scroll_excess(1, 1, 25), 0);
        assert_eq!(scroll_excess(25, 1, 25), 1);
    }

    #[test]
    fn shared_row_cell_round_trips() {
        // IPC_PRIVATE gives the test its own segment without a tty key.
        let shmid = unsafe {
            libc::shmget(
                libc::IPC_PRIVATE,
                std::mem::size_of::<i32>(),
                0o600 | libc::IPC_CREAT,
            )
        };
        assert!(shmid >= 0, "shmget failed");
        let ptr = unsafe { libc::shmat(shmid, std::ptr::null(), 0) };
        assert!(ptr as isize != -1, "shmat failed");

        let cell = SharedRow {
            shmid,
            ptr: ptr.cast(),
        };
        assert_eq!(cell.attach_count(), 1);
        cell.write_top(17);
        assert_eq!(cell.read_top(), 17);
        cell.detach();
    }

    #[test]
    fn inactive_state_ignores_updates() {
        let cfg = Config::default();
        let mut state = CursorState::inactive();
        state.update(&cfg, "should go nowhere");
        state.fini(&cfg);
    }

    #[test]
    fn init_without_cursor_mode_stays_inactive() {
        let mut cfg = Config::default();
        let state = CursorState::init(&mut cfg);
        assert!(!state.is_active());
    }
}

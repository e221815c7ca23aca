//! Input source management: pre-flight size accounting and input rotation.
//!
//! Pre-flight walks the input list once, summing the sizes of regular
//! files and block devices into the advisory total the display uses for
//! percent and ETA. Inputs that cannot be statted or read are warned
//! about and removed from the list in place, preserving order, so the
//! transfer still runs over whatever remains. At runtime the loop asks
//! for one input at a time; dropping the previous [`InputSource`] closes
//! its descriptor (standard input is never closed).

use core_config::Config;
use std::ffi::CString;
use std::fs::File;
use std::io::{Seek, SeekFrom};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("failed to read file: {path}: {source}")]
    Open {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to stat file: {path}: {source}")]
    Stat {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to stat output file: {0}")]
    StatOutput(std::io::Error),
    #[error("input file is output file: {0}")]
    InputIsOutput(String),
    #[error("no more input files")]
    EndOfInputs,
}

/// One open input. Standard input is borrowed, never closed; files are
/// owned and close when the source is dropped.
#[derive(Debug)]
pub enum InputSource {
    Stdin(std::io::Stdin),
    File(File),
}

impl AsFd for InputSource {
    fn as_fd(&self) -> BorrowedFd<'_> {
        match self {
            InputSource::Stdin(handle) => handle.as_fd(),
            InputSource::File(file) => file.as_fd(),
        }
    }
}

impl InputSource {
    /// Preferred I/O block size of the underlying descriptor, used to
    /// raise the transfer buffer toward `blksize * 32` at startup.
    pub fn block_size(&self) -> Option<u64> {
        fd_stat(self.as_fd().as_raw_fd())
            .ok()
            .map(|sb| sb.st_blksize as u64)
    }
}

fn fd_stat(fd: RawFd) -> std::io::Result<libc::stat> {
    let mut sb: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(fd, &mut sb) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(sb)
}

fn path_stat(path: &Path) -> std::io::Result<libc::stat> {
    let c = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| std::io::Error::from(std::io::ErrorKind::InvalidInput))?;
    let mut sb: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::stat(c.as_ptr(), &mut sb) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(sb)
}

fn readable(path: &Path) -> std::io::Result<()> {
    let c = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| std::io::Error::from(std::io::ErrorKind::InvalidInput))?;
    if unsafe { libc::access(c.as_ptr(), libc::R_OK) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

fn is_stdin(path: &Path) -> bool {
    path.as_os_str() == "-"
}

fn mode_is(sb: &libc::stat, mask: libc::mode_t) -> bool {
    (sb.st_mode & libc::S_IFMT) == mask
}

/// A block device's size only shows up by seeking to its end.
fn block_device_size(path: &Path) -> u64 {
    let open_path: &Path = if is_stdin(path) {
        Path::new("/dev/stdin")
    } else {
        path
    };
    match File::open(open_path) {
        Ok(mut file) => file.seek(SeekFrom::End(0)).unwrap_or(0),
        Err(_) => 0,
    }
}

/// Sum the sizes of all inputs into the advisory total.
///
/// With no inputs at all, standard input's own size is the answer (zero
/// for pipes and other non-regular sources). Unusable inputs are
/// diagnosed on standard error and dropped from `cfg.inputs` in place.
pub fn total_size(cfg: &mut Config) -> u64 {
    if cfg.inputs.is_empty() {
        return match fd_stat(libc::STDIN_FILENO) {
            Ok(sb) if mode_is(&sb, libc::S_IFREG) => sb.st_size as u64,
            _ => 0,
        };
    }

    let mut total: u64 = 0;
    let mut i = 0;
    while i < cfg.inputs.len() {
        let path = cfg.inputs[i].clone();

        let sb = if is_stdin(&path) {
            match fd_stat(libc::STDIN_FILENO) {
                Ok(sb) => Ok(sb),
                // Standard input itself is unusable: the whole total is
                // meaningless, report it as unknown.
                Err(_) => return 0,
            }
        } else {
            path_stat(&path).and_then(|sb| readable(&path).map(|()| sb))
        };

        let sb = match sb {
            Ok(sb) => sb,
            Err(err) => {
                eprintln!("{}: {}: {}", cfg.program_name, path.display(), err);
                warn!(target: "source", path = %path.display(), error = %err, "input_dropped");
                cfg.inputs.remove(i);
                continue;
            }
        };

        if mode_is(&sb, libc::S_IFBLK) {
            total = total.saturating_add(block_device_size(&path));
        } else if mode_is(&sb, libc::S_IFREG) {
            total = total.saturating_add(sb.st_size as u64);
        }
        i += 1;
    }

    debug!(target: "source", total, inputs = cfg.inputs.len(), "preflight_total");
    total
}

/// Open input number `index`, refusing an input that is the same file the
/// output descriptor points at (same device and inode) unless it is a
/// terminal. The caller drops the previous source first; standard input
/// survives that drop.
pub fn open_next<Fd: AsFd>(
    cfg: &Config,
    index: usize,
    output: Fd,
) -> Result<InputSource, SourceError> {
    let path = cfg.inputs.get(index).ok_or(SourceError::EndOfInputs)?;
    let path_display = path.display().to_string();

    let source = if is_stdin(path) {
        InputSource::Stdin(std::io::stdin())
    } else {
        InputSource::File(File::open(path).map_err(|source| SourceError::Open {
            path: path_display.clone(),
            source,
        })?)
    };

    let isb = fd_stat(source.as_fd().as_raw_fd()).map_err(|source| SourceError::Stat {
        path: path_display.clone(),
        source,
    })?;
    let osb = fd_stat(output.as_fd().as_raw_fd()).map_err(SourceError::StatOutput)?;

    if isb.st_dev == osb.st_dev
        && isb.st_ino == osb.st_ino
        && unsafe { libc::isatty(source.as_fd().as_raw_fd()) } != 1
    {
        return Err(SourceError::InputIsOutput(path_display));
    }

    debug!(target: "source", index, path = %path_display, "input_opened");
    Ok(source)
}

//! The runtime configuration record.
//!
//! Option parsing in the binary fills a [`Config`]; everything else in the
//! workspace reads it. The record is immutable after normalization except
//! for a handful of runtime-updated fields: the terminal dimensions (window
//! size changes), `wait` (cleared once the first byte arrives), `show_eta`
//! (downgraded when the total size is unknown), `cursor` (disabled when the
//! terminal cannot be coordinated) and the accumulated `exit_status`.
//!
//! Normalization clamps are logged under `target: "config"` so a transfer
//! that behaves unexpectedly can be diagnosed from the log file without
//! disturbing the display.

use std::path::PathBuf;
use tracing::info;

/// Exit-status bit recording a display buffer allocation failure. The
/// transfer itself keeps running when this happens; the bit is OR-ed into
/// the process exit status at the end.
pub const EXIT_DISPLAY_ALLOC: i32 = 64;

/// Interval bounds in seconds.
pub const INTERVAL_MIN: f64 = 0.1;
pub const INTERVAL_MAX: f64 = 600.0;

/// Terminal dimension bounds.
pub const DIMENSION_MAX: u32 = 999_999;

const DEFAULT_WIDTH: u32 = 80;
const DEFAULT_HEIGHT: u32 = 25;

/// What the binary learned about the controlling terminal at startup;
/// feeds [`Config::apply_terminal`].
#[derive(Debug, Clone, Copy, Default)]
pub struct TermContext {
    pub stderr_is_tty: bool,
    /// Columns and rows from `TIOCGWINSZ`, when standard error is a tty.
    pub size: Option<(u32, u32)>,
}

#[derive(Debug, Clone)]
pub struct Config {
    // Display component toggles.
    pub show_progress: bool,
    pub show_timer: bool,
    pub show_eta: bool,
    pub show_rate: bool,
    pub show_average_rate: bool,
    pub show_bytes: bool,
    pub show_name: bool,

    /// Emit only an integer percentage, one per line.
    pub numeric: bool,
    /// Display even when standard error is not a terminal.
    pub force: bool,
    /// Transfer only; no display at all.
    pub quiet: bool,
    /// Suppress the display and the clock until the first byte moves.
    pub wait: bool,
    /// Absolute cursor positioning instead of carriage-return overwrite.
    pub cursor: bool,
    /// Count newline-terminated records rather than bytes.
    pub line_mode: bool,

    /// Known total in bytes (or lines in line mode); 0 = unknown.
    pub total_size: u64,
    /// Maximum throughput in bytes per second; 0 = unlimited.
    pub rate_limit: u64,
    /// Explicit transfer buffer size; 0 = auto.
    pub buffer_size: usize,
    /// Display refresh period in seconds.
    pub interval: f64,
    pub width: u32,
    pub height: u32,

    /// Optional left-hand label.
    pub name: Option<String>,
    /// Ordered input paths; `-` designates standard input.
    pub inputs: Vec<PathBuf>,
    /// Used only in diagnostics.
    pub program_name: String,
    /// Accumulated exit-status bitmask.
    pub exit_status: i32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            show_progress: false,
            show_timer: false,
            show_eta: false,
            show_rate: false,
            show_average_rate: false,
            show_bytes: false,
            show_name: false,
            numeric: false,
            force: false,
            quiet: false,
            wait: false,
            cursor: false,
            line_mode: false,
            total_size: 0,
            rate_limit: 0,
            buffer_size: 0,
            interval: 1.0,
            width: 0,
            height: 0,
            name: None,
            inputs: Vec::new(),
            program_name: String::from("pipewatch"),
            exit_status: 0,
        }
    }
}

impl Config {
    /// Turn on the default display set. Called when no display toggle at
    /// all was given on the command line.
    pub fn apply_display_defaults(&mut self) {
        self.show_progress = true;
        self.show_timer = true;
        self.show_eta = true;
        self.show_rate = true;
        self.show_bytes = true;
    }

    /// Clamp the refresh interval into its supported range.
    pub fn clamp_interval(&mut self) {
        let raw = self.interval;
        self.interval = self.interval.clamp(INTERVAL_MIN, INTERVAL_MAX);
        if self.interval != raw {
            info!(target: "config", raw, clamped = self.interval, "interval_clamped");
        }
    }

    /// Fill unset dimensions from the terminal, fall back to 80x25, clamp,
    /// and force quiet mode when standard error cannot show a display.
    pub fn apply_terminal(&mut self, ctx: TermContext) {
        if self.width == 0 || self.height == 0 {
            if let Some((cols, rows)) = ctx.size {
                if self.width == 0 {
                    self.width = cols;
                }
                if self.height == 0 {
                    self.height = rows;
                }
            }
        }
        self.clamp_dimensions();

        if !ctx.stderr_is_tty && !self.force && !self.numeric {
            self.quiet = true;
        }
    }

    /// Adopt a new terminal size (window-change signal). Both dimensions
    /// are replaced; explicit overrides only matter at startup.
    pub fn refresh_size(&mut self, size: Option<(u32, u32)>) {
        if let Some((cols, rows)) = size {
            self.width = cols;
            self.height = rows;
        }
        self.clamp_dimensions();
    }

    /// ETA needs a known total; downgrade the toggle when there is none.
    pub fn downgrade_eta(&mut self) {
        if self.total_size == 0 && self.show_eta {
            info!(target: "config", "eta_disabled_total_unknown");
            self.show_eta = false;
        }
    }

    fn clamp_dimensions(&mut self) {
        let (raw_w, raw_h) = (self.width, self.height);
        if self.width < 1 {
            self.width = DEFAULT_WIDTH;
        }
        if self.height < 1 {
            self.height = DEFAULT_HEIGHT;
        }
        self.width = self.width.min(DIMENSION_MAX);
        self.height = self.height.min(DIMENSION_MAX);
        if (raw_w, raw_h) != (self.width, self.height) {
            info!(
                target: "config",
                raw_width = raw_w,
                raw_height = raw_h,
                width = self.width,
                height = self.height,
                "dimensions_clamped"
            );
        }
    }
}

//! The display formatter.
//!
//! [`DisplayState::format`] is a pure function of the configuration and
//! the triple (elapsed seconds, bytes since the last call, cumulative
//! bytes): it renders exactly one line and touches nothing but its own
//! state. Routing that line (carriage-return overwrite, absolute cursor
//! positioning, or numeric stdout-style output) is the caller's concern,
//! which keeps this crate free of any I/O and testable by string
//! comparison.
//!
//! A negative `bytes_since_last` marks the final update: the displayed
//! rate becomes the whole-transfer average and the ETA field is blanked.
//! In line mode the byte arguments are line counts and the SI scaling
//! ratio drops from 1024 to 1000.

use core_config::{Config, EXIT_DISPLAY_ALLOC};
use std::fmt::Write as _;
use tracing::trace;
use unicode_width::UnicodeWidthStr;

/// H:MM:SS rendering overflows somewhere past 100,000 hours; both the
/// timer and the ETA stop there.
const MAX_DISPLAYED_SECONDS: f64 = 360_000_000.0;

/// Scaled values are bounded before formatting so a runaway rate cannot
/// widen its component.
const MAX_SCALED_VALUE: f64 = 100_000.0;

/// Name labels occupy at least this many columns, right-aligned.
const NAME_MIN_COLUMNS: usize = 9;
/// And at most this many.
const NAME_MAX_COLUMNS: usize = 500;

/// SI prefix alphabet walked in both directions from the blank middle
/// anchor. Sub-unity prefixes are reachable only for line-mode rates
/// below one record per second.
const SI_PREFIXES: [char; 17] = [
    'y', 'z', 'a', 'f', 'p', 'n', 'u', 'm', ' ', 'k', 'M', 'G', 'T', 'P', 'E', 'Z', 'Y',
];
const SI_MIDDLE: usize = 8;

/// Scale `value` into [1.0, 1000.0) against the given ratio and return
/// it with the corresponding prefix. Zero keeps an empty prefix so the
/// display never reads "0yB".
fn si_scale(mut value: f64, ratio: f64) -> (f64, Option<char>) {
    if value == 0.0 {
        return (value, None);
    }
    let mut idx = SI_MIDDLE;
    let mut prefix = None;
    while value >= 1000.0 && idx + 1 < SI_PREFIXES.len() {
        idx += 1;
        value /= ratio;
        prefix = Some(SI_PREFIXES[idx]);
    }
    while value < 1.0 && idx > 0 {
        idx -= 1;
        value *= ratio;
        prefix = Some(SI_PREFIXES[idx]);
    }
    (value, prefix)
}

/// Three significant digits, trailing zeros stripped, right-aligned to
/// four columns: the shape a quantity takes next to its SI prefix.
fn fmt_amount(value: f64) -> String {
    let digits = if value >= 100.0 {
        format!("{value:.0}")
    } else if value >= 10.0 {
        format!("{value:.1}")
    } else {
        format!("{value:.2}")
    };
    let trimmed = if digits.contains('.') {
        digits.trim_end_matches('0').trim_end_matches('.')
    } else {
        digits.as_str()
    };
    format!("{trimmed:>4}")
}

/// Render a quantity with its prefix and unit, e.g. `1.21GB` or `256kB/s`.
fn fmt_quantity(value: f64, line_mode: bool, unit: &str) -> String {
    let ratio = if line_mode { 1000.0 } else { 1024.0 };
    let (scaled, prefix) = si_scale(value, ratio);
    let bounded = scaled.min(MAX_SCALED_VALUE);
    let mut s = fmt_amount(bounded);
    if let Some(p) = prefix {
        s.push(p);
    }
    s.push_str(unit);
    s
}

fn fmt_hms(seconds: i64) -> String {
    format!(
        "{}:{:02}:{:02}",
        seconds / 3600,
        (seconds / 60) % 60,
        seconds % 60
    )
}

fn percentage_of(so_far: u64, total: u64) -> i64 {
    if total < 1 {
        return 0;
    }
    (so_far.saturating_mul(100) / total) as i64
}

/// Estimated seconds until completion, from what the elapsed time says
/// about the average pace so far.
fn eta_seconds(so_far: u64, total: u64, elapsed: i64) -> i64 {
    if so_far < 1 {
        return 0;
    }
    let remaining = total.saturating_sub(so_far) as u128;
    (remaining * elapsed.max(0) as u128 / so_far as u128) as i64
}

/// Truncate to at most `max` display columns and pad to at least
/// [`NAME_MIN_COLUMNS`], right-aligned.
fn name_column(name: &str) -> String {
    let mut kept = String::new();
    let mut cols = 0;
    for ch in name.chars() {
        let w = unicode_width::UnicodeWidthChar::width(ch).unwrap_or(0);
        if cols + w > NAME_MAX_COLUMNS {
            break;
        }
        kept.push(ch);
        cols += w;
    }
    let mut out = String::new();
    for _ in cols..NAME_MIN_COLUMNS {
        out.push(' ');
    }
    out.push_str(&kept);
    out.push(':');
    out
}

/// State carried between display ticks.
#[derive(Debug, Default)]
pub struct DisplayState {
    /// Percent complete, or the 0..199 sawtooth when the total is unknown.
    percentage: i64,
    prev_elapsed: f64,
    prev_rate: f64,
    /// Bytes waiting for enough wall-clock time to yield a stable rate.
    carry_over: f64,
    out: String,
}

impl DisplayState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compose one display line. Returns `None` only when the output
    /// buffer could not be grown, in which case the allocation-failure
    /// bit is set on `cfg.exit_status` and this tick is skipped.
    pub fn format(
        &mut self,
        cfg: &mut Config,
        elapsed_sec: f64,
        bytes_since_last: i64,
        total_bytes: u64,
    ) -> Option<&str> {
        let final_update = bytes_since_last < 0;
        let mut elapsed_sec = elapsed_sec;

        // Very close ticks would spike the rate (or divide by zero), so
        // their bytes wait in a carry-over until enough time has passed.
        let time_since_last = elapsed_sec - self.prev_elapsed;
        let mut rate;
        if time_since_last <= 0.01 {
            rate = self.prev_rate;
            self.carry_over += bytes_since_last as f64;
        } else {
            rate = (bytes_since_last as f64 + self.carry_over) / time_since_last;
            self.prev_elapsed = elapsed_sec;
            self.carry_over = 0.0;
        }
        self.prev_rate = rate;

        let mut average_rate = 0.0;
        if final_update || cfg.show_average_rate {
            if elapsed_sec < 0.000_001 {
                elapsed_sec = 0.000_001;
            }
            average_rate = total_bytes as f64 / elapsed_sec;
            if final_update {
                rate = average_rate;
            }
        }

        if cfg.total_size == 0 {
            // No total to compute against: run a sawtooth 0..199 so the
            // numeric output bounces 0-100-0 and the bar pulses.
            if rate > 0.0 {
                self.percentage += 2;
            }
            if self.percentage > 199 {
                self.percentage = 0;
            }
        } else if cfg.numeric || cfg.show_progress {
            self.percentage = percentage_of(total_bytes, cfg.total_size);
        }

        let width = cfg.width as usize;
        if self.out.capacity() != 0 && self.out.capacity() < 2 * width {
            self.out = String::new();
        }
        if self.out.capacity() == 0 {
            let mut want = 2 * width + 80;
            if let Some(name) = &cfg.name {
                want += name.len();
            }
            let mut fresh = String::new();
            if fresh.try_reserve(want).is_err() {
                cfg.exit_status |= EXIT_DISPLAY_ALLOC;
                trace!(target: "display", want, "output_buffer_allocation_failed");
                return None;
            }
            self.out = fresh;
        }
        self.out.clear();

        if cfg.numeric {
            let shown = if self.percentage > 100 {
                200 - self.percentage
            } else {
                self.percentage
            };
            let _ = writeln!(self.out, "{shown}");
            return Some(&self.out);
        }

        // Fixed-size components first; the bar gets whatever columns are
        // left over.
        let mut component_count: i64 = 0;
        let mut static_portion: i64 = 0;

        let name_part = if cfg.show_name {
            cfg.name.as_deref().map(name_column)
        } else {
            None
        };
        if let Some(part) = &name_part {
            component_count += 1;
            static_portion += part.width() as i64;
        }

        let mut str_transferred = String::new();
        if cfg.show_bytes {
            let unit = if cfg.line_mode { "" } else { "B" };
            str_transferred = fmt_quantity(total_bytes as f64, cfg.line_mode, unit);
            component_count += 1;
            static_portion += str_transferred.width() as i64;
        }

        let mut str_timer = String::new();
        if cfg.show_timer {
            let clamped = elapsed_sec.min(MAX_DISPLAYED_SECONDS);
            str_timer = fmt_hms(clamped as i64);
            component_count += 1;
            static_portion += str_timer.width() as i64;
        }

        let rate_unit = if cfg.line_mode { "/s" } else { "B/s" };

        let mut str_rate = String::new();
        if cfg.show_rate {
            str_rate = format!("[{}]", fmt_quantity(rate.max(0.0), cfg.line_mode, rate_unit));
            component_count += 1;
            static_portion += str_rate.width() as i64;
        }

        let mut str_average_rate = String::new();
        if cfg.show_average_rate {
            str_average_rate = format!(
                "[{}]",
                fmt_quantity(average_rate, cfg.line_mode, rate_unit)
            );
            component_count += 1;
            static_portion += str_average_rate.width() as i64;
        }

        let mut str_eta = String::new();
        if cfg.show_eta && cfg.total_size > 0 {
            let eta = eta_seconds(total_bytes, cfg.total_size, elapsed_sec as i64)
                .clamp(0, MAX_DISPLAYED_SECONDS as i64);
            str_eta = format!("ETA {}", fmt_hms(eta));
            if final_update {
                // Keep the layout stable but show nothing where the ETA
                // used to be.
                str_eta = " ".repeat(str_eta.len());
            }
            component_count += 1;
            static_portion += str_eta.width() as i64;
        }

        fn append(out: &mut String, part: &str) {
            if part.is_empty() {
                return;
            }
            if !out.is_empty() {
                out.push(' ');
            }
            out.push_str(part);
        }

        if let Some(part) = &name_part {
            self.out.push_str(part);
        }
        append(&mut self.out, &str_transferred);
        append(&mut self.out, &str_timer);
        append(&mut self.out, &str_rate);
        append(&mut self.out, &str_average_rate);

        if cfg.show_progress {
            if !self.out.is_empty() {
                self.out.push(' ');
            }
            self.out.push('[');

            if cfg.total_size > 0 {
                self.percentage = self.percentage.clamp(0, 100_000);
                let pct_str = format!("{:2}%", self.percentage);
                let available =
                    width as i64 - static_portion - component_count - pct_str.len() as i64 - 3;

                let marks = (available * self.percentage) / 100 - 1;
                let filled = marks.clamp(0, available.max(0));
                for _ in 0..filled {
                    self.out.push('=');
                }
                let mut i = marks.max(0);
                if i < available {
                    self.out.push('>');
                    i += 1;
                }
                while i < available {
                    self.out.push(' ');
                    i += 1;
                }
                self.out.push_str("] ");
                self.out.push_str(&pct_str);
            } else {
                // Pulse: a three-character cursor sweeping right on
                // 0..100 and back left on the 100..199 half.
                let p = if self.percentage > 100 {
                    200 - self.percentage
                } else {
                    self.percentage
                };
                let available = width as i64 - static_portion - component_count - 5;
                let lead = ((available * p) / 100).clamp(0, available.max(0));
                for _ in 0..lead {
                    self.out.push(' ');
                }
                self.out.push_str("<=>");
                let mut i = lead;
                while i < available {
                    self.out.push(' ');
                    i += 1;
                }
                self.out.push(']');
            }
        }

        append(&mut self.out, &str_eta);

        Some(&self.out)
    }
}

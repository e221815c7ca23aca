//! Pipewatch entrypoint: option parsing, startup wiring, and the pacing
//! loop that drives the transfer engine and the display.

use anyhow::{Context, Result};
use clap::Parser;
use core_config::{Config, TermContext};
use core_cursor::CursorState;
use core_display::DisplayState;
use core_signals::now_micros;
use core_source::{InputSource, open_next, total_size};
use core_transfer::{EofState, Transfer};
use std::os::fd::AsFd;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Once;
use tracing::{debug, info};
use tracing_appender::non_blocking::WorkerGuard;

const MICROS_PER_SEC: i64 = 1_000_000;

/// CLI arguments.
#[derive(Parser, Debug)]
#[command(
    name = "pipewatch",
    version,
    about = "Monitor the progress of data through a pipe"
)]
struct Args {
    /// Show progress bar.
    #[arg(short = 'p', long)]
    progress: bool,
    /// Show elapsed time.
    #[arg(short = 't', long)]
    timer: bool,
    /// Show estimated time of arrival (completion).
    #[arg(short = 'e', long)]
    eta: bool,
    /// Show data transfer rate.
    #[arg(short = 'r', long)]
    rate: bool,
    /// Show data transfer rate averaged over the whole transfer.
    #[arg(short = 'a', long = "average-rate")]
    average_rate: bool,
    /// Show number of bytes transferred.
    #[arg(short = 'b', long)]
    bytes: bool,
    /// Output even if standard error is not a terminal.
    #[arg(short = 'f', long)]
    force: bool,
    /// Output percentages, not visual information.
    #[arg(short = 'n', long)]
    numeric: bool,
    /// Do not output any transfer information at all.
    #[arg(short = 'q', long)]
    quiet: bool,
    /// Use cursor positioning escape sequences.
    #[arg(short = 'c', long)]
    cursor: bool,
    /// Display nothing until the first byte has been transferred.
    #[arg(short = 'W', long)]
    wait: bool,
    /// Count lines instead of bytes.
    #[arg(short = 'l', long = "line-mode")]
    line_mode: bool,
    /// Set estimated data size (SI suffixes K, M, G, T accepted).
    #[arg(short = 's', long, value_name = "SIZE")]
    size: Option<String>,
    /// Limit transfer to RATE bytes per second.
    #[arg(short = 'L', long = "rate-limit", value_name = "RATE")]
    rate_limit: Option<String>,
    /// Use a transfer buffer of BYTES bytes.
    #[arg(short = 'B', long = "buffer-size", value_name = "BYTES")]
    buffer_size: Option<String>,
    /// Update the display every SEC seconds.
    #[arg(short = 'i', long, value_name = "SEC")]
    interval: Option<String>,
    /// Assume terminal is WIDTH characters wide.
    #[arg(short = 'w', long, value_name = "WIDTH")]
    width: Option<String>,
    /// Assume terminal is HEIGHT rows high.
    #[arg(short = 'H', long, value_name = "HEIGHT")]
    height: Option<String>,
    /// Prefix visual information with NAME.
    #[arg(short = 'N', long, value_name = "NAME")]
    name: Option<String>,
    /// Update the settings of an already-running instance.
    #[arg(short = 'R', long = "remote", value_name = "PID")]
    remote: Option<u32>,
    /// Input files; `-` means standard input.
    inputs: Vec<PathBuf>,
}

fn build_config(args: &Args) -> Config {
    let any_toggle = args.progress
        || args.timer
        || args.eta
        || args.rate
        || args.average_rate
        || args.bytes
        || args.numeric
        || args.quiet;

    let mut cfg = Config {
        show_progress: args.progress,
        show_timer: args.timer,
        show_eta: args.eta,
        show_rate: args.rate,
        show_average_rate: args.average_rate,
        show_bytes: args.bytes,
        show_name: args.name.is_some(),
        numeric: args.numeric,
        force: args.force,
        quiet: args.quiet,
        wait: args.wait,
        cursor: args.cursor,
        line_mode: args.line_mode,
        total_size: args.size.as_deref().map(core_units::parse_size).unwrap_or(0),
        rate_limit: args
            .rate_limit
            .as_deref()
            .map(core_units::parse_size)
            .unwrap_or(0),
        buffer_size: args
            .buffer_size
            .as_deref()
            .map(core_units::parse_size)
            .unwrap_or(0) as usize,
        interval: args
            .interval
            .as_deref()
            .map(core_units::parse_f64)
            .unwrap_or(1.0),
        width: args.width.as_deref().map(core_units::parse_u32).unwrap_or(0),
        height: args
            .height
            .as_deref()
            .map(core_units::parse_u32)
            .unwrap_or(0),
        name: args.name.clone(),
        inputs: args.inputs.clone(),
        program_name: std::env::args().next().unwrap_or_else(|| "pipewatch".into()),
        ..Config::default()
    };

    if !any_toggle {
        cfg.apply_display_defaults();
    }
    cfg.clamp_interval();
    cfg
}

/// Token-bucket budget for one engine call: how much of this second's
/// allowance is still unspent. The 3% lead compensates for jitter in the
/// readiness wait so short scheduling stalls do not starve the stream.
fn rate_budget(til_reset_sec: f64, rate_limit: u64, donealready: u64) -> u64 {
    let target = ((1.03 - til_reset_sec) * rate_limit as f64) as i64;
    (target - donealready as i64).max(0) as u64
}

struct AppStartup {
    log_guard: Option<WorkerGuard>,
}

impl AppStartup {
    fn new() -> Self {
        Self { log_guard: None }
    }

    /// Install the tracing subscriber, but only when `PIPEWATCH_LOG`
    /// names a log file: standard output carries the stream and standard
    /// error the display, so there is nowhere else to write.
    fn configure_logging(&mut self) {
        let Some(path) = std::env::var_os("PIPEWATCH_LOG") else {
            return;
        };
        let path = PathBuf::from(path);
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let file = path
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("pipewatch.log"));

        let appender = tracing_appender::rolling::never(dir, file);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        if tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(writer)
            .try_init()
            .is_ok()
        {
            self.log_guard = Some(guard);
        }
    }

    fn install_panic_hook() {
        static HOOK: Once = Once::new();
        HOOK.call_once(|| {
            let default_panic = std::panic::take_hook();
            std::panic::set_hook(Box::new(move |panic_info| {
                tracing::error!(target: "runtime.panic", ?panic_info, "panic");
                default_panic(panic_info);
            }));
        });
    }
}

fn main() -> ExitCode {
    let mut startup = AppStartup::new();
    startup.configure_logging();
    AppStartup::install_panic_hook();

    let args = Args::parse();
    let mut cfg = build_config(&args);

    if let Some(pid) = args.remote {
        eprintln!(
            "{}: remote control not supported: {}",
            cfg.program_name, pid
        );
        return ExitCode::SUCCESS;
    }

    info!(target: "runtime", inputs = cfg.inputs.len(), "startup");

    // Pre-flight only when no expected size was given; a `-s` value is
    // trusted as-is.
    if cfg.total_size == 0 {
        cfg.total_size = total_size(&mut cfg);
    }

    // Pre-flight warnings may have emptied the list; that is a failed
    // run, not an implicit switch to standard input.
    if !args.inputs.is_empty() && cfg.inputs.is_empty() {
        info!(target: "runtime", "all_inputs_unusable");
        return ExitCode::from(1);
    }

    cfg.downgrade_eta();

    cfg.apply_terminal(TermContext {
        stderr_is_tty: core_terminal::stderr_is_tty(),
        size: core_terminal::screen_size(),
    });

    let _ = core_terminal::set_nonblocking(std::io::stdout());
    {
        let stderr = std::io::stderr();
        let _ = core_terminal::set_tostop(stderr.as_fd());
    }

    core_signals::install();

    let mut failed = false;
    if let Err(err) = run_loop(&mut cfg) {
        eprintln!("{}: {:#}", cfg.program_name, err);
        failed = true;
    }

    let mut status = cfg.exit_status;
    if failed {
        status |= 1;
    }
    info!(target: "runtime", status, "shutdown");
    ExitCode::from(status as u8)
}

/// The pacing loop: feed the engine, roll the one-second rate window,
/// and tick the display on its fixed cadence until every input has hit
/// double EOF and the final update has been drawn.
fn run_loop(cfg: &mut Config) -> Result<()> {
    let mut cursor = CursorState::init(cfg);
    let mut display = DisplayState::new();
    let mut engine = Transfer::new(std::io::stdout());

    let mut eof = EofState::default();
    let mut total_written: u64 = 0;
    let mut since_last: i64 = 0;
    let mut cansend: u64 = 0;
    let mut donealready: u64 = 0;
    let mut final_update = false;
    let mut index = 0usize;

    let mut start_time = now_micros();
    let mut cur_time = start_time;
    let interval_us = (cfg.interval * MICROS_PER_SEC as f64) as i64;
    let mut next_update = start_time + interval_us;
    let mut next_reset = start_time + MICROS_PER_SEC;

    let mut source = if cfg.inputs.is_empty() {
        InputSource::Stdin(std::io::stdin())
    } else {
        open_next(cfg, index, std::io::stdout())?
    };
    let mut current_name = input_name(cfg, index);

    if let Some(blksize) = source.block_size() {
        engine.set_buffer_size(blksize as usize * 32, false);
    }
    if cfg.buffer_size > 0 {
        engine.set_buffer_size(cfg.buffer_size, true);
    }
    debug!(target: "runtime", buffer = engine.buffer_size(), "transfer_buffer_sized");

    while !(eof.done() && final_update) {
        if cfg.rate_limit > 0 {
            let til_reset = ((next_reset - cur_time).max(0)) as f64 / MICROS_PER_SEC as f64;
            cansend = rate_budget(til_reset, cfg.rate_limit, donealready);
        }

        let progress = engine
            .transfer(cfg, source.as_fd(), &mut eof, cansend)
            .with_context(|| current_name.clone())?;

        let counted = if cfg.line_mode {
            progress.lines
        } else {
            progress.bytes
        };
        since_last += counted as i64;
        total_written += counted;
        if cfg.rate_limit > 0 {
            donealready += progress.bytes;
        }

        if eof.done() && index + 1 < cfg.inputs.len() {
            index += 1;
            drop(source);
            source = open_next(cfg, index, std::io::stdout())?;
            current_name = input_name(cfg, index);
            eof.reset();
        }

        cur_time = now_micros();

        if eof.done() {
            final_update = true;
            // Force the last tick to render immediately.
            next_update = cur_time - MICROS_PER_SEC;
        }

        if cur_time >= next_reset {
            next_reset += MICROS_PER_SEC;
            if next_reset < cur_time {
                next_reset = cur_time;
            }
            donealready = 0;
        }

        if cfg.quiet {
            continue;
        }

        if cfg.wait {
            if progress.bytes < 1 {
                continue;
            }
            cfg.wait = false;

            // Count time as if the transfer began with this first byte.
            // A stop/continue while we were waiting must not leave a
            // stale offset, and the reset must not race those handlers.
            core_signals::pause_disable();
            start_time = now_micros();
            core_signals::clear_stopped_offset();
            core_signals::pause_enable();

            next_update = start_time + interval_us;
        }

        if cur_time < next_update {
            continue;
        }

        // Advance by a whole interval rather than slipping to "now" so
        // the cadence stays regular under load.
        next_update += interval_us;
        if next_update < cur_time {
            next_update = cur_time;
        }

        let elapsed_us = (cur_time - start_time) - core_signals::stopped_offset_micros();
        let elapsed = elapsed_us as f64 / MICROS_PER_SEC as f64;

        if final_update {
            since_last = -1;
        }

        if core_signals::take_need_new_size() {
            cfg.refresh_size(core_terminal::screen_size());
        }

        core_signals::check_background();

        if let Some(line) = display.format(cfg, elapsed, since_last, total_written) {
            let stderr = std::io::stderr();
            if cfg.numeric {
                let _ = core_terminal::write_all(stderr.as_fd(), line.as_bytes());
            } else if cursor.is_active() {
                cursor.update(cfg, line);
            } else {
                let _ = core_terminal::write_all(stderr.as_fd(), line.as_bytes());
                let _ = core_terminal::write_all(stderr.as_fd(), b"\r");
            }
        }

        since_last = 0;
    }

    if cursor.is_active() {
        cursor.fini(cfg);
    } else if !cfg.numeric && !cfg.quiet {
        let stderr = std::io::stderr();
        let _ = core_terminal::write_all(stderr.as_fd(), b"\n");
    }

    Ok(())
}

fn input_name(cfg: &Config, index: usize) -> String {
    match cfg.inputs.get(index) {
        Some(path) if path.as_os_str() != "-" => path.display().to_string(),
        _ => String::from("(stdin)"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(cmdline: &[&str]) -> Args {
        Args::try_parse_from(cmdline).expect("argument parse failed")
    }

    #[test]
    fn no_toggles_enables_the_default_display() {
        let cfg = build_config(&parse(&["pipewatch"]));
        assert!(cfg.show_progress);
        assert!(cfg.show_timer);
        assert!(cfg.show_eta);
        assert!(cfg.show_rate);
        assert!(cfg.show_bytes);
        assert!(!cfg.show_average_rate);
    }

    #[test]
    fn explicit_toggle_suppresses_defaults() {
        let cfg = build_config(&parse(&["pipewatch", "-r"]));
        assert!(cfg.show_rate);
        assert!(!cfg.show_progress);
        assert!(!cfg.show_timer);
        assert!(!cfg.show_eta);
        assert!(!cfg.show_bytes);
    }

    #[test]
    fn quiet_counts_as_a_display_choice() {
        let cfg = build_config(&parse(&["pipewatch", "-q"]));
        assert!(cfg.quiet);
        assert!(!cfg.show_progress, "quiet alone must not enable defaults");
    }

    #[test]
    fn suffixed_values_parse_through() {
        let cfg = build_config(&parse(&["pipewatch", "-s", "1M", "-L", "2K", "-B", "64K"]));
        assert_eq!(cfg.total_size, 1 << 20);
        assert_eq!(cfg.rate_limit, 2048);
        assert_eq!(cfg.buffer_size, 64 << 10);
    }

    #[test]
    fn interval_is_clamped_at_build_time() {
        let cfg = build_config(&parse(&["pipewatch", "-i", "0.001"]));
        assert_eq!(cfg.interval, 0.1);
        let cfg = build_config(&parse(&["pipewatch", "-i", "10000"]));
        assert_eq!(cfg.interval, 600.0);
    }

    #[test]
    fn name_implies_the_name_component() {
        let cfg = build_config(&parse(&["pipewatch", "-N", "backup"]));
        assert!(cfg.show_name);
        assert_eq!(cfg.name.as_deref(), Some("backup"));
    }

    #[test]
    fn positional_arguments_become_inputs() {
        let cfg = build_config(&parse(&["pipewatch", "a", "-", "b"]));
        assert_eq!(
            cfg.inputs,
            vec![PathBuf::from("a"), PathBuf::from("-"), PathBuf::from("b")]
        );
    }

    #[test]
    fn rate_budget_carries_the_lead_factor() {
        // A full second until the reset: only the 3% lead is available.
        assert_eq!(rate_budget(1.0, 1000, 0), 30);
        // Reset imminent: the full second's budget (plus lead) opens up.
        assert_eq!(rate_budget(0.0, 1000, 0), 1030);
        // Budget already spent in this window.
        assert_eq!(rate_budget(0.0, 1000, 1030), 0);
        // Never negative, even when overspent.
        assert_eq!(rate_budget(1.0, 1000, 5000), 0);
    }

    #[test]
    fn input_name_reports_stdin_for_dash_and_empty() {
        let cfg = Config::default();
        assert_eq!(input_name(&cfg, 0), "(stdin)");

        let cfg = Config {
            inputs: vec![PathBuf::from("-"), PathBuf::from("data.bin")],
            ..Config::default()
        };
        assert_eq!(input_name(&cfg, 0), "(stdin)");
        assert_eq!(input_name(&cfg, 1), "data.bin");
    }
}

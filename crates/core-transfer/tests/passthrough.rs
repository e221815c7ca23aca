//! End-to-end engine behavior over real pipes.

use core_config::Config;
use core_transfer::{EofState, Progress, Transfer, TransferError};
use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::{AsFd, OwnedFd};

fn pipe_pair() -> (OwnedFd, OwnedFd) {
    nix::unistd::pipe().expect("pipe")
}

fn ignore_sigpipe() {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

#[test]
fn short_input_completes_in_two_calls() {
    let (in_r, in_w) = pipe_pair();
    let (out_r, out_w) = pipe_pair();

    let mut writer = File::from(in_w);
    writer.write_all(b"hello\n").unwrap();
    drop(writer);

    let cfg = Config::default();
    let mut engine = Transfer::new(out_w);
    let mut eof = EofState::default();
    let mut calls = 0;
    let mut moved = 0u64;

    while !eof.done() {
        let progress = engine.transfer(&cfg, in_r.as_fd(), &mut eof, 0).unwrap();
        moved += progress.bytes;
        calls += 1;
        assert!(calls <= 2, "short input should finish in at most two calls");
    }
    assert_eq!(moved, 6);

    drop(engine);
    let mut echoed = Vec::new();
    File::from(out_r).read_to_end(&mut echoed).unwrap();
    assert_eq!(echoed, b"hello\n");
}

#[test]
fn byte_exact_passthrough_with_tiny_buffer() {
    let (in_r, in_w) = pipe_pair();
    let (out_r, out_w) = pipe_pair();

    let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
    let expected = payload.clone();

    let feeder = std::thread::spawn(move || {
        let mut writer = File::from(in_w);
        writer.write_all(&payload).unwrap();
    });
    let drainer = std::thread::spawn(move || {
        let mut echoed = Vec::new();
        File::from(out_r).read_to_end(&mut echoed).unwrap();
        echoed
    });

    let cfg = Config::default();
    let mut engine = Transfer::new(out_w);
    engine.set_buffer_size(1024, true);
    let mut eof = EofState::default();

    while !eof.done() {
        engine.transfer(&cfg, in_r.as_fd(), &mut eof, 0).unwrap();
    }
    drop(engine);

    feeder.join().unwrap();
    let echoed = drainer.join().unwrap();
    assert_eq!(echoed, expected, "output must be the input, byte for byte");
}

#[test]
fn broken_pipe_ends_the_transfer_quietly() {
    ignore_sigpipe();

    let (in_r, in_w) = pipe_pair();
    let (out_r, out_w) = pipe_pair();
    drop(out_r); // downstream hangs up before we write anything

    let mut writer = File::from(in_w);
    writer.write_all(b"doomed bytes").unwrap();
    drop(writer);

    let cfg = Config::default();
    let mut engine = Transfer::new(out_w);
    let mut eof = EofState::default();

    for _ in 0..4 {
        match engine.transfer(&cfg, in_r.as_fd(), &mut eof, 0) {
            Ok(Progress { .. }) => {}
            Err(err) => panic!("EPIPE must not surface as an error: {err}"),
        }
        if eof.done() {
            return;
        }
    }
    panic!("engine did not reach double EOF after the reader hung up");
}

#[test]
fn line_mode_counts_newlines_written() {
    let (in_r, in_w) = pipe_pair();
    let (out_r, out_w) = pipe_pair();

    let mut writer = File::from(in_w);
    writer.write_all(b"one\ntwo\nthree\n").unwrap();
    drop(writer);

    let cfg = Config {
        line_mode: true,
        ..Config::default()
    };
    let mut engine = Transfer::new(out_w);
    let mut eof = EofState::default();
    let mut lines = 0u64;
    let mut bytes = 0u64;

    while !eof.done() {
        let progress = engine.transfer(&cfg, in_r.as_fd(), &mut eof, 0).unwrap();
        lines += progress.lines;
        bytes += progress.bytes;
    }

    assert_eq!(lines, 3);
    assert_eq!(bytes, 14);

    drop(engine);
    let mut echoed = Vec::new();
    File::from(out_r).read_to_end(&mut echoed).unwrap();
    assert_eq!(echoed, b"one\ntwo\nthree\n");
}

#[test]
fn fatal_read_error_is_reported() {
    // A directory descriptor is always "ready" but fails reads with
    // EISDIR, which must surface as a hard error after the EOF flags are
    // forced.
    let dir = File::open(".").unwrap();
    let (_out_r, out_w) = pipe_pair();

    let cfg = Config::default();
    let mut engine = Transfer::new(out_w);
    let mut eof = EofState::default();

    match engine.transfer(&cfg, dir.as_fd(), &mut eof, 0) {
        Err(TransferError::Read(_)) => {
            assert!(eof.input, "read failure must mark input EOF");
            assert!(eof.output, "drained buffer must mark output EOF too");
        }
        other => panic!("expected a read error, got {other:?}"),
    }
}

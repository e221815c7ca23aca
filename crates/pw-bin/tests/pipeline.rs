//! Multi-input pipeline scenarios wired from the core crates, the same
//! way the main loop wires them.

use core_config::Config;
use core_source::open_next;
use core_transfer::{EofState, Transfer};
use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::{AsFd, OwnedFd};
use std::path::PathBuf;

fn pipe_pair() -> (OwnedFd, OwnedFd) {
    nix::unistd::pipe().expect("pipe")
}

fn temp_file_with(content: &[u8]) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(content).unwrap();
    file.flush().unwrap();
    file
}

#[test]
fn two_files_stream_back_to_back() {
    let first = temp_file_with(&[b'a'; 10]);
    let second = temp_file_with(&[b'b'; 20]);
    let (out_r, out_w) = pipe_pair();

    let cfg = Config {
        inputs: vec![
            first.path().to_path_buf(),
            second.path().to_path_buf(),
        ],
        total_size: 30,
        ..Config::default()
    };

    let mut engine = Transfer::new(out_w);
    let mut eof = EofState::default();
    let mut index = 0usize;
    let mut total: u64 = 0;
    let mut source = open_next(&cfg, index, std::io::stdout()).unwrap();

    loop {
        let progress = engine.transfer(&cfg, source.as_fd(), &mut eof, 0).unwrap();
        total += progress.bytes;
        if eof.done() {
            if index + 1 < cfg.inputs.len() {
                index += 1;
                drop(source);
                source = open_next(&cfg, index, std::io::stdout()).unwrap();
                eof.reset();
            } else {
                break;
            }
        }
    }

    assert_eq!(total, 30);
    assert_eq!(total * 100 / cfg.total_size, 100, "percent reaches 100");

    drop(engine);
    let mut streamed = Vec::new();
    File::from(out_r).read_to_end(&mut streamed).unwrap();
    let mut expected = vec![b'a'; 10];
    expected.extend_from_slice(&[b'b'; 20]);
    assert_eq!(streamed, expected, "inputs concatenate in order");
}

#[test]
fn pruned_input_list_still_streams_the_rest() {
    let first = temp_file_with(b"0123456789");
    let missing = PathBuf::from("/definitely/not/here/pipewatch-e2e");
    let (out_r, out_w) = pipe_pair();

    let mut cfg = Config {
        inputs: vec![first.path().to_path_buf(), missing],
        ..Config::default()
    };

    let total = core_source::total_size(&mut cfg);
    assert_eq!(total, 10);
    assert_eq!(cfg.inputs.len(), 1, "unreadable input was pruned");

    let mut engine = Transfer::new(out_w);
    let mut eof = EofState::default();
    let source = open_next(&cfg, 0, std::io::stdout()).unwrap();
    let mut moved = 0u64;
    while !eof.done() {
        moved += engine
            .transfer(&cfg, source.as_fd(), &mut eof, 0)
            .unwrap()
            .bytes;
    }
    assert_eq!(moved, 10);

    drop(engine);
    let mut streamed = Vec::new();
    File::from(out_r).read_to_end(&mut streamed).unwrap();
    assert_eq!(streamed, b"0123456789");
}

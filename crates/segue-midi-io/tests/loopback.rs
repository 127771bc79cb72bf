//! Loopback tests over the kernel sequencer.
//!
//! These create real virtual ports and route between them, so they need
//! /dev/snd/seq. All tests are `#[ignore]` so CI without a sequencer
//! doesn't fail.
//!
//! Run with:
//!   cargo test -p segue-midi-io --test loopback -- --ignored --test-threads=1

#![cfg(all(feature = "native", target_os = "linux"))]

use segue_midi_io::{
    ChunkPolicy, ErrorKind, Ignore, MidiInput, MidiMessage, MidiObserver, MidiOutput,
    ObserverConfig,
};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

const SETTLE: Duration = Duration::from_millis(150);
const DELIVERY_TIMEOUT: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Creates a virtual source and an input connected to it.
fn loopback_pair(tag: &str) -> (MidiOutput, MidiInput) {
    let mut output = MidiOutput::new("segue-loop-out").unwrap();
    output.open_virtual_port(tag).unwrap();
    thread::sleep(SETTLE);

    let mut input = MidiInput::new("segue-loop-in").unwrap();
    let index = input.find_port(tag).expect("virtual port should be enumerable");
    input.open_port(index, "loop-in").unwrap();
    thread::sleep(SETTLE);

    (output, input)
}

fn collect(input: &mut MidiInput, expected: usize) -> Vec<MidiMessage> {
    let deadline = Instant::now() + DELIVERY_TIMEOUT;
    let mut out = Vec::new();
    while out.len() < expected && Instant::now() < deadline {
        while let Some(message) = input.get_message() {
            out.push(message);
        }
        thread::sleep(Duration::from_millis(5));
    }
    out
}

// ---------------------------------------------------------------------------
// 1. Short message roundtrips
// ---------------------------------------------------------------------------

#[test]
#[ignore]
fn test_note_roundtrip_via_queue() {
    let (mut output, mut input) = loopback_pair("loop-notes");

    output.send_message(&[0x90, 60, 100]).unwrap();
    output.send_message(&[0x80, 60, 0]).unwrap();

    let messages = collect(&mut input, 2);
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].bytes, vec![0x90, 60, 100]);
    assert_eq!(messages[1].bytes, vec![0x80, 60, 0]);
    assert_eq!(messages[0].timestamp, 0.0, "first delivery opens the clock");
    assert!(messages[1].timestamp >= 0.0);
}

#[test]
#[ignore]
fn test_callback_delivery() {
    let (mut output, mut input) = loopback_pair("loop-callback");

    let seen: Arc<Mutex<Vec<MidiMessage>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    input.set_callback(move |message| sink.lock().unwrap().push(message));

    for note in [60u8, 64, 67] {
        output.send_message(&[0x90, note, 80]).unwrap();
    }

    let deadline = Instant::now() + DELIVERY_TIMEOUT;
    while seen.lock().unwrap().len() < 3 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 3);
    assert_eq!(seen[1].bytes, vec![0x90, 64, 80]);
    assert!(input.get_message().is_none(), "callback mode bypasses the queue");
}

#[test]
#[ignore]
fn test_clock_filter() {
    let (mut output, mut input) = loopback_pair("loop-filter");
    input.set_ignore(Ignore { sysex: false, time: true, active_sense: true });

    output.send_message(&[0xF8]).unwrap();
    output.send_message(&[0xFE]).unwrap();
    output.send_message(&[0x90, 72, 90]).unwrap();

    let messages = collect(&mut input, 1);
    assert_eq!(messages.len(), 1, "clock and sensing are filtered out");
    assert_eq!(messages[0].bytes, vec![0x90, 72, 90]);
}

// ---------------------------------------------------------------------------
// 2. SysEx roundtrips
// ---------------------------------------------------------------------------

#[test]
#[ignore]
fn test_sysex_small() {
    let (mut output, mut input) = loopback_pair("loop-sysex");

    output.send_message(&[0xF0, 0x7D, 1, 2, 3, 0xF7]).unwrap();

    let messages = collect(&mut input, 1);
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].bytes, vec![0xF0, 0x7D, 1, 2, 3, 0xF7]);
}

/// Large transfers arrive as multiple sequencer fragments and must come
/// out as one message.
#[test]
#[ignore]
fn test_sysex_large_reassembles() {
    let (mut output, mut input) = loopback_pair("loop-sysex-large");

    let mut payload = vec![0xF0, 0x7D];
    payload.extend((0..2048).map(|i| (i % 128) as u8));
    payload.push(0xF7);
    output.send_message(&payload).unwrap();

    let messages = collect(&mut input, 1);
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].bytes.len(), payload.len());
    assert_eq!(messages[0].bytes, payload);
}

#[test]
#[ignore]
fn test_chunked_send_roundtrip() {
    let (mut output, mut input) = loopback_pair("loop-chunked");

    let waits: Arc<Mutex<u32>> = Arc::new(Mutex::new(0));
    let counter = Arc::clone(&waits);
    let policy = ChunkPolicy::new(128, Duration::from_millis(1)).with_wait(move |_pause| {
        *counter.lock().unwrap() += 1;
        true
    });
    output.set_chunking(Some(policy)).unwrap();

    let mut payload = vec![0xF0, 0x7D];
    payload.extend((0..500).map(|i| (i % 128) as u8));
    payload.push(0xF7);
    output.send_message(&payload).unwrap();

    let messages = collect(&mut input, 1);
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].bytes, payload);
    assert!(*waits.lock().unwrap() >= 3, "transfer should pause between chunks");
}

// ---------------------------------------------------------------------------
// 3. Close sequencing
// ---------------------------------------------------------------------------

/// An open session rejects a second open instead of replacing the first,
/// and the original connection keeps working afterwards.
#[test]
#[ignore]
fn test_double_open_is_rejected() {
    let (mut output, mut input) = loopback_pair("loop-reopen");

    let err = input.open_port(0, "again").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidUse);
    let err = input.open_virtual_port("again").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidUse);
    assert!(input.is_port_open());

    let err = output.open_virtual_port("again").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidUse);
    let err = output.open_port(0, "again").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidUse);
    assert!(output.is_port_open());

    // The original route is untouched by the rejected opens.
    output.send_message(&[0x90, 60, 100]).unwrap();
    let messages = collect(&mut input, 1);
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].bytes, vec![0x90, 60, 100]);
}

#[test]
#[ignore]
fn test_close_is_idempotent() {
    let mut never_opened = MidiInput::new("segue-close").unwrap();
    never_opened.close_port();
    never_opened.close_port();

    let (mut output, mut input) = loopback_pair("loop-close");
    output.send_message(&[0x90, 60, 100]).unwrap();
    let _ = collect(&mut input, 1);

    input.close_port();
    input.close_port();
    assert!(!input.is_port_open());

    output.close_port();
    output.close_port();
    assert!(!output.is_port_open());
}

// ---------------------------------------------------------------------------
// 4. Hot-plug observation
// ---------------------------------------------------------------------------

#[test]
#[ignore]
fn test_observer_sees_virtual_port() {
    let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let added = Arc::clone(&log);
    let removed = Arc::clone(&log);
    let config = ObserverConfig::new()
        .on_input_added(move |_, port| added.lock().unwrap().push(format!("+{}", port.name)))
        .on_input_removed(move |_, port| removed.lock().unwrap().push(format!("-{}", port.name)));
    let mut observer = MidiObserver::new("segue-watch", config).unwrap();
    thread::sleep(SETTLE);

    // A virtual source registers as a new input for everyone else.
    let mut output = MidiOutput::new("segue-plug").unwrap();
    output.open_virtual_port("observed-port").unwrap();

    let deadline = Instant::now() + DELIVERY_TIMEOUT;
    while log.lock().unwrap().is_empty() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert!(
        log.lock().unwrap().iter().any(|entry| entry.starts_with('+') && entry.contains("observed-port")),
        "port creation should be reported: {:?}",
        log.lock().unwrap()
    );
    assert!(
        observer.directory().inputs.ports().iter().any(|p| p.name.contains("observed-port"))
    );

    output.close_port();
    let deadline = Instant::now() + DELIVERY_TIMEOUT;
    while !log.lock().unwrap().iter().any(|e| e.starts_with('-')) && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert!(
        log.lock().unwrap().iter().any(|entry| entry.starts_with('-') && entry.contains("observed-port")),
        "port removal should be reported: {:?}",
        log.lock().unwrap()
    );

    observer.close();
}

//! Prints every message arriving on one input port.
//!
//! Usage: cargo run --example monitor [port-index]

use segue_midi_io::{Ignore, MidiInput};
use std::time::Duration;
use std::{env, thread};

fn main() {
    tracing_subscriber::fmt::init();

    let index: usize = env::args().nth(1).and_then(|arg| arg.parse().ok()).unwrap_or(0);

    let mut input = MidiInput::new("segue-monitor").unwrap();
    if input.port_count() == 0 {
        eprintln!("ERROR: no MIDI input ports found.");
        std::process::exit(1);
    }
    let name = input.port_name(index).unwrap();
    println!("listening on [{index}] {name} (clock and active sensing filtered)");

    input.set_ignore(Ignore { sysex: false, time: true, active_sense: true });
    input.open_port(index, "monitor-in").unwrap();

    loop {
        while let Some(message) = input.get_message() {
            println!("{:10.4}  {:02X?}", message.timestamp, message.bytes);
        }
        thread::sleep(Duration::from_millis(10));
    }
}

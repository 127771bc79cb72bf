//! Reports ports arriving and departing until interrupted.

use segue_midi_io::{MidiObserver, ObserverConfig};
use std::thread;
use std::time::Duration;

fn main() {
    tracing_subscriber::fmt::init();

    let config = ObserverConfig::new()
        .on_input_added(|index, port| println!("input added    [{index}] {port}"))
        .on_input_removed(|index, port| println!("input removed  [{index}] {port}"))
        .on_output_added(|index, port| println!("output added   [{index}] {port}"))
        .on_output_removed(|index, port| println!("output removed [{index}] {port}"));

    let observer = MidiObserver::new("segue-watch", config).unwrap();
    let directory = observer.directory();
    println!(
        "watching for changes ({} inputs, {} outputs right now)",
        directory.inputs.len(),
        directory.outputs.len()
    );

    loop {
        thread::sleep(Duration::from_secs(1));
    }
}

use segue_midi_io::{MidiInput, MidiOutput};

fn main() {
    let input = MidiInput::new("segue-list").unwrap();

    println!("=== MIDI Input Ports ===");
    let ports = input.ports();
    if ports.is_empty() {
        println!("  (none found)");
    }
    for (i, port) in ports.iter().enumerate() {
        println!("  [{}] {}", i, port.name);
    }

    println!("\n=== MIDI Output Ports ===");
    let output = MidiOutput::new("segue-list").unwrap();
    let ports = output.ports();
    if ports.is_empty() {
        println!("  (none found)");
    }
    for (i, port) in ports.iter().enumerate() {
        println!("  [{}] {}", i, port.name);
    }
}

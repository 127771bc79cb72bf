//! Wire-level MIDI for the Segue I/O engine.
//!
//! Everything in this crate is platform-independent: the raw message model,
//! the byte-stream decoder (running status, SysEx reassembly), the delta
//! clock used to stamp deliveries, and the port-directory snapshot/diff used
//! by the hot-plug observer. OS transports live in `segue-midi-io`.

pub mod message;
pub use message::{status, MidiMessage};

mod filter;
pub use filter::Ignore;

pub mod decode;
pub use decode::StreamDecoder;

pub mod clock;
pub use clock::{DeltaClock, RealTime};

pub mod directory;
pub use directory::{DirectoryDiff, PortInfo, Snapshot};

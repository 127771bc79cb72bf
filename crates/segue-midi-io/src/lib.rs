//! Real-time MIDI I/O for the Segue engine.
//!
//! Three session types cover the whole surface: [`MidiInput`] receives a
//! decoded, delta-timestamped message stream from one source port,
//! [`MidiOutput`] sends wire bytes to one destination port, and
//! [`MidiObserver`] reports hot-plug changes to the port directory. The OS
//! transport behind them is chosen at compile time: the Linux sequencer,
//! macOS endpoints, the Windows multimedia driver API, the browser's MIDI
//! access object, or an inert fallback when `native` is disabled.

pub mod error;
pub use error::{Error, ErrorCallback, ErrorKind, Result};

mod engine;
pub use engine::{ChunkPolicy, DEFAULT_QUEUE_CAPACITY};

mod backend;

mod input;
pub use input::MidiInput;

mod output;
pub use output::MidiOutput;

mod observer;
pub use observer::{
    Directory, MidiObserver, ObserverConfig, PortCallback, DEFAULT_POLL_INTERVAL,
};

pub use segue_midi::{Ignore, MidiMessage, PortInfo, Snapshot};

/// Requests the browser's MIDI access object; must resolve before sessions
/// can be created on the wasm transport.
#[cfg(all(feature = "native", target_arch = "wasm32", target_os = "unknown"))]
pub use backend::request_access;

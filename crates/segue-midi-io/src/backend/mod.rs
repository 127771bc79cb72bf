//! Compile-time transport selection.
//!
//! Exactly one backend module is compiled per build: the sequencer transport
//! on Linux, the endpoint transport on macOS, the driver-callback transport
//! on Windows, the browser transport on wasm32, and an inert fallback
//! everywhere else (including any build with `--no-default-features`). The
//! facades wrap the selected `*Impl` types directly, so the choice is fixed
//! at compile time and costs no dynamic dispatch.

#[cfg(all(feature = "native", target_os = "linux"))]
mod alsa;
#[cfg(all(feature = "native", target_os = "linux"))]
pub(crate) use self::alsa::{MidiInputImpl, MidiObserverImpl, MidiOutputImpl};

#[cfg(all(feature = "native", target_os = "macos"))]
mod coremidi;
#[cfg(all(feature = "native", target_os = "macos"))]
pub(crate) use self::coremidi::{MidiInputImpl, MidiObserverImpl, MidiOutputImpl};

#[cfg(all(feature = "native", target_os = "windows"))]
mod winmm;
#[cfg(all(feature = "native", target_os = "windows"))]
pub(crate) use self::winmm::{MidiInputImpl, MidiObserverImpl, MidiOutputImpl};

#[cfg(all(feature = "native", target_arch = "wasm32", target_os = "unknown"))]
mod webmidi;
#[cfg(all(feature = "native", target_arch = "wasm32", target_os = "unknown"))]
pub(crate) use self::webmidi::{MidiInputImpl, MidiObserverImpl, MidiOutputImpl};
#[cfg(all(feature = "native", target_arch = "wasm32", target_os = "unknown"))]
pub use self::webmidi::request_access;

#[cfg(not(any(
    all(feature = "native", target_os = "linux"),
    all(feature = "native", target_os = "macos"),
    all(feature = "native", target_os = "windows"),
    all(feature = "native", target_arch = "wasm32", target_os = "unknown"),
)))]
mod dummy;
#[cfg(not(any(
    all(feature = "native", target_os = "linux"),
    all(feature = "native", target_os = "macos"),
    all(feature = "native", target_os = "windows"),
    all(feature = "native", target_arch = "wasm32", target_os = "unknown"),
)))]
pub(crate) use self::dummy::{MidiInputImpl, MidiObserverImpl, MidiOutputImpl};

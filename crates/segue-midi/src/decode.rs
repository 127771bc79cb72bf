//! Byte-stream decoding: turns transport chunks into complete messages.
//!
//! Transports hand the decoder whatever framing the OS gives them: one
//! complete event per chunk, several messages packed together, or a SysEx
//! transfer split across many chunks. The decoder owns the cross-chunk
//! state (running status and the partial-SysEx buffer) and emits only
//! complete, non-empty messages, in wire order.

use crate::filter::Ignore;
use crate::message::{self, status};
use tracing::warn;

/// Incremental decoder for one input session.
///
/// Feed it chunks in arrival order; it calls the sink once per complete
/// message. Rules it enforces:
///
/// * running status is reinstated, so every emitted message starts with an
///   explicit status byte;
/// * a system common status cancels running status, a realtime byte does
///   not;
/// * realtime bytes interleaved anywhere, including inside a SysEx
///   transfer, are emitted as their own single-byte messages at the point
///   they arrive;
/// * a SysEx transfer is emitted only once its terminator has arrived,
///   never partially;
/// * malformed input (orphan data bytes, a status byte where data was
///   expected, truncated chunks) is dropped with a warning and decoding
///   resynchronizes at the next status byte.
///
/// Messages suppressed by the [`Ignore`] flags are consumed but never
/// emitted.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    running_status: Option<u8>,
    sysex: Vec<u8>,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// True while a SysEx transfer is buffered awaiting its terminator.
    pub fn in_sysex(&self) -> bool {
        !self.sysex.is_empty()
    }

    /// Drops all cross-chunk state.
    pub fn reset(&mut self) {
        self.running_status = None;
        self.sysex.clear();
    }

    /// Decodes one transport chunk, emitting complete messages into `sink`.
    pub fn feed<F>(&mut self, chunk: &[u8], ignore: Ignore, mut sink: F)
    where
        F: FnMut(Vec<u8>),
    {
        let mut i = 0;
        while i < chunk.len() {
            if self.in_sysex() {
                i = self.continue_sysex(chunk, i, ignore, &mut sink);
                continue;
            }

            let byte = chunk[i];
            if message::is_realtime(byte) {
                self.emit_single(byte, ignore, &mut sink);
                i += 1;
            } else if byte == status::SYSEX_START {
                self.running_status = None;
                self.sysex.push(byte);
                i += 1;
            } else if byte == status::SYSEX_END {
                warn!("stray SysEx terminator outside a transfer; dropping");
                i += 1;
            } else if message::is_status(byte) {
                if message::expected_len(byte).is_some() {
                    if message::is_channel_status(byte) {
                        self.running_status = Some(byte);
                    } else {
                        // System common cancels running status.
                        self.running_status = None;
                    }
                    i = self.collect_short(chunk, i + 1, byte, ignore, &mut sink);
                } else {
                    self.running_status = None;
                    warn!("undefined status byte {byte:#04x}; dropping");
                    i += 1;
                }
            } else {
                match self.running_status {
                    Some(rs) => i = self.collect_short(chunk, i, rs, ignore, &mut sink),
                    None => {
                        warn!("data byte {byte:#04x} with no running status; dropping");
                        i += 1;
                    }
                }
            }
        }
    }

    /// Consumes SysEx continuation bytes starting at `i`. Returns the index
    /// of the first byte not consumed (the chunk end, or a status byte that
    /// aborted the transfer and must be reprocessed).
    fn continue_sysex<F>(&mut self, chunk: &[u8], mut i: usize, ignore: Ignore, sink: &mut F) -> usize
    where
        F: FnMut(Vec<u8>),
    {
        while i < chunk.len() {
            let byte = chunk[i];
            if message::is_realtime(byte) {
                self.emit_single(byte, ignore, sink);
                i += 1;
            } else if byte == status::SYSEX_END {
                self.sysex.push(byte);
                let transfer = std::mem::take(&mut self.sysex);
                if !ignore.sysex {
                    sink(transfer);
                }
                return i + 1;
            } else if !message::is_status(byte) {
                self.sysex.push(byte);
                i += 1;
            } else {
                warn!(
                    "SysEx transfer of {} bytes aborted by status {byte:#04x}; dropping partial buffer",
                    self.sysex.len()
                );
                self.sysex.clear();
                return i;
            }
        }
        i
    }

    /// Collects the data bytes of a fixed-length message whose status is
    /// `status_byte`; `data_start` points at the first expected data byte.
    /// Returns the index after the message, or of the byte that ended it
    /// early.
    fn collect_short<F>(
        &mut self,
        chunk: &[u8],
        data_start: usize,
        status_byte: u8,
        ignore: Ignore,
        sink: &mut F,
    ) -> usize
    where
        F: FnMut(Vec<u8>),
    {
        let need = message::expected_len(status_byte).unwrap_or(1) - 1;
        let mut bytes = Vec::with_capacity(1 + need);
        bytes.push(status_byte);

        let mut i = data_start;
        while bytes.len() < 1 + need {
            let Some(&byte) = chunk.get(i) else {
                warn!(
                    "chunk ended {} data byte(s) short of a complete {status_byte:#04x} message; dropping",
                    1 + need - bytes.len()
                );
                return i;
            };
            if message::is_realtime(byte) {
                self.emit_single(byte, ignore, sink);
                i += 1;
            } else if message::is_status(byte) {
                warn!("expected a data byte, got status {byte:#04x}; resynchronizing");
                return i;
            } else {
                bytes.push(byte);
                i += 1;
            }
        }

        if !ignore.suppresses(status_byte) {
            sink(bytes);
        }
        i
    }

    fn emit_single<F>(&self, byte: u8, ignore: Ignore, sink: &mut F)
    where
        F: FnMut(Vec<u8>),
    {
        if !ignore.suppresses(byte) {
            sink(vec![byte]);
        }
    }
}

//! Raw MIDI message model: owned wire bytes plus a delta timestamp.

use serde::{Deserialize, Serialize};

/// Status byte constants for the 1.0 wire protocol.
///
/// Channel statuses carry the channel in the low nibble; the constants here
/// are the channel-0 form (`NOTE_ON | channel`).
pub mod status {
    pub const NOTE_OFF: u8 = 0x80;
    pub const NOTE_ON: u8 = 0x90;
    pub const POLY_AFTERTOUCH: u8 = 0xA0;
    pub const CONTROL_CHANGE: u8 = 0xB0;
    pub const PROGRAM_CHANGE: u8 = 0xC0;
    pub const CHANNEL_AFTERTOUCH: u8 = 0xD0;
    pub const PITCH_BEND: u8 = 0xE0;

    pub const SYSEX_START: u8 = 0xF0;
    pub const MTC_QUARTER_FRAME: u8 = 0xF1;
    pub const SONG_POSITION: u8 = 0xF2;
    pub const SONG_SELECT: u8 = 0xF3;
    pub const TUNE_REQUEST: u8 = 0xF6;
    pub const SYSEX_END: u8 = 0xF7;

    pub const TIMING_CLOCK: u8 = 0xF8;
    pub const TICK: u8 = 0xF9;
    pub const START: u8 = 0xFA;
    pub const CONTINUE: u8 = 0xFB;
    pub const STOP: u8 = 0xFC;
    pub const ACTIVE_SENSING: u8 = 0xFE;
    pub const SYSTEM_RESET: u8 = 0xFF;
}

/// True for any status byte (bit 7 set).
#[inline]
pub fn is_status(byte: u8) -> bool {
    byte >= 0x80
}

/// True for the single-byte system realtime statuses (0xF8..=0xFF).
///
/// Realtime bytes may appear between the bytes of any other message,
/// including inside a SysEx transfer, and never cancel running status.
#[inline]
pub fn is_realtime(byte: u8) -> bool {
    byte >= 0xF8
}

/// True for channel voice/mode statuses (0x80..=0xEF).
#[inline]
pub fn is_channel_status(byte: u8) -> bool {
    (0x80..=0xEF).contains(&byte)
}

/// Total on-wire length (status byte included) of the message introduced by
/// `status`, or `None` when the length is not fixed (SysEx start, stray EOX,
/// the undefined 0xF4/0xF5 statuses, or a data byte).
pub fn expected_len(status: u8) -> Option<usize> {
    match status {
        0x80..=0xBF => Some(3),
        0xC0..=0xDF => Some(2),
        0xE0..=0xEF => Some(3),
        status::MTC_QUARTER_FRAME => Some(2),
        status::SONG_POSITION => Some(3),
        status::SONG_SELECT => Some(2),
        status::TUNE_REQUEST => Some(1),
        0xF8..=0xFF => Some(1),
        _ => None,
    }
}

/// One complete MIDI message as delivered by an input session.
///
/// `bytes` is the full wire image: status byte (running status already
/// reinstated by the decoder) followed by data bytes, or `F0 .. F7` for a
/// reassembled SysEx. `timestamp` is the time in seconds since the previous
/// delivered message of the same session; the first delivery reads 0.0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MidiMessage {
    pub bytes: Vec<u8>,
    pub timestamp: f64,
}

impl MidiMessage {
    pub fn new(bytes: Vec<u8>, timestamp: f64) -> Self {
        Self { bytes, timestamp }
    }

    pub fn note_on(channel: u8, note: u8, velocity: u8) -> Self {
        let channel = channel.min(15); // MIDI channels are 0-15
        Self {
            bytes: vec![status::NOTE_ON | channel, note & 0x7F, velocity & 0x7F],
            timestamp: 0.0,
        }
    }

    pub fn note_off(channel: u8, note: u8, velocity: u8) -> Self {
        let channel = channel.min(15);
        Self {
            bytes: vec![status::NOTE_OFF | channel, note & 0x7F, velocity & 0x7F],
            timestamp: 0.0,
        }
    }

    pub fn control_change(channel: u8, controller: u8, value: u8) -> Self {
        let channel = channel.min(15);
        Self {
            bytes: vec![status::CONTROL_CHANGE | channel, controller & 0x7F, value & 0x7F],
            timestamp: 0.0,
        }
    }

    pub fn program_change(channel: u8, program: u8) -> Self {
        let channel = channel.min(15);
        Self {
            bytes: vec![status::PROGRAM_CHANGE | channel, program & 0x7F],
            timestamp: 0.0,
        }
    }

    /// `value`: signed 14-bit (-8192 to 8191); out-of-range values clamp.
    pub fn pitch_bend(channel: u8, value: i16) -> Self {
        let channel = channel.min(15);
        // Widen before offsetting: value + 8192 can exceed i16.
        let unsigned = (i32::from(value) + 8192).clamp(0, 16383) as u16;
        let lsb = (unsigned & 0x7F) as u8;
        let msb = ((unsigned >> 7) & 0x7F) as u8;
        Self {
            bytes: vec![status::PITCH_BEND | channel, lsb, msb],
            timestamp: 0.0,
        }
    }

    /// Wraps `payload` in `F0 .. F7`. Payload bytes must already be 7-bit.
    pub fn sysex(payload: &[u8]) -> Self {
        let mut bytes = Vec::with_capacity(payload.len() + 2);
        bytes.push(status::SYSEX_START);
        bytes.extend_from_slice(payload);
        bytes.push(status::SYSEX_END);
        Self { bytes, timestamp: 0.0 }
    }

    /// Status byte of the message, if any.
    pub fn status(&self) -> Option<u8> {
        self.bytes.first().copied().filter(|b| is_status(*b))
    }

    pub fn is_sysex(&self) -> bool {
        self.status() == Some(status::SYSEX_START)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn note_on_bytes() {
        let msg = MidiMessage::note_on(0, 60, 100);
        assert_eq!(msg.bytes, vec![0x90, 60, 100]);
        assert_eq!(msg.timestamp, 0.0);
    }

    #[test]
    fn channel_is_clamped() {
        let msg = MidiMessage::note_on(99, 60, 100);
        assert_eq!(msg.bytes[0], 0x9F);
    }

    #[test]
    fn data_bytes_are_masked() {
        let msg = MidiMessage::control_change(1, 200, 255);
        assert_eq!(msg.bytes, vec![0xB1, 200 & 0x7F, 0x7F]);
    }

    #[test]
    fn pitch_bend_center() {
        let msg = MidiMessage::pitch_bend(2, 0);
        assert_eq!(msg.bytes, vec![0xE2, 0x00, 0x40]);
    }

    #[test]
    fn pitch_bend_extremes() {
        assert_eq!(MidiMessage::pitch_bend(0, -8192).bytes, vec![0xE0, 0x00, 0x00]);
        assert_eq!(MidiMessage::pitch_bend(0, 8191).bytes, vec![0xE0, 0x7F, 0x7F]);
    }

    #[test]
    fn pitch_bend_out_of_range_clamps() {
        assert_eq!(MidiMessage::pitch_bend(0, 24576).bytes, vec![0xE0, 0x7F, 0x7F]);
        assert_eq!(MidiMessage::pitch_bend(0, i16::MAX).bytes, vec![0xE0, 0x7F, 0x7F]);
        assert_eq!(MidiMessage::pitch_bend(0, i16::MIN).bytes, vec![0xE0, 0x00, 0x00]);
    }

    #[test]
    fn sysex_is_framed() {
        let msg = MidiMessage::sysex(&[0x7D, 1, 2, 3]);
        assert_eq!(msg.bytes, vec![0xF0, 0x7D, 1, 2, 3, 0xF7]);
        assert!(msg.is_sysex());
    }

    #[test]
    fn expected_len_table() {
        assert_eq!(expected_len(0x90), Some(3));
        assert_eq!(expected_len(0xC5), Some(2));
        assert_eq!(expected_len(0xE0), Some(3));
        assert_eq!(expected_len(status::MTC_QUARTER_FRAME), Some(2));
        assert_eq!(expected_len(status::SONG_POSITION), Some(3));
        assert_eq!(expected_len(status::TUNE_REQUEST), Some(1));
        assert_eq!(expected_len(status::TIMING_CLOCK), Some(1));
        assert_eq!(expected_len(status::SYSEX_START), None);
        assert_eq!(expected_len(status::SYSEX_END), None);
        assert_eq!(expected_len(0xF4), None);
        assert_eq!(expected_len(0x40), None);
    }

    #[test]
    fn realtime_classification() {
        assert!(is_realtime(status::TIMING_CLOCK));
        assert!(is_realtime(status::SYSTEM_RESET));
        assert!(!is_realtime(status::SYSEX_END));
        assert!(is_channel_status(0xE3));
        assert!(!is_channel_status(0xF0));
    }
}

//! Input-side message class filtering.

use crate::message::status;
use serde::{Deserialize, Serialize};

/// Message classes an input session can suppress before delivery.
///
/// Filtering happens inside the decoder, so suppressed messages never reach
/// the callback or the queue and never advance the session's delta clock.
/// Takes effect for events decoded after the change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Ignore {
    /// Drop system-exclusive transfers (`F0 .. F7`).
    pub sysex: bool,
    /// Drop timing traffic: clock (0xF8), tick (0xF9), and the MTC
    /// quarter-frame system common (0xF1).
    pub time: bool,
    /// Drop active sensing (0xFE).
    pub active_sense: bool,
}

impl Ignore {
    pub const NONE: Ignore = Ignore { sysex: false, time: false, active_sense: false };
    pub const ALL: Ignore = Ignore { sysex: true, time: true, active_sense: true };

    /// True when a complete message starting with `status_byte` should be
    /// withheld from delivery.
    pub fn suppresses(&self, status_byte: u8) -> bool {
        match status_byte {
            status::SYSEX_START => self.sysex,
            status::TIMING_CLOCK | status::TICK | status::MTC_QUARTER_FRAME => self.time,
            status::ACTIVE_SENSING => self.active_sense,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_passes_everything() {
        let ignore = Ignore::default();
        for status in [0x90, 0xF0, 0xF1, 0xF8, 0xF9, 0xFE, 0xFF] {
            assert!(!ignore.suppresses(status), "{status:#04x} should pass");
        }
    }

    #[test]
    fn time_flag_covers_clock_tick_and_quarter_frame() {
        let ignore = Ignore { time: true, ..Ignore::NONE };
        assert!(ignore.suppresses(0xF8));
        assert!(ignore.suppresses(0xF9));
        assert!(ignore.suppresses(0xF1));
        assert!(!ignore.suppresses(0xFE));
        assert!(!ignore.suppresses(0xFA));
    }

    #[test]
    fn flags_are_independent() {
        let ignore = Ignore { sysex: true, ..Ignore::NONE };
        assert!(ignore.suppresses(0xF0));
        assert!(!ignore.suppresses(0xF8));

        let ignore = Ignore { active_sense: true, ..Ignore::NONE };
        assert!(ignore.suppresses(0xFE));
        assert!(!ignore.suppresses(0xF0));
    }

    #[test]
    fn reset_always_passes() {
        assert!(!Ignore::ALL.suppresses(0xFF));
    }
}

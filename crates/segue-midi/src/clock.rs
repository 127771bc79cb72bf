//! Delta timestamping for input sessions.
//!
//! Transports report absolute event times in whatever unit the OS provides
//! (sequencer queue ticks in seconds+nanoseconds, driver milliseconds, DOM
//! high-resolution milliseconds). Backends normalize those into [`RealTime`]
//! and the per-session [`DeltaClock`] turns them into the seconds-since-
//! previous-delivery value carried on every message.

use std::time::Duration;
use tracing::warn;

const NANOS_PER_SEC: u64 = 1_000_000_000;

/// An absolute event time: whole seconds plus a sub-second nanosecond part.
///
/// `nanos` is always below one billion; constructors normalize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct RealTime {
    secs: u64,
    nanos: u32,
}

impl RealTime {
    pub fn new(secs: u64, nanos: u32) -> Self {
        Self {
            secs: secs + (nanos as u64 / NANOS_PER_SEC),
            nanos: (nanos as u64 % NANOS_PER_SEC) as u32,
        }
    }

    pub fn from_nanos(nanos: u64) -> Self {
        Self {
            secs: nanos / NANOS_PER_SEC,
            nanos: (nanos % NANOS_PER_SEC) as u32,
        }
    }

    pub fn from_micros(micros: u64) -> Self {
        Self {
            secs: micros / 1_000_000,
            nanos: ((micros % 1_000_000) * 1_000) as u32,
        }
    }

    pub fn from_millis(millis: u64) -> Self {
        Self {
            secs: millis / 1_000,
            nanos: ((millis % 1_000) * 1_000_000) as u32,
        }
    }

    /// Fractional seconds; negative inputs clamp to zero (browser clocks can
    /// report a negative origin-relative stamp before the origin settles).
    pub fn from_secs_f64(secs: f64) -> Self {
        if !secs.is_finite() || secs <= 0.0 {
            return Self::default();
        }
        let whole = secs.floor();
        let nanos = ((secs - whole) * 1e9).round() as u64;
        Self::new(whole as u64, 0).add_nanos(nanos)
    }

    fn add_nanos(self, nanos: u64) -> Self {
        let total = self.nanos as u64 + nanos;
        Self {
            secs: self.secs + total / NANOS_PER_SEC,
            nanos: (total % NANOS_PER_SEC) as u32,
        }
    }

    pub fn secs(&self) -> u64 {
        self.secs
    }

    pub fn subsec_nanos(&self) -> u32 {
        self.nanos
    }

    pub fn as_secs_f64(&self) -> f64 {
        self.secs as f64 + self.nanos as f64 * 1e-9
    }
}

impl From<Duration> for RealTime {
    fn from(d: Duration) -> Self {
        Self {
            secs: d.as_secs(),
            nanos: d.subsec_nanos(),
        }
    }
}

/// Computes per-delivery delta timestamps for one input session.
///
/// The first delivered message of a session is stamped 0.0 regardless of its
/// absolute event time; each later delivery is stamped with the elapsed
/// seconds since the previous one. The reference point only advances on
/// delivery, so a SysEx that arrives in fragments is stamped relative to the
/// message delivered before the transfer began, and filtered messages leave
/// no trace.
#[derive(Debug, Default)]
pub struct DeltaClock {
    last: Option<RealTime>,
}

impl DeltaClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delta in seconds from the previously recorded delivery to `now`,
    /// recording `now` as the new reference. A clock that retreats by more
    /// than the nanosecond borrow can absorb is reported as 0.0, never
    /// negative.
    pub fn delta_seconds(&mut self, now: RealTime) -> f64 {
        let prev = match self.last.replace(now) {
            Some(prev) => prev,
            None => return 0.0,
        };

        let mut secs = now.secs as i64 - prev.secs as i64;
        let nanos = if now.nanos < prev.nanos {
            secs -= 1;
            now.nanos + 1_000_000_000 - prev.nanos
        } else {
            now.nanos - prev.nanos
        };

        if secs < 0 {
            warn!(
                retreat_secs = -secs,
                "event clock moved backwards; clamping delta to zero"
            );
            return 0.0;
        }
        secs as f64 + nanos as f64 * 1e-9
    }

    /// Forgets the reference point; the next delivery is stamped 0.0 again.
    pub fn reset(&mut self) {
        self.last = None;
    }
}

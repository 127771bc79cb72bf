//! Session-shared delivery machinery.
//!
//! Every open input session owns one [`InputStage`] on its engine context
//! (the backend thread or OS callback): decoder, delta clock, and the
//! producer half of the bounded queue. The matching [`InputShared`] is the
//! half the facade can reach while the session runs: ignore flags, the
//! callback slots, and the drop counter. Output pacing for oversized
//! messages lives here too.

use crate::error::{ErrorCallback, ErrorKind, Result};
use ringbuf::{
    traits::{Producer, Split},
    HeapProd, HeapRb,
};
use segue_midi::{DeltaClock, Ignore, MidiMessage, RealTime, StreamDecoder};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{trace, warn};

/// Messages buffered per session when no callback is registered.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

pub type MessageCallback = Box<dyn FnMut(MidiMessage) + Send>;

/// Routes a warning to the callback slot if present, otherwise to the log.
pub(crate) fn emit_warning(slot: &mut Option<ErrorCallback>, message: &str) {
    match slot.as_mut() {
        Some(callback) => callback(ErrorKind::Warning, message),
        None => warn!("{message}"),
    }
}

/// The message callback plus a counter bumped on every install/clear, so
/// the delivery path can tell whether the slot changed while it held the
/// callback out of the lock.
#[derive(Default)]
struct CallbackSlot {
    callback: Option<MessageCallback>,
    generation: u64,
}

/// State shared between a session facade and its engine context.
pub(crate) struct InputShared {
    ignore: parking_lot::Mutex<Ignore>,
    callback: parking_lot::Mutex<CallbackSlot>,
    error_callback: parking_lot::Mutex<Option<ErrorCallback>>,
    dropped: AtomicU64,
}

impl InputShared {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            ignore: parking_lot::Mutex::new(Ignore::NONE),
            callback: parking_lot::Mutex::new(CallbackSlot::default()),
            error_callback: parking_lot::Mutex::new(None),
            dropped: AtomicU64::new(0),
        })
    }

    pub fn ignore(&self) -> Ignore {
        *self.ignore.lock()
    }

    pub fn set_ignore(&self, flags: Ignore) {
        *self.ignore.lock() = flags;
    }

    /// Installs (or clears) the message callback; returns whether one was
    /// already installed. Safe to call from inside the callback itself.
    pub fn replace_callback(&self, callback: Option<MessageCallback>) -> bool {
        let mut slot = self.callback.lock();
        slot.generation += 1;
        let had_previous = slot.callback.is_some();
        slot.callback = callback;
        had_previous
    }

    pub fn set_error_callback(&self, callback: Option<ErrorCallback>) {
        *self.error_callback.lock() = callback;
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn warn(&self, message: &str) {
        emit_warning(&mut self.error_callback.lock(), message);
    }
}

/// The engine-context half of an input session.
///
/// Single-threaded by construction: exactly one stage exists per open
/// session and only its engine context touches it.
pub(crate) struct InputStage {
    decoder: StreamDecoder,
    clock: DeltaClock,
    queue: HeapProd<MidiMessage>,
    shared: Arc<InputShared>,
}

impl InputStage {
    pub fn new(shared: Arc<InputShared>, queue: HeapProd<MidiMessage>) -> Self {
        Self {
            decoder: StreamDecoder::new(),
            clock: DeltaClock::new(),
            queue,
            shared,
        }
    }

    /// Decodes one transport chunk stamped `at` and delivers every complete
    /// message it yields: to the callback when one is registered, else into
    /// the queue. A full queue drops the message and bumps the counter;
    /// delivery itself never blocks the engine context.
    pub fn feed_chunk(&mut self, chunk: &[u8], at: RealTime) {
        let ignore = self.shared.ignore();
        let Self { decoder, clock, queue, shared } = self;
        decoder.feed(chunk, ignore, |bytes| {
            let timestamp = clock.delta_seconds(at);
            let message = MidiMessage::new(bytes, timestamp);
            // The callback is taken out and invoked with the slot unlocked,
            // so it may reconfigure its own session without deadlocking.
            let taken = {
                let mut slot = shared.callback.lock();
                let generation = slot.generation;
                slot.callback.take().map(|callback| (callback, generation))
            };
            match taken {
                Some((mut callback, generation)) => {
                    callback(message);
                    let mut slot = shared.callback.lock();
                    // Restore unless the callback swapped or cancelled
                    // itself while it ran.
                    if slot.generation == generation && slot.callback.is_none() {
                        slot.callback = Some(callback);
                    }
                }
                None => {
                    if queue.try_push(message).is_err() {
                        let total = shared.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                        trace!(total, "input queue full; dropping message");
                    }
                }
            }
        });
    }
}

/// Builds the queue pair for one session.
pub(crate) fn message_queue(
    capacity: usize,
) -> (HeapProd<MidiMessage>, ringbuf::HeapCons<MidiMessage>) {
    HeapRb::new(capacity).split()
}

/// Opt-in pacing for large outbound messages.
///
/// When a session has a policy installed, any message longer than `size` is
/// sent as consecutive `size`-byte slices with `wait(interval)` between
/// them. The wait function may sleep, poll, or refuse: returning `false`
/// abandons the rest of the transfer.
pub struct ChunkPolicy {
    size: usize,
    interval: Duration,
    wait: Box<dyn FnMut(Duration) -> bool + Send>,
}

impl ChunkPolicy {
    /// Policy whose wait function really sleeps for `interval`.
    pub fn new(size: usize, interval: Duration) -> Self {
        Self {
            size,
            interval,
            wait: Box::new(|pause| {
                std::thread::sleep(pause);
                true
            }),
        }
    }

    /// Replaces the pause behavior. The transfer stops early the first time
    /// `wait` returns `false`.
    pub fn with_wait<F>(mut self, wait: F) -> Self
    where
        F: FnMut(Duration) -> bool + Send + 'static,
    {
        self.wait = Box::new(wait);
        self
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

impl fmt::Debug for ChunkPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkPolicy")
            .field("size", &self.size)
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

/// Sends `bytes` in policy-sized slices, pausing between them. Returns
/// `Ok(false)` when the wait function aborted the transfer early.
pub(crate) fn send_chunked<F>(
    bytes: &[u8],
    policy: &mut ChunkPolicy,
    mut send: F,
) -> Result<bool>
where
    F: FnMut(&[u8]) -> Result<()>,
{
    let mut sent = 0;
    for chunk in bytes.chunks(policy.size.max(1)) {
        if sent > 0 && !(policy.wait)(policy.interval) {
            trace!(sent, total = bytes.len(), "chunked send aborted by wait policy");
            return Ok(false);
        }
        send(chunk)?;
        sent += chunk.len();
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ringbuf::traits::Consumer;
    use std::sync::Mutex;

    fn stage_with_queue(capacity: usize) -> (InputStage, ringbuf::HeapCons<MidiMessage>, Arc<InputShared>) {
        let shared = InputShared::new();
        let (prod, cons) = message_queue(capacity);
        (InputStage::new(Arc::clone(&shared), prod), cons, shared)
    }

    #[test]
    fn queue_mode_delivers_in_order() {
        let (mut stage, mut cons, _shared) = stage_with_queue(8);
        stage.feed_chunk(&[0x90, 60, 100, 0x80, 60, 0], RealTime::new(1, 0));
        let first = cons.try_pop().unwrap();
        let second = cons.try_pop().unwrap();
        assert_eq!(first.bytes, vec![0x90, 60, 100]);
        assert_eq!(second.bytes, vec![0x80, 60, 0]);
        assert!(cons.try_pop().is_none());
    }

    #[test]
    fn first_delivery_is_stamped_zero() {
        let (mut stage, mut cons, _shared) = stage_with_queue(8);
        stage.feed_chunk(&[0x90, 60, 100], RealTime::new(500, 250_000_000));
        assert_eq!(cons.try_pop().unwrap().timestamp, 0.0);
    }

    #[test]
    fn deltas_track_chunk_times() {
        let (mut stage, mut cons, _shared) = stage_with_queue(8);
        stage.feed_chunk(&[0x90, 60, 100], RealTime::new(10, 0));
        stage.feed_chunk(&[0x80, 60, 0], RealTime::new(12, 500_000_000));
        cons.try_pop().unwrap();
        let second = cons.try_pop().unwrap();
        assert!((second.timestamp - 2.5).abs() < 1e-9);
    }

    #[test]
    fn callback_mode_bypasses_queue() {
        let (mut stage, mut cons, shared) = stage_with_queue(8);
        let seen: Arc<Mutex<Vec<MidiMessage>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        shared.replace_callback(Some(Box::new(move |msg| sink.lock().unwrap().push(msg))));

        stage.feed_chunk(&[0xB0, 7, 99], RealTime::new(1, 0));
        assert!(cons.try_pop().is_none());
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].bytes, vec![0xB0, 7, 99]);
    }

    #[test]
    fn cancelling_the_callback_restores_queueing() {
        let (mut stage, mut cons, shared) = stage_with_queue(8);
        shared.replace_callback(Some(Box::new(|_| {})));
        stage.feed_chunk(&[0x90, 60, 100], RealTime::new(1, 0));
        assert!(cons.try_pop().is_none());

        assert!(shared.replace_callback(None));
        stage.feed_chunk(&[0x80, 60, 0], RealTime::new(2, 0));
        assert_eq!(cons.try_pop().unwrap().bytes, vec![0x80, 60, 0]);
    }

    #[test]
    fn callback_may_cancel_itself() {
        let (mut stage, mut cons, shared) = stage_with_queue(8);
        let seen = Arc::new(Mutex::new(0u32));
        let count = Arc::clone(&seen);
        let session = Arc::clone(&shared);
        shared.replace_callback(Some(Box::new(move |_| {
            *count.lock().unwrap() += 1;
            session.replace_callback(None);
        })));

        stage.feed_chunk(&[0x90, 60, 100], RealTime::new(1, 0));
        assert_eq!(*seen.lock().unwrap(), 1);

        // The cancellation sticks: the next delivery queues.
        stage.feed_chunk(&[0x80, 60, 0], RealTime::new(2, 0));
        assert_eq!(*seen.lock().unwrap(), 1);
        assert_eq!(cons.try_pop().unwrap().bytes, vec![0x80, 60, 0]);
        assert!(cons.try_pop().is_none());
    }

    #[test]
    fn callback_may_replace_itself() {
        let (mut stage, mut cons, shared) = stage_with_queue(8);
        let log: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
        let first_log = Arc::clone(&log);
        let second_log = Arc::clone(&log);
        let session = Arc::clone(&shared);
        shared.replace_callback(Some(Box::new(move |_| {
            first_log.lock().unwrap().push("first");
            let inner = Arc::clone(&second_log);
            session.replace_callback(Some(Box::new(move |_| {
                inner.lock().unwrap().push("second");
            })));
        })));

        stage.feed_chunk(&[0x90, 60, 100], RealTime::new(1, 0));
        stage.feed_chunk(&[0x80, 60, 0], RealTime::new(2, 0));
        assert_eq!(*log.lock().unwrap(), vec!["first", "second"]);
        assert!(cons.try_pop().is_none());
    }

    #[test]
    fn overflow_drops_silently_and_counts() {
        let (mut stage, mut cons, shared) = stage_with_queue(2);
        for i in 0..5u8 {
            stage.feed_chunk(&[0x90, 60 + i, 100], RealTime::new(i as u64, 0));
        }
        assert_eq!(shared.dropped(), 3);
        // The oldest two messages survive untouched.
        assert_eq!(cons.try_pop().unwrap().bytes, vec![0x90, 60, 100]);
        assert_eq!(cons.try_pop().unwrap().bytes, vec![0x90, 61, 100]);
        assert!(cons.try_pop().is_none());
    }

    #[test]
    fn filtered_messages_do_not_advance_the_clock() {
        let (mut stage, mut cons, shared) = stage_with_queue(8);
        shared.set_ignore(Ignore { time: true, ..Ignore::NONE });
        stage.feed_chunk(&[0xF8], RealTime::new(1, 0));
        stage.feed_chunk(&[0x90, 60, 100], RealTime::new(4, 0));
        let msg = cons.try_pop().unwrap();
        // The suppressed clock byte was never delivered, so the note is the
        // session's first delivery.
        assert_eq!(msg.timestamp, 0.0);
        assert!(cons.try_pop().is_none());
    }

    #[test]
    fn sysex_is_stamped_at_completion_relative_to_previous_delivery() {
        let (mut stage, mut cons, _shared) = stage_with_queue(8);
        stage.feed_chunk(&[0x90, 60, 100], RealTime::new(1, 0));
        stage.feed_chunk(&[0xF0, 1, 2], RealTime::new(2, 0));
        stage.feed_chunk(&[3, 0xF7], RealTime::new(3, 0));
        cons.try_pop().unwrap();
        let sysex = cons.try_pop().unwrap();
        assert_eq!(sysex.bytes, vec![0xF0, 1, 2, 3, 0xF7]);
        // Buffered fragments do not advance the reference point.
        assert!((sysex.timestamp - 2.0).abs() < 1e-9);
    }

    #[test]
    fn ignore_changes_apply_mid_session() {
        let (mut stage, mut cons, shared) = stage_with_queue(8);
        stage.feed_chunk(&[0xFE], RealTime::new(1, 0));
        assert!(cons.try_pop().is_some());

        shared.set_ignore(Ignore { active_sense: true, ..Ignore::NONE });
        stage.feed_chunk(&[0xFE], RealTime::new(2, 0));
        assert!(cons.try_pop().is_none());
    }

    // ---- chunked sending ----

    #[test]
    fn chunked_send_slices_and_paces() {
        let waits: Arc<Mutex<Vec<Duration>>> = Arc::new(Mutex::new(Vec::new()));
        let record = Arc::clone(&waits);
        let mut policy = ChunkPolicy::new(4, Duration::from_millis(10)).with_wait(move |pause| {
            record.lock().unwrap().push(pause);
            true
        });

        let mut chunks: Vec<Vec<u8>> = Vec::new();
        let bytes: Vec<u8> = (0..10).collect();
        let completed = send_chunked(&bytes, &mut policy, |c| {
            chunks.push(c.to_vec());
            Ok(())
        })
        .unwrap();

        assert!(completed);
        assert_eq!(chunks, vec![vec![0, 1, 2, 3], vec![4, 5, 6, 7], vec![8, 9]]);
        assert_eq!(*waits.lock().unwrap(), vec![Duration::from_millis(10); 2]);
    }

    #[test]
    fn chunked_send_stops_when_wait_refuses() {
        let mut policy = ChunkPolicy::new(2, Duration::ZERO).with_wait(|_| false);
        let mut sent = Vec::new();
        let completed = send_chunked(&[1, 2, 3, 4, 5], &mut policy, |c| {
            sent.extend_from_slice(c);
            Ok(())
        })
        .unwrap();
        assert!(!completed);
        assert_eq!(sent, vec![1, 2]);
    }

    #[test]
    fn small_messages_go_out_in_one_piece() {
        let mut policy = ChunkPolicy::new(64, Duration::from_millis(5)).with_wait(|_| {
            panic!("wait must not run for a single-chunk send")
        });
        let mut chunks = 0;
        send_chunked(&[0x90, 60, 100], &mut policy, |_| {
            chunks += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(chunks, 1);
    }
}

//! Input sessions: open a source port and receive timestamped messages.

use crate::backend;
use crate::engine::{self, InputShared, InputStage, DEFAULT_QUEUE_CAPACITY};
use crate::error::{Error, ErrorKind, Result};
use ringbuf::traits::Consumer;
use segue_midi::{Ignore, MidiMessage, PortInfo};
use std::sync::Arc;

/// One input session.
///
/// A session enumerates source ports and can hold at most one open port at
/// a time. While a port is open, a per-session engine context (backend
/// thread or OS callback) decodes the incoming byte stream into complete
/// messages and delivers each one either to the registered callback or
/// into a bounded queue drained with [`get_message`](MidiInput::get_message).
/// When the queue is full, new messages are dropped silently;
/// [`dropped_messages`](MidiInput::dropped_messages) counts them.
///
/// ```no_run
/// # fn main() -> Result<(), segue_midi_io::Error> {
/// use segue_midi_io::MidiInput;
///
/// let mut input = MidiInput::new("segue monitor")?;
/// if let Some(index) = input.find_port("Synth") {
///     input.open_port(index, "monitor-in")?;
///     loop {
///         while let Some(msg) = input.get_message() {
///             println!("+{:.6}s {:02x?}", msg.timestamp, msg.bytes);
///         }
///         std::thread::sleep(std::time::Duration::from_millis(10));
///     }
/// }
/// # Ok(())
/// # }
/// ```
pub struct MidiInput {
    imp: backend::MidiInputImpl,
    shared: Arc<InputShared>,
    consumer: Option<ringbuf::HeapCons<MidiMessage>>,
    queue_capacity: usize,
}

impl MidiInput {
    /// Creates a session registered with the OS transport as `client_name`.
    pub fn new(client_name: &str) -> Result<Self> {
        Ok(Self {
            imp: backend::MidiInputImpl::new(client_name)?,
            shared: InputShared::new(),
            consumer: None,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        })
    }

    /// Number of source ports currently enumerable.
    pub fn port_count(&self) -> usize {
        self.imp.port_count()
    }

    /// A fresh enumeration of the source ports.
    pub fn ports(&self) -> Vec<PortInfo> {
        self.imp.ports()
    }

    /// Display name of the source port at `index`.
    pub fn port_name(&self, index: usize) -> Result<String> {
        self.imp.port_name(index)
    }

    /// Index of the first source port whose display name contains
    /// `fragment`.
    pub fn find_port(&self, fragment: &str) -> Option<usize> {
        self.ports().iter().position(|p| p.name.contains(fragment))
    }

    /// Connects to the source port at `index`, naming our end `port_name`,
    /// and starts the engine context.
    pub fn open_port(&mut self, index: usize, port_name: &str) -> Result<()> {
        if self.imp.is_port_open() {
            return Err(Error::InvalidUse(
                "a port is already open on this session".into(),
            ));
        }
        let count = self.imp.port_count();
        if count == 0 {
            return Err(Error::NoDevicesFound);
        }
        if index >= count {
            return Err(Error::InvalidParameter(format!(
                "port index {index} out of range (0..{count})"
            )));
        }
        let (producer, consumer) = engine::message_queue(self.queue_capacity);
        let stage = InputStage::new(Arc::clone(&self.shared), producer);
        self.imp.open_port(index, port_name, stage)?;
        self.consumer = Some(consumer);
        Ok(())
    }

    /// Creates a connectable port owned by this session and waits for peers
    /// to subscribe to it. Fails with [`Error::InvalidUse`] on transports
    /// without virtual ports (Windows, the browser, the fallback build).
    pub fn open_virtual_port(&mut self, port_name: &str) -> Result<()> {
        if self.imp.is_port_open() {
            return Err(Error::InvalidUse(
                "a port is already open on this session".into(),
            ));
        }
        let (producer, consumer) = engine::message_queue(self.queue_capacity);
        let stage = InputStage::new(Arc::clone(&self.shared), producer);
        self.imp.open_virtual_port(port_name, stage)?;
        self.consumer = Some(consumer);
        Ok(())
    }

    /// Stops the engine context, joins it, and releases the OS port.
    /// Idempotent; messages already queued remain readable. Never call this
    /// from inside the session's own callback.
    pub fn close_port(&mut self) {
        self.imp.close_port();
    }

    pub fn is_port_open(&self) -> bool {
        self.imp.is_port_open()
    }

    /// Message classes to suppress from now on.
    pub fn set_ignore(&mut self, flags: Ignore) {
        self.shared.set_ignore(flags);
    }

    pub fn ignore(&self) -> Ignore {
        self.shared.ignore()
    }

    /// Routes every delivered message to `callback` instead of the queue.
    /// Takes effect immediately, including while the port is open;
    /// replacing an installed callback warns first.
    ///
    /// The callback runs on the engine context. It may install or cancel
    /// the callback of its own session, but it must never call
    /// [`close_port`](MidiInput::close_port) (that would deadlock the
    /// close-time join).
    pub fn set_callback<F>(&mut self, callback: F)
    where
        F: FnMut(MidiMessage) + Send + 'static,
    {
        if self.shared.replace_callback(Some(Box::new(callback))) {
            self.shared
                .warn("replacing an input callback that was already installed");
        }
    }

    /// Removes the callback; deliveries queue again.
    pub fn cancel_callback(&mut self) {
        if !self.shared.replace_callback(None) {
            self.shared.warn("no input callback was installed");
        }
    }

    /// Next queued message, oldest first, with its delta timestamp.
    /// `None` when the queue is empty (or a callback is installed).
    pub fn get_message(&mut self) -> Option<MidiMessage> {
        self.consumer.as_mut()?.try_pop()
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    /// Resizes the queue used by the *next* open. Rejected while a port is
    /// open: the running queue cannot be swapped without losing messages.
    pub fn set_queue_capacity(&mut self, capacity: usize) -> Result<()> {
        if self.imp.is_port_open() {
            return Err(Error::InvalidUse(
                "cannot resize the queue while a port is open".into(),
            ));
        }
        if capacity == 0 {
            return Err(Error::InvalidParameter("queue capacity must be nonzero".into()));
        }
        self.queue_capacity = capacity;
        Ok(())
    }

    /// Messages discarded because the queue was full, since the session was
    /// created.
    pub fn dropped_messages(&self) -> u64 {
        self.shared.dropped()
    }

    /// Receives warnings the engine context cannot return through a
    /// `Result` (decode problems, capability no-ops).
    pub fn set_error_callback<F>(&mut self, callback: F)
    where
        F: FnMut(ErrorKind, &str) + Send + 'static,
    {
        self.shared.set_error_callback(Some(Box::new(callback)));
    }

    /// Renames this session's client where the transport supports it; a
    /// no-op with a warning elsewhere.
    pub fn set_client_name(&mut self, name: &str) -> Result<()> {
        self.imp.set_client_name(name)
    }

    /// Renames the session's open port where the transport supports it.
    pub fn set_port_name(&mut self, name: &str) -> Result<()> {
        self.imp.set_port_name(name)
    }
}

impl Drop for MidiInput {
    fn drop(&mut self) {
        self.close_port();
    }
}

//! Output sessions: open a destination port and send messages.

use crate::backend;
use crate::engine::{self, ChunkPolicy};
use crate::error::{Error, ErrorCallback, ErrorKind, Result};
use segue_midi::PortInfo;

/// One output session.
///
/// Sending is synchronous: [`send_message`](MidiOutput::send_message)
/// returns once the transport has accepted the bytes. A session is not
/// meant to be shared across threads mid-message; wrap it in a lock if two
/// threads must interleave sends.
///
/// ```no_run
/// # fn main() -> Result<(), segue_midi_io::Error> {
/// use segue_midi_io::{MidiMessage, MidiOutput};
///
/// let mut output = MidiOutput::new("segue sender")?;
/// output.open_port(0, "sender-out")?;
/// output.send_message(&MidiMessage::note_on(0, 60, 100).bytes)?;
/// std::thread::sleep(std::time::Duration::from_millis(200));
/// output.send_message(&MidiMessage::note_off(0, 60, 0).bytes)?;
/// # Ok(())
/// # }
/// ```
pub struct MidiOutput {
    imp: backend::MidiOutputImpl,
    chunking: Option<ChunkPolicy>,
    error_callback: Option<ErrorCallback>,
}

impl MidiOutput {
    /// Creates a session registered with the OS transport as `client_name`.
    pub fn new(client_name: &str) -> Result<Self> {
        Ok(Self {
            imp: backend::MidiOutputImpl::new(client_name)?,
            chunking: None,
            error_callback: None,
        })
    }

    /// Number of destination ports currently enumerable.
    pub fn port_count(&self) -> usize {
        self.imp.port_count()
    }

    /// A fresh enumeration of the destination ports.
    pub fn ports(&self) -> Vec<PortInfo> {
        self.imp.ports()
    }

    /// Display name of the destination port at `index`.
    pub fn port_name(&self, index: usize) -> Result<String> {
        self.imp.port_name(index)
    }

    /// Index of the first destination port whose display name contains
    /// `fragment`.
    pub fn find_port(&self, fragment: &str) -> Option<usize> {
        self.ports().iter().position(|p| p.name.contains(fragment))
    }

    /// Connects to the destination port at `index`, naming our end
    /// `port_name`.
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
        self.imp.open_port(index, port_name)
    }

    /// Creates a connectable destination owned by this session; peers
    /// subscribe to it and receive whatever we send. Fails with
    /// [`Error::InvalidUse`] on transports without virtual ports.
    pub fn open_virtual_port(&mut self, port_name: &str) -> Result<()> {
        if self.imp.is_port_open() {
            return Err(Error::InvalidUse(
                "a port is already open on this session".into(),
            ));
        }
        self.imp.open_virtual_port(port_name)
    }

    /// Releases the OS port. Idempotent.
    pub fn close_port(&mut self) {
        self.imp.close_port();
    }

    pub fn is_port_open(&self) -> bool {
        self.imp.is_port_open()
    }

    /// Sends one complete message (a channel voice message, system common,
    /// realtime byte, or a full `F0 .. F7` SysEx).
    ///
    /// With a chunk policy installed, messages longer than the policy size
    /// go out as paced slices; the policy's wait function can abort the
    /// remainder, which is reported as a warning, not an error. An aborted
    /// SysEx transfer leaves the receiver holding an unterminated message
    /// that it will discard.
    pub fn send_message(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.is_empty() {
            return Err(Error::InvalidParameter("message is empty".into()));
        }
        if !self.imp.is_port_open() {
            return Err(Error::InvalidUse("no open port".into()));
        }
        let Self { imp, chunking, error_callback } = self;
        match chunking.as_mut() {
            Some(policy) if bytes.len() > policy.size() => {
                let completed = engine::send_chunked(bytes, policy, |chunk| imp.send(chunk))?;
                if !completed {
                    engine::emit_warning(
                        error_callback,
                        "chunked send aborted by the wait policy",
                    );
                }
                Ok(())
            }
            _ => imp.send(bytes),
        }
    }

    /// Installs (or clears) the pacing policy for oversized messages.
    pub fn set_chunking(&mut self, policy: Option<ChunkPolicy>) -> Result<()> {
        if let Some(policy) = &policy {
            if policy.size() == 0 {
                return Err(Error::InvalidParameter("chunk size must be nonzero".into()));
            }
        }
        self.chunking = policy;
        Ok(())
    }

    /// Receives warnings this session cannot return through a `Result`.
    pub fn set_error_callback<F>(&mut self, callback: F)
    where
        F: FnMut(ErrorKind, &str) + Send + 'static,
    {
        self.error_callback = Some(Box::new(callback));
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

impl Drop for MidiOutput {
    fn drop(&mut self) {
        self.close_port();
    }
}

//! Linux sequencer transport.
//!
//! Sessions register as sequencer clients over one duplex, nonblocking
//! handle. Input subscribes the source port to a private application port
//! with real-time queue timestamping, then a per-session thread blocks in
//! `poll(2)` on the sequencer descriptors plus a wake pipe; `close_port`
//! writes the pipe, joins, and only then tears the subscription down. Short
//! events are re-encoded to wire bytes with the kernel's event codec; SysEx
//! events pass through as raw fragments for the stream decoder to
//! reassemble. Hot-plug observation subscribes to the system announce port
//! instead of polling.

use crate::engine::InputStage;
use crate::error::{Error, Result};
use crate::observer::DirectoryWatch;
use alsa::poll::Descriptors;
use alsa::seq::{self, Addr, EventType, PortCap, PortType, Seq};
use alsa::Direction;
use parking_lot::Mutex;
use segue_midi::{PortInfo, RealTime, Snapshot};
use std::ffi::CString;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, trace, warn};

/// System:Announce, the kernel port that broadcasts client/port lifecycle
/// events.
const ANNOUNCE: Addr = Addr { client: 0, port: 1 };

fn cstr(name: &str) -> Result<CString> {
    CString::new(name)
        .map_err(|_| Error::InvalidParameter("name contains a NUL byte".into()))
}

fn pack_address(addr: Addr) -> u64 {
    ((addr.client as u32 as u64) << 32) | (addr.port as u32 as u64)
}

/// Walks every client's ports, keeping those with `want` capabilities and a
/// MIDI-capable type. Display names follow the `client:port c:p` shape so
/// equally named devices stay distinguishable.
fn enumerate(seq: &Seq, want: PortCap, exclude_client: Option<i32>) -> Vec<(Addr, String)> {
    let mut out = Vec::new();
    for client in seq::ClientIter::new(seq) {
        let client_id = client.get_client();
        if Some(client_id) == exclude_client {
            continue;
        }
        let client_name = client.get_name().unwrap_or_default().to_string();
        for port in seq::PortIter::new(seq, client_id) {
            if !port.get_capability().contains(want) {
                continue;
            }
            let midi_types = PortType::MIDI_GENERIC | PortType::SYNTH | PortType::APPLICATION;
            if !port.get_type().intersects(midi_types) {
                continue;
            }
            let addr = Addr { client: client_id, port: port.get_port() };
            let port_name = port.get_name().unwrap_or_default();
            out.push((
                addr,
                format!("{client_name}:{port_name} {}:{}", addr.client, addr.port),
            ));
        }
    }
    out
}

fn to_port_infos(listing: Vec<(Addr, String)>) -> Vec<PortInfo> {
    listing
        .into_iter()
        .map(|(addr, name)| PortInfo::new(pack_address(addr), name))
        .collect()
}

/// Self-pipe used to interrupt a thread blocked in `poll(2)`.
struct WakePipe {
    fds: [libc::c_int; 2],
}

impl WakePipe {
    fn new() -> Result<Self> {
        let mut fds = [0 as libc::c_int; 2];
        // SAFETY: pipe(2) into a properly sized array.
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(Error::Thread("failed to create wake pipe".into()));
        }
        Ok(Self { fds })
    }

    fn reader(&self) -> libc::c_int {
        self.fds[0]
    }

    fn signal(&self) {
        let byte = [1u8];
        // SAFETY: one-byte write to our own pipe; failure only means the
        // reader is already gone.
        unsafe { libc::write(self.fds[1], byte.as_ptr().cast(), 1) };
    }
}

impl Drop for WakePipe {
    fn drop(&mut self) {
        // SAFETY: closing fds this struct owns.
        unsafe {
            libc::close(self.fds[0]);
            libc::close(self.fds[1]);
        }
    }
}

/// Creates the session's own sequencer port. `queue` enables kernel
/// real-time timestamping of events arriving at the port.
fn create_app_port(seq: &Seq, name: &str, caps: PortCap, queue: Option<i32>) -> Result<i32> {
    let pinfo = seq::PortInfo::empty()?;
    pinfo.set_capability(caps);
    pinfo.set_type(PortType::MIDI_GENERIC | PortType::APPLICATION);
    pinfo.set_midi_channels(16);
    if let Some(queue) = queue {
        pinfo.set_timestamping(true);
        pinfo.set_timestamp_real(true);
        pinfo.set_timestamp_queue(queue);
    }
    pinfo.set_name(&cstr(name)?);
    seq.create_port(&pinfo)?;
    Ok(pinfo.get_port())
}

// ---- input ----

struct InputSession {
    thread: JoinHandle<()>,
    wake: WakePipe,
    own_port: i32,
    queue: i32,
    source: Option<Addr>,
}

pub(crate) struct MidiInputImpl {
    seq: Arc<Mutex<Seq>>,
    client_id: i32,
    session: Option<InputSession>,
}

impl MidiInputImpl {
    pub fn new(client_name: &str) -> Result<Self> {
        let seq = Seq::open(None, None, true)?;
        seq.set_client_name(&cstr(client_name)?)?;
        let client_id = seq.client_id()?;
        debug!(client_id, client_name, "sequencer input client ready");
        Ok(Self {
            seq: Arc::new(Mutex::new(seq)),
            client_id,
            session: None,
        })
    }

    fn sources(&self) -> Vec<(Addr, String)> {
        enumerate(&self.seq.lock(), PortCap::READ | PortCap::SUBS_READ, None)
    }

    pub fn port_count(&self) -> usize {
        self.sources().len()
    }

    pub fn ports(&self) -> Vec<PortInfo> {
        to_port_infos(self.sources())
    }

    pub fn port_name(&self, index: usize) -> Result<String> {
        let mut listing = self.sources();
        if index >= listing.len() {
            return Err(Error::InvalidParameter(format!(
                "port index {index} out of range (0..{})",
                listing.len()
            )));
        }
        Ok(listing.swap_remove(index).1)
    }

    pub fn open_port(&mut self, index: usize, port_name: &str, stage: InputStage) -> Result<()> {
        let listing = self.sources();
        let Some((source, _)) = listing.get(index) else {
            return Err(Error::InvalidParameter(format!(
                "port index {index} out of range (0..{})",
                listing.len()
            )));
        };
        self.start_session(Some(*source), port_name, stage)
    }

    pub fn open_virtual_port(&mut self, port_name: &str, stage: InputStage) -> Result<()> {
        self.start_session(None, port_name, stage)
    }

    /// Creates port + queue, subscribes when reading a real source, then
    /// starts the reader thread. Any failure unwinds the sequencer state
    /// already set up.
    fn start_session(
        &mut self,
        source: Option<Addr>,
        port_name: &str,
        stage: InputStage,
    ) -> Result<()> {
        let (own_port, queue) = {
            let seq = self.seq.lock();

            let queue = seq.alloc_named_queue(&cstr("segue input queue")?)?;
            let setup = || -> Result<i32> {
                let tempo = seq::QueueTempo::empty()?;
                tempo.set_tempo(600_000);
                tempo.set_ppq(240);
                seq.set_queue_tempo(queue, &tempo)?;

                let own_port = create_app_port(
                    &seq,
                    port_name,
                    PortCap::WRITE | PortCap::SUBS_WRITE,
                    Some(queue),
                )?;

                if let Some(source) = source {
                    let sub = seq::PortSubscribe::empty()?;
                    sub.set_sender(source);
                    sub.set_dest(Addr { client: self.client_id, port: own_port });
                    sub.set_queue(queue);
                    sub.set_time_update(true);
                    sub.set_time_real(true);
                    if let Err(e) = seq.subscribe_port(&sub) {
                        let _ = seq.delete_port(own_port);
                        return Err(e.into());
                    }
                }

                seq.control_queue(queue, EventType::Start, 0, None)?;
                seq.drain_output()?;
                Ok(own_port)
            };
            let own_port = match setup() {
                Ok(port) => port,
                Err(e) => {
                    let _ = seq.free_queue(queue);
                    return Err(e);
                }
            };
            (own_port, queue)
        };

        let wake = match WakePipe::new() {
            Ok(wake) => wake,
            Err(e) => {
                self.release(source, own_port, queue);
                return Err(e);
            }
        };

        let seq_for_thread = Arc::clone(&self.seq);
        let wake_fd = wake.reader();
        let spawned = thread::Builder::new()
            .name("segue-midi-in".into())
            .spawn(move || read_loop(seq_for_thread, wake_fd, stage));
        let thread = match spawned {
            Ok(thread) => thread,
            Err(e) => {
                self.release(source, own_port, queue);
                return Err(Error::Thread(format!("failed to spawn input thread: {e}")));
            }
        };

        debug!(?source, own_port, queue, "input session started");
        self.session = Some(InputSession { thread, wake, own_port, queue, source });
        Ok(())
    }

    /// Tears down the sequencer half of a session.
    fn release(&self, source: Option<Addr>, own_port: i32, queue: i32) {
        let seq = self.seq.lock();
        if let Some(source) = source {
            let dest = Addr { client: self.client_id, port: own_port };
            let _ = seq.unsubscribe_port(source, dest);
        }
        let _ = seq.control_queue(queue, EventType::Stop, 0, None);
        let _ = seq.drain_output();
        let _ = seq.free_queue(queue);
        let _ = seq.delete_port(own_port);
    }

    pub fn close_port(&mut self) {
        let Some(session) = self.session.take() else { return };
        session.wake.signal();
        if session.thread.join().is_err() {
            warn!("input thread panicked during shutdown");
        }
        self.release(session.source, session.own_port, session.queue);
        debug!("input session closed");
    }

    pub fn is_port_open(&self) -> bool {
        self.session.is_some()
    }

    pub fn set_client_name(&mut self, name: &str) -> Result<()> {
        self.seq.lock().set_client_name(&cstr(name)?)?;
        Ok(())
    }

    pub fn set_port_name(&mut self, _name: &str) -> Result<()> {
        if self.session.is_none() {
            return Err(Error::InvalidUse("no open port to rename".into()));
        }
        warn!("sequencer port rename is not supported; keeping the current name");
        Ok(())
    }
}

impl Drop for MidiInputImpl {
    fn drop(&mut self) {
        self.close_port();
    }
}

/// Blocks on the sequencer descriptors plus the wake pipe, draining and
/// delivering events until the pipe is written.
fn read_loop(seq: Arc<Mutex<Seq>>, wake_fd: libc::c_int, mut stage: InputStage) {
    let started = Instant::now();
    let mut coder = match seq::MidiEvent::new(0) {
        Ok(coder) => coder,
        Err(e) => {
            warn!("could not create sequencer event codec: {e}");
            return;
        }
    };
    coder.enable_running_status(false);

    let mut fds = {
        let seq = seq.lock();
        match (&*seq, Some(Direction::Capture)).get() {
            Ok(fds) => fds,
            Err(e) => {
                warn!("could not fetch sequencer poll descriptors: {e}");
                return;
            }
        }
    };
    fds.insert(0, libc::pollfd { fd: wake_fd, events: libc::POLLIN, revents: 0 });

    // (chunk, event time) pairs staged while the handle is locked and fed
    // afterwards, so delivery never runs under the sequencer lock.
    let mut batch: Vec<(Vec<u8>, RealTime)> = Vec::new();

    loop {
        match alsa::poll::poll(&mut fds, -1) {
            Ok(_) => {}
            Err(e) => {
                // EINTR and friends; nothing to deliver yet.
                trace!("sequencer poll interrupted: {e}");
                continue;
            }
        }
        if fds[0].revents & libc::POLLIN != 0 {
            break;
        }

        {
            let seq = seq.lock();
            let mut input = seq.input();
            loop {
                match input.event_input_pending(true) {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!("sequencer event wait failed: {e}");
                        break;
                    }
                }
                let mut ev = match input.event_input() {
                    Ok(ev) => ev,
                    Err(e) => {
                        warn!("sequencer event read failed: {e}");
                        break;
                    }
                };
                let at = ev
                    .get_time()
                    .map(RealTime::from)
                    .unwrap_or_else(|| RealTime::from(started.elapsed()));
                match ev.get_type() {
                    EventType::Sysex => {
                        if let Some(fragment) = ev.get_ext() {
                            batch.push((fragment.to_vec(), at));
                        }
                    }
                    // Connection traffic aimed at our port, not MIDI data.
                    EventType::PortSubscribed | EventType::PortUnsubscribed => {
                        trace!(kind = ?ev.get_type(), "subscription change on input port");
                    }
                    _ => {
                        let mut wire = [0u8; 12];
                        match coder.decode(&mut wire, &mut ev) {
                            Ok(len) if len > 0 => batch.push((wire[..len].to_vec(), at)),
                            Ok(_) => {}
                            Err(_) => {
                                // Non-MIDI event (queue control, client
                                // management); nothing to deliver.
                                trace!(kind = ?ev.get_type(), "skipping non-MIDI event");
                            }
                        }
                    }
                }
            }
        }

        for (chunk, at) in batch.drain(..) {
            stage.feed_chunk(&chunk, at);
        }
    }
}

// ---- output ----

struct OutputSession {
    own_port: i32,
    dest: Option<Addr>,
}

pub(crate) struct MidiOutputImpl {
    seq: Seq,
    client_id: i32,
    coder: seq::MidiEvent,
    scratch: usize,
    // Slices of an unterminated SysEx transfer, collected until the
    // terminator arrives so the encoder sees the message whole.
    pending: Vec<u8>,
    session: Option<OutputSession>,
}

impl MidiOutputImpl {
    pub fn new(client_name: &str) -> Result<Self> {
        // Blocking mode: a full kernel event pool applies backpressure to
        // send() instead of failing it.
        let seq = Seq::open(None, None, false)?;
        seq.set_client_name(&cstr(client_name)?)?;
        let client_id = seq.client_id()?;
        let scratch = 256;
        let coder = seq::MidiEvent::new(scratch as u32)?;
        coder.enable_running_status(false);
        debug!(client_id, client_name, "sequencer output client ready");
        Ok(Self { seq, client_id, coder, scratch, pending: Vec::new(), session: None })
    }

    fn destinations(&self) -> Vec<(Addr, String)> {
        enumerate(&self.seq, PortCap::WRITE | PortCap::SUBS_WRITE, None)
    }

    pub fn port_count(&self) -> usize {
        self.destinations().len()
    }

    pub fn ports(&self) -> Vec<PortInfo> {
        to_port_infos(self.destinations())
    }

    pub fn port_name(&self, index: usize) -> Result<String> {
        let mut listing = self.destinations();
        if index >= listing.len() {
            return Err(Error::InvalidParameter(format!(
                "port index {index} out of range (0..{})",
                listing.len()
            )));
        }
        Ok(listing.swap_remove(index).1)
    }

    pub fn open_port(&mut self, index: usize, port_name: &str) -> Result<()> {
        let listing = self.destinations();
        let Some((dest, _)) = listing.get(index) else {
            return Err(Error::InvalidParameter(format!(
                "port index {index} out of range (0..{})",
                listing.len()
            )));
        };
        let dest = *dest;

        let own_port =
            create_app_port(&self.seq, port_name, PortCap::READ | PortCap::SUBS_READ, None)?;
        let sub = seq::PortSubscribe::empty()?;
        sub.set_sender(Addr { client: self.client_id, port: own_port });
        sub.set_dest(dest);
        if let Err(e) = self.seq.subscribe_port(&sub) {
            let _ = self.seq.delete_port(own_port);
            return Err(e.into());
        }

        debug!(?dest, own_port, "output session connected");
        self.session = Some(OutputSession { own_port, dest: Some(dest) });
        Ok(())
    }

    pub fn open_virtual_port(&mut self, port_name: &str) -> Result<()> {
        let own_port =
            create_app_port(&self.seq, port_name, PortCap::READ | PortCap::SUBS_READ, None)?;
        debug!(own_port, "virtual output port created");
        self.session = Some(OutputSession { own_port, dest: None });
        Ok(())
    }

    pub fn close_port(&mut self) {
        let Some(session) = self.session.take() else { return };
        self.pending.clear();
        if let Some(dest) = session.dest {
            let sender = Addr { client: self.client_id, port: session.own_port };
            let _ = self.seq.unsubscribe_port(sender, dest);
        }
        let _ = self.seq.delete_port(session.own_port);
        debug!("output session closed");
    }

    pub fn is_port_open(&self) -> bool {
        self.session.is_some()
    }

    pub fn send(&mut self, bytes: &[u8]) -> Result<()> {
        let Some(session) = &self.session else {
            return Err(Error::InvalidUse("no open port".into()));
        };

        // Chunked sends slice a SysEx transfer across calls. The sequencer
        // has no packet limit, so slices are collected and encoded whole
        // once the terminator arrives; resizing the encoder buffer resets
        // its state, which a half-encoded transfer would not survive.
        // A continuation slice never starts with a status byte, so a status
        // byte here means the previous transfer was abandoned mid-stream.
        if !self.pending.is_empty() && bytes.first().is_some_and(|b| *b >= 0x80) {
            warn!(
                discarded = self.pending.len(),
                "dropping an unterminated SysEx transfer"
            );
            self.pending.clear();
        }

        let assembled;
        let wire: &[u8] = if !self.pending.is_empty()
            || (bytes.first() == Some(&0xF0) && bytes.last() != Some(&0xF7))
        {
            self.pending.extend_from_slice(bytes);
            if self.pending.last() != Some(&0xF7) {
                trace!(buffered = self.pending.len(), "holding a partial SysEx transfer");
                return Ok(());
            }
            assembled = std::mem::take(&mut self.pending);
            &assembled
        } else {
            bytes
        };

        if wire.len() > self.scratch {
            let grown = u32::try_from(wire.len())
                .map_err(|_| Error::InvalidParameter("message too large".into()))?;
            self.coder.resize_buffer(grown)?;
            self.scratch = wire.len();
        }

        let (consumed, event) = self.coder.encode(wire)?;
        let Some(mut event) = event else {
            // Rejected byte sequence. Not fatal; this send just does nothing.
            warn!(
                consumed,
                len = wire.len(),
                "event encoder rejected the message; nothing sent"
            );
            return Ok(());
        };
        event.set_source(session.own_port);
        event.set_subs();
        event.set_direct();
        self.seq.event_output(&mut event)?;
        self.seq.drain_output()?;
        Ok(())
    }

    pub fn set_client_name(&mut self, name: &str) -> Result<()> {
        self.seq.set_client_name(&cstr(name)?)?;
        Ok(())
    }

    pub fn set_port_name(&mut self, _name: &str) -> Result<()> {
        if self.session.is_none() {
            return Err(Error::InvalidUse("no open port to rename".into()));
        }
        warn!("sequencer port rename is not supported; keeping the current name");
        Ok(())
    }
}

impl Drop for MidiOutputImpl {
    fn drop(&mut self) {
        self.close_port();
    }
}

// ---- observer ----

struct ObserverInner {
    thread: JoinHandle<()>,
    wake: WakePipe,
}

pub(crate) struct MidiObserverImpl {
    inner: Option<ObserverInner>,
}

impl MidiObserverImpl {
    pub fn new(client_name: &str, mut watch: DirectoryWatch) -> Result<Self> {
        let seq = Seq::open(None, None, true)?;
        seq.set_client_name(&cstr(client_name)?)?;
        let client_id = seq.client_id()?;

        let own_port = create_app_port(
            &seq,
            "segue announce sink",
            PortCap::WRITE | PortCap::SUBS_WRITE,
            None,
        )?;
        let sub = seq::PortSubscribe::empty()?;
        sub.set_sender(ANNOUNCE);
        sub.set_dest(Addr { client: client_id, port: own_port });
        if let Err(e) = seq.subscribe_port(&sub) {
            let _ = seq.delete_port(own_port);
            return Err(e.into());
        }

        watch.seed(
            Snapshot::new(to_port_infos(enumerate(
                &seq,
                PortCap::READ | PortCap::SUBS_READ,
                Some(client_id),
            ))),
            Snapshot::new(to_port_infos(enumerate(
                &seq,
                PortCap::WRITE | PortCap::SUBS_WRITE,
                Some(client_id),
            ))),
        );

        let wake = WakePipe::new()?;
        let wake_fd = wake.reader();
        let thread = thread::Builder::new()
            .name("segue-midi-watch".into())
            .spawn(move || announce_loop(seq, client_id, wake_fd, watch))
            .map_err(|e| Error::Thread(format!("failed to spawn observer thread: {e}")))?;

        debug!(client_id, "sequencer observer started");
        Ok(Self { inner: Some(ObserverInner { thread, wake }) })
    }

    pub fn close(&mut self) {
        let Some(inner) = self.inner.take() else { return };
        inner.wake.signal();
        if inner.thread.join().is_err() {
            warn!("observer thread panicked during shutdown");
        }
        debug!("sequencer observer closed");
    }
}

impl Drop for MidiObserverImpl {
    fn drop(&mut self) {
        self.close();
    }
}

/// Waits for announce traffic and rescans the directory after each burst.
fn announce_loop(seq: Seq, client_id: i32, wake_fd: libc::c_int, mut watch: DirectoryWatch) {
    let mut fds = match (&seq, Some(Direction::Capture)).get() {
        Ok(fds) => fds,
        Err(e) => {
            warn!("could not fetch sequencer poll descriptors: {e}");
            return;
        }
    };
    fds.insert(0, libc::pollfd { fd: wake_fd, events: libc::POLLIN, revents: 0 });

    loop {
        match alsa::poll::poll(&mut fds, -1) {
            Ok(_) => {}
            Err(e) => {
                trace!("observer poll interrupted: {e}");
                continue;
            }
        }
        if fds[0].revents & libc::POLLIN != 0 {
            break;
        }

        let mut changed = false;
        {
            let mut input = seq.input();
            loop {
                match input.event_input_pending(true) {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!("observer event wait failed: {e}");
                        break;
                    }
                }
                let ev = match input.event_input() {
                    Ok(ev) => ev,
                    Err(e) => {
                        warn!("observer event read failed: {e}");
                        break;
                    }
                };
                changed |= matches!(
                    ev.get_type(),
                    EventType::ClientStart
                        | EventType::ClientExit
                        | EventType::ClientChange
                        | EventType::PortStart
                        | EventType::PortExit
                        | EventType::PortChange
                );
            }
        }

        if changed {
            watch.apply(
                Snapshot::new(to_port_infos(enumerate(
                    &seq,
                    PortCap::READ | PortCap::SUBS_READ,
                    Some(client_id),
                ))),
                Snapshot::new(to_port_infos(enumerate(
                    &seq,
                    PortCap::WRITE | PortCap::SUBS_WRITE,
                    Some(client_id),
                ))),
            );
        }
    }
}

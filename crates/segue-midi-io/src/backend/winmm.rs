//! Windows transport over the multimedia (WinMM) MIDI API.
//!
//! The driver invokes `midi_in_proc` on its own thread with short messages
//! packed into a dword and SysEx delivered through a rotating set of
//! pre-registered buffers, so no reader thread of ours is needed. Device
//! identity is the device index; WinMM exposes no stable ids and no virtual
//! ports, and hot-plug observation falls back to a polling thread.

use crate::engine::InputStage;
use crate::error::{Error, Result};
use crate::observer::DirectoryWatch;
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use segue_midi::message::expected_len;
use segue_midi::{PortInfo, RealTime, Snapshot};
use std::mem::size_of;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};
use windows_sys::Win32::Media::Audio::{
    midiInAddBuffer, midiInClose, midiInGetDevCapsW, midiInGetNumDevs, midiInOpen,
    midiInPrepareHeader, midiInReset, midiInStart, midiInStop, midiInUnprepareHeader, midiOutClose,
    midiOutGetDevCapsW, midiOutGetNumDevs, midiOutLongMsg, midiOutOpen, midiOutPrepareHeader,
    midiOutReset, midiOutShortMsg, midiOutUnprepareHeader, CALLBACK_FUNCTION, CALLBACK_NULL,
    HMIDIIN, HMIDIOUT, MHDR_DONE, MIDIHDR, MIDIINCAPSW, MIDIOUTCAPSW,
};
use windows_sys::Win32::Media::Multimedia::{MM_MIM_DATA, MM_MIM_LONGDATA};

const SYSEX_BUFFER_SIZE: usize = 1024;
const SYSEX_BUFFER_COUNT: usize = 4;

fn check(context: &str, status: u32) -> Result<()> {
    if status == 0 {
        Ok(())
    } else {
        Err(Error::Driver(format!("{context} (MMSYSERR {status})")))
    }
}

fn utf16_name(buf: &[u16]) -> String {
    let len = buf.iter().position(|&c| c == 0).unwrap_or(buf.len());
    String::from_utf16_lossy(&buf[..len])
}

/// Device indices double as addresses; WinMM has nothing more stable to
/// offer, so an unplug below an open index shifts the devices above it.
fn input_ports() -> Vec<PortInfo> {
    let count = unsafe { midiInGetNumDevs() };
    (0..count)
        .map(|index| {
            let mut caps: MIDIINCAPSW = unsafe { std::mem::zeroed() };
            let status = unsafe {
                midiInGetDevCapsW(index as usize, &mut caps, size_of::<MIDIINCAPSW>() as u32)
            };
            let name = if status == 0 {
                utf16_name(&caps.szPname)
            } else {
                format!("input device {index}")
            };
            PortInfo::new(index as u64, name)
        })
        .collect()
}

fn output_ports() -> Vec<PortInfo> {
    let count = unsafe { midiOutGetNumDevs() };
    (0..count)
        .map(|index| {
            let mut caps: MIDIOUTCAPSW = unsafe { std::mem::zeroed() };
            let status = unsafe {
                midiOutGetDevCapsW(index as usize, &mut caps, size_of::<MIDIOUTCAPSW>() as u32)
            };
            let name = if status == 0 {
                utf16_name(&caps.szPname)
            } else {
                format!("output device {index}")
            };
            PortInfo::new(index as u64, name)
        })
        .collect()
}

fn name_at(ports: Vec<PortInfo>, index: usize) -> Result<String> {
    if index >= ports.len() {
        return Err(Error::InvalidParameter(format!(
            "port index {index} out of range (0..{})",
            ports.len()
        )));
    }
    Ok(ports.into_iter().nth(index).map(|p| p.name).unwrap_or_default())
}

// ---- input ----

struct InputContext {
    stage: Mutex<InputStage>,
    closing: AtomicBool,
}

/// Driver callback. `instance` is the leaked `InputContext`, freed by
/// `teardown_input` after `midiInClose` has returned.
unsafe extern "system" fn midi_in_proc(
    handle: HMIDIIN,
    msg: u32,
    instance: usize,
    param1: usize,
    param2: usize,
) {
    let ctx = &*(instance as *const InputContext);
    // param2 is milliseconds since midiInStart for both message kinds.
    let at = RealTime::from_millis(param2 as u64);
    match msg {
        MM_MIM_DATA => {
            let packed = param1 as u32;
            let bytes = [
                (packed & 0xFF) as u8,
                ((packed >> 8) & 0xFF) as u8,
                ((packed >> 16) & 0xFF) as u8,
            ];
            // The dword is always three bytes wide; the status says how
            // many are real.
            let Some(len) = expected_len(bytes[0]) else { return };
            ctx.stage.lock().feed_chunk(&bytes[..len], at);
        }
        MM_MIM_LONGDATA => {
            let hdr = param1 as *mut MIDIHDR;
            let recorded = (*hdr).dwBytesRecorded as usize;
            if recorded > 0 {
                let data = std::slice::from_raw_parts((*hdr).lpData as *const u8, recorded);
                ctx.stage.lock().feed_chunk(data, at);
            }
            // Hand the buffer back to the driver unless the port is being
            // torn down (midiInReset is busy returning them all).
            if !ctx.closing.load(Ordering::Acquire) {
                midiInAddBuffer(handle, hdr, size_of::<MIDIHDR>() as u32);
            }
        }
        _ => {}
    }
}

struct SysexBuffer {
    hdr: Box<MIDIHDR>,
    _data: Box<[u8]>,
}

struct InputSession {
    handle: HMIDIIN,
    ctx: *mut InputContext,
    buffers: Vec<SysexBuffer>,
}

// SAFETY: WinMM device handles are process-global, and the context pointer
// is only dereferenced by the driver callback until midiInClose returns.
unsafe impl Send for InputSession {}

fn teardown_input(handle: HMIDIIN, buffers: &mut Vec<SysexBuffer>, ctx: *mut InputContext) {
    unsafe {
        (*ctx).closing.store(true, Ordering::Release);
        midiInStop(handle);
        midiInReset(handle);
        for buffer in buffers.iter_mut() {
            midiInUnprepareHeader(handle, &mut *buffer.hdr, size_of::<MIDIHDR>() as u32);
        }
        midiInClose(handle);
        drop(Box::from_raw(ctx));
    }
    buffers.clear();
}

pub(crate) struct MidiInputImpl {
    session: Option<InputSession>,
}

impl MidiInputImpl {
    pub fn new(client_name: &str) -> Result<Self> {
        debug!(client_name, "multimedia input client ready");
        Ok(Self { session: None })
    }

    pub fn port_count(&self) -> usize {
        unsafe { midiInGetNumDevs() as usize }
    }

    pub fn ports(&self) -> Vec<PortInfo> {
        input_ports()
    }

    pub fn port_name(&self, index: usize) -> Result<String> {
        name_at(input_ports(), index)
    }

    pub fn open_port(&mut self, index: usize, _port_name: &str, stage: InputStage) -> Result<()> {
        let count = unsafe { midiInGetNumDevs() } as usize;
        if index >= count {
            return Err(Error::InvalidParameter(format!(
                "port index {index} out of range (0..{count})"
            )));
        }

        let ctx = Box::into_raw(Box::new(InputContext {
            stage: Mutex::new(stage),
            closing: AtomicBool::new(false),
        }));
        let mut handle: HMIDIIN = std::ptr::null_mut();
        let status = unsafe {
            midiInOpen(
                &mut handle,
                index as u32,
                midi_in_proc as usize,
                ctx as usize,
                CALLBACK_FUNCTION,
            )
        };
        if status != 0 {
            drop(unsafe { Box::from_raw(ctx) });
            return Err(Error::Driver(format!("midiInOpen failed (MMSYSERR {status})")));
        }

        let mut buffers = Vec::with_capacity(SYSEX_BUFFER_COUNT);
        for _ in 0..SYSEX_BUFFER_COUNT {
            let mut data = vec![0u8; SYSEX_BUFFER_SIZE].into_boxed_slice();
            let mut hdr: Box<MIDIHDR> = Box::new(unsafe { std::mem::zeroed() });
            hdr.lpData = data.as_mut_ptr();
            hdr.dwBufferLength = SYSEX_BUFFER_SIZE as u32;
            let hdr_ptr: *mut MIDIHDR = &mut *hdr;
            let status = unsafe {
                let prepared = midiInPrepareHeader(handle, hdr_ptr, size_of::<MIDIHDR>() as u32);
                if prepared == 0 {
                    midiInAddBuffer(handle, hdr_ptr, size_of::<MIDIHDR>() as u32)
                } else {
                    prepared
                }
            };
            buffers.push(SysexBuffer { hdr, _data: data });
            if status != 0 {
                teardown_input(handle, &mut buffers, ctx);
                return Err(Error::Driver(format!(
                    "could not register SysEx buffer (MMSYSERR {status})"
                )));
            }
        }

        let status = unsafe { midiInStart(handle) };
        if status != 0 {
            teardown_input(handle, &mut buffers, ctx);
            return Err(Error::Driver(format!("midiInStart failed (MMSYSERR {status})")));
        }

        debug!(index, "input session started");
        self.session = Some(InputSession { handle, ctx, buffers });
        Ok(())
    }

    pub fn open_virtual_port(&mut self, _port_name: &str, _stage: InputStage) -> Result<()> {
        Err(Error::InvalidUse("virtual ports are not supported on this platform".into()))
    }

    pub fn close_port(&mut self) {
        let Some(mut session) = self.session.take() else { return };
        teardown_input(session.handle, &mut session.buffers, session.ctx);
        debug!("input session closed");
    }

    pub fn is_port_open(&self) -> bool {
        self.session.is_some()
    }

    pub fn set_client_name(&mut self, _name: &str) -> Result<()> {
        warn!("the multimedia API has no client name; keeping the default");
        Ok(())
    }

    pub fn set_port_name(&mut self, _name: &str) -> Result<()> {
        if self.session.is_none() {
            return Err(Error::InvalidUse("no open port to rename".into()));
        }
        warn!("multimedia device names are fixed by the driver; keeping the current name");
        Ok(())
    }
}

impl Drop for MidiInputImpl {
    fn drop(&mut self) {
        self.close_port();
    }
}

// ---- output ----

struct OutputSession {
    handle: HMIDIOUT,
}

// SAFETY: WinMM device handles are process-global.
unsafe impl Send for OutputSession {}

/// Short messages pack into a dword; everything else (SysEx, and every
/// slice of an in-progress chunked transfer, which never starts with a
/// status byte) takes the buffer path.
fn takes_short_path(in_sysex: bool, bytes: &[u8]) -> bool {
    !in_sysex
        && bytes.len() <= 3
        && bytes.first().is_some_and(|b| *b >= 0x80 && *b != 0xF0)
}

pub(crate) struct MidiOutputImpl {
    session: Option<OutputSession>,
    // True while a chunked SysEx transfer is open: a slice started with
    // 0xF0 and no slice since has ended with the terminator.
    in_sysex: bool,
}

impl MidiOutputImpl {
    pub fn new(client_name: &str) -> Result<Self> {
        debug!(client_name, "multimedia output client ready");
        Ok(Self { session: None, in_sysex: false })
    }

    pub fn port_count(&self) -> usize {
        unsafe { midiOutGetNumDevs() as usize }
    }

    pub fn ports(&self) -> Vec<PortInfo> {
        output_ports()
    }

    pub fn port_name(&self, index: usize) -> Result<String> {
        name_at(output_ports(), index)
    }

    pub fn open_port(&mut self, index: usize, _port_name: &str) -> Result<()> {
        let count = unsafe { midiOutGetNumDevs() } as usize;
        if index >= count {
            return Err(Error::InvalidParameter(format!(
                "port index {index} out of range (0..{count})"
            )));
        }
        let mut handle: HMIDIOUT = std::ptr::null_mut();
        let status = unsafe { midiOutOpen(&mut handle, index as u32, 0, 0, CALLBACK_NULL) };
        check("midiOutOpen failed", status)?;
        debug!(index, "output session started");
        self.session = Some(OutputSession { handle });
        Ok(())
    }

    pub fn open_virtual_port(&mut self, _port_name: &str) -> Result<()> {
        Err(Error::InvalidUse("virtual ports are not supported on this platform".into()))
    }

    pub fn close_port(&mut self) {
        let Some(session) = self.session.take() else { return };
        self.in_sysex = false;
        unsafe {
            midiOutReset(session.handle);
            midiOutClose(session.handle);
        }
        debug!("output session closed");
    }

    pub fn is_port_open(&self) -> bool {
        self.session.is_some()
    }

    pub fn send(&mut self, bytes: &[u8]) -> Result<()> {
        let Some(session) = &self.session else {
            return Err(Error::InvalidUse("no open port".into()));
        };
        // A continuation slice never starts with a status byte, so one here
        // means the previous transfer was abandoned mid-stream.
        if self.in_sysex && bytes.first().is_some_and(|b| *b >= 0x80) {
            warn!("previous SysEx transfer was left unterminated");
            self.in_sysex = false;
        }
        if takes_short_path(self.in_sysex, bytes) {
            let mut packed = 0u32;
            for (i, byte) in bytes.iter().enumerate() {
                packed |= (*byte as u32) << (8 * i);
            }
            return check("midiOutShortMsg failed", unsafe {
                midiOutShortMsg(session.handle, packed)
            });
        }
        // The transfer stays open until a slice ends with the terminator.
        self.in_sysex = bytes.last() != Some(&0xF7)
            && (self.in_sysex || bytes.first() == Some(&0xF0));
        self.send_long(bytes)
    }

    /// SysEx path: the driver owns the buffer from `midiOutLongMsg` until
    /// it raises MHDR_DONE, so the wait loop below must finish before the
    /// allocation may be touched again.
    fn send_long(&self, bytes: &[u8]) -> Result<()> {
        let session = match &self.session {
            Some(session) => session,
            None => return Err(Error::InvalidUse("no open port".into())),
        };
        let mut data = bytes.to_vec().into_boxed_slice();
        let mut hdr: Box<MIDIHDR> = Box::new(unsafe { std::mem::zeroed() });
        hdr.lpData = data.as_mut_ptr();
        hdr.dwBufferLength = bytes.len() as u32;
        hdr.dwBytesRecorded = bytes.len() as u32;
        let hdr_ptr: *mut MIDIHDR = &mut *hdr;

        let status =
            unsafe { midiOutPrepareHeader(session.handle, hdr_ptr, size_of::<MIDIHDR>() as u32) };
        check("midiOutPrepareHeader failed", status)?;

        let status = unsafe { midiOutLongMsg(session.handle, hdr_ptr, size_of::<MIDIHDR>() as u32) };
        if status != 0 {
            unsafe {
                midiOutUnprepareHeader(session.handle, hdr_ptr, size_of::<MIDIHDR>() as u32);
            }
            return Err(Error::Driver(format!("midiOutLongMsg failed (MMSYSERR {status})")));
        }

        let mut waited = 0u32;
        while unsafe { std::ptr::read_volatile(&hdr.dwFlags) } & MHDR_DONE == 0 {
            if waited >= 10_000 {
                // The driver still owns the buffer; leak it rather than
                // free memory it may yet write to.
                std::mem::forget(hdr);
                std::mem::forget(data);
                return Err(Error::Driver("device did not release the SysEx buffer".into()));
            }
            thread::sleep(Duration::from_millis(1));
            waited += 1;
        }

        let status =
            unsafe { midiOutUnprepareHeader(session.handle, hdr_ptr, size_of::<MIDIHDR>() as u32) };
        check("midiOutUnprepareHeader failed", status)
    }

    pub fn set_client_name(&mut self, _name: &str) -> Result<()> {
        warn!("the multimedia API has no client name; keeping the default");
        Ok(())
    }

    pub fn set_port_name(&mut self, _name: &str) -> Result<()> {
        if self.session.is_none() {
            return Err(Error::InvalidUse("no open port to rename".into()));
        }
        warn!("multimedia device names are fixed by the driver; keeping the current name");
        Ok(())
    }
}

impl Drop for MidiOutputImpl {
    fn drop(&mut self) {
        self.close_port();
    }
}

// ---- observer ----

pub(crate) struct MidiObserverImpl {
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl MidiObserverImpl {
    pub fn new(client_name: &str, mut watch: DirectoryWatch) -> Result<Self> {
        watch.seed(Snapshot::new(input_ports()), Snapshot::new(output_ports()));

        let (stop, stop_rx) = bounded::<()>(1);
        let interval = watch.poll_interval();
        let thread = thread::Builder::new()
            .name("segue-midi-watch".into())
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        watch.apply(Snapshot::new(input_ports()), Snapshot::new(output_ports()));
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })
            .map_err(|e| Error::Thread(format!("failed to spawn observer thread: {e}")))?;

        debug!(client_name, interval_ms = interval.as_millis() as u64, "polling observer started");
        Ok(Self { stop: Some(stop), thread: Some(thread) })
    }

    pub fn close(&mut self) {
        let Some(stop) = self.stop.take() else { return };
        let _ = stop.send(());
        drop(stop);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("observer thread panicked during shutdown");
            }
        }
        debug!("polling observer closed");
    }
}

impl Drop for MidiObserverImpl {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_messages_pack_into_a_dword() {
        assert!(takes_short_path(false, &[0x90, 60, 100]));
        assert!(takes_short_path(false, &[0xC5, 7]));
        assert!(takes_short_path(false, &[0xF8]));
    }

    #[test]
    fn sysex_always_takes_the_buffer_path() {
        assert!(!takes_short_path(false, &[0xF0, 0x7D, 0xF7]));
        assert!(!takes_short_path(false, &[0xF0]));
    }

    #[test]
    fn transfer_slices_take_the_buffer_path_whatever_their_length() {
        // A 260-byte SysEx sent with a 129-byte chunk policy ends in a
        // two-byte tail; neither it nor any other continuation slice may
        // reach midiOutShortMsg.
        assert!(!takes_short_path(true, &[0x12, 0xF7]));
        assert!(!takes_short_path(true, &[0x12, 0x34, 0x56]));
        assert!(!takes_short_path(true, &[0xF7]));
        // Even with no transfer open, a leading data byte is never a
        // packable status.
        assert!(!takes_short_path(false, &[0x12, 0xF7]));
    }
}

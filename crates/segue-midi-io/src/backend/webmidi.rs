//! Browser transport over the Web MIDI API.
//!
//! Web MIDI gates everything behind an async permission prompt, so this
//! backend splits setup in two: [`request_access`] awaits
//! `navigator.requestMIDIAccess()` once and parks the granted handle in
//! thread-local storage, then session constructors attach synchronously to
//! it. Message and state-change callbacks arrive on the one JS thread.
//! Ports are addressed by a hash of the browser's port id string.

use crate::engine::InputStage;
use crate::error::{Error, Result};
use crate::observer::DirectoryWatch;
use segue_midi::{PortInfo, RealTime, Snapshot};
use std::cell::RefCell;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::rc::Rc;
use tracing::{debug, warn};
use wasm_bindgen::closure::Closure;
use wasm_bindgen::{JsCast, JsValue};
use wasm_bindgen_futures::JsFuture;
use web_sys::{
    MidiAccess, MidiConnectionEvent, MidiInput as WebInput, MidiMessageEvent,
    MidiOptions, MidiOutput as WebOutput, MidiPortDeviceState,
};

/// Observers registered for state-change fan-out. Slots keep their index
/// for unregistering, so removal leaves a hole instead of shifting.
type WatchRegistry = Rc<RefCell<Vec<Option<DirectoryWatch>>>>;

struct AccessState {
    access: MidiAccess,
    watchers: WatchRegistry,
    _onstatechange: Closure<dyn FnMut(MidiConnectionEvent)>,
}

thread_local! {
    static ACCESS: RefCell<Option<AccessState>> = const { RefCell::new(None) };
}

fn js_err(context: &str, value: JsValue) -> Error {
    Error::Driver(format!("{context}: {value:?}"))
}

/// Awaits the browser permission prompt and stores the granted access
/// handle for the rest of the session. Must resolve before any input,
/// output, or observer is constructed. `sysex` asks for exclusive-message
/// permission as well.
pub async fn request_access(sysex: bool) -> Result<()> {
    let granted = ACCESS.with(|cell| cell.borrow().is_some());
    if granted {
        return Ok(());
    }

    let window =
        web_sys::window().ok_or_else(|| Error::Driver("no window object".into()))?;
    let options = MidiOptions::new();
    options.set_sysex(sysex);
    let promise = window
        .navigator()
        .request_midi_access_with_options(&options)
        .map_err(|e| js_err("requestMIDIAccess rejected", e))?;
    let resolved = JsFuture::from(promise)
        .await
        .map_err(|e| js_err("MIDI access denied", e))?;
    let access: MidiAccess = resolved
        .dyn_into()
        .map_err(|e| js_err("unexpected requestMIDIAccess result", e))?;

    let watchers: WatchRegistry = Rc::new(RefCell::new(Vec::new()));
    let fanout = Rc::clone(&watchers);
    let access_for_events = access.clone();
    let onstatechange = Closure::wrap(Box::new(move |_event: MidiConnectionEvent| {
        let inputs = input_snapshot(&access_for_events);
        let outputs = output_snapshot(&access_for_events);
        for slot in fanout.borrow_mut().iter_mut().flatten() {
            slot.apply(inputs.clone(), outputs.clone());
        }
    }) as Box<dyn FnMut(MidiConnectionEvent)>);
    access.set_onstatechange(Some(onstatechange.as_ref().unchecked_ref()));

    debug!(sysex, "MIDI access granted");
    ACCESS.with(|cell| {
        *cell.borrow_mut() = Some(AccessState {
            access,
            watchers,
            _onstatechange: onstatechange,
        });
    });
    Ok(())
}

fn with_access<T>(f: impl FnOnce(&AccessState) -> T) -> Result<T> {
    ACCESS.with(|cell| cell.borrow().as_ref().map(f)).ok_or_else(|| {
        Error::InvalidUse("MIDI access has not been granted; await request_access first".into())
    })
}

fn address_of(id: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    id.hash(&mut hasher);
    hasher.finish()
}

/// Iterates a maplike's `[id, port]` entries in insertion order.
fn map_entries(map: &JsValue) -> Vec<(String, JsValue)> {
    let mut out = Vec::new();
    let Ok(Some(iter)) = js_sys::try_iter(map) else { return out };
    for entry in iter.flatten() {
        let pair = js_sys::Array::from(&entry);
        let Some(id) = pair.get(0).as_string() else { continue };
        out.push((id, pair.get(1)));
    }
    out
}

/// Connected input ports in map order. Disconnected ports linger in the
/// map with a changed state, so they are filtered here.
fn list_inputs(access: &MidiAccess) -> Vec<(WebInput, PortInfo)> {
    map_entries(access.inputs().as_ref())
        .into_iter()
        .filter_map(|(id, value)| {
            let port: WebInput = value.dyn_into().ok()?;
            if port.state() != MidiPortDeviceState::Connected {
                return None;
            }
            let name = port.name().unwrap_or_else(|| id.clone());
            Some((port, PortInfo::new(address_of(&id), name)))
        })
        .collect()
}

fn list_outputs(access: &MidiAccess) -> Vec<(WebOutput, PortInfo)> {
    map_entries(access.outputs().as_ref())
        .into_iter()
        .filter_map(|(id, value)| {
            let port: WebOutput = value.dyn_into().ok()?;
            if port.state() != MidiPortDeviceState::Connected {
                return None;
            }
            let name = port.name().unwrap_or_else(|| id.clone());
            Some((port, PortInfo::new(address_of(&id), name)))
        })
        .collect()
}

fn input_snapshot(access: &MidiAccess) -> Snapshot {
    Snapshot::new(list_inputs(access).into_iter().map(|(_, info)| info).collect())
}

fn output_snapshot(access: &MidiAccess) -> Snapshot {
    Snapshot::new(list_outputs(access).into_iter().map(|(_, info)| info).collect())
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

struct InputSession {
    port: WebInput,
    _onmessage: Closure<dyn FnMut(MidiMessageEvent)>,
}

pub(crate) struct MidiInputImpl {
    session: Option<InputSession>,
}

impl MidiInputImpl {
    pub fn new(client_name: &str) -> Result<Self> {
        with_access(|_| ())?;
        debug!(client_name, "Web MIDI input ready");
        Ok(Self { session: None })
    }

    pub fn port_count(&self) -> usize {
        with_access(|state| list_inputs(&state.access).len()).unwrap_or(0)
    }

    pub fn ports(&self) -> Vec<PortInfo> {
        with_access(|state| {
            list_inputs(&state.access).into_iter().map(|(_, info)| info).collect()
        })
        .unwrap_or_default()
    }

    pub fn port_name(&self, index: usize) -> Result<String> {
        let ports = with_access(|state| {
            list_inputs(&state.access)
                .into_iter()
                .map(|(_, info)| info)
                .collect::<Vec<_>>()
        })?;
        name_at(ports, index)
    }

    pub fn open_port(&mut self, index: usize, _port_name: &str, mut stage: InputStage) -> Result<()> {
        let listing = with_access(|state| list_inputs(&state.access))?;
        let count = listing.len();
        let Some((port, _)) = listing.into_iter().nth(index) else {
            return Err(Error::InvalidParameter(format!(
                "port index {index} out of range (0..{count})"
            )));
        };

        let onmessage = Closure::wrap(Box::new(move |event: MidiMessageEvent| {
            if let Ok(data) = event.data() {
                // time_stamp is milliseconds since page load.
                let at = RealTime::from_secs_f64(event.time_stamp() / 1000.0);
                stage.feed_chunk(&data, at);
            }
        }) as Box<dyn FnMut(MidiMessageEvent)>);
        port.set_onmidimessage(Some(onmessage.as_ref().unchecked_ref()));

        debug!(index, "input session attached");
        self.session = Some(InputSession { port, _onmessage: onmessage });
        Ok(())
    }

    pub fn open_virtual_port(&mut self, _port_name: &str, _stage: InputStage) -> Result<()> {
        Err(Error::InvalidUse("virtual ports are not supported on this platform".into()))
    }

    pub fn close_port(&mut self) {
        let Some(session) = self.session.take() else { return };
        session.port.set_onmidimessage(None);
        let _ = session.port.close();
        debug!("input session closed");
    }

    pub fn is_port_open(&self) -> bool {
        self.session.is_some()
    }

    pub fn set_client_name(&mut self, _name: &str) -> Result<()> {
        warn!("Web MIDI has no client name; keeping the default");
        Ok(())
    }

    pub fn set_port_name(&mut self, _name: &str) -> Result<()> {
        if self.session.is_none() {
            return Err(Error::InvalidUse("no open port to rename".into()));
        }
        warn!("Web MIDI port names are fixed by the browser; keeping the current name");
        Ok(())
    }
}

impl Drop for MidiInputImpl {
    fn drop(&mut self) {
        self.close_port();
    }
}

// ---- output ----

pub(crate) struct MidiOutputImpl {
    session: Option<WebOutput>,
}

impl MidiOutputImpl {
    pub fn new(client_name: &str) -> Result<Self> {
        with_access(|_| ())?;
        debug!(client_name, "Web MIDI output ready");
        Ok(Self { session: None })
    }

    pub fn port_count(&self) -> usize {
        with_access(|state| list_outputs(&state.access).len()).unwrap_or(0)
    }

    pub fn ports(&self) -> Vec<PortInfo> {
        with_access(|state| {
            list_outputs(&state.access).into_iter().map(|(_, info)| info).collect()
        })
        .unwrap_or_default()
    }

    pub fn port_name(&self, index: usize) -> Result<String> {
        let ports = with_access(|state| {
            list_outputs(&state.access)
                .into_iter()
                .map(|(_, info)| info)
                .collect::<Vec<_>>()
        })?;
        name_at(ports, index)
    }

    pub fn open_port(&mut self, index: usize, _port_name: &str) -> Result<()> {
        let listing = with_access(|state| list_outputs(&state.access))?;
        let count = listing.len();
        let Some((port, _)) = listing.into_iter().nth(index) else {
            return Err(Error::InvalidParameter(format!(
                "port index {index} out of range (0..{count})"
            )));
        };
        debug!(index, "output session attached");
        self.session = Some(port);
        Ok(())
    }

    pub fn open_virtual_port(&mut self, _port_name: &str) -> Result<()> {
        Err(Error::InvalidUse("virtual ports are not supported on this platform".into()))
    }

    pub fn close_port(&mut self) {
        let Some(port) = self.session.take() else { return };
        let _ = port.close();
        debug!("output session closed");
    }

    pub fn is_port_open(&self) -> bool {
        self.session.is_some()
    }

    pub fn send(&mut self, bytes: &[u8]) -> Result<()> {
        let Some(port) = &self.session else {
            return Err(Error::InvalidUse("no open port".into()));
        };
        let data = js_sys::Array::new();
        for byte in bytes {
            data.push(&JsValue::from(*byte));
        }
        port.send(&data).map_err(|e| js_err("send failed", e))
    }

    pub fn set_client_name(&mut self, _name: &str) -> Result<()> {
        warn!("Web MIDI has no client name; keeping the default");
        Ok(())
    }

    pub fn set_port_name(&mut self, _name: &str) -> Result<()> {
        if self.session.is_none() {
            return Err(Error::InvalidUse("no open port to rename".into()));
        }
        warn!("Web MIDI port names are fixed by the browser; keeping the current name");
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
    slot: Option<usize>,
}

impl MidiObserverImpl {
    pub fn new(client_name: &str, mut watch: DirectoryWatch) -> Result<Self> {
        let slot = with_access(|state| {
            watch.seed(input_snapshot(&state.access), output_snapshot(&state.access));
            let mut watchers = state.watchers.borrow_mut();
            watchers.push(Some(watch));
            watchers.len() - 1
        })?;
        debug!(client_name, slot, "state-change observer registered");
        Ok(Self { slot: Some(slot) })
    }

    pub fn close(&mut self) {
        let Some(slot) = self.slot.take() else { return };
        let _ = with_access(|state| {
            if let Some(entry) = state.watchers.borrow_mut().get_mut(slot) {
                *entry = None;
            }
        });
        debug!(slot, "state-change observer removed");
    }
}

impl Drop for MidiObserverImpl {
    fn drop(&mut self) {
        self.close();
    }
}

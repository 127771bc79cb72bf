//! macOS transport over CoreMIDI.
//!
//! Input ports hand received packet lists to a callback on a CoreMIDI
//! thread, so the decode stage moves into that closure and message delivery
//! happens without any thread of our own. Messages are stamped on arrival.
//! Hot-plug observation uses client notifications, which CoreMIDI delivers
//! on the run loop of the thread that created the observer.

use crate::engine::InputStage;
use crate::error::{Error, Result};
use crate::observer::DirectoryWatch;
use coremidi::{
    Client, Destination, Destinations, InputPort, Notification, OutputPort, PacketBuffer, Source,
    Sources, VirtualDestination, VirtualSource,
};
use segue_midi::{PortInfo, RealTime, Snapshot};
use std::time::Instant;
use tracing::{debug, warn};

/// A MIDIPacket carries at most a u16 worth of data, so larger SysEx
/// transfers leave as a packet series.
const MAX_PACKET_DATA: usize = 65_535;

fn os_err(context: &str, status: i32) -> Error {
    Error::Driver(format!("{context} (OSStatus {status})"))
}

fn endpoint_label(display_name: Option<String>, index: usize) -> String {
    display_name.unwrap_or_else(|| format!("endpoint {index}"))
}

fn source_ports() -> Vec<PortInfo> {
    Sources
        .into_iter()
        .enumerate()
        .map(|(index, source)| {
            let address = source.unique_id().map(|id| id as u32 as u64).unwrap_or(0);
            PortInfo::new(address, endpoint_label(source.display_name(), index))
        })
        .collect()
}

fn destination_ports() -> Vec<PortInfo> {
    Destinations
        .into_iter()
        .enumerate()
        .map(|(index, destination)| {
            let address = destination.unique_id().map(|id| id as u32 as u64).unwrap_or(0);
            PortInfo::new(address, endpoint_label(destination.display_name(), index))
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

enum InputSession {
    Connected { port: InputPort, source: Source },
    Virtual { _endpoint: VirtualDestination },
}

pub(crate) struct MidiInputImpl {
    client: Client,
    session: Option<InputSession>,
}

impl MidiInputImpl {
    pub fn new(client_name: &str) -> Result<Self> {
        let client = Client::new(client_name)
            .map_err(|status| os_err("could not create MIDI client", status))?;
        debug!(client_name, "CoreMIDI input client ready");
        Ok(Self { client, session: None })
    }

    pub fn port_count(&self) -> usize {
        Sources::count()
    }

    pub fn ports(&self) -> Vec<PortInfo> {
        source_ports()
    }

    pub fn port_name(&self, index: usize) -> Result<String> {
        name_at(source_ports(), index)
    }

    pub fn open_port(&mut self, index: usize, port_name: &str, mut stage: InputStage) -> Result<()> {
        let Some(source) = Source::from_index(index) else {
            return Err(Error::InvalidParameter(format!(
                "port index {index} out of range (0..{})",
                Sources::count()
            )));
        };
        let started = Instant::now();
        let port = self
            .client
            .input_port(port_name, move |packets| {
                let at = RealTime::from(started.elapsed());
                for packet in packets.iter() {
                    stage.feed_chunk(packet.data(), at);
                }
            })
            .map_err(|status| os_err("could not create input port", status))?;
        port.connect_source(&source)
            .map_err(|status| os_err("could not connect source", status))?;
        debug!(index, "input session connected");
        self.session = Some(InputSession::Connected { port, source });
        Ok(())
    }

    pub fn open_virtual_port(&mut self, port_name: &str, mut stage: InputStage) -> Result<()> {
        let started = Instant::now();
        let endpoint = self
            .client
            .virtual_destination(port_name, move |packets| {
                let at = RealTime::from(started.elapsed());
                for packet in packets.iter() {
                    stage.feed_chunk(packet.data(), at);
                }
            })
            .map_err(|status| os_err("could not create virtual destination", status))?;
        debug!(port_name, "virtual input port created");
        self.session = Some(InputSession::Virtual { _endpoint: endpoint });
        Ok(())
    }

    pub fn close_port(&mut self) {
        match self.session.take() {
            Some(InputSession::Connected { port, source }) => {
                if let Err(status) = port.disconnect_source(&source) {
                    warn!("could not disconnect source (OSStatus {status})");
                }
            }
            Some(InputSession::Virtual { .. }) | None => {}
        }
    }

    pub fn is_port_open(&self) -> bool {
        self.session.is_some()
    }

    pub fn set_client_name(&mut self, _name: &str) -> Result<()> {
        warn!("CoreMIDI clients cannot be renamed; keeping the current name");
        Ok(())
    }

    pub fn set_port_name(&mut self, _name: &str) -> Result<()> {
        if self.session.is_none() {
            return Err(Error::InvalidUse("no open port to rename".into()));
        }
        warn!("CoreMIDI ports cannot be renamed; keeping the current name");
        Ok(())
    }
}

impl Drop for MidiInputImpl {
    fn drop(&mut self) {
        self.close_port();
    }
}

// ---- output ----

enum OutputSession {
    Connected { port: OutputPort, destination: Destination },
    Virtual { endpoint: VirtualSource },
}

pub(crate) struct MidiOutputImpl {
    client: Client,
    session: Option<OutputSession>,
}

impl MidiOutputImpl {
    pub fn new(client_name: &str) -> Result<Self> {
        let client = Client::new(client_name)
            .map_err(|status| os_err("could not create MIDI client", status))?;
        debug!(client_name, "CoreMIDI output client ready");
        Ok(Self { client, session: None })
    }

    pub fn port_count(&self) -> usize {
        Destinations::count()
    }

    pub fn ports(&self) -> Vec<PortInfo> {
        destination_ports()
    }

    pub fn port_name(&self, index: usize) -> Result<String> {
        name_at(destination_ports(), index)
    }

    pub fn open_port(&mut self, index: usize, port_name: &str) -> Result<()> {
        let Some(destination) = Destination::from_index(index) else {
            return Err(Error::InvalidParameter(format!(
                "port index {index} out of range (0..{})",
                Destinations::count()
            )));
        };
        let port = self
            .client
            .output_port(port_name)
            .map_err(|status| os_err("could not create output port", status))?;
        debug!(index, "output session connected");
        self.session = Some(OutputSession::Connected { port, destination });
        Ok(())
    }

    pub fn open_virtual_port(&mut self, port_name: &str) -> Result<()> {
        let endpoint = self
            .client
            .virtual_source(port_name)
            .map_err(|status| os_err("could not create virtual source", status))?;
        debug!(port_name, "virtual output port created");
        self.session = Some(OutputSession::Virtual { endpoint });
        Ok(())
    }

    pub fn close_port(&mut self) {
        self.session = None;
    }

    pub fn is_port_open(&self) -> bool {
        self.session.is_some()
    }

    pub fn send(&mut self, bytes: &[u8]) -> Result<()> {
        let Some(session) = &mut self.session else {
            return Err(Error::InvalidUse("no open port".into()));
        };
        for chunk in bytes.chunks(MAX_PACKET_DATA) {
            let buffer = PacketBuffer::new(0, chunk);
            match session {
                OutputSession::Connected { port, destination } => port
                    .send(destination, &buffer)
                    .map_err(|status| os_err("send failed", status))?,
                OutputSession::Virtual { endpoint } => endpoint
                    .received(&buffer)
                    .map_err(|status| os_err("send failed", status))?,
            }
        }
        Ok(())
    }

    pub fn set_client_name(&mut self, _name: &str) -> Result<()> {
        warn!("CoreMIDI clients cannot be renamed; keeping the current name");
        Ok(())
    }

    pub fn set_port_name(&mut self, _name: &str) -> Result<()> {
        if self.session.is_none() {
            return Err(Error::InvalidUse("no open port to rename".into()));
        }
        warn!("CoreMIDI ports cannot be renamed; keeping the current name");
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
    client: Option<Client>,
}

impl MidiObserverImpl {
    pub fn new(client_name: &str, mut watch: DirectoryWatch) -> Result<Self> {
        watch.seed(Snapshot::new(source_ports()), Snapshot::new(destination_ports()));
        let client = Client::new_with_notifications(client_name, move |notification| {
            let changed = matches!(
                notification,
                Notification::ObjectAdded(_)
                    | Notification::ObjectRemoved(_)
                    | Notification::SetupChanged
            );
            if changed {
                watch.apply(Snapshot::new(source_ports()), Snapshot::new(destination_ports()));
            }
        })
        .map_err(|status| os_err("could not create MIDI client", status))?;
        debug!(client_name, "CoreMIDI observer started");
        Ok(Self { client: Some(client) })
    }

    pub fn close(&mut self) {
        if self.client.take().is_some() {
            debug!("CoreMIDI observer closed");
        }
    }
}

impl Drop for MidiObserverImpl {
    fn drop(&mut self) {
        self.close();
    }
}

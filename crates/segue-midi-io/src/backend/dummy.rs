//! Inert fallback transport.
//!
//! Compiled when no native backend matches the target (or `native` is
//! disabled). Enumerates an empty directory, opens nothing, and keeps the
//! whole public surface linkable so downstream code can build and run its
//! hardware-free paths anywhere.

use crate::engine::InputStage;
use crate::error::{Error, Result};
use crate::observer::DirectoryWatch;
use segue_midi::{PortInfo, Snapshot};
use tracing::{debug, warn};

pub(crate) struct MidiInputImpl;

impl MidiInputImpl {
    pub fn new(_client_name: &str) -> Result<Self> {
        warn!("no native MIDI transport in this build; ports will not be available");
        Ok(Self)
    }

    pub fn port_count(&self) -> usize {
        0
    }

    pub fn ports(&self) -> Vec<PortInfo> {
        Vec::new()
    }

    pub fn port_name(&self, index: usize) -> Result<String> {
        Err(Error::InvalidParameter(format!(
            "port index {index} out of range (no ports)"
        )))
    }

    pub fn open_port(&mut self, _index: usize, _port_name: &str, _stage: InputStage) -> Result<()> {
        Err(Error::NoDevicesFound)
    }

    pub fn open_virtual_port(&mut self, _port_name: &str, _stage: InputStage) -> Result<()> {
        Err(Error::InvalidUse(
            "virtual ports are not supported by this build".into(),
        ))
    }

    pub fn close_port(&mut self) {}

    pub fn is_port_open(&self) -> bool {
        false
    }

    pub fn set_client_name(&mut self, _name: &str) -> Result<()> {
        Ok(())
    }

    pub fn set_port_name(&mut self, _name: &str) -> Result<()> {
        Err(Error::InvalidUse("no open port to rename".into()))
    }
}

pub(crate) struct MidiOutputImpl;

impl MidiOutputImpl {
    pub fn new(_client_name: &str) -> Result<Self> {
        warn!("no native MIDI transport in this build; ports will not be available");
        Ok(Self)
    }

    pub fn port_count(&self) -> usize {
        0
    }

    pub fn ports(&self) -> Vec<PortInfo> {
        Vec::new()
    }

    pub fn port_name(&self, index: usize) -> Result<String> {
        Err(Error::InvalidParameter(format!(
            "port index {index} out of range (no ports)"
        )))
    }

    pub fn open_port(&mut self, _index: usize, _port_name: &str) -> Result<()> {
        Err(Error::NoDevicesFound)
    }

    pub fn open_virtual_port(&mut self, _port_name: &str) -> Result<()> {
        Err(Error::InvalidUse(
            "virtual ports are not supported by this build".into(),
        ))
    }

    pub fn close_port(&mut self) {}

    pub fn is_port_open(&self) -> bool {
        false
    }

    pub fn send(&mut self, _bytes: &[u8]) -> Result<()> {
        Err(Error::InvalidUse("no open port".into()))
    }

    pub fn set_client_name(&mut self, _name: &str) -> Result<()> {
        Ok(())
    }

    pub fn set_port_name(&mut self, _name: &str) -> Result<()> {
        Err(Error::InvalidUse("no open port to rename".into()))
    }
}

pub(crate) struct MidiObserverImpl {
    watch: Option<DirectoryWatch>,
}

impl MidiObserverImpl {
    pub fn new(_client_name: &str, mut watch: DirectoryWatch) -> Result<Self> {
        warn!("no native MIDI transport in this build; hot-plug events will not fire");
        watch.seed(Snapshot::default(), Snapshot::default());
        Ok(Self { watch: Some(watch) })
    }

    pub fn close(&mut self) {
        if self.watch.take().is_some() {
            debug!("inert observer closed");
        }
    }
}

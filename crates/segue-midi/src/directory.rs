//! Port enumeration snapshots and hot-plug diffing.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// One enumerable port at a moment in time.
///
/// `address` is the transport's stable identity for the port (sequencer
/// client/port pair, endpoint unique ID, driver device index) and is the key
/// hot-plug diffing works on. `name` is the human-readable display string
/// and may be rebuilt differently across enumerations without affecting
/// identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortInfo {
    pub address: u64,
    pub name: String,
}

impl PortInfo {
    pub fn new(address: u64, name: impl Into<String>) -> Self {
        Self { address, name: name.into() }
    }
}

impl fmt::Display for PortInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// An ordered enumeration of one direction's ports.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    ports: Vec<PortInfo>,
}

impl Snapshot {
    pub fn new(ports: Vec<PortInfo>) -> Self {
        Self { ports }
    }

    pub fn ports(&self) -> &[PortInfo] {
        &self.ports
    }

    pub fn len(&self) -> usize {
        self.ports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }

    /// Ports present in `next` but not here (paired with their index in
    /// `next`) and ports present here but gone from `next` (paired with
    /// their index here). Identity is the address; ports whose address
    /// appears on both sides produce nothing, whatever their name or
    /// position did.
    pub fn diff(&self, next: &Snapshot) -> DirectoryDiff {
        let prev_addrs: HashSet<u64> = self.ports.iter().map(|p| p.address).collect();
        let next_addrs: HashSet<u64> = next.ports.iter().map(|p| p.address).collect();

        DirectoryDiff {
            added: next
                .ports
                .iter()
                .enumerate()
                .filter(|(_, p)| !prev_addrs.contains(&p.address))
                .map(|(i, p)| (i, p.clone()))
                .collect(),
            removed: self
                .ports
                .iter()
                .enumerate()
                .filter(|(_, p)| !next_addrs.contains(&p.address))
                .map(|(i, p)| (i, p.clone()))
                .collect(),
        }
    }
}

/// Result of comparing two snapshots of the same direction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DirectoryDiff {
    pub added: Vec<(usize, PortInfo)>,
    pub removed: Vec<(usize, PortInfo)>,
}

impl DirectoryDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(ports: &[(u64, &str)]) -> Snapshot {
        Snapshot::new(ports.iter().map(|(a, n)| PortInfo::new(*a, *n)).collect())
    }

    #[test]
    fn identical_snapshots_produce_nothing() {
        let a = snap(&[(1, "Synth"), (2, "Keys")]);
        assert!(a.diff(&a.clone()).is_empty());
    }

    #[test]
    fn detects_an_added_port() {
        let before = snap(&[(1, "Synth")]);
        let after = snap(&[(1, "Synth"), (7, "Pads")]);
        let diff = before.diff(&after);
        assert_eq!(diff.added, vec![(1, PortInfo::new(7, "Pads"))]);
        assert!(diff.removed.is_empty());
    }

    #[test]
    fn detects_a_removed_port_with_its_old_index() {
        let before = snap(&[(1, "Synth"), (2, "Keys"), (3, "Drums")]);
        let after = snap(&[(1, "Synth"), (3, "Drums")]);
        let diff = before.diff(&after);
        assert!(diff.added.is_empty());
        assert_eq!(diff.removed, vec![(1, PortInfo::new(2, "Keys"))]);
    }

    #[test]
    fn add_and_remove_in_one_step() {
        let before = snap(&[(1, "Synth"), (2, "Keys")]);
        let after = snap(&[(2, "Keys"), (9, "Sampler")]);
        let diff = before.diff(&after);
        assert_eq!(diff.added, vec![(1, PortInfo::new(9, "Sampler"))]);
        assert_eq!(diff.removed, vec![(0, PortInfo::new(1, "Synth"))]);
    }

    #[test]
    fn reorder_without_membership_change_is_silent() {
        let before = snap(&[(1, "Synth"), (2, "Keys")]);
        let after = snap(&[(2, "Keys"), (1, "Synth")]);
        assert!(before.diff(&after).is_empty());
    }

    #[test]
    fn rename_with_stable_address_is_silent() {
        let before = snap(&[(1, "Synth")]);
        let after = snap(&[(1, "Synth Mk II")]);
        assert!(before.diff(&after).is_empty());
    }

    #[test]
    fn everything_unplugged() {
        let before = snap(&[(1, "Synth"), (2, "Keys")]);
        let diff = before.diff(&Snapshot::default());
        assert_eq!(diff.removed.len(), 2);
        assert!(diff.added.is_empty());
    }
}

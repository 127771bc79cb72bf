//! Hot-plug observation of the port directory.
//!
//! An observer session takes a baseline enumeration at construction and
//! then reports directory changes through per-direction callbacks. On
//! transports with native change signaling the watcher is event-driven; on
//! enumeration-only transports it polls. Either way, change detection is
//! the same address-keyed snapshot diff, so a rescan triggered by either
//! mechanism produces identical callback sequences.

use crate::backend;
use crate::error::Result;
use arc_swap::ArcSwap;
use segue_midi::{PortInfo, Snapshot};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Poll period used by transports without native hot-plug signaling.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub type PortCallback = Box<dyn FnMut(usize, &PortInfo) + Send>;

/// Callback set for an observer session. All slots are optional; directions
/// without a callback are still tracked (the published directory stays
/// current) but report nothing.
pub struct ObserverConfig {
    pub(crate) input_added: Option<PortCallback>,
    pub(crate) input_removed: Option<PortCallback>,
    pub(crate) output_added: Option<PortCallback>,
    pub(crate) output_removed: Option<PortCallback>,
    pub(crate) poll_interval: Duration,
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            input_added: None,
            input_removed: None,
            output_added: None,
            output_removed: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl ObserverConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_input_added<F>(mut self, callback: F) -> Self
    where
        F: FnMut(usize, &PortInfo) + Send + 'static,
    {
        self.input_added = Some(Box::new(callback));
        self
    }

    pub fn on_input_removed<F>(mut self, callback: F) -> Self
    where
        F: FnMut(usize, &PortInfo) + Send + 'static,
    {
        self.input_removed = Some(Box::new(callback));
        self
    }

    pub fn on_output_added<F>(mut self, callback: F) -> Self
    where
        F: FnMut(usize, &PortInfo) + Send + 'static,
    {
        self.output_added = Some(Box::new(callback));
        self
    }

    pub fn on_output_removed<F>(mut self, callback: F) -> Self
    where
        F: FnMut(usize, &PortInfo) + Send + 'static,
    {
        self.output_removed = Some(Box::new(callback));
        self
    }

    /// Rescan period on transports that have to poll. Ignored elsewhere.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

impl fmt::Debug for ObserverConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObserverConfig")
            .field("input_added", &self.input_added.is_some())
            .field("input_removed", &self.input_removed.is_some())
            .field("output_added", &self.output_added.is_some())
            .field("output_removed", &self.output_removed.is_some())
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}

/// Both directions of the port directory at one instant.
#[derive(Debug, Clone, Default)]
pub struct Directory {
    pub inputs: Snapshot,
    pub outputs: Snapshot,
}

/// The watcher-context half of an observer session: previous snapshots,
/// the callback set, and the handle the facade reads the live directory
/// through.
pub(crate) struct DirectoryWatch {
    config: ObserverConfig,
    current: Directory,
    published: Arc<ArcSwap<Directory>>,
}

impl DirectoryWatch {
    pub fn new(config: ObserverConfig, published: Arc<ArcSwap<Directory>>) -> Self {
        Self {
            config,
            current: Directory::default(),
            published,
        }
    }

    /// Installs the baseline without firing callbacks. Ports present before
    /// the observer existed are not "added".
    pub fn seed(&mut self, inputs: Snapshot, outputs: Snapshot) {
        self.current = Directory { inputs, outputs };
        self.publish();
    }

    /// Compares fresh snapshots against the baseline, fires callbacks for
    /// every membership change (removals first), and adopts the new state.
    pub fn apply(&mut self, inputs: Snapshot, outputs: Snapshot) {
        let input_diff = self.current.inputs.diff(&inputs);
        let output_diff = self.current.outputs.diff(&outputs);
        if input_diff.is_empty() && output_diff.is_empty() {
            return;
        }
        debug!(
            inputs_added = input_diff.added.len(),
            inputs_removed = input_diff.removed.len(),
            outputs_added = output_diff.added.len(),
            outputs_removed = output_diff.removed.len(),
            "port directory changed"
        );

        for (index, port) in &input_diff.removed {
            if let Some(cb) = self.config.input_removed.as_mut() {
                cb(*index, port);
            }
        }
        for (index, port) in &input_diff.added {
            if let Some(cb) = self.config.input_added.as_mut() {
                cb(*index, port);
            }
        }
        for (index, port) in &output_diff.removed {
            if let Some(cb) = self.config.output_removed.as_mut() {
                cb(*index, port);
            }
        }
        for (index, port) in &output_diff.added {
            if let Some(cb) = self.config.output_added.as_mut() {
                cb(*index, port);
            }
        }

        self.current = Directory { inputs, outputs };
        self.publish();
    }

    pub fn poll_interval(&self) -> Duration {
        self.config.poll_interval
    }

    fn publish(&self) {
        self.published.store(Arc::new(self.current.clone()));
    }
}

/// Watches the port directory for hot-plug changes.
///
/// Callbacks fire on the watcher context (a background thread or an OS
/// notification context). Do not block in them, and do not call back into
/// this session from inside one. The session's own client never appears in
/// the directory it reports.
pub struct MidiObserver {
    imp: backend::MidiObserverImpl,
    directory: Arc<ArcSwap<Directory>>,
}

impl MidiObserver {
    /// Starts observing. The callbacks in `config` fire only for changes
    /// after this call; ports already present form the baseline.
    pub fn new(client_name: &str, config: ObserverConfig) -> Result<Self> {
        let directory = Arc::new(ArcSwap::from_pointee(Directory::default()));
        let watch = DirectoryWatch::new(config, Arc::clone(&directory));
        let imp = backend::MidiObserverImpl::new(client_name, watch)?;
        Ok(Self { imp, directory })
    }

    /// The directory as of the most recent (re)scan.
    pub fn directory(&self) -> Arc<Directory> {
        self.directory.load_full()
    }

    /// Stops watching and joins any watcher thread. Idempotent; dropping
    /// the session calls this.
    pub fn close(&mut self) {
        self.imp.close();
    }
}

impl Drop for MidiObserver {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn snap(ports: &[(u64, &str)]) -> Snapshot {
        Snapshot::new(ports.iter().map(|(a, n)| PortInfo::new(*a, *n)).collect())
    }

    fn recording_config(log: &Arc<Mutex<Vec<String>>>) -> ObserverConfig {
        let (a, b, c, d) = (log.clone(), log.clone(), log.clone(), log.clone());
        ObserverConfig::new()
            .on_input_added(move |i, p| a.lock().unwrap().push(format!("in+ {i} {}", p.name)))
            .on_input_removed(move |i, p| b.lock().unwrap().push(format!("in- {i} {}", p.name)))
            .on_output_added(move |i, p| c.lock().unwrap().push(format!("out+ {i} {}", p.name)))
            .on_output_removed(move |i, p| d.lock().unwrap().push(format!("out- {i} {}", p.name)))
    }

    #[test]
    fn seeding_fires_nothing() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let published = Arc::new(ArcSwap::from_pointee(Directory::default()));
        let mut watch = DirectoryWatch::new(recording_config(&log), Arc::clone(&published));
        watch.seed(snap(&[(1, "Synth")]), snap(&[(2, "Out")]));
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(published.load().inputs.len(), 1);
        assert_eq!(published.load().outputs.len(), 1);
    }

    #[test]
    fn apply_reports_changes_in_both_directions() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let published = Arc::new(ArcSwap::from_pointee(Directory::default()));
        let mut watch = DirectoryWatch::new(recording_config(&log), Arc::clone(&published));
        watch.seed(snap(&[(1, "Synth"), (2, "Keys")]), snap(&[(10, "Out A")]));

        watch.apply(
            snap(&[(2, "Keys"), (3, "Drums")]),
            snap(&[(10, "Out A"), (11, "Out B")]),
        );

        let log = log.lock().unwrap();
        assert_eq!(
            *log,
            vec![
                "in- 0 Synth".to_string(),
                "in+ 1 Drums".to_string(),
                "out+ 1 Out B".to_string(),
            ]
        );
        assert_eq!(published.load().inputs.len(), 2);
    }

    #[test]
    fn unchanged_rescan_is_silent() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let published = Arc::new(ArcSwap::from_pointee(Directory::default()));
        let mut watch = DirectoryWatch::new(recording_config(&log), Arc::clone(&published));
        let inputs = snap(&[(1, "Synth")]);
        let outputs = snap(&[(9, "Out")]);
        watch.seed(inputs.clone(), outputs.clone());
        watch.apply(inputs.clone(), outputs.clone());
        watch.apply(inputs, outputs);
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn missing_callbacks_are_skipped_but_state_advances() {
        let published = Arc::new(ArcSwap::from_pointee(Directory::default()));
        let mut watch = DirectoryWatch::new(ObserverConfig::new(), Arc::clone(&published));
        watch.seed(Snapshot::default(), Snapshot::default());
        watch.apply(snap(&[(5, "Late")]), Snapshot::default());
        assert_eq!(published.load().inputs.ports()[0].name, "Late");
    }

    #[test]
    fn repeated_flaps_report_every_transition() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let published = Arc::new(ArcSwap::from_pointee(Directory::default()));
        let mut watch = DirectoryWatch::new(recording_config(&log), Arc::clone(&published));
        watch.seed(Snapshot::default(), Snapshot::default());

        watch.apply(snap(&[(7, "Pad")]), Snapshot::default());
        watch.apply(Snapshot::default(), Snapshot::default());
        watch.apply(snap(&[(7, "Pad")]), Snapshot::default());

        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "in+ 0 Pad".to_string(),
                "in- 0 Pad".to_string(),
                "in+ 0 Pad".to_string(),
            ]
        );
    }

    #[test]
    fn config_builder_records_slots() {
        let config = ObserverConfig::new()
            .on_input_added(|_, _| {})
            .with_poll_interval(Duration::from_millis(250));
        assert!(config.input_added.is_some());
        assert!(config.output_added.is_none());
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        let debug = format!("{config:?}");
        assert!(debug.contains("poll_interval"));
    }
}

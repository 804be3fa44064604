//! Observers of scan invocations and the run-metadata sink.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::scan::args::ScanArg;
use crate::scan::engine::ScanHandle;

/// Observer notified before and after every invocation of a scan command.
///
/// Listeners are registered once and reused across invocations.
#[async_trait]
pub trait ScanListener: Send + Sync {
    /// Called with the raw arguments before anything is parsed or moved
    fn prepare_for_scan(&self, args: &[ScanArg]);

    /// Called once the run has ended, however it ended. May contribute a
    /// result to the invocation.
    async fn update(&self, handle: &dyn ScanHandle) -> Option<Value>;
}

/// Results contributed by listeners.
#[derive(Debug, Clone, PartialEq)]
pub enum ListenerOutput {
    /// No listener returned anything
    Nothing,
    /// Exactly one listener returned a result
    One(Value),
    /// Several listeners returned results, in registration order
    Many(Vec<Value>),
}

impl ListenerOutput {
    /// Collapse results by count
    pub fn from_results(mut results: Vec<Value>) -> Self {
        match results.len() {
            0 => ListenerOutput::Nothing,
            1 => ListenerOutput::One(results.remove(0)),
            _ => ListenerOutput::Many(results),
        }
    }

    /// True when no listener returned anything
    pub fn is_nothing(&self) -> bool {
        matches!(self, ListenerOutput::Nothing)
    }
}

/// Where the command line of each run is recorded for the data file header.
pub trait RunMetadataSink: Send + Sync {
    /// Record one key/value pair for the next run
    fn record(&self, key: &str, value: &str);
}

/// In-memory run metadata, shareable between the command and its engine.
#[derive(Debug, Clone, Default)]
pub struct RunMetadata {
    entries: Arc<Mutex<BTreeMap<String, String>>>,
}

impl RunMetadata {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Value recorded under `key`
    pub fn get(&self, key: &str) -> Option<String> {
        self.lock().get(key).cloned()
    }

    /// Every recorded pair, sorted by key
    pub fn entries(&self) -> BTreeMap<String, String> {
        self.lock().clone()
    }

    /// Forget everything recorded so far
    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, String>> {
        // A panic while holding the lock cannot leave a map half-written.
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl RunMetadataSink for RunMetadata {
    fn record(&self, key: &str, value: &str) {
        self.lock().insert(key.to_string(), value.to_string());
    }
}

/// Listener reporting where each run's data went.
///
/// Contributes `{"scan_number": n, "file": path}` when the engine exposes a
/// data writer.
#[derive(Debug, Default)]
pub struct DataLocationListener;

#[async_trait]
impl ScanListener for DataLocationListener {
    fn prepare_for_scan(&self, _args: &[ScanArg]) {}

    async fn update(&self, handle: &dyn ScanHandle) -> Option<Value> {
        let writer = handle.data_writer()?;
        Some(json!({
            "scan_number": writer.scan_number(),
            "file": writer.current_file().map(|path| path.display().to_string()),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listener_output_collapses_by_count() {
        assert!(ListenerOutput::from_results(vec![]).is_nothing());
        assert_eq!(
            ListenerOutput::from_results(vec![json!(1)]),
            ListenerOutput::One(json!(1))
        );
        assert_eq!(
            ListenerOutput::from_results(vec![json!(1), json!("peak")]),
            ListenerOutput::Many(vec![json!(1), json!("peak")])
        );
    }

    #[test]
    fn test_run_metadata_records_and_clears() {
        let metadata = RunMetadata::new();
        let sink: Arc<dyn RunMetadataSink> = Arc::new(metadata.clone());
        sink.record("command", "dscan x -1 1 10");
        sink.record("scan_type", "dscan");

        assert_eq!(metadata.get("scan_type").as_deref(), Some("dscan"));
        assert_eq!(metadata.entries().len(), 2);
        metadata.clear();
        assert!(metadata.get("command").is_none());
    }
}

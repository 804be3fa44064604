//! Seam to the execution engine.
//!
//! The engine iterates positions, triggers detectors and writes data. This
//! crate only submits a flat argument list (see [`crate::scan::syntax`] for
//! the grammar), attaches plot settings and waits for the run to end.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::hardware::capabilities::{same_axis, Axis};
use crate::scan::args::{ArgumentGroup, ScanArg};

/// How a run ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunOutcome {
    /// Every point was visited
    Completed,
    /// The user stopped the run; collected data is kept
    Halted,
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunOutcome::Completed => write!(f, "Completed"),
            RunOutcome::Halted => write!(f, "Halted"),
        }
    }
}

/// Which field to plot against which.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlotSettings {
    /// Field on the x axis
    pub x: Option<String>,
    /// Fields shown on the y axis
    pub y: Vec<String>,
}

impl PlotSettings {
    /// Derive plot settings from the first and last group.
    ///
    /// x is the first group's first input field (its name when it has none);
    /// y shows the last group's extra fields, or its input fields when it is
    /// a different axis with no extras.
    pub fn from_groups(groups: &[ArgumentGroup]) -> Self {
        let (Some(first), Some(last)) = (groups.first(), groups.last()) else {
            return Self::default();
        };

        let x = first
            .axis
            .input_names()
            .into_iter()
            .next()
            .unwrap_or_else(|| first.axis.name().to_string());

        let extras = last.axis.extra_names();
        let y = if !extras.is_empty() {
            extras
        } else if !same_axis(&first.axis, &last.axis) {
            last.axis.input_names()
        } else {
            Vec::new()
        };

        Self { x: Some(x), y }
    }
}

/// Where the engine wrote a run's data.
pub trait DataWriter: Send + Sync {
    /// Scan number assigned by the writer
    fn scan_number(&self) -> u64;

    /// File holding the run's data, if any
    fn current_file(&self) -> Option<PathBuf>;
}

/// Cooperative user-halt flag shared between caller and engine.
#[derive(Debug, Clone, Default)]
pub struct HaltSignal(Arc<AtomicBool>);

impl HaltSignal {
    /// Create an unset signal
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the running scan to stop after the current point
    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether a halt has been requested
    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Clear the flag before a new run
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// A normalized scan handed to the engine.
#[derive(Debug, Clone)]
pub struct ScanRequest {
    /// Command line as typed, for the data file header
    pub command: String,
    /// Flat absolute arguments
    pub args: Vec<ScanArg>,
    /// Count time per point, if the command gave one
    pub count_time: Option<f64>,
    /// Halt flag the engine must poll between points
    pub halt: HaltSignal,
}

/// Capability: an execution engine.
#[async_trait]
pub trait ScanEngine: Send + Sync {
    /// Build a runnable scan from a request. Validation errors surface here.
    async fn submit(&self, request: ScanRequest) -> Result<Box<dyn ScanHandle>>;
}

/// A submitted scan.
///
/// # Contract
/// - `run` returns `Ok(RunOutcome::Halted)` for a user halt and `Err` for
///   anything else that ends the run early
/// - accessors stay valid after `run` returns
#[async_trait]
pub trait ScanHandle: Send + Sync {
    /// Attach plot settings before running
    fn set_plot_settings(&mut self, settings: PlotSettings);

    /// Plot settings attached to the run
    fn plot_settings(&self) -> Option<PlotSettings>;

    /// Run to completion, halt or failure
    async fn run(&mut self) -> Result<RunOutcome>;

    /// Writer holding the run's data
    fn data_writer(&self) -> Option<Arc<dyn DataWriter>>;

    /// Every axis taking part in the run
    fn all_scannables(&self) -> Vec<Arc<dyn Axis>>;

    /// Names of the detectors read at each point
    fn detectors(&self) -> Vec<String>;
}

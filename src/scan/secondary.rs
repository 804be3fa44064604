//! Point-by-point execution of commands containing a nested scan.
//!
//! The execution engine cannot iterate an axis whose read is itself a whole
//! scan. Such commands are run here instead: the outer axis is stepped by
//! hand, every group is read at each point into a [`ScanTable`], and the
//! table is then replayed through the engine by a [`ReplayAxis`] so data
//! files and plots are produced exactly as for a direct scan.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::error::{ScanError, ScanResult};
use crate::hardware::capabilities::{is_nested_scan, Axis};
use crate::scan::args::{ArgumentGroup, ScanArg};
use crate::scan::engine::{
    DataWriter, HaltSignal, PlotSettings, RunOutcome, ScanEngine, ScanHandle, ScanRequest,
};
use crate::scan::position::Position;
use crate::scan::resolver::{MovePrimitive, DEFAULT_POLL_INTERVAL};

/// Default name of the axis replaying collected rows
pub const DEFAULT_REPLAY_AXIS_NAME: &str = "scan_of_scan";

/// Floating-point slack when counting outer steps
const STEP_TOLERANCE: f64 = 1e-9;

/// Most outer points a single command may visit
pub const MAX_OUTER_POINTS: usize = 1_000_000;

/// Outer positions `start, start + step, ...` covering `start..stop`.
///
/// The count of steps is `ceil((stop - start) / step)`; `start` is always the
/// first point, so `(0, 3, 1)` gives `[0, 1, 2, 3]`.
///
/// # Errors
///
/// A usage error for non-finite bounds or more than [`MAX_OUTER_POINTS`]
/// points.
pub fn outer_positions(start: f64, stop: f64, step: f64) -> ScanResult<Vec<f64>> {
    if ![start, stop, step].iter().all(|v| v.is_finite()) {
        return Err(ScanError::usage(format!(
            "outer range {start} {stop} {step} must be finite"
        )));
    }
    let steps = ((stop - start) / step - STEP_TOLERANCE).ceil().max(0.0);
    if !steps.is_finite() || steps >= MAX_OUTER_POINTS as f64 {
        return Err(ScanError::usage(format!(
            "outer range {start} {stop} {step} exceeds {MAX_OUTER_POINTS} points"
        )));
    }
    let steps = steps as usize;
    Ok((0..=steps).map(|i| start + i as f64 * step).collect())
}

/// Append-only table of rows collected point by point.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanTable {
    columns: Vec<String>,
    rows: Vec<Vec<f64>>,
}

impl ScanTable {
    /// Create an empty table
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    /// Append a row; it must have one value per column
    pub fn push_row(&mut self, row: Vec<f64>) -> ScanResult<()> {
        if row.len() != self.columns.len() {
            return Err(ScanError::ShapeMismatch {
                left: row.len(),
                right: self.columns.len(),
            });
        }
        self.rows.push(row);
        Ok(())
    }

    /// Column names
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Collected rows
    pub fn rows(&self) -> &[Vec<f64>] {
        &self.rows
    }

    /// Number of rows
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// True when no row was collected
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Axis stepping through the rows of a [`ScanTable`].
///
/// Its single input field is the row index; the table columns are reported
/// as extra fields.
pub struct ReplayAxis {
    name: String,
    table: Arc<ScanTable>,
    current: AtomicUsize,
}

impl ReplayAxis {
    /// Create a replay axis positioned on the first row
    pub fn new(name: &str, table: Arc<ScanTable>) -> Self {
        Self {
            name: name.to_string(),
            table,
            current: AtomicUsize::new(0),
        }
    }

    /// The replayed table
    pub fn table(&self) -> &ScanTable {
        &self.table
    }
}

#[async_trait]
impl Axis for ReplayAxis {
    fn name(&self) -> &str {
        &self.name
    }

    fn input_names(&self) -> Vec<String> {
        vec!["point".to_string()]
    }

    fn extra_names(&self) -> Vec<String> {
        self.table.columns().to_vec()
    }

    async fn position(&self) -> Result<Position> {
        let index = self.current.load(Ordering::SeqCst);
        let row = self
            .table
            .rows()
            .get(index)
            .ok_or_else(|| anyhow!("{}: no row {}", self.name, index))?;
        let mut values = Vec::with_capacity(row.len() + 1);
        values.push(index as f64);
        values.extend(row.iter().copied());
        Ok(Position::from_fields(values))
    }

    async fn move_to(&self, target: Position) -> Result<()> {
        let value = target
            .as_scalar()
            .ok_or_else(|| anyhow!("{}: target must be a row index, got {}", self.name, target))?;
        let index = value.round();
        if index < 0.0 || index as usize >= self.table.len() {
            return Err(anyhow!(
                "{}: row {} out of range (table has {} rows)",
                self.name,
                value,
                self.table.len()
            ));
        }
        self.current.store(index as usize, Ordering::SeqCst);
        Ok(())
    }

    async fn is_busy(&self) -> Result<bool> {
        Ok(false)
    }

    async fn wait_while_busy(&self) -> Result<()> {
        Ok(())
    }
}

/// Handle of a point-by-point scan.
///
/// Running it replays the collected rows through the engine. Scannables are
/// the axes of the original command, not the replay axis.
pub struct SecondaryScanHandle {
    replay: Option<Box<dyn ScanHandle>>,
    loop_outcome: RunOutcome,
    scannables: Vec<Arc<dyn Axis>>,
    table: Arc<ScanTable>,
    plot_settings: Option<PlotSettings>,
}

impl SecondaryScanHandle {
    /// Rows collected by the outer loop
    pub fn table(&self) -> &ScanTable {
        &self.table
    }
}

#[async_trait]
impl ScanHandle for SecondaryScanHandle {
    fn set_plot_settings(&mut self, settings: PlotSettings) {
        if let Some(replay) = self.replay.as_mut() {
            replay.set_plot_settings(settings.clone());
        }
        self.plot_settings = Some(settings);
    }

    fn plot_settings(&self) -> Option<PlotSettings> {
        self.plot_settings.clone()
    }

    async fn run(&mut self) -> Result<RunOutcome> {
        let replayed = match self.replay.as_mut() {
            Some(replay) => replay.run().await?,
            None => RunOutcome::Completed,
        };
        if self.loop_outcome == RunOutcome::Halted {
            return Ok(RunOutcome::Halted);
        }
        Ok(replayed)
    }

    fn data_writer(&self) -> Option<Arc<dyn DataWriter>> {
        self.replay.as_ref().and_then(|replay| replay.data_writer())
    }

    fn all_scannables(&self) -> Vec<Arc<dyn Axis>> {
        self.scannables.clone()
    }

    fn detectors(&self) -> Vec<String> {
        self.replay
            .as_ref()
            .map(|replay| replay.detectors())
            .unwrap_or_default()
    }
}

/// Runs a command containing nested-scan axes point by point.
pub struct SecondaryScan {
    engine: Arc<dyn ScanEngine>,
    mover: Arc<dyn MovePrimitive>,
    halt: HaltSignal,
    poll_interval: Duration,
    replay_axis_name: String,
}

impl SecondaryScan {
    /// Create a point-by-point runner
    pub fn new(engine: Arc<dyn ScanEngine>, mover: Arc<dyn MovePrimitive>, halt: HaltSignal) -> Self {
        Self {
            engine,
            mover,
            halt,
            poll_interval: DEFAULT_POLL_INTERVAL,
            replay_axis_name: DEFAULT_REPLAY_AXIS_NAME.to_string(),
        }
    }

    /// Busy-poll interval while waiting for the outer axis
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Name of the replay axis
    pub fn with_replay_axis_name(mut self, name: &str) -> Self {
        self.replay_axis_name = name.to_string();
        self
    }

    /// Step the outer axis, collect one row per point and submit the replay.
    ///
    /// A user halt ends the loop early; rows collected so far are kept and
    /// replayed, and the returned handle reports [`RunOutcome::Halted`].
    #[instrument(skip_all, fields(command = %command))]
    pub async fn execute(
        &self,
        command: &str,
        groups: &[ArgumentGroup],
        count_time: Option<f64>,
    ) -> ScanResult<Box<dyn ScanHandle>> {
        let plan = OuterLoop::from_groups(groups)?;
        let positions = outer_positions(plan.start, plan.stop, plan.step)?;
        info!(points = positions.len(), "Running nested scan point by point");

        let mut table = ScanTable::new(columns(groups));
        let mut loop_outcome = RunOutcome::Completed;
        for (index, position) in positions.iter().enumerate() {
            if self.halt.is_requested() {
                info!(collected = table.len(), "Point-by-point scan halted by user");
                loop_outcome = RunOutcome::Halted;
                break;
            }
            debug!(index, position, "Outer point");

            let outer = &groups[0].axis;
            outer
                .move_to(Position::Scalar(*position))
                .await
                .map_err(|e| ScanError::device(outer.name(), e))?;
            if !self.wait_for(outer).await? {
                info!(collected = table.len(), "Point-by-point scan halted while moving");
                loop_outcome = RunOutcome::Halted;
                break;
            }

            if !plan.fixed.is_empty() {
                self.mover.move_together(&plan.fixed).await?;
            }

            let mut row = Vec::with_capacity(table.columns().len());
            for group in groups {
                let reading = group
                    .axis
                    .position()
                    .await
                    .map_err(|e| ScanError::device(group.axis.name(), e))?;
                row.extend(reading.values());
            }
            table.push_row(row)?;
        }

        let table = Arc::new(table);
        let scannables = groups.iter().map(|group| group.axis.clone()).collect();
        if table.is_empty() {
            warn!("No points collected; nothing to replay");
            return Ok(Box::new(SecondaryScanHandle {
                replay: None,
                loop_outcome,
                scannables,
                table,
                plot_settings: None,
            }));
        }

        // The collected rows are written even when the loop was halted.
        self.halt.reset();
        let replay_axis: Arc<dyn Axis> =
            Arc::new(ReplayAxis::new(&self.replay_axis_name, table.clone()));
        let last = (table.len() - 1) as f64;
        let request = ScanRequest {
            command: command.to_string(),
            args: vec![
                ScanArg::Axis(replay_axis),
                ScanArg::Number(0.0),
                ScanArg::Number(last),
                ScanArg::Number(1.0),
            ],
            count_time,
            halt: self.halt.clone(),
        };
        let replay = self
            .engine
            .submit(request)
            .await
            .map_err(ScanError::ExecutionFailed)?;

        Ok(Box::new(SecondaryScanHandle {
            replay: Some(replay),
            loop_outcome,
            scannables,
            table,
            plot_settings: None,
        }))
    }

    /// Poll until `axis` settles. Returns `false` if a halt arrives first.
    async fn wait_for(&self, axis: &Arc<dyn Axis>) -> ScanResult<bool> {
        loop {
            let busy = axis
                .is_busy()
                .await
                .map_err(|e| ScanError::device(axis.name(), e))?;
            if !busy {
                return Ok(true);
            }
            if self.halt.is_requested() {
                return Ok(false);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

/// The validated shape of a point-by-point command.
struct OuterLoop {
    start: f64,
    stop: f64,
    step: f64,
    fixed: Vec<(Arc<dyn Axis>, Position)>,
}

impl OuterLoop {
    fn from_groups(groups: &[ArgumentGroup]) -> ScanResult<Self> {
        for group in groups {
            if let Some(nested) = group.axis.nested_scan() {
                if nested
                    .inner_axes()
                    .iter()
                    .any(|inner| is_nested_scan(inner.as_ref()))
                {
                    return Err(ScanError::usage(format!(
                        "{} nests another scan-of-scan, which is not supported",
                        group.axis.name()
                    )));
                }
                if !group.is_read_only() {
                    return Err(ScanError::usage(format!(
                        "{} is a nested scan and can only be read",
                        group.axis.name()
                    )));
                }
            }
        }

        let Some(outer) = groups.first() else {
            return Err(ScanError::usage("no arguments given"));
        };
        if is_nested_scan(outer.axis.as_ref()) {
            return Err(ScanError::usage(format!(
                "{} is a nested scan and cannot be the outer axis",
                outer.axis.name()
            )));
        }
        let numbers: Vec<f64> = outer.params.iter().filter_map(ScanArg::as_number).collect();
        let &[start, stop, step] = numbers.as_slice() else {
            return Err(ScanError::usage(format!(
                "outer axis {} needs scalar start stop step",
                outer.axis.name()
            )));
        };
        if outer.params.len() != 3 || step == 0.0 {
            return Err(ScanError::usage(format!(
                "outer axis {} needs scalar start stop step with a non-zero step",
                outer.axis.name()
            )));
        }

        let mut fixed = Vec::new();
        for group in &groups[1..] {
            match group.params.as_slice() {
                [] => {}
                [position] => fixed.push((group.axis.clone(), position.to_position()?)),
                _ => {
                    return Err(ScanError::usage(format!(
                        "{} must be read only or held at one position in a scan of scans",
                        group.axis.name()
                    )))
                }
            }
        }

        Ok(Self {
            start,
            stop,
            step,
            fixed,
        })
    }
}

fn columns(groups: &[ArgumentGroup]) -> Vec<String> {
    groups
        .iter()
        .flat_map(|group| {
            let mut names = group.axis.input_names();
            names.extend(group.axis.extra_names());
            if names.is_empty() {
                names.push(group.axis.name().to_string());
            }
            names
        })
        .collect()
}

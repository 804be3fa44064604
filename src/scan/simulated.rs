//! In-process execution engine.
//!
//! `SimulatedEngine` interprets the flat argument grammar produced by the
//! scan syntaxes, moves axes point by point and keeps every row in memory.
//! It backs the integration tests and the `daq-scan` demo binary, and can
//! inject a user halt or an engine fault after a given number of points.
//!
//! # Grammar
//!
//! - leading `[axis, start, stop, step]`: outer range; `[axis, [p0, p1, ...]]`: explicit points
//! - `[axis, start, stop, step]` after that: a range nested inside the previous one
//! - `[axis, start, step]`: moves with the innermost range, `start + i * step`
//! - `[axis, [p0, p1, ...]]`: moves with the innermost range through the listed points
//! - `[axis, pos]`: moved once before the first point
//! - `[axis]`: only read

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info};

use crate::hardware::capabilities::{same_axis, Axis};
use crate::scan::args::{parse, ArgumentGroup, ScanArg};
use crate::scan::engine::{
    DataWriter, HaltSignal, PlotSettings, RunOutcome, ScanEngine, ScanHandle, ScanRequest,
};
use crate::scan::position::Position;

/// Slack when counting range steps
const STEP_FUDGE: f64 = 1e-9;

/// Most points a single range may expand to
const MAX_RANGE_POINTS: usize = 1_000_000;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// =============================================================================
// MemoryDataWriter
// =============================================================================

/// Data writer keeping rows in memory.
#[derive(Debug)]
pub struct MemoryDataWriter {
    scan_number: u64,
    columns: Vec<String>,
    rows: Mutex<Vec<Vec<f64>>>,
}

impl MemoryDataWriter {
    /// Create an empty writer
    pub fn new(scan_number: u64, columns: Vec<String>) -> Self {
        Self {
            scan_number,
            columns,
            rows: Mutex::new(Vec::new()),
        }
    }

    /// Column names
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Rows written so far
    pub fn rows(&self) -> Vec<Vec<f64>> {
        lock(&self.rows).clone()
    }

    fn push(&self, row: Vec<f64>) {
        lock(&self.rows).push(row);
    }
}

impl DataWriter for MemoryDataWriter {
    fn scan_number(&self) -> u64 {
        self.scan_number
    }

    fn current_file(&self) -> Option<PathBuf> {
        None
    }
}

// =============================================================================
// Sweep
// =============================================================================

enum Follower {
    Stepped {
        axis: Arc<dyn Axis>,
        start: Position,
        step: Position,
    },
    Listed {
        axis: Arc<dyn Axis>,
        points: Vec<Position>,
    },
}

impl Follower {
    fn target(&self, index: usize) -> Result<(Arc<dyn Axis>, Position)> {
        match self {
            Follower::Stepped { axis, start, step } => {
                Ok((axis.clone(), start.add(&step.scale(index as f64))?))
            }
            Follower::Listed { axis, points } => points
                .get(index)
                .map(|point| (axis.clone(), point.clone()))
                .ok_or_else(|| anyhow!("{}: no listed position {}", axis.name(), index)),
        }
    }
}

struct Dimension {
    leader: Arc<dyn Axis>,
    points: Vec<Position>,
    followers: Vec<Follower>,
}

/// A compiled flat argument list.
struct Sweep {
    dimensions: Vec<Dimension>,
    fixed: Vec<(Arc<dyn Axis>, Position)>,
    readouts: Vec<Arc<dyn Axis>>,
    detectors: Vec<String>,
}

fn range_points(start: &Position, stop: &Position, step: &Position) -> Result<Vec<Position>> {
    let span = stop.add(&start.scale(-1.0))?.values();
    let steps = step.values();
    let steps = if steps.len() == 1 {
        vec![steps[0]; span.len()]
    } else {
        steps
    };
    if steps.len() != span.len() {
        bail!("step has {} fields, range has {}", steps.len(), span.len());
    }

    let mut count: Option<f64> = None;
    for (distance, step) in span.iter().zip(&steps) {
        if *step == 0.0 {
            continue;
        }
        let n = (distance / step + STEP_FUDGE).floor();
        if !n.is_finite() || n >= MAX_RANGE_POINTS as f64 {
            bail!("range of {distance} in steps of {step} exceeds {MAX_RANGE_POINTS} points");
        }
        if n < 0.0 {
            bail!("step {step} points away from the end of the range");
        }
        count = Some(count.map_or(n, |c| c.max(n)));
    }
    let count = count.ok_or_else(|| anyhow!("step must be non-zero"))? as usize;

    (0..=count)
        .map(|k| start.add(&step.scale(k as f64)).map_err(Into::into))
        .collect()
}

fn listed_points(arg: &ScanArg) -> Result<Vec<Position>> {
    let entries = arg
        .as_sequence()
        .ok_or_else(|| anyhow!("expected a list of positions, got {arg}"))?;
    entries
        .iter()
        .map(|entry| entry.to_position().map_err(Into::into))
        .collect()
}

/// A list of plain numbers given to a multi-field axis is one position.
fn is_single_vector(group: &ArgumentGroup, arg: &ScanArg) -> bool {
    group.axis.input_field_count() > 1
        && arg
            .as_sequence()
            .is_some_and(|items| items.iter().all(|item| item.as_number().is_some()))
}

impl Sweep {
    fn compile(args: &[ScanArg]) -> Result<Self> {
        let groups = parse(args)?;
        let mut sweep = Sweep {
            dimensions: Vec::new(),
            fixed: Vec::new(),
            readouts: Vec::new(),
            detectors: Vec::new(),
        };

        for (index, group) in groups.iter().enumerate() {
            if !sweep.readouts.iter().any(|axis| same_axis(axis, &group.axis)) {
                sweep.readouts.push(group.axis.clone());
            }
            let axis = group.axis.clone();
            match group.params.as_slice() {
                [start, stop, step] => sweep.dimensions.push(Dimension {
                    leader: axis,
                    points: range_points(
                        &start.to_position()?,
                        &stop.to_position()?,
                        &step.to_position()?,
                    )?,
                    followers: Vec::new(),
                }),
                [list] if index == 0 && list.is_sequence() && !is_single_vector(group, list) => {
                    sweep.dimensions.push(Dimension {
                        leader: axis,
                        points: listed_points(list)?,
                        followers: Vec::new(),
                    })
                }
                _ if index == 0 => {
                    bail!(
                        "{} must start the scan with start stop step or a list of positions",
                        group.axis.name()
                    )
                }
                [] => sweep.detectors.push(group.axis.name().to_string()),
                [list] if list.is_sequence() && !is_single_vector(group, list) => {
                    let points = listed_points(list)?;
                    let inner = sweep.innermost()?;
                    if points.len() != inner.points.len() {
                        bail!(
                            "{} lists {} positions but {} moves through {}",
                            group.axis.name(),
                            points.len(),
                            inner.leader.name(),
                            inner.points.len()
                        );
                    }
                    inner.followers.push(Follower::Listed { axis, points });
                }
                [position] => sweep.fixed.push((axis, position.to_position()?)),
                [start, step] => {
                    let follower = Follower::Stepped {
                        axis,
                        start: start.to_position()?,
                        step: step.to_position()?,
                    };
                    sweep.innermost()?.followers.push(follower);
                }
                _ => bail!(
                    "{} has {} parameters; at most 3 are understood",
                    group.axis.name(),
                    group.params.len()
                ),
            }
        }
        Ok(sweep)
    }

    fn innermost(&mut self) -> Result<&mut Dimension> {
        self.dimensions
            .last_mut()
            .ok_or_else(|| anyhow!("no range to follow"))
    }

    fn point_count(&self) -> usize {
        self.dimensions.iter().map(|d| d.points.len()).product()
    }

    fn columns(&self) -> Vec<String> {
        self.readouts
            .iter()
            .flat_map(|axis| {
                let mut names = axis.input_names();
                names.extend(axis.extra_names());
                if names.is_empty() {
                    names.push(axis.name().to_string());
                }
                names
            })
            .collect()
    }

    /// Index of each dimension for a linear point number; the last dimension
    /// varies fastest.
    fn indices(&self, mut point: usize) -> Vec<usize> {
        let mut indices = vec![0; self.dimensions.len()];
        for (slot, dimension) in indices.iter_mut().zip(&self.dimensions).rev() {
            let size = dimension.points.len();
            *slot = point % size;
            point /= size;
        }
        indices
    }
}

// =============================================================================
// SimulatedEngine
// =============================================================================

/// In-process execution engine.
///
/// # Example
///
/// ```rust,ignore
/// let engine = Arc::new(SimulatedEngine::new().halt_after(3));
/// let report = dscan.invoke(scan_args![x.clone(), -5, 5, 10]).await?;
/// assert_eq!(report.outcome, RunOutcome::Halted);
/// ```
#[derive(Default)]
pub struct SimulatedEngine {
    submitted: Mutex<Vec<ScanRequest>>,
    writers: Mutex<Vec<Arc<MemoryDataWriter>>>,
    point_delay: Duration,
    halt_after: Option<usize>,
    fail_after: Option<usize>,
    scan_numbers: AtomicU64,
}

impl SimulatedEngine {
    /// Create an engine running points back to back
    pub fn new() -> Self {
        Self::default()
    }

    /// Pause after every point
    pub fn with_point_delay(mut self, delay: Duration) -> Self {
        self.point_delay = delay;
        self
    }

    /// Request a user halt once `points` points have been collected
    pub fn halt_after(mut self, points: usize) -> Self {
        self.halt_after = Some(points);
        self
    }

    /// Fail the run once `points` points have been collected
    pub fn fail_after(mut self, points: usize) -> Self {
        self.fail_after = Some(points);
        self
    }

    /// Every request submitted so far
    pub fn submitted(&self) -> Vec<ScanRequest> {
        lock(&self.submitted).clone()
    }

    /// Writer of the most recently submitted scan
    pub fn last_writer(&self) -> Option<Arc<MemoryDataWriter>> {
        lock(&self.writers).last().cloned()
    }
}

#[async_trait]
impl ScanEngine for SimulatedEngine {
    async fn submit(&self, request: ScanRequest) -> Result<Box<dyn ScanHandle>> {
        let sweep = Sweep::compile(&request.args)
            .with_context(|| format!("cannot run '{}'", request.command))?;
        lock(&self.submitted).push(request.clone());

        let scan_number = self.scan_numbers.fetch_add(1, Ordering::SeqCst) + 1;
        let writer = Arc::new(MemoryDataWriter::new(scan_number, sweep.columns()));
        lock(&self.writers).push(writer.clone());
        info!(
            scan_number,
            points = sweep.point_count(),
            command = %request.command,
            "Scan submitted"
        );

        Ok(Box::new(SimulatedHandle {
            sweep,
            halt: request.halt,
            writer,
            plot_settings: None,
            point_delay: self.point_delay,
            halt_after: self.halt_after,
            fail_after: self.fail_after,
        }))
    }
}

struct SimulatedHandle {
    sweep: Sweep,
    halt: HaltSignal,
    writer: Arc<MemoryDataWriter>,
    plot_settings: Option<PlotSettings>,
    point_delay: Duration,
    halt_after: Option<usize>,
    fail_after: Option<usize>,
}

impl SimulatedHandle {
    async fn move_all(targets: &[(Arc<dyn Axis>, Position)]) -> Result<()> {
        for (axis, target) in targets {
            axis.move_to(target.clone())
                .await
                .with_context(|| format!("moving {} to {}", axis.name(), target))?;
        }
        for (axis, _) in targets {
            axis.wait_while_busy().await?;
        }
        Ok(())
    }
}

#[async_trait]
impl ScanHandle for SimulatedHandle {
    fn set_plot_settings(&mut self, settings: PlotSettings) {
        self.plot_settings = Some(settings);
    }

    fn plot_settings(&self) -> Option<PlotSettings> {
        self.plot_settings.clone()
    }

    async fn run(&mut self) -> Result<RunOutcome> {
        Self::move_all(&self.sweep.fixed).await?;

        let mut previous: Option<Vec<usize>> = None;
        for point in 0..self.sweep.point_count() {
            if self.halt.is_requested() {
                info!(points = point, "Scan halted");
                return Ok(RunOutcome::Halted);
            }
            if self.fail_after == Some(point) {
                bail!("simulated engine fault at point {point}");
            }

            let indices = self.sweep.indices(point);
            let mut targets = Vec::new();
            for (d, dimension) in self.sweep.dimensions.iter().enumerate() {
                let index = indices[d];
                if previous.as_ref().is_some_and(|p| p[d] == index) {
                    continue;
                }
                targets.push((dimension.leader.clone(), dimension.points[index].clone()));
                for follower in &dimension.followers {
                    targets.push(follower.target(index)?);
                }
            }
            Self::move_all(&targets).await?;

            let mut row = Vec::new();
            for axis in &self.sweep.readouts {
                let reading = axis
                    .position()
                    .await
                    .with_context(|| format!("reading {}", axis.name()))?;
                row.extend(reading.values());
            }
            debug!(point, ?row, "Point collected");
            self.writer.push(row);
            previous = Some(indices);

            if self.halt_after == Some(point + 1) {
                self.halt.request();
            }
            if !self.point_delay.is_zero() {
                sleep(self.point_delay).await;
            }
        }
        Ok(RunOutcome::Completed)
    }

    fn data_writer(&self) -> Option<Arc<dyn DataWriter>> {
        Some(self.writer.clone())
    }

    fn all_scannables(&self) -> Vec<Arc<dyn Axis>> {
        self.sweep.readouts.clone()
    }

    fn detectors(&self) -> Vec<String> {
        self.sweep.detectors.clone()
    }
}

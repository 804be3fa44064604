//! Scan syntaxes: turning a command's raw groups into normalized ranges.
//!
//! Every scan command owns one [`ScanSyntax`]. It validates the arity of the
//! leading, scan-controlling group(s) and rewrites them into the grammar the
//! execution engine understands:
//!
//! | Group after conversion            | Engine meaning                     |
//! |-----------------------------------|------------------------------------|
//! | `[axis, start, stop, step]`       | range (outer, or nested if trailing)|
//! | `[axis, start, step]`             | lock-step with the outer range     |
//! | `[axis, [p0, p1, ...]]`           | explicit positions                 |
//! | `[axis, pos]`                     | fixed position                     |
//! | `[axis]`                          | read only                          |
//!
//! Trailing groups beyond the ones a syntax controls are passed through
//! untouched. Relative syntaxes emit offsets; the orchestrator adds the
//! sampled positions afterwards.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{ScanError, ScanResult};
use crate::hardware::capabilities::Axis;
use crate::scan::args::{ArgumentGroup, ScanArg};
use crate::scan::position::Position;

/// Usage of the generic `scan` command.
pub const GENERIC_USAGE: &str =
    "scan axis start stop step [axis2 [pos2 | start2 step2 | start2 stop2 step2]] ...";

/// Groups ready for the execution engine.
#[derive(Debug, Clone)]
pub struct NormalizedScan {
    /// Converted groups, leading groups first
    pub groups: Vec<ArgumentGroup>,
    /// Count time per point, when the syntax takes one
    pub count_time: Option<f64>,
}

impl NormalizedScan {
    fn new(groups: Vec<ArgumentGroup>) -> Self {
        Self {
            groups,
            count_time: None,
        }
    }
}

/// A scan command's grammar.
pub trait ScanSyntax: Send + Sync {
    /// Command name, e.g. "dscan"
    fn command(&self) -> &str;

    /// Required argument pattern, shown in usage errors
    fn usage(&self) -> &str;

    /// Whether bounds are offsets from the current position. Relative scans
    /// always return their axes to the starting positions.
    fn is_relative(&self) -> bool {
        false
    }

    /// Validate and normalize the groups
    fn convert(&self, groups: Vec<ArgumentGroup>) -> ScanResult<NormalizedScan>;
}

fn intervals(arg: &ScanArg, what: &str) -> ScanResult<f64> {
    match arg.as_number() {
        Some(n) if n > 0.0 && n.fract() == 0.0 => Ok(n),
        _ => Err(ScanError::usage(format!(
            "{what} must be a positive integer, got {arg}"
        ))),
    }
}

fn check_shape(axis: &dyn Axis, position: &Position) -> ScanResult<()> {
    if let Position::Vector(values) = position {
        let fields = axis.input_field_count();
        if values.len() != fields {
            return Err(ScanError::ShapeMismatch {
                left: values.len(),
                right: fields,
            });
        }
    }
    Ok(())
}

fn bounds(group: &ArgumentGroup) -> ScanResult<(Position, Position)> {
    let start = group.params[0].to_position()?;
    let stop = group.params[1].to_position()?;
    check_shape(group.axis.as_ref(), &start)?;
    check_shape(group.axis.as_ref(), &stop)?;
    Ok((start, stop))
}

/// Step that covers `start..stop` in `n` intervals; its sign follows
/// `stop - start`.
pub fn signed_step(start: &Position, stop: &Position, n: f64) -> ScanResult<Position> {
    Ok(stop.add(&start.scale(-1.0))?.scale(1.0 / n))
}

/// Flip each element of `step` so it points from `start` towards `stop`.
pub fn sort_step(start: &Position, stop: &Position, step: &Position) -> ScanResult<Position> {
    let direction = stop
        .add(&start.scale(-1.0))?
        .map(|d| if d < 0.0 { -1.0 } else { 1.0 });
    step.map(f64::abs).mult(&direction)
}

// =============================================================================
// Generic scan
// =============================================================================

/// The engine's own grammar: the leading group is already a range or an
/// explicit position list. Only the step direction is corrected.
#[derive(Debug, Clone, Default)]
pub struct GenericScan;

impl GenericScan {
    fn convert_groups(&self, mut groups: Vec<ArgumentGroup>) -> ScanResult<NormalizedScan> {
        let Some(leading) = groups.first_mut() else {
            return Err(ScanError::usage("no arguments given"));
        };
        match leading.params.len() {
            3 => {
                let (start, stop) = bounds(leading)?;
                let step = leading.params[2].to_position()?;
                check_shape(leading.axis.as_ref(), &step)?;
                leading.params[2] = sort_step(&start, &stop, &step)?.into();
            }
            1 if leading.params[0].is_sequence() => {}
            _ => {
                return Err(ScanError::usage(format!(
                    "{} needs start stop step or a list of positions",
                    leading.axis.name()
                )))
            }
        }
        Ok(NormalizedScan::new(groups))
    }
}

impl ScanSyntax for GenericScan {
    fn command(&self) -> &str {
        "scan"
    }

    fn usage(&self) -> &str {
        GENERIC_USAGE
    }

    fn convert(&self, groups: Vec<ArgumentGroup>) -> ScanResult<NormalizedScan> {
        self.convert_groups(groups)
            .map_err(|e| e.for_command(self.command(), self.usage()))
    }
}

// =============================================================================
// Absolute scans (ascan, a2scan, a3scan)
// =============================================================================

/// `ascan`-style scan of `axes` locked axes sharing one interval count.
///
/// Every locked axis gives `start stop`; the last one also gives `n`. Each
/// axis gets its own step `(stop - start) / n`.
#[derive(Debug, Clone)]
pub struct AbsoluteScan {
    command: String,
    usage: String,
    axes: usize,
}

impl AbsoluteScan {
    /// Locked scan of `axes` axes (1 to 3) under the given command name
    pub fn new(command: &str, axes: usize) -> Self {
        Self {
            command: command.to_string(),
            usage: locked_usage(command, axes, ""),
            axes: axes.max(1),
        }
    }

    /// `ascan axis start stop n`
    pub fn ascan() -> Self {
        Self::new("ascan", 1)
    }

    /// `a2scan axis1 start1 stop1 axis2 start2 stop2 n`
    pub fn a2scan() -> Self {
        Self::new("a2scan", 2)
    }

    /// `a3scan axis1 start1 stop1 axis2 start2 stop2 axis3 start3 stop3 n`
    pub fn a3scan() -> Self {
        Self::new("a3scan", 3)
    }

    fn convert_groups(&self, mut groups: Vec<ArgumentGroup>) -> ScanResult<NormalizedScan> {
        let k = self.axes;
        if groups.len() < k {
            return Err(ScanError::usage(format!(
                "expected {k} scanned axes, got {}",
                groups.len()
            )));
        }
        for (i, group) in groups[..k].iter().enumerate() {
            let (expected, pattern) = if i == k - 1 {
                (3, "start stop n")
            } else {
                (2, "start stop")
            };
            if group.params.len() != expected {
                return Err(ScanError::usage(format!(
                    "{} needs {pattern}, got {} value(s)",
                    group.axis.name(),
                    group.params.len()
                )));
            }
        }

        let n = intervals(&groups[k - 1].params[2], "number of intervals")?;
        for (i, group) in groups.iter_mut().take(k).enumerate() {
            let (start, stop) = bounds(group)?;
            let step = signed_step(&start, &stop, n)?;
            group.params = if i == 0 {
                vec![start.into(), stop.into(), step.into()]
            } else {
                vec![start.into(), step.into()]
            };
        }
        Ok(NormalizedScan::new(groups))
    }
}

impl ScanSyntax for AbsoluteScan {
    fn command(&self) -> &str {
        &self.command
    }

    fn usage(&self) -> &str {
        &self.usage
    }

    fn convert(&self, groups: Vec<ArgumentGroup>) -> ScanResult<NormalizedScan> {
        self.convert_groups(groups)
            .map_err(|e| e.for_command(self.command(), self.usage()))
    }
}

fn locked_usage(command: &str, axes: usize, suffix: &str) -> String {
    let mut usage = command.to_string();
    if axes <= 1 {
        usage.push_str(" axis start stop n");
    } else {
        for i in 1..=axes {
            usage.push_str(&format!(" axis{i} start{i} stop{i}"));
        }
        usage.push_str(" n");
    }
    usage.push_str(" [axis pos ...]");
    usage.push_str(suffix);
    usage
}

// =============================================================================
// Relative scans (dscan, d2scan, d3scan, lup)
// =============================================================================

/// Same transform as [`AbsoluteScan`] with bounds relative to the current
/// positions. The axes return to where they started afterwards.
#[derive(Debug, Clone)]
pub struct RelativeScan {
    inner: AbsoluteScan,
}

impl RelativeScan {
    /// Relative locked scan of `axes` axes under the given command name
    pub fn new(command: &str, axes: usize) -> Self {
        let mut inner = AbsoluteScan::new(command, axes);
        inner.usage = locked_usage(command, axes, " (start/stop relative to current position)");
        Self { inner }
    }

    /// `dscan axis start stop n`
    pub fn dscan() -> Self {
        Self::new("dscan", 1)
    }

    /// `d2scan axis1 start1 stop1 axis2 start2 stop2 n`
    pub fn d2scan() -> Self {
        Self::new("d2scan", 2)
    }

    /// `d3scan axis1 start1 stop1 axis2 start2 stop2 axis3 start3 stop3 n`
    pub fn d3scan() -> Self {
        Self::new("d3scan", 3)
    }
}

impl ScanSyntax for RelativeScan {
    fn command(&self) -> &str {
        self.inner.command()
    }

    fn usage(&self) -> &str {
        self.inner.usage()
    }

    fn is_relative(&self) -> bool {
        true
    }

    fn convert(&self, groups: Vec<ArgumentGroup>) -> ScanResult<NormalizedScan> {
        self.inner.convert(groups)
    }
}

// =============================================================================
// Mesh
// =============================================================================

/// Grid of two independent axes; each gets its own interval count. The
/// second axis is emitted as a full range so the engine nests it.
#[derive(Debug, Clone, Default)]
pub struct MeshScan;

const MESH_USAGE: &str =
    "mesh axis1 start1 stop1 n1 axis2 start2 stop2 n2 [time] [axis pos ...]";

impl MeshScan {
    fn convert_groups(&self, mut groups: Vec<ArgumentGroup>) -> ScanResult<NormalizedScan> {
        if groups.len() < 2 {
            return Err(ScanError::usage(format!(
                "expected 2 scanned axes, got {}",
                groups.len()
            )));
        }
        if groups[0].params.len() != 3 {
            return Err(ScanError::usage(format!(
                "{} needs start stop n, got {} value(s)",
                groups[0].axis.name(),
                groups[0].params.len()
            )));
        }
        if !(3..=4).contains(&groups[1].params.len()) {
            return Err(ScanError::usage(format!(
                "{} needs start stop n [time], got {} value(s)",
                groups[1].axis.name(),
                groups[1].params.len()
            )));
        }

        let count_time = match groups[1].params.get(3) {
            Some(arg) => match arg.as_number() {
                Some(time) if time >= 0.0 => Some(time),
                _ => {
                    return Err(ScanError::usage(format!(
                        "count time must be a non-negative number, got {arg}"
                    )))
                }
            },
            None => None,
        };

        for group in groups.iter_mut().take(2) {
            let n = intervals(&group.params[2], "number of intervals")?;
            let (start, stop) = bounds(group)?;
            let step = signed_step(&start, &stop, n)?;
            group.params = vec![start.into(), stop.into(), step.into()];
        }

        Ok(NormalizedScan { groups, count_time })
    }
}

impl ScanSyntax for MeshScan {
    fn command(&self) -> &str {
        "mesh"
    }

    fn usage(&self) -> &str {
        MESH_USAGE
    }

    fn convert(&self, groups: Vec<ArgumentGroup>) -> ScanResult<NormalizedScan> {
        self.convert_groups(groups)
            .map_err(|e| e.for_command(self.command(), self.usage()))
    }
}

// =============================================================================
// Centred multi-dimensional scan (cscan, scancn)
// =============================================================================

/// Centred scan with one `(step, n)` pair per input field.
///
/// Each field covers `step * (n - 1)` centred on the current position; the
/// per-field steps are kept as given.
#[derive(Debug, Clone)]
pub struct CenteredScan {
    command: String,
    usage: String,
}

impl CenteredScan {
    /// Centred scan under the given command name
    pub fn new(command: &str) -> Self {
        Self {
            command: command.to_string(),
            usage: format!(
                "{command} axis (step1, n1) [(step2, n2) ...] [axis pos ...] (one pair per input field)"
            ),
        }
    }

    fn convert_groups(&self, mut groups: Vec<ArgumentGroup>) -> ScanResult<NormalizedScan> {
        let Some(leading) = groups.first_mut() else {
            return Err(ScanError::usage("no arguments given"));
        };
        let fields = leading.axis.input_field_count();
        if fields == 0 {
            return Err(ScanError::usage(format!(
                "{} has no input fields to scan",
                leading.axis.name()
            )));
        }
        if leading.params.len() != fields {
            return Err(ScanError::usage(format!(
                "{} has {fields} input field(s) and needs one (step, n) pair each, got {}",
                leading.axis.name(),
                leading.params.len()
            )));
        }

        let mut starts = Vec::with_capacity(fields);
        let mut stops = Vec::with_capacity(fields);
        let mut steps = Vec::with_capacity(fields);
        for param in &leading.params {
            let (step, points) = match param.as_sequence() {
                Some([step, points]) => match step.as_number() {
                    Some(step) => (step, intervals(points, "number of points")?),
                    None => {
                        return Err(ScanError::usage(format!(
                            "step must be a number, got {step}"
                        )))
                    }
                },
                _ => {
                    return Err(ScanError::usage(format!(
                        "expected a (step, n) pair, got {param}"
                    )))
                }
            };
            let span = step * (points - 1.0);
            starts.push(-span / 2.0);
            stops.push(span / 2.0);
            steps.push(step);
        }

        leading.params = vec![
            Position::from_fields(starts).into(),
            Position::from_fields(stops).into(),
            Position::from_fields(steps).into(),
        ];
        Ok(NormalizedScan::new(groups))
    }
}

impl ScanSyntax for CenteredScan {
    fn command(&self) -> &str {
        &self.command
    }

    fn usage(&self) -> &str {
        &self.usage
    }

    fn is_relative(&self) -> bool {
        true
    }

    fn convert(&self, groups: Vec<ArgumentGroup>) -> ScanResult<NormalizedScan> {
        self.convert_groups(groups)
            .map_err(|e| e.for_command(self.command(), self.usage()))
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Registry of scan syntaxes by command name.
pub struct SyntaxRegistry {
    syntaxes: HashMap<String, Arc<dyn ScanSyntax>>,
}

impl Default for SyntaxRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl SyntaxRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            syntaxes: HashMap::new(),
        }
    }

    /// Registry holding every built-in command
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(GenericScan);
        registry.register(AbsoluteScan::ascan());
        registry.register(AbsoluteScan::a2scan());
        registry.register(AbsoluteScan::a3scan());
        registry.register(RelativeScan::dscan());
        registry.register(RelativeScan::d2scan());
        registry.register(RelativeScan::d3scan());
        registry.register(RelativeScan::new("lup", 1));
        registry.register(MeshScan);
        registry.register(CenteredScan::new("cscan"));
        registry.register(CenteredScan::new("scancn"));
        registry
    }

    /// Register a syntax under its command name
    pub fn register<S>(&mut self, syntax: S)
    where
        S: ScanSyntax + 'static,
    {
        self.syntaxes
            .insert(syntax.command().to_string(), Arc::new(syntax));
    }

    /// Look up a syntax
    pub fn get(&self, command: &str) -> Option<Arc<dyn ScanSyntax>> {
        self.syntaxes.get(command).cloned()
    }

    /// Registered command names, sorted
    pub fn commands(&self) -> Vec<String> {
        let mut names: Vec<String> = self.syntaxes.keys().cloned().collect();
        names.sort();
        names
    }
}

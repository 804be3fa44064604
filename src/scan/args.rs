//! Scan arguments and their grouping into per-axis units.
//!
//! A scan command is a flat sequence such as `x 0 10 1 y 5 det`. Every axis
//! opens a new [`ArgumentGroup`]; numbers, lists and tuples are appended to
//! the group of the most recent axis. [`flatten`] is the exact inverse of
//! [`parse`].

use std::fmt;
use std::sync::Arc;

use crate::error::{ScanError, ScanResult};
use crate::hardware::capabilities::{same_axis, Axis};
use crate::scan::position::Position;

/// One element of a scan command.
#[derive(Clone)]
pub enum ScanArg {
    /// A device taking part in the scan
    Axis(Arc<dyn Axis>),
    /// A number
    Number(f64),
    /// A list, typically a vector position or explicit position list
    List(Vec<ScanArg>),
    /// A tuple, e.g. a `(step, n)` pair of a centred scan
    Tuple(Vec<ScanArg>),
    /// Any other token; always rejected by the grouper
    Text(String),
}

impl ScanArg {
    /// Build a list argument from plain numbers
    pub fn list(values: &[f64]) -> Self {
        ScanArg::List(values.iter().copied().map(ScanArg::Number).collect())
    }

    /// Build a tuple argument from plain numbers
    pub fn tuple(values: &[f64]) -> Self {
        ScanArg::Tuple(values.iter().copied().map(ScanArg::Number).collect())
    }

    /// The axis, if this argument is one
    pub fn as_axis(&self) -> Option<&Arc<dyn Axis>> {
        match self {
            ScanArg::Axis(axis) => Some(axis),
            _ => None,
        }
    }

    /// The number, if this argument is one
    pub fn as_number(&self) -> Option<f64> {
        match self {
            ScanArg::Number(value) => Some(*value),
            _ => None,
        }
    }

    /// Elements of a list or tuple
    pub fn as_sequence(&self) -> Option<&[ScanArg]> {
        match self {
            ScanArg::List(items) | ScanArg::Tuple(items) => Some(items),
            _ => None,
        }
    }

    /// True for lists and tuples
    pub fn is_sequence(&self) -> bool {
        self.as_sequence().is_some()
    }

    /// Interpret the argument as a position.
    ///
    /// Numbers become scalars and flat sequences of numbers become vectors.
    /// Nested sequences are rejected rather than guessed at.
    pub fn to_position(&self) -> ScanResult<Position> {
        match self {
            ScanArg::Number(value) => Ok(Position::Scalar(*value)),
            ScanArg::List(items) | ScanArg::Tuple(items) => items
                .iter()
                .map(|item| {
                    item.as_number().ok_or_else(|| {
                        ScanError::usage(format!(
                            "{self} is not a position: vector positions must contain only numbers"
                        ))
                    })
                })
                .collect::<ScanResult<Vec<f64>>>()
                .map(Position::Vector),
            other => Err(ScanError::usage(format!("{other} is not a position"))),
        }
    }
}

impl From<f64> for ScanArg {
    fn from(value: f64) -> Self {
        ScanArg::Number(value)
    }
}

impl From<i32> for ScanArg {
    fn from(value: i32) -> Self {
        ScanArg::Number(f64::from(value))
    }
}

impl From<Vec<f64>> for ScanArg {
    fn from(values: Vec<f64>) -> Self {
        ScanArg::list(&values)
    }
}

impl From<&str> for ScanArg {
    fn from(text: &str) -> Self {
        ScanArg::Text(text.to_string())
    }
}

impl From<Position> for ScanArg {
    fn from(position: Position) -> Self {
        match position {
            Position::Scalar(value) => ScanArg::Number(value),
            Position::Vector(values) => ScanArg::list(&values),
        }
    }
}

impl<T: Axis + 'static> From<Arc<T>> for ScanArg {
    fn from(axis: Arc<T>) -> Self {
        ScanArg::Axis(axis)
    }
}

impl<A: Into<ScanArg>, B: Into<ScanArg>> From<(A, B)> for ScanArg {
    fn from((a, b): (A, B)) -> Self {
        ScanArg::Tuple(vec![a.into(), b.into()])
    }
}

impl PartialEq for ScanArg {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ScanArg::Axis(a), ScanArg::Axis(b)) => same_axis(a, b),
            (ScanArg::Number(a), ScanArg::Number(b)) => a == b,
            (ScanArg::List(a), ScanArg::List(b)) => a == b,
            (ScanArg::Tuple(a), ScanArg::Tuple(b)) => a == b,
            (ScanArg::Text(a), ScanArg::Text(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for ScanArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn join(items: &[ScanArg]) -> String {
            items
                .iter()
                .map(|item| item.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        }
        match self {
            ScanArg::Axis(axis) => write!(f, "{}", axis.name()),
            ScanArg::Number(value) => write!(f, "{value}"),
            ScanArg::List(items) => write!(f, "[{}]", join(items)),
            ScanArg::Tuple(items) => write!(f, "({})", join(items)),
            ScanArg::Text(text) => write!(f, "{text:?}"),
        }
    }
}

impl fmt::Debug for ScanArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanArg::Axis(axis) => write!(f, "Axis({})", axis.name()),
            other => write!(f, "{other}"),
        }
    }
}

/// Build a `Vec<ScanArg>` from axes, numbers, `Vec<f64>` lists and pairs.
///
/// ```rust,ignore
/// let args = scan_args![x.clone(), 1, 10, 9, det.clone()];
/// ```
#[macro_export]
macro_rules! scan_args {
    ($($arg:expr),* $(,)?) => {
        vec![$($crate::scan::args::ScanArg::from($arg)),*]
    };
}

/// An axis followed by the parameters given for it.
#[derive(Clone)]
pub struct ArgumentGroup {
    /// The axis that opened the group
    pub axis: Arc<dyn Axis>,
    /// Numbers, lists and tuples following the axis
    pub params: Vec<ScanArg>,
}

impl ArgumentGroup {
    /// Create a group with no parameters
    pub fn new(axis: Arc<dyn Axis>) -> Self {
        Self {
            axis,
            params: Vec::new(),
        }
    }

    /// Create a group with parameters
    pub fn with_params(axis: Arc<dyn Axis>, params: Vec<ScanArg>) -> Self {
        Self { axis, params }
    }

    /// Number of elements including the axis
    pub fn len(&self) -> usize {
        1 + self.params.len()
    }

    /// A group always holds its axis, so it is never empty
    pub fn is_empty(&self) -> bool {
        false
    }

    /// True when the axis is only read during the scan
    pub fn is_read_only(&self) -> bool {
        self.params.is_empty()
    }
}

impl fmt::Debug for ArgumentGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entry(&format_args!("{}", self.axis.name()))
            .entries(self.params.iter())
            .finish()
    }
}

impl PartialEq for ArgumentGroup {
    fn eq(&self, other: &Self) -> bool {
        same_axis(&self.axis, &other.axis) && self.params == other.params
    }
}

/// Split a flat argument list into per-axis groups in one pass.
///
/// The first argument must be an axis. Any argument that is neither an axis
/// nor a number, list or tuple is rejected with its position.
pub fn parse(args: &[ScanArg]) -> ScanResult<Vec<ArgumentGroup>> {
    let mut groups: Vec<ArgumentGroup> = Vec::new();

    for (index, arg) in args.iter().enumerate() {
        match arg {
            ScanArg::Axis(axis) => groups.push(ArgumentGroup::new(axis.clone())),
            ScanArg::Number(_) | ScanArg::List(_) | ScanArg::Tuple(_) => match groups.last_mut() {
                Some(group) => group.params.push(arg.clone()),
                None => {
                    return Err(ScanError::usage(format!(
                        "the first argument must be an axis, got {arg}"
                    )))
                }
            },
            ScanArg::Text(_) => {
                return Err(ScanError::usage(format!(
                    "argument {} ({arg}) is neither an axis nor a number, list or tuple",
                    index + 1
                )))
            }
        }
    }

    if groups.is_empty() {
        return Err(ScanError::usage("no arguments given"));
    }
    Ok(groups)
}

/// Turn groups back into a flat argument list.
pub fn flatten(groups: &[ArgumentGroup]) -> Vec<ScanArg> {
    let mut flat = Vec::with_capacity(groups.iter().map(ArgumentGroup::len).sum());
    for group in groups {
        flat.push(ScanArg::Axis(group.axis.clone()));
        flat.extend(group.params.iter().cloned());
    }
    flat
}

/// Render a command line such as `dscan x -5 5 10`.
pub fn command_line(command: &str, args: &[ScanArg]) -> String {
    let mut line = command.to_string();
    for arg in args {
        line.push(' ');
        line.push_str(&arg.to_string());
    }
    line
}

//! Axis Capabilities
//!
//! Scan commands never own devices; they hold `Arc<dyn Axis>` references to
//! anything that can report a position, start a move and report whether it
//! is still moving. Whether an argument is an axis is decided by the type of
//! the argument, never by probing an object at runtime.
//!
//! # Design Philosophy
//!
//! Like the other capability traits in this crate, `Axis`:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Uses anyhow::Result for errors
//!
//! # Fields
//!
//! A position has one element per field. The first `input_field_count()`
//! fields are the ones a move sets; the following `extra_field_count()`
//! fields are read-only values reported alongside (a readback, a detector
//! count). Only the input part takes part in relative arithmetic.
//!
//! # Example
//!
//! ```rust,ignore
//! let stage: Arc<dyn Axis> = Arc::new(MockAxis::new("x", 0.0));
//! stage.move_to(Position::Scalar(10.0)).await?;
//! stage.wait_while_busy().await?;
//! assert_eq!(stage.position().await?, Position::Scalar(10.0));
//! ```

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

use crate::scan::position::Position;

/// Capability: a scannable axis.
///
/// # Contract
/// - `move_to` starts a move and may return before it completes
/// - `is_busy` reports whether the last move is still running
/// - `wait_while_busy` blocks until the axis is idle
/// - `position` returns input fields followed by extra fields
#[async_trait]
pub trait Axis: Send + Sync {
    /// Axis name as typed in scan commands
    fn name(&self) -> &str;

    /// Names of the fields a move sets
    fn input_names(&self) -> Vec<String>;

    /// Names of the read-only fields reported after the input fields
    fn extra_names(&self) -> Vec<String> {
        Vec::new()
    }

    /// Number of fields a move sets
    fn input_field_count(&self) -> usize {
        self.input_names().len()
    }

    /// Number of read-only fields
    fn extra_field_count(&self) -> usize {
        self.extra_names().len()
    }

    /// Current position (input fields then extra fields)
    async fn position(&self) -> Result<Position>;

    /// Start moving the input fields to `target`
    async fn move_to(&self, target: Position) -> Result<()>;

    /// Whether a move is still in progress
    async fn is_busy(&self) -> Result<bool>;

    /// Block until the axis is idle
    async fn wait_while_busy(&self) -> Result<()>;

    /// Nested-scan capability, for axes whose read runs a complete scan.
    ///
    /// # Default Implementation
    /// Returns None: an ordinary axis.
    fn nested_scan(&self) -> Option<&dyn NestedScan> {
        None
    }
}

/// Capability: an axis that is itself a scan.
///
/// Reading such an axis (`Axis::position`) runs the inner scan and returns
/// its derived result. The execution engine cannot iterate it point by point,
/// so commands containing one are executed by the secondary orchestrator.
pub trait NestedScan: Send + Sync {
    /// Axes moved by the inner scan
    fn inner_axes(&self) -> Vec<Arc<dyn Axis>>;
}

/// True when the axis exposes the nested-scan capability.
pub fn is_nested_scan(axis: &dyn Axis) -> bool {
    axis.nested_scan().is_some()
}

/// Compare two axis references by identity.
pub fn same_axis(a: &Arc<dyn Axis>, b: &Arc<dyn Axis>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

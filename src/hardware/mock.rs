//! Mock Axis Implementations
//!
//! Simulated axes for tests and the demo binary. All waits use
//! `tokio::time::sleep`, never `std::thread::sleep`.
//!
//! # Available Mocks
//!
//! - `MockAxis` - scalar or multi-field axis with optional move duration,
//!   extra read-only fields, move history and fault injection
//! - `MockNestedScan` - an axis whose read runs a small inner scan

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::{sleep, Duration, Instant};

use crate::hardware::capabilities::{Axis, NestedScan};
use crate::scan::position::Position;

// =============================================================================
// MockAxis - Simulated Motor
// =============================================================================

/// Mock axis with one or more input fields.
///
/// A move updates the position immediately and keeps the axis busy for
/// `move_duration`, so barrier waits are exercised without real hardware.
///
/// # Example
///
/// ```rust,ignore
/// let x = MockAxis::new("x", 100.0);
/// x.move_to(Position::Scalar(95.0)).await?;
/// x.wait_while_busy().await?;
/// assert_eq!(x.position().await?, Position::Scalar(95.0));
/// ```
pub struct MockAxis {
    name: String,
    input_names: Vec<String>,
    extra_names: Vec<String>,
    inputs: RwLock<Vec<f64>>,
    extras: RwLock<Vec<f64>>,
    move_duration: Duration,
    busy_until: RwLock<Option<Instant>>,
    history: RwLock<Vec<Position>>,
    fail_moves: AtomicBool,
}

impl MockAxis {
    /// Create a single-field axis at `initial`
    pub fn new(name: &str, initial: f64) -> Self {
        Self::with_fields(name, &[name], &[initial])
    }

    /// Create a multi-field axis; `initial` holds one value per input name
    pub fn with_fields(name: &str, input_names: &[&str], initial: &[f64]) -> Self {
        Self {
            name: name.to_string(),
            input_names: input_names.iter().map(|s| s.to_string()).collect(),
            extra_names: Vec::new(),
            inputs: RwLock::new(initial.to_vec()),
            extras: RwLock::new(Vec::new()),
            move_duration: Duration::ZERO,
            busy_until: RwLock::new(None),
            history: RwLock::new(Vec::new()),
            fail_moves: AtomicBool::new(false),
        }
    }

    /// Add read-only extra fields reported after the inputs
    pub fn with_extras(mut self, names: &[&str], values: &[f64]) -> Self {
        self.extra_names = names.iter().map(|s| s.to_string()).collect();
        self.extras = RwLock::new(values.to_vec());
        self
    }

    /// Keep the axis busy for `duration` after every move
    pub fn with_move_duration(mut self, duration: Duration) -> Self {
        self.move_duration = duration;
        self
    }

    /// Make every following move fail
    pub fn fail_moves(&self, fail: bool) {
        self.fail_moves.store(fail, Ordering::SeqCst);
    }

    /// Every target this axis was commanded to, in order
    pub async fn history(&self) -> Vec<Position> {
        self.history.read().await.clone()
    }

    /// Current input values
    pub async fn inputs(&self) -> Vec<f64> {
        self.inputs.read().await.clone()
    }

    fn expand_target(&self, target: &Position) -> Result<Vec<f64>> {
        let fields = self.input_names.len();
        match target {
            Position::Scalar(value) => Ok(vec![*value; fields]),
            Position::Vector(values) if values.len() == fields => Ok(values.clone()),
            Position::Vector(values) => Err(anyhow!(
                "{}: target has {} fields, axis has {}",
                self.name,
                values.len(),
                fields
            )),
        }
    }
}

#[async_trait]
impl Axis for MockAxis {
    fn name(&self) -> &str {
        &self.name
    }

    fn input_names(&self) -> Vec<String> {
        self.input_names.clone()
    }

    fn extra_names(&self) -> Vec<String> {
        self.extra_names.clone()
    }

    async fn position(&self) -> Result<Position> {
        let mut values = self.inputs.read().await.clone();
        values.extend(self.extras.read().await.iter().copied());
        Ok(Position::from_fields(values))
    }

    async fn move_to(&self, target: Position) -> Result<()> {
        if self.fail_moves.load(Ordering::SeqCst) {
            bail!("{}: simulated motor fault", self.name);
        }
        let values = self.expand_target(&target)?;
        self.history.write().await.push(target);
        *self.inputs.write().await = values;
        if !self.move_duration.is_zero() {
            *self.busy_until.write().await = Some(Instant::now() + self.move_duration);
        }
        Ok(())
    }

    async fn is_busy(&self) -> Result<bool> {
        Ok(matches!(*self.busy_until.read().await, Some(until) if Instant::now() < until))
    }

    async fn wait_while_busy(&self) -> Result<()> {
        let until = *self.busy_until.read().await;
        if let Some(until) = until {
            let now = Instant::now();
            if now < until {
                sleep(until - now).await;
            }
        }
        Ok(())
    }
}

// =============================================================================
// MockNestedScan - Scan Used As An Axis
// =============================================================================

/// Axis whose read scans `inner` over `offsets` around its current position
/// and returns the mean of the visited positions.
///
/// The inner axis is put back where it started after every read.
pub struct MockNestedScan {
    name: String,
    inner: Arc<dyn Axis>,
    offsets: Vec<f64>,
    runs: AtomicUsize,
}

impl MockNestedScan {
    /// Create a nested scan over `inner`
    pub fn new(name: &str, inner: Arc<dyn Axis>, offsets: &[f64]) -> Self {
        Self {
            name: name.to_string(),
            inner,
            offsets: offsets.to_vec(),
            runs: AtomicUsize::new(0),
        }
    }

    /// Number of inner scans run so far
    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

impl NestedScan for MockNestedScan {
    fn inner_axes(&self) -> Vec<Arc<dyn Axis>> {
        vec![self.inner.clone()]
    }
}

#[async_trait]
impl Axis for MockNestedScan {
    fn name(&self) -> &str {
        &self.name
    }

    fn input_names(&self) -> Vec<String> {
        Vec::new()
    }

    fn extra_names(&self) -> Vec<String> {
        vec![format!("{}_centre", self.name)]
    }

    async fn position(&self) -> Result<Position> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let origin = self.inner.position().await?;
        let mut total = 0.0;
        for offset in &self.offsets {
            self.inner.move_to(origin.map(|v| v + offset)).await?;
            self.inner.wait_while_busy().await?;
            let reached = self.inner.position().await?;
            total += reached.values().first().copied().unwrap_or_default();
        }
        self.inner.move_to(origin).await?;
        self.inner.wait_while_busy().await?;
        let count = self.offsets.len().max(1) as f64;
        Ok(Position::Scalar(total / count))
    }

    async fn move_to(&self, _target: Position) -> Result<()> {
        bail!("{}: a nested scan cannot be moved", self.name)
    }

    async fn is_busy(&self) -> Result<bool> {
        Ok(false)
    }

    async fn wait_while_busy(&self) -> Result<()> {
        Ok(())
    }

    fn nested_scan(&self) -> Option<&dyn NestedScan> {
        Some(self)
    }
}

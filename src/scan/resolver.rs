//! Position sampling, relative-to-absolute resolution and return-to-start.
//!
//! Relative commands describe their bounds as offsets. Before anything moves,
//! [`PositionResolver::sample_initial_positions`] records where every scanned
//! axis is; [`PositionResolver::make_absolute`] then shifts the bounds by those
//! positions, and [`PositionResolver::return_to_initial_positions`] puts the
//! axes back once the scan has ended.

use async_trait::async_trait;
use futures::future::try_join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, instrument};

use crate::error::{ScanError, ScanResult};
use crate::hardware::capabilities::{same_axis, Axis};
use crate::scan::args::{ArgumentGroup, ScanArg};
use crate::scan::position::Position;

/// Default busy-poll interval for barrier waits
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Positions sampled before a scan, input fields only.
///
/// Lives for one invocation. Axes are kept in the order they were first met.
#[derive(Clone, Default)]
pub struct InitialPositions {
    entries: Vec<(Arc<dyn Axis>, Position)>,
}

impl InitialPositions {
    /// Create an empty map
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a position; an axis already present keeps its first sample
    pub fn insert(&mut self, axis: Arc<dyn Axis>, position: Position) {
        if !self.contains(&axis) {
            self.entries.push((axis, position));
        }
    }

    /// Sampled position of `axis`
    pub fn get(&self, axis: &Arc<dyn Axis>) -> Option<&Position> {
        self.entries
            .iter()
            .find(|(known, _)| same_axis(known, axis))
            .map(|(_, position)| position)
    }

    /// True when `axis` was sampled
    pub fn contains(&self, axis: &Arc<dyn Axis>) -> bool {
        self.get(axis).is_some()
    }

    /// Number of sampled axes
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing was sampled
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sampled axes with their positions
    pub fn iter(&self) -> impl Iterator<Item = &(Arc<dyn Axis>, Position)> {
        self.entries.iter()
    }
}

impl std::fmt::Debug for InitialPositions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(
                self.entries
                    .iter()
                    .map(|(axis, position)| (axis.name().to_string(), position.to_string())),
            )
            .finish()
    }
}

/// Injected primitive moving several axes as one operation.
#[async_trait]
pub trait MovePrimitive: Send + Sync {
    /// Move every axis to its target and return once all have stopped
    async fn move_together(&self, targets: &[(Arc<dyn Axis>, Position)]) -> ScanResult<()>;
}

/// Default move primitive: start every move, then barrier-wait.
#[derive(Debug, Clone)]
pub struct ConcurrentMove {
    poll_interval: Duration,
}

impl ConcurrentMove {
    /// Create a mover polling `is_busy` every `poll_interval`
    pub fn new(poll_interval: Duration) -> Self {
        Self { poll_interval }
    }
}

impl Default for ConcurrentMove {
    fn default() -> Self {
        Self::new(DEFAULT_POLL_INTERVAL)
    }
}

#[async_trait]
impl MovePrimitive for ConcurrentMove {
    async fn move_together(&self, targets: &[(Arc<dyn Axis>, Position)]) -> ScanResult<()> {
        // Moves are started in call order; none is awaited to completion here.
        for (axis, target) in targets {
            debug!(axis = axis.name(), %target, "Starting move");
            axis.move_to(target.clone())
                .await
                .map_err(|e| ScanError::device(axis.name(), e))?;
        }
        let axes: Vec<Arc<dyn Axis>> = targets.iter().map(|(axis, _)| axis.clone()).collect();
        wait_until_idle(&axes, self.poll_interval).await
    }
}

/// Poll every axis until none reports busy.
pub async fn wait_until_idle(axes: &[Arc<dyn Axis>], poll_interval: Duration) -> ScanResult<()> {
    loop {
        let busy = try_join_all(axes.iter().map(|axis| async move {
            axis.is_busy()
                .await
                .map_err(|e| ScanError::device(axis.name(), e))
        }))
        .await?;
        if !busy.contains(&true) {
            return Ok(());
        }
        sleep(poll_interval).await;
    }
}

/// Bound parameters of a group that describes motion, if it does.
///
/// `[axis, a, b]` and `[axis, a, b, c]` carry bounds in every parameter but
/// the trailing step; `[axis, [p0, p1, ...]]` carries one bound per entry.
/// A flat list of numbers given to a multi-field axis is a single vector
/// position rather than a list of scalars.
enum Bounds {
    Leading(usize),
    Entries,
    Whole,
}

fn motion_bounds(group: &ArgumentGroup) -> Option<Bounds> {
    match group.len() {
        3 | 4 => Some(Bounds::Leading(group.params.len() - 1)),
        2 => {
            let entries = group.params[0].as_sequence()?;
            let flat = entries.iter().all(|entry| entry.as_number().is_some());
            if flat && group.axis.input_field_count() > 1 {
                Some(Bounds::Whole)
            } else {
                Some(Bounds::Entries)
            }
        }
        _ => None,
    }
}

fn shifted(arg: &ScanArg, offset: &Position) -> ScanResult<ScanArg> {
    Ok(arg.to_position()?.add(offset)?.into())
}

/// Samples, resolves and restores axis positions.
#[derive(Clone)]
pub struct PositionResolver {
    mover: Arc<dyn MovePrimitive>,
    poll_interval: Duration,
}

impl PositionResolver {
    /// Create a resolver restoring positions through `mover`
    pub fn new(mover: Arc<dyn MovePrimitive>) -> Self {
        Self {
            mover,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Set the busy-poll interval used before returning to start
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Record the input-field position of every axis whose group describes
    /// motion. Each axis is read once.
    #[instrument(skip_all, fields(groups = groups.len()))]
    pub async fn sample_initial_positions(
        &self,
        groups: &[ArgumentGroup],
    ) -> ScanResult<InitialPositions> {
        let mut initial = InitialPositions::new();
        for group in groups {
            if motion_bounds(group).is_none() || initial.contains(&group.axis) {
                continue;
            }
            let axis = &group.axis;
            let full = axis
                .position()
                .await
                .map_err(|e| ScanError::device(axis.name(), e))?;
            let position = full.leading(axis.input_field_count())?;
            debug!(axis = axis.name(), %position, "Sampled initial position");
            initial.insert(axis.clone(), position);
        }
        Ok(initial)
    }

    /// Shift every relative bound by its axis's sampled position.
    ///
    /// Steps and groups that do not describe motion are left alone.
    pub fn make_absolute(
        &self,
        mut groups: Vec<ArgumentGroup>,
        initial: &InitialPositions,
    ) -> ScanResult<Vec<ArgumentGroup>> {
        for group in &mut groups {
            let Some(bounds) = motion_bounds(group) else {
                continue;
            };
            let Some(offset) = initial.get(&group.axis) else {
                continue;
            };
            match bounds {
                Bounds::Leading(count) => {
                    for param in group.params.iter_mut().take(count) {
                        *param = shifted(param, offset)?;
                    }
                }
                Bounds::Whole => {
                    group.params[0] = shifted(&group.params[0], offset)?;
                }
                Bounds::Entries => {
                    let entries = group.params[0].as_sequence().unwrap_or_default();
                    let absolute = entries
                        .iter()
                        .map(|entry| shifted(entry, offset))
                        .collect::<ScanResult<Vec<ScanArg>>>()?;
                    group.params[0] = match group.params[0] {
                        ScanArg::Tuple(_) => ScanArg::Tuple(absolute),
                        _ => ScanArg::List(absolute),
                    };
                }
            }
        }
        Ok(groups)
    }

    /// Wait for every sampled axis to go idle, then move them all back in one
    /// combined move.
    #[instrument(skip_all, fields(axes = initial.len()))]
    pub async fn return_to_initial_positions(&self, initial: &InitialPositions) -> ScanResult<()> {
        if initial.is_empty() {
            return Ok(());
        }
        let axes: Vec<Arc<dyn Axis>> = initial.iter().map(|(axis, _)| axis.clone()).collect();
        wait_until_idle(&axes, self.poll_interval).await?;

        let targets: Vec<(Arc<dyn Axis>, Position)> = initial.iter().cloned().collect();
        info!(?initial, "Returning axes to their initial positions");
        self.mover.move_together(&targets).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::MockAxis;
    use crate::scan::args::parse;
    use crate::scan_args;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingMove {
        calls: AtomicUsize,
        inner: ConcurrentMove,
    }

    #[async_trait]
    impl MovePrimitive for CountingMove {
        async fn move_together(&self, targets: &[(Arc<dyn Axis>, Position)]) -> ScanResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.move_together(targets).await
        }
    }

    fn resolver() -> PositionResolver {
        PositionResolver::new(Arc::new(ConcurrentMove::new(Duration::from_millis(1))))
    }

    #[tokio::test]
    async fn test_make_absolute_shifts_bounds_not_step() {
        let a = Arc::new(MockAxis::with_fields("a", &["a"], &[0.1]));
        let groups = parse(&scan_args![a.clone(), 1, 2, 3]).unwrap();
        let resolver = resolver();

        let initial = resolver.sample_initial_positions(&groups).await.unwrap();
        let groups = resolver.make_absolute(groups, &initial).unwrap();

        let values: Vec<f64> = groups[0]
            .params
            .iter()
            .map(|p| p.as_number().unwrap())
            .collect();
        assert!((values[0] - 1.1).abs() < 1e-12);
        assert!((values[1] - 2.1).abs() < 1e-12);
        assert_eq!(values[2], 3.0);
    }

    #[tokio::test]
    async fn test_sampling_skips_non_motion_groups_and_extra_fields() {
        let kb = Arc::new(
            MockAxis::with_fields("kb", &["pitch", "roll"], &[1.0, 2.0])
                .with_extras(&["temp"], &[20.0]),
        );
        let det = Arc::new(MockAxis::new("det", 5.0));
        let fixed = Arc::new(MockAxis::new("fixed", 7.0));
        let groups = parse(&scan_args![
            kb.clone(),
            vec![0.0, 0.0],
            vec![1.0, 1.0],
            vec![0.5, 0.5],
            det.clone(),
            fixed.clone(),
            3
        ])
        .unwrap();

        let initial = resolver().sample_initial_positions(&groups).await.unwrap();
        assert_eq!(initial.len(), 1);
        let kb_dyn: Arc<dyn Axis> = kb;
        assert_eq!(initial.get(&kb_dyn), Some(&Position::Vector(vec![1.0, 2.0])));
    }

    #[tokio::test]
    async fn test_list_entries_are_each_shifted() {
        let a = Arc::new(MockAxis::new("a", 10.0));
        let resolver = resolver();
        let groups = parse(&scan_args![a.clone(), vec![-1.0, 0.0, 1.0]]).unwrap();
        let initial = resolver.sample_initial_positions(&groups).await.unwrap();
        let groups = resolver.make_absolute(groups, &initial).unwrap();
        assert_eq!(groups[0].params, vec![ScanArg::list(&[9.0, 10.0, 11.0])]);
    }

    #[tokio::test]
    async fn test_vector_axis_fixed_position_is_shifted_once() {
        let kb = Arc::new(MockAxis::with_fields("kb", &["pitch", "roll"], &[1.0, 2.0]));
        let resolver = resolver();
        let groups = parse(&scan_args![kb.clone(), vec![0.5, -0.5]]).unwrap();
        let initial = resolver.sample_initial_positions(&groups).await.unwrap();
        let groups = resolver.make_absolute(groups, &initial).unwrap();
        assert_eq!(groups[0].params, vec![ScanArg::list(&[1.5, 1.5])]);
    }

    #[tokio::test]
    async fn test_nested_offsets_fail_fast() {
        let a = Arc::new(MockAxis::new("a", 0.0));
        let nested = ScanArg::List(vec![ScanArg::List(vec![ScanArg::list(&[1.0])])]);
        let groups = parse(&[ScanArg::from(a.clone()), nested]).unwrap();
        let resolver = resolver();
        let initial = resolver.sample_initial_positions(&groups).await.unwrap();
        assert!(resolver.make_absolute(groups, &initial).unwrap_err().is_usage());
    }

    #[tokio::test]
    async fn test_return_issues_one_combined_move() {
        let a = Arc::new(MockAxis::new("a", 1.0));
        let b = Arc::new(MockAxis::new("b", 2.0));
        let mover = Arc::new(CountingMove {
            calls: AtomicUsize::new(0),
            inner: ConcurrentMove::new(Duration::from_millis(1)),
        });
        let resolver = PositionResolver::new(mover.clone());
        let groups = parse(&scan_args![a.clone(), 0, 1, 1, b.clone(), 0, 1]).unwrap();
        let initial = resolver.sample_initial_positions(&groups).await.unwrap();

        a.move_to(Position::Scalar(5.0)).await.unwrap();
        b.move_to(Position::Scalar(6.0)).await.unwrap();
        resolver.return_to_initial_positions(&initial).await.unwrap();

        assert_eq!(mover.calls.load(Ordering::SeqCst), 1);
        assert_eq!(a.inputs().await, vec![1.0]);
        assert_eq!(b.inputs().await, vec![2.0]);
    }

    #[tokio::test]
    async fn test_concurrent_move_waits_for_slowest_axis() {
        let fast: Arc<dyn Axis> = Arc::new(MockAxis::new("fast", 0.0));
        let slow: Arc<dyn Axis> =
            Arc::new(MockAxis::new("slow", 0.0).with_move_duration(Duration::from_millis(40)));
        let mover = ConcurrentMove::new(Duration::from_millis(5));

        mover
            .move_together(&[
                (fast.clone(), Position::Scalar(1.0)),
                (slow.clone(), Position::Scalar(2.0)),
            ])
            .await
            .unwrap();
        assert!(!slow.is_busy().await.unwrap());
    }

    #[tokio::test]
    async fn test_device_failure_names_axis() {
        let a = Arc::new(MockAxis::new("a", 0.0));
        a.fail_moves(true);
        let err = ConcurrentMove::default()
            .move_together(&[(a as Arc<dyn Axis>, Position::Scalar(1.0))])
            .await
            .unwrap_err();
        assert!(matches!(err, ScanError::Device { ref axis, .. } if axis == "a"));
    }
}

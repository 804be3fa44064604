//! Scan command execution.
//!
//! [`ScanCommand`] is the entry point a console binds to a command name such
//! as `dscan`. One invocation runs the whole pipeline:
//!
//! ```text
//! args ─> parse ─> convert ─> [sample + make absolute] ─> flatten ─> engine
//!                                                                      │
//!        listeners <─ [return to start] <─ Completed / Halted / Failed <┘
//! ```
//!
//! Commands containing a nested-scan axis are handed to
//! [`SecondaryScan`](crate::scan::secondary::SecondaryScan) instead of the
//! engine.
//!
//! # State Machine
//!
//! ```text
//! Idle ──invoke──> Prepared ──submit──> Running ──> Completed ──┐
//!   ▲                                      ├──────> Halted ─────┤
//!   │                                      └──────> Failed ─────┤
//!   └───────────────────────────────────────────────────────────┘
//! ```

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::ScanConfig;
use crate::error::{ScanError, ScanResult};
use crate::hardware::capabilities::{is_nested_scan, Axis};
use crate::scan::args::{command_line, flatten, parse, ArgumentGroup, ScanArg};
use crate::scan::engine::{
    DataWriter, HaltSignal, PlotSettings, RunOutcome, ScanEngine, ScanHandle, ScanRequest,
};
use crate::scan::listener::{ListenerOutput, RunMetadataSink, ScanListener};
use crate::scan::resolver::{
    ConcurrentMove, InitialPositions, MovePrimitive, PositionResolver, DEFAULT_POLL_INTERVAL,
};
use crate::scan::secondary::{SecondaryScan, DEFAULT_REPLAY_AXIS_NAME};
use crate::scan::syntax::ScanSyntax;

/// Lifecycle of a scan command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanState {
    /// Ready for an invocation
    Idle,
    /// Listeners notified, arguments being compiled
    Prepared,
    /// The engine is running the scan
    Running,
    /// The scan visited every point
    Completed,
    /// The user stopped the scan
    Halted,
    /// The scan ended with an error
    Failed,
}

impl std::fmt::Display for ScanState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScanState::Idle => write!(f, "Idle"),
            ScanState::Prepared => write!(f, "Prepared"),
            ScanState::Running => write!(f, "Running"),
            ScanState::Completed => write!(f, "Completed"),
            ScanState::Halted => write!(f, "Halted"),
            ScanState::Failed => write!(f, "Failed"),
        }
    }
}

impl ScanState {
    /// Check if the state allows a new invocation.
    pub fn can_begin(&self) -> bool {
        matches!(self, ScanState::Idle)
    }
}

impl From<RunOutcome> for ScanState {
    fn from(outcome: RunOutcome) -> Self {
        match outcome {
            RunOutcome::Completed => ScanState::Completed,
            RunOutcome::Halted => ScanState::Halted,
        }
    }
}

/// What an invocation returns when it did not fail.
pub struct ScanReport {
    /// How the run ended
    pub outcome: RunOutcome,
    /// Results contributed by listeners
    pub results: ListenerOutput,
    /// The finished run
    pub handle: Box<dyn ScanHandle>,
}

impl ScanReport {
    /// Writer holding the run's data
    pub fn data_writer(&self) -> Option<Arc<dyn DataWriter>> {
        self.handle.data_writer()
    }

    /// Every axis that took part
    pub fn all_scannables(&self) -> Vec<Arc<dyn Axis>> {
        self.handle.all_scannables()
    }

    /// Detectors read at each point
    pub fn detectors(&self) -> Vec<String> {
        self.handle.detectors()
    }

    /// Plot settings attached to the run
    pub fn plot_settings(&self) -> Option<PlotSettings> {
        self.handle.plot_settings()
    }
}

impl std::fmt::Debug for ScanReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanReport")
            .field("outcome", &self.outcome)
            .field("results", &self.results)
            .finish_non_exhaustive()
    }
}

/// A scan command bound to its syntax, engine and move primitive.
///
/// # Example
///
/// ```rust,ignore
/// let dscan = ScanCommand::new(
///     Arc::new(RelativeScan::dscan()),
///     engine.clone(),
///     Arc::new(ConcurrentMove::default()),
/// )
/// .with_listener(Arc::new(DataLocationListener));
///
/// let report = dscan.invoke(scan_args![x.clone(), -5, 5, 10]).await?;
/// assert_eq!(report.outcome, RunOutcome::Completed);
/// ```
pub struct ScanCommand {
    syntax: Arc<dyn ScanSyntax>,
    engine: Arc<dyn ScanEngine>,
    mover: Arc<dyn MovePrimitive>,
    resolver: PositionResolver,
    listeners: Vec<Arc<dyn ScanListener>>,
    metadata: Option<Arc<dyn RunMetadataSink>>,
    poll_interval: Duration,
    replay_axis_name: String,
    halt: HaltSignal,
    state: Mutex<ScanState>,
}

impl ScanCommand {
    /// Create a command.
    ///
    /// # Arguments
    ///
    /// * `syntax` - Grammar of the command
    /// * `engine` - Execution engine scans are submitted to
    /// * `mover` - Combined move used to return axes and in point-by-point scans
    pub fn new(
        syntax: Arc<dyn ScanSyntax>,
        engine: Arc<dyn ScanEngine>,
        mover: Arc<dyn MovePrimitive>,
    ) -> Self {
        Self {
            syntax,
            engine,
            resolver: PositionResolver::new(mover.clone()),
            mover,
            listeners: Vec::new(),
            metadata: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            replay_axis_name: DEFAULT_REPLAY_AXIS_NAME.to_string(),
            halt: HaltSignal::new(),
            state: Mutex::new(ScanState::Idle),
        }
    }

    /// Create a command whose timing and naming come from configuration.
    pub fn from_config(
        syntax: Arc<dyn ScanSyntax>,
        engine: Arc<dyn ScanEngine>,
        config: &ScanConfig,
    ) -> Self {
        let poll_interval = config.motion.poll_interval();
        Self::new(syntax, engine, Arc::new(ConcurrentMove::new(poll_interval)))
            .with_poll_interval(poll_interval)
            .with_replay_axis_name(&config.secondary.replay_axis_name)
    }

    /// Register a listener; listeners are notified in registration order
    pub fn with_listener(mut self, listener: Arc<dyn ScanListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Record each command line in `sink`
    pub fn with_metadata_sink(mut self, sink: Arc<dyn RunMetadataSink>) -> Self {
        self.metadata = Some(sink);
        self
    }

    /// Busy-poll interval for barrier waits
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self.resolver = self.resolver.with_poll_interval(poll_interval);
        self
    }

    /// Name of the axis replaying point-by-point results
    pub fn with_replay_axis_name(mut self, name: &str) -> Self {
        self.replay_axis_name = name.to_string();
        self
    }

    /// Command name
    pub fn command(&self) -> &str {
        self.syntax.command()
    }

    /// Usage pattern
    pub fn usage(&self) -> &str {
        self.syntax.usage()
    }

    /// Current lifecycle state
    pub fn state(&self) -> ScanState {
        *self.lock_state()
    }

    /// Request a user halt of the running invocation.
    ///
    /// The scan stops at the next point; collected data is kept and the
    /// invocation returns [`RunOutcome::Halted`].
    pub fn halt(&self) {
        info!(command = self.command(), "Halt requested");
        self.halt.request();
    }

    /// Halt signal shared with the engine, e.g. for a Ctrl-C handler
    pub fn halt_signal(&self) -> HaltSignal {
        self.halt.clone()
    }

    /// Run the command.
    ///
    /// A single list or tuple argument is unwrapped, so `invoke(vec![list])`
    /// and `invoke(items)` are equivalent.
    ///
    /// # Errors
    ///
    /// - [`ScanError::NotIdle`] if a previous invocation is still in progress
    /// - [`ScanError::Usage`] before any motion
    /// - [`ScanError::Device`] if an axis fails outside the engine
    /// - [`ScanError::ExecutionFailed`] if the engine fails; axes of a relative
    ///   scan have been returned to start by then
    ///
    /// # Cancellation
    ///
    /// Dropping the returned future (a timeout, a `select!`, an aborted task)
    /// still returns the command to [`ScanState::Idle`]. If a relative scan
    /// was running, the return to start is spawned on the current runtime.
    #[instrument(
        skip_all,
        fields(scan_type = %self.syntax.command(), invocation_id = %Uuid::new_v4())
    )]
    pub async fn invoke(&self, args: Vec<ScanArg>) -> ScanResult<ScanReport> {
        let mut invocation = self.begin()?;
        self.execute(args, &mut invocation).await
    }

    fn begin(&self) -> ScanResult<Invocation<'_>> {
        let mut state = self.lock_state();
        if !state.can_begin() {
            return Err(ScanError::NotIdle(*state));
        }
        *state = ScanState::Prepared;
        Ok(Invocation {
            command: self,
            pending_restore: None,
        })
    }

    async fn execute(
        &self,
        args: Vec<ScanArg>,
        invocation: &mut Invocation<'_>,
    ) -> ScanResult<ScanReport> {
        self.halt.reset();
        let args = unwrap_single(args);

        for listener in &self.listeners {
            listener.prepare_for_scan(&args);
        }
        let line = command_line(self.command(), &args);
        if let Some(sink) = &self.metadata {
            sink.record("command", &line);
            sink.record("scan_type", self.command());
        }
        info!(command_line = %line, "Starting scan");

        let (groups, count_time, initial) = match self.compile(&args).await {
            Ok(compiled) => compiled,
            Err(e) => return Err(self.fail(e)),
        };

        if groups.iter().any(|group| is_nested_scan(group.axis.as_ref())) {
            info!("Command contains a nested scan; running it point by point");
            let secondary =
                SecondaryScan::new(self.engine.clone(), self.mover.clone(), self.halt.clone())
                    .with_poll_interval(self.poll_interval)
                    .with_replay_axis_name(&self.replay_axis_name);
            self.set_state(ScanState::Running);
            let handle = match secondary.execute(&line, &groups, count_time).await {
                Ok(handle) => handle,
                Err(e) => return Err(self.fail(e.for_command(self.command(), self.usage()))),
            };
            return self.run_handle(handle, &groups, invocation).await;
        }

        let request = ScanRequest {
            command: line,
            args: flatten(&groups),
            count_time,
            halt: self.halt.clone(),
        };
        debug!(args = ?request.args, "Submitting scan");
        let handle = match self.engine.submit(request).await {
            Ok(handle) => handle,
            Err(e) => return Err(self.fail(ScanError::ExecutionFailed(e))),
        };
        invocation.pending_restore = initial;
        self.set_state(ScanState::Running);
        self.run_handle(handle, &groups, invocation).await
    }

    /// Parse, convert and (for relative commands) resolve the arguments.
    /// Nothing moves here.
    async fn compile(
        &self,
        args: &[ScanArg],
    ) -> ScanResult<(Vec<ArgumentGroup>, Option<f64>, Option<InitialPositions>)> {
        let (command, usage) = (self.command(), self.usage());
        let groups = parse(args).map_err(|e| e.for_command(command, usage))?;
        let normalized = self.syntax.convert(groups)?;

        if !self.syntax.is_relative() {
            return Ok((normalized.groups, normalized.count_time, None));
        }
        let initial = self
            .resolver
            .sample_initial_positions(&normalized.groups)
            .await?;
        let groups = self
            .resolver
            .make_absolute(normalized.groups, &initial)
            .map_err(|e| e.for_command(command, usage))?;
        Ok((groups, normalized.count_time, Some(initial)))
    }

    async fn run_handle(
        &self,
        mut handle: Box<dyn ScanHandle>,
        groups: &[ArgumentGroup],
        invocation: &mut Invocation<'_>,
    ) -> ScanResult<ScanReport> {
        handle.set_plot_settings(PlotSettings::from_groups(groups));
        let run = handle.run().await;

        match &run {
            Ok(RunOutcome::Completed) => info!("Scan complete"),
            Ok(RunOutcome::Halted) => info!("Scan halted by user; collected data kept"),
            Err(e) => error!(error = %e, "Scan failed"),
        }

        if let Some(initial) = &invocation.pending_restore {
            // Never masks the run's own outcome.
            if let Err(e) = self.resolver.return_to_initial_positions(initial).await {
                warn!(error = %e, "Failed to return axes to their initial positions");
            }
            invocation.pending_restore = None;
        }

        let mut results = Vec::new();
        for listener in &self.listeners {
            if let Some(result) = listener.update(handle.as_ref()).await {
                results.push(result);
            }
        }
        let results = ListenerOutput::from_results(results);

        match run {
            Ok(outcome) => {
                self.set_state(outcome.into());
                Ok(ScanReport {
                    outcome,
                    results,
                    handle,
                })
            }
            Err(e) => Err(self.fail(ScanError::ExecutionFailed(e))),
        }
    }

    fn fail(&self, err: ScanError) -> ScanError {
        if !err.is_usage() {
            self.set_state(ScanState::Failed);
        }
        err
    }

    fn set_state(&self, next: ScanState) {
        let mut state = self.lock_state();
        let previous = *state;
        debug!(from = %previous, to = %next, "Scan state transition");
        *state = next;
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, ScanState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// One running invocation. Dropping it, on any path, returns the command to
/// [`ScanState::Idle`].
struct Invocation<'a> {
    command: &'a ScanCommand,
    /// Start positions of a relative scan not yet returned to
    pending_restore: Option<InitialPositions>,
}

impl Drop for Invocation<'_> {
    fn drop(&mut self) {
        if let Some(initial) = self.pending_restore.take() {
            let axes: Vec<String> = initial
                .iter()
                .map(|(axis, _)| axis.name().to_string())
                .collect();
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    warn!(?axes, "Scan cancelled; returning axes to their initial positions");
                    let resolver = self.command.resolver.clone();
                    runtime.spawn(async move {
                        if let Err(e) = resolver.return_to_initial_positions(&initial).await {
                            warn!(error = %e, "Failed to return axes to their initial positions");
                        }
                    });
                }
                Err(_) => {
                    warn!(?axes, "Scan cancelled outside a runtime; axes left where they stopped");
                }
            }
        }
        self.command.set_state(ScanState::Idle);
    }
}

fn unwrap_single(mut args: Vec<ScanArg>) -> Vec<ScanArg> {
    if args.len() == 1 && args[0].is_sequence() {
        if let Some(ScanArg::List(items) | ScanArg::Tuple(items)) = args.pop() {
            return items;
        }
    }
    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::MockAxis;
    use crate::scan::listener::RunMetadata;
    use crate::scan::simulated::SimulatedEngine;
    use crate::scan::syntax::{AbsoluteScan, RelativeScan};
    use crate::scan_args;

    fn command(syntax: Arc<dyn ScanSyntax>, engine: Arc<SimulatedEngine>) -> ScanCommand {
        ScanCommand::new(
            syntax,
            engine,
            Arc::new(ConcurrentMove::new(Duration::from_millis(1))),
        )
        .with_poll_interval(Duration::from_millis(1))
    }

    #[test]
    fn test_unwrap_single_sequence() {
        let wrapped = vec![ScanArg::List(scan_args![1, 2, 3])];
        assert_eq!(unwrap_single(wrapped), scan_args![1, 2, 3]);

        let plain = scan_args![1, 2];
        assert_eq!(unwrap_single(plain.clone()), plain);
    }

    #[test]
    fn test_state_display_and_begin() {
        assert!(ScanState::Idle.can_begin());
        assert!(!ScanState::Running.can_begin());
        assert_eq!(ScanState::Halted.to_string(), "Halted");
        assert_eq!(ScanState::from(RunOutcome::Completed), ScanState::Completed);
    }

    #[tokio::test]
    async fn test_invoke_records_command_line_and_returns_to_idle() {
        let engine = Arc::new(SimulatedEngine::new());
        let metadata = RunMetadata::new();
        let x = Arc::new(MockAxis::new("x", 0.0));
        let ascan = command(Arc::new(AbsoluteScan::ascan()), engine.clone())
            .with_metadata_sink(Arc::new(metadata.clone()));

        let report = ascan.invoke(scan_args![x.clone(), 0, 2, 2]).await.unwrap();

        assert_eq!(report.outcome, RunOutcome::Completed);
        assert!(report.results.is_nothing());
        assert_eq!(metadata.get("command").as_deref(), Some("ascan x 0 2 2"));
        assert_eq!(metadata.get("scan_type").as_deref(), Some("ascan"));
        assert_eq!(ascan.state(), ScanState::Idle);
    }

    #[tokio::test]
    async fn test_usage_error_never_moves_axes() {
        let engine = Arc::new(SimulatedEngine::new());
        let x = Arc::new(MockAxis::new("x", 3.0));
        let dscan = command(Arc::new(RelativeScan::dscan()), engine.clone());

        let err = dscan.invoke(scan_args![x.clone(), -1, 1]).await.unwrap_err();

        assert!(err.is_usage());
        assert!(err.to_string().contains("dscan axis start stop n"), "{err}");
        assert!(x.history().await.is_empty());
        assert_eq!(engine.submitted().len(), 0);
        assert_eq!(dscan.state(), ScanState::Idle);
    }

    #[tokio::test]
    async fn test_invoke_while_running_is_rejected() {
        let engine = Arc::new(SimulatedEngine::new().with_point_delay(Duration::from_millis(20)));
        let x = Arc::new(MockAxis::new("x", 0.0));
        let ascan = Arc::new(command(Arc::new(AbsoluteScan::ascan()), engine));

        let running = {
            let ascan = ascan.clone();
            let x = x.clone();
            tokio::spawn(async move { ascan.invoke(scan_args![x, 0, 5, 5]).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;

        let err = ascan.invoke(scan_args![x, 0, 1, 1]).await.unwrap_err();
        assert!(matches!(err, ScanError::NotIdle(ScanState::Running)));

        assert!(running.await.unwrap().is_ok());
        assert_eq!(ascan.state(), ScanState::Idle);
    }

    #[tokio::test]
    async fn test_cancelled_invoke_returns_to_idle_and_start() {
        let engine = Arc::new(SimulatedEngine::new().with_point_delay(Duration::from_millis(50)));
        let x = Arc::new(MockAxis::new("x", 100.0));
        let dscan = command(Arc::new(RelativeScan::dscan()), engine);

        let cancelled = tokio::time::timeout(
            Duration::from_millis(80),
            dscan.invoke(scan_args![x.clone(), -5, 5, 10]),
        )
        .await;
        assert!(cancelled.is_err());
        assert_eq!(dscan.state(), ScanState::Idle);

        // The return to start runs on a spawned task.
        for _ in 0..200 {
            if x.position().await.unwrap().as_scalar() == Some(100.0) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(x.position().await.unwrap().as_scalar(), Some(100.0));

        let report = dscan.invoke(scan_args![x.clone(), -1, 1, 2]).await.unwrap();
        assert_eq!(report.outcome, RunOutcome::Completed);
        assert_eq!(x.position().await.unwrap().as_scalar(), Some(100.0));
        assert_eq!(dscan.state(), ScanState::Idle);
    }
}

//! End-to-end tests of scan commands against simulated axes and the
//! in-process engine.
//!
//! Every test runs the full pipeline: grouping, conversion, relative
//! resolution, submission, return to start and listener collection.

use async_trait::async_trait;
use daq_scan::prelude::*;
use daq_scan::scan::{
    DataLocationListener, HaltSignal, ListenerOutput, PlotSettings, ScanArg, ScanHandle,
    ScanListener,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

fn command(syntax: Arc<dyn daq_scan::scan::ScanSyntax>, engine: Arc<SimulatedEngine>) -> ScanCommand {
    ScanCommand::new(
        syntax,
        engine,
        Arc::new(ConcurrentMove::new(Duration::from_millis(1))),
    )
    .with_poll_interval(Duration::from_millis(1))
}

fn numbers(args: &[ScanArg]) -> Vec<f64> {
    args.iter().filter_map(ScanArg::as_number).collect()
}

#[tokio::test]
async fn test_dscan_scans_around_start_and_returns() {
    let engine = Arc::new(SimulatedEngine::new());
    let a = Arc::new(MockAxis::new("a", 100.0));
    let dscan = command(Arc::new(RelativeScan::dscan()), engine.clone());

    let report = dscan.invoke(scan_args![a.clone(), -5, 5, 10]).await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Completed);
    let submitted = engine.submitted();
    assert_eq!(submitted.len(), 1);
    assert_eq!(numbers(&submitted[0].args), vec![95.0, 105.0, 1.0]);

    let rows = engine.last_writer().unwrap().rows();
    assert_eq!(rows.len(), 11);
    assert_eq!(rows.first().unwrap(), &vec![95.0]);
    assert_eq!(rows.last().unwrap(), &vec![105.0]);

    assert_eq!(a.inputs().await, vec![100.0]);
    assert_eq!(dscan.state(), ScanState::Idle);
}

#[tokio::test]
async fn test_halted_relative_scan_keeps_data_and_returns() {
    let engine = Arc::new(SimulatedEngine::new().halt_after(3));
    let a = Arc::new(MockAxis::new("a", 100.0));
    let dscan = command(Arc::new(RelativeScan::dscan()), engine.clone());

    let report = dscan.invoke(scan_args![a.clone(), -5, 5, 10]).await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Halted);
    assert_eq!(engine.last_writer().unwrap().rows().len(), 3);
    assert_eq!(a.inputs().await, vec![100.0]);

    // A halt does not leak into the next invocation.
    let engine = Arc::new(SimulatedEngine::new());
    let ascan = command(Arc::new(AbsoluteScan::ascan()), engine.clone());
    ascan.halt_signal().request();
    let report = ascan.invoke(scan_args![a.clone(), 0, 1, 1]).await.unwrap();
    assert_eq!(report.outcome, RunOutcome::Completed);
}

#[tokio::test]
async fn test_engine_failure_still_returns_axes() {
    let engine = Arc::new(SimulatedEngine::new().fail_after(2));
    let a = Arc::new(MockAxis::new("a", 100.0));
    let b = Arc::new(MockAxis::new("b", -3.0));
    let d2scan = command(Arc::new(RelativeScan::d2scan()), engine.clone());

    let err = d2scan
        .invoke(scan_args![a.clone(), -1, 1, b.clone(), 2, 0, 4])
        .await
        .unwrap_err();

    assert!(matches!(err, ScanError::ExecutionFailed(_)), "{err}");
    assert!(!err.is_usage());
    assert_eq!(a.inputs().await, vec![100.0]);
    assert_eq!(b.inputs().await, vec![-3.0]);
    assert_eq!(d2scan.state(), ScanState::Idle);
}

#[tokio::test]
async fn test_absolute_scan_leaves_axes_at_the_end() {
    let engine = Arc::new(SimulatedEngine::new());
    let a = Arc::new(MockAxis::new("a", 100.0));
    let ascan = command(Arc::new(AbsoluteScan::ascan()), engine.clone());

    ascan.invoke(scan_args![a.clone(), 0, 4, 4]).await.unwrap();

    assert_eq!(a.inputs().await, vec![4.0]);
}

#[tokio::test]
async fn test_a2scan_moves_follower_in_lock_step() {
    let engine = Arc::new(SimulatedEngine::new());
    let x = Arc::new(MockAxis::new("x", 0.0));
    let y = Arc::new(MockAxis::new("y", 0.0));
    let a2scan = command(Arc::new(AbsoluteScan::a2scan()), engine.clone());

    a2scan
        .invoke(scan_args![x.clone(), 0, 2, y.clone(), 10, 6, 2])
        .await
        .unwrap();

    let rows = engine.last_writer().unwrap().rows();
    assert_eq!(rows, vec![vec![0.0, 10.0], vec![1.0, 8.0], vec![2.0, 6.0]]);
}

#[tokio::test]
async fn test_cscan_centres_on_current_position() {
    let engine = Arc::new(SimulatedEngine::new());
    let x = Arc::new(MockAxis::new("x", 10.0));
    let cscan = command(Arc::new(CenteredScan::new("cscan")), engine.clone());

    let report = cscan.invoke(scan_args![x.clone(), (0.5, 11)]).await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Completed);
    let rows = engine.last_writer().unwrap().rows();
    assert_eq!(rows.len(), 11);
    assert_eq!(rows[0], vec![7.5]);
    assert_eq!(rows[10], vec![12.5]);
    assert_eq!(x.inputs().await, vec![10.0]);
}

#[tokio::test]
async fn test_mesh_nests_second_axis_and_passes_count_time() {
    let engine = Arc::new(SimulatedEngine::new());
    let x = Arc::new(MockAxis::new("x", 0.0));
    let y = Arc::new(MockAxis::new("y", 0.0));
    let mesh = command(Arc::new(MeshScan), engine.clone());

    mesh.invoke(scan_args![x.clone(), 0, 1, 2, y.clone(), 0, 1, 2, 0.1])
        .await
        .unwrap();

    let submitted = engine.submitted();
    assert_eq!(submitted[0].count_time, Some(0.1));
    assert_eq!(
        numbers(&submitted[0].args),
        vec![0.0, 1.0, 0.5, 0.0, 1.0, 0.5]
    );
    assert_eq!(engine.last_writer().unwrap().rows().len(), 9);
}

#[tokio::test]
async fn test_single_list_argument_is_unwrapped() {
    let engine = Arc::new(SimulatedEngine::new());
    let x = Arc::new(MockAxis::new("x", 0.0));
    let ascan = command(Arc::new(AbsoluteScan::ascan()), engine.clone());

    ascan
        .invoke(vec![ScanArg::List(scan_args![x.clone(), 0, 1, 1])])
        .await
        .unwrap();

    assert_eq!(engine.last_writer().unwrap().rows().len(), 2);
}

#[tokio::test]
async fn test_usage_errors_name_the_command() {
    let engine = Arc::new(SimulatedEngine::new());
    let x = Arc::new(MockAxis::new("x", 0.0));
    let mesh = command(Arc::new(MeshScan), engine.clone());

    let err = mesh
        .invoke(scan_args![x.clone(), 0, 1, 2])
        .await
        .unwrap_err();

    assert!(err.is_usage());
    assert!(err.to_string().contains("mesh"), "{err}");
    assert!(engine.submitted().is_empty());

    let err = mesh.invoke(scan_args![1, x.clone()]).await.unwrap_err();
    assert!(err.is_usage());
}

#[tokio::test]
async fn test_plot_settings_follow_first_and_last_axis() {
    let engine = Arc::new(SimulatedEngine::new());
    let x = Arc::new(MockAxis::new("x", 0.0));
    let det = Arc::new(MockAxis::new("det", 0.0).with_extras(&["counts"], &[42.0]));
    let ascan = command(Arc::new(AbsoluteScan::ascan()), engine.clone());

    let report = ascan
        .invoke(scan_args![x.clone(), 0, 1, 1, det.clone()])
        .await
        .unwrap();

    assert_eq!(
        report.plot_settings(),
        Some(PlotSettings {
            x: Some("x".to_string()),
            y: vec!["counts".to_string()],
        })
    );
}

#[tokio::test]
async fn test_scan_of_nested_scan_runs_point_by_point() {
    let engine = Arc::new(SimulatedEngine::new());
    let x = Arc::new(MockAxis::new("x", 0.0));
    let y = Arc::new(MockAxis::new("y", 5.0));
    let peak = Arc::new(MockNestedScan::new("peak", y.clone(), &[-1.0, 0.0, 1.0]));
    let scan = command(Arc::new(GenericScan), engine.clone());

    let report = scan
        .invoke(scan_args![x.clone(), 0, 3, 1, peak.clone()])
        .await
        .unwrap();

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(peak.runs(), 4);
    assert_eq!(engine.last_writer().unwrap().rows().len(), 4);

    let replay = &engine.submitted()[0];
    assert_eq!(
        replay.args[0].as_axis().map(|axis| axis.name().to_string()),
        Some("scan_of_scan".to_string())
    );
    let names: Vec<String> = report
        .all_scannables()
        .iter()
        .map(|axis| axis.name().to_string())
        .collect();
    assert_eq!(names, vec!["x", "peak"]);
    assert_eq!(y.inputs().await, vec![5.0]);
}

/// Axis that requests a halt on its `trip_on`-th read.
struct TripwireAxis {
    inner: MockAxis,
    halt: HaltSignal,
    trip_on: usize,
    reads: AtomicUsize,
}

impl TripwireAxis {
    fn new(name: &str, initial: f64, halt: HaltSignal, trip_on: usize) -> Self {
        Self {
            inner: MockAxis::new(name, initial),
            halt,
            trip_on,
            reads: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Axis for TripwireAxis {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn input_names(&self) -> Vec<String> {
        self.inner.input_names()
    }

    async fn position(&self) -> anyhow::Result<Position> {
        if self.reads.fetch_add(1, Ordering::SeqCst) + 1 == self.trip_on {
            self.halt.request();
        }
        self.inner.position().await
    }

    async fn move_to(&self, target: Position) -> anyhow::Result<()> {
        self.inner.move_to(target).await
    }

    async fn is_busy(&self) -> anyhow::Result<bool> {
        self.inner.is_busy().await
    }

    async fn wait_while_busy(&self) -> anyhow::Result<()> {
        self.inner.wait_while_busy().await
    }
}

#[tokio::test]
async fn test_halted_scan_of_scans_replays_collected_rows() {
    let engine = Arc::new(SimulatedEngine::new());
    let x = Arc::new(MockAxis::new("x", 0.0));
    let y = Arc::new(MockAxis::new("y", 5.0));
    let peak = Arc::new(MockNestedScan::new("peak", y, &[-1.0, 0.0, 1.0]));
    let scan = command(Arc::new(GenericScan), engine.clone());
    let h = Arc::new(TripwireAxis::new("h", 0.0, scan.halt_signal(), 2));

    let report = scan
        .invoke(scan_args![x.clone(), 0, 5, 1, peak.clone(), h])
        .await
        .unwrap();

    assert_eq!(report.outcome, RunOutcome::Halted);
    assert_eq!(peak.runs(), 2);
    assert_eq!(engine.submitted().len(), 1);
    let rows = engine.last_writer().unwrap().rows();
    assert_eq!(rows.len(), 2);
    assert_eq!(x.history().await.len(), 2);
    assert!(report.data_writer().is_some());
    assert_eq!(scan.state(), ScanState::Idle);
}

#[tokio::test]
async fn test_scan_of_scans_halted_before_first_point_submits_nothing() {
    let engine = Arc::new(SimulatedEngine::new());
    let y = Arc::new(MockAxis::new("y", 5.0));
    let peak = Arc::new(MockNestedScan::new("peak", y, &[0.0]));
    let dscan = command(Arc::new(RelativeScan::dscan()), engine.clone());
    // Sampling the start position is the first read.
    let h = Arc::new(TripwireAxis::new("h", 10.0, dscan.halt_signal(), 1));

    let report = dscan
        .invoke(scan_args![h.clone(), -1, 1, 2, peak.clone()])
        .await
        .unwrap();

    assert_eq!(report.outcome, RunOutcome::Halted);
    assert_eq!(peak.runs(), 0);
    assert!(engine.submitted().is_empty());
    assert!(report.data_writer().is_none());
    assert!(h.inner.history().await.is_empty());
    assert_eq!(dscan.state(), ScanState::Idle);
}

#[tokio::test]
async fn test_replay_axis_name_comes_from_config() {
    let engine = Arc::new(SimulatedEngine::new());
    let x = Arc::new(MockAxis::new("x", 0.0));
    let y = Arc::new(MockAxis::new("y", 0.0));
    let peak = Arc::new(MockNestedScan::new("peak", y, &[0.0]));

    let mut config = ScanConfig::default();
    config.motion.poll_interval_ms = 1;
    config.secondary.replay_axis_name = "outer".to_string();
    let scan = ScanCommand::from_config(Arc::new(GenericScan), engine.clone(), &config);

    scan.invoke(scan_args![x, 0, 1, 1, peak]).await.unwrap();

    let replay = &engine.submitted()[0];
    assert_eq!(replay.args[0].as_axis().map(|axis| axis.name()), Some("outer"));
}

struct CountingListener {
    prepared: AtomicUsize,
    tag: &'static str,
}

impl CountingListener {
    fn new(tag: &'static str) -> Self {
        Self {
            prepared: AtomicUsize::new(0),
            tag,
        }
    }
}

#[async_trait]
impl ScanListener for CountingListener {
    fn prepare_for_scan(&self, _args: &[ScanArg]) {
        self.prepared.fetch_add(1, Ordering::SeqCst);
    }

    async fn update(&self, _handle: &dyn ScanHandle) -> Option<Value> {
        Some(json!(self.tag))
    }
}

#[tokio::test]
async fn test_listener_results_collapse_by_count() {
    let engine = Arc::new(SimulatedEngine::new());
    let x = Arc::new(MockAxis::new("x", 0.0));
    let first = Arc::new(CountingListener::new("first"));

    let ascan = command(Arc::new(AbsoluteScan::ascan()), engine.clone())
        .with_listener(Arc::new(DataLocationListener));
    let report = ascan.invoke(scan_args![x.clone(), 0, 1, 1]).await.unwrap();
    assert_eq!(
        report.results,
        ListenerOutput::One(json!({"scan_number": 1, "file": null}))
    );

    let ascan = command(Arc::new(AbsoluteScan::ascan()), engine.clone())
        .with_listener(first.clone())
        .with_listener(Arc::new(CountingListener::new("second")));
    let report = ascan.invoke(scan_args![x.clone(), 0, 1, 1]).await.unwrap();
    assert_eq!(
        report.results,
        ListenerOutput::Many(vec![json!("first"), json!("second")])
    );
    assert_eq!(first.prepared.load(Ordering::SeqCst), 1);
}

#[test]
fn test_registry_commands_run_from_plain_threads() {
    let registry = SyntaxRegistry::with_defaults();
    let engine = Arc::new(SimulatedEngine::new());
    let x = Arc::new(MockAxis::new("x", 1.0));
    let lup = command(registry.get("lup").unwrap(), engine.clone());

    let report = tokio_test::block_on(lup.invoke(scan_args![x.clone(), -1, 1, 2])).unwrap();

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(
        engine.last_writer().unwrap().rows(),
        vec![vec![0.0], vec![1.0], vec![2.0]]
    );
}

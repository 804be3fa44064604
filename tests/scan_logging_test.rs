//! Log output of scan invocations.
//!
//! Kept in its own test binary: `#[traced_test]` installs its own subscriber
//! and must not race `daq_scan::logging::init`.

use daq_scan::prelude::*;
use std::time::Duration;
use tracing_test::traced_test;

fn dscan(engine: Arc<SimulatedEngine>) -> ScanCommand {
    ScanCommand::new(
        Arc::new(RelativeScan::dscan()),
        engine,
        Arc::new(ConcurrentMove::new(Duration::from_millis(1))),
    )
    .with_poll_interval(Duration::from_millis(1))
}

#[tokio::test]
#[traced_test]
async fn test_invocation_logs_command_line_and_outcome() {
    let x = Arc::new(MockAxis::new("x", 2.0));
    let command = dscan(Arc::new(SimulatedEngine::new()));

    command.invoke(scan_args![x, -1, 1, 2]).await.unwrap();

    assert!(logs_contain("Starting scan"));
    assert!(logs_contain("dscan x -1 1 2"));
    assert!(logs_contain("invocation_id"));
    assert!(logs_contain("Scan complete"));
}

#[tokio::test]
#[traced_test]
async fn test_halt_is_logged() {
    let x = Arc::new(MockAxis::new("x", 0.0));
    let command = dscan(Arc::new(SimulatedEngine::new().halt_after(1)));

    let report = command.invoke(scan_args![x, -1, 1, 2]).await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Halted);
    assert!(logs_contain("Scan halted by user"));
}

#[tokio::test]
#[traced_test]
async fn test_usage_error_logs_nothing_about_motion() {
    let x = Arc::new(MockAxis::new("x", 0.0));
    let engine = Arc::new(SimulatedEngine::new());
    let command = dscan(engine.clone());

    assert!(command.invoke(scan_args![x, -1]).await.is_err());

    assert!(!logs_contain("Scan submitted"));
    assert!(engine.submitted().is_empty());
}

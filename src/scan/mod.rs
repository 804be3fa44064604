//! SPEC-style scan commands.
//!
//! A command such as `dscan x -5 5 10 det` travels through these modules:
//!
//! - `position`: scalar/vector positions and their arithmetic
//! - `args`: scan arguments and their grouping per axis
//! - `syntax`: one grammar per command (ascan, dscan, mesh, cscan, ...)
//! - `resolver`: position sampling, relative resolution and return-to-start
//! - `engine`: the seam to the execution engine
//! - `listener`: observers and run metadata
//! - `orchestrator`: `ScanCommand`, the entry point
//! - `secondary`: point-by-point execution of scans of scans
//! - `simulated`: an in-process execution engine

pub mod args;
pub mod engine;
pub mod listener;
pub mod orchestrator;
pub mod position;
pub mod resolver;
pub mod secondary;
pub mod simulated;
pub mod syntax;

pub use args::{command_line, flatten, parse, ArgumentGroup, ScanArg};
pub use engine::{
    DataWriter, HaltSignal, PlotSettings, RunOutcome, ScanEngine, ScanHandle, ScanRequest,
};
pub use listener::{DataLocationListener, ListenerOutput, RunMetadata, RunMetadataSink, ScanListener};
pub use orchestrator::{ScanCommand, ScanReport, ScanState};
pub use position::Position;
pub use resolver::{ConcurrentMove, InitialPositions, MovePrimitive, PositionResolver};
pub use secondary::{
    outer_positions, ReplayAxis, ScanTable, SecondaryScan, SecondaryScanHandle, MAX_OUTER_POINTS,
};
pub use simulated::{MemoryDataWriter, SimulatedEngine};
pub use syntax::{
    AbsoluteScan, CenteredScan, GenericScan, MeshScan, NormalizedScan, RelativeScan, ScanSyntax,
    SyntaxRegistry,
};

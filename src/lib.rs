//! # DAQ Scan Commands
//!
//! SPEC-style scan commands (`ascan`, `dscan`, `mesh`, `cscan`, ...) for
//! data acquisition. A command's flat argument list is grouped per axis,
//! normalized into absolute ranges, handed to an execution engine and, for
//! relative scans, followed by a return of every axis to where it started.
//!
//! ## Crate Structure
//!
//! - **`config`**: `ScanConfig`, loaded from TOML and `DAQ_SCAN_` environment
//!   variables with Figment.
//! - **`error`**: `ScanError`, separating usage errors (caught before any
//!   motion) from device and engine failures.
//! - **`hardware`**: the `Axis` capability trait and simulated axes.
//! - **`logging`**: `tracing-subscriber` initialisation.
//! - **`scan`**: argument grouping, scan syntaxes, position resolution, the
//!   `ScanCommand` orchestrator and point-by-point scans of scans.
//!
//! ## Example
//!
//! ```rust,ignore
//! use daq_scan::prelude::*;
//!
//! let x = Arc::new(MockAxis::new("x", 100.0));
//! let engine = Arc::new(SimulatedEngine::new());
//! let dscan = ScanCommand::new(
//!     Arc::new(RelativeScan::dscan()),
//!     engine,
//!     Arc::new(ConcurrentMove::default()),
//! );
//!
//! // Scans 95..105 in steps of 1, then returns x to 100.
//! let report = dscan.invoke(scan_args![x.clone(), -5, 5, 10]).await?;
//! ```

pub mod config;
pub mod error;
pub mod hardware;
pub mod logging;
pub mod scan;

pub use error::{ScanError, ScanResult};

/// Commonly used types
pub mod prelude {
    pub use crate::config::ScanConfig;
    pub use crate::error::{ScanError, ScanResult};
    pub use crate::hardware::{Axis, MockAxis, MockNestedScan, NestedScan};
    pub use crate::scan::{
        AbsoluteScan, CenteredScan, ConcurrentMove, GenericScan, MeshScan, Position, RelativeScan,
        RunOutcome, ScanArg, ScanCommand, ScanReport, ScanState, SimulatedEngine, SyntaxRegistry,
    };
    pub use crate::scan_args;
    pub use std::sync::Arc;
}

//! Hardware abstractions used by scan commands.
//!
//! - `capabilities`: the `Axis` and `NestedScan` capability traits
//! - `mock`: simulated axes for tests and the demo binary

pub mod capabilities;
pub mod mock;

pub use capabilities::{is_nested_scan, same_axis, Axis, NestedScan};
pub use mock::{MockAxis, MockNestedScan};

//! Columns: typed views over memory-mapped files.

pub mod fixed;
pub mod variable;

pub use fixed::{BSearchEdge, FixedColumn};
pub use variable::{FlyweightStr, VariableColumn};

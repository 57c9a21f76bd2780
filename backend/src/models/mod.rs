//! Domain types for analyses, parameters and reference ranges.

pub mod macros;
pub mod parameter;
pub mod range;

pub use parameter::*;
pub use range::*;

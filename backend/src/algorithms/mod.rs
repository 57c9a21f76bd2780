//! Pure algorithms with no storage concerns.

pub mod intervals;

pub use intervals::{expand_and_validate, normalize_range, IntervalError, IntervalResult};

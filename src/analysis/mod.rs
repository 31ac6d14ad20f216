//! Indicator analysis.
//!
//! The aggregation engine lives in `aggregator`; it is the only place that
//! derives indicator values from other indicator values.

pub mod aggregator;

pub use aggregator::*;

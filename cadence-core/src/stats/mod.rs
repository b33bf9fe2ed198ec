//! Statistics: fixed-bin histograms and per-flow reporting

pub mod flow;
pub mod histogram;

pub use flow::{
    FlowReporter, FlowSummary, ReportSettings, Reporter, TransitPercentiles, TransitStats,
};
pub use histogram::{Histogram, HistogramSettings, IntervalDelta, OutOfBounds};

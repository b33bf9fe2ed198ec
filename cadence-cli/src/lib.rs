//! Cadence CLI library
//!
//! Profile loading, result output and the timing diagnostics, exposed for
//! the binary and its integration tests.

pub mod completions;
pub mod config;
pub mod diagnostics;
pub mod output;

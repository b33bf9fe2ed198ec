//! Thread placement for flow and diagnostic threads
//!
//! Every flow runs on its own OS thread. These helpers pin such a thread to
//! a core and, for timing diagnostics, move it to a realtime scheduling class.

pub mod affinity;
pub mod realtime;

pub use affinity::{core_count, pin_thread, pin_to_core, CpuPinning};
pub use realtime::{lock_memory, set_realtime_priority};

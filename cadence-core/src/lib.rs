//! Cadence Core Library
//!
//! This crate provides the core of the cadence measurement tool: the
//! adaptive delay engine and frame counter, fixed-bin histograms and flow
//! reporting, the UDP/TCP receive loops with their teardown ack, and the
//! paced traffic generator.

pub mod client;
pub mod config;
pub mod error;
pub mod record;
pub mod server;
pub mod stats;
pub mod threading;
pub mod timing;

pub use cadence_transport::Timestamp;

pub use client::{Client, ClientReport};
pub use config::{AckSettings, ClientSettings, IsochSettings, Protocol, ServerSettings};
pub use error::{Error, Result};
pub use record::PacketRecord;
pub use server::{FlowReport, Server, Termination};

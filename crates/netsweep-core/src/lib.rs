//! netsweep-core: Shared types and error handling for the netsweep engine.
//!
//! This crate provides the vocabulary every sweep component speaks:
//! - Address range helpers over `ipnet::Ipv4Net`
//! - `ScanUnit`, the ordered atom of scheduling and checkpointing
//! - `ScanResult` / `Finding`, the tagged union of probe observations

pub mod error;
pub mod types;

pub use error::CoreError;
pub use types::{Finding, ScanResult, ScanUnit, ScriptOutcome};

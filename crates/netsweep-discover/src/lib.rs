//! netsweep-discover: resumable, bounded-concurrency network sweeps.
//!
//! Partitions address space into scan units, drives pluggable probers over
//! them with a fixed worker pool and per-unit timeouts, checkpoints progress
//! so an interrupted sweep can resume, and aggregates the findings into
//! subnet, VLAN and service reports.

pub mod aggregate;
pub mod config;
pub mod error;
pub mod journal;
pub mod liveness;
pub mod nmap_xml;
pub mod partition;
pub mod ports;
pub mod privilege;
pub mod probe;
pub mod progress;
pub mod report;
pub mod scanner;
pub mod scheduler;
pub mod service;
pub mod targets;
pub mod vlan;

pub use aggregate::{ResultAggregator, SweepReport};
pub use error::{DiscoverError, ProbeError, Result};
pub use journal::ResultJournal;
pub use partition::{Partitioner, UnitSource};
pub use probe::Prober;
pub use progress::{FileProgressStore, MemoryProgressStore, ProgressStore};
pub use scheduler::{ScanScheduler, SchedulerSettings, SweepOutcome};

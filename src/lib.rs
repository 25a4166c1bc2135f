//! Thermal-aware compute backend scheduling for on-device ML inference.
//!
//! The crate answers one question for a host application: *which backend should
//! run this task right now?* It combines a static per-device preference table,
//! cached micro-benchmarks, and the live thermal state of the device, and it
//! always has an answer (the generic CPU backend is the floor).
//!
//! ```no_run
//! use std::sync::Arc;
//! use libscheduler::scheduler::{AdaptiveScheduler, ComputeTask, InventorySnapshot, StaticInventory};
//!
//! let inventory = Arc::new(StaticInventory::new(InventorySnapshot::default()));
//! let scheduler = AdaptiveScheduler::new(inventory).unwrap();
//! let backend = scheduler.select_backend(ComputeTask::LlmInference);
//! println!("running on {backend} (native code {})", backend.native_code());
//! ```
#![deny(missing_docs)]

pub mod config;
pub mod errors;
pub mod scheduler;

pub use config::SchedulerConfig;
pub use errors::{Result, SchedulerError};
pub use scheduler::{
    AdaptiveScheduler, BackendKind, ComputeTask, GenerationParams, PerformanceProfile,
    ThermalState,
};

//! Error types for backend scheduling
//!
//! Only the explicit operations (`switch_backend`, `validate_backend`, config and
//! persistence loading) surface these to callers. The automatic selection path
//! absorbs every variant and degrades to the CPU backend.

#![allow(missing_docs)]

use crate::scheduler::BackendKind;
use thiserror::Error;

/// Errors produced by the scheduler subsystem
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SchedulerError {
    #[error("backend {0} is not supported on this device")]
    UnsupportedBackend(BackendKind),
    #[error("backend {backend} failed its self-test: {reason}")]
    BackendSelfTestFailed { backend: BackendKind, reason: String },
    #[error("benchmark of {backend} failed: {reason}")]
    BenchmarkFailed { backend: BackendKind, reason: String },
    #[error("benchmark of {backend} exceeded {timeout_ms}ms")]
    BenchmarkTimeout { backend: BackendKind, timeout_ms: u64 },
    #[error("hardware inventory unavailable: {0}")]
    HardwareInventoryUnavailable(String),
    #[error("unknown native backend code {0}")]
    UnknownBackendCode(i32),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("selection cache persistence failed: {0}")]
    Persistence(String),
    #[error("thermal sensor unavailable: {0}")]
    Sensor(String),
}

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, SchedulerError>;

//! Adaptive backend scheduler
//!
//! Decides which compute backend (generic CPU, GPU via OpenCL or Vulkan, or a
//! vendor neural accelerator) runs a given ML workload on this device, and keeps
//! that decision honest as the device heats up and cools down.
//!
//! ```text
//!   HardwareInventory ──► DeviceProfileProvider ──┐
//!                                                 │ Arc<DeviceProfile>
//!   ThermalSignal ──► ThermalMonitor ──► ThermalStateMachine ──┐
//!                                                 │            │ snapshot / hooks
//!                        BackendPreferenceMatrix ─┤            │
//!                        BenchmarkEngine ─────────┼──► BackendRouter ──► BackendKind
//!                        BackendSelectionCache ───┘
//! ```

#![allow(missing_docs)]

use crate::config::SchedulerConfig;
use crate::errors::{Result, SchedulerError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast;
use tokio_stream::Stream;
use tracing::{info, warn};

pub mod backend;
pub mod benchmarks;
pub mod cache;
pub mod capabilities;
pub mod matrix;
pub mod params;
pub mod router;
pub mod sensors;
pub mod thermal;


pub use backend::{
    AcceleratorBackend, AcceleratorDriver, BackendRegistry, BenchmarkMeasurement, ComputeBackend,
    CpuGenericBackend,
};
pub use benchmarks::{BenchmarkEngine, BenchmarkResult, BenchmarkSnapshot, ReferenceWorkload};
pub use cache::{BackendDecision, BackendSelectionCache, SelectionKey};
pub use capabilities::{
    Capability, DeviceFingerprint, DeviceProfile, DeviceProfileProvider, DeviceTier, GpuVendor,
    HardwareInventory, InventorySnapshot, SocVendor, StaticInventory, SystemInventory,
    ThermalCapabilityTier,
};
pub use matrix::{BackendPreferenceMatrix, Candidates};
pub use params::GenerationParams;
pub use router::BackendRouter;
pub use sensors::ProcSensors;
pub use thermal::{
    HeuristicThermalSignal, PlatformSensors, PlatformStatusSignal, ThermalMonitor,
    ThermalSignal, ThermalSnapshot, ThermalStateMachine, ThermalTransition,
};

/// A concrete execution path for numeric inference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BackendKind {
    CpuGeneric,
    GpuOpenCl,
    GpuVulkan,
    AcceleratorNpu,
}

/// Workload kinds the scheduler routes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ComputeTask {
    LlmInference,
    EmbeddingGeneration,
    SafetyCheck,
    AsrTranscription,
}

/// Per-task weighting of the three benchmark criteria; always sums to 1.0
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoringWeights {
    pub performance: f64,
    pub latency: f64,
    pub memory: f64,
}

/// Thermal severity, strictly ordered from coolest to hottest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ThermalState {
    None,
    Light,
    Moderate,
    Severe,
    Critical,
    Emergency,
}

/// Groups of thermal states whose cached decisions are interchangeable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThermalBucket {
    Mild,
    Moderate,
    Severe,
}

/// Active performance profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PerformanceProfile {
    Performance,
    Balanced,
    BatterySaver,
    Emergency,
}

impl BackendKind {
    pub const ALL: [BackendKind; 4] = [
        BackendKind::CpuGeneric,
        BackendKind::GpuOpenCl,
        BackendKind::GpuVulkan,
        BackendKind::AcceleratorNpu,
    ];

    /// Code understood by the native inference bridge.
    pub const fn native_code(self) -> i32 {
        match self {
            Self::CpuGeneric => 0,
            Self::GpuOpenCl => 1,
            Self::GpuVulkan => 2,
            Self::AcceleratorNpu => 3,
        }
    }

    /// Device capability flag the backend needs; CPU needs none.
    pub const fn required_capability(self) -> Option<Capability> {
        match self {
            Self::CpuGeneric => None,
            Self::GpuOpenCl => Some(Capability::AcceleratorOpenCl),
            Self::GpuVulkan => Some(Capability::AcceleratorVulkan),
            Self::AcceleratorNpu => Some(Capability::AcceleratorNpu),
        }
    }

    pub const fn label(self) -> &'static str {
        match self {
            Self::CpuGeneric => "CPU_GENERIC",
            Self::GpuOpenCl => "GPU_OPENCL",
            Self::GpuVulkan => "GPU_VULKAN",
            Self::AcceleratorNpu => "ACCELERATOR_NPU",
        }
    }

    pub(crate) const fn index(self) -> usize {
        self as usize
    }

    pub(crate) const fn from_index(index: u8) -> Self {
        match index {
            1 => Self::GpuOpenCl,
            2 => Self::GpuVulkan,
            3 => Self::AcceleratorNpu,
            _ => Self::CpuGeneric,
        }
    }
}

impl TryFrom<i32> for BackendKind {
    type Error = SchedulerError;

    fn try_from(code: i32) -> Result<Self> {
        match code {
            0 => Ok(Self::CpuGeneric),
            1 => Ok(Self::GpuOpenCl),
            2 => Ok(Self::GpuVulkan),
            3 => Ok(Self::AcceleratorNpu),
            other => Err(SchedulerError::UnknownBackendCode(other)),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl ComputeTask {
    pub const ALL: [ComputeTask; 4] = [
        ComputeTask::LlmInference,
        ComputeTask::EmbeddingGeneration,
        ComputeTask::SafetyCheck,
        ComputeTask::AsrTranscription,
    ];

    /// Fixed (performance, latency, memory) weights used to score benchmarks.
    pub const fn weights(self) -> ScoringWeights {
        match self {
            Self::LlmInference => ScoringWeights { performance: 0.6, latency: 0.2, memory: 0.2 },
            Self::EmbeddingGeneration => {
                ScoringWeights { performance: 0.4, latency: 0.3, memory: 0.3 }
            }
            Self::SafetyCheck => ScoringWeights { performance: 0.2, latency: 0.6, memory: 0.2 },
            Self::AsrTranscription => {
                ScoringWeights { performance: 0.3, latency: 0.5, memory: 0.2 }
            }
        }
    }

    pub const fn label(self) -> &'static str {
        match self {
            Self::LlmInference => "LLM_INFERENCE",
            Self::EmbeddingGeneration => "EMBEDDING_GENERATION",
            Self::SafetyCheck => "SAFETY_CHECK",
            Self::AsrTranscription => "ASR_TRANSCRIPTION",
        }
    }
}

impl fmt::Display for ComputeTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl ScoringWeights {
    /// `w_perf * perf + w_latency * 1000/(latency+1) + w_mem * 1000/(memMB+1)`
    pub fn score(&self, performance: f64, latency_ms: f64, memory_mb: f64) -> f64 {
        self.performance * performance
            + self.latency * (1000.0 / (latency_ms.max(0.0) + 1.0))
            + self.memory * (1000.0 / (memory_mb.max(0.0) + 1.0))
    }
}

impl ThermalState {
    pub const ALL: [ThermalState; 6] = [
        ThermalState::None,
        ThermalState::Light,
        ThermalState::Moderate,
        ThermalState::Severe,
        ThermalState::Critical,
        ThermalState::Emergency,
    ];

    /// Map a platform thermal status code. Code 6 (imminent shutdown) counts as
    /// EMERGENCY; anything unrecognised maps to NONE.
    pub const fn from_platform_code(code: i32) -> Self {
        match code {
            1 => Self::Light,
            2 => Self::Moderate,
            3 => Self::Severe,
            4 => Self::Critical,
            5 | 6 => Self::Emergency,
            _ => Self::None,
        }
    }

    pub const fn bucket(self) -> ThermalBucket {
        match self {
            Self::None | Self::Light => ThermalBucket::Mild,
            Self::Moderate => ThermalBucket::Moderate,
            Self::Severe | Self::Critical | Self::Emergency => ThermalBucket::Severe,
        }
    }

    pub const fn should_throttle(self) -> bool {
        matches!(self, Self::Severe | Self::Critical | Self::Emergency)
    }

    /// CRITICAL and EMERGENCY force the emergency profile and stale benchmarks.
    pub const fn is_critical(self) -> bool {
        matches!(self, Self::Critical | Self::Emergency)
    }

    pub(crate) const fn from_index(index: u8) -> Self {
        match index {
            1 => Self::Light,
            2 => Self::Moderate,
            3 => Self::Severe,
            4 => Self::Critical,
            5 => Self::Emergency,
            _ => Self::None,
        }
    }

    pub const fn label(self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::Light => "LIGHT",
            Self::Moderate => "MODERATE",
            Self::Severe => "SEVERE",
            Self::Critical => "CRITICAL",
            Self::Emergency => "EMERGENCY",
        }
    }
}

impl fmt::Display for ThermalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl PerformanceProfile {
    pub(crate) const fn from_index(index: u8) -> Self {
        match index {
            0 => Self::Performance,
            2 => Self::BatterySaver,
            3 => Self::Emergency,
            _ => Self::Balanced,
        }
    }

    pub const fn label(self) -> &'static str {
        match self {
            Self::Performance => "PERFORMANCE",
            Self::Balanced => "BALANCED",
            Self::BatterySaver => "BATTERY_SAVER",
            Self::Emergency => "EMERGENCY",
        }
    }
}

impl fmt::Display for PerformanceProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Scheduler facade: owns every component and exposes the public operations
pub struct AdaptiveScheduler {
    config: SchedulerConfig,
    profiles: Arc<DeviceProfileProvider>,
    thermal: Arc<ThermalStateMachine>,
    router: Arc<BackendRouter>,
    monitor: Mutex<Option<ThermalMonitor>>,
}

/// Builder for [`AdaptiveScheduler`]
pub struct SchedulerBuilder {
    inventory: Arc<dyn HardwareInventory>,
    config: SchedulerConfig,
    matrix: BackendPreferenceMatrix,
    registry: BackendRegistry,
}

impl SchedulerBuilder {
    pub fn config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn matrix(mut self, matrix: BackendPreferenceMatrix) -> Self {
        self.matrix = matrix;
        self
    }

    /// Replace the backend registered for `backend.kind()`.
    pub fn backend(mut self, backend: Arc<dyn ComputeBackend>) -> Self {
        self.registry = self.registry.with_backend(backend);
        self
    }

    /// Attach a host-supplied driver to one of the accelerator kinds.
    pub fn accelerator_driver(mut self, kind: BackendKind, driver: Arc<dyn AcceleratorDriver>) -> Self {
        self.registry = self.registry.with_driver(kind, driver);
        self
    }

    pub fn build(self) -> Result<AdaptiveScheduler> {
        self.config.validate()?;

        let profiles = Arc::new(DeviceProfileProvider::new(self.inventory));
        let profile = profiles.current();
        let thermal = Arc::new(ThermalStateMachine::new(
            profile.cpu_cores,
            self.config.generation.clone(),
            self.config.thermal.notification_capacity,
        ));

        let cache = match &self.config.cache.persist_path {
            Some(path) if path.exists() => {
                BackendSelectionCache::load_from(path, profile.fingerprint()).unwrap_or_else(|e| {
                    warn!(error = %e, "discarding unreadable selection cache");
                    BackendSelectionCache::new()
                })
            }
            _ => BackendSelectionCache::new(),
        };

        let registry = Arc::new(self.registry);
        let engine = BenchmarkEngine::new(
            Arc::clone(&registry),
            ReferenceWorkload::from_config(&self.config.benchmark),
            self.config.benchmark_ttl(),
            self.config.benchmark_timeout(),
        )
        .with_run_budget(self.config.benchmark_run_budget());
        let router = Arc::new(
            BackendRouter::new(
                Arc::clone(&profiles),
                Arc::clone(&thermal),
                self.matrix,
                registry,
                engine,
                cache,
            )
            .with_self_test_timeout(self.config.self_test_timeout()),
        );

        let weak = Arc::downgrade(&router);
        thermal.add_hook(Box::new(move |transition| {
            if let Some(router) = weak.upgrade() {
                router.handle_transition(transition);
            }
        }));

        info!(
            vendor = %profile.soc_vendor,
            tier = %profile.device_tier,
            thermal_tier = ?profile.thermal_tier,
            "adaptive scheduler ready"
        );

        Ok(AdaptiveScheduler {
            config: self.config,
            profiles,
            thermal,
            router,
            monitor: Mutex::new(None),
        })
    }
}

impl AdaptiveScheduler {
    pub fn builder(inventory: Arc<dyn HardwareInventory>) -> SchedulerBuilder {
        SchedulerBuilder {
            inventory,
            config: SchedulerConfig::default(),
            matrix: BackendPreferenceMatrix::default(),
            registry: BackendRegistry::new(),
        }
    }

    /// Scheduler with default configuration, matrix and backends.
    pub fn new(inventory: Arc<dyn HardwareInventory>) -> Result<Self> {
        Self::builder(inventory).build()
    }

    /// Pick the backend for `task`. Never fails; degrades to CPU_GENERIC.
    pub fn select_backend(&self, task: ComputeTask) -> BackendKind {
        self.router.select_backend(task)
    }

    /// [`select_backend`](Self::select_backend) off the async executor threads.
    pub async fn select_backend_async(self: &Arc<Self>, task: ComputeTask) -> BackendKind {
        let this = Arc::clone(self);
        tokio::task::spawn_blocking(move || this.select_backend(task))
            .await
            .unwrap_or(BackendKind::CpuGeneric)
    }

    /// Explicitly activate `kind`; reports why if it cannot run here.
    pub fn switch_backend(&self, kind: BackendKind) -> Result<()> {
        self.router.switch_backend(kind)
    }

    /// Run the capability check and self-test for `kind` without switching.
    pub fn validate_backend(&self, kind: BackendKind) -> Result<()> {
        self.router.validate_backend(kind)
    }

    pub fn current_backend(&self) -> BackendKind {
        self.router.current_backend()
    }

    pub fn current_thermal_state(&self) -> ThermalState {
        self.thermal.current_state()
    }

    pub fn current_performance_profile(&self) -> PerformanceProfile {
        self.thermal.current_profile()
    }

    /// User override of the profile; refused while CRITICAL or hotter.
    pub fn set_performance_profile(&self, profile: PerformanceProfile) -> bool {
        self.thermal.set_profile(profile)
    }

    pub fn should_throttle(&self) -> bool {
        self.thermal.should_throttle()
    }

    pub fn optimal_thread_count(&self) -> usize {
        self.thermal.optimal_thread_count()
    }

    /// Thread count for a caller request; `<= 0` means "pick for me" and
    /// larger requests are capped while the device is hot.
    pub fn resolve_thread_count(&self, requested: i32) -> usize {
        self.thermal.resolve_thread_count(requested)
    }

    pub fn adapt_parameters(&self, params: &GenerationParams) -> GenerationParams {
        self.thermal.adapt_parameters(params)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ThermalTransition> {
        self.thermal.subscribe()
    }

    pub fn transitions(&self) -> impl Stream<Item = ThermalTransition> + Send + 'static {
        self.thermal.transitions()
    }

    /// Entry point for push-style platform thermal callbacks.
    pub fn report_platform_code(&self, code: i32) -> Option<ThermalTransition> {
        self.thermal.report_platform_code(code)
    }

    /// Start polling `signal` on the configured interval, replacing any
    /// previously running monitor.
    pub fn start_monitoring(&self, signal: Box<dyn ThermalSignal>) -> Result<()> {
        let monitor =
            ThermalMonitor::spawn(Arc::clone(&self.thermal), signal, self.config.poll_interval())?;
        let previous = self
            .monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(monitor);
        if let Some(previous) = previous {
            previous.stop();
        }
        Ok(())
    }

    /// Start the polled heuristic when the platform offers no push status API.
    /// Returns whether a monitor was started.
    pub fn start_default_monitoring(&self) -> Result<bool> {
        match self.profiles.current().thermal_tier {
            ThermalCapabilityTier::PolledHeuristic => {
                let signal = HeuristicThermalSignal::new(
                    ProcSensors::new(),
                    self.config.thermal.heuristic.clone(),
                );
                self.start_monitoring(Box::new(signal))?;
                Ok(true)
            }
            ThermalCapabilityTier::PlatformStatus | ThermalCapabilityTier::Unmonitored => Ok(false),
        }
    }

    pub fn stop_monitoring(&self) {
        let monitor = self.monitor.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(monitor) = monitor {
            monitor.stop();
        }
    }

    pub fn device_profile(&self) -> Arc<DeviceProfile> {
        self.profiles.current()
    }

    /// Re-read the inventory; benchmarks are dropped because they describe
    /// the old profile.
    pub fn refresh_device_profile(&self) -> Arc<DeviceProfile> {
        let profile = self.profiles.refresh();
        self.router.invalidate_benchmarks();
        profile
    }

    pub fn benchmark_snapshot(&self) -> Option<Arc<BenchmarkSnapshot>> {
        self.router.benchmark_snapshot()
    }

    pub fn clear_cache(&self) {
        self.router.clear_cache();
    }

    /// Write cached decisions to the configured path, if any.
    pub fn persist_cache(&self) -> Result<()> {
        match &self.config.cache.persist_path {
            Some(path) => self.router.cache().save_to(path),
            None => Ok(()),
        }
    }

    pub fn router(&self) -> &BackendRouter {
        &self.router
    }

    pub fn thermal(&self) -> &Arc<ThermalStateMachine> {
        &self.thermal
    }

    /// Stop the monitor and persist the cache.
    pub fn shutdown(&self) -> Result<()> {
        self.stop_monitoring();
        self.persist_cache()
    }
}

impl Drop for AdaptiveScheduler {
    fn drop(&mut self) {
        self.stop_monitoring();
    }
}

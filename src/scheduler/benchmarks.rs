//! Reference micro-benchmarks and the snapshot they produce
//!
//! Every candidate backend multiplies the same pair of square f32 matrices. A
//! run measures each kind on its own thread, bounded by a per-candidate timeout
//! and an overall run budget, and the resulting [`BenchmarkSnapshot`] is reused
//! until it expires or the device passes through a CRITICAL state.

use super::backend::{run_bounded, AbandonedWorkers, Bounded};
use super::matrix::Candidates;
use super::*;
use crate::config::BenchmarkConfig;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant, SystemTime};
use tracing::debug;

/// Fixed input shared by every benchmark run
#[derive(Debug, Clone)]
pub struct ReferenceWorkload {
    dim: usize,
    iterations: usize,
    warmup_iterations: usize,
    lhs: Vec<f32>,
    rhs: Vec<f32>,
    reference: Vec<f32>,
}

/// Outcome of benchmarking one backend kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkResult {
    pub backend: BackendKind,
    pub execution_time_ms: f64,
    pub performance_score: f64,
    pub memory_bytes: u64,
    pub success: bool,
    /// Why the run failed, when it did.
    pub failure: Option<String>,
}

/// Results of one benchmark run
#[derive(Debug, Clone)]
pub struct BenchmarkSnapshot {
    pub results: Vec<BenchmarkResult>,
    pub taken_at: Instant,
    pub captured_at: SystemTime,
    /// Thermal critical epoch in force when the run started.
    pub critical_epoch: u64,
}

/// Runs benchmarks and holds the latest snapshot
pub struct BenchmarkEngine {
    registry: Arc<BackendRegistry>,
    workload: Arc<ReferenceWorkload>,
    ttl: Duration,
    timeout: Duration,
    run_budget: Duration,
    abandoned: AbandonedWorkers,
    latest: RwLock<Option<Arc<BenchmarkSnapshot>>>,
    run_lock: Mutex<()>,
    runs: AtomicU64,
}

impl ReferenceWorkload {
    pub fn new(dim: usize, iterations: usize, warmup_iterations: usize) -> Self {
        let dim = dim.max(1);
        let len = dim * dim;
        let lhs: Vec<f32> = (0..len).map(|i| ((i * 7 + 3) % 17) as f32 / 17.0 - 0.5).collect();
        let rhs: Vec<f32> = (0..len).map(|i| ((i * 5 + 1) % 13) as f32 / 13.0 - 0.5).collect();
        let mut reference = vec![0.0f32; len];
        backend::matmul_into(&lhs, &rhs, dim, &mut reference);
        Self { dim, iterations: iterations.max(1), warmup_iterations, lhs, rhs, reference }
    }

    pub fn from_config(config: &BenchmarkConfig) -> Self {
        Self::new(config.matrix_dim, config.iterations, config.warmup_iterations)
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }

    pub fn warmup_iterations(&self) -> usize {
        self.warmup_iterations
    }

    pub fn lhs(&self) -> &[f32] {
        &self.lhs
    }

    pub fn rhs(&self) -> &[f32] {
        &self.rhs
    }

    /// Bytes held by the two operands and the product.
    pub fn footprint_bytes(&self) -> u64 {
        (3 * self.dim * self.dim * std::mem::size_of::<f32>()) as u64
    }

    /// Element-wise comparison against the CPU product.
    pub fn matches_reference(&self, out: &[f32]) -> bool {
        out.len() == self.reference.len()
            && out
                .iter()
                .zip(&self.reference)
                .all(|(got, want)| (got - want).abs() <= 1e-3 * want.abs().max(1.0))
    }
}

impl BenchmarkResult {
    pub fn succeeded(backend: BackendKind, measurement: BenchmarkMeasurement) -> Self {
        Self {
            backend,
            execution_time_ms: measurement.execution_time_ms,
            performance_score: measurement.performance_score,
            memory_bytes: measurement.memory_bytes,
            success: true,
            failure: None,
        }
    }

    pub fn failed(backend: BackendKind, reason: impl Into<String>) -> Self {
        Self {
            backend,
            execution_time_ms: 0.0,
            performance_score: 0.0,
            memory_bytes: 0,
            success: false,
            failure: Some(reason.into()),
        }
    }

    pub fn memory_mb(&self) -> f64 {
        self.memory_bytes as f64 / (1024.0 * 1024.0)
    }

    /// Weighted score, or `None` for a failed run.
    pub fn score(&self, weights: ScoringWeights) -> Option<f64> {
        self.success
            .then(|| weights.score(self.performance_score, self.execution_time_ms, self.memory_mb()))
    }
}

impl BenchmarkSnapshot {
    pub fn result(&self, kind: BackendKind) -> Option<&BenchmarkResult> {
        self.results.iter().find(|r| r.backend == kind)
    }

    pub fn covers(&self, kinds: &[BackendKind]) -> bool {
        kinds.iter().all(|&kind| self.result(kind).is_some())
    }

    pub fn is_fresh(&self, ttl: Duration, critical_epoch: u64) -> bool {
        self.critical_epoch == critical_epoch && self.taken_at.elapsed() < ttl
    }

    pub fn successful(&self) -> impl Iterator<Item = &BenchmarkResult> {
        self.results.iter().filter(|r| r.success)
    }

    /// Export results to CSV format
    pub fn to_csv(&self) -> String {
        let mut csv = String::from(
            "backend,native_code,execution_time_ms,performance_score,memory_bytes,success,failure\n",
        );
        for result in &self.results {
            csv.push_str(&format!(
                "{},{},{:.3},{:.3},{},{},{}\n",
                result.backend,
                result.backend.native_code(),
                result.execution_time_ms,
                result.performance_score,
                result.memory_bytes,
                result.success,
                result.failure.as_deref().unwrap_or("").replace(',', ";"),
            ));
        }
        csv
    }
}

impl BenchmarkEngine {
    pub fn new(
        registry: Arc<BackendRegistry>,
        workload: ReferenceWorkload,
        ttl: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            registry,
            workload: Arc::new(workload),
            ttl,
            timeout,
            run_budget: timeout.saturating_mul(BackendKind::ALL.len() as u32),
            abandoned: AbandonedWorkers::new(),
            latest: RwLock::new(None),
            run_lock: Mutex::new(()),
            runs: AtomicU64::new(0),
        }
    }

    /// Cap the wall time of a whole run.
    pub fn with_run_budget(mut self, budget: Duration) -> Self {
        self.run_budget = budget;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn latest(&self) -> Option<Arc<BenchmarkSnapshot>> {
        self.latest.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn invalidate(&self) {
        *self.latest.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Number of benchmark runs performed so far.
    pub fn run_count(&self) -> u64 {
        self.runs.load(Ordering::Relaxed)
    }

    fn usable(&self, candidates: &[BackendKind], critical_epoch: u64) -> Option<Arc<BenchmarkSnapshot>> {
        self.latest()
            .filter(|s| s.is_fresh(self.ttl, critical_epoch) && s.covers(candidates))
    }

    /// A fresh snapshot covering `candidates`, running benchmarks if needed.
    ///
    /// Concurrent callers wait for a single run instead of starting their own.
    pub fn snapshot_for(
        &self,
        candidates: &[BackendKind],
        profile: &DeviceProfile,
        critical_epoch: u64,
    ) -> Arc<BenchmarkSnapshot> {
        if let Some(snapshot) = self.usable(candidates, critical_epoch) {
            return snapshot;
        }
        let _guard = self.run_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(snapshot) = self.usable(candidates, critical_epoch) {
            return snapshot;
        }

        // Keep kinds measured for other tasks so the new snapshot still covers them.
        let mut kinds: Candidates = candidates.iter().copied().collect();
        if let Some(previous) = self.latest().filter(|s| s.is_fresh(self.ttl, critical_epoch)) {
            for result in &previous.results {
                if !kinds.contains(&result.backend) {
                    kinds.push(result.backend);
                }
            }
        }

        let snapshot = Arc::new(self.run(&kinds, profile, critical_epoch));
        *self.latest.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&snapshot));
        snapshot
    }

    /// Benchmark `kinds` unconditionally, in order. Kinds reached after the run
    /// budget is spent are recorded as failures without being started.
    pub fn run(&self, kinds: &[BackendKind], profile: &DeviceProfile, critical_epoch: u64) -> BenchmarkSnapshot {
        self.runs.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();
        let deadline = started.checked_add(self.run_budget);
        let results: Vec<BenchmarkResult> = kinds
            .iter()
            .map(|&kind| {
                let limit = match deadline {
                    Some(deadline) => deadline.saturating_duration_since(Instant::now()).min(self.timeout),
                    None => self.timeout,
                };
                if limit.is_zero() {
                    warn!(
                        backend = %kind,
                        budget_ms = self.run_budget.as_millis() as u64,
                        "benchmark run budget spent"
                    );
                    return BenchmarkResult::failed(
                        kind,
                        format!("benchmark run budget of {}ms spent", self.run_budget.as_millis()),
                    );
                }
                self.measure(kind, profile, limit)
            })
            .collect();
        info!(
            kinds = kinds.len(),
            succeeded = results.iter().filter(|r| r.success).count(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "benchmark run finished"
        );
        BenchmarkSnapshot {
            results,
            taken_at: Instant::now(),
            captured_at: SystemTime::now(),
            critical_epoch,
        }
    }

    /// Measure one kind on a worker thread, giving up after the timeout.
    pub fn benchmark_one(&self, kind: BackendKind, profile: &DeviceProfile) -> BenchmarkResult {
        self.measure(kind, profile, self.timeout)
    }

    fn measure(&self, kind: BackendKind, profile: &DeviceProfile, limit: Duration) -> BenchmarkResult {
        let backend = Arc::clone(self.registry.get(kind));
        if !backend.is_supported(profile) {
            return BenchmarkResult::failed(kind, SchedulerError::UnsupportedBackend(kind).to_string());
        }

        let workload = Arc::clone(&self.workload);
        match run_bounded(&self.abandoned, kind, "bench", limit, move || backend.benchmark(&workload)) {
            Bounded::Done(Ok(measurement)) => {
                debug!(
                    backend = %kind,
                    mean_ms = measurement.execution_time_ms,
                    "benchmark succeeded"
                );
                BenchmarkResult::succeeded(kind, measurement)
            }
            Bounded::Done(Err(e)) => {
                warn!(backend = %kind, error = %e, "benchmark failed");
                BenchmarkResult::failed(kind, e.to_string())
            }
            Bounded::TimedOut => {
                let e = SchedulerError::BenchmarkTimeout {
                    backend: kind,
                    timeout_ms: limit.as_millis() as u64,
                };
                warn!(error = %e, "benchmark abandoned");
                BenchmarkResult::failed(kind, e.to_string())
            }
            Bounded::StillRunning => {
                warn!(backend = %kind, "previous benchmark still running; skipped");
                BenchmarkResult::failed(kind, "previous benchmark still running")
            }
            Bounded::Panicked => {
                warn!(backend = %kind, "benchmark thread panicked");
                BenchmarkResult::failed(kind, "benchmark thread panicked")
            }
            Bounded::SpawnFailed(e) => {
                BenchmarkResult::failed(kind, format!("failed to start benchmark thread: {e}"))
            }
        }
    }
}

//! Compute backends and the per-kind registry

use super::benchmarks::ReferenceWorkload;
use super::*;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

#[cfg(feature = "multicore")]
use rayon::prelude::*;

/// Timing of one benchmark run
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkMeasurement {
    /// Mean wall time of one iteration.
    pub execution_time_ms: f64,
    /// Iterations per second.
    pub performance_score: f64,
    pub memory_bytes: u64,
}

/// A concrete execution path the router can pick
pub trait ComputeBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Whether the backend can run at all on this device.
    fn is_supported(&self, profile: &DeviceProfile) -> bool;

    /// Quick correctness check run before a backend is activated.
    fn self_test(&self) -> Result<()>;

    fn benchmark(&self, workload: &ReferenceWorkload) -> Result<BenchmarkMeasurement>;
}

/// Vendor acceleration library exposed by the host
pub trait AcceleratorDriver: Send + Sync {
    fn name(&self) -> &str;

    fn is_available(&self) -> bool {
        true
    }

    /// Row-major product of two `dim x dim` matrices.
    fn matmul(&self, lhs: &[f32], rhs: &[f32], dim: usize) -> std::result::Result<Vec<f32>, String>;
}

/// Portable CPU implementation; always available
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuGenericBackend;

/// GPU or NPU backend delegating to an optional host driver
pub struct AcceleratorBackend {
    kind: BackendKind,
    driver: Option<Arc<dyn AcceleratorDriver>>,
}

/// Exactly one backend per [`BackendKind`]
pub struct BackendRegistry {
    backends: [Arc<dyn ComputeBackend>; 4],
}

/// Worker threads whose caller stopped waiting for them
///
/// A worker that outlives its timeout keeps its kind blocked until it returns,
/// so a hung driver ties up at most one thread per kind.
#[derive(Debug, Default, Clone)]
pub struct AbandonedWorkers {
    workers: Arc<DashMap<BackendKind, Arc<AtomicBool>>>,
}

/// How a [`run_bounded`] job ended
#[derive(Debug, PartialEq)]
pub enum Bounded<T> {
    Done(T),
    TimedOut,
    Panicked,
    /// An earlier worker for the same kind has not returned yet.
    StillRunning,
    SpawnFailed(String),
}

/// Sets the flag when the worker exits, unwinding included.
struct FinishedOnDrop(Arc<AtomicBool>);

impl Drop for FinishedOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Release);
    }
}

impl AbandonedWorkers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether an abandoned worker for `kind` is still running.
    pub fn is_running(&self, kind: BackendKind) -> bool {
        self.workers.remove_if(&kind, |_, finished| finished.load(Ordering::Acquire));
        self.workers.contains_key(&kind)
    }

    fn abandon(&self, kind: BackendKind, finished: Arc<AtomicBool>) {
        self.workers.insert(kind, finished);
    }
}

/// Run `job` for `kind` on its own thread and wait at most `limit` for it.
pub fn run_bounded<T, F>(
    abandoned: &AbandonedWorkers,
    kind: BackendKind,
    role: &str,
    limit: Duration,
    job: F,
) -> Bounded<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    if abandoned.is_running(kind) {
        return Bounded::StillRunning;
    }
    let finished = Arc::new(AtomicBool::new(false));
    let marker = FinishedOnDrop(Arc::clone(&finished));
    let (tx, rx) = mpsc::channel();
    let spawned = thread::Builder::new()
        .name(format!("{role}-{}", kind.label().to_ascii_lowercase()))
        .spawn(move || {
            let _marker = marker;
            let _ = tx.send(job());
        });
    if let Err(e) = spawned {
        return Bounded::SpawnFailed(e.to_string());
    }

    match rx.recv_timeout(limit) {
        Ok(value) => Bounded::Done(value),
        Err(RecvTimeoutError::Timeout) => {
            abandoned.abandon(kind, finished);
            Bounded::TimedOut
        }
        Err(RecvTimeoutError::Disconnected) => Bounded::Panicked,
    }
}

fn row_product(lhs: &[f32], rhs: &[f32], dim: usize, i: usize, row: &mut [f32]) {
    row.fill(0.0);
    for k in 0..dim {
        let a = lhs[i * dim + k];
        for (cell, b) in row.iter_mut().zip(&rhs[k * dim..(k + 1) * dim]) {
            *cell += a * b;
        }
    }
}

/// `out = lhs * rhs` for square row-major matrices of side `dim`.
pub(crate) fn matmul_into(lhs: &[f32], rhs: &[f32], dim: usize, out: &mut [f32]) {
    #[cfg(feature = "multicore")]
    out.par_chunks_mut(dim)
        .enumerate()
        .for_each(|(i, row)| row_product(lhs, rhs, dim, i, row));

    #[cfg(not(feature = "multicore"))]
    out.chunks_mut(dim)
        .enumerate()
        .for_each(|(i, row)| row_product(lhs, rhs, dim, i, row));
}

/// Run warmups, check the first timed output, then time the remaining iterations.
pub(crate) fn measure<F>(
    kind: BackendKind,
    workload: &ReferenceWorkload,
    mut run: F,
) -> Result<BenchmarkMeasurement>
where
    F: FnMut() -> Result<Vec<f32>>,
{
    for _ in 0..workload.warmup_iterations() {
        run()?;
    }

    let start = Instant::now();
    for iteration in 0..workload.iterations() {
        let out = run()?;
        if iteration == 0 && !workload.matches_reference(&out) {
            return Err(SchedulerError::BenchmarkFailed {
                backend: kind,
                reason: "result differs from CPU reference".into(),
            });
        }
    }
    let total_ms = start.elapsed().as_secs_f64() * 1000.0;
    let mean_ms = (total_ms / workload.iterations() as f64).max(1e-6);

    Ok(BenchmarkMeasurement {
        execution_time_ms: mean_ms,
        performance_score: 1000.0 / mean_ms,
        memory_bytes: workload.footprint_bytes(),
    })
}

impl CpuGenericBackend {
    pub fn new() -> Self {
        Self
    }
}

impl ComputeBackend for CpuGenericBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::CpuGeneric
    }

    fn is_supported(&self, _profile: &DeviceProfile) -> bool {
        true
    }

    fn self_test(&self) -> Result<()> {
        Ok(())
    }

    fn benchmark(&self, workload: &ReferenceWorkload) -> Result<BenchmarkMeasurement> {
        let dim = workload.dim();
        measure(BackendKind::CpuGeneric, workload, || {
            let mut out = vec![0.0f32; dim * dim];
            matmul_into(workload.lhs(), workload.rhs(), dim, &mut out);
            Ok(out)
        })
    }
}

const SELF_TEST_DIM: usize = 4;

impl AcceleratorBackend {
    /// Backend with no driver; reports itself unsupported.
    pub fn new(kind: BackendKind) -> Self {
        Self { kind, driver: None }
    }

    pub fn with_driver(kind: BackendKind, driver: Arc<dyn AcceleratorDriver>) -> Self {
        Self { kind, driver: Some(driver) }
    }

    fn driver(&self) -> Result<&Arc<dyn AcceleratorDriver>> {
        self.driver.as_ref().ok_or(SchedulerError::UnsupportedBackend(self.kind))
    }
}

impl ComputeBackend for AcceleratorBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn is_supported(&self, _profile: &DeviceProfile) -> bool {
        self.driver.as_ref().map_or(false, |driver| driver.is_available())
    }

    /// Multiply a small known matrix by `2 * I` and compare with the expected product.
    fn self_test(&self) -> Result<()> {
        let driver = self.driver()?;
        let n = SELF_TEST_DIM;
        let lhs: Vec<f32> = (0..n * n).map(|i| (i + 1) as f32 / 16.0).collect();
        let mut rhs = vec![0.0f32; n * n];
        for i in 0..n {
            rhs[i * n + i] = 2.0;
        }

        let fail = |reason: String| SchedulerError::BackendSelfTestFailed { backend: self.kind, reason };
        let out = driver.matmul(&lhs, &rhs, n).map_err(fail)?;
        if out.len() != n * n {
            return Err(fail(format!("expected {} values, driver returned {}", n * n, out.len())));
        }
        if let Some((idx, got)) = out
            .iter()
            .enumerate()
            .find(|(idx, got)| (**got - 2.0 * lhs[*idx]).abs() > 1e-3)
        {
            return Err(fail(format!("element {idx} is {got}, expected {}", 2.0 * lhs[idx])));
        }
        Ok(())
    }

    fn benchmark(&self, workload: &ReferenceWorkload) -> Result<BenchmarkMeasurement> {
        let driver = self.driver()?;
        let kind = self.kind;
        measure(kind, workload, || {
            driver
                .matmul(workload.lhs(), workload.rhs(), workload.dim())
                .map_err(|reason| SchedulerError::BenchmarkFailed { backend: kind, reason })
        })
    }
}

impl BackendRegistry {
    /// CPU plus driverless accelerators.
    pub fn new() -> Self {
        Self {
            backends: [
                Arc::new(CpuGenericBackend::new()),
                Arc::new(AcceleratorBackend::new(BackendKind::GpuOpenCl)),
                Arc::new(AcceleratorBackend::new(BackendKind::GpuVulkan)),
                Arc::new(AcceleratorBackend::new(BackendKind::AcceleratorNpu)),
            ],
        }
    }

    /// Replace the backend registered for `backend.kind()`.
    pub fn with_backend(mut self, backend: Arc<dyn ComputeBackend>) -> Self {
        let index = backend.kind().index();
        self.backends[index] = backend;
        self
    }

    pub fn with_driver(self, kind: BackendKind, driver: Arc<dyn AcceleratorDriver>) -> Self {
        if kind == BackendKind::CpuGeneric {
            warn!(driver = driver.name(), "ignoring accelerator driver registered for CPU_GENERIC");
            return self;
        }
        self.with_backend(Arc::new(AcceleratorBackend::with_driver(kind, driver)))
    }

    pub fn get(&self, kind: BackendKind) -> &Arc<dyn ComputeBackend> {
        &self.backends[kind.index()]
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Driver that multiplies on the CPU, optionally corrupting the result.
    struct HostDriver {
        corrupt: bool,
    }

    impl AcceleratorDriver for HostDriver {
        fn name(&self) -> &str {
            "host"
        }

        fn matmul(&self, lhs: &[f32], rhs: &[f32], dim: usize) -> std::result::Result<Vec<f32>, String> {
            let mut out = vec![0.0; dim * dim];
            matmul_into(lhs, rhs, dim, &mut out);
            if self.corrupt {
                out[0] += 1.0;
            }
            Ok(out)
        }
    }

    fn workload() -> ReferenceWorkload {
        ReferenceWorkload::new(16, 2, 1)
    }

    #[test]
    fn bounded_job_times_out_and_blocks_its_kind() {
        let abandoned = AbandonedWorkers::new();
        let (release, gate) = mpsc::channel::<()>();
        let hung = run_bounded(&abandoned, BackendKind::GpuOpenCl, "test", Duration::from_millis(20), move || {
            let _ = gate.recv();
        });
        assert_eq!(hung, Bounded::TimedOut);
        assert!(abandoned.is_running(BackendKind::GpuOpenCl));

        let again = run_bounded(&abandoned, BackendKind::GpuOpenCl, "test", Duration::from_secs(1), || 1);
        assert_eq!(again, Bounded::StillRunning);
        // other kinds are unaffected
        let other = run_bounded(&abandoned, BackendKind::GpuVulkan, "test", Duration::from_secs(1), || 2);
        assert_eq!(other, Bounded::Done(2));

        drop(release);
        let deadline = Instant::now() + Duration::from_secs(5);
        while abandoned.is_running(BackendKind::GpuOpenCl) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        let recovered = run_bounded(&abandoned, BackendKind::GpuOpenCl, "test", Duration::from_secs(1), || 3);
        assert_eq!(recovered, Bounded::Done(3));
    }

    #[test]
    fn bounded_job_reports_panics() {
        let abandoned = AbandonedWorkers::new();
        let outcome: Bounded<()> =
            run_bounded(&abandoned, BackendKind::AcceleratorNpu, "test", Duration::from_secs(5), || {
                panic!("driver crashed")
            });
        assert_eq!(outcome, Bounded::Panicked);
        assert!(!abandoned.is_running(BackendKind::AcceleratorNpu));
    }

    #[test]
    fn matmul_identity() {
        let dim = 3;
        let a: Vec<f32> = (0..9).map(|v| v as f32).collect();
        let mut id = vec![0.0; 9];
        for i in 0..dim {
            id[i * dim + i] = 1.0;
        }
        let mut out = vec![0.0; 9];
        matmul_into(&a, &id, dim, &mut out);
        assert_eq!(out, a);
    }

    #[test]
    fn cpu_benchmark_succeeds() {
        let m = CpuGenericBackend::new().benchmark(&workload()).unwrap();
        assert!(m.execution_time_ms > 0.0);
        assert!(m.performance_score > 0.0);
        assert_eq!(m.memory_bytes, 3 * 16 * 16 * 4);
        assert!(CpuGenericBackend::new().self_test().is_ok());
    }

    #[test]
    fn driverless_accelerator_is_unsupported() {
        let npu = AcceleratorBackend::new(BackendKind::AcceleratorNpu);
        assert!(!npu.is_supported(&DeviceProfile::fallback()));
        assert_eq!(
            npu.self_test(),
            Err(SchedulerError::UnsupportedBackend(BackendKind::AcceleratorNpu))
        );
        assert!(npu.benchmark(&workload()).is_err());
    }

    #[test]
    fn driver_backed_accelerator() {
        let good = AcceleratorBackend::with_driver(
            BackendKind::GpuVulkan,
            Arc::new(HostDriver { corrupt: false }),
        );
        assert!(good.is_supported(&DeviceProfile::fallback()));
        assert!(good.self_test().is_ok());
        assert!(good.benchmark(&workload()).is_ok());

        let bad = AcceleratorBackend::with_driver(
            BackendKind::GpuVulkan,
            Arc::new(HostDriver { corrupt: true }),
        );
        assert!(matches!(bad.self_test(), Err(SchedulerError::BackendSelfTestFailed { .. })));
        assert!(matches!(
            bad.benchmark(&workload()),
            Err(SchedulerError::BenchmarkFailed { .. })
        ));
    }

    #[test]
    fn registry_holds_one_backend_per_kind() {
        let registry = BackendRegistry::new()
            .with_driver(BackendKind::GpuOpenCl, Arc::new(HostDriver { corrupt: false }))
            .with_driver(BackendKind::CpuGeneric, Arc::new(HostDriver { corrupt: false }));
        for kind in BackendKind::ALL {
            assert_eq!(registry.get(kind).kind(), kind);
        }
        let profile = DeviceProfile::fallback();
        assert!(registry.get(BackendKind::GpuOpenCl).is_supported(&profile));
        assert!(!registry.get(BackendKind::GpuVulkan).is_supported(&profile));
    }
}

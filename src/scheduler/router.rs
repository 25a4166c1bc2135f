//! Backend routing
//!
//! Selection order for a task:
//!
//! 1. serve a cached decision if it is usable under the current thermal state;
//! 2. take the device's preference list from the matrix;
//! 3. apply the thermal filter (CPU only at CRITICAL or hotter, CPU first at SEVERE);
//! 4. below SEVERE and with more than one candidate, rank by benchmark score
//!    weighted for the task; from SEVERE up keep the filtered order;
//! 5. validate in that order (capability flag, support, bounded self-test);
//! 6. fall back to CPU_GENERIC if nothing validates.

use super::backend::{run_bounded, AbandonedWorkers, Bounded};
use super::matrix::Candidates;
use super::*;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;
use tracing::debug;

/// Chooses and activates backends
pub struct BackendRouter {
    profiles: Arc<DeviceProfileProvider>,
    thermal: Arc<ThermalStateMachine>,
    matrix: BackendPreferenceMatrix,
    registry: Arc<BackendRegistry>,
    engine: BenchmarkEngine,
    cache: BackendSelectionCache,
    current: AtomicU8,
    self_test_timeout: Duration,
    abandoned: AbandonedWorkers,
}

/// Restrict `candidates` for the thermal state. Preserves matrix order except
/// that SEVERE moves CPU to the front.
pub fn thermal_filter(candidates: &[BackendKind], state: ThermalState) -> Candidates {
    match state {
        ThermalState::Critical | ThermalState::Emergency => {
            smallvec::smallvec![BackendKind::CpuGeneric]
        }
        ThermalState::Severe => {
            let mut filtered: Candidates = smallvec::smallvec![BackendKind::CpuGeneric];
            filtered.extend(candidates.iter().copied().filter(|&k| k != BackendKind::CpuGeneric));
            filtered
        }
        ThermalState::None | ThermalState::Light | ThermalState::Moderate => {
            let mut filtered: Candidates = candidates.iter().copied().collect();
            if !filtered.contains(&BackendKind::CpuGeneric) {
                filtered.push(BackendKind::CpuGeneric);
            }
            filtered
        }
    }
}

/// Order `candidates` for validation.
///
/// Candidates with a successful benchmark come first by descending weighted
/// score; ties keep matrix order. Without any successful result the filtered
/// matrix order is used as is.
pub fn rank_candidates(
    candidates: &[BackendKind],
    snapshot: Option<&BenchmarkSnapshot>,
    weights: ScoringWeights,
) -> Candidates {
    let mut scored: Vec<(BackendKind, f64)> = snapshot
        .map(|s| {
            candidates
                .iter()
                .filter_map(|&kind| s.result(kind).and_then(|r| r.score(weights)).map(|sc| (kind, sc)))
                .collect()
        })
        .unwrap_or_default();

    if scored.is_empty() {
        return candidates.iter().copied().collect();
    }
    // stable: equal scores keep matrix order
    scored.sort_by(|a, b| b.1.total_cmp(&a.1));
    scored.into_iter().map(|(kind, _)| kind).collect()
}

impl BackendRouter {
    pub fn new(
        profiles: Arc<DeviceProfileProvider>,
        thermal: Arc<ThermalStateMachine>,
        matrix: BackendPreferenceMatrix,
        registry: Arc<BackendRegistry>,
        engine: BenchmarkEngine,
        cache: BackendSelectionCache,
    ) -> Self {
        let self_test_timeout = engine.timeout();
        Self {
            profiles,
            thermal,
            matrix,
            registry,
            engine,
            cache,
            current: AtomicU8::new(BackendKind::CpuGeneric.index() as u8),
            self_test_timeout,
            abandoned: AbandonedWorkers::new(),
        }
    }

    /// Limit on a single self-test; defaults to the benchmark timeout.
    pub fn with_self_test_timeout(mut self, timeout: Duration) -> Self {
        self.self_test_timeout = timeout;
        self
    }

    pub fn select_backend(&self, task: ComputeTask) -> BackendKind {
        let profile = self.profiles.current();
        let key = SelectionKey::new(task, profile.fingerprint());
        let state = self.thermal.current_state();

        if let Some(decision) = self.cache.get(&key) {
            if decision.is_usable_under(state) {
                debug!(task = %task, backend = %decision.backend, "cached backend decision");
                self.set_current(decision.backend);
                return decision.backend;
            }
            debug!(
                task = %task,
                cached_state = %decision.thermal_state,
                state = %state,
                "cached decision stale"
            );
        }

        let backend = self.decide(task, &profile, state);
        self.cache.insert(key, BackendDecision::new(backend, state));
        self.set_current(backend);
        info!(task = %task, backend = %backend, thermal = %state, "backend selected");
        backend
    }

    fn decide(&self, task: ComputeTask, profile: &DeviceProfile, state: ThermalState) -> BackendKind {
        let preferred = self.matrix.preferences(profile.soc_vendor, profile.device_tier);
        let candidates = thermal_filter(&preferred, state);

        // The hot bucket is CPU-only: CPU leads and scores are not consulted.
        let ranked = if candidates.len() > 1 && state.bucket() != ThermalBucket::Severe {
            let snapshot =
                self.engine.snapshot_for(&candidates, profile, self.thermal.critical_epoch());
            rank_candidates(&candidates, Some(&snapshot), task.weights())
        } else {
            candidates
        };

        for kind in ranked {
            match self.check(kind, profile) {
                Ok(()) => return kind,
                Err(e) => warn!(task = %task, error = %e, "candidate rejected"),
            }
        }
        BackendKind::CpuGeneric
    }

    /// Capability flag, support and self-test. The self-test runs on a worker
    /// thread; a panic, a timeout or a still-hung earlier run count as failures.
    fn check(&self, kind: BackendKind, profile: &DeviceProfile) -> Result<()> {
        if !profile.advertises(kind) {
            return Err(SchedulerError::UnsupportedBackend(kind));
        }
        let backend = Arc::clone(self.registry.get(kind));
        if !backend.is_supported(profile) {
            return Err(SchedulerError::UnsupportedBackend(kind));
        }
        let fail = |reason: String| SchedulerError::BackendSelfTestFailed { backend: kind, reason };
        match run_bounded(&self.abandoned, kind, "selftest", self.self_test_timeout, move || {
            backend.self_test()
        }) {
            Bounded::Done(result) => result,
            Bounded::TimedOut => Err(fail(format!(
                "self-test exceeded {}ms",
                self.self_test_timeout.as_millis()
            ))),
            Bounded::StillRunning => Err(fail("previous self-test still running".into())),
            Bounded::Panicked => Err(fail("self-test panicked".into())),
            Bounded::SpawnFailed(e) => Err(fail(format!("failed to start self-test thread: {e}"))),
        }
    }

    pub fn validate_backend(&self, kind: BackendKind) -> Result<()> {
        self.check(kind, &self.profiles.current())
    }

    /// Activate `kind` after validation; the current backend is left alone on error.
    pub fn switch_backend(&self, kind: BackendKind) -> Result<()> {
        if let Err(e) = self.validate_backend(kind) {
            warn!(backend = %kind, error = %e, "backend switch refused");
            return Err(e);
        }
        let previous = self.current_backend();
        self.set_current(kind);
        info!(from = %previous, to = %kind, "backend switched");
        Ok(())
    }

    pub fn current_backend(&self) -> BackendKind {
        BackendKind::from_index(self.current.load(Ordering::Acquire))
    }

    fn set_current(&self, kind: BackendKind) {
        self.current.store(kind.index() as u8, Ordering::Release);
    }

    /// Thermal hook: entering CRITICAL or EMERGENCY evicts decisions that are
    /// no longer usable and drops the benchmark snapshot.
    pub fn handle_transition(&self, transition: &ThermalTransition) {
        if !transition.to.is_critical() {
            return;
        }
        let evicted = self.cache.retain_usable(transition.to);
        self.engine.invalidate();
        debug!(state = %transition.to, evicted, "critical thermal state; cache pruned");
    }

    pub fn cache(&self) -> &BackendSelectionCache {
        &self.cache
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    pub fn benchmark_snapshot(&self) -> Option<Arc<BenchmarkSnapshot>> {
        self.engine.latest()
    }

    pub fn benchmark_runs(&self) -> u64 {
        self.engine.run_count()
    }

    pub fn invalidate_benchmarks(&self) {
        self.engine.invalidate();
    }
}

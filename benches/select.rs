//! Selection hot-path benchmarks
//!
//! The cached path of `select_backend` runs on every inference request, so it
//! must stay well below the cost of the work it routes.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use libscheduler::config::GenerationLimits;
use libscheduler::scheduler::params::adapt_parameters;
use libscheduler::scheduler::router::{rank_candidates, thermal_filter};
use libscheduler::scheduler::{
    AdaptiveScheduler, BackendKind, BenchmarkMeasurement, BenchmarkResult, BenchmarkSnapshot,
    Capability, ComputeTask, GenerationParams, GpuVendor, InventorySnapshot, PerformanceProfile,
    SocVendor, StaticInventory, ThermalState,
};
use std::hint::black_box;
use std::sync::Arc;
use std::time::{Instant, SystemTime};

fn scheduler() -> AdaptiveScheduler {
    let snapshot = InventorySnapshot {
        soc_vendor: SocVendor::Qualcomm,
        soc_model: "SM8650".into(),
        gpu_vendor: GpuVendor::Adreno,
        total_memory: 12 << 30,
        available_memory: 6 << 30,
        platform_version: 34,
        cpu_cores: 8,
        capabilities: [Capability::AcceleratorOpenCl, Capability::AcceleratorVulkan].into_iter().collect(),
        ..InventorySnapshot::default()
    };
    AdaptiveScheduler::new(Arc::new(StaticInventory::new(snapshot))).unwrap()
}

fn bench_cached_selection(c: &mut Criterion) {
    let scheduler = scheduler();
    let mut group = c.benchmark_group("select_backend");
    for task in ComputeTask::ALL {
        // first call fills the cache
        scheduler.select_backend(task);
        group.bench_with_input(BenchmarkId::new("cached", task.label()), &task, |b, &task| {
            b.iter(|| scheduler.select_backend(black_box(task)))
        });
    }
    // decision rebuilt from the still-fresh benchmark snapshot
    group.bench_function("uncached", |b| {
        b.iter(|| {
            scheduler.clear_cache();
            scheduler.select_backend(black_box(ComputeTask::LlmInference))
        })
    });
    group.finish();
}

fn bench_filter_and_rank(c: &mut Criterion) {
    let prefs = [
        BackendKind::AcceleratorNpu,
        BackendKind::GpuVulkan,
        BackendKind::GpuOpenCl,
        BackendKind::CpuGeneric,
    ];
    let snapshot = BenchmarkSnapshot {
        results: prefs
            .iter()
            .enumerate()
            .map(|(i, &kind)| {
                BenchmarkResult::succeeded(
                    kind,
                    BenchmarkMeasurement {
                        execution_time_ms: 5.0 + i as f64,
                        performance_score: 100.0 / (i + 1) as f64,
                        memory_bytes: 786_432,
                    },
                )
            })
            .collect(),
        taken_at: Instant::now(),
        captured_at: SystemTime::now(),
        critical_epoch: 0,
    };

    let mut group = c.benchmark_group("routing");
    for state in [ThermalState::None, ThermalState::Severe, ThermalState::Critical] {
        group.bench_with_input(BenchmarkId::new("filter_rank", state.label()), &state, |b, &state| {
            b.iter(|| {
                let filtered = thermal_filter(black_box(&prefs), state);
                rank_candidates(&filtered, Some(&snapshot), ComputeTask::LlmInference.weights())
            })
        });
    }
    group.finish();
}

fn bench_adapt_parameters(c: &mut Criterion) {
    let params = GenerationParams::default();
    let limits = GenerationLimits::default();
    c.bench_function("adapt_parameters", |b| {
        b.iter(|| {
            for state in ThermalState::ALL {
                black_box(adapt_parameters(&params, state, PerformanceProfile::Balanced, &limits));
            }
        })
    });
}

criterion_group!(benches, bench_cached_selection, bench_filter_and_rank, bench_adapt_parameters);
criterion_main!(benches);

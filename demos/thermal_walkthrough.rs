//! # Thermal Walkthrough
//!
//! Heats a simulated flagship handset from NONE to EMERGENCY and lets it cool
//! back down, printing after every step:
//! - the backend chosen for LLM inference
//! - the adapted generation parameters
//! - the worker thread budget and active performance profile
//!
//! Transitions are consumed from the scheduler's broadcast channel on a
//! separate thread, the way a UI layer would.

use libscheduler::scheduler::{
    AcceleratorDriver, AdaptiveScheduler, BackendKind, Capability, ComputeTask, GenerationParams,
    GpuVendor, InventorySnapshot, SocVendor, StaticInventory, ThermalState,
};
use std::sync::Arc;

struct HostDriver;

impl AcceleratorDriver for HostDriver {
    fn name(&self) -> &str {
        "host-cpu"
    }

    fn matmul(&self, lhs: &[f32], rhs: &[f32], dim: usize) -> Result<Vec<f32>, String> {
        let mut out = vec![0.0f32; dim * dim];
        for i in 0..dim {
            for k in 0..dim {
                let a = lhs[i * dim + k];
                for j in 0..dim {
                    out[i * dim + j] += a * rhs[k * dim + j];
                }
            }
        }
        Ok(out)
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let inventory = StaticInventory::new(InventorySnapshot {
        soc_vendor: SocVendor::Qualcomm,
        soc_model: "SM8650".into(),
        gpu_vendor: GpuVendor::Adreno,
        total_memory: 12 << 30,
        available_memory: 6 << 30,
        platform_version: 34,
        cpu_cores: 8,
        capabilities: [
            Capability::AcceleratorNpu,
            Capability::AcceleratorOpenCl,
            Capability::AcceleratorVulkan,
        ]
        .into_iter()
        .collect(),
        ..InventorySnapshot::default()
    });

    let scheduler = AdaptiveScheduler::builder(Arc::new(inventory))
        .accelerator_driver(BackendKind::AcceleratorNpu, Arc::new(HostDriver))
        .accelerator_driver(BackendKind::GpuOpenCl, Arc::new(HostDriver))
        .accelerator_driver(BackendKind::GpuVulkan, Arc::new(HostDriver))
        .build()?;

    let mut rx = scheduler.subscribe();
    let listener = std::thread::spawn(move || {
        let mut seen = 0usize;
        while let Ok(t) = rx.blocking_recv() {
            println!("    ~ transition {} -> {} ({})", t.from, t.to, t.profile);
            seen += 1;
        }
        seen
    });

    let requested = GenerationParams::default();
    println!("Step 1: heating up");
    let heating = ThermalState::ALL;
    let cooling = [ThermalState::Critical, ThermalState::Moderate, ThermalState::None];

    for (step, state) in heating.iter().chain(cooling.iter()).enumerate() {
        if step == heating.len() {
            println!("\nStep 2: cooling down");
        }
        scheduler.thermal().observe(*state);
        let backend = scheduler.select_backend(ComputeTask::LlmInference);
        let params = scheduler.adapt_parameters(&requested);
        println!(
            "  {:>9}: backend={:<16} max_tokens={:<4} temperature={:.2} threads={} profile={}",
            state.label(),
            backend.label(),
            params.max_tokens,
            params.temperature,
            scheduler.optimal_thread_count(),
            scheduler.current_performance_profile(),
        );
    }

    println!("\nStep 3: history");
    for t in scheduler.thermal().history() {
        println!("  {} -> {} epoch={}", t.from, t.to, t.critical_epoch);
    }

    scheduler.shutdown()?;
    // closing the channel ends the listener
    drop(scheduler);
    let seen = listener.join().map_err(|_| "listener panicked")?;
    println!("\nlistener saw {seen} transitions");
    Ok(())
}

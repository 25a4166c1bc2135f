//! # Routing Profiler
//!
//! Walks a set of representative device classes through every thermal state and
//! prints which backend each task is routed to, together with the benchmark
//! snapshot that drove the decision.
//!
//! Accelerators are backed by a host CPU driver so that every candidate in the
//! preference matrix produces a real measurement.
//!
//! Usage: `route [scheduler.toml]`

extern crate libscheduler;

use libscheduler::scheduler::{
    AcceleratorDriver, AdaptiveScheduler, BackendKind, Capability, ComputeTask, GpuVendor,
    HardwareInventory, InventorySnapshot, SocVendor, StaticInventory, SystemInventory,
    ThermalState,
};
use libscheduler::SchedulerConfig;
use std::sync::Arc;
use std::time::Instant;

#[cfg(feature = "profile")]
use colored::Colorize;

const GB: u64 = 1 << 30;

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

fn device(vendor: SocVendor, soc_model: &str, gpu: GpuVendor, memory_gb: u64) -> InventorySnapshot {
    InventorySnapshot {
        soc_vendor: vendor,
        soc_model: soc_model.to_string(),
        gpu_vendor: gpu,
        gpu_model: String::new(),
        total_memory: memory_gb * GB,
        available_memory: memory_gb * GB / 2,
        platform_version: 34,
        cpu_cores: 8,
        capabilities: [
            Capability::AcceleratorOpenCl,
            Capability::AcceleratorVulkan,
            Capability::AcceleratorNpu,
            Capability::Fp16,
        ]
        .into_iter()
        .collect(),
    }
}

fn paint(kind: BackendKind) -> String {
    #[cfg(feature = "profile")]
    {
        match kind {
            BackendKind::CpuGeneric => kind.label().yellow().to_string(),
            _ => kind.label().green().to_string(),
        }
    }
    #[cfg(not(feature = "profile"))]
    {
        kind.label().to_string()
    }
}

fn main() {
    let config = match std::env::args().nth(1) {
        Some(path) => match SchedulerConfig::from_file(&path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("{e}");
                std::process::exit(2);
            }
        },
        None => SchedulerConfig::default(),
    };

    let host: Arc<dyn HardwareInventory> = Arc::new(SystemInventory::new(34));
    let fixed = |snapshot: InventorySnapshot| -> Arc<dyn HardwareInventory> {
        Arc::new(StaticInventory::new(snapshot))
    };
    let devices = [
        ("This host", host),
        ("Qualcomm flagship", fixed(device(SocVendor::Qualcomm, "SM8650", GpuVendor::Adreno, 12))),
        ("Qualcomm mid-range", fixed(device(SocVendor::Qualcomm, "SM7325", GpuVendor::Adreno, 6))),
        ("Samsung flagship", fixed(device(SocVendor::Samsung, "Exynos 2400", GpuVendor::Xclipse, 12))),
        ("Google high-end", fixed(device(SocVendor::Google, "Tensor G3", GpuVendor::Mali, 8))),
        ("MediaTek flagship", fixed(device(SocVendor::MediaTek, "Dimensity 9300", GpuVendor::Mali, 16))),
        ("Generic budget", fixed(device(SocVendor::Other, "generic", GpuVendor::Other, 4))),
    ];

    println!("\n{}", "=".repeat(100));
    println!("{:^100}", "BACKEND ROUTING PROFILER");
    println!(
        "{:^100}",
        format!("target {} ({})", env!("SCHEDULER_TARGET"), env!("SCHEDULER_PROFILE"))
    );
    println!("{}", "=".repeat(100));

    for (name, inventory) in devices {
        let mut builder = AdaptiveScheduler::builder(inventory).config(config.clone());
        for kind in [BackendKind::GpuOpenCl, BackendKind::GpuVulkan, BackendKind::AcceleratorNpu] {
            builder = builder.accelerator_driver(kind, Arc::new(HostDriver));
        }
        let scheduler = match builder.build() {
            Ok(scheduler) => scheduler,
            Err(e) => {
                eprintln!("{name}: {e}");
                continue;
            }
        };
        let profile = scheduler.device_profile();
        println!("\n📱 {name}: {}/{}", profile.soc_vendor, profile.device_tier);
        println!(
            "{:>10} | {:>16} | {:>20} | {:>16} | {:>17} | {:>8}",
            "thermal", "LLM", "EMBEDDING", "SAFETY", "ASR", "ms"
        );
        println!("{}", "-".repeat(100));

        for state in ThermalState::ALL {
            scheduler.thermal().observe(state);
            let start = Instant::now();
            let picks: Vec<String> =
                ComputeTask::ALL.iter().map(|&task| paint(scheduler.select_backend(task))).collect();
            println!(
                "{:>10} | {:>16} | {:>20} | {:>16} | {:>17} | {:>8}",
                state,
                picks[0],
                picks[1],
                picks[2],
                picks[3],
                start.elapsed().as_millis()
            );
        }

        if let Some(snapshot) = scheduler.benchmark_snapshot() {
            println!("\n    benchmark snapshot (epoch {}):", snapshot.critical_epoch);
            for line in snapshot.to_csv().lines() {
                println!("    {line}");
            }
        }
        println!(
            "    benchmark runs: {}, cached decisions: {}",
            scheduler.router().benchmark_runs(),
            scheduler.router().cache().len()
        );
    }
}

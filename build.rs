//! Build script for the adaptive scheduler

use std::env;

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rustc-check-cfg=cfg(mobile)");

    let target_os = env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();
    configure_platform_flags(&target_os);

    generate_version_info();
}

fn configure_platform_flags(target_os: &str) {
    // SoC detection from /proc/cpuinfo is only meaningful on handsets
    if matches!(target_os, "android" | "ios") {
        println!("cargo:rustc-cfg=mobile");
    }
}

/// Build metadata shown by the `route` profiler
fn generate_version_info() {
    let target = env::var("TARGET").unwrap_or_else(|_| "unknown".into());
    let profile = env::var("PROFILE").unwrap_or_else(|_| "unknown".into());
    println!("cargo:rustc-env=SCHEDULER_TARGET={target}");
    println!("cargo:rustc-env=SCHEDULER_PROFILE={profile}");
}

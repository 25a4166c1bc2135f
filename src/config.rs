//! Scheduler configuration
//!
//! Every tunable of the scheduler lives here. Values can be supplied as TOML
//! (any missing key keeps its default) and are checked by [`SchedulerConfig::validate`]
//! before the scheduler is built.

#![allow(missing_docs)]

use crate::errors::{Result, SchedulerError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub thermal: ThermalConfig,
    pub benchmark: BenchmarkConfig,
    pub generation: GenerationLimits,
    pub cache: CacheConfig,
}

/// Thermal monitoring tunables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThermalConfig {
    /// Poll period of the background monitor when no push source exists.
    pub poll_interval_ms: u64,
    /// Buffered transitions per subscriber before it starts lagging.
    pub notification_capacity: usize,
    pub heuristic: HeuristicThresholds,
}

/// Thresholds for the polled heuristic (battery temperature + CPU utilisation).
///
/// These are uncalibrated defaults. Devices differ widely in where their
/// battery sensor sits, so hosts should override them per device family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeuristicThresholds {
    pub light_celsius: f32,
    pub moderate_celsius: f32,
    pub severe_celsius: f32,
    pub critical_celsius: f32,
    pub emergency_celsius: f32,
    /// CPU utilisation in `[0, 1]` at which the device counts as LIGHT.
    pub light_utilization: f32,
    /// CPU utilisation in `[0, 1]` at which the device counts as MODERATE.
    pub moderate_utilization: f32,
}

/// Benchmark tunables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchmarkConfig {
    pub ttl_secs: u64,
    pub timeout_ms: u64,
    /// Wall-clock limit for one whole run; candidates left when it runs out fail.
    pub run_budget_ms: u64,
    pub self_test_timeout_ms: u64,
    /// Side of the square f32 matrices in the reference workload.
    pub matrix_dim: usize,
    pub iterations: usize,
    pub warmup_iterations: usize,
}

/// Generation-length and randomness bounds applied under heat
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationLimits {
    pub critical_max_tokens: u32,
    pub emergency_max_tokens: u32,
    pub min_temperature: f32,
}

/// Selection cache tunables
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// When set, decisions are loaded from and saved to this file.
    pub persist_path: Option<PathBuf>,
}

impl Default for ThermalConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5_000,
            notification_capacity: 64,
            heuristic: HeuristicThresholds::default(),
        }
    }
}

impl Default for HeuristicThresholds {
    fn default() -> Self {
        Self {
            light_celsius: 38.0,
            moderate_celsius: 41.0,
            severe_celsius: 44.0,
            critical_celsius: 47.0,
            emergency_celsius: 50.0,
            light_utilization: 0.85,
            moderate_utilization: 0.95,
        }
    }
}

impl Default for BenchmarkConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 24 * 60 * 60,
            timeout_ms: 2_000,
            run_budget_ms: 3_000,
            self_test_timeout_ms: 500,
            matrix_dim: 96,
            iterations: 6,
            warmup_iterations: 1,
        }
    }
}

impl Default for GenerationLimits {
    fn default() -> Self {
        Self {
            critical_max_tokens: 128,
            emergency_max_tokens: 64,
            min_temperature: 0.1,
        }
    }
}

impl SchedulerConfig {
    /// Parse a TOML document; keys that are absent keep their defaults.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| SchedulerError::Config(format!("failed to parse TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            SchedulerError::Config(format!("failed to read '{}': {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
    }

    /// Serialize back to TOML.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| SchedulerError::Config(format!("failed to serialize TOML: {e}")))
    }

    /// Reject values the scheduler cannot operate with.
    pub fn validate(&self) -> Result<()> {
        if self.thermal.poll_interval_ms == 0 {
            return Err(SchedulerError::Config("thermal.poll_interval_ms must be > 0".into()));
        }
        if self.thermal.notification_capacity == 0 {
            return Err(SchedulerError::Config(
                "thermal.notification_capacity must be > 0".into(),
            ));
        }
        let h = &self.thermal.heuristic;
        let ladder = [
            h.light_celsius,
            h.moderate_celsius,
            h.severe_celsius,
            h.critical_celsius,
            h.emergency_celsius,
        ];
        if ladder.windows(2).any(|w| w[0] >= w[1]) {
            return Err(SchedulerError::Config(
                "thermal.heuristic temperatures must be strictly increasing".into(),
            ));
        }
        if !(0.0..=1.0).contains(&h.light_utilization)
            || !(0.0..=1.0).contains(&h.moderate_utilization)
            || h.light_utilization >= h.moderate_utilization
        {
            return Err(SchedulerError::Config(
                "thermal.heuristic utilisation thresholds must satisfy 0 <= light < moderate <= 1"
                    .into(),
            ));
        }
        if self.benchmark.timeout_ms == 0 || self.benchmark.iterations == 0 {
            return Err(SchedulerError::Config(
                "benchmark.timeout_ms and benchmark.iterations must be > 0".into(),
            ));
        }
        if self.benchmark.run_budget_ms == 0 || self.benchmark.self_test_timeout_ms == 0 {
            return Err(SchedulerError::Config(
                "benchmark.run_budget_ms and benchmark.self_test_timeout_ms must be > 0".into(),
            ));
        }
        if self.benchmark.matrix_dim < 4 {
            return Err(SchedulerError::Config("benchmark.matrix_dim must be >= 4".into()));
        }
        let g = &self.generation;
        if g.emergency_max_tokens == 0 || g.emergency_max_tokens > g.critical_max_tokens {
            return Err(SchedulerError::Config(
                "generation caps must satisfy 0 < emergency_max_tokens <= critical_max_tokens"
                    .into(),
            ));
        }
        if !(g.min_temperature >= 0.0) {
            return Err(SchedulerError::Config("generation.min_temperature must be >= 0".into()));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.thermal.poll_interval_ms)
    }

    pub fn benchmark_ttl(&self) -> Duration {
        Duration::from_secs(self.benchmark.ttl_secs)
    }

    pub fn benchmark_timeout(&self) -> Duration {
        Duration::from_millis(self.benchmark.timeout_ms)
    }

    pub fn benchmark_run_budget(&self) -> Duration {
        Duration::from_millis(self.benchmark.run_budget_ms)
    }

    pub fn self_test_timeout(&self) -> Duration {
        Duration::from_millis(self.benchmark.self_test_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = SchedulerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.poll_interval(), Duration::from_secs(5));
        assert_eq!(config.benchmark_ttl(), Duration::from_secs(86_400));
        assert_eq!(config.benchmark_timeout(), Duration::from_secs(2));
        assert_eq!(config.benchmark_run_budget(), Duration::from_secs(3));
        assert_eq!(config.self_test_timeout(), Duration::from_millis(500));
    }

    #[test]
    fn rejects_zero_selection_limits() {
        let mut config = SchedulerConfig::default();
        config.benchmark.run_budget_ms = 0;
        assert!(config.validate().is_err());

        let mut config = SchedulerConfig::default();
        config.benchmark.self_test_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = SchedulerConfig::from_toml_str(
            r#"
            [thermal]
            poll_interval_ms = 1000

            [benchmark]
            timeout_ms = 500
            "#,
        )
        .unwrap();
        assert_eq!(config.thermal.poll_interval_ms, 1000);
        assert_eq!(config.thermal.notification_capacity, 64);
        assert_eq!(config.benchmark.timeout_ms, 500);
        assert_eq!(config.benchmark.matrix_dim, 96);
        assert_eq!(config.generation, GenerationLimits::default());
    }

    #[test]
    fn rejects_non_monotonic_heat_ladder() {
        let err = SchedulerConfig::from_toml_str(
            r#"
            [thermal.heuristic]
            severe_celsius = 40.0
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, SchedulerError::Config(_)));
    }

    #[test]
    fn rejects_inverted_token_caps() {
        let mut config = SchedulerConfig::default();
        config.generation.emergency_max_tokens = 256;
        assert!(config.validate().is_err());
    }

    #[test]
    fn toml_round_trip_preserves_values() {
        let mut config = SchedulerConfig::default();
        config.cache.persist_path = Some(PathBuf::from("/tmp/decisions.bin"));
        config.benchmark.iterations = 3;
        let text = config.to_toml_string().unwrap();
        assert_eq!(SchedulerConfig::from_toml_str(&text).unwrap(), config);
    }

    #[test]
    fn reads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scheduler.toml");
        std::fs::write(&path, "[generation]\nemergency_max_tokens = 32\n").unwrap();
        let config = SchedulerConfig::from_file(&path).unwrap();
        assert_eq!(config.generation.emergency_max_tokens, 32);
        assert!(SchedulerConfig::from_file(dir.path().join("missing.toml")).is_err());
    }
}

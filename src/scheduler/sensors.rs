//! `/proc` and `/sys` readers backing the heuristic thermal signal

use super::thermal::PlatformSensors;
use std::path::PathBuf;

const PROC_STAT: &str = "/proc/stat";
const BATTERY_TEMP: &str = "/sys/class/power_supply/battery/temp";

/// Jiffy counters from the aggregate `cpu` line of `/proc/stat`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CpuTimes {
    idle: u64,
    total: u64,
}

/// Sensors read from the Linux procfs and power-supply class
#[derive(Debug, Clone)]
pub struct ProcSensors {
    stat_path: PathBuf,
    battery_temp_path: PathBuf,
    previous: Option<CpuTimes>,
}

impl ProcSensors {
    pub fn new() -> Self {
        Self::with_paths(PROC_STAT, BATTERY_TEMP)
    }

    pub fn with_paths(stat_path: impl Into<PathBuf>, battery_temp_path: impl Into<PathBuf>) -> Self {
        Self {
            stat_path: stat_path.into(),
            battery_temp_path: battery_temp_path.into(),
            previous: None,
        }
    }
}

impl Default for ProcSensors {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn parse_cpu_times(stat: &str) -> Option<CpuTimes> {
    let line = stat.lines().find(|line| line.starts_with("cpu "))?;
    let fields: Vec<u64> =
        line.split_whitespace().skip(1).filter_map(|field| field.parse().ok()).collect();
    if fields.len() < 4 {
        return None;
    }
    // idle + iowait
    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
    Some(CpuTimes { idle, total: fields.iter().sum() })
}

/// Busy fraction between two samples.
pub(crate) fn utilization_between(before: CpuTimes, after: CpuTimes) -> Option<f32> {
    let total = after.total.checked_sub(before.total)?;
    let idle = after.idle.checked_sub(before.idle)?;
    if total == 0 {
        return None;
    }
    Some((1.0 - idle as f64 / total as f64).clamp(0.0, 1.0) as f32)
}

/// Battery temperature is reported in tenths of a degree.
pub(crate) fn parse_battery_temp(raw: &str) -> Option<f32> {
    raw.trim().parse::<i32>().ok().map(|tenths| tenths as f32 / 10.0)
}

impl PlatformSensors for ProcSensors {
    fn cpu_utilization(&mut self) -> Option<f32> {
        let stat = std::fs::read_to_string(&self.stat_path).ok()?;
        let now = parse_cpu_times(&stat)?;
        let previous = self.previous.replace(now)?;
        utilization_between(previous, now)
    }

    fn battery_temperature_celsius(&mut self) -> Option<f32> {
        std::fs::read_to_string(&self.battery_temp_path).ok().as_deref().and_then(parse_battery_temp)
    }
}

//! Thermal-bucketed cache of backend decisions

use super::*;
use dashmap::DashMap;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

const PERSIST_VERSION: u32 = 1;

/// Cache key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SelectionKey {
    pub task: ComputeTask,
    pub fingerprint: DeviceFingerprint,
}

/// A backend chosen under a given thermal state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendDecision {
    pub backend: BackendKind,
    pub thermal_state: ThermalState,
    pub created_at_ms: u64,
}

/// Concurrent map of decisions
#[derive(Debug, Default)]
pub struct BackendSelectionCache {
    entries: DashMap<SelectionKey, BackendDecision>,
}

#[derive(Serialize, Deserialize)]
struct PersistedCache {
    version: u32,
    entries: Vec<(SelectionKey, BackendDecision)>,
}

impl SelectionKey {
    pub fn new(task: ComputeTask, fingerprint: DeviceFingerprint) -> Self {
        Self { task, fingerprint }
    }
}

fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map_or(0, |d| d.as_millis() as u64)
}

impl BackendDecision {
    pub fn new(backend: BackendKind, thermal_state: ThermalState) -> Self {
        Self { backend, thermal_state, created_at_ms: now_ms() }
    }

    /// Whether this decision may be served while the device is in `current`.
    ///
    /// NONE and LIGHT share a bucket, MODERATE is alone, and SEVERE and hotter
    /// share the CPU-only bucket. An accelerator only lands in the hot bucket
    /// when the CPU self-test failed at SEVERE, and such a decision is never
    /// served again.
    pub fn is_usable_under(&self, current: ThermalState) -> bool {
        self.thermal_state.bucket() == current.bucket()
            && (current.bucket() != ThermalBucket::Severe || self.backend == BackendKind::CpuGeneric)
    }
}

impl BackendSelectionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &SelectionKey) -> Option<BackendDecision> {
        self.entries.get(key).map(|entry| *entry.value())
    }

    pub fn insert(&self, key: SelectionKey, decision: BackendDecision) {
        self.entries.insert(key, decision);
    }

    pub fn remove(&self, key: &SelectionKey) -> Option<BackendDecision> {
        self.entries.remove(key).map(|(_, decision)| decision)
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every decision that cannot be served under `state`; returns how many.
    pub fn retain_usable(&self, state: ThermalState) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, decision| decision.is_usable_under(state));
        before.saturating_sub(self.entries.len())
    }

    /// Write all decisions to `path` with bincode.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        let persisted = PersistedCache {
            version: PERSIST_VERSION,
            entries: self.entries.iter().map(|e| (*e.key(), *e.value())).collect(),
        };
        let bytes = bincode::serialize(&persisted)
            .map_err(|e| SchedulerError::Persistence(format!("encode failed: {e}")))?;
        std::fs::write(path, bytes).map_err(|e| {
            SchedulerError::Persistence(format!("write to '{}' failed: {e}", path.display()))
        })?;
        debug!(entries = persisted.entries.len(), path = %path.display(), "selection cache saved");
        Ok(())
    }

    /// Load decisions saved by [`save_to`](Self::save_to), keeping only those
    /// recorded for `fingerprint`.
    pub fn load_from(path: &Path, fingerprint: DeviceFingerprint) -> Result<Self> {
        let bytes = std::fs::read(path).map_err(|e| {
            SchedulerError::Persistence(format!("read of '{}' failed: {e}", path.display()))
        })?;
        let persisted: PersistedCache = bincode::deserialize(&bytes)
            .map_err(|e| SchedulerError::Persistence(format!("decode failed: {e}")))?;
        if persisted.version != PERSIST_VERSION {
            return Err(SchedulerError::Persistence(format!(
                "unsupported cache version {}",
                persisted.version
            )));
        }
        let cache = Self::new();
        for (key, decision) in persisted.entries {
            if key.fingerprint == fingerprint {
                cache.insert(key, decision);
            }
        }
        debug!(entries = cache.len(), path = %path.display(), "selection cache loaded");
        Ok(cache)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(task: ComputeTask) -> SelectionKey {
        SelectionKey::new(
            task,
            DeviceFingerprint { vendor: SocVendor::Qualcomm, tier: DeviceTier::Flagship },
        )
    }

    #[test]
    fn mild_bucket_is_interchangeable() {
        let d = BackendDecision::new(BackendKind::AcceleratorNpu, ThermalState::None);
        assert!(d.is_usable_under(ThermalState::None));
        assert!(d.is_usable_under(ThermalState::Light));
        assert!(!d.is_usable_under(ThermalState::Moderate));
        assert!(!d.is_usable_under(ThermalState::Critical));

        let d = BackendDecision::new(BackendKind::GpuVulkan, ThermalState::Light);
        assert!(d.is_usable_under(ThermalState::None));
    }

    #[test]
    fn moderate_stands_alone() {
        let d = BackendDecision::new(BackendKind::GpuOpenCl, ThermalState::Moderate);
        assert!(d.is_usable_under(ThermalState::Moderate));
        assert!(!d.is_usable_under(ThermalState::Light));
        assert!(!d.is_usable_under(ThermalState::Severe));
    }

    #[test]
    fn hot_bucket_serves_only_cpu() {
        let cpu = BackendDecision::new(BackendKind::CpuGeneric, ThermalState::Severe);
        assert!(cpu.is_usable_under(ThermalState::Severe));
        assert!(cpu.is_usable_under(ThermalState::Critical));
        assert!(cpu.is_usable_under(ThermalState::Emergency));
        assert!(!cpu.is_usable_under(ThermalState::Moderate));

        let gpu = BackendDecision::new(BackendKind::GpuVulkan, ThermalState::Severe);
        assert!(!gpu.is_usable_under(ThermalState::Severe));
        assert!(!gpu.is_usable_under(ThermalState::Critical));
    }

    #[test]
    fn retain_usable_evicts_stale_entries() {
        let cache = BackendSelectionCache::new();
        cache.insert(
            key(ComputeTask::LlmInference),
            BackendDecision::new(BackendKind::AcceleratorNpu, ThermalState::None),
        );
        cache.insert(
            key(ComputeTask::SafetyCheck),
            BackendDecision::new(BackendKind::CpuGeneric, ThermalState::Severe),
        );
        assert_eq!(cache.retain_usable(ThermalState::Critical), 1);
        assert!(cache.get(&key(ComputeTask::LlmInference)).is_none());
        assert!(cache.get(&key(ComputeTask::SafetyCheck)).is_some());
    }

    #[test]
    fn persistence_filters_by_fingerprint() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("decisions.bin");

        let cache = BackendSelectionCache::new();
        let ours = key(ComputeTask::EmbeddingGeneration);
        let theirs = SelectionKey::new(
            ComputeTask::EmbeddingGeneration,
            DeviceFingerprint { vendor: SocVendor::Samsung, tier: DeviceTier::MidRange },
        );
        let decision = BackendDecision::new(BackendKind::GpuOpenCl, ThermalState::Light);
        cache.insert(ours, decision);
        cache.insert(theirs, BackendDecision::new(BackendKind::GpuVulkan, ThermalState::None));
        cache.save_to(&path).unwrap();

        let loaded = BackendSelectionCache::load_from(&path, ours.fingerprint).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded.get(&ours), Some(decision));
        assert!(loaded.get(&theirs).is_none());
    }

    #[test]
    fn corrupt_file_is_a_persistence_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("decisions.bin");
        std::fs::write(&path, b"\x01").unwrap();
        let fingerprint = key(ComputeTask::LlmInference).fingerprint;
        assert!(matches!(
            BackendSelectionCache::load_from(&path, fingerprint),
            Err(SchedulerError::Persistence(_))
        ));
        assert!(matches!(
            BackendSelectionCache::load_from(&dir.path().join("missing"), fingerprint),
            Err(SchedulerError::Persistence(_))
        ));
    }
}

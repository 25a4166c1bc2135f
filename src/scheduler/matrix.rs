//! Static backend preference table per (vendor, tier)

use super::*;
use once_cell::sync::Lazy;
use smallvec::{smallvec, SmallVec};
use std::collections::HashMap;

/// Ordered candidate list; at most one entry per backend kind
pub type Candidates = SmallVec<[BackendKind; 4]>;

/// Ordered backend preferences per device class
#[derive(Debug, Clone)]
pub struct BackendPreferenceMatrix {
    entries: HashMap<DeviceFingerprint, Candidates>,
}

static DEFAULT_MATRIX: Lazy<BackendPreferenceMatrix> = Lazy::new(|| {
    use BackendKind::{AcceleratorNpu as Npu, CpuGeneric as Cpu, GpuOpenCl as OpenCl, GpuVulkan as Vulkan};
    use DeviceTier::*;

    BackendPreferenceMatrix::empty()
        .with_entry(SocVendor::Qualcomm, Flagship, &[Npu, OpenCl, Vulkan, Cpu])
        .with_entry(SocVendor::Qualcomm, HighEnd, &[OpenCl, Npu, Vulkan, Cpu])
        .with_entry(SocVendor::Qualcomm, MidRange, &[OpenCl, Cpu])
        .with_entry(SocVendor::Qualcomm, Budget, &[Cpu])
        .with_entry(SocVendor::Qualcomm, LowEnd, &[Cpu])
        .with_entry(SocVendor::Samsung, Flagship, &[Npu, Vulkan, Cpu])
        .with_entry(SocVendor::Samsung, HighEnd, &[Vulkan, Cpu])
        .with_entry(SocVendor::Samsung, MidRange, &[Vulkan, Cpu])
        .with_entry(SocVendor::Google, Flagship, &[Npu, Vulkan, Cpu])
        .with_entry(SocVendor::Google, HighEnd, &[Npu, Vulkan, Cpu])
        .with_entry(SocVendor::Google, MidRange, &[Vulkan, Cpu])
        .with_entry(SocVendor::MediaTek, Flagship, &[Npu, Vulkan, OpenCl, Cpu])
        .with_entry(SocVendor::MediaTek, HighEnd, &[Vulkan, OpenCl, Cpu])
        .with_entry(SocVendor::MediaTek, MidRange, &[Vulkan, Cpu])
});

impl BackendPreferenceMatrix {
    /// Shipped table.
    pub fn standard() -> Self {
        DEFAULT_MATRIX.clone()
    }

    /// Matrix without entries; every lookup yields `[CPU_GENERIC]`.
    pub fn empty() -> Self {
        Self { entries: HashMap::new() }
    }

    /// Add or replace an entry. Duplicates are dropped, keeping the first
    /// occurrence, and CPU_GENERIC is appended if absent.
    pub fn with_entry(mut self, vendor: SocVendor, tier: DeviceTier, order: &[BackendKind]) -> Self {
        let mut candidates = Candidates::new();
        for &kind in order {
            if !candidates.contains(&kind) {
                candidates.push(kind);
            }
        }
        if !candidates.contains(&BackendKind::CpuGeneric) {
            candidates.push(BackendKind::CpuGeneric);
        }
        self.entries.insert(DeviceFingerprint { vendor, tier }, candidates);
        self
    }

    /// Preference order for `(vendor, tier)`; always non-empty and contains CPU.
    pub fn preferences(&self, vendor: SocVendor, tier: DeviceTier) -> Candidates {
        self.entries
            .get(&DeviceFingerprint { vendor, tier })
            .cloned()
            .unwrap_or_else(|| smallvec![BackendKind::CpuGeneric])
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for BackendPreferenceMatrix {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use BackendKind::*;

    const VENDORS: [SocVendor; 5] = [
        SocVendor::Qualcomm,
        SocVendor::Samsung,
        SocVendor::Google,
        SocVendor::MediaTek,
        SocVendor::Other,
    ];
    const TIERS: [DeviceTier; 5] = [
        DeviceTier::Flagship,
        DeviceTier::HighEnd,
        DeviceTier::MidRange,
        DeviceTier::Budget,
        DeviceTier::LowEnd,
    ];

    #[test]
    fn every_lookup_contains_cpu() {
        let matrix = BackendPreferenceMatrix::standard();
        for vendor in VENDORS {
            for tier in TIERS {
                let prefs = matrix.preferences(vendor, tier);
                assert!(!prefs.is_empty());
                assert!(prefs.contains(&CpuGeneric), "{vendor}/{tier}: {prefs:?}");
            }
        }
    }

    #[test]
    fn vendor_orders() {
        let m = BackendPreferenceMatrix::standard();
        assert_eq!(
            m.preferences(SocVendor::Qualcomm, DeviceTier::Flagship).as_slice(),
            &[AcceleratorNpu, GpuOpenCl, GpuVulkan, CpuGeneric]
        );
        assert_eq!(
            m.preferences(SocVendor::Qualcomm, DeviceTier::HighEnd).as_slice(),
            &[GpuOpenCl, AcceleratorNpu, GpuVulkan, CpuGeneric]
        );
        assert_eq!(
            m.preferences(SocVendor::MediaTek, DeviceTier::HighEnd).as_slice(),
            &[GpuVulkan, GpuOpenCl, CpuGeneric]
        );
        assert_eq!(m.preferences(SocVendor::Samsung, DeviceTier::Budget).as_slice(), &[CpuGeneric]);
        assert_eq!(m.preferences(SocVendor::Other, DeviceTier::Flagship).as_slice(), &[CpuGeneric]);
    }

    #[test]
    fn custom_entries_gain_cpu_and_lose_duplicates() {
        let m = BackendPreferenceMatrix::empty().with_entry(
            SocVendor::Other,
            DeviceTier::HighEnd,
            &[GpuVulkan, GpuVulkan, AcceleratorNpu],
        );
        assert_eq!(
            m.preferences(SocVendor::Other, DeviceTier::HighEnd).as_slice(),
            &[GpuVulkan, AcceleratorNpu, CpuGeneric]
        );
        assert_eq!(m.len(), 1);
    }
}

//! Device capability detection and classification

use super::*;
use std::collections::BTreeSet;
use std::sync::RwLock;

const GIB: f64 = (1u64 << 30) as f64;

/// SoC manufacturer families with distinct accelerator stacks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SocVendor {
    Qualcomm,
    Samsung,
    Google,
    MediaTek,
    Other,
}

/// GPU families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GpuVendor {
    Adreno,
    Mali,
    Xclipse,
    PowerVr,
    Other,
}

/// Hardware feature flags reported by the inventory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Capability {
    AcceleratorOpenCl,
    AcceleratorVulkan,
    AcceleratorNpu,
    Fp16,
    Int8,
}

/// Coarse device class derived from memory and SoC model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DeviceTier {
    Flagship,
    HighEnd,
    MidRange,
    Budget,
    LowEnd,
}

/// How the platform lets us observe heat
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThermalCapabilityTier {
    /// Platform pushes thermal status codes (API level >= 29).
    PlatformStatus,
    /// No status API; poll battery temperature and CPU load (API level >= 21).
    PolledHeuristic,
    Unmonitored,
}

/// Key identifying a device class for caching and preference lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceFingerprint {
    pub vendor: SocVendor,
    pub tier: DeviceTier,
}

/// Raw hardware facts, as reported by the host platform
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventorySnapshot {
    pub soc_vendor: SocVendor,
    pub soc_model: String,
    pub gpu_vendor: GpuVendor,
    pub gpu_model: String,
    pub total_memory: u64,
    pub available_memory: u64,
    pub platform_version: u32,
    pub cpu_cores: usize,
    pub capabilities: BTreeSet<Capability>,
}

/// Source of hardware facts
pub trait HardwareInventory: Send + Sync {
    fn snapshot(&self) -> Result<InventorySnapshot>;
}

/// Inventory that always reports the same snapshot
#[derive(Debug, Clone)]
pub struct StaticInventory {
    snapshot: InventorySnapshot,
}

/// Inventory read from the running system (`/proc` on Linux-based hosts)
#[derive(Debug, Clone)]
pub struct SystemInventory {
    platform_version: u32,
}

/// Immutable, classified view of the device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceProfile {
    pub soc_vendor: SocVendor,
    pub soc_model: String,
    pub gpu_vendor: GpuVendor,
    pub gpu_model: String,
    pub total_memory: u64,
    pub available_memory: u64,
    pub platform_version: u32,
    pub cpu_cores: usize,
    pub capabilities: BTreeSet<Capability>,
    pub device_tier: DeviceTier,
    pub thermal_tier: ThermalCapabilityTier,
}

/// Holds the current profile; swapped atomically on refresh
pub struct DeviceProfileProvider {
    inventory: Arc<dyn HardwareInventory>,
    current: RwLock<Arc<DeviceProfile>>,
}

impl SocVendor {
    /// Best-effort vendor from a manufacturer or SoC string.
    pub fn from_manufacturer(name: &str) -> Self {
        let name = name.to_ascii_lowercase();
        if name.contains("qualcomm") || name.contains("qti") || name.contains("snapdragon") {
            Self::Qualcomm
        } else if name.contains("samsung") || name.contains("exynos") {
            Self::Samsung
        } else if name.contains("google") || name.contains("tensor") {
            Self::Google
        } else if name.contains("mediatek") || name.contains("dimensity") || name.starts_with("mt6") {
            Self::MediaTek
        } else {
            Self::Other
        }
    }

    pub const fn label(self) -> &'static str {
        match self {
            Self::Qualcomm => "QUALCOMM",
            Self::Samsung => "SAMSUNG",
            Self::Google => "GOOGLE",
            Self::MediaTek => "MEDIATEK",
            Self::Other => "OTHER",
        }
    }
}

impl fmt::Display for SocVendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl GpuVendor {
    pub fn from_renderer(name: &str) -> Self {
        let name = name.to_ascii_lowercase();
        if name.contains("adreno") {
            Self::Adreno
        } else if name.contains("mali") {
            Self::Mali
        } else if name.contains("xclipse") {
            Self::Xclipse
        } else if name.contains("powervr") {
            Self::PowerVr
        } else {
            Self::Other
        }
    }
}

impl DeviceTier {
    pub const fn label(self) -> &'static str {
        match self {
            Self::Flagship => "FLAGSHIP",
            Self::HighEnd => "HIGH_END",
            Self::MidRange => "MID_RANGE",
            Self::Budget => "BUDGET",
            Self::LowEnd => "LOW_END",
        }
    }
}

impl fmt::Display for DeviceTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl ThermalCapabilityTier {
    pub const fn for_platform_version(version: u32) -> Self {
        if version >= 29 {
            Self::PlatformStatus
        } else if version >= 21 {
            Self::PolledHeuristic
        } else {
            Self::Unmonitored
        }
    }
}

/// Model-name fragments of current flagship SoCs, per vendor.
fn flagship_markers(vendor: SocVendor) -> &'static [&'static str] {
    match vendor {
        SocVendor::Qualcomm => &[
            "sm8450",
            "sm8475",
            "sm8550",
            "sm8650",
            "sm8750",
            "snapdragon 8 gen",
            "snapdragon 8s gen",
            "snapdragon 8 elite",
        ],
        SocVendor::Samsung => &["exynos 2200", "exynos 2400", "exynos 2500", "s5e9925", "s5e9945"],
        SocVendor::Google => &["tensor g2", "tensor g3", "tensor g4", "gs201", "zuma"],
        SocVendor::MediaTek => &[
            "dimensity 9000",
            "dimensity 9200",
            "dimensity 9300",
            "dimensity 9400",
            "mt6983",
            "mt6985",
            "mt6989",
            "mt6991",
        ],
        SocVendor::Other => &[],
    }
}

pub fn is_flagship_soc(vendor: SocVendor, soc_model: &str) -> bool {
    let model = soc_model.to_ascii_lowercase();
    flagship_markers(vendor).iter().any(|marker| model.contains(marker))
}

/// Tier from total memory (bytes) and SoC model.
pub fn classify_tier(vendor: SocVendor, soc_model: &str, total_memory: u64) -> DeviceTier {
    let gib = total_memory as f64 / GIB;
    let flagship_soc = is_flagship_soc(vendor, soc_model);
    if gib >= 11.0 && flagship_soc {
        DeviceTier::Flagship
    } else if gib >= 11.0 || (gib >= 7.0 && flagship_soc) {
        DeviceTier::HighEnd
    } else if gib >= 5.0 {
        DeviceTier::MidRange
    } else if gib >= 3.0 {
        DeviceTier::Budget
    } else {
        DeviceTier::LowEnd
    }
}

fn host_cores() -> usize {
    std::thread::available_parallelism().map_or(1, |n| n.get())
}

impl Default for InventorySnapshot {
    fn default() -> Self {
        Self {
            soc_vendor: SocVendor::Other,
            soc_model: String::new(),
            gpu_vendor: GpuVendor::Other,
            gpu_model: String::new(),
            total_memory: 0,
            available_memory: 0,
            platform_version: 0,
            cpu_cores: 1,
            capabilities: BTreeSet::new(),
        }
    }
}

impl StaticInventory {
    pub fn new(snapshot: InventorySnapshot) -> Self {
        Self { snapshot }
    }
}

impl HardwareInventory for StaticInventory {
    fn snapshot(&self) -> Result<InventorySnapshot> {
        Ok(self.snapshot.clone())
    }
}

impl SystemInventory {
    /// `platform_version` comes from the host (e.g. the Android API level);
    /// it cannot be read from `/proc`.
    pub fn new(platform_version: u32) -> Self {
        Self { platform_version }
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    fn meminfo_bytes(key: &str) -> Option<u64> {
        let content = std::fs::read_to_string("/proc/meminfo").ok()?;
        parse_meminfo(&content, key)
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    fn meminfo_bytes(_key: &str) -> Option<u64> {
        None
    }

    #[cfg(mobile)]
    fn detect_soc() -> (SocVendor, String) {
        let model = std::fs::read_to_string("/proc/cpuinfo")
            .ok()
            .and_then(|content| parse_cpuinfo_hardware(&content))
            .unwrap_or_default();
        (SocVendor::from_manufacturer(&model), model)
    }

    #[cfg(not(mobile))]
    fn detect_soc() -> (SocVendor, String) {
        (SocVendor::Other, String::from("generic"))
    }
}

impl HardwareInventory for SystemInventory {
    fn snapshot(&self) -> Result<InventorySnapshot> {
        let total_memory = Self::meminfo_bytes("MemTotal:").ok_or_else(|| {
            SchedulerError::HardwareInventoryUnavailable("MemTotal not readable".into())
        })?;
        let available_memory = Self::meminfo_bytes("MemAvailable:").unwrap_or(total_memory / 2);
        let (soc_vendor, soc_model) = Self::detect_soc();

        let mut capabilities = BTreeSet::new();
        if cfg!(target_arch = "aarch64") {
            capabilities.insert(Capability::Fp16);
        }

        Ok(InventorySnapshot {
            soc_vendor,
            soc_model,
            gpu_vendor: GpuVendor::Other,
            gpu_model: String::new(),
            total_memory,
            available_memory,
            platform_version: self.platform_version,
            cpu_cores: host_cores(),
            capabilities,
        })
    }
}

/// Value of a `/proc/meminfo` line in bytes.
pub(crate) fn parse_meminfo(content: &str, key: &str) -> Option<u64> {
    content
        .lines()
        .find(|line| line.starts_with(key))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|kb| kb.parse::<u64>().ok())
        .map(|kb| kb * 1024)
}

#[cfg_attr(not(mobile), allow(dead_code))]
pub(crate) fn parse_cpuinfo_hardware(content: &str) -> Option<String> {
    content
        .lines()
        .find(|line| line.starts_with("Hardware"))
        .and_then(|line| line.split_once(':'))
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

impl DeviceProfile {
    pub fn from_snapshot(snapshot: InventorySnapshot) -> Self {
        let device_tier =
            classify_tier(snapshot.soc_vendor, &snapshot.soc_model, snapshot.total_memory);
        Self {
            device_tier,
            thermal_tier: ThermalCapabilityTier::for_platform_version(snapshot.platform_version),
            cpu_cores: snapshot.cpu_cores.max(1),
            soc_vendor: snapshot.soc_vendor,
            soc_model: snapshot.soc_model,
            gpu_vendor: snapshot.gpu_vendor,
            gpu_model: snapshot.gpu_model,
            total_memory: snapshot.total_memory,
            available_memory: snapshot.available_memory,
            platform_version: snapshot.platform_version,
            capabilities: snapshot.capabilities,
        }
    }

    /// Conservative profile used when the inventory cannot be read.
    pub fn fallback() -> Self {
        Self {
            soc_vendor: SocVendor::Other,
            soc_model: String::new(),
            gpu_vendor: GpuVendor::Other,
            gpu_model: String::new(),
            total_memory: 0,
            available_memory: 0,
            platform_version: 0,
            cpu_cores: host_cores(),
            capabilities: BTreeSet::new(),
            device_tier: DeviceTier::Budget,
            thermal_tier: ThermalCapabilityTier::Unmonitored,
        }
    }

    pub fn fingerprint(&self) -> DeviceFingerprint {
        DeviceFingerprint { vendor: self.soc_vendor, tier: self.device_tier }
    }

    pub fn has(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    /// Whether the capability flag `kind` depends on is present.
    pub fn advertises(&self, kind: BackendKind) -> bool {
        kind.required_capability().map_or(true, |cap| self.has(cap))
    }
}

impl DeviceProfileProvider {
    pub fn new(inventory: Arc<dyn HardwareInventory>) -> Self {
        let profile = Arc::new(Self::detect(inventory.as_ref()));
        Self { inventory, current: RwLock::new(profile) }
    }

    fn detect(inventory: &dyn HardwareInventory) -> DeviceProfile {
        match inventory.snapshot() {
            Ok(snapshot) => DeviceProfile::from_snapshot(snapshot),
            Err(e) => {
                warn!(error = %e, "hardware inventory unavailable; assuming OTHER/BUDGET");
                DeviceProfile::fallback()
            }
        }
    }

    pub fn current(&self) -> Arc<DeviceProfile> {
        Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Re-read the inventory and publish the new profile.
    pub fn refresh(&self) -> Arc<DeviceProfile> {
        let profile = Arc::new(Self::detect(self.inventory.as_ref()));
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Arc::clone(&profile);
        profile
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GB: u64 = 1 << 30;

    struct BrokenInventory;

    impl HardwareInventory for BrokenInventory {
        fn snapshot(&self) -> Result<InventorySnapshot> {
            Err(SchedulerError::HardwareInventoryUnavailable("no sysfs".into()))
        }
    }

    #[test]
    fn tier_thresholds() {
        let q = SocVendor::Qualcomm;
        assert_eq!(classify_tier(q, "SM8650", 12 * GB), DeviceTier::Flagship);
        assert_eq!(classify_tier(q, "SM7325", 12 * GB), DeviceTier::HighEnd);
        assert_eq!(classify_tier(q, "SM8550", 8 * GB), DeviceTier::HighEnd);
        assert_eq!(classify_tier(q, "SM7325", 8 * GB), DeviceTier::MidRange);
        assert_eq!(classify_tier(q, "SM6375", 4 * GB), DeviceTier::Budget);
        assert_eq!(classify_tier(q, "SM4350", 2 * GB), DeviceTier::LowEnd);
    }

    #[test]
    fn other_vendor_is_never_flagship() {
        assert_eq!(classify_tier(SocVendor::Other, "SM8650", 16 * GB), DeviceTier::HighEnd);
    }

    #[test]
    fn flagship_markers_are_case_insensitive() {
        assert!(is_flagship_soc(SocVendor::Google, "Tensor G3"));
        assert!(is_flagship_soc(SocVendor::MediaTek, "MediaTek Dimensity 9300"));
        assert!(!is_flagship_soc(SocVendor::Samsung, "Exynos 1380"));
    }

    #[test]
    fn thermal_tier_follows_platform_version() {
        use ThermalCapabilityTier::*;
        assert_eq!(ThermalCapabilityTier::for_platform_version(34), PlatformStatus);
        assert_eq!(ThermalCapabilityTier::for_platform_version(29), PlatformStatus);
        assert_eq!(ThermalCapabilityTier::for_platform_version(28), PolledHeuristic);
        assert_eq!(ThermalCapabilityTier::for_platform_version(21), PolledHeuristic);
        assert_eq!(ThermalCapabilityTier::for_platform_version(19), Unmonitored);
    }

    #[test]
    fn unavailable_inventory_falls_back_to_budget() {
        let provider = DeviceProfileProvider::new(Arc::new(BrokenInventory));
        let profile = provider.current();
        assert_eq!(profile.fingerprint().vendor, SocVendor::Other);
        assert_eq!(profile.device_tier, DeviceTier::Budget);
        assert!(profile.cpu_cores >= 1);
        assert!(profile.advertises(BackendKind::CpuGeneric));
        assert!(!profile.advertises(BackendKind::AcceleratorNpu));
    }

    #[test]
    fn vendor_strings() {
        assert_eq!(SocVendor::from_manufacturer("QTI"), SocVendor::Qualcomm);
        assert_eq!(SocVendor::from_manufacturer("Samsung Exynos"), SocVendor::Samsung);
        assert_eq!(SocVendor::from_manufacturer("mt6985"), SocVendor::MediaTek);
        assert_eq!(SocVendor::from_manufacturer("Rockchip"), SocVendor::Other);
        assert_eq!(GpuVendor::from_renderer("Adreno (TM) 740"), GpuVendor::Adreno);
        assert_eq!(GpuVendor::from_renderer("Mali-G715"), GpuVendor::Mali);
    }

    #[test]
    fn proc_parsers() {
        let meminfo = "MemTotal:        7869348 kB\nMemFree:  1000 kB\nMemAvailable:    3000000 kB\n";
        assert_eq!(parse_meminfo(meminfo, "MemTotal:"), Some(7_869_348 * 1024));
        assert_eq!(parse_meminfo(meminfo, "SwapTotal:"), None);

        let cpuinfo = "processor\t: 0\nHardware\t: Qualcomm Technologies, Inc SM8550\n";
        assert_eq!(
            parse_cpuinfo_hardware(cpuinfo).as_deref(),
            Some("Qualcomm Technologies, Inc SM8550")
        );
        assert_eq!(parse_cpuinfo_hardware("processor\t: 0\n"), None);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn system_inventory_reads_proc() {
        let snapshot = SystemInventory::new(28).snapshot().unwrap();
        assert!(snapshot.total_memory > 0);
        assert!(snapshot.available_memory <= snapshot.total_memory);
        assert!(snapshot.cpu_cores >= 1);
        let profile = DeviceProfile::from_snapshot(snapshot);
        assert_eq!(profile.thermal_tier, ThermalCapabilityTier::PolledHeuristic);
    }

    #[test]
    fn refresh_swaps_profile() {
        let provider = DeviceProfileProvider::new(Arc::new(StaticInventory::new(InventorySnapshot {
            soc_vendor: SocVendor::Samsung,
            soc_model: "Exynos 2400".into(),
            total_memory: 12 * GB,
            ..InventorySnapshot::default()
        })));
        let before = provider.current();
        let after = provider.refresh();
        assert_eq!(*before, *after);
        assert!(!Arc::ptr_eq(&before, &after));
        assert_eq!(after.device_tier, DeviceTier::Flagship);
    }
}

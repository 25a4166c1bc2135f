//! Thermal state machine and background monitoring
//!
//! The current state, active performance profile and the CRITICAL epoch counter
//! are packed into a single `AtomicU64`, so readers always see a consistent
//! triple without taking a lock. Writers (the monitor thread, push callbacks and
//! user profile overrides) go through a compare-and-swap loop. State changes are
//! also serialized with their publication, so history, hooks and subscribers
//! see transitions in commit order.

use super::params::adapt_parameters;
use super::*;
use crate::config::{GenerationLimits, HeuristicThresholds};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::RwLock;
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing::debug;

const HISTORY_LEN: usize = 32;

/// Consistent view of the thermal triple
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThermalSnapshot {
    pub state: ThermalState,
    pub profile: PerformanceProfile,
    /// Incremented on every transition into CRITICAL or EMERGENCY.
    pub critical_epoch: u64,
}

/// A change of thermal state, published to subscribers
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThermalTransition {
    pub from: ThermalState,
    pub to: ThermalState,
    /// Profile in effect after the transition.
    pub profile: PerformanceProfile,
    pub critical_epoch: u64,
    pub at: SystemTime,
}

type TransitionHook = Box<dyn Fn(&ThermalTransition) + Send + Sync>;

/// Owner of the thermal state and the profile
pub struct ThermalStateMachine {
    packed: AtomicU64,
    core_count: usize,
    limits: GenerationLimits,
    notifier: broadcast::Sender<ThermalTransition>,
    hooks: RwLock<Vec<TransitionHook>>,
    history: Mutex<VecDeque<ThermalTransition>>,
    /// Held from commit to publish of a state change.
    transition_lock: Mutex<()>,
}

impl ThermalSnapshot {
    fn pack(self) -> u64 {
        (self.state as u64) | ((self.profile as u64) << 8) | (self.critical_epoch << 16)
    }

    fn unpack(bits: u64) -> Self {
        Self {
            state: ThermalState::from_index((bits & 0xff) as u8),
            profile: PerformanceProfile::from_index(((bits >> 8) & 0xff) as u8),
            critical_epoch: bits >> 16,
        }
    }
}

/// Profile forced (or restored) by entering `to`.
fn profile_after(to: ThermalState, current: PerformanceProfile) -> PerformanceProfile {
    match to {
        ThermalState::Critical | ThermalState::Emergency => PerformanceProfile::Emergency,
        ThermalState::Severe if current == PerformanceProfile::Performance => {
            PerformanceProfile::BatterySaver
        }
        ThermalState::None | ThermalState::Light if current == PerformanceProfile::Emergency => {
            PerformanceProfile::Balanced
        }
        _ => current,
    }
}

/// Worker threads for `cores` under the given state and profile; at least 1.
pub fn thread_count_for(cores: usize, state: ThermalState, profile: PerformanceProfile) -> usize {
    let cores = cores.max(1);
    let by_profile = match profile {
        PerformanceProfile::Performance => cores,
        PerformanceProfile::Balanced => cores * 3 / 4,
        PerformanceProfile::BatterySaver => cores / 2,
        PerformanceProfile::Emergency => 1,
    };
    let cap = match state {
        ThermalState::None | ThermalState::Light => cores,
        ThermalState::Moderate => cores * 3 / 4,
        ThermalState::Severe => cores / 2,
        ThermalState::Critical | ThermalState::Emergency => 1,
    };
    by_profile.min(cap).max(1)
}

impl ThermalStateMachine {
    pub fn new(core_count: usize, limits: GenerationLimits, notification_capacity: usize) -> Self {
        let (notifier, _) = broadcast::channel(notification_capacity.max(1));
        let initial = ThermalSnapshot {
            state: ThermalState::None,
            profile: PerformanceProfile::Balanced,
            critical_epoch: 0,
        };
        Self {
            packed: AtomicU64::new(initial.pack()),
            core_count: core_count.max(1),
            limits,
            notifier,
            hooks: RwLock::new(Vec::new()),
            history: Mutex::new(VecDeque::with_capacity(HISTORY_LEN)),
            transition_lock: Mutex::new(()),
        }
    }

    pub fn snapshot(&self) -> ThermalSnapshot {
        ThermalSnapshot::unpack(self.packed.load(Ordering::Acquire))
    }

    pub fn current_state(&self) -> ThermalState {
        self.snapshot().state
    }

    pub fn current_profile(&self) -> PerformanceProfile {
        self.snapshot().profile
    }

    pub fn critical_epoch(&self) -> u64 {
        self.snapshot().critical_epoch
    }

    pub fn should_throttle(&self) -> bool {
        self.current_state().should_throttle()
    }

    /// Record an observed state. Returns the transition if the state changed.
    pub fn observe(&self, state: ThermalState) -> Option<ThermalTransition> {
        let _ordered = self.transition_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut bits = self.packed.load(Ordering::Acquire);
        let (from, next) = loop {
            let current = ThermalSnapshot::unpack(bits);
            if current.state == state {
                return None;
            }
            let next = ThermalSnapshot {
                state,
                profile: profile_after(state, current.profile),
                critical_epoch: current.critical_epoch + u64::from(state.is_critical()),
            };
            match self.packed.compare_exchange_weak(
                bits,
                next.pack(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break (current, next),
                Err(actual) => bits = actual,
            }
        };

        let transition = ThermalTransition {
            from: from.state,
            to: next.state,
            profile: next.profile,
            critical_epoch: next.critical_epoch,
            at: SystemTime::now(),
        };
        if from.profile != next.profile {
            info!(from = %from.profile, to = %next.profile, "performance profile changed");
        }
        info!(from = %transition.from, to = %transition.to, "thermal state changed");
        self.publish(&transition);
        Some(transition)
    }

    /// Map and record a platform thermal status code.
    pub fn report_platform_code(&self, code: i32) -> Option<ThermalTransition> {
        self.observe(ThermalState::from_platform_code(code))
    }

    /// User override of the profile. Refused while CRITICAL or hotter.
    pub fn set_profile(&self, profile: PerformanceProfile) -> bool {
        let mut bits = self.packed.load(Ordering::Acquire);
        loop {
            let current = ThermalSnapshot::unpack(bits);
            if current.state.is_critical() {
                debug!(requested = %profile, state = %current.state, "profile override refused");
                return false;
            }
            let next = ThermalSnapshot { profile, ..current };
            match self.packed.compare_exchange_weak(
                bits,
                next.pack(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    if current.profile != profile {
                        info!(from = %current.profile, to = %profile, "performance profile set");
                    }
                    return true;
                }
                Err(actual) => bits = actual,
            }
        }
    }

    fn publish(&self, transition: &ThermalTransition) {
        {
            let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
            if history.len() == HISTORY_LEN {
                history.pop_front();
            }
            history.push_back(*transition);
        }
        for hook in self.hooks.read().unwrap_or_else(PoisonError::into_inner).iter() {
            hook(transition);
        }
        // No receivers is fine.
        let _ = self.notifier.send(*transition);
    }

    /// Register a synchronous callback run on the writer's thread for every
    /// transition, before async subscribers are notified. Hooks must not
    /// report thermal states themselves.
    pub fn add_hook(&self, hook: TransitionHook) {
        self.hooks.write().unwrap_or_else(PoisonError::into_inner).push(hook);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ThermalTransition> {
        self.notifier.subscribe()
    }

    /// Transitions as a stream; notifications missed by a lagging consumer are skipped.
    pub fn transitions(&self) -> impl Stream<Item = ThermalTransition> + Send + 'static {
        BroadcastStream::new(self.subscribe()).filter_map(|item| item.ok())
    }

    /// Most recent transitions, oldest first.
    pub fn history(&self) -> Vec<ThermalTransition> {
        self.history.lock().unwrap_or_else(PoisonError::into_inner).iter().copied().collect()
    }

    pub fn optimal_thread_count(&self) -> usize {
        let snapshot = self.snapshot();
        thread_count_for(self.core_count, snapshot.state, snapshot.profile)
    }

    /// `requested <= 0` picks [`optimal_thread_count`](Self::optimal_thread_count);
    /// positive requests are honoured up to the cap of the current state.
    pub fn resolve_thread_count(&self, requested: i32) -> usize {
        if requested <= 0 {
            return self.optimal_thread_count();
        }
        let state_cap =
            thread_count_for(self.core_count, self.current_state(), PerformanceProfile::Performance);
        (requested as usize).min(state_cap)
    }

    pub fn adapt_parameters(&self, params: &GenerationParams) -> GenerationParams {
        let snapshot = self.snapshot();
        adapt_parameters(params, snapshot.state, snapshot.profile, &self.limits)
    }
}

/// A pollable source of thermal state
pub trait ThermalSignal: Send {
    fn sample(&mut self) -> Result<ThermalState>;
}

/// Polls a platform thermal-status query returning raw status codes
pub struct PlatformStatusSignal<F> {
    read_code: F,
}

impl<F> PlatformStatusSignal<F>
where
    F: FnMut() -> Option<i32> + Send,
{
    pub fn new(read_code: F) -> Self {
        Self { read_code }
    }
}

impl<F> ThermalSignal for PlatformStatusSignal<F>
where
    F: FnMut() -> Option<i32> + Send,
{
    fn sample(&mut self) -> Result<ThermalState> {
        (self.read_code)()
            .map(ThermalState::from_platform_code)
            .ok_or_else(|| SchedulerError::Sensor("platform thermal status unavailable".into()))
    }
}

/// Raw readings the heuristic is built from
pub trait PlatformSensors: Send {
    /// Fraction of CPU time busy since the previous call, in `[0, 1]`.
    fn cpu_utilization(&mut self) -> Option<f32>;
    fn battery_temperature_celsius(&mut self) -> Option<f32>;
}

/// Estimates thermal state from battery temperature and CPU load
pub struct HeuristicThermalSignal<S> {
    sensors: S,
    thresholds: HeuristicThresholds,
}

impl<S: PlatformSensors> HeuristicThermalSignal<S> {
    pub fn new(sensors: S, thresholds: HeuristicThresholds) -> Self {
        Self { sensors, thresholds }
    }
}

/// Heuristic state for whatever readings are present; `None` if neither is.
pub fn classify_readings(
    thresholds: &HeuristicThresholds,
    battery_celsius: Option<f32>,
    cpu_utilization: Option<f32>,
) -> Option<ThermalState> {
    if battery_celsius.is_none() && cpu_utilization.is_none() {
        return None;
    }
    let by_temperature = battery_celsius.map_or(ThermalState::None, |t| {
        if t >= thresholds.emergency_celsius {
            ThermalState::Emergency
        } else if t >= thresholds.critical_celsius {
            ThermalState::Critical
        } else if t >= thresholds.severe_celsius {
            ThermalState::Severe
        } else if t >= thresholds.moderate_celsius {
            ThermalState::Moderate
        } else if t >= thresholds.light_celsius {
            ThermalState::Light
        } else {
            ThermalState::None
        }
    });
    let by_load = cpu_utilization.map_or(ThermalState::None, |u| {
        if u >= thresholds.moderate_utilization {
            ThermalState::Moderate
        } else if u >= thresholds.light_utilization {
            ThermalState::Light
        } else {
            ThermalState::None
        }
    });
    Some(by_temperature.max(by_load))
}

impl<S: PlatformSensors> ThermalSignal for HeuristicThermalSignal<S> {
    fn sample(&mut self) -> Result<ThermalState> {
        let temperature = self.sensors.battery_temperature_celsius();
        let utilization = self.sensors.cpu_utilization();
        classify_readings(&self.thresholds, temperature, utilization)
            .ok_or_else(|| SchedulerError::Sensor("no battery temperature or CPU load".into()))
    }
}

/// Background thread feeding a [`ThermalSignal`] into the state machine.
/// Stopped and joined on drop.
pub struct ThermalMonitor {
    shutdown: Option<mpsc::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl ThermalMonitor {
    pub fn spawn(
        machine: Arc<ThermalStateMachine>,
        mut signal: Box<dyn ThermalSignal>,
        interval: Duration,
    ) -> Result<Self> {
        let (shutdown, stop_rx) = mpsc::channel::<()>();
        let handle = thread::Builder::new()
            .name("thermal-monitor".into())
            .spawn(move || loop {
                match signal.sample() {
                    Ok(state) => {
                        machine.observe(state);
                    }
                    Err(e) => debug!(error = %e, "thermal sample failed; keeping last state"),
                }
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => continue,
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })
            .map_err(|e| SchedulerError::Sensor(format!("failed to start thermal monitor: {e}")))?;
        debug!(interval_ms = interval.as_millis() as u64, "thermal monitor started");
        Ok(Self { shutdown: Some(shutdown), handle: Some(handle) })
    }

    pub fn stop(mut self) {
        self.halt();
    }

    fn halt(&mut self) {
        drop(self.shutdown.take());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ThermalMonitor {
    fn drop(&mut self) {
        self.halt();
    }
}

//! Thermal adaptation of generation parameters

use super::*;
use crate::config::GenerationLimits;

/// Sampling parameters for a generation request
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_k: u32,
    pub top_p: f32,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self { max_tokens: 512, temperature: 0.7, top_k: 40, top_p: 0.9 }
    }
}

fn token_factor(state: ThermalState) -> f64 {
    match state {
        ThermalState::None => 1.0,
        ThermalState::Light => 0.9,
        ThermalState::Moderate => 0.75,
        ThermalState::Severe => 0.5,
        ThermalState::Critical => 0.25,
        ThermalState::Emergency => 0.125,
    }
}

fn temperature_factor(state: ThermalState) -> f32 {
    match state {
        ThermalState::None => 1.0,
        ThermalState::Light => 0.95,
        ThermalState::Moderate => 0.85,
        ThermalState::Severe => 0.7,
        ThermalState::Critical | ThermalState::Emergency => 0.5,
    }
}

fn scale_tokens(tokens: u32, factor: f64) -> u32 {
    (f64::from(tokens) * factor).ceil() as u32
}

/// Shrink `params` for the given thermal state and profile.
///
/// Returns a new value; `top_k` and `top_p` pass through. A positive
/// `max_tokens` never drops below 1, and for a fixed profile both
/// `max_tokens` and `temperature` are non-increasing in `state`.
pub fn adapt_parameters(
    params: &GenerationParams,
    state: ThermalState,
    profile: PerformanceProfile,
    limits: &GenerationLimits,
) -> GenerationParams {
    let mut tokens = scale_tokens(params.max_tokens, token_factor(state));
    match state {
        ThermalState::Critical => tokens = tokens.min(limits.critical_max_tokens),
        ThermalState::Emergency => tokens = tokens.min(limits.emergency_max_tokens),
        _ => {}
    }

    let base_temperature = params.temperature.max(0.0);
    let mut temperature = base_temperature * temperature_factor(state);
    if state == ThermalState::Emergency {
        temperature = temperature.min(limits.min_temperature);
    }

    match profile {
        PerformanceProfile::BatterySaver => tokens = scale_tokens(tokens, 0.75),
        PerformanceProfile::Emergency => {
            tokens = tokens.min(limits.emergency_max_tokens);
            temperature = temperature.min(limits.min_temperature);
        }
        PerformanceProfile::Performance | PerformanceProfile::Balanced => {}
    }

    if params.max_tokens >= 1 {
        tokens = tokens.clamp(1, params.max_tokens);
    }

    GenerationParams { max_tokens: tokens, temperature, top_k: params.top_k, top_p: params.top_p }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> GenerationLimits {
        GenerationLimits::default()
    }

    #[test]
    fn cool_device_is_untouched() {
        let params = GenerationParams::default();
        let out = adapt_parameters(&params, ThermalState::None, PerformanceProfile::Balanced, &limits());
        assert_eq!(out, params);
    }

    #[test]
    fn emergency_clamps_tokens_and_temperature() {
        let params = GenerationParams { max_tokens: 1024, temperature: 0.8, top_k: 50, top_p: 0.95 };
        let out = adapt_parameters(&params, ThermalState::Emergency, PerformanceProfile::Emergency, &limits());
        assert_eq!(out.max_tokens, 64);
        assert!((out.temperature - 0.1).abs() < 1e-6);
        assert_eq!(out.top_k, 50);
        assert_eq!(out.top_p, 0.95);
    }

    #[test]
    fn critical_caps_at_128() {
        let params = GenerationParams { max_tokens: 2048, ..GenerationParams::default() };
        let out = adapt_parameters(&params, ThermalState::Critical, PerformanceProfile::Balanced, &limits());
        assert_eq!(out.max_tokens, 128);
    }

    #[test]
    fn severe_halves_budget() {
        let params = GenerationParams { max_tokens: 100, temperature: 1.0, ..GenerationParams::default() };
        let out = adapt_parameters(&params, ThermalState::Severe, PerformanceProfile::Balanced, &limits());
        assert_eq!(out.max_tokens, 50);
        assert!((out.temperature - 0.7).abs() < 1e-6);
    }

    #[test]
    fn battery_saver_trims_further() {
        let params = GenerationParams { max_tokens: 100, ..GenerationParams::default() };
        let out = adapt_parameters(&params, ThermalState::None, PerformanceProfile::BatterySaver, &limits());
        assert_eq!(out.max_tokens, 75);
    }

    #[test]
    fn single_token_survives_everything() {
        let params = GenerationParams { max_tokens: 1, ..GenerationParams::default() };
        for state in ThermalState::ALL {
            for profile in [
                PerformanceProfile::Performance,
                PerformanceProfile::Balanced,
                PerformanceProfile::BatterySaver,
                PerformanceProfile::Emergency,
            ] {
                assert_eq!(adapt_parameters(&params, state, profile, &limits()).max_tokens, 1);
            }
        }
    }

    #[test]
    fn monotone_in_thermal_state() {
        let params = GenerationParams { max_tokens: 777, temperature: 0.9, ..GenerationParams::default() };
        for profile in [
            PerformanceProfile::Performance,
            PerformanceProfile::Balanced,
            PerformanceProfile::BatterySaver,
            PerformanceProfile::Emergency,
        ] {
            let outputs: Vec<_> = ThermalState::ALL
                .iter()
                .map(|&state| adapt_parameters(&params, state, profile, &limits()))
                .collect();
            for pair in outputs.windows(2) {
                assert!(pair[1].max_tokens <= pair[0].max_tokens, "{profile}: {pair:?}");
                assert!(pair[1].temperature <= pair[0].temperature, "{profile}: {pair:?}");
            }
        }
    }

    #[test]
    fn input_is_not_modified() {
        let params = GenerationParams::default();
        let copy = params;
        let _ = adapt_parameters(&params, ThermalState::Critical, PerformanceProfile::Emergency, &limits());
        assert_eq!(params, copy);
    }
}

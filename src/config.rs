//! Motor and estimator configuration.
//!
//! Plain-data parameter set with defaults, plus the derived scalars that
//! are precomputed from it. Unset optional parameters select the
//! internally-derived defaults once, at resolution time; nothing in the
//! fast path checks for "unset".

use core::f32::consts::{PI, TAU};

/// Injection period [s] (60 kHz control rate) (default value)
pub const DEFAULT_TS: f32 = 1.0 / 60_000.0;

/// d-axis inductance [H] (default value)
pub const DEFAULT_LD: f32 = 16e-3;

/// q-axis inductance [H] (default value)
pub const DEFAULT_LQ: f32 = 24e-3;

/// Phase resistance [Ohm] (default value)
pub const DEFAULT_PHASE_RESISTANCE: f32 = 0.5;

/// Injection voltage amplitude [V] (default value)
pub const DEFAULT_HFI_V: f32 = 4.0;

/// Tracking-loop proportional gain (default value)
pub const DEFAULT_HFI_GAIN1: f32 = 750.0 * TAU;

/// Tracking-loop integral gain (default value)
pub const DEFAULT_HFI_GAIN2: f32 = 5.0 * TAU;

/// Tracking-loop secondary (acceleration) gain (default value)
pub const DEFAULT_HFI_GAIN3: f32 = 0.0;

/// Angle-error clamp [rad] (default value)
pub const DEFAULT_ERROR_SATURATION_LIMIT: f32 = 0.30;

/// HFI ripple over-current trip level [A] (default value)
pub const DEFAULT_OCP_PROTECTION_LIMIT: f32 = 10.0;

/// Consecutive over-limit injection periods tolerated before the trip
/// (default value)
pub const DEFAULT_OCP_PROTECTION_MAXCYCLES: u32 = 1;

/// Flux-observer handover velocity [rad/s electrical] (default value)
pub const DEFAULT_FO_HYSTERESIS_THRESHOLD: f32 = 200.0;

/// Relative hysteresis band around the handover velocity (default value)
pub const DEFAULT_FO_HYSTERESIS_BAND: f32 = 0.1;

/// Back-EMF magnitude required to trust the flux observer [V]
/// (default value)
pub const DEFAULT_BEMF_THRESHOLD: f32 = 5.0;

/// Low-pass coefficient for the blended sensorless angle (default value)
pub const DEFAULT_SENSORLESS_LPF_ALPHA: f32 = 0.5;

/// Low-pass coefficient for velocity estimates (default value)
pub const DEFAULT_VELOCITY_FILTER_ALPHA: f32 = 0.05;

/// Voltage used while force-aligning frames during calibration [V]
/// (default value)
pub const DEFAULT_SENSOR_ALIGN_VOLTAGE: f32 = 3.0;

/// Polarity probe pulse amplitude [V] (default value)
pub const DEFAULT_POLARITY_ALIGNMENT_VOLTAGE: f32 = 0.5;

/// Polarity probe iterations (default value)
pub const DEFAULT_POLARITY_CYCLES: u32 = 30;

/// Voltage limit [V] (default value)
pub const DEFAULT_VOLTAGE_LIMIT: f32 = 12.0;

/// Current limit [A] (default value)
pub const DEFAULT_CURRENT_LIMIT: f32 = 2.0;

/// Velocity limit [rad/s shaft] (default value)
pub const DEFAULT_VELOCITY_LIMIT: f32 = 20.0;

/// Invalid configuration detected while resolving derived gains.
///
/// Caught at initialization so it never surfaces as runtime NaN.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConfigError {
    /// Pole-pair count is zero.
    ZeroPolePairs,
    /// Injection/control period is not positive.
    InvalidPeriod,
    /// Injection voltage is not positive.
    InvalidInjectionVoltage,
    /// `Ld == Lq`: no magnetic saliency, HFI demodulation is undefined.
    ZeroSaliency,
}

/// Full configuration surface an integrator sets before `init_foc`.
#[derive(Debug, Clone, Copy)]
pub struct MotorConfig {
    /// Number of pole pairs.
    pub pole_pairs: u8,
    /// Phase resistance [Ohm]; `None` selects the default.
    pub phase_resistance: Option<f32>,
    /// d-axis inductance [H]; `None` selects the default.
    pub ld: Option<f32>,
    /// q-axis inductance [H]; `None` selects the default.
    pub lq: Option<f32>,
    /// Rotor flux linkage [Wb]; `None` derives it from `kv_rating` or
    /// falls back to a conservative default.
    pub flux_linkage: Option<f32>,
    /// Motor KV rating [rpm/V]; only used to derive `flux_linkage`.
    pub kv_rating: Option<f32>,

    /// Control/injection half-cycle period [s].
    pub ts: f32,
    /// Injection voltage amplitude [V].
    pub hfi_v: f32,
    /// Tracking-loop gains: proportional, integral, secondary.
    pub hfi_gain1: f32,
    pub hfi_gain2: f32,
    pub hfi_gain3: f32,
    /// Angle-error clamp fed to the tracking loop [rad].
    pub error_saturation_limit: f32,

    /// HFI ripple over-current trip level [A].
    pub ocp_protection_limit: f32,
    /// Consecutive over-limit periods tolerated before the trip.
    pub ocp_protection_maxcycles: u32,

    /// Flux-observer handover velocity [rad/s electrical].
    pub fo_hysteresis_threshold: f32,
    /// Relative hysteresis band around the handover velocity.
    pub fo_hysteresis_band: f32,
    /// Back-EMF magnitude required to trust the flux observer [V].
    pub bemf_threshold: f32,
    /// Low-pass coefficient applied to the blended sensorless angle.
    pub sensorless_lpf_alpha: f32,
    /// Low-pass coefficient for velocity estimates.
    pub velocity_filter_alpha: f32,

    /// Voltage forced during sensor/current-sense alignment [V].
    pub sensor_align_voltage: f32,
    /// Polarity probe pulse amplitude [V].
    pub polarity_alignment_voltage: f32,
    /// Polarity probe iterations.
    pub polarity_cycles: u32,
    /// Whether the polarity probe stage runs during `init_foc`.
    pub start_polarity_alignment: bool,

    /// Output voltage limit [V].
    pub voltage_limit: f32,
    /// Current limit for the outer loops [A].
    pub current_limit: f32,
    /// Velocity limit for angle control and open loop [rad/s shaft].
    pub velocity_limit: f32,
}

impl MotorConfig {
    /// Configuration with default parameters for a given pole-pair count.
    pub fn new(pole_pairs: u8) -> Self {
        Self {
            pole_pairs,
            phase_resistance: None,
            ld: None,
            lq: None,
            flux_linkage: None,
            kv_rating: None,
            ts: DEFAULT_TS,
            hfi_v: DEFAULT_HFI_V,
            hfi_gain1: DEFAULT_HFI_GAIN1,
            hfi_gain2: DEFAULT_HFI_GAIN2,
            hfi_gain3: DEFAULT_HFI_GAIN3,
            error_saturation_limit: DEFAULT_ERROR_SATURATION_LIMIT,
            ocp_protection_limit: DEFAULT_OCP_PROTECTION_LIMIT,
            ocp_protection_maxcycles: DEFAULT_OCP_PROTECTION_MAXCYCLES,
            fo_hysteresis_threshold: DEFAULT_FO_HYSTERESIS_THRESHOLD,
            fo_hysteresis_band: DEFAULT_FO_HYSTERESIS_BAND,
            bemf_threshold: DEFAULT_BEMF_THRESHOLD,
            sensorless_lpf_alpha: DEFAULT_SENSORLESS_LPF_ALPHA,
            velocity_filter_alpha: DEFAULT_VELOCITY_FILTER_ALPHA,
            sensor_align_voltage: DEFAULT_SENSOR_ALIGN_VOLTAGE,
            polarity_alignment_voltage: DEFAULT_POLARITY_ALIGNMENT_VOLTAGE,
            polarity_cycles: DEFAULT_POLARITY_CYCLES,
            start_polarity_alignment: true,
            voltage_limit: DEFAULT_VOLTAGE_LIMIT,
            current_limit: DEFAULT_CURRENT_LIMIT,
            velocity_limit: DEFAULT_VELOCITY_LIMIT,
        }
    }
}

impl Default for MotorConfig {
    fn default() -> Self {
        Self::new(7)
    }
}

/// Scalars derived from `MotorConfig`, cached so the fast path never
/// divides.
///
/// Recomputed through `try_from` whenever the configuration changes;
/// `init_foc` re-resolves them so post-construction config edits cannot
/// leave stale derivatives behind.
#[derive(Debug, Clone, Copy)]
pub struct DerivedGains {
    /// Resolved phase resistance [Ohm].
    pub phase_resistance: f32,
    /// Resolved d-axis inductance [H].
    pub ld: f32,
    /// Resolved q-axis inductance [H].
    pub lq: f32,
    /// Resolved rotor flux linkage [Wb].
    pub flux_linkage: f32,
    /// `1 / ts`.
    pub ts_div: f32,
    /// `1 / (ts * pole_pairs)`: per-tick electrical-to-shaft scaling.
    pub ts_pp_div: f32,
    /// `1 / (hfi_v * ts * (1/lq - 1/ld))`: ripple-to-angle-error gain.
    pub prediv_angle_est: f32,
}

impl TryFrom<&MotorConfig> for DerivedGains {
    type Error = ConfigError;

    fn try_from(config: &MotorConfig) -> Result<Self, ConfigError> {
        if config.pole_pairs == 0 {
            return Err(ConfigError::ZeroPolePairs);
        }
        if config.ts <= 0.0 {
            return Err(ConfigError::InvalidPeriod);
        }
        if config.hfi_v <= 0.0 {
            return Err(ConfigError::InvalidInjectionVoltage);
        }

        let ld = config.ld.unwrap_or(DEFAULT_LD);
        let lq = config.lq.unwrap_or(DEFAULT_LQ);
        let saliency = 1.0 / lq - 1.0 / ld;
        if saliency == 0.0 {
            return Err(ConfigError::ZeroSaliency);
        }

        let flux_linkage = config.flux_linkage.unwrap_or_else(|| {
            match config.kv_rating {
                // psi = 60 / (sqrt(3) * pi * KV * pole_pairs)
                Some(kv) if kv > 0.0 => {
                    60.0 / (1.732_050_8 * PI * kv * config.pole_pairs as f32)
                }
                _ => 0.01,
            }
        });

        Ok(Self {
            phase_resistance: config.phase_resistance.unwrap_or(DEFAULT_PHASE_RESISTANCE),
            ld,
            lq,
            flux_linkage,
            ts_div: 1.0 / config.ts,
            ts_pp_div: 1.0 / (config.ts * config.pole_pairs as f32),
            prediv_angle_est: 1.0 / (config.hfi_v * config.ts * saliency),
        })
    }
}

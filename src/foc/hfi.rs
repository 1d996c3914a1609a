// High-frequency injection angle/velocity estimator.
//
// A square-wave voltage of amplitude `hfi_v` is injected on the
// estimated d-axis, alternating sign every control tick. Magnetic
// saliency (Ld != Lq) makes the current response depend on the error
// between the true and estimated d-axis, so the difference between the
// two half-cycle current samples is a demodulated angle-error signal.
// A PLL-like tracking loop integrates that error into an angle and
// velocity estimate.

use core::f32::consts::TAU;

use libm::fabsf;

use crate::config::{DerivedGains, MotorConfig};
use crate::fmt::*;
use crate::foc::Fault;
use crate::interface::DqCurrent;

pub struct HfiEstimator {
    // injection parameters
    hfi_v: f32,
    /// Tracking-loop gains: proportional, integral, secondary
    gain1: f32,
    gain2: f32,
    gain3: f32,
    /// Full injection period [s] (two control ticks)
    period: f32,
    error_saturation_limit: f32,
    /// Ripple-to-angle gain, `1/(hfi_v·Ts·(1/Lq - 1/Ld))`
    prediv_angle_est: f32,
    /// Electrical-to-shaft scaling, `1/(Ts·pole_pairs)`
    ts_pp_div: f32,
    ts: f32,

    // over-current protection
    ocp_protection_limit: f32,
    ocp_protection_maxcycles: u32,
    ocp_cycles_counter: u32,

    // injection bookkeeping
    /// Sign of the injection applied on the upcoming tick
    hfi_high: bool,
    /// First sample after (re)start is discarded so no partial-cycle
    /// data crosses a period boundary
    hfi_firstcycle: bool,
    current_high: DqCurrent,
    current_low: DqCurrent,
    delta_current: DqCurrent,

    // tracking-loop state
    hfi_error: f32,
    hfi_int: f32,
    hfi_acc: f32,
    hfi_velocity: f32,
    hfi_angle: f32,
    hfi_full_turns: i32,

    /// Resolves the 180° ambiguity of saliency sensing; always ±1
    polarity_correction: f32,
}

impl HfiEstimator {
    pub fn new(config: &MotorConfig, derived: &DerivedGains) -> Self {
        Self {
            hfi_v: config.hfi_v,
            gain1: config.hfi_gain1,
            gain2: config.hfi_gain2,
            gain3: config.hfi_gain3,
            period: 2.0 * config.ts,
            error_saturation_limit: config.error_saturation_limit,
            prediv_angle_est: derived.prediv_angle_est,
            ts_pp_div: derived.ts_pp_div,
            ts: config.ts,
            ocp_protection_limit: config.ocp_protection_limit,
            ocp_protection_maxcycles: config.ocp_protection_maxcycles,
            ocp_cycles_counter: 0,
            hfi_high: false,
            hfi_firstcycle: true,
            current_high: DqCurrent::ZERO,
            current_low: DqCurrent::ZERO,
            delta_current: DqCurrent::ZERO,
            hfi_error: 0.0,
            hfi_int: 0.0,
            hfi_acc: 0.0,
            hfi_velocity: 0.0,
            hfi_angle: 0.0,
            hfi_full_turns: 0,
            polarity_correction: 1.0,
        }
    }

    /// Injection voltage to add on the estimated d-axis this tick.
    #[inline]
    pub fn injection_voltage(&self) -> f32 {
        if self.hfi_high {
            self.hfi_v
        } else {
            -self.hfi_v
        }
    }

    /// Feed one dq current sample (the response to the injection
    /// commanded on the previous tick).
    ///
    /// Returns `Ok(true)` when a full injection period completed and the
    /// angle/velocity estimate was refreshed, `Ok(false)` on the
    /// intermediate half-cycle, and `Err(Fault::OverCurrent)` once the
    /// ripple stayed above the protection limit for more than the
    /// configured number of consecutive periods. After the trip the
    /// sample is not fed into the tracking loop.
    pub fn update(&mut self, current: DqCurrent) -> Result<bool, Fault> {
        if self.hfi_firstcycle {
            // discard the sample taken before injection was active
            self.hfi_firstcycle = false;
            self.hfi_high = true;
            return Ok(false);
        }

        // the flag still holds the polarity that produced this sample
        let completed = if self.hfi_high {
            self.current_high = current;
            false
        } else {
            self.current_low = current;
            true
        };
        self.hfi_high = !self.hfi_high;

        if !completed {
            return Ok(false);
        }

        self.delta_current = DqCurrent {
            d: self.current_high.d - self.current_low.d,
            q: self.current_high.q - self.current_low.q,
        };

        if fabsf(self.delta_current.d) > self.ocp_protection_limit {
            self.ocp_cycles_counter += 1;
            if self.ocp_cycles_counter > self.ocp_protection_maxcycles {
                error!(
                    "HFI over-current: ripple {} A over {} periods",
                    self.delta_current.d, self.ocp_cycles_counter
                );
                return Err(Fault::OverCurrent);
            }
        } else {
            self.ocp_cycles_counter = 0;
        }

        // demodulate: normalize the ripple by the known saliency and
        // injection parameters into an angle error
        let raw_error = self.delta_current.q * self.prediv_angle_est * self.polarity_correction;
        self.hfi_error = raw_error.clamp(
            -self.error_saturation_limit,
            self.error_saturation_limit,
        );

        // PLL tracking loop: proportional + integral (+ secondary
        // accelerating integrator, usually gain3 = 0)
        self.hfi_int += self.gain2 * self.period * self.hfi_error;
        self.hfi_acc += self.gain3 * self.period * self.hfi_int;
        self.hfi_velocity = self.gain1 * self.hfi_error + self.hfi_int + self.hfi_acc;

        self.hfi_angle += self.hfi_velocity * self.period;
        while self.hfi_angle >= TAU {
            self.hfi_angle -= TAU;
            self.hfi_full_turns += 1;
        }
        while self.hfi_angle < 0.0 {
            self.hfi_angle += TAU;
            self.hfi_full_turns -= 1;
        }

        Ok(true)
    }

    /// Electrical angle estimate, `[0, 2π)`.
    #[inline]
    pub fn angle(&self) -> f32 {
        self.hfi_angle
    }

    /// Electrical angular velocity estimate [rad/s].
    #[inline]
    pub fn velocity(&self) -> f32 {
        self.hfi_velocity
    }

    /// Shaft angular velocity estimate [rad/s].
    ///
    /// `hfi_velocity·Ts·ts_pp_div = hfi_velocity/pole_pairs`, using the
    /// cached reciprocal so the fast path never divides.
    #[inline]
    pub fn shaft_velocity(&self) -> f32 {
        self.hfi_velocity * self.ts * self.ts_pp_div
    }

    /// Completed electrical revolutions since start.
    #[inline]
    pub fn full_turns(&self) -> i32 {
        self.hfi_full_turns
    }

    /// Last clamped angle-error sample.
    #[inline]
    pub fn error(&self) -> f32 {
        self.hfi_error
    }

    /// Last demodulated ripple sample.
    #[inline]
    pub fn delta_current(&self) -> DqCurrent {
        self.delta_current
    }

    /// Set the saliency polarity sign resolved during calibration.
    /// Only ±1 is accepted; anything else is coerced by sign.
    pub fn set_polarity(&mut self, correction: f32) {
        self.polarity_correction = if correction < 0.0 { -1.0 } else { 1.0 };
    }

    #[inline]
    pub fn polarity(&self) -> f32 {
        self.polarity_correction
    }

    /// Seed the angle estimate, e.g. from calibration or the flux
    /// observer after a regime switch.
    pub fn seed_angle(&mut self, angle_el: f32) {
        self.hfi_angle = crate::foc::transforms::normalize_angle(angle_el);
    }

    /// Restart injection bookkeeping and tracking state. Configuration
    /// and polarity are kept.
    pub fn reset(&mut self) {
        self.hfi_high = false;
        self.hfi_firstcycle = true;
        self.current_high = DqCurrent::ZERO;
        self.current_low = DqCurrent::ZERO;
        self.delta_current = DqCurrent::ZERO;
        self.hfi_error = 0.0;
        self.hfi_int = 0.0;
        self.hfi_acc = 0.0;
        self.hfi_velocity = 0.0;
        self.hfi_angle = 0.0;
        self.hfi_full_turns = 0;
        self.ocp_cycles_counter = 0;
    }
}

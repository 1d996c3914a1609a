// Back-EMF flux observer and the HFI/observer blend logic.
//
// The observer integrates the stator voltage equation in the stationary
// frame to recover the rotor flux angle. It needs back-EMF to work, so
// it is only trusted above a velocity threshold; `SensorlessBlend`
// performs the hysteresis handover between the HFI estimate (low speed)
// and the observer (high speed).

use libm::{atan2f, fabsf};

use crate::config::{DerivedGains, MotorConfig};
use crate::fmt::*;
use crate::foc::transforms::{angular_distance, normalize_angle};

pub struct FluxObserver {
    phase_resistance: f32,
    inductance: f32,
    /// Rotor flux linkage [Wb]; also the integrator clamp
    flux_linkage: f32,
    ts: f32,
    ts_div: f32,
    bemf_threshold: f32,
    velocity_filter_alpha: f32,

    flux_alpha: f32,
    flux_beta: f32,
    i_alpha_prev: f32,
    i_beta_prev: f32,

    /// Back-EMF magnitude accumulator and its sample count, used to
    /// validate observer confidence
    bemf: f32,
    bemf_count: u32,

    angle: f32,
    velocity: f32,
}

/// Samples accumulated before the back-EMF average is meaningful.
const BEMF_MIN_SAMPLES: u32 = 64;
/// Cap on the accumulator window so old samples age out.
const BEMF_WINDOW: u32 = 4096;

impl FluxObserver {
    pub fn new(config: &MotorConfig, derived: &DerivedGains) -> Self {
        Self {
            phase_resistance: derived.phase_resistance,
            // the αβ-frame model uses a single equivalent inductance
            inductance: 0.5 * (derived.ld + derived.lq),
            flux_linkage: derived.flux_linkage,
            ts: config.ts,
            ts_div: derived.ts_div,
            bemf_threshold: config.bemf_threshold,
            velocity_filter_alpha: config.velocity_filter_alpha,
            flux_alpha: 0.0,
            flux_beta: 0.0,
            i_alpha_prev: 0.0,
            i_beta_prev: 0.0,
            bemf: 0.0,
            bemf_count: 0,
            angle: 0.0,
            velocity: 0.0,
        }
    }

    /// Advance the observer by one control tick.
    ///
    /// `u_alpha`/`u_beta` are the stationary-frame voltages applied on
    /// the previous tick, `i_alpha`/`i_beta` the resulting currents.
    pub fn update(&mut self, i_alpha: f32, i_beta: f32, u_alpha: f32, u_beta: f32) -> f32 {
        // integrate the stator equation: psi = ∫(u - R·i) dt
        self.flux_alpha += (u_alpha - self.phase_resistance * i_alpha) * self.ts;
        self.flux_beta += (u_beta - self.phase_resistance * i_beta) * self.ts;

        // clamp the open integrator so offsets cannot wind it up beyond
        // the physical flux linkage
        self.flux_alpha = self
            .flux_alpha
            .clamp(-self.flux_linkage, self.flux_linkage);
        self.flux_beta = self.flux_beta.clamp(-self.flux_linkage, self.flux_linkage);

        // rotor flux = stator flux minus the inductive part
        let rotor_alpha = self.flux_alpha - self.inductance * i_alpha;
        let rotor_beta = self.flux_beta - self.inductance * i_beta;

        let angle = normalize_angle(atan2f(rotor_beta, rotor_alpha));

        // back-EMF magnitude accumulation: e = u - R·i - L·di/dt
        let e_alpha = u_alpha
            - self.phase_resistance * i_alpha
            - self.inductance * (i_alpha - self.i_alpha_prev) * self.ts_div;
        let e_beta = u_beta
            - self.phase_resistance * i_beta
            - self.inductance * (i_beta - self.i_beta_prev) * self.ts_div;
        self.bemf += libm::sqrtf(e_alpha * e_alpha + e_beta * e_beta);
        self.bemf_count += 1;
        if self.bemf_count > BEMF_WINDOW {
            // halve the window instead of resetting so confidence
            // doesn't oscillate
            self.bemf *= 0.5;
            self.bemf_count /= 2;
        }
        self.i_alpha_prev = i_alpha;
        self.i_beta_prev = i_beta;

        // filtered velocity from the wrapped angle delta
        let raw_velocity = angular_distance(angle, self.angle) * self.ts_div;
        self.velocity += self.velocity_filter_alpha * (raw_velocity - self.velocity);
        self.angle = angle;

        angle
    }

    /// Electrical angle estimate, `[0, 2π)`.
    #[inline]
    pub fn angle(&self) -> f32 {
        self.angle
    }

    /// Electrical angular velocity estimate [rad/s].
    #[inline]
    pub fn velocity(&self) -> f32 {
        self.velocity
    }

    /// Whether the mean back-EMF magnitude is large enough to trust the
    /// observer.
    pub fn confident(&self) -> bool {
        self.bemf_count >= BEMF_MIN_SAMPLES
            && self.bemf / self.bemf_count as f32 > self.bemf_threshold
    }

    pub fn reset(&mut self) {
        self.flux_alpha = 0.0;
        self.flux_beta = 0.0;
        self.i_alpha_prev = 0.0;
        self.i_beta_prev = 0.0;
        self.bemf = 0.0;
        self.bemf_count = 0;
        self.angle = 0.0;
        self.velocity = 0.0;
    }
}

/// Estimator source actually feeding the outer loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
enum Source {
    Hfi,
    FluxObserver,
}

/// Hysteresis handover between HFI and the flux observer, with a
/// low-pass on the blended output to smooth the switchover instant.
///
/// Hard switch + filter rather than a crossfade: before polarity
/// alignment settles the two angles can sit half a revolution apart and
/// averaging across that gap yields a transiently wrong angle.
pub struct SensorlessBlend {
    threshold: f32,
    band: f32,
    lpf_alpha: f32,
    used_fo_last: bool,
    sensorless_out_prev: f32,
    sensorless_velocity: f32,
    first: bool,
}

impl SensorlessBlend {
    pub fn new(config: &MotorConfig) -> Self {
        Self {
            threshold: config.fo_hysteresis_threshold,
            band: config.fo_hysteresis_band,
            lpf_alpha: config.sensorless_lpf_alpha,
            used_fo_last: false,
            sensorless_out_prev: 0.0,
            sensorless_velocity: 0.0,
            first: true,
        }
    }

    /// Pick the estimator source for this tick and produce the blended
    /// angle/velocity pair the outer loops consume.
    pub fn select(
        &mut self,
        hfi_angle: f32,
        hfi_velocity: f32,
        fo_angle: f32,
        fo_velocity: f32,
        fo_confident: bool,
    ) -> (f32, f32) {
        // judge speed by whichever source fed the previous tick so the
        // comparison itself cannot chatter
        let speed = if self.used_fo_last {
            fabsf(fo_velocity)
        } else {
            fabsf(hfi_velocity)
        };

        let use_fo = if self.used_fo_last {
            // leave the observer only well below the threshold
            fo_confident && speed > self.threshold * (1.0 - self.band)
        } else {
            // enter it only well above
            fo_confident && speed > self.threshold * (1.0 + self.band)
        };

        if use_fo != self.used_fo_last {
            info!(
                "sensorless source switch: fo={} at |vel|={}",
                use_fo, speed
            );
        }
        self.used_fo_last = use_fo;

        let (selected_angle, selected_velocity) = if use_fo {
            (fo_angle, fo_velocity)
        } else {
            (hfi_angle, hfi_velocity)
        };

        let out = if self.first {
            self.first = false;
            selected_angle
        } else {
            // wrap-aware low-pass keeps the output continuous across
            // the switchover
            normalize_angle(
                self.sensorless_out_prev
                    + self.lpf_alpha
                        * angular_distance(selected_angle, self.sensorless_out_prev),
            )
        };
        self.sensorless_out_prev = out;
        self.sensorless_velocity = selected_velocity;

        (out, selected_velocity)
    }

    /// Which source fed the previous tick.
    pub fn used_flux_observer(&self) -> bool {
        self.used_fo_last
    }

    pub fn reset(&mut self) {
        self.used_fo_last = false;
        self.sensorless_out_prev = 0.0;
        self.sensorless_velocity = 0.0;
        self.first = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use libm::{cosf, sinf};

    fn test_setup() -> (MotorConfig, DerivedGains) {
        let mut config = MotorConfig::new(7);
        config.phase_resistance = Some(0.2);
        config.ld = Some(1e-3);
        config.lq = Some(1.5e-3);
        config.flux_linkage = Some(0.05);
        config.bemf_threshold = 0.5;
        let derived = DerivedGains::try_from(&config).unwrap();
        (config, derived)
    }

    #[test]
    fn test_tracks_rotating_bemf() {
        let (config, derived) = test_setup();
        let mut observer = FluxObserver::new(&config, &derived);

        // spinning rotor: pure sinusoidal back-EMF, no load current
        let omega = 400.0; // rad/s electrical
        let psi = 0.05;
        let mut angle = 0.0_f32;
        let mut last = 0.0;
        for _ in 0..30_000 {
            angle = normalize_angle(angle + omega * config.ts);
            // e = dψ/dt: lags flux by -90°.. u must cancel e for zero current
            let u_alpha = -psi * omega * sinf(angle);
            let u_beta = psi * omega * cosf(angle);
            last = observer.update(0.0, 0.0, u_alpha, u_beta);
        }

        assert!(observer.confident());
        let err = angular_distance(last, angle);
        assert!(err.abs() < 0.1, "angle error {}", err);
        assert!(
            (observer.velocity() - omega).abs() < 0.05 * omega,
            "velocity {}",
            observer.velocity()
        );
    }

    #[test]
    fn test_not_confident_at_standstill() {
        let (config, derived) = test_setup();
        let mut observer = FluxObserver::new(&config, &derived);
        for _ in 0..1000 {
            observer.update(0.0, 0.0, 0.0, 0.0);
        }
        assert!(!observer.confident());
    }

    #[test]
    fn test_blend_prefers_hfi_at_low_speed() {
        let (config, _) = test_setup();
        let mut blend = SensorlessBlend::new(&config);
        let (angle, vel) = blend.select(1.0, 10.0, 2.0, 12.0, true);
        assert_eq!(angle, 1.0);
        assert_eq!(vel, 10.0);
        assert!(!blend.used_flux_observer());
    }

    #[test]
    fn test_blend_hysteresis_is_sticky() {
        let (mut config, _) = test_setup();
        config.fo_hysteresis_threshold = 100.0;
        config.fo_hysteresis_band = 0.1;
        config.sensorless_lpf_alpha = 1.0;
        let mut blend = SensorlessBlend::new(&config);

        // below the entry threshold (110): stays on HFI
        blend.select(0.5, 105.0, 0.6, 105.0, true);
        assert!(!blend.used_flux_observer());

        // above it: switches to the observer
        blend.select(0.5, 115.0, 0.6, 115.0, true);
        assert!(blend.used_flux_observer());

        // dithering inside the band must not switch back
        for v in [95.0, 105.0, 98.0, 108.0] {
            blend.select(0.5, v, 0.6, v, true);
            assert!(blend.used_flux_observer());
        }

        // well below the exit threshold (90): back to HFI
        blend.select(0.5, 80.0, 0.6, 80.0, true);
        assert!(!blend.used_flux_observer());
    }

    #[test]
    fn test_blend_requires_confidence() {
        let (mut config, _) = test_setup();
        config.fo_hysteresis_threshold = 100.0;
        let mut blend = SensorlessBlend::new(&config);
        // fast but unconfident observer: keep HFI
        blend.select(0.5, 500.0, 0.6, 500.0, false);
        assert!(!blend.used_flux_observer());
    }

    #[test]
    fn test_blend_output_continuous_across_switch() {
        let (mut config, _) = test_setup();
        config.fo_hysteresis_threshold = 100.0;
        config.sensorless_lpf_alpha = 0.3;
        let mut blend = SensorlessBlend::new(&config);

        let (first, _) = blend.select(1.0, 50.0, 1.4, 50.0, true);
        assert_eq!(first, 1.0);

        // switch to the observer, whose angle is 0.4 rad away: the
        // filtered output moves only a fraction of the gap per tick
        let (second, _) = blend.select(1.0, 150.0, 1.4, 150.0, true);
        assert!(blend.used_flux_observer());
        assert!((second - (1.0 + 0.3 * 0.4)).abs() < 1e-5);

        // and converges to the new source
        let mut out = second;
        for _ in 0..50 {
            out = blend.select(1.0, 150.0, 1.4, 150.0, true).0;
        }
        assert!((out - 1.4).abs() < 1e-3);
    }
}

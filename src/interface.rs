// Collaborator contracts between the control core and the hardware.
//
// The core never talks to peripherals directly: PWM output, angle
// sampling, current sampling and time measurement are all injected
// through these traits so the estimator and control loops stay portable
// and testable.

/// Raw three-phase current sample [A].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PhaseCurrents {
    pub a: f32,
    pub b: f32,
    pub c: f32,
}

/// Current (or voltage) vector in the rotating dq reference frame.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DqCurrent {
    /// d-axis component (aligned with rotor flux)
    pub d: f32,
    /// q-axis component (torque-producing)
    pub q: f32,
}

/// Monotonic time source, microsecond resolution.
///
/// Injected instead of reading a global clock so tests can supply
/// deterministic time without real delays.
pub trait MonotonicClock {
    fn now_micros(&self) -> u64;
}

/// Three-phase voltage actuator.
///
/// Implementations turn the three phase-voltage commands into PWM duty
/// cycles; both 3-PWM and 6-PWM schemes hide behind this surface.
pub trait PhaseDriver {
    /// Supply voltage limit [V]. Phase commands stay within `[0, limit]`.
    fn voltage_limit(&self) -> f32;

    /// Apply the three phase voltages [V].
    fn set_pwm(&mut self, ua: f32, ub: f32, uc: f32);

    /// Enable the power stage.
    fn enable(&mut self);

    /// Disable the power stage (all phases off, safe state).
    fn disable(&mut self);
}

/// Mechanical angle source, e.g. an encoder or magnetic sensor.
pub trait AngleSensor {
    /// Shaft angle in radians, `[0, 2π)`.
    fn angle(&mut self) -> f32;

    /// Whether the sensor provides an absolute-index channel.
    fn has_index(&self) -> bool {
        false
    }

    /// Whether the index event has been observed since power-up.
    fn index_found(&mut self) -> bool {
        false
    }
}

/// Phase current source, sampled synchronously with the injection
/// half-cycle boundary.
pub trait CurrentSensor {
    fn phase_currents(&mut self) -> PhaseCurrents;
}

/// Placeholder sensor type for sensorless-only configurations.
///
/// Never queried at runtime; it only exists so `Option<S>` has a type to
/// name when no physical sensor is linked.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSensor;

impl AngleSensor for NoSensor {
    fn angle(&mut self) -> f32 {
        0.0
    }
}

impl DqCurrent {
    pub const ZERO: Self = Self { d: 0.0, q: 0.0 };
}

impl PhaseCurrents {
    /// Largest phase magnitude, used by the current-sense alignment
    /// confidence check.
    pub fn max_magnitude(&self) -> f32 {
        let a = libm::fabsf(self.a);
        let b = libm::fabsf(self.b);
        let c = libm::fabsf(self.c);
        a.max(b).max(c)
    }
}

// Open-loop motion generators.
//
// Ramp voltage vectors over time without closed-loop feedback, used
// during startup before sensorless lock or as a permanent open-loop
// mode. Both generators share one timestamp/angle accumulator and are
// restartable so mode entry never produces a spurious large Δt.

use libm::fabsf;

use crate::foc::transforms::normalize_angle;
use crate::interface::MonotonicClock;

/// Fallback step when the measured elapsed time is unusable.
const FALLBACK_TS: f32 = 1e-3;
const MAX_VALID_TS: f32 = 0.5;

pub struct OpenLoop {
    open_loop_timestamp: u64,
    /// Integrated shaft angle [rad]
    shaft_angle: f32,
    /// Last commanded shaft velocity [rad/s]
    shaft_velocity: f32,
    started: bool,
}

impl OpenLoop {
    pub fn new() -> Self {
        Self {
            open_loop_timestamp: 0,
            shaft_angle: 0.0,
            shaft_velocity: 0.0,
            started: false,
        }
    }

    /// Restart the time reference; call on mode entry.
    pub fn reset(&mut self, clock: &impl MonotonicClock) {
        self.open_loop_timestamp = clock.now_micros();
        self.started = true;
    }

    fn elapsed(&mut self, clock: &impl MonotonicClock) -> f32 {
        let now = clock.now_micros();
        let mut ts = now.wrapping_sub(self.open_loop_timestamp) as f32 * 1e-6;
        if !self.started || ts <= 0.0 || ts > MAX_VALID_TS {
            ts = FALLBACK_TS;
            self.started = true;
        }
        self.open_loop_timestamp = now;
        ts
    }

    /// Integrate the shaft angle at `target_velocity` [rad/s].
    ///
    /// Returns the new shaft angle, `[0, 2π)`.
    pub fn velocity_openloop(
        &mut self,
        target_velocity: f32,
        clock: &impl MonotonicClock,
    ) -> f32 {
        let ts = self.elapsed(clock);
        self.shaft_angle = normalize_angle(self.shaft_angle + target_velocity * ts);
        self.shaft_velocity = target_velocity;
        self.shaft_angle
    }

    /// Move the shaft angle toward `target_angle` [rad], rate-clamped to
    /// `velocity_limit`, approaching monotonically and holding once
    /// reached.
    pub fn angle_openloop(
        &mut self,
        target_angle: f32,
        velocity_limit: f32,
        clock: &impl MonotonicClock,
    ) -> f32 {
        let ts = self.elapsed(clock);
        let distance = target_angle - self.shaft_angle;
        let max_step = velocity_limit * ts;
        if fabsf(distance) > max_step {
            self.shaft_angle += if distance > 0.0 { max_step } else { -max_step };
            self.shaft_velocity = if distance > 0.0 {
                velocity_limit
            } else {
                -velocity_limit
            };
        } else {
            self.shaft_angle = target_angle;
            self.shaft_velocity = 0.0;
        }
        self.shaft_angle
    }

    /// Shaft angle accumulator [rad].
    #[inline]
    pub fn shaft_angle(&self) -> f32 {
        self.shaft_angle
    }

    /// Last commanded shaft velocity [rad/s].
    #[inline]
    pub fn shaft_velocity(&self) -> f32 {
        self.shaft_velocity
    }
}

impl Default for OpenLoop {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::Cell;
    use core::f32::consts::TAU;

    struct FakeClock {
        now: Cell<u64>,
    }

    impl FakeClock {
        fn new() -> Self {
            Self { now: Cell::new(1_000) }
        }

        fn advance(&self, micros: u64) {
            self.now.set(self.now.get() + micros);
        }
    }

    impl MonotonicClock for FakeClock {
        fn now_micros(&self) -> u64 {
            self.now.get()
        }
    }

    #[test]
    fn test_velocity_integration() {
        let clock = FakeClock::new();
        let mut ol = OpenLoop::new();
        ol.reset(&clock);

        // 10 rad/s, 1 ms steps: 0.01 rad per call
        for k in 1..=100 {
            clock.advance(1_000);
            let angle = ol.velocity_openloop(10.0, &clock);
            assert!((angle - normalize_angle(0.01 * k as f32)).abs() < 1e-4);
        }
        assert_eq!(ol.shaft_velocity(), 10.0);
    }

    #[test]
    fn test_velocity_wraps() {
        let clock = FakeClock::new();
        let mut ol = OpenLoop::new();
        ol.reset(&clock);

        for _ in 0..1000 {
            clock.advance(10_000);
            let angle = ol.velocity_openloop(5.0, &clock);
            assert!((0.0..TAU).contains(&angle));
        }
    }

    #[test]
    fn test_angle_advances_then_holds() {
        let clock = FakeClock::new();
        let mut ol = OpenLoop::new();
        ol.reset(&clock);

        let target = 1.0;
        let velocity_limit = 10.0;
        // fixed 1 ms steps: 0.01 rad per call until the target is hit
        let mut prev = 0.0;
        for _ in 0..99 {
            clock.advance(1_000);
            let angle = ol.angle_openloop(target, velocity_limit, &clock);
            assert!((angle - prev - 0.01).abs() < 1e-4);
            assert!(angle < target);
            prev = angle;
        }
        // within a couple more steps the generator snaps exactly onto
        // the target
        let mut angle = prev;
        for _ in 0..3 {
            clock.advance(1_000);
            angle = ol.angle_openloop(target, velocity_limit, &clock);
        }
        assert_eq!(angle, target);
        assert_eq!(ol.shaft_velocity(), 0.0);

        // holds once reached
        for _ in 0..10 {
            clock.advance(1_000);
            assert_eq!(ol.angle_openloop(target, velocity_limit, &clock), target);
        }
    }

    #[test]
    fn test_angle_negative_direction() {
        let clock = FakeClock::new();
        let mut ol = OpenLoop::new();
        ol.reset(&clock);

        clock.advance(1_000);
        let angle = ol.angle_openloop(-1.0, 10.0, &clock);
        assert!((angle + 0.01).abs() < 1e-5);
        assert_eq!(ol.shaft_velocity(), -10.0);
    }

    #[test]
    fn test_reset_guards_stale_dt() {
        let clock = FakeClock::new();
        let mut ol = OpenLoop::new();
        ol.reset(&clock);

        // a long pause without reset would give a huge Δt; the guard
        // substitutes the 1 ms fallback instead
        clock.advance(10_000_000);
        let angle = ol.velocity_openloop(10.0, &clock);
        assert!((angle - 0.01).abs() < 1e-5);
    }

    #[test]
    fn test_unstarted_uses_fallback() {
        let clock = FakeClock::new();
        let mut ol = OpenLoop::new();
        // no reset: first call must not see the absolute clock value
        let angle = ol.velocity_openloop(10.0, &clock);
        assert!((angle - 0.01).abs() < 1e-5);
    }
}

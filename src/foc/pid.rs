// Discrete PID controller with anti-windup and output slew limiting.
//
// One instance per control loop (current-d, current-q, velocity, angle).

use crate::interface::MonotonicClock;

/// Self-timed fallback step when the measured elapsed time is unusable
/// (non-positive or longer than `MAX_VALID_TS`).
const FALLBACK_TS: f32 = 1e-3;
/// Longest elapsed time accepted from the clock [s].
const MAX_VALID_TS: f32 = 0.5;

/// PID controller with anti-windup and output ramp limiting.
///
/// Discretization: proportional `P·e`, trapezoidal (Tustin) integral,
/// backward-difference derivative. The integral and the summed output
/// are both clamped to `±limit`; when `output_ramp > 0` the output slew
/// rate is additionally clamped to `±output_ramp` [unit/s].
pub struct PidController {
    /// Proportional gain
    pub p: f32,
    /// Integral gain
    pub i: f32,
    /// Derivative gain
    pub d: f32,
    /// Maximum output slew rate [unit/s]; 0 disables ramping
    pub output_ramp: f32,
    /// Symmetric output clamp
    pub limit: f32,
    /// Previous error
    error_prev: f32,
    /// Previous output
    output_prev: f32,
    /// Previous integral value
    integral_prev: f32,
    /// Timestamp of the previous self-timed call [µs]
    timestamp_prev: u64,
    /// Whether a self-timed call has happened yet; the first one has no
    /// previous timestamp to measure against
    started: bool,
}

impl PidController {
    pub fn new(p: f32, i: f32, d: f32, output_ramp: f32, limit: f32) -> Self {
        Self {
            p,
            i,
            d,
            output_ramp,
            limit,
            error_prev: 0.0,
            output_prev: 0.0,
            integral_prev: 0.0,
            timestamp_prev: 0,
            started: false,
        }
    }

    /// Self-timed form: measures elapsed time since the previous call
    /// through the injected clock.
    ///
    /// Zero, negative or out-of-range elapsed times (timer wraparound,
    /// stalled caller) fall back to a fixed 1 ms step instead of
    /// propagating a nonsensical gain. The very first call always uses
    /// the fallback: there is no previous timestamp to measure against,
    /// and the clock need not start at zero.
    pub fn update_clocked(&mut self, error: f32, clock: &impl MonotonicClock) -> f32 {
        let timestamp_now = clock.now_micros();
        let mut ts = timestamp_now.wrapping_sub(self.timestamp_prev) as f32 * 1e-6;
        if !self.started || ts <= 0.0 || ts > MAX_VALID_TS {
            ts = FALLBACK_TS;
            self.started = true;
        }
        self.timestamp_prev = timestamp_now;
        self.update(error, ts)
    }

    /// Externally-timed form.
    pub fn update(&mut self, error: f32, ts: f32) -> f32 {
        self.update_with_inv(error, ts, 1.0 / ts)
    }

    /// Externally-timed form with precomputed `1/ts` for call sites on
    /// the periodic deadline.
    pub fn update_with_inv(&mut self, error: f32, ts: f32, ts_inv: f32) -> f32 {
        // u(s) = (P + I/s + D·s) e(s)
        let proportional = self.p * error;

        // Tustin transform of the integral part:
        // u_ik = u_ik-1 + I·Ts/2·(e_k + e_k-1)
        let mut integral = self.integral_prev + self.i * ts * 0.5 * (error + self.error_prev);
        // antiwindup - keep the integrator inside the output range
        integral = integral.clamp(-self.limit, self.limit);

        // backward difference: u_dk = D·(e_k - e_k-1)/Ts
        let derivative = self.d * (error - self.error_prev) * ts_inv;

        let mut output = (proportional + integral + derivative).clamp(-self.limit, self.limit);

        if self.output_ramp > 0.0 {
            let output_rate = (output - self.output_prev) * ts_inv;
            if output_rate > self.output_ramp {
                output = self.output_prev + self.output_ramp * ts;
            } else if output_rate < -self.output_ramp {
                output = self.output_prev - self.output_ramp * ts;
            }
        }

        // save state for the next pass: integral, output, error
        self.integral_prev = integral;
        self.output_prev = output;
        self.error_prev = error;
        output
    }

    /// Zero the controller history. Gains and limits are untouched.
    pub fn reset(&mut self) {
        self.integral_prev = 0.0;
        self.output_prev = 0.0;
        self.error_prev = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::Cell;

    struct FakeClock {
        now: Cell<u64>,
    }

    impl FakeClock {
        fn new() -> Self {
            Self { now: Cell::new(0) }
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
    fn test_pure_proportional_no_drift() {
        let mut pid = PidController::new(1.0, 0.0, 0.0, 0.0, 100.0);
        for _ in 0..50 {
            assert_eq!(pid.update(5.0, 1e-3), 5.0);
        }
    }

    #[test]
    fn test_zero_error_first_call() {
        let mut pid = PidController::new(2.0, 1.0, 0.5, 0.0, 100.0);
        assert_eq!(pid.update(0.0, 1e-3), 0.0);
    }

    #[test]
    fn test_output_limited() {
        let mut pid = PidController::new(10.0, 5.0, 0.0, 0.0, 3.0);
        for _ in 0..100 {
            let output = pid.update(50.0, 1e-3);
            assert!(output.abs() <= 3.0);
        }
        let output = pid.update(-50.0, 1e-3);
        assert!(output.abs() <= 3.0);
    }

    #[test]
    fn test_output_ramp_bounds_slew() {
        let ramp = 100.0;
        let ts = 1e-3;
        let mut pid = PidController::new(50.0, 0.0, 0.0, ramp, 1000.0);
        let mut prev = 0.0;
        for _ in 0..20 {
            let output = pid.update(10.0, ts);
            assert!((output - prev).abs() <= ramp * ts + 1e-4);
            prev = output;
        }
    }

    #[test]
    fn test_trapezoidal_integral() {
        // I=1, constant error 2, ts=0.1: integral grows by
        // I·ts/2·(e+e_prev) = 0.1 per step after the first
        let mut pid = PidController::new(0.0, 1.0, 0.0, 0.0, 100.0);
        let first = pid.update(2.0, 0.1); // e_prev was 0: 0.1·0.5·2 = 0.1
        assert!((first - 0.1).abs() < 1e-6);
        let second = pid.update(2.0, 0.1); // + 0.1·0.5·4 = 0.2
        assert!((second - 0.3).abs() < 1e-6);
    }

    #[test]
    fn test_reset_reproduces_sequence() {
        let inputs = [1.0, 3.0, -2.0, 0.5, 4.0, -1.0];
        let mut pid = PidController::new(0.8, 2.0, 0.01, 50.0, 10.0);
        let mut first_run = [0.0f32; 6];
        for (k, &e) in inputs.iter().enumerate() {
            first_run[k] = pid.update(e, 1e-3);
        }
        pid.reset();
        for (k, &e) in inputs.iter().enumerate() {
            assert_eq!(pid.update(e, 1e-3), first_run[k]);
        }
    }

    #[test]
    fn test_clocked_fallback_on_bad_dt() {
        let clock = FakeClock::new();
        let mut pid = PidController::new(0.0, 1.0, 0.0, 0.0, 100.0);

        // First call has no previous timestamp: fallback 1 ms
        let first = pid.update_clocked(2.0, &clock);
        assert!((first - 1e-3 * 0.5 * 2.0).abs() < 1e-7);

        // Stalled clock: elapsed 0 again, fallback again
        let second = pid.update_clocked(2.0, &clock);
        assert!((second - first - 1e-3 * 0.5 * 4.0).abs() < 1e-7);

        // Excessive elapsed time (> 0.5 s) also falls back
        clock.advance(2_000_000);
        let third = pid.update_clocked(2.0, &clock);
        assert!((third - second - 1e-3 * 0.5 * 4.0).abs() < 1e-7);

        // Normal step is honored
        clock.advance(10_000);
        let fourth = pid.update_clocked(2.0, &clock);
        assert!((fourth - third - 0.01 * 0.5 * 4.0).abs() < 1e-6);
    }

    #[test]
    fn test_first_clocked_call_ignores_clock_epoch() {
        // a clock that did not start at zero: the first call must use
        // the 1 ms fallback, not the elapsed time since the clock's
        // epoch
        let clock = FakeClock::new();
        clock.advance(100_000);
        let mut pid = PidController::new(0.0, 1.0, 0.0, 0.0, 100.0);
        let first = pid.update_clocked(2.0, &clock);
        assert!((first - 1e-3 * 0.5 * 2.0).abs() < 1e-7);

        // subsequent measured steps are honored
        clock.advance(10_000);
        let second = pid.update_clocked(2.0, &clock);
        assert!((second - first - 0.01 * 0.5 * 4.0).abs() < 1e-6);
    }
}

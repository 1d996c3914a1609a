// Motor orchestration: owns the hardware collaborators, the estimators
// and the control loops, and sequences them into the two entry points an
// integrator calls: `loop_foc()` on every control tick and `move_to()`
// at the outer motion rate.
//
// With no angle sensor linked the electrical angle comes from the
// HFI/flux-observer blend; with one linked the estimators are bypassed
// and no injection voltage is added.

use crate::config::{DerivedGains, MotorConfig};
use crate::fmt::*;
use crate::foc::calibration::{Alignment, AlignmentDrive};
use crate::foc::transforms::{
    angular_distance, center_phases, clarke, inverse_park, limit_voltage, normalize_angle, park,
};
use crate::foc::{
    ControlMode, Fault, FluxObserver, FocError, HfiEstimator, OpenLoop, PidController,
    SensorlessBlend,
};
use crate::interface::{AngleSensor, CurrentSensor, DqCurrent, MonotonicClock, PhaseDriver};

/// Current-loop gains (default values); retune per motor through the
/// public `pid_current_*` fields before `init_foc`.
const DEFAULT_CURRENT_P: f32 = 3.0;
const DEFAULT_CURRENT_I: f32 = 300.0;

/// Velocity-loop gains (default values).
const DEFAULT_VELOCITY_P: f32 = 0.5;
const DEFAULT_VELOCITY_I: f32 = 10.0;
/// Velocity-loop output slew limit [A/s] (default value).
const DEFAULT_VELOCITY_RAMP: f32 = 1000.0;

/// Angle-loop proportional gain (default value).
const DEFAULT_ANGLE_P: f32 = 20.0;

/// Sensorless FOC motor.
///
/// Generic over the injected hardware collaborators: phase driver `D`,
/// current sensor `C`, optional angle sensor `S` and time source `K`.
///
/// Call order: construct, optionally adjust `config` and the PID gains,
/// `init_foc()` once, then `loop_foc()` every control tick and
/// `move_to(target)` at the outer motion rate.
pub struct HfiMotor<D, C, S, K> {
    driver: D,
    current_sense: C,
    sensor: Option<S>,
    clock: K,

    /// Parameter set; edits apply at the next `init_foc`.
    pub config: MotorConfig,
    derived: DerivedGains,

    hfi: HfiEstimator,
    flux_observer: FluxObserver,
    blend: SensorlessBlend,
    openloop: OpenLoop,

    pub pid_current_d: PidController,
    pub pid_current_q: PidController,
    pub pid_velocity: PidController,
    pub pid_angle: PidController,

    mode: ControlMode,
    target: f32,

    // calibration constants
    zero_electric_angle: f32,
    sensor_direction: f32,
    index_offset: Option<f32>,

    // estimates feeding the loops
    electrical_angle: f32,
    electrical_velocity: f32,
    shaft_angle: f32,
    shaft_velocity: f32,

    current_meas: DqCurrent,
    current_setpoint: DqCurrent,
    /// Stationary-frame voltage applied on the previous tick, fed back
    /// into the flux observer.
    u_alpha: f32,
    u_beta: f32,

    enabled: bool,
    calibrated: bool,
    /// Latched safety fault; cleared only by `clear_fault`.
    fault: Option<Fault>,
}

impl<D, C, S, K> HfiMotor<D, C, S, K>
where
    D: PhaseDriver,
    C: CurrentSensor,
    S: AngleSensor,
    K: MonotonicClock,
{
    /// Motor with a physical angle sensor; the sensorless estimators
    /// stay idle and no injection voltage is added.
    pub fn with_sensor(
        driver: D,
        current_sense: C,
        sensor: S,
        clock: K,
        config: MotorConfig,
    ) -> Result<Self, crate::config::ConfigError> {
        Self::build(driver, current_sense, Some(sensor), clock, config)
    }

    fn build(
        driver: D,
        current_sense: C,
        sensor: Option<S>,
        clock: K,
        config: MotorConfig,
    ) -> Result<Self, crate::config::ConfigError> {
        let derived = DerivedGains::try_from(&config)?;
        Ok(Self {
            driver,
            current_sense,
            sensor,
            clock,
            hfi: HfiEstimator::new(&config, &derived),
            flux_observer: FluxObserver::new(&config, &derived),
            blend: SensorlessBlend::new(&config),
            openloop: OpenLoop::new(),
            pid_current_d: PidController::new(
                DEFAULT_CURRENT_P,
                DEFAULT_CURRENT_I,
                0.0,
                0.0,
                config.voltage_limit,
            ),
            pid_current_q: PidController::new(
                DEFAULT_CURRENT_P,
                DEFAULT_CURRENT_I,
                0.0,
                0.0,
                config.voltage_limit,
            ),
            pid_velocity: PidController::new(
                DEFAULT_VELOCITY_P,
                DEFAULT_VELOCITY_I,
                0.0,
                DEFAULT_VELOCITY_RAMP,
                config.current_limit,
            ),
            pid_angle: PidController::new(DEFAULT_ANGLE_P, 0.0, 0.0, 0.0, config.velocity_limit),
            mode: ControlMode::Torque,
            target: 0.0,
            zero_electric_angle: 0.0,
            sensor_direction: 1.0,
            index_offset: None,
            electrical_angle: 0.0,
            electrical_velocity: 0.0,
            shaft_angle: 0.0,
            shaft_velocity: 0.0,
            current_meas: DqCurrent::ZERO,
            current_setpoint: DqCurrent::ZERO,
            u_alpha: 0.0,
            u_beta: 0.0,
            enabled: false,
            calibrated: false,
            fault: None,
            config,
            derived,
        })
    }

    /// Resolve the configuration, run the alignment procedure and arm
    /// the control loops.
    ///
    /// Each alignment tick samples the collaborators once and applies
    /// one voltage command; the caller's PWM update rate paces the
    /// sequence. On failure the error names the stage that failed and
    /// the motor stays uncalibrated.
    pub fn init_foc(&mut self) -> Result<(), FocError> {
        // re-resolve so config edits since construction take effect
        self.derived = DerivedGains::try_from(&self.config)?;
        self.hfi = HfiEstimator::new(&self.config, &self.derived);
        self.flux_observer = FluxObserver::new(&self.config, &self.derived);
        self.blend = SensorlessBlend::new(&self.config);
        self.electrical_angle = 0.0;
        self.electrical_velocity = 0.0;
        self.shaft_angle = 0.0;
        self.shaft_velocity = 0.0;
        self.calibrated = false;

        self.driver.enable();
        self.enabled = true;

        let has_sensor = self.sensor.is_some();
        let has_index = self
            .sensor
            .as_ref()
            .map(|s| s.has_index())
            .unwrap_or(false);
        let mut alignment = Alignment::new(&self.config, has_sensor, has_index);
        let mut drive = AlignmentDrive::default();

        for _ in 0..=alignment.budget() {
            let sensor_angle = self.sensor.as_mut().map(|s| s.angle());
            let index_active = self
                .sensor
                .as_mut()
                .map(|s| s.index_found())
                .unwrap_or(false);
            let currents = self.current_sense.phase_currents();
            let (i_alpha, i_beta) = clarke(currents.a, currents.b, currents.c);
            // project onto the frame commanded on the previous tick
            let (d, q) = park(i_alpha, i_beta, drive.angle_el);

            drive = alignment.update(sensor_angle, index_active, currents, DqCurrent { d, q });
            self.set_phase_voltage(drive.uq, drive.ud, drive.angle_el);
            if alignment.done() {
                break;
            }
        }
        self.set_phase_voltage(0.0, 0.0, 0.0);

        match alignment.outcome().copied() {
            Some(Ok(result)) => {
                self.zero_electric_angle = result.zero_electric_angle;
                self.sensor_direction = result.sensor_direction;
                self.index_offset = result.index_offset;
                self.hfi.set_polarity(result.polarity_correction);
                self.calibrated = true;
                info!("FOC initialized");
                Ok(())
            }
            Some(Err(e)) => Err(e),
            // the budget bounds every stage; not reachable in practice
            None => Err(FocError::NotCalibrated),
        }
    }

    /// One closed-loop control tick: sample currents, refresh the angle
    /// estimate, run the current loops and apply the phase voltages.
    ///
    /// Call at the configured control rate (`config.ts`), synchronized
    /// with the current-sampling instant. No-op in the open-loop modes,
    /// which are driven entirely from `move_to`.
    pub fn loop_foc(&mut self) -> Result<(), FocError> {
        if let Some(fault) = self.fault {
            return Err(FocError::Fault(fault));
        }
        if matches!(
            self.mode,
            ControlMode::VelocityOpenloop | ControlMode::AngleOpenloop
        ) {
            return Ok(());
        }
        if !self.calibrated {
            return Err(FocError::NotCalibrated);
        }
        if !self.enabled {
            return Ok(());
        }

        let currents = self.current_sense.phase_currents();
        let (i_alpha, i_beta) = clarke(currents.a, currents.b, currents.c);
        // the sample responds to last tick's command: demodulate in the
        // frame that produced it
        let (d, q) = park(i_alpha, i_beta, self.electrical_angle);
        self.current_meas = DqCurrent { d, q };

        let angle_prev = self.electrical_angle;
        let pole_pairs = self.config.pole_pairs as f32;

        let sensor_mech = self.sensor.as_mut().map(|s| s.angle());
        let injection = match sensor_mech {
            None => {
                if let Err(fault) = self.hfi.update(self.current_meas) {
                    self.trip(fault);
                    return Err(FocError::Fault(fault));
                }
                self.flux_observer
                    .update(i_alpha, i_beta, self.u_alpha, self.u_beta);
                let (angle, velocity) = self.blend.select(
                    self.hfi.angle(),
                    self.hfi.velocity(),
                    self.flux_observer.angle(),
                    self.flux_observer.velocity(),
                    self.flux_observer.confident(),
                );
                self.electrical_angle = angle;
                self.electrical_velocity = velocity;
                self.hfi.injection_voltage()
            }
            Some(mech) => {
                let angle = normalize_angle(
                    self.sensor_direction * pole_pairs * mech - self.zero_electric_angle,
                );
                let raw = angular_distance(angle, angle_prev) * self.derived.ts_div;
                self.electrical_velocity +=
                    self.config.velocity_filter_alpha * (raw - self.electrical_velocity);
                self.electrical_angle = angle;
                0.0
            }
        };
        self.shaft_velocity = self.electrical_velocity / pole_pairs;
        self.shaft_angle += angular_distance(self.electrical_angle, angle_prev) / pole_pairs;

        let ts = self.config.ts;
        let uq = self.pid_current_q.update_with_inv(
            self.current_setpoint.q - self.current_meas.q,
            ts,
            self.derived.ts_div,
        );
        let ud = self.pid_current_d.update_with_inv(
            self.current_setpoint.d - self.current_meas.d,
            ts,
            self.derived.ts_div,
        );
        let (ud, uq) = limit_voltage(ud, uq, self.config.voltage_limit);

        // the injection rides on top of the d-axis command; the phase
        // stage clamps against the supply
        self.set_phase_voltage(uq, ud + injection, self.electrical_angle);
        Ok(())
    }

    /// Outer motion loop: turn `target` into the current setpoint (or,
    /// in the open-loop modes, directly into a voltage vector).
    ///
    /// Target unit depends on the mode: amperes for `Torque`, shaft
    /// rad/s for the velocity modes, shaft radians for the angle modes.
    pub fn move_to(&mut self, target: f32) {
        self.target = target;
        if self.fault.is_some() || !self.enabled {
            return;
        }

        match self.mode {
            ControlMode::Torque => {
                self.current_setpoint = DqCurrent { d: 0.0, q: target };
            }
            ControlMode::Velocity => {
                let q = self
                    .pid_velocity
                    .update_clocked(target - self.shaft_velocity, &self.clock);
                self.current_setpoint = DqCurrent { d: 0.0, q };
            }
            ControlMode::Angle => {
                let velocity_sp = self
                    .pid_angle
                    .update_clocked(target - self.shaft_angle, &self.clock);
                let q = self
                    .pid_velocity
                    .update_clocked(velocity_sp - self.shaft_velocity, &self.clock);
                self.current_setpoint = DqCurrent { d: 0.0, q };
            }
            ControlMode::VelocityOpenloop => {
                let shaft = self.openloop.velocity_openloop(target, &self.clock);
                self.apply_openloop(shaft);
            }
            ControlMode::AngleOpenloop => {
                let shaft =
                    self.openloop
                        .angle_openloop(target, self.config.velocity_limit, &self.clock);
                self.apply_openloop(shaft);
            }
        }
    }

    fn apply_openloop(&mut self, shaft_angle: f32) {
        let pole_pairs = self.config.pole_pairs as f32;
        self.shaft_angle = shaft_angle;
        self.shaft_velocity = self.openloop.shaft_velocity();
        self.electrical_angle = normalize_angle(shaft_angle * pole_pairs);
        self.electrical_velocity = self.shaft_velocity * pole_pairs;
        self.set_phase_voltage(self.config.voltage_limit, 0.0, self.electrical_angle);
    }

    /// Synthesize and apply three center-aligned phase voltages for a
    /// (Uq, Ud) command at the given electrical angle.
    pub fn set_phase_voltage(&mut self, uq: f32, ud: f32, angle_el: f32) {
        let (u_alpha, u_beta) = inverse_park(ud, uq, angle_el);
        self.u_alpha = u_alpha;
        self.u_beta = u_beta;

        let (a, b, c) = inverse_clarke_phases(u_alpha, u_beta, self.driver.voltage_limit());
        self.driver.set_pwm(a, b, c);
    }

    fn trip(&mut self, fault: Fault) {
        error!("fault latched, output disabled");
        self.driver.set_pwm(0.0, 0.0, 0.0);
        self.driver.disable();
        self.enabled = false;
        self.u_alpha = 0.0;
        self.u_beta = 0.0;
        self.fault = Some(fault);
    }

    /// Select the motion mode, resetting loop history so no stale
    /// integrator state carries across.
    pub fn set_mode(&mut self, mode: ControlMode) {
        if mode == self.mode {
            return;
        }
        info!("control mode: {}", mode);
        self.mode = mode;
        self.pid_current_d.reset();
        self.pid_current_q.reset();
        self.pid_velocity.reset();
        self.pid_angle.reset();
        self.openloop.reset(&self.clock);
    }

    /// Re-arm the power stage. Refused while a fault is latched.
    pub fn enable(&mut self) {
        if self.fault.is_some() {
            warning!("enable refused: fault latched");
            return;
        }
        self.driver.enable();
        self.enabled = true;
    }

    /// Zero the outputs and disable the power stage.
    pub fn disable(&mut self) {
        self.driver.set_pwm(0.0, 0.0, 0.0);
        self.driver.disable();
        self.u_alpha = 0.0;
        self.u_beta = 0.0;
        self.enabled = false;
    }

    /// Clear a latched fault and restart the injection bookkeeping.
    /// The power stage stays disabled until `enable` is called.
    pub fn clear_fault(&mut self) {
        self.fault = None;
        self.hfi.reset();
        self.pid_current_d.reset();
        self.pid_current_q.reset();
    }

    #[inline]
    pub fn fault(&self) -> Option<Fault> {
        self.fault
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    #[inline]
    pub fn is_calibrated(&self) -> bool {
        self.calibrated
    }

    #[inline]
    pub fn mode(&self) -> ControlMode {
        self.mode
    }

    #[inline]
    pub fn target(&self) -> f32 {
        self.target
    }

    /// Electrical angle feeding the loops, `[0, 2π)`.
    #[inline]
    pub fn electrical_angle(&self) -> f32 {
        self.electrical_angle
    }

    /// Accumulated shaft angle [rad], multi-turn.
    #[inline]
    pub fn shaft_angle(&self) -> f32 {
        self.shaft_angle
    }

    /// Shaft velocity estimate [rad/s].
    #[inline]
    pub fn shaft_velocity(&self) -> f32 {
        self.shaft_velocity
    }

    /// Last measured dq current.
    #[inline]
    pub fn current(&self) -> DqCurrent {
        self.current_meas
    }

    /// Current setpoint produced by the outer loop.
    #[inline]
    pub fn current_setpoint(&self) -> DqCurrent {
        self.current_setpoint
    }

    /// Shaft angle at which the absolute index fired, when searched.
    #[inline]
    pub fn index_offset(&self) -> Option<f32> {
        self.index_offset
    }

    /// Whether the flux observer (rather than HFI) fed the last tick.
    #[inline]
    pub fn used_flux_observer(&self) -> bool {
        self.blend.used_flux_observer()
    }

    /// Completed electrical revolutions counted by the HFI estimator.
    #[inline]
    pub fn electrical_turns(&self) -> i32 {
        self.hfi.full_turns()
    }
}

impl<D, C, K> HfiMotor<D, C, crate::interface::NoSensor, K>
where
    D: PhaseDriver,
    C: CurrentSensor,
    K: MonotonicClock,
{
    /// Sensorless motor: angle comes from the HFI/flux-observer blend.
    pub fn sensorless(
        driver: D,
        current_sense: C,
        clock: K,
        config: MotorConfig,
    ) -> Result<Self, crate::config::ConfigError> {
        Self::build(driver, current_sense, None, clock, config)
    }
}

fn inverse_clarke_phases(u_alpha: f32, u_beta: f32, voltage_limit: f32) -> (f32, f32, f32) {
    let (a, b, c) = crate::foc::transforms::inverse_clarke(u_alpha, u_beta);
    center_phases(a, b, c, voltage_limit)
}

// Alignment/calibration state machine.
//
// One-shot sequential procedure executed by `init_foc` to make the
// angle, current and voltage reference frames mutually consistent:
// sensor alignment, current-sense alignment, absolute-zero search and
// saliency polarity detection. Each stage is bounded in ticks and a
// failure aborts the remaining stages with a code naming the stage.

use core::f32::consts::{PI, TAU};

use libm::fabsf;

use crate::config::MotorConfig;
use crate::fmt::*;
use crate::foc::transforms::{angular_distance, normalize_angle};
use crate::foc::FocError;
use crate::interface::{DqCurrent, PhaseCurrents};

/// Ticks to wait for mechanical settling after forcing a vector.
const SETTLE_TICKS: u32 = 300;
/// Ticks for the one-electrical-revolution direction sweep.
const SWEEP_TICKS: u32 = 3000;
/// Ticks each phase is energized during current-sense alignment.
const CURRENT_SETTLE_TICKS: u32 = 200;
/// Ticks per polarity probe pulse.
const POLARITY_PULSE_TICKS: u32 = 8;
/// Leading pulse ticks ignored while the current settles; the sampled
/// current always lags the commanded voltage by at least one tick.
const POLARITY_SKIP_TICKS: u32 = 2;
/// Electrical angle step per tick during the index search.
const ZERO_SEARCH_STEP: f32 = 0.002;
/// Dominant phase current must exceed the off phases by this factor.
const CURRENT_SENSE_MIN_RATIO: f32 = 1.5;
/// Minimum dominant phase current for the correlation to count [A].
const CURRENT_SENSE_MIN_CURRENT: f32 = 0.05;
/// Minimum combined polarity ripple response [A].
const MIN_POLARITY_RESPONSE: f32 = 1e-3;

/// Alignment stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
enum Stage {
    Init,
    SensorSettle,
    SensorSweep,
    SensorZero,
    CurrentPhaseA,
    CurrentPhaseB,
    ZeroSearch,
    PolarityPos,
    PolarityNeg,
    Completed,
}

/// Calibration constants produced by a successful alignment.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AlignmentResult {
    /// Electrical angle of the sensor zero [rad].
    pub zero_electric_angle: f32,
    /// Sensor counting direction relative to the drive (+1 / -1).
    pub sensor_direction: f32,
    /// Saliency polarity sign (+1 / -1).
    pub polarity_correction: f32,
    /// Shaft angle at which the index event fired, when searched.
    pub index_offset: Option<f32>,
}

/// Voltage command the state machine wants applied this tick.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlignmentDrive {
    pub uq: f32,
    pub ud: f32,
    pub angle_el: f32,
}

pub struct Alignment {
    stage: Stage,
    /// Tick counter within the current stage
    tick: u32,
    pole_pairs: f32,
    align_voltage: f32,
    polarity_voltage: f32,
    polarity_cycles: u32,
    run_polarity: bool,
    has_sensor: bool,
    has_index: bool,

    // sensor alignment
    sweep_angle: f32,
    sensor_prev: f32,
    movement_sum: f32,
    direction: f32,
    zero_electric_angle: f32,

    // absolute zero search
    search_angle: f32,
    index_offset: Option<f32>,

    // polarity probe
    polarity_counter: u32,
    polarity_max_pos: f32,
    polarity_max_neg: f32,
    polarity_correction: f32,

    outcome: Option<Result<AlignmentResult, FocError>>,
}

impl Alignment {
    pub fn new(config: &MotorConfig, has_sensor: bool, has_index: bool) -> Self {
        Self {
            stage: Stage::Init,
            tick: 0,
            pole_pairs: config.pole_pairs as f32,
            align_voltage: config.sensor_align_voltage,
            polarity_voltage: config.polarity_alignment_voltage,
            polarity_cycles: config.polarity_cycles,
            run_polarity: config.start_polarity_alignment,
            has_sensor,
            has_index,
            sweep_angle: 0.0,
            sensor_prev: 0.0,
            movement_sum: 0.0,
            direction: 1.0,
            zero_electric_angle: 0.0,
            search_angle: 0.0,
            index_offset: None,
            polarity_counter: 0,
            polarity_max_pos: 0.0,
            polarity_max_neg: 0.0,
            polarity_correction: 1.0,
            outcome: None,
        }
    }

    /// Whether the procedure has finished (successfully or not).
    pub fn done(&self) -> bool {
        self.stage == Stage::Completed
    }

    /// Final outcome; `None` while still running.
    pub fn outcome(&self) -> Option<&Result<AlignmentResult, FocError>> {
        self.outcome.as_ref()
    }

    /// Upper bound on the ticks the whole procedure can take.
    pub fn budget(&self) -> u32 {
        let sensor = 2 * SETTLE_TICKS + SWEEP_TICKS;
        let current = 2 * CURRENT_SETTLE_TICKS;
        let search = (self.pole_pairs * TAU / ZERO_SEARCH_STEP) as u32 + 1;
        let polarity = self.polarity_cycles * 2 * POLARITY_PULSE_TICKS;
        sensor + current + search + polarity + 16
    }

    fn enter(&mut self, stage: Stage) {
        debug!("alignment stage: {}", stage);
        self.stage = stage;
        self.tick = 0;
    }

    fn fail(&mut self, error: FocError) {
        error!("alignment failed: {}", error);
        self.outcome = Some(Err(error));
        self.enter(Stage::Completed);
    }

    /// Stage following a completed sensor alignment (or Init when no
    /// sensor is linked).
    fn after_sensor(&mut self) {
        self.enter(Stage::CurrentPhaseA);
    }

    fn after_current_sense(&mut self) {
        if self.has_sensor && self.has_index {
            self.search_angle = 0.0;
            self.enter(Stage::ZeroSearch);
        } else {
            self.after_zero_search();
        }
    }

    fn after_zero_search(&mut self) {
        if self.run_polarity {
            self.polarity_counter = 0;
            self.polarity_max_pos = 0.0;
            self.polarity_max_neg = 0.0;
            self.enter(Stage::PolarityPos);
        } else {
            self.finish();
        }
    }

    fn finish(&mut self) {
        info!(
            "alignment complete: zero={} dir={} polarity={}",
            self.zero_electric_angle, self.direction, self.polarity_correction
        );
        self.outcome = Some(Ok(AlignmentResult {
            zero_electric_angle: self.zero_electric_angle,
            sensor_direction: self.direction,
            polarity_correction: self.polarity_correction,
            index_offset: self.index_offset,
        }));
        self.enter(Stage::Completed);
    }

    /// Advance the state machine by one control tick.
    ///
    /// # Arguments
    /// * `sensor_angle` - shaft angle when a sensor is linked [rad]
    /// * `index_active` - absolute-index event seen this tick
    /// * `currents` - raw phase currents
    /// * `current_dq` - currents in the commanded rotating frame
    ///
    /// # Returns
    /// Voltage command to apply for this tick.
    pub fn update(
        &mut self,
        sensor_angle: Option<f32>,
        index_active: bool,
        currents: PhaseCurrents,
        current_dq: DqCurrent,
    ) -> AlignmentDrive {
        match self.stage {
            Stage::Init => {
                info!("starting alignment");
                if self.has_sensor {
                    self.enter(Stage::SensorSettle);
                } else {
                    self.after_sensor();
                }
                AlignmentDrive::default()
            }

            Stage::SensorSettle => {
                self.tick += 1;
                if self.tick >= SETTLE_TICKS {
                    match sensor_angle {
                        Some(angle) => {
                            self.sensor_prev = angle;
                            self.movement_sum = 0.0;
                            self.sweep_angle = 1.5 * PI;
                            self.enter(Stage::SensorSweep);
                        }
                        None => self.fail(FocError::SensorAlign),
                    }
                }
                AlignmentDrive {
                    uq: 0.0,
                    ud: self.align_voltage,
                    angle_el: 1.5 * PI,
                }
            }

            Stage::SensorSweep => {
                self.tick += 1;
                if let Some(angle) = sensor_angle {
                    self.movement_sum += angular_distance(angle, self.sensor_prev);
                    self.sensor_prev = angle;
                }
                // one electrical revolution forward
                self.sweep_angle += TAU / SWEEP_TICKS as f32;
                if self.tick >= SWEEP_TICKS {
                    // the rotor follows one electrical revolution with
                    // 1/pole_pairs of a turn; accept half of that as
                    // proof of movement
                    let min_movement = 0.5 * TAU / self.pole_pairs;
                    if fabsf(self.movement_sum) < min_movement {
                        error!("sensor alignment: motor did not move");
                        self.fail(FocError::SensorAlign);
                    } else {
                        self.direction = if self.movement_sum >= 0.0 { 1.0 } else { -1.0 };
                        info!("sensor direction: {}", self.direction);
                        self.enter(Stage::SensorZero);
                    }
                }
                AlignmentDrive {
                    uq: 0.0,
                    ud: self.align_voltage,
                    angle_el: normalize_angle(self.sweep_angle),
                }
            }

            Stage::SensorZero => {
                self.tick += 1;
                if self.tick >= SETTLE_TICKS {
                    match sensor_angle {
                        Some(angle) => {
                            // electrical zero offset of the settled rotor
                            self.zero_electric_angle =
                                normalize_angle(self.direction * self.pole_pairs * angle);
                            info!("zero electrical angle: {}", self.zero_electric_angle);
                            self.after_sensor();
                        }
                        None => self.fail(FocError::SensorAlign),
                    }
                }
                AlignmentDrive {
                    uq: 0.0,
                    ud: self.align_voltage,
                    angle_el: 1.5 * PI,
                }
            }

            Stage::CurrentPhaseA => {
                self.tick += 1;
                if self.tick >= CURRENT_SETTLE_TICKS {
                    // current driven along the phase-a axis: a must
                    // dominate and read positive
                    let off = fabsf(currents.b).max(fabsf(currents.c));
                    if currents.a > CURRENT_SENSE_MIN_CURRENT
                        && currents.a >= CURRENT_SENSE_MIN_RATIO * off
                    {
                        self.enter(Stage::CurrentPhaseB);
                    } else {
                        error!("current sense: phase A correlation failed");
                        self.fail(FocError::CurrentSenseAlign);
                    }
                }
                AlignmentDrive {
                    uq: 0.0,
                    ud: self.align_voltage,
                    angle_el: 0.0,
                }
            }

            Stage::CurrentPhaseB => {
                self.tick += 1;
                if self.tick >= CURRENT_SETTLE_TICKS {
                    let off = fabsf(currents.a).max(fabsf(currents.c));
                    if currents.b > CURRENT_SENSE_MIN_CURRENT
                        && currents.b >= CURRENT_SENSE_MIN_RATIO * off
                    {
                        info!("current sense aligned");
                        self.after_current_sense();
                    } else {
                        error!("current sense: phase B correlation failed");
                        self.fail(FocError::CurrentSenseAlign);
                    }
                }
                AlignmentDrive {
                    uq: 0.0,
                    ud: self.align_voltage,
                    // phase-b axis
                    angle_el: TAU / 3.0,
                }
            }

            Stage::ZeroSearch => {
                self.tick += 1;
                if index_active {
                    self.index_offset = sensor_angle;
                    info!("index found");
                    self.after_zero_search();
                } else if self.search_angle >= self.pole_pairs * TAU {
                    // one full mechanical revolution without an index
                    error!("absolute zero search timed out");
                    self.fail(FocError::ZeroSearch);
                } else {
                    self.search_angle += ZERO_SEARCH_STEP;
                }
                AlignmentDrive {
                    uq: 0.0,
                    ud: self.align_voltage,
                    angle_el: normalize_angle(self.search_angle),
                }
            }

            Stage::PolarityPos => {
                self.tick += 1;
                if self.tick > POLARITY_SKIP_TICKS {
                    self.polarity_max_pos = self.polarity_max_pos.max(current_dq.d);
                }
                if self.tick >= POLARITY_PULSE_TICKS {
                    self.enter(Stage::PolarityNeg);
                }
                AlignmentDrive {
                    uq: 0.0,
                    ud: self.polarity_voltage,
                    angle_el: 0.0,
                }
            }

            Stage::PolarityNeg => {
                self.tick += 1;
                if self.tick > POLARITY_SKIP_TICKS {
                    self.polarity_max_neg = self.polarity_max_neg.min(current_dq.d);
                }
                if self.tick >= POLARITY_PULSE_TICKS {
                    self.polarity_counter += 1;
                    if self.polarity_counter >= self.polarity_cycles {
                        let pos = self.polarity_max_pos;
                        let neg = -self.polarity_max_neg;
                        if pos + neg < MIN_POLARITY_RESPONSE {
                            error!("polarity probe: no ripple response");
                            self.fail(FocError::PolarityDetect);
                        } else {
                            // saturation boosts the half-cycle aligned
                            // with the magnet; its sign is the rotor
                            // polarity
                            self.polarity_correction = if pos >= neg { 1.0 } else { -1.0 };
                            info!(
                                "polarity: max_pos={} max_neg={} correction={}",
                                pos, -neg, self.polarity_correction
                            );
                            self.finish();
                        }
                    } else {
                        self.enter(Stage::PolarityPos);
                    }
                }
                AlignmentDrive {
                    uq: 0.0,
                    ud: -self.polarity_voltage,
                    angle_el: 0.0,
                }
            }

            Stage::Completed => AlignmentDrive::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> MotorConfig {
        let mut config = MotorConfig::new(7);
        config.polarity_cycles = 4;
        config
    }

    /// Drives the state machine with a rotor model that follows the
    /// commanded vector and ideal current sensing.
    struct SimRig {
        /// Unwrapped commanded electrical angle the rotor tracks
        elec_unwrapped: f32,
        elec_prev: f32,
        /// Shaft angle the rotor settles at for the commanded field
        shaft_angle: f32,
        sensor_direction: f32,
        /// d-current gain on positive vs negative polarity pulses
        pos_gain: f32,
        neg_gain: f32,
        index_at: Option<f32>,
    }

    impl SimRig {
        fn ideal() -> Self {
            Self {
                elec_unwrapped: 0.0,
                elec_prev: 0.0,
                shaft_angle: 0.0,
                sensor_direction: 1.0,
                pos_gain: 1.2,
                neg_gain: 1.0,
                index_at: None,
            }
        }

        fn step(&mut self, alignment: &mut Alignment, drive: &AlignmentDrive) -> AlignmentDrive {
            // rotor follows the commanded electrical angle continuously
            if drive.ud > 0.0 {
                self.elec_unwrapped += angular_distance(drive.angle_el, self.elec_prev);
                self.elec_prev = drive.angle_el;
                self.shaft_angle = self.elec_unwrapped / 7.0;
            }
            let sensor = Some(normalize_angle(self.sensor_direction * self.shaft_angle));

            // phase currents proportional to the commanded vector
            let (ia, ib, ic) = crate::foc::transforms::inverse_clarke(
                libm::cosf(drive.angle_el) * drive.ud,
                libm::sinf(drive.angle_el) * drive.ud,
            );
            let currents = PhaseCurrents { a: ia, b: ib, c: ic };

            // polarity ripple: saturation boost on one pulse sign
            let d = if drive.ud > 0.0 {
                self.pos_gain * drive.ud
            } else {
                self.neg_gain * drive.ud
            };
            let dq = DqCurrent { d, q: 0.0 };

            let index = match self.index_at {
                Some(at) => fabsf(angular_distance(self.shaft_angle, at)) < 0.01,
                None => false,
            };

            alignment.update(sensor, index, currents, dq)
        }
    }

    fn run(alignment: &mut Alignment, rig: &mut SimRig) {
        let mut drive = AlignmentDrive::default();
        for _ in 0..alignment.budget() {
            drive = rig.step(alignment, &drive);
            if alignment.done() {
                return;
            }
        }
        panic!("alignment exceeded its tick budget");
    }

    #[test]
    fn test_ideal_rig_aligns() {
        let mut alignment = Alignment::new(&config(), true, false);
        let mut rig = SimRig::ideal();
        run(&mut alignment, &mut rig);

        let result = alignment.outcome().unwrap().as_ref().unwrap();
        assert_eq!(result.sensor_direction, 1.0);
        assert_eq!(result.polarity_correction, 1.0);
        // rotor settled at electrical 3π/2: that is the zero offset
        let expected = normalize_angle(1.5 * PI);
        assert!(fabsf(angular_distance(result.zero_electric_angle, expected)) < 0.05);
    }

    #[test]
    fn test_reversed_sensor_detected() {
        let mut alignment = Alignment::new(&config(), true, false);
        let mut rig = SimRig::ideal();
        rig.sensor_direction = -1.0;
        run(&mut alignment, &mut rig);

        let result = alignment.outcome().unwrap().as_ref().unwrap();
        assert_eq!(result.sensor_direction, -1.0);
    }

    #[test]
    fn test_stuck_rotor_fails_sensor_stage() {
        let mut alignment = Alignment::new(&config(), true, false);
        for _ in 0..alignment.budget() {
            // sensor frozen at zero, currents fine
            alignment.update(
                Some(0.0),
                false,
                PhaseCurrents { a: 1.0, b: -0.5, c: -0.5 },
                DqCurrent::ZERO,
            );
            if alignment.done() {
                break;
            }
        }
        assert_eq!(
            alignment.outcome().unwrap().unwrap_err(),
            FocError::SensorAlign
        );
    }

    #[test]
    fn test_dead_current_sense_fails() {
        // sensorless rig: no sensor stages, first gate is current sense
        let mut alignment = Alignment::new(&config(), false, false);
        for _ in 0..alignment.budget() {
            alignment.update(None, false, PhaseCurrents::default(), DqCurrent::ZERO);
            if alignment.done() {
                break;
            }
        }
        assert_eq!(
            alignment.outcome().unwrap().unwrap_err(),
            FocError::CurrentSenseAlign
        );
    }

    #[test]
    fn test_reversed_polarity_detected() {
        let mut alignment = Alignment::new(&config(), false, false);
        let mut rig = SimRig::ideal();
        // magnet flipped: negative pulses saturate instead
        rig.pos_gain = 1.0;
        rig.neg_gain = 1.2;
        run(&mut alignment, &mut rig);

        let result = alignment.outcome().unwrap().as_ref().unwrap();
        assert_eq!(result.polarity_correction, -1.0);
    }

    #[test]
    fn test_index_search_success_and_timeout() {
        let mut cfg = config();
        cfg.start_polarity_alignment = false;

        let mut alignment = Alignment::new(&cfg, true, true);
        let mut rig = SimRig::ideal();
        rig.index_at = Some(0.3);
        run(&mut alignment, &mut rig);
        let result = alignment.outcome().unwrap().as_ref().unwrap();
        assert!(result.index_offset.is_some());

        // no index ever fires: bounded timeout failure
        let mut alignment = Alignment::new(&cfg, true, true);
        let mut rig = SimRig::ideal();
        rig.index_at = None;
        run(&mut alignment, &mut rig);
        assert_eq!(
            alignment.outcome().unwrap().unwrap_err(),
            FocError::ZeroSearch
        );
    }

    #[test]
    fn test_polarity_can_be_skipped() {
        let mut cfg = config();
        cfg.start_polarity_alignment = false;
        let mut alignment = Alignment::new(&cfg, false, false);
        let mut rig = SimRig::ideal();
        run(&mut alignment, &mut rig);
        assert!(alignment.outcome().unwrap().is_ok());
    }
}

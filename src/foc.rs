// FOC (Field Oriented Control) core modules.
//
// Sensorless angle estimation (HFI + flux observer), coordinate
// transforms, the generic PID compensator, the alignment state machine
// and the open-loop fallback generators.

pub mod calibration;
pub mod flux_observer;
pub mod hfi;
pub mod openloop;
pub mod pid;
pub mod transforms;

// Re-export main types for easier access
pub use calibration::{Alignment, AlignmentResult};
pub use flux_observer::{FluxObserver, SensorlessBlend};
pub use hfi::HfiEstimator;
pub use openloop::OpenLoop;
pub use pid::PidController;
pub use transforms::{inverse_park, limit_voltage, normalize_angle, phase_voltages};

/// Motion control mode selecting which outer loop `move_to` runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ControlMode {
    /// Closed-loop q-axis current (torque) control.
    Torque,
    /// Closed-loop velocity control.
    Velocity,
    /// Closed-loop angle control.
    Angle,
    /// Open-loop velocity ramp, no feedback.
    VelocityOpenloop,
    /// Open-loop angle ramp, no feedback.
    AngleOpenloop,
}

/// Runtime safety fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Fault {
    /// HFI ripple exceeded the over-current protection limit for more
    /// than the configured number of consecutive injection periods.
    OverCurrent,
}

/// Initialization / runtime failure of the FOC pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FocError {
    /// Sensor alignment stage did not detect motor movement.
    SensorAlign,
    /// Current-sense alignment correlation below the confidence
    /// threshold.
    CurrentSenseAlign,
    /// Absolute-zero index search timed out.
    ZeroSearch,
    /// Polarity probe saw no usable ripple asymmetry.
    PolarityDetect,
    /// Closed-loop operation requested before a successful calibration.
    NotCalibrated,
    /// Configuration rejected while resolving derived gains.
    Config(crate::config::ConfigError),
    /// A latched safety fault; output is disabled.
    Fault(Fault),
}

impl From<crate::config::ConfigError> for FocError {
    fn from(e: crate::config::ConfigError) -> Self {
        FocError::Config(e)
    }
}

impl From<Fault> for FocError {
    fn from(f: Fault) -> Self {
        FocError::Fault(f)
    }
}

// Sensorless FOC core for three-phase permanent-magnet motors.
//
// Rotor angle is estimated without a position sensor by combining
// high-frequency injection (HFI) saliency sensing at low speed with a
// back-EMF flux observer at higher speed. Hardware access goes through
// the collaborator traits in `interface`; nothing in this crate touches
// peripherals directly.

#![cfg_attr(not(test), no_std)]

mod fmt;

pub mod config;
pub mod foc;
pub mod interface;
pub mod motor;

pub use config::{ConfigError, DerivedGains, MotorConfig};
pub use foc::{ControlMode, Fault, FocError};
pub use interface::{
    AngleSensor, CurrentSensor, DqCurrent, MonotonicClock, NoSensor, PhaseCurrents, PhaseDriver,
};
pub use motor::HfiMotor;

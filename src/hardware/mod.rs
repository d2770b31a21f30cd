//! Hardware actuation backends.
//!
//! [`HardwareController`] is the capability seam between the agent's
//! command dispatch and the physical train: every backend implements the
//! same four operations, and the agent never learns which one it holds.
//! Backend selection happens exactly once, in [`build_controller`], keyed
//! on the assigned hardware type.

pub mod dc_motor;
pub mod generic;
pub mod pwm;
pub mod simulator;
pub mod stepper;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use log::info;

use crate::config::HardwareType;

/// Unified interface to the train's drive hardware.
///
/// All operations are safe to call redundantly: stopping a stopped train,
/// starting a started one, or cleaning up twice must succeed without side
/// effects. Implementations own their I/O errors; callers only see
/// `Result`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HardwareController: Send + Sync + core::fmt::Debug {
    /// Starts the train at the given speed in percent.
    async fn start(&self, speed: u8) -> Result<()>;

    /// Brings the train to a stop.
    async fn stop(&self) -> Result<()>;

    /// Adjusts the speed of a running train.
    async fn set_speed(&self, speed: u8) -> Result<()>;

    /// Releases hardware resources and leaves outputs in a safe state.
    /// Called once at shutdown; must tolerate being called again.
    async fn cleanup(&self) -> Result<()>;
}

/// Constructs the backend for the assigned hardware type.
///
/// `force_simulator` overrides the assignment for bench runs without a
/// HAT attached. An assignment without a hardware type also falls back to
/// the simulator rather than guessing at attached hardware.
pub fn build_controller(
    hardware_type: Option<HardwareType>,
    force_simulator: bool,
) -> Result<Arc<dyn HardwareController>> {
    let selected = if force_simulator {
        HardwareType::Simulator
    } else {
        hardware_type.unwrap_or(HardwareType::Simulator)
    };

    info!("Initializing hardware backend: {selected}");
    let controller: Arc<dyn HardwareController> = match selected {
        HardwareType::DcMotorHat => Arc::new(dc_motor::DcMotorHatController::new()?),
        HardwareType::StepperHat => Arc::new(stepper::StepperHatController::new()?),
        HardwareType::Generic => Arc::new(generic::GenericController::new()?),
        HardwareType::Simulator => Arc::new(simulator::SimulatorController::new()),
    };

    Ok(controller)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulator_override_wins_over_assignment() {
        let controller = build_controller(Some(HardwareType::DcMotorHat), true).unwrap();
        assert!(format!("{controller:?}").contains("Simulator"));
    }

    #[test]
    fn missing_hardware_type_falls_back_to_simulator() {
        let controller = build_controller(None, false).unwrap();
        assert!(format!("{controller:?}").contains("Simulator"));
    }
}

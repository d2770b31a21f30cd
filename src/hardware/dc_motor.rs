//! DC motor HAT backend.
//!
//! Each motor port on the HAT is wired to three PCA9685 channels: a PWM
//! channel for speed and two direction inputs feeding the H-bridge.
//! Trains run forward only; reverse wiring exists on the board but the
//! agent never drives it.

use std::sync::Arc;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use log::info;

use super::HardwareController;
use super::pwm::{DC_MOTOR_HAT_ADDR, I2C_BUS, PWM_FREQUENCY_HZ, Pca9685, duty_from_percent};

/// Motor port used when the HAT drives a single train.
pub const DEFAULT_MOTOR_PORT: u8 = 1;

/// PCA9685 channels behind one motor port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MotorChannels {
    pub pwm: u8,
    pub in2: u8,
    pub in1: u8,
}

/// Channel wiring of the four motor ports.
pub fn motor_channels(port: u8) -> Option<MotorChannels> {
    let (pwm, in2, in1) = match port {
        1 => (8, 9, 10),
        2 => (13, 12, 11),
        3 => (2, 3, 4),
        4 => (7, 6, 5),
        _ => return None,
    };
    Some(MotorChannels { pwm, in2, in1 })
}

#[derive(Debug)]
pub struct DcMotorHatController {
    bus: Arc<Pca9685>,
    channels: MotorChannels,
}

impl DcMotorHatController {
    pub fn new() -> Result<Self> {
        let bus = Arc::new(Pca9685::new(I2C_BUS, DC_MOTOR_HAT_ADDR, PWM_FREQUENCY_HZ)?);
        Self::with_bus(bus, DEFAULT_MOTOR_PORT)
    }

    /// Attaches to a motor port on an already-open bus.
    pub fn with_bus(bus: Arc<Pca9685>, port: u8) -> Result<Self> {
        let channels = motor_channels(port).ok_or_else(|| anyhow!("no motor port {port}"))?;
        Ok(Self { bus, channels })
    }

    // IN1 high, IN2 low drives the bridge forward.
    fn engage_forward(&self) -> Result<()> {
        self.bus.set_pin(self.channels.in2, false)?;
        self.bus.set_pin(self.channels.in1, true)
    }

    fn release(&self) -> Result<()> {
        self.bus.set_pin(self.channels.in1, false)?;
        self.bus.set_pin(self.channels.in2, false)
    }
}

#[async_trait]
impl HardwareController for DcMotorHatController {
    async fn start(&self, speed: u8) -> Result<()> {
        info!("DC motor start at {speed}%");
        self.engage_forward()?;
        self.bus.set_duty(self.channels.pwm, duty_from_percent(speed))
    }

    async fn stop(&self) -> Result<()> {
        info!("DC motor stop");
        self.bus.set_duty(self.channels.pwm, 0)?;
        self.release()
    }

    async fn set_speed(&self, speed: u8) -> Result<()> {
        info!("DC motor speed -> {speed}%");
        self.bus.set_duty(self.channels.pwm, duty_from_percent(speed))
    }

    async fn cleanup(&self) -> Result<()> {
        info!("DC motor cleanup");
        self.release()?;
        self.bus.all_off()
    }
}

//! Generic GPIO backend: software PWM on a single motor-driver pin.
//!
//! The fallback for rigs without a HAT, where a bare transistor or driver
//! board hangs off one GPIO line and speed is just PWM duty.

use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::info;
use rppal::gpio::{Gpio, OutputPin};

use super::HardwareController;

/// BCM pin driving the motor.
pub const MOTOR_PIN: u8 = 18;
pub const PWM_FREQUENCY_HZ: f64 = 100.0;

/// 0-100 speed as a 0.0-1.0 duty cycle.
pub fn duty_cycle(speed: u8) -> f64 {
    f64::from(speed.min(100)) / 100.0
}

#[derive(Debug)]
pub struct GenericController {
    pin: Mutex<OutputPin>,
}

impl GenericController {
    pub fn new() -> Result<Self> {
        let pin = Gpio::new()
            .context("opening GPIO")?
            .get(MOTOR_PIN)
            .with_context(|| format!("claiming GPIO pin {MOTOR_PIN}"))?
            .into_output_low();

        Ok(Self {
            pin: Mutex::new(pin),
        })
    }

    fn apply_duty(&self, speed: u8) -> Result<()> {
        self.pin
            .lock()
            .expect("motor pin lock poisoned")
            .set_pwm_frequency(PWM_FREQUENCY_HZ, duty_cycle(speed))
            .context("setting PWM duty")
    }

    fn idle(&self) -> Result<()> {
        let mut pin = self.pin.lock().expect("motor pin lock poisoned");
        pin.clear_pwm().context("clearing PWM")?;
        pin.set_low();
        Ok(())
    }
}

#[async_trait]
impl HardwareController for GenericController {
    async fn start(&self, speed: u8) -> Result<()> {
        info!("Generic motor start at {speed}%");
        self.apply_duty(speed)
    }

    async fn stop(&self) -> Result<()> {
        info!("Generic motor stop");
        self.idle()
    }

    async fn set_speed(&self, speed: u8) -> Result<()> {
        info!("Generic motor speed -> {speed}%");
        self.apply_duty(speed)
    }

    async fn cleanup(&self) -> Result<()> {
        info!("Generic motor cleanup");
        self.idle()
    }
}

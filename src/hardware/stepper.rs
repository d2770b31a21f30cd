//! Stepper HAT backend for a DRV8825 driver on GPIO.
//!
//! Speed maps to step-pulse timing: faster trains get shorter delays
//! between edges, floored at 1 ms so the driver never sees pulses it
//! cannot follow. The pulse train itself runs on a dedicated blocking
//! task because its timing is busy-wait territory the async runtime must
//! not be involved in.

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU8, Ordering},
    },
    thread,
    time::Duration,
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::info;
use rppal::gpio::{Gpio, OutputPin};

use super::HardwareController;

/// BCM pin assignments on the stepper HAT.
pub const DIR_PIN: u8 = 13;
pub const STEP_PIN: u8 = 19;
/// Active-low driver enable.
pub const ENABLE_PIN: u8 = 12;
pub const MODE_PINS: [u8; 3] = [16, 17, 20];

/// DRV8825 microstep resolutions, keyed by the M0/M1/M2 mode pins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MicrostepMode {
    #[default]
    Full,
    Half,
    Quarter,
    Eighth,
    Sixteenth,
    ThirtySecond,
}

impl MicrostepMode {
    /// Logic levels for the M0, M1, M2 pins.
    pub fn pin_levels(self) -> [bool; 3] {
        match self {
            Self::Full => [false, false, false],
            Self::Half => [true, false, false],
            Self::Quarter => [false, true, false],
            Self::Eighth => [true, true, false],
            Self::Sixteenth => [false, false, true],
            Self::ThirtySecond => [true, false, true],
        }
    }
}

/// Delay between step edges for a 0-100 speed: 20 ms at standstill pace,
/// shrinking linearly, never below 1 ms.
pub fn step_delay(speed: u8) -> Duration {
    let micros = (20_000i64 - 200 * i64::from(speed)).max(1_000);
    Duration::from_micros(micros as u64)
}

#[derive(Debug, Default)]
struct DriveState {
    running: AtomicBool,
    shutdown: AtomicBool,
    speed: AtomicU8,
}

#[derive(Debug)]
pub struct StepperHatController {
    dir: Mutex<OutputPin>,
    enable: Mutex<OutputPin>,
    // Taken by the pulse task on first start.
    step: Mutex<Option<OutputPin>>,
    mode: Mutex<[OutputPin; 3]>,
    drive: Arc<DriveState>,
}

impl StepperHatController {
    pub fn new() -> Result<Self> {
        Self::with_mode(MicrostepMode::Full)
    }

    pub fn with_mode(microstep: MicrostepMode) -> Result<Self> {
        let gpio = Gpio::new().context("opening GPIO")?;

        let take_output = |pin: u8| -> Result<OutputPin> {
            Ok(gpio
                .get(pin)
                .with_context(|| format!("claiming GPIO pin {pin}"))?
                .into_output())
        };

        let dir = take_output(DIR_PIN)?;
        let mut step = take_output(STEP_PIN)?;
        let mut enable = take_output(ENABLE_PIN)?;
        let mut mode = [
            take_output(MODE_PINS[0])?,
            take_output(MODE_PINS[1])?,
            take_output(MODE_PINS[2])?,
        ];

        // Driver disabled (enable is active-low) until the first start.
        enable.set_high();
        step.set_low();
        for (pin, high) in mode.iter_mut().zip(microstep.pin_levels()) {
            if high {
                pin.set_high();
            } else {
                pin.set_low();
            }
        }

        Ok(Self {
            dir: Mutex::new(dir),
            enable: Mutex::new(enable),
            step: Mutex::new(Some(step)),
            mode: Mutex::new(mode),
            drive: Arc::new(DriveState::default()),
        })
    }

    fn spawn_pulse_task(&self) {
        let Some(mut step) = self.step.lock().expect("step pin lock poisoned").take() else {
            return; // already running
        };

        let drive = Arc::clone(&self.drive);
        tokio::task::spawn_blocking(move || {
            while !drive.shutdown.load(Ordering::Relaxed) {
                if drive.running.load(Ordering::Relaxed) {
                    let delay = step_delay(drive.speed.load(Ordering::Relaxed));
                    step.set_high();
                    thread::sleep(delay);
                    step.set_low();
                    thread::sleep(delay);
                } else {
                    thread::sleep(Duration::from_millis(10));
                }
            }
            step.set_low();
        });
    }
}

#[async_trait]
impl HardwareController for StepperHatController {
    async fn start(&self, speed: u8) -> Result<()> {
        info!("Stepper start at {speed}%");
        self.drive.speed.store(speed, Ordering::Relaxed);
        self.dir.lock().expect("dir pin lock poisoned").set_high();
        self.enable
            .lock()
            .expect("enable pin lock poisoned")
            .set_low();
        self.drive.running.store(true, Ordering::Relaxed);
        self.spawn_pulse_task();
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        info!("Stepper stop");
        self.drive.running.store(false, Ordering::Relaxed);
        self.enable
            .lock()
            .expect("enable pin lock poisoned")
            .set_high();
        Ok(())
    }

    async fn set_speed(&self, speed: u8) -> Result<()> {
        info!("Stepper speed -> {speed}%");
        self.drive.speed.store(speed, Ordering::Relaxed);
        Ok(())
    }

    async fn cleanup(&self) -> Result<()> {
        info!("Stepper cleanup");
        self.drive.running.store(false, Ordering::Relaxed);
        self.drive.shutdown.store(true, Ordering::Relaxed);
        self.enable
            .lock()
            .expect("enable pin lock poisoned")
            .set_high();
        self.dir.lock().expect("dir pin lock poisoned").set_low();
        for pin in self.mode.lock().expect("mode pin lock poisoned").iter_mut() {
            pin.set_low();
        }
        Ok(())
    }
}

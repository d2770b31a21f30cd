//! PCA9685 16-channel 12-bit PWM expander over I2C.
//!
//! This is the chip on the DC motor HAT. One [`Pca9685`] instance owns the
//! bus handle; backends share it through an `Arc` handed out by the
//! factory, so the bus is opened exactly once per process.

use std::{sync::Mutex, thread, time::Duration};

use anyhow::{Context, Result};
use log::{debug, warn};
use rppal::i2c::I2c;

pub const I2C_BUS: u8 = 1;
pub const DC_MOTOR_HAT_ADDR: u16 = 0x6F;
pub const PWM_FREQUENCY_HZ: f64 = 1600.0;

/// 12-bit counter: duty values run 0..=4095.
pub const FULL_SCALE: u16 = 4095;

const MODE1: u8 = 0x00;
const MODE2: u8 = 0x01;
const PRESCALE: u8 = 0xFE;
const LED0_ON_L: u8 = 0x06;
const ALL_LED_ON_L: u8 = 0xFA;

const MODE1_RESTART: u8 = 0x80;
const MODE1_SLEEP: u8 = 0x10;
const MODE1_ALLCALL: u8 = 0x01;
const MODE2_OUTDRV: u8 = 0x04;

const OSCILLATOR_HZ: f64 = 25_000_000.0;

/// Prescale register value for a target PWM frequency.
pub fn prescale_for(frequency_hz: f64) -> u8 {
    let prescale = OSCILLATOR_HZ / (4096.0 * frequency_hz);
    (prescale.round() as u8).saturating_sub(1)
}

/// Maps a 0-100 speed percentage onto the 12-bit duty range.
pub fn duty_from_percent(speed: u8) -> u16 {
    (u32::from(speed.min(100)) * u32::from(FULL_SCALE) / 100) as u16
}

/// Shared handle to a PCA9685 on the I2C bus.
#[derive(Debug)]
pub struct Pca9685 {
    bus: Mutex<I2c>,
}

impl Pca9685 {
    /// Opens the bus, resets all outputs, and programs the PWM frequency.
    pub fn new(bus: u8, address: u16, frequency_hz: f64) -> Result<Self> {
        let mut i2c = I2c::with_bus(bus).with_context(|| format!("opening I2C bus {bus}"))?;
        i2c.set_slave_address(address)
            .with_context(|| format!("addressing PCA9685 at 0x{address:02X}"))?;

        // All outputs off before the oscillator wakes.
        for offset in 0..4 {
            write_register(&mut i2c, ALL_LED_ON_L + offset, 0)?;
        }
        write_register(&mut i2c, MODE2, MODE2_OUTDRV)?;
        write_register(&mut i2c, MODE1, MODE1_ALLCALL)?;
        thread::sleep(Duration::from_millis(5));

        let mode1 = read_register(&mut i2c, MODE1)?;
        write_register(&mut i2c, MODE1, mode1 & !MODE1_SLEEP)?;
        thread::sleep(Duration::from_millis(5));

        // Prescale is only writable while the oscillator sleeps.
        let prescale = prescale_for(frequency_hz);
        let mode1 = read_register(&mut i2c, MODE1)?;
        write_register(&mut i2c, MODE1, (mode1 & !MODE1_RESTART) | MODE1_SLEEP)?;
        write_register(&mut i2c, PRESCALE, prescale)?;
        write_register(&mut i2c, MODE1, mode1)?;
        thread::sleep(Duration::from_millis(5));
        write_register(&mut i2c, MODE1, mode1 | MODE1_RESTART)?;

        debug!("PCA9685 at 0x{address:02X} running at {frequency_hz} Hz (prescale {prescale})");
        Ok(Self {
            bus: Mutex::new(i2c),
        })
    }

    /// Programs the on/off counts for one channel.
    pub fn set_pwm(&self, channel: u8, on: u16, off: u16) -> Result<()> {
        let base = LED0_ON_L + 4 * channel;
        let mut i2c = self.bus.lock().expect("I2C bus lock poisoned");

        write_register(&mut i2c, base, (on & 0xFF) as u8)?;
        write_register(&mut i2c, base + 1, (on >> 8) as u8)?;
        write_register(&mut i2c, base + 2, (off & 0xFF) as u8)?;
        write_register(&mut i2c, base + 3, (off >> 8) as u8)?;
        Ok(())
    }

    /// Drives a channel as a digital pin: fully on or fully off, using the
    /// chip's dedicated full-on/full-off bits.
    pub fn set_pin(&self, channel: u8, high: bool) -> Result<()> {
        if high {
            self.set_pwm(channel, 4096, 0)
        } else {
            self.set_pwm(channel, 0, 4096)
        }
    }

    /// Sets a plain duty cycle (0..=4095) on a channel.
    pub fn set_duty(&self, channel: u8, duty: u16) -> Result<()> {
        self.set_pwm(channel, 0, duty.min(FULL_SCALE))
    }

    /// Forces every output off. Used during cleanup.
    pub fn all_off(&self) -> Result<()> {
        let mut i2c = self.bus.lock().expect("I2C bus lock poisoned");
        write_register(&mut i2c, ALL_LED_ON_L, 0)?;
        write_register(&mut i2c, ALL_LED_ON_L + 1, 0)?;
        write_register(&mut i2c, ALL_LED_ON_L + 2, 0)?;
        write_register(&mut i2c, ALL_LED_ON_L + 3, 0x10)?;
        Ok(())
    }
}

// Transient NAKs happen when the HAT supply sags under motor load; a
// single immediate retry rides them out.
fn write_register(i2c: &mut I2c, register: u8, value: u8) -> Result<()> {
    match i2c.smbus_write_byte(register, value) {
        Ok(()) => Ok(()),
        Err(e) => {
            warn!("I2C write to register 0x{register:02X} failed, retrying once: {e}");
            i2c.smbus_write_byte(register, value)
                .with_context(|| format!("writing PCA9685 register 0x{register:02X}"))
        }
    }
}

fn read_register(i2c: &mut I2c, register: u8) -> Result<u8> {
    match i2c.smbus_read_byte(register) {
        Ok(value) => Ok(value),
        Err(e) => {
            warn!("I2C read of register 0x{register:02X} failed, retrying once: {e}");
            i2c.smbus_read_byte(register)
                .with_context(|| format!("reading PCA9685 register 0x{register:02X}"))
        }
    }
}

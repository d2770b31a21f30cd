//! Simulator backend: no I/O, every call logged and recorded.
//!
//! Used for bench runs (`--simulator`), as the fallback when an
//! assignment names no hardware, and as the hardware double in agent
//! tests.

use std::sync::{
    Mutex,
    atomic::{AtomicBool, AtomicU8, Ordering},
};

use anyhow::Result;
use async_trait::async_trait;
use log::info;

use super::HardwareController;

/// One recorded hardware call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimulatedCall {
    Start { speed: u8 },
    Stop,
    SetSpeed { speed: u8 },
    Cleanup,
}

#[derive(Debug, Default)]
pub struct SimulatorController {
    speed: AtomicU8,
    running: AtomicBool,
    calls: Mutex<Vec<SimulatedCall>>,
}

impl SimulatorController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn speed(&self) -> u8 {
        self.speed.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Every call made so far, in order.
    pub fn calls(&self) -> Vec<SimulatedCall> {
        self.calls.lock().expect("call log lock poisoned").clone()
    }

    fn record(&self, call: SimulatedCall) {
        self.calls.lock().expect("call log lock poisoned").push(call);
    }
}

#[async_trait]
impl HardwareController for SimulatorController {
    async fn start(&self, speed: u8) -> Result<()> {
        info!("[sim] start at {speed}%");
        self.speed.store(speed, Ordering::Relaxed);
        self.running.store(true, Ordering::Relaxed);
        self.record(SimulatedCall::Start { speed });
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        info!("[sim] stop");
        self.speed.store(0, Ordering::Relaxed);
        self.running.store(false, Ordering::Relaxed);
        self.record(SimulatedCall::Stop);
        Ok(())
    }

    async fn set_speed(&self, speed: u8) -> Result<()> {
        info!("[sim] speed -> {speed}%");
        self.speed.store(speed, Ordering::Relaxed);
        self.record(SimulatedCall::SetSpeed { speed });
        Ok(())
    }

    async fn cleanup(&self) -> Result<()> {
        info!("[sim] cleanup");
        self.speed.store(0, Ordering::Relaxed);
        self.running.store(false, Ordering::Relaxed);
        self.record(SimulatedCall::Cleanup);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn records_calls_in_order() {
        let sim = SimulatorController::new();

        sim.start(40).await.unwrap();
        sim.set_speed(70).await.unwrap();
        sim.stop().await.unwrap();
        sim.cleanup().await.unwrap();

        assert_eq!(
            sim.calls(),
            vec![
                SimulatedCall::Start { speed: 40 },
                SimulatedCall::SetSpeed { speed: 70 },
                SimulatedCall::Stop,
                SimulatedCall::Cleanup,
            ]
        );
        assert_eq!(sim.speed(), 0);
        assert!(!sim.is_running());
    }

    #[tokio::test]
    async fn redundant_calls_are_harmless() {
        let sim = SimulatorController::new();

        sim.stop().await.unwrap();
        sim.stop().await.unwrap();
        sim.cleanup().await.unwrap();
        sim.cleanup().await.unwrap();

        assert!(!sim.is_running());
    }
}

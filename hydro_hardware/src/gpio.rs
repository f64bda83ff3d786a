//! Raspberry Pi GPIO output backend (Linux only, `hardware` feature).

use crate::error::HwError;
use hydro_traits::OutputBus;
use rppal::gpio::{Gpio, OutputPin};
use std::collections::HashMap;

/// Drives pump relay channels through BCM GPIO pins.
///
/// Every channel is claimed at construction and driven low, so a crash
/// before the first dose never leaves a relay energized.
pub struct GpioOutputs {
    pins: HashMap<u8, OutputPin>,
}

impl GpioOutputs {
    pub fn new(channels: &[u8]) -> Result<Self, HwError> {
        let gpio = Gpio::new().map_err(|e| HwError::Gpio(e.to_string()))?;
        let mut pins = HashMap::new();
        for &ch in channels {
            let mut pin = gpio
                .get(ch)
                .map_err(|e| HwError::Gpio(format!("claim pin {ch}: {e}")))?
                .into_output();
            pin.set_low();
            pins.insert(ch, pin);
        }
        tracing::info!(channels = ?channels, "gpio outputs claimed");
        Ok(Self { pins })
    }
}

impl OutputBus for GpioOutputs {
    fn set_output(
        &mut self,
        channel: u8,
        energized: bool,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let pin = self
            .pins
            .get_mut(&channel)
            .ok_or_else(|| HwError::Gpio(format!("unclaimed channel {channel}")))?;
        if energized {
            pin.set_high();
        } else {
            pin.set_low();
        }
        tracing::trace!(channel, energized, "gpio write");
        Ok(())
    }
}

impl Drop for GpioOutputs {
    fn drop(&mut self) {
        for (ch, pin) in self.pins.iter_mut() {
            pin.set_low();
            tracing::trace!(channel = ch, "gpio released low");
        }
    }
}

//! Dose event reporting.
//!
//! Sinks are fire-and-forget: a slow or broken sink must never delay or
//! fail a dosing decision, so the trait returns nothing and implementations
//! swallow their own errors.

use crate::sensors::SensorReading;
use hydro_config::PumpName;
use serde::Serialize;
use std::sync::Mutex;

/// A single confirmed chemical addition.
#[derive(Debug, Clone, Serialize)]
pub struct DoseEvent {
    pub pump: PumpName,
    pub volume_ml: f64,
    /// Human-readable trigger, e.g. "ph 5.62 below target 6.00".
    pub reason: String,
    /// Unix epoch milliseconds at dispatch.
    pub at_epoch_ms: u64,
    /// Sensor snapshot at the moment of the dose decision.
    pub reading: SensorReading,
}

pub trait EventSink: Send + Sync {
    fn dose_event(&self, event: &DoseEvent);
}

/// Default sink: structured log line per dose.
#[derive(Debug, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn dose_event(&self, event: &DoseEvent) {
        tracing::info!(
            pump = %event.pump,
            volume_ml = event.volume_ml,
            reason = %event.reason,
            ph = ?event.reading.ph,
            ec = ?event.reading.ec,
            "dose"
        );
    }
}

/// Buffering sink for tests and demos.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<DoseEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&self) -> Vec<DoseEvent> {
        match self.events.lock() {
            Ok(mut g) => std::mem::take(&mut *g),
            Err(p) => std::mem::take(&mut *p.into_inner()),
        }
    }

    pub fn len(&self) -> usize {
        match self.events.lock() {
            Ok(g) => g.len(),
            Err(p) => p.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EventSink for MemorySink {
    fn dose_event(&self, event: &DoseEvent) {
        if let Ok(mut g) = self.events.lock() {
            g.push(event.clone());
        }
    }
}

pub(crate) fn unix_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

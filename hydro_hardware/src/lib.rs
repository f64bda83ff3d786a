pub mod error;

#[cfg(feature = "hardware")]
pub mod gpio;

use error::HwError;
use hydro_traits::{OutputBus, SensorBus, SensorKind};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug)]
struct SimState {
    values: HashMap<SensorKind, f64>,
    offline: HashSet<SensorKind>,
    outputs: HashMap<u8, bool>,
    output_log: Vec<(u8, bool)>,
    fail_outputs: bool,
    fail_channels: HashSet<u8>,
    compensation_log: Vec<(SensorKind, f64)>,
}

impl Default for SimState {
    fn default() -> Self {
        let mut values = HashMap::new();
        values.insert(SensorKind::Ph, 6.0);
        values.insert(SensorKind::Ec, 1500.0);
        values.insert(SensorKind::Temperature, 21.0);
        Self {
            values,
            offline: HashSet::new(),
            outputs: HashMap::new(),
            output_log: Vec::new(),
            fail_outputs: false,
            fail_channels: HashSet::new(),
            compensation_log: Vec::new(),
        }
    }
}

/// In-memory backend: outputs are latched in a map, sensor payloads come
/// from scriptable values. Clones share state, so one instance can serve as
/// the OutputBus while another serves as the SensorBus.
#[derive(Clone)]
pub struct SimulatedBackend {
    state: Arc<Mutex<SimState>>,
}

impl Default for SimulatedBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedBackend {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState::default())),
        }
    }

    /// Scripting/inspection handle sharing this backend's state.
    pub fn handle(&self) -> SimHandle {
        SimHandle {
            state: self.state.clone(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimState> {
        // Sim state is test plumbing; a poisoned lock means a test already panicked.
        match self.state.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        }
    }
}

/// Test/demo handle to script sensor values and inspect output activity.
#[derive(Clone)]
pub struct SimHandle {
    state: Arc<Mutex<SimState>>,
}

impl SimHandle {
    fn lock(&self) -> std::sync::MutexGuard<'_, SimState> {
        match self.state.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        }
    }

    pub fn set_sensor(&self, kind: SensorKind, value: f64) {
        self.lock().values.insert(kind, value);
    }

    pub fn set_offline(&self, kind: SensorKind, offline: bool) {
        let mut st = self.lock();
        if offline {
            st.offline.insert(kind);
        } else {
            st.offline.remove(&kind);
        }
    }

    pub fn fail_outputs(&self, fail: bool) {
        self.lock().fail_outputs = fail;
    }

    /// Fail writes to one channel only (wiring-fault scenarios).
    pub fn fail_channel(&self, channel: u8, fail: bool) {
        let mut st = self.lock();
        if fail {
            st.fail_channels.insert(channel);
        } else {
            st.fail_channels.remove(&channel);
        }
    }

    pub fn output(&self, channel: u8) -> bool {
        self.lock().outputs.get(&channel).copied().unwrap_or(false)
    }

    pub fn output_log(&self) -> Vec<(u8, bool)> {
        self.lock().output_log.clone()
    }

    pub fn compensation_log(&self) -> Vec<(SensorKind, f64)> {
        self.lock().compensation_log.clone()
    }
}

impl OutputBus for SimulatedBackend {
    fn set_output(
        &mut self,
        channel: u8,
        energized: bool,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let mut st = self.lock();
        if st.fail_outputs || st.fail_channels.contains(&channel) {
            return Err(Box::new(HwError::Gpio(format!(
                "simulated write failure on channel {channel}"
            ))));
        }
        st.outputs.insert(channel, energized);
        st.output_log.push((channel, energized));
        tracing::debug!(channel, energized, "simulated output");
        Ok(())
    }
}

impl SensorBus for SimulatedBackend {
    fn query(
        &mut self,
        kind: SensorKind,
        _timeout: Duration,
    ) -> Result<String, Box<dyn std::error::Error + Send + Sync>> {
        let st = self.lock();
        if st.offline.contains(&kind) {
            return Err(Box::new(HwError::Offline(kind.as_str())));
        }
        let value = match kind {
            SensorKind::Tds => {
                // Sim probes report TDS as half the conductivity, like the
                // real EC probe's derived channel.
                st.values.get(&SensorKind::Ec).copied().unwrap_or(0.0) * 0.5
            }
            other => st.values.get(&other).copied().unwrap_or(0.0),
        };
        Ok(format!("{value:.3}"))
    }

    fn set_temp_compensation(
        &mut self,
        kind: SensorKind,
        celsius: f64,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.lock().compensation_log.push((kind, celsius));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulated_outputs_latch_and_log() {
        let mut backend = SimulatedBackend::new();
        let handle = backend.handle();
        backend.set_output(17, true).unwrap();
        backend.set_output(17, false).unwrap();
        assert!(!handle.output(17));
        assert_eq!(handle.output_log(), vec![(17, true), (17, false)]);
    }

    #[test]
    fn simulated_sensor_scripting() {
        let mut backend = SimulatedBackend::new();
        let handle = backend.handle();
        handle.set_sensor(SensorKind::Ph, 5.4);
        let payload = backend
            .query(SensorKind::Ph, Duration::from_millis(100))
            .unwrap();
        assert_eq!(payload, "5.400");

        handle.set_offline(SensorKind::Ec, true);
        assert!(
            backend
                .query(SensorKind::Ec, Duration::from_millis(100))
                .is_err()
        );
    }

    #[test]
    fn tds_tracks_half_of_ec() {
        let mut backend = SimulatedBackend::new();
        backend.handle().set_sensor(SensorKind::Ec, 2000.0);
        let payload = backend
            .query(SensorKind::Tds, Duration::from_millis(100))
            .unwrap();
        assert_eq!(payload, "1000.000");
    }
}

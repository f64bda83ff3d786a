//! Wires the components into one running system and exposes the public
//! operation surface the CLI (or any embedder) calls.

use crate::actuator::{ChannelCfg, PumpActuator, PumpSnapshot};
use crate::calibration::{CalPoint, CalibrationSink, CalibrationStore};
use crate::engine::{BranchOutcome, CycleReport, DilutionPlan, DoseRecord, DosingEngine, EngineCfg};
use crate::error::{DosingError, Result};
use crate::events::EventSink;
use crate::ledger::SafetyLedger;
use crate::sensors::{SensorCache, SensorReading};
use hydro_config::{default_pump_table, Config, PumpName};
use hydro_traits::{Clock, OutputBus, SensorBus, SensorKind};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Serialize)]
pub struct PumpUsage {
    pub pump: PumpName,
    pub used_24h_ml: f64,
    pub remaining_24h_ml: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemStatus {
    pub engine_state: &'static str,
    pub reading: SensorReading,
    pub pumps: Vec<PumpSnapshot>,
    pub usage: Vec<PumpUsage>,
    pub reservoir_liters: f64,
    pub target_ph: f64,
    pub target_ec: f64,
}

impl std::fmt::Debug for System {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("System").finish_non_exhaustive()
    }
}

pub struct System {
    sensors: Arc<SensorCache>,
    pumps: Arc<PumpActuator>,
    ledger: Arc<SafetyLedger>,
    calibration: Arc<CalibrationStore>,
    engine: DosingEngine,
}

impl System {
    /// Assemble the system from a validated config and hardware backends.
    ///
    /// Fails when a dosing pump is missing from the pump table; an empty
    /// table falls back to the factory wiring.
    pub fn new(
        cfg: &Config,
        outputs: Box<dyn OutputBus + Send>,
        sensor_bus: Box<dyn SensorBus + Send>,
        events: Arc<dyn EventSink>,
        cal_sink: Box<dyn CalibrationSink>,
        clock: Arc<dyn Clock + Send + Sync>,
    ) -> Result<Self> {
        cfg.validate()
            .map_err(|e| DosingError::ConfigInvalid(e.to_string()))?;

        let pump_table = if cfg.pumps.is_empty() {
            default_pump_table()
        } else {
            cfg.pumps.clone()
        };
        for pump in PumpName::DOSING {
            if !pump_table.iter().any(|p| p.id == pump) {
                return Err(DosingError::ConfigInvalid(format!(
                    "pump table is missing {pump}"
                )));
            }
        }

        let mut profile = cfg.effective_profile();
        if cfg.calibration.is_none() && cfg.pumps.is_empty() {
            // Fallback wiring: lift the factory flow rates.
            for p in &pump_table {
                if let Some(rate) = p.flow_rate_ml_per_sec {
                    profile.flow_rates_ml_per_sec.set(p.id, rate);
                }
            }
        }
        let calibration = Arc::new(CalibrationStore::new(profile, cal_sink));

        let sensors = Arc::new(SensorCache::new(
            sensor_bus,
            calibration.clone(),
            clock.clone(),
            Duration::from_millis(cfg.sensors.cache_ttl_ms),
            Duration::from_millis(cfg.sensors.read_timeout_ms),
        ));

        let channels: Vec<ChannelCfg> = pump_table.iter().map(ChannelCfg::from).collect();
        let pumps = Arc::new(PumpActuator::new(
            outputs,
            channels,
            calibration.clone(),
            clock.clone(),
        ));

        let ledger = Arc::new(SafetyLedger::new(cfg.safety.daily_caps_ml, clock.clone()));

        let reservoir = cfg.reservoir_volume_liters.unwrap_or(100.0);
        let engine = DosingEngine::new(
            EngineCfg::from(cfg),
            reservoir,
            sensors.clone(),
            pumps.clone(),
            ledger.clone(),
            events,
            clock,
        );

        Ok(Self {
            sensors,
            pumps,
            ledger,
            calibration,
            engine,
        })
    }

    /// Test hook: replace the engine's time-of-day source.
    pub fn with_minutes_now(mut self, f: crate::engine::MinutesNow) -> Self {
        self.engine = self.engine.with_minutes_now(f);
        self
    }

    pub fn run_cycle(&self) -> CycleReport {
        self.engine.run_cycle()
    }

    pub fn manual_dose(&self, pump: PumpName, volume_ml: f64) -> Result<DoseRecord> {
        self.engine.manual_dose(pump, volume_ml)
    }

    pub fn calculate_dilution(&self, added_water_liters: f64) -> Result<DilutionPlan> {
        self.engine.calculate_dilution(added_water_liters)
    }

    pub fn compensate_for_dilution(&self, added_water_liters: f64) -> Result<BranchOutcome> {
        self.engine.compensate_for_dilution(added_water_liters)
    }

    /// Apply a new configuration to the engine and ledger. The pump wiring
    /// and sensor cache TTL are fixed at startup.
    pub fn update_config(&self, cfg: &Config) -> Result<()> {
        cfg.validate()
            .map_err(|e| DosingError::ConfigInvalid(e.to_string()))?;
        self.engine.update_cfg(EngineCfg::from(cfg));
        if let Some(liters) = cfg.reservoir_volume_liters {
            self.engine.set_reservoir_liters(liters)?;
        }
        tracing::info!("configuration updated");
        Ok(())
    }

    pub fn calibrate_pump(
        &self,
        pump: PumpName,
        measured_ml: f64,
        elapsed_secs: f64,
    ) -> Result<f64> {
        self.calibration.calibrate_pump(pump, measured_ml, elapsed_secs)
    }

    pub fn calibrate_sensor(&self, kind: SensorKind, point: CalPoint, value: f64) -> Result<()> {
        self.calibration.calibrate_sensor(kind, point, value)?;
        // The old reading was taken under the old calibration.
        self.sensors.invalidate(kind);
        if kind == SensorKind::Ec {
            self.sensors.invalidate(SensorKind::Tds);
        }
        Ok(())
    }

    /// Run a pump for a fixed time, bypassing dose accounting. Used by the
    /// calibration catch test, where the liquid goes into a cylinder and
    /// not the reservoir.
    pub fn prime_pump(&self, pump: PumpName, duration: Duration) -> Result<()> {
        let handle = self.pumps.run_for(pump, duration)?;
        handle.wait(Duration::from_secs(2));
        Ok(())
    }

    pub fn status(&self) -> SystemStatus {
        let usage = PumpName::DOSING
            .iter()
            .map(|&pump| PumpUsage {
                pump,
                used_24h_ml: self.ledger.used_last_24h(pump),
                remaining_24h_ml: self.ledger.remaining(pump).unwrap_or(0.0),
            })
            .collect();
        let cfg = self.engine_cfg_snapshot();
        SystemStatus {
            engine_state: self.engine.state().as_str(),
            reading: self.sensors.snapshot(),
            pumps: self.pumps.snapshots(),
            usage,
            reservoir_liters: self.engine.reservoir_liters(),
            target_ph: cfg.0,
            target_ec: cfg.1,
        }
    }

    fn engine_cfg_snapshot(&self) -> (f64, f64) {
        let cfg = self.engine.cfg_snapshot();
        (cfg.target_ph, cfg.target_ec)
    }

    /// Force fresh readings (bypassing the TTL only by expiry) and return
    /// the snapshot. Errors are folded into `None` fields.
    pub fn read_now(&self) -> SensorReading {
        let _ = self.sensors.read_temperature();
        let _ = self.sensors.read_ph();
        let _ = self.sensors.read_ec();
        let _ = self.sensors.read_tds();
        self.sensors.snapshot()
    }

    pub fn any_pump_running(&self) -> bool {
        self.pumps.any_running()
    }

    pub fn stop_all(&self) -> Result<()> {
        self.pumps.stop_all()
    }

    /// Stop every pump and leave the system quiescent. Idempotent.
    pub fn shutdown(&self) -> Result<()> {
        tracing::info!("shutting down");
        self.pumps.stop_all()
    }

    /// Cycle driver: run until `shutdown` flips, polling once a second.
    /// The engine's own interval gating decides when a tick actually doses.
    pub fn run_loop(&self, shutdown: &AtomicBool, clock: &(dyn Clock + Send + Sync)) {
        tracing::info!("dosing loop started");
        while !shutdown.load(Ordering::Relaxed) {
            let report = self.run_cycle();
            if report.ran {
                tracing::info!(message = %report.message, "cycle");
            }
            clock.sleep(Duration::from_secs(1));
        }
        if let Err(e) = self.shutdown() {
            tracing::error!(error = %e, "shutdown incomplete");
        }
        tracing::info!("dosing loop stopped");
    }
}

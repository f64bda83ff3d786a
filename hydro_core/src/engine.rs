//! Banded dosing decisions and the cycle state machine.
//!
//! Each cycle snapshots the config, gates on engine state, the minimum
//! cycle interval and the night window, reads pH and EC, then runs the pH
//! branch followed by the nutrient branch. Within a cycle doses are strictly
//! sequential (shared reservoir, doses must mix before the next one), but
//! once the last dose is started the cycle returns; the actuator's timer
//! stops the pump on its own.

use crate::actuator::{PumpActuator, RunHandle};
use crate::error::{DosingError, Result};
use crate::events::{unix_millis, DoseEvent, EventSink};
use crate::ledger::SafetyLedger;
use crate::sensors::{SensorCache, SensorReading};
use hydro_config::{Config, PerPump, PumpName, TimeOfDay};
use hydro_traits::Clock;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Grace on top of a run's nominal duration when sequencing waits on it.
const SEQUENCE_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Idle,
    DosingPhUp,
    DosingPhDown,
    DosingNutrientA,
    DosingNutrientB,
    /// Post-dose stabilization; readings are not trusted yet.
    Measuring,
    /// Transient: a dose failed and is being unwound. Always resolves to Idle.
    Error,
}

impl EngineState {
    pub fn as_str(self) -> &'static str {
        match self {
            EngineState::Idle => "idle",
            EngineState::DosingPhUp => "dosing_ph_up",
            EngineState::DosingPhDown => "dosing_ph_down",
            EngineState::DosingNutrientA => "dosing_nutrient_a",
            EngineState::DosingNutrientB => "dosing_nutrient_b",
            EngineState::Measuring => "measuring",
            EngineState::Error => "error",
        }
    }
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Engine-facing view of the dosing configuration. Snapshotted per cycle so
/// a mid-cycle config reload cannot mix parameter sets.
#[derive(Debug, Clone)]
pub struct EngineCfg {
    pub target_ph: f64,
    pub ph_tolerance: f64,
    pub target_ec: f64,
    pub ec_tolerance: f64,
    pub ph_narrow: f64,
    pub ph_medium: f64,
    pub ec_narrow: f64,
    pub ec_medium: f64,
    pub ratio_a_to_b: f64,
    pub max_single_dose_fraction: f64,
    pub efficiency_ml: PerPump<f64>,
    pub stabilization_secs: PerPump<u64>,
    pub daily_caps_ml: PerPump<f64>,
    pub cycle_interval: Duration,
    pub night: Option<(TimeOfDay, TimeOfDay)>,
}

impl From<&Config> for EngineCfg {
    fn from(cfg: &Config) -> Self {
        Self {
            target_ph: cfg.targets.ph,
            ph_tolerance: cfg.targets.ph_tolerance,
            target_ec: cfg.targets.ec,
            ec_tolerance: cfg.targets.ec_tolerance,
            ph_narrow: cfg.bands.ph_narrow,
            ph_medium: cfg.bands.ph_medium,
            ec_narrow: cfg.bands.ec_narrow,
            ec_medium: cfg.bands.ec_medium,
            ratio_a_to_b: cfg.dosing.nutrient_ratio_a_to_b,
            max_single_dose_fraction: cfg.dosing.max_single_dose_fraction,
            efficiency_ml: cfg.dosing.efficiency_ml,
            stabilization_secs: cfg.dosing.stabilization_secs,
            daily_caps_ml: cfg.safety.daily_caps_ml,
            cycle_interval: Duration::from_secs(cfg.dosing.cycle_interval_secs),
            night: cfg.night.enabled.then_some((cfg.night.start, cfg.night.end)),
        }
    }
}

/// Dose-scaling factor for a deviation magnitude: light inside `narrow`,
/// moderate inside `medium`, full beyond.
pub fn band_factor(deviation_abs: f64, narrow: f64, medium: f64) -> f64 {
    if deviation_abs <= narrow {
        0.2
    } else if deviation_abs <= medium {
        0.5
    } else {
        1.0
    }
}

/// True when `now` (minutes since midnight) falls inside the window,
/// including windows that wrap midnight (22:00-06:00).
pub fn night_window_active(now: TimeOfDay, start: TimeOfDay, end: TimeOfDay) -> bool {
    let (now, start, end) = (now.0, start.0, end.0);
    if start < end {
        start <= now && now <= end
    } else {
        now >= start || now <= end
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// One executed dose within a cycle.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DoseRecord {
    pub pump: PumpName,
    pub volume_ml: f64,
    pub run_secs: f64,
}

/// Result of the pH or nutrient branch of a cycle.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum BranchOutcome {
    WithinTolerance,
    /// EC above target; only fresh water can fix that.
    DilutionRequired { current: f64, target: f64 },
    Dosed { doses: Vec<DoseRecord> },
    Failed { reason: String, partial: Vec<DoseRecord> },
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    /// False when the cycle was gated off before reading sensors.
    pub ran: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ph: Option<BranchOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nutrients: Option<BranchOutcome>,
}

impl CycleReport {
    fn skipped(message: impl Into<String>) -> Self {
        Self {
            ran: false,
            message: message.into(),
            ph: None,
            nutrients: None,
        }
    }
}

/// Planning output of [`DosingEngine::calculate_dilution`].
#[derive(Debug, Clone, Serialize)]
pub struct DilutionPlan {
    pub added_water_liters: f64,
    pub current_ec: f64,
    pub diluted_ec: f64,
    pub new_volume_liters: f64,
    pub nutrient_a_ml: f64,
    pub nutrient_b_ml: f64,
}

struct EngineInner {
    state: EngineState,
    /// Guards cycle/compensation reentrancy independent of the visible state.
    busy: bool,
    measuring_until_ms: Option<u64>,
    last_dose_ms: Option<u64>,
    reservoir_liters: f64,
}

/// Provider for local time of day; injectable so night-window behavior is
/// testable without patching the system clock.
pub type MinutesNow = Box<dyn Fn() -> TimeOfDay + Send + Sync>;

pub fn local_minutes_now() -> TimeOfDay {
    use chrono::Timelike;
    let t = chrono::Local::now().time();
    TimeOfDay((t.hour() * 60 + t.minute()) as u16)
}

pub struct DosingEngine {
    cfg: Mutex<EngineCfg>,
    inner: Mutex<EngineInner>,
    sensors: Arc<SensorCache>,
    pumps: Arc<PumpActuator>,
    ledger: Arc<SafetyLedger>,
    events: Arc<dyn EventSink>,
    clock: Arc<dyn Clock + Send + Sync>,
    epoch: Instant,
    minutes_now: MinutesNow,
}

impl DosingEngine {
    pub fn new(
        cfg: EngineCfg,
        reservoir_liters: f64,
        sensors: Arc<SensorCache>,
        pumps: Arc<PumpActuator>,
        ledger: Arc<SafetyLedger>,
        events: Arc<dyn EventSink>,
        clock: Arc<dyn Clock + Send + Sync>,
    ) -> Self {
        let epoch = clock.now();
        Self {
            cfg: Mutex::new(cfg),
            inner: Mutex::new(EngineInner {
                state: EngineState::Idle,
                busy: false,
                measuring_until_ms: None,
                last_dose_ms: None,
                reservoir_liters,
            }),
            sensors,
            pumps,
            ledger,
            events,
            clock,
            epoch,
            minutes_now: Box::new(local_minutes_now),
        }
    }

    /// Replace the time-of-day source (tests).
    pub fn with_minutes_now(mut self, f: MinutesNow) -> Self {
        self.minutes_now = f;
        self
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, EngineInner> {
        match self.inner.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        }
    }

    /// Copy of the active configuration.
    pub fn cfg_snapshot(&self) -> EngineCfg {
        match self.cfg.lock() {
            Ok(g) => g.clone(),
            Err(p) => p.into_inner().clone(),
        }
    }

    /// Swap in a new configuration; takes effect from the next cycle.
    pub fn update_cfg(&self, cfg: EngineCfg) {
        self.ledger.set_caps(cfg.daily_caps_ml);
        match self.cfg.lock() {
            Ok(mut g) => *g = cfg,
            Err(p) => *p.into_inner() = cfg,
        }
    }

    pub fn state(&self) -> EngineState {
        self.lock_inner().state
    }

    pub fn reservoir_liters(&self) -> f64 {
        self.lock_inner().reservoir_liters
    }

    pub fn set_reservoir_liters(&self, liters: f64) -> Result<()> {
        if !(liters.is_finite() && liters > 0.0) {
            return Err(DosingError::ConfigInvalid(format!(
                "reservoir volume must be > 0, got {liters}"
            )));
        }
        self.lock_inner().reservoir_liters = liters;
        Ok(())
    }

    fn now_ms(&self) -> u64 {
        self.clock.ms_since(self.epoch)
    }

    /// Gate and claim the engine for one cycle. On success the engine is
    /// `busy` and the caller must release through `finish_cycle`.
    fn claim(&self, cfg: &EngineCfg) -> std::result::Result<(), CycleReport> {
        let now = self.now_ms();
        let mut inner = self.lock_inner();
        if inner.busy {
            return Err(CycleReport::skipped(format!(
                "engine busy ({})",
                inner.state
            )));
        }
        if inner.state == EngineState::Measuring {
            match inner.measuring_until_ms {
                Some(until) if now < until => {
                    return Err(CycleReport::skipped(format!(
                        "stabilizing for another {}s",
                        (until - now).div_ceil(1000)
                    )));
                }
                _ => {
                    inner.state = EngineState::Idle;
                    inner.measuring_until_ms = None;
                }
            }
        }
        if let Some(last) = inner.last_dose_ms {
            let elapsed = now.saturating_sub(last);
            let min = cfg.cycle_interval.as_millis() as u64;
            if elapsed < min {
                return Err(CycleReport::skipped(format!(
                    "minimum cycle interval not elapsed ({}s remaining)",
                    (min - elapsed).div_ceil(1000)
                )));
            }
        }
        if let Some((start, end)) = cfg.night
            && night_window_active((self.minutes_now)(), start, end)
        {
            return Err(CycleReport::skipped(format!(
                "night window active ({start}-{end})"
            )));
        }
        inner.busy = true;
        Ok(())
    }

    /// Release the claim: enter Measuring when anything was dosed, Idle
    /// otherwise. `stabilization` is the longest wait of the dosed pumps.
    fn finish_cycle(&self, dosed: bool, stabilization: Duration) {
        let now = self.now_ms();
        let mut inner = self.lock_inner();
        inner.busy = false;
        if dosed {
            inner.state = EngineState::Measuring;
            inner.measuring_until_ms = Some(now + stabilization.as_millis() as u64);
            inner.last_dose_ms = Some(now);
        } else {
            inner.state = EngineState::Idle;
            inner.measuring_until_ms = None;
        }
    }

    fn set_state(&self, state: EngineState) {
        self.lock_inner().state = state;
    }

    /// Run one dosing cycle. Gating rejections come back as a skipped
    /// report, never an error; the driver loop treats every outcome the
    /// same and schedules the next tick.
    pub fn run_cycle(&self) -> CycleReport {
        let cfg = self.cfg_snapshot();
        if let Err(report) = self.claim(&cfg) {
            tracing::debug!(message = %report.message, "cycle skipped");
            return report;
        }

        let (ph, ec) = match (self.sensors.read_ph(), self.sensors.read_ec()) {
            (Ok(ph), Ok(ec)) => (ph, ec),
            (ph, ec) => {
                let failed = [ph.err(), ec.err()]
                    .into_iter()
                    .flatten()
                    .map(|e| e.to_string())
                    .collect::<Vec<_>>()
                    .join("; ");
                self.finish_cycle(false, Duration::ZERO);
                tracing::warn!(error = %failed, "cycle skipped: sensors unavailable");
                return CycleReport::skipped(format!("sensors unavailable: {failed}"));
            }
        };
        let reading = self.sensors.snapshot();
        let reservoir = self.lock_inner().reservoir_liters;

        let mut pending: Option<RunHandle> = None;
        let ph_outcome = self.dose_ph(&cfg, ph, reservoir, &reading, &mut pending);
        let ec_outcome = self.dose_nutrients(&cfg, ec, reservoir, &reading, &mut pending);

        let mut dosed_pumps: Vec<PumpName> = Vec::new();
        for outcome in [&ph_outcome, &ec_outcome] {
            match outcome {
                BranchOutcome::Dosed { doses } => {
                    dosed_pumps.extend(doses.iter().map(|d| d.pump));
                }
                BranchOutcome::Failed { partial, .. } => {
                    dosed_pumps.extend(partial.iter().map(|d| d.pump));
                }
                _ => {}
            }
        }
        let stabilization = dosed_pumps
            .iter()
            .filter_map(|p| cfg.stabilization_secs.get(*p))
            .max()
            .map(Duration::from_secs)
            .unwrap_or(Duration::ZERO);
        let dosed = !dosed_pumps.is_empty();
        self.finish_cycle(dosed, stabilization);

        let message = if dosed {
            format!("cycle complete: dosed {:?}", dosed_pumps)
        } else {
            "cycle complete: no dosing needed".to_string()
        };
        tracing::info!(ph, ec, dosed, "cycle complete");
        CycleReport {
            ran: true,
            message,
            ph: Some(ph_outcome),
            nutrients: Some(ec_outcome),
        }
    }

    fn dose_ph(
        &self,
        cfg: &EngineCfg,
        ph: f64,
        reservoir: f64,
        reading: &SensorReading,
        pending: &mut Option<RunHandle>,
    ) -> BranchOutcome {
        let deviation = ph - cfg.target_ph;
        if deviation.abs() <= cfg.ph_tolerance {
            tracing::debug!(ph, target = cfg.target_ph, "ph within tolerance");
            return BranchOutcome::WithinTolerance;
        }
        let (pump, state) = if deviation > 0.0 {
            (PumpName::PhDown, EngineState::DosingPhDown)
        } else {
            (PumpName::PhUp, EngineState::DosingPhUp)
        };
        let factor = band_factor(deviation.abs(), cfg.ph_narrow, cfg.ph_medium);
        let efficiency = cfg.efficiency_ml.get(pump).unwrap_or(0.0);
        let volume =
            round2(deviation.abs() * 10.0 * efficiency * factor * (reservoir / 100.0));
        let volume = volume.min(self.single_dose_cap(cfg, pump));
        let reason = format!("pH adjustment: {ph:.2} -> {:.2}", cfg.target_ph);

        self.set_state(state);
        match self.dose_one(pump, volume, &reason, reading, pending) {
            Ok(record) => BranchOutcome::Dosed {
                doses: vec![record],
            },
            Err(e) => {
                self.set_state(EngineState::Error);
                tracing::warn!(pump = %pump, error = %e, "ph dose failed");
                BranchOutcome::Failed {
                    reason: e.to_string(),
                    partial: Vec::new(),
                }
            }
        }
    }

    fn dose_nutrients(
        &self,
        cfg: &EngineCfg,
        ec: f64,
        reservoir: f64,
        reading: &SensorReading,
        pending: &mut Option<RunHandle>,
    ) -> BranchOutcome {
        let deviation = cfg.target_ec - ec;
        if deviation.abs() <= cfg.ec_tolerance {
            tracing::debug!(ec, target = cfg.target_ec, "ec within tolerance");
            return BranchOutcome::WithinTolerance;
        }
        if deviation < 0.0 {
            tracing::info!(ec, target = cfg.target_ec, "ec above target; dilution required");
            return BranchOutcome::DilutionRequired {
                current: ec,
                target: cfg.target_ec,
            };
        }
        let factor = band_factor(deviation, cfg.ec_narrow, cfg.ec_medium);
        let efficiency = cfg.efficiency_ml.get(PumpName::NutrientA).unwrap_or(0.0);
        let base = deviation / 100.0 * efficiency * factor * (reservoir / 100.0);
        let (volume_a, volume_b) = self.split_ab(cfg, base);
        let reason = format!("EC adjustment: {ec:.0} -> {:.0}", cfg.target_ec);

        self.set_state(EngineState::DosingNutrientA);
        let record_a = match self.dose_one(PumpName::NutrientA, volume_a, &reason, reading, pending)
        {
            Ok(r) => r,
            Err(e) => {
                self.set_state(EngineState::Error);
                tracing::warn!(error = %e, "nutrient A dose failed");
                return BranchOutcome::Failed {
                    reason: e.to_string(),
                    partial: Vec::new(),
                };
            }
        };
        self.set_state(EngineState::DosingNutrientB);
        match self.dose_one(PumpName::NutrientB, volume_b, &reason, reading, pending) {
            Ok(record_b) => BranchOutcome::Dosed {
                doses: vec![record_a, record_b],
            },
            Err(e) => {
                self.set_state(EngineState::Error);
                tracing::warn!(error = %e, "nutrient B dose failed after A");
                BranchOutcome::Failed {
                    reason: e.to_string(),
                    partial: vec![record_a],
                }
            }
        }
    }

    fn single_dose_cap(&self, cfg: &EngineCfg, pump: PumpName) -> f64 {
        cfg.daily_caps_ml.get(pump).unwrap_or(0.0) * cfg.max_single_dose_fraction
    }

    fn split_ab(&self, cfg: &EngineCfg, base_ml: f64) -> (f64, f64) {
        let ratio_sum = 1.0 + cfg.ratio_a_to_b;
        let a = round2(base_ml * (cfg.ratio_a_to_b / ratio_sum))
            .min(self.single_dose_cap(cfg, PumpName::NutrientA));
        let b = round2(base_ml * (1.0 / ratio_sum))
            .min(self.single_dose_cap(cfg, PumpName::NutrientB));
        (a, b)
    }

    /// Authorize, actuate and report one dose. Waits out any previous
    /// in-cycle run first so two doses never mix mid-stream.
    fn dose_one(
        &self,
        pump: PumpName,
        volume_ml: f64,
        reason: &str,
        reading: &SensorReading,
        pending: &mut Option<RunHandle>,
    ) -> Result<DoseRecord> {
        let grant = self.ledger.authorize(pump, volume_ml)?;
        if let Some(previous) = pending.take()
            && !previous.wait(SEQUENCE_GRACE)
        {
            self.ledger.release(grant);
            return Err(DosingError::State(format!(
                "{} run did not finish in time",
                previous.pump
            )));
        }
        let volume = grant.allowed_ml;
        match self.pumps.run_volume(pump, volume) {
            Ok(handle) => {
                tracing::info!(pump = %pump, volume_ml = volume, reason, "dosing");
                self.events.dose_event(&DoseEvent {
                    pump,
                    volume_ml: volume,
                    reason: reason.to_string(),
                    at_epoch_ms: unix_millis(),
                    reading: reading.clone(),
                });
                let run_secs = handle.duration.as_secs_f64();
                *pending = Some(handle);
                Ok(DoseRecord {
                    pump,
                    volume_ml: volume,
                    run_secs,
                })
            }
            Err(e) => {
                self.ledger.release(grant);
                Err(e)
            }
        }
    }

    /// Operator-initiated dose outside the cycle state machine. Still
    /// ledger-checked; the single-writer rule in the actuator protects
    /// against overlapping a cycle's run on the same pump.
    pub fn manual_dose(&self, pump: PumpName, volume_ml: f64) -> Result<DoseRecord> {
        let grant = self.ledger.authorize(pump, volume_ml)?;
        let volume = grant.allowed_ml;
        match self.pumps.run_volume(pump, volume) {
            Ok(handle) => {
                let reason = "manual dose".to_string();
                tracing::info!(pump = %pump, volume_ml = volume, "manual dose");
                self.events.dose_event(&DoseEvent {
                    pump,
                    volume_ml: volume,
                    reason,
                    at_epoch_ms: unix_millis(),
                    reading: self.sensors.snapshot(),
                });
                Ok(DoseRecord {
                    pump,
                    volume_ml: volume,
                    run_secs: handle.duration.as_secs_f64(),
                })
            }
            Err(e) => {
                self.ledger.release(grant);
                Err(e)
            }
        }
    }

    /// Pure planning arithmetic for a fresh-water top-up: what the EC will
    /// fall to and what A/B replenishment holds it at target strength.
    pub fn calculate_dilution(&self, added_water_liters: f64) -> Result<DilutionPlan> {
        let cfg = self.cfg_snapshot();
        self.dilution_plan(&cfg, added_water_liters)
    }

    fn dilution_plan(&self, cfg: &EngineCfg, added_water_liters: f64) -> Result<DilutionPlan> {
        if !(added_water_liters.is_finite() && added_water_liters > 0.0) {
            return Err(DosingError::State(format!(
                "added water must be > 0, got {added_water_liters}"
            )));
        }
        let current_ec = self.sensors.read_ec()?;
        let reservoir = self.lock_inner().reservoir_liters;
        let new_volume = reservoir + added_water_liters;
        let diluted_ec = current_ec * (reservoir / new_volume);
        let ec_drop = current_ec - diluted_ec;
        let efficiency = cfg.efficiency_ml.get(PumpName::NutrientA).unwrap_or(0.0);
        let base = ec_drop / 100.0 * efficiency * (new_volume / 100.0);
        let ratio_sum = 1.0 + cfg.ratio_a_to_b;
        Ok(DilutionPlan {
            added_water_liters,
            current_ec,
            diluted_ec: round2(diluted_ec),
            new_volume_liters: new_volume,
            nutrient_a_ml: round2(base * (cfg.ratio_a_to_b / ratio_sum)),
            nutrient_b_ml: round2(base * (1.0 / ratio_sum)),
        })
    }

    /// Replenish nutrients after a fresh-water top-up: grow the tracked
    /// reservoir volume, then dose the computed A/B amounts under the same
    /// authorization rules as a cycle.
    pub fn compensate_for_dilution(&self, added_water_liters: f64) -> Result<BranchOutcome> {
        let cfg = self.cfg_snapshot();
        if let Err(report) = self.claim(&cfg) {
            return Err(DosingError::State(report.message));
        }
        let result = self.compensate_locked(&cfg, added_water_liters);
        let (dosed, stabilization) = match &result {
            Ok(BranchOutcome::Dosed { doses }) | Ok(BranchOutcome::Failed { partial: doses, .. })
                if !doses.is_empty() =>
            {
                let stab = doses
                    .iter()
                    .filter_map(|d| cfg.stabilization_secs.get(d.pump))
                    .max()
                    .map(Duration::from_secs)
                    .unwrap_or(Duration::ZERO);
                (true, stab)
            }
            _ => (false, Duration::ZERO),
        };
        self.finish_cycle(dosed, stabilization);
        result
    }

    fn compensate_locked(
        &self,
        cfg: &EngineCfg,
        added_water_liters: f64,
    ) -> Result<BranchOutcome> {
        // The same snapshot the claim gated on drives the plan, so a config
        // reload mid-operation cannot mix parameter sets.
        let plan = self.dilution_plan(cfg, added_water_liters)?;
        // Volume first: even if dosing fails the tank really did grow.
        self.lock_inner().reservoir_liters = plan.new_volume_liters;
        let reading = self.sensors.snapshot();
        let reason = format!(
            "dilution compensation: +{:.1} L, EC {:.0} -> {:.0}",
            plan.added_water_liters, plan.current_ec, plan.diluted_ec
        );
        let mut pending: Option<RunHandle> = None;

        self.set_state(EngineState::DosingNutrientA);
        let record_a = match self.dose_one(
            PumpName::NutrientA,
            plan.nutrient_a_ml,
            &reason,
            &reading,
            &mut pending,
        ) {
            Ok(r) => r,
            Err(e) => {
                self.set_state(EngineState::Error);
                return Ok(BranchOutcome::Failed {
                    reason: e.to_string(),
                    partial: Vec::new(),
                });
            }
        };
        self.set_state(EngineState::DosingNutrientB);
        match self.dose_one(
            PumpName::NutrientB,
            plan.nutrient_b_ml,
            &reason,
            &reading,
            &mut pending,
        ) {
            Ok(record_b) => Ok(BranchOutcome::Dosed {
                doses: vec![record_a, record_b],
            }),
            Err(e) => {
                self.set_state(EngineState::Error);
                Ok(BranchOutcome::Failed {
                    reason: e.to_string(),
                    partial: vec![record_a],
                })
            }
        }
    }
}

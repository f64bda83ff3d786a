#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
#![cfg_attr(
    all(not(debug_assertions), not(test)),
    deny(clippy::all, clippy::pedantic, clippy::nursery)
)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]
//! Config schema and calibration-profile persistence for the reservoir doser.
//!
//! - `Config` and sub-structs are deserialized from TOML and validated.
//! - `CalibrationProfile` is the persisted calibration state; the core
//!   mutates it through the calibration store and hands it back here to be
//!   written atomically.

use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

/// Pump channels known to the system. `Circulation` carries no flow rate
/// and is excluded from dosing math.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum PumpName {
    PhUp,
    PhDown,
    NutrientA,
    NutrientB,
    Circulation,
}

impl PumpName {
    pub fn as_str(self) -> &'static str {
        match self {
            PumpName::PhUp => "ph_up",
            PumpName::PhDown => "ph_down",
            PumpName::NutrientA => "nutrient_a",
            PumpName::NutrientB => "nutrient_b",
            PumpName::Circulation => "circulation",
        }
    }

    /// The four metering channels the engine doses with.
    pub const DOSING: [PumpName; 4] = [
        PumpName::PhUp,
        PumpName::PhDown,
        PumpName::NutrientA,
        PumpName::NutrientB,
    ];
}

impl std::fmt::Display for PumpName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PumpName {
    type Err = eyre::Report;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ph_up" => Ok(PumpName::PhUp),
            "ph_down" => Ok(PumpName::PhDown),
            "nutrient_a" => Ok(PumpName::NutrientA),
            "nutrient_b" => Ok(PumpName::NutrientB),
            "circulation" => Ok(PumpName::Circulation),
            other => Err(eyre::eyre!("unknown pump: {other}")),
        }
    }
}

/// One value per dosing pump. Keeps TOML flat: `ph_up = 0.5`, ...
#[derive(Debug, Deserialize, Serialize, Clone, Copy)]
pub struct PerPump<T> {
    pub ph_up: T,
    pub ph_down: T,
    pub nutrient_a: T,
    pub nutrient_b: T,
}

impl<T: Copy> PerPump<T> {
    pub fn get(&self, pump: PumpName) -> Option<T> {
        match pump {
            PumpName::PhUp => Some(self.ph_up),
            PumpName::PhDown => Some(self.ph_down),
            PumpName::NutrientA => Some(self.nutrient_a),
            PumpName::NutrientB => Some(self.nutrient_b),
            PumpName::Circulation => None,
        }
    }

    pub fn set(&mut self, pump: PumpName, value: T) {
        match pump {
            PumpName::PhUp => self.ph_up = value,
            PumpName::PhDown => self.ph_down = value,
            PumpName::NutrientA => self.nutrient_a = value,
            PumpName::NutrientB => self.nutrient_b = value,
            PumpName::Circulation => {}
        }
    }
}

/// Minutes since midnight, read from / written as "HH:MM".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeOfDay(pub u16);

impl TimeOfDay {
    pub fn parse(s: &str) -> eyre::Result<Self> {
        let (h, m) = s
            .split_once(':')
            .ok_or_else(|| eyre::eyre!("time must be HH:MM, got {s:?}"))?;
        let h: u16 = h.parse().map_err(|_| eyre::eyre!("bad hour in {s:?}"))?;
        let m: u16 = m.parse().map_err(|_| eyre::eyre!("bad minute in {s:?}"))?;
        if h > 23 || m > 59 {
            eyre::bail!("time out of range: {s:?}");
        }
        Ok(TimeOfDay(h * 60 + m))
    }
}

impl std::fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02}:{:02}", self.0 / 60, self.0 % 60)
    }
}

impl<'de> Deserialize<'de> for TimeOfDay {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        TimeOfDay::parse(&s).map_err(serde::de::Error::custom)
    }
}

impl Serialize for TimeOfDay {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Targets {
    pub ph: f64,
    pub ph_tolerance: f64,
    pub ec: f64,
    pub ec_tolerance: f64,
}

impl Default for Targets {
    fn default() -> Self {
        Self {
            ph: 6.0,
            ph_tolerance: 0.2,
            ec: 1800.0,
            ec_tolerance: 100.0,
        }
    }
}

/// Deviation brackets mapping to dose-scaling factors. Deviations at or
/// under `narrow` dose lightly, under `medium` moderately, above it fully.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Bands {
    pub ph_narrow: f64,
    pub ph_medium: f64,
    pub ec_narrow: f64,
    pub ec_medium: f64,
}

impl Default for Bands {
    fn default() -> Self {
        Self {
            ph_narrow: 0.1,
            ph_medium: 0.3,
            ec_narrow: 50.0,
            ec_medium: 150.0,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Dosing {
    pub nutrient_ratio_a_to_b: f64,
    /// Minimum seconds between dosing cycles (any pump).
    pub cycle_interval_secs: u64,
    /// Largest single dose, as a fraction of the pump's daily cap.
    pub max_single_dose_fraction: f64,
    /// ml per unit deviation per 100 L of reservoir.
    pub efficiency_ml: PerPump<f64>,
    /// Wait after dosing before the next reading is trusted.
    pub stabilization_secs: PerPump<u64>,
}

impl Default for Dosing {
    fn default() -> Self {
        Self {
            nutrient_ratio_a_to_b: 1.0,
            cycle_interval_secs: 3600,
            max_single_dose_fraction: 0.3,
            efficiency_ml: PerPump {
                ph_up: 0.5,
                ph_down: 0.5,
                nutrient_a: 5.0,
                nutrient_b: 5.0,
            },
            stabilization_secs: PerPump {
                ph_up: 300,
                ph_down: 300,
                nutrient_a: 600,
                nutrient_b: 600,
            },
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Safety {
    pub daily_caps_ml: PerPump<f64>,
}

impl Default for Safety {
    fn default() -> Self {
        Self {
            daily_caps_ml: PerPump {
                ph_up: 100.0,
                ph_down: 100.0,
                nutrient_a: 200.0,
                nutrient_b: 200.0,
            },
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Night {
    pub enabled: bool,
    pub start: TimeOfDay,
    pub end: TimeOfDay,
}

impl Default for Night {
    fn default() -> Self {
        Self {
            enabled: false,
            start: TimeOfDay(22 * 60),
            end: TimeOfDay(6 * 60),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Sensors {
    /// Readings younger than this are served from cache.
    pub cache_ttl_ms: u64,
    /// Max wait per probe query.
    pub read_timeout_ms: u64,
}

impl Default for Sensors {
    fn default() -> Self {
        Self {
            cache_ttl_ms: 2000,
            read_timeout_ms: 500,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PolarityCfg {
    #[default]
    Normal,
    Inverted,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PumpCfg {
    pub id: PumpName,
    /// Output channel on the hardware backend (BCM pin for GPIO).
    pub channel: u8,
    /// ml/sec; optional only for the circulation pump.
    pub flow_rate_ml_per_sec: Option<f64>,
    pub max_run_secs: u64,
    #[serde(default)]
    pub polarity: PolarityCfg,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Logging {
    pub file: Option<String>,  // path to .log (JSON lines)
    pub level: Option<String>, // "info","debug"
    /// Log rotation policy: "never" | "daily" | "hourly" (default: never)
    pub rotation: Option<String>,
}

/// Per-sensor calibration state: linear adjust plus the raw buffer points
/// recorded during calibration (pH: low/mid/high; EC: dry/low/high).
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(default)]
pub struct SensorCal {
    pub offset: f64,
    pub scale: f64,
    pub points: BTreeMap<String, f64>,
}

impl SensorCal {
    pub fn identity() -> Self {
        Self {
            offset: 0.0,
            scale: 1.0,
            points: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct SensorCals {
    pub ph: SensorCal,
    pub ec: SensorCal,
    pub temperature: SensorCal,
}

impl Default for SensorCals {
    fn default() -> Self {
        Self {
            ph: SensorCal::identity(),
            ec: SensorCal::identity(),
            temperature: SensorCal::identity(),
        }
    }
}

/// Persisted calibration state. Flow rates here override the static pump
/// table at startup and are rewritten after every successful calibration.
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct CalibrationProfile {
    pub flow_rates_ml_per_sec: PerPump<f64>,
    pub sensors: SensorCals,
}

impl Default for CalibrationProfile {
    fn default() -> Self {
        Self {
            flow_rates_ml_per_sec: PerPump {
                ph_up: 1.0,
                ph_down: 1.0,
                nutrient_a: 1.0,
                nutrient_b: 1.0,
            },
            sensors: SensorCals::default(),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub reservoir_volume_liters: Option<f64>,
    pub targets: Targets,
    pub bands: Bands,
    pub dosing: Dosing,
    pub safety: Safety,
    pub night: Night,
    pub sensors: Sensors,
    pub pumps: Vec<PumpCfg>,
    pub logging: Logging,
    /// Optional persisted calibration; preferred over pump-table flow rates.
    pub calibration: Option<CalibrationProfile>,
}

/// Factory pump wiring used when the config carries no `[[pumps]]` table:
/// the stock four-head peristaltic hat on BCM 5/6/13/19.
pub fn default_pump_table() -> Vec<PumpCfg> {
    let entry = |id, channel, rate, max_run| PumpCfg {
        id,
        channel,
        flow_rate_ml_per_sec: Some(rate),
        max_run_secs: max_run,
        polarity: PolarityCfg::Normal,
    };
    vec![
        entry(PumpName::PhUp, 5, 1.0, 60),
        entry(PumpName::PhDown, 6, 1.0, 60),
        entry(PumpName::NutrientA, 13, 1.2, 120),
        entry(PumpName::NutrientB, 19, 1.2, 120),
    ]
}

pub fn load_toml(s: &str) -> Result<Config, toml::de::Error> {
    toml::from_str::<Config>(s)
}

pub fn load_file(path: &Path) -> eyre::Result<Config> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| eyre::eyre!("read config {:?}: {}", path, e))?;
    let cfg = load_toml(&text).map_err(|e| eyre::eyre!("parse config {:?}: {}", path, e))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Write-then-rename so a crash mid-save never corrupts the profile.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("new");
    {
        let mut f = std::fs::File::create(&tmp)?;
        f.write_all(bytes)?;
        f.sync_all()?;
    }
    std::fs::rename(tmp, path)
}

pub fn save_profile(path: &Path, profile: &CalibrationProfile) -> eyre::Result<()> {
    let text = toml::to_string_pretty(profile)
        .map_err(|e| eyre::eyre!("serialize calibration profile: {e}"))?;
    write_atomic(path, text.as_bytes())
        .map_err(|e| eyre::eyre!("write calibration profile {:?}: {}", path, e))?;
    Ok(())
}

pub fn load_profile(path: &Path) -> eyre::Result<CalibrationProfile> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| eyre::eyre!("read calibration profile {:?}: {}", path, e))?;
    toml::from_str(&text).map_err(|e| eyre::eyre!("parse calibration profile {:?}: {}", path, e))
}

impl Config {
    pub fn validate(&self) -> eyre::Result<()> {
        // Targets (ranges follow what the probes can plausibly report)
        if !(3.0..=10.0).contains(&self.targets.ph) {
            eyre::bail!("targets.ph must be in [3.0, 10.0]");
        }
        if !(0.05..=1.0).contains(&self.targets.ph_tolerance) {
            eyre::bail!("targets.ph_tolerance must be in [0.05, 1.0]");
        }
        if !(0.0..=5000.0).contains(&self.targets.ec) {
            eyre::bail!("targets.ec must be in [0.0, 5000.0]");
        }
        if !(10.0..=500.0).contains(&self.targets.ec_tolerance) {
            eyre::bail!("targets.ec_tolerance must be in [10.0, 500.0]");
        }

        // Bands
        if self.bands.ph_narrow <= 0.0 || self.bands.ec_narrow <= 0.0 {
            eyre::bail!("bands must be > 0");
        }
        if self.bands.ph_medium <= self.bands.ph_narrow {
            eyre::bail!("bands.ph_medium must exceed bands.ph_narrow");
        }
        if self.bands.ec_medium <= self.bands.ec_narrow {
            eyre::bail!("bands.ec_medium must exceed bands.ec_narrow");
        }

        // Dosing
        if !(0.1..=10.0).contains(&self.dosing.nutrient_ratio_a_to_b) {
            eyre::bail!("dosing.nutrient_ratio_a_to_b must be in [0.1, 10.0]");
        }
        if self.dosing.cycle_interval_secs == 0 {
            eyre::bail!("dosing.cycle_interval_secs must be >= 1");
        }
        if !(0.0..=1.0).contains(&self.dosing.max_single_dose_fraction)
            || self.dosing.max_single_dose_fraction == 0.0
        {
            eyre::bail!("dosing.max_single_dose_fraction must be in (0.0, 1.0]");
        }
        for pump in PumpName::DOSING {
            let eff = self.dosing.efficiency_ml.get(pump).unwrap_or(0.0);
            if eff <= 0.0 {
                eyre::bail!("dosing.efficiency_ml.{pump} must be > 0");
            }
            let cap = self.safety.daily_caps_ml.get(pump).unwrap_or(0.0);
            if cap <= 0.0 {
                eyre::bail!("safety.daily_caps_ml.{pump} must be > 0");
            }
        }

        // Reservoir
        if let Some(v) = self.reservoir_volume_liters
            && v <= 0.0
        {
            eyre::bail!("reservoir_volume_liters must be > 0");
        }

        // Sensors
        if self.sensors.cache_ttl_ms == 0 {
            eyre::bail!("sensors.cache_ttl_ms must be >= 1");
        }
        if self.sensors.read_timeout_ms == 0 {
            eyre::bail!("sensors.read_timeout_ms must be >= 1");
        }

        // Pumps: unique ids and channels; flow rate required except circulation
        let mut seen_ids = Vec::new();
        let mut seen_channels = Vec::new();
        for p in &self.pumps {
            if seen_ids.contains(&p.id) {
                eyre::bail!("duplicate pump id: {}", p.id);
            }
            if seen_channels.contains(&p.channel) {
                eyre::bail!("duplicate pump channel: {}", p.channel);
            }
            seen_ids.push(p.id);
            seen_channels.push(p.channel);
            if p.max_run_secs == 0 {
                eyre::bail!("pumps.{}.max_run_secs must be >= 1", p.id);
            }
            match (p.id, p.flow_rate_ml_per_sec) {
                (PumpName::Circulation, _) => {}
                (_, Some(rate)) if rate > 0.0 => {}
                (id, Some(_)) => eyre::bail!("pumps.{id}.flow_rate_ml_per_sec must be > 0"),
                (id, None) => eyre::bail!("pumps.{id} requires flow_rate_ml_per_sec"),
            }
        }

        // Calibration profile, when present
        if let Some(profile) = &self.calibration {
            for pump in PumpName::DOSING {
                let rate = profile.flow_rates_ml_per_sec.get(pump).unwrap_or(0.0);
                if rate <= 0.0 {
                    eyre::bail!("calibration.flow_rates_ml_per_sec.{pump} must be > 0");
                }
            }
            for (name, cal) in [
                ("ph", &profile.sensors.ph),
                ("ec", &profile.sensors.ec),
                ("temperature", &profile.sensors.temperature),
            ] {
                if cal.scale == 0.0 || !cal.scale.is_finite() || !cal.offset.is_finite() {
                    eyre::bail!("calibration.sensors.{name} has a degenerate offset/scale");
                }
            }
        }

        Ok(())
    }

    /// Effective calibration at startup: persisted profile when present,
    /// else flow rates lifted from the pump table.
    pub fn effective_profile(&self) -> CalibrationProfile {
        if let Some(profile) = &self.calibration {
            return profile.clone();
        }
        let mut profile = CalibrationProfile::default();
        for p in &self.pumps {
            if let Some(rate) = p.flow_rate_ml_per_sec {
                profile.flow_rates_ml_per_sec.set(p.id, rate);
            }
        }
        profile
    }
}

//! Runtime calibration state: pump flow rates and sensor adjustments.
//!
//! The store is the single source of truth while running; every successful
//! pump calibration is pushed to the sink so a restart comes back with the
//! measured rates instead of the factory defaults.

use crate::error::{DosingError, Result};
use hydro_config::{CalibrationProfile, PumpName, SensorCal};
use hydro_traits::SensorKind;
use std::sync::RwLock;

/// Reference points accepted during sensor calibration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalPoint {
    Low,
    Mid,
    High,
    Dry,
}

impl CalPoint {
    pub fn as_str(self) -> &'static str {
        match self {
            CalPoint::Low => "low",
            CalPoint::Mid => "mid",
            CalPoint::High => "high",
            CalPoint::Dry => "dry",
        }
    }
}

impl std::str::FromStr for CalPoint {
    type Err = eyre::Report;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "low" => Ok(CalPoint::Low),
            "mid" => Ok(CalPoint::Mid),
            "high" => Ok(CalPoint::High),
            "dry" => Ok(CalPoint::Dry),
            other => Err(eyre::eyre!("unknown calibration point: {other}")),
        }
    }
}

/// Persistence hook for the calibration profile.
pub trait CalibrationSink: Send + Sync {
    fn persist(&self, profile: &CalibrationProfile) -> eyre::Result<()>;
}

/// Sink that keeps calibration in memory only.
#[derive(Debug, Default)]
pub struct NullSink;

impl CalibrationSink for NullSink {
    fn persist(&self, _profile: &CalibrationProfile) -> eyre::Result<()> {
        tracing::debug!("calibration persistence disabled");
        Ok(())
    }
}

pub struct CalibrationStore {
    profile: RwLock<CalibrationProfile>,
    sink: Box<dyn CalibrationSink>,
}

impl CalibrationStore {
    pub fn new(profile: CalibrationProfile, sink: Box<dyn CalibrationSink>) -> Self {
        Self {
            profile: RwLock::new(profile),
            sink,
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, CalibrationProfile> {
        match self.profile.read() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        }
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, CalibrationProfile> {
        match self.profile.write() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        }
    }

    /// Current flow rate in ml/sec; `None` for the circulation pump.
    pub fn flow_rate(&self, pump: PumpName) -> Option<f64> {
        self.read().flow_rates_ml_per_sec.get(pump)
    }

    /// Linear adjustment `(offset, scale)` applied to parsed probe values.
    pub fn sensor_adjust(&self, kind: SensorKind) -> (f64, f64) {
        let profile = self.read();
        let cal = match kind {
            SensorKind::Ph => &profile.sensors.ph,
            SensorKind::Ec | SensorKind::Tds => &profile.sensors.ec,
            SensorKind::Temperature => &profile.sensors.temperature,
        };
        (cal.offset, cal.scale)
    }

    pub fn profile(&self) -> CalibrationProfile {
        self.read().clone()
    }

    /// Derive a pump's flow rate from a timed catch test and persist it.
    ///
    /// Returns the new rate in ml/sec.
    pub fn calibrate_pump(
        &self,
        pump: PumpName,
        measured_ml: f64,
        elapsed_secs: f64,
    ) -> Result<f64> {
        if pump == PumpName::Circulation {
            return Err(DosingError::InvalidCalibration(
                "circulation pump is not a metering pump".into(),
            ));
        }
        if !(measured_ml.is_finite() && measured_ml > 0.0) {
            return Err(DosingError::InvalidCalibration(format!(
                "measured volume must be > 0, got {measured_ml}"
            )));
        }
        if !(elapsed_secs.is_finite() && elapsed_secs > 0.0) {
            return Err(DosingError::InvalidCalibration(format!(
                "elapsed seconds must be > 0, got {elapsed_secs}"
            )));
        }
        let rate = measured_ml / elapsed_secs;
        let snapshot = {
            let mut profile = self.write();
            profile.flow_rates_ml_per_sec.set(pump, rate);
            profile.clone()
        };
        tracing::info!(pump = %pump, rate_ml_per_sec = rate, "pump calibrated");
        if let Err(e) = self.sink.persist(&snapshot) {
            // The in-memory rate is already live; losing persistence is
            // an operational problem, not a dosing one.
            tracing::error!(error = %e, "failed to persist calibration profile");
        }
        Ok(rate)
    }

    /// Record a sensor reference point.
    ///
    /// pH accepts low/mid/high, EC accepts dry/low/high, temperature takes a
    /// single point stored under "single". TDS is derived from EC and cannot
    /// be calibrated directly.
    pub fn calibrate_sensor(&self, kind: SensorKind, point: CalPoint, value: f64) -> Result<()> {
        if !value.is_finite() {
            return Err(DosingError::InvalidCalibration(format!(
                "reference value must be finite, got {value}"
            )));
        }
        let key = match (kind, point) {
            (SensorKind::Ph, CalPoint::Low | CalPoint::Mid | CalPoint::High) => point.as_str(),
            (SensorKind::Ec, CalPoint::Dry | CalPoint::Low | CalPoint::High) => point.as_str(),
            (SensorKind::Temperature, _) => "single",
            (SensorKind::Tds, _) => {
                return Err(DosingError::InvalidCalibration(
                    "tds is derived from ec; calibrate ec instead".into(),
                ));
            }
            (k, p) => {
                return Err(DosingError::InvalidCalibration(format!(
                    "point {} is not valid for {k}",
                    p.as_str()
                )));
            }
        };
        let snapshot = {
            let mut profile = self.write();
            let cal: &mut SensorCal = match kind {
                SensorKind::Ph => &mut profile.sensors.ph,
                SensorKind::Ec => &mut profile.sensors.ec,
                SensorKind::Temperature => &mut profile.sensors.temperature,
                SensorKind::Tds => unreachable!("rejected above"),
            };
            cal.points.insert(key.to_string(), value);
            profile.clone()
        };
        tracing::info!(sensor = %kind, point = key, value, "sensor calibration point recorded");
        if let Err(e) = self.sink.persist(&snapshot) {
            tracing::error!(error = %e, "failed to persist calibration profile");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> CalibrationStore {
        CalibrationStore::new(CalibrationProfile::default(), Box::new(NullSink))
    }

    #[test]
    fn catch_test_sets_flow_rate() {
        let s = store();
        let rate = s.calibrate_pump(PumpName::PhUp, 12.0, 6.0).unwrap();
        assert!((rate - 2.0).abs() < 1e-9);
        assert_eq!(s.flow_rate(PumpName::PhUp), Some(2.0));
    }

    #[test]
    fn circulation_cannot_be_calibrated() {
        let s = store();
        assert!(matches!(
            s.calibrate_pump(PumpName::Circulation, 10.0, 5.0),
            Err(DosingError::InvalidCalibration(_))
        ));
    }

    #[test]
    fn ec_rejects_mid_point() {
        let s = store();
        let err = s
            .calibrate_sensor(SensorKind::Ec, CalPoint::Mid, 1413.0)
            .unwrap_err();
        assert!(matches!(err, DosingError::InvalidCalibration(_)));
    }

    #[test]
    fn ph_points_accumulate() {
        let s = store();
        s.calibrate_sensor(SensorKind::Ph, CalPoint::Mid, 7.0).unwrap();
        s.calibrate_sensor(SensorKind::Ph, CalPoint::Low, 4.0).unwrap();
        let profile = s.profile();
        assert_eq!(profile.sensors.ph.points.get("mid"), Some(&7.0));
        assert_eq!(profile.sensors.ph.points.get("low"), Some(&4.0));
    }

    #[test]
    fn tds_calibration_is_rejected() {
        let s = store();
        assert!(
            s.calibrate_sensor(SensorKind::Tds, CalPoint::Low, 500.0)
                .is_err()
        );
    }
}

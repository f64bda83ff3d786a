//! TTL-cached access to the water-quality probes.
//!
//! Probe queries are slow serial transactions, so every reading is cached
//! for a short TTL and re-queried only on expiry. Temperature compensation
//! is pushed to the pH and EC probes before each fresh pH/EC query; a probe
//! reading taken at the wrong compensation temperature drifts by several
//! percent.

use crate::calibration::CalibrationStore;
use crate::error::{DosingError, Result};
use crate::events::unix_millis;
use hydro_traits::{Clock, SensorBus, SensorKind};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// TDS in ppm is derived from conductivity with the NaCl-scale factor.
pub const TDS_FROM_EC: f64 = 0.5;

/// Point-in-time view of all probes. `None` means never read or currently
/// failing; callers must not dose on a `None`.
#[derive(Debug, Clone, Serialize, Default)]
pub struct SensorReading {
    pub ph: Option<f64>,
    pub ec: Option<f64>,
    pub tds: Option<f64>,
    pub temperature: Option<f64>,
    /// Unix epoch milliseconds when the snapshot was taken.
    pub taken_at_ms: u64,
}

#[derive(Debug, Default, Clone, Copy)]
struct Entry {
    value: Option<f64>,
    read_at_ms: Option<u64>,
    stale: bool,
}

impl Entry {
    fn fresh(&self, now_ms: u64, ttl_ms: u64) -> Option<f64> {
        let at = self.read_at_ms?;
        if self.stale || now_ms.saturating_sub(at) >= ttl_ms {
            return None;
        }
        self.value
    }
}

struct CacheState {
    backend: Box<dyn SensorBus + Send>,
    ph: Entry,
    ec: Entry,
    tds: Entry,
    temperature: Entry,
}

impl CacheState {
    fn entry_mut(&mut self, kind: SensorKind) -> &mut Entry {
        match kind {
            SensorKind::Ph => &mut self.ph,
            SensorKind::Ec => &mut self.ec,
            SensorKind::Tds => &mut self.tds,
            SensorKind::Temperature => &mut self.temperature,
        }
    }
}

pub struct SensorCache {
    state: Mutex<CacheState>,
    calibration: Arc<CalibrationStore>,
    clock: Arc<dyn Clock + Send + Sync>,
    epoch: Instant,
    ttl_ms: u64,
    timeout: Duration,
}

impl SensorCache {
    pub fn new(
        backend: Box<dyn SensorBus + Send>,
        calibration: Arc<CalibrationStore>,
        clock: Arc<dyn Clock + Send + Sync>,
        ttl: Duration,
        timeout: Duration,
    ) -> Self {
        let epoch = clock.now();
        Self {
            state: Mutex::new(CacheState {
                backend,
                ph: Entry::default(),
                ec: Entry::default(),
                tds: Entry::default(),
                temperature: Entry::default(),
            }),
            calibration,
            clock,
            epoch,
            ttl_ms: ttl.as_millis() as u64,
            timeout,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CacheState> {
        match self.state.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        }
    }

    fn now_ms(&self) -> u64 {
        self.clock.ms_since(self.epoch)
    }

    /// Query the backend, parse, apply the linear calibration adjustment
    /// and update the cache entry. On failure the last good value stays
    /// in the entry but is flagged stale.
    fn refresh(&self, st: &mut CacheState, kind: SensorKind) -> Result<f64> {
        let raw = match st.backend.query(kind, self.timeout) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(sensor = %kind, error = %e, "probe query failed");
                st.entry_mut(kind).stale = true;
                return Err(DosingError::SensorUnavailable(kind));
            }
        };
        // EC probes can report "EC,TDS,SAL,SG"; the first field is ours.
        let first = raw.split(',').next().unwrap_or("").trim();
        let parsed: f64 = match first.parse() {
            Ok(v) => v,
            Err(_) => {
                tracing::warn!(sensor = %kind, payload = %raw, "unparseable probe payload");
                st.entry_mut(kind).stale = true;
                return Err(DosingError::SensorUnavailable(kind));
            }
        };
        let (offset, scale) = self.calibration.sensor_adjust(kind);
        let value = parsed * scale + offset;
        let entry = st.entry_mut(kind);
        entry.value = Some(value);
        entry.read_at_ms = Some(self.now_ms());
        entry.stale = false;
        tracing::trace!(sensor = %kind, value, "probe read");
        if kind == SensorKind::Temperature {
            // Every fresh temperature goes straight to the pH/EC probes, so
            // a fresh temperature entry always implies current compensation
            // no matter which read path fetched it.
            Self::push_compensation(st, value);
        }
        Ok(value)
    }

    /// Push the temperature to the pH/EC probes. Best-effort: a failed push
    /// downgrades reading quality but does not block the read.
    fn push_compensation(st: &mut CacheState, temp: f64) {
        for kind in [SensorKind::Ph, SensorKind::Ec] {
            if let Err(e) = st.backend.set_temp_compensation(kind, temp) {
                tracing::warn!(sensor = %kind, error = %e, "temperature compensation failed");
            }
        }
    }

    /// Refresh the temperature (and with it the compensation push) unless a
    /// fresh entry already vouches for it.
    fn ensure_compensation(&self, st: &mut CacheState) {
        if st.temperature.fresh(self.now_ms(), self.ttl_ms).is_some() {
            return;
        }
        let _ = self.refresh(st, SensorKind::Temperature);
    }

    pub fn read_ph(&self) -> Result<f64> {
        let mut st = self.lock();
        if let Some(v) = st.ph.fresh(self.now_ms(), self.ttl_ms) {
            return Ok(v);
        }
        self.ensure_compensation(&mut st);
        self.refresh(&mut st, SensorKind::Ph)
    }

    pub fn read_ec(&self) -> Result<f64> {
        let mut st = self.lock();
        if let Some(v) = st.ec.fresh(self.now_ms(), self.ttl_ms) {
            return Ok(v);
        }
        self.ensure_compensation(&mut st);
        self.refresh(&mut st, SensorKind::Ec)
    }

    /// TDS in ppm. Served from a fresh EC reading when one exists, so the
    /// derived channel never disagrees with conductivity.
    pub fn read_tds(&self) -> Result<f64> {
        let mut st = self.lock();
        let now = self.now_ms();
        if let Some(v) = st.tds.fresh(now, self.ttl_ms) {
            return Ok(v);
        }
        if let Some(ec) = st.ec.fresh(now, self.ttl_ms) {
            let tds = ec * TDS_FROM_EC;
            let entry = st.entry_mut(SensorKind::Tds);
            entry.value = Some(tds);
            entry.read_at_ms = Some(now);
            entry.stale = false;
            return Ok(tds);
        }
        self.ensure_compensation(&mut st);
        self.refresh(&mut st, SensorKind::Tds)
    }

    pub fn read_temperature(&self) -> Result<f64> {
        let mut st = self.lock();
        if let Some(v) = st.temperature.fresh(self.now_ms(), self.ttl_ms) {
            return Ok(v);
        }
        self.refresh(&mut st, SensorKind::Temperature)
    }

    /// Drop the cached entry so the next read hits the probe. Used after
    /// sensor calibration, when the old reading is known wrong.
    pub fn invalidate(&self, kind: SensorKind) {
        let mut st = self.lock();
        let entry = st.entry_mut(kind);
        entry.read_at_ms = None;
        entry.stale = false;
        if kind == SensorKind::Ec {
            // The derived channel is wrong too.
            let tds = st.entry_mut(SensorKind::Tds);
            tds.read_at_ms = None;
        }
    }

    /// Non-querying snapshot of whatever is currently cached and fresh.
    pub fn snapshot(&self) -> SensorReading {
        let st = self.lock();
        let now = self.now_ms();
        SensorReading {
            ph: st.ph.fresh(now, self.ttl_ms),
            ec: st.ec.fresh(now, self.ttl_ms),
            tds: st.tds.fresh(now, self.ttl_ms),
            temperature: st.temperature.fresh(now, self.ttl_ms),
            taken_at_ms: unix_millis(),
        }
    }
}

//! Rolling 24-hour dose accounting per pump.
//!
//! Authorization and recording happen under one lock, as a reservation:
//! [`SafetyLedger::authorize`] books the dose immediately and hands back a
//! [`Grant`]. A failed actuation releases the grant so the headroom is not
//! consumed by chemical that never entered the reservoir.

use crate::error::{DosingError, Result};
use hydro_config::{PerPump, PumpName};
use hydro_traits::Clock;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

const DAY_MS: u64 = 24 * 60 * 60 * 1000;
/// Entries older than this are dropped entirely (trend reporting window).
const RETENTION_MS: u64 = 7 * DAY_MS;
/// Doses below this are not worth running the pump for.
pub const MIN_DOSE_ML: f64 = 0.1;

#[derive(Debug, Clone, Copy)]
struct UsageEntry {
    at_ms: u64,
    volume_ml: f64,
}

/// Proof that a dose was authorized and booked. Consumed by
/// [`SafetyLedger::release`] when the actuation fails; dropped (kept on the
/// books) when it succeeds.
#[derive(Debug)]
#[must_use = "a grant is already booked; release it if the dose did not happen"]
pub struct Grant {
    pub pump: PumpName,
    pub allowed_ml: f64,
    at_ms: u64,
}

pub struct SafetyLedger {
    clock: Arc<dyn Clock + Send + Sync>,
    epoch: Instant,
    inner: Mutex<LedgerState>,
}

struct LedgerState {
    caps_ml: PerPump<f64>,
    history: HashMap<PumpName, Vec<UsageEntry>>,
}

impl SafetyLedger {
    pub fn new(caps_ml: PerPump<f64>, clock: Arc<dyn Clock + Send + Sync>) -> Self {
        let epoch = clock.now();
        Self {
            clock,
            epoch,
            inner: Mutex::new(LedgerState {
                caps_ml,
                history: HashMap::new(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LedgerState> {
        match self.inner.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        }
    }

    /// Replace the daily caps (applied on config reload).
    pub fn set_caps(&self, caps_ml: PerPump<f64>) {
        self.lock().caps_ml = caps_ml;
    }

    /// Authorize a dose against the pump's rolling 24-hour cap and book it.
    ///
    /// Lenient clamp: a request over the remaining headroom is trimmed to
    /// the headroom rather than rejected outright. Only when the headroom
    /// itself drops under [`MIN_DOSE_ML`] does the request fail.
    pub fn authorize(&self, pump: PumpName, requested_ml: f64) -> Result<Grant> {
        if !(requested_ml.is_finite() && requested_ml > 0.0) {
            return Err(DosingError::State(format!(
                "dose volume must be > 0, got {requested_ml}"
            )));
        }
        let now = self.clock.ms_since(self.epoch);
        let mut st = self.lock();
        let cap = st.caps_ml.get(pump).ok_or_else(|| {
            DosingError::ConfigInvalid(format!("{pump} has no daily cap and cannot be dosed"))
        })?;
        let entries = st.history.entry(pump).or_default();
        prune(entries, now);
        let used: f64 = entries
            .iter()
            .filter(|e| now.saturating_sub(e.at_ms) < DAY_MS)
            .map(|e| e.volume_ml)
            .sum();
        let remaining = (cap - used).max(0.0);
        if remaining < MIN_DOSE_ML {
            return Err(DosingError::SafetyLimitExceeded {
                pump,
                requested_ml,
                remaining_ml: remaining,
            });
        }
        let allowed = requested_ml.min(remaining);
        if allowed < requested_ml {
            tracing::warn!(
                pump = %pump,
                requested_ml,
                allowed_ml = allowed,
                "dose clamped to remaining daily headroom"
            );
        }
        entries.push(UsageEntry {
            at_ms: now,
            volume_ml: allowed,
        });
        Ok(Grant {
            pump,
            allowed_ml: allowed,
            at_ms: now,
        })
    }

    /// Remove a booked grant after a failed actuation.
    pub fn release(&self, grant: Grant) {
        let mut st = self.lock();
        if let Some(entries) = st.history.get_mut(&grant.pump)
            && let Some(idx) = entries.iter().position(|e| {
                e.at_ms == grant.at_ms && (e.volume_ml - grant.allowed_ml).abs() < 1e-9
            })
        {
            entries.remove(idx);
        }
    }

    /// Total volume booked for a pump over the last 24 hours.
    pub fn used_last_24h(&self, pump: PumpName) -> f64 {
        let now = self.clock.ms_since(self.epoch);
        let st = self.lock();
        st.history
            .get(&pump)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|e| now.saturating_sub(e.at_ms) < DAY_MS)
                    .map(|e| e.volume_ml)
                    .sum()
            })
            .unwrap_or(0.0)
    }

    /// Remaining headroom under the 24-hour cap; `None` for pumps without one.
    pub fn remaining(&self, pump: PumpName) -> Option<f64> {
        let cap = self.lock().caps_ml.get(pump)?;
        Some((cap - self.used_last_24h(pump)).max(0.0))
    }
}

fn prune(entries: &mut Vec<UsageEntry>, now_ms: u64) {
    entries.retain(|e| now_ms.saturating_sub(e.at_ms) < RETENTION_MS);
}

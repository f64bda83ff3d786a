//! Pump actuation with enforced auto-stop.
//!
//! Every run is bounded: energizing a channel arms a dedicated timer thread
//! that de-energizes it when the duration elapses, parked on a cancellable
//! channel rather than a busy-wait. `stop_all` cancels every armed timer,
//! joins the threads and drives every channel low, so no code path leaves a
//! pump running unsupervised.

use crate::calibration::CalibrationStore;
use crate::error::{map_hw_error, DosingError, Result};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use hydro_config::{PolarityCfg, PumpCfg, PumpName};
use hydro_traits::{Clock, OutputBus};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Shortest commanded run. Flow through a peristaltic head is not
/// repeatable below this, so volume runs are floored rather than skipped.
pub const MIN_RUN: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PumpState {
    Idle,
    Running,
    /// The channel could not be de-energized; hardware needs attention.
    Fault,
}

#[derive(Debug, Clone, Serialize)]
pub struct PumpSnapshot {
    pub pump: PumpName,
    pub state: PumpState,
    /// Seconds the current run has been going, when `Running`.
    pub running_secs: Option<f64>,
}

/// Static wiring for one pump channel.
#[derive(Debug, Clone)]
pub struct ChannelCfg {
    pub pump: PumpName,
    pub channel: u8,
    pub max_run: Duration,
    pub polarity: PolarityCfg,
}

impl From<&PumpCfg> for ChannelCfg {
    fn from(p: &PumpCfg) -> Self {
        Self {
            pump: p.id,
            channel: p.channel,
            max_run: Duration::from_secs(p.max_run_secs),
            polarity: p.polarity,
        }
    }
}

fn level(polarity: PolarityCfg, on: bool) -> bool {
    match polarity {
        PolarityCfg::Normal => on,
        PolarityCfg::Inverted => !on,
    }
}

struct Slot {
    cfg: ChannelCfg,
    state: PumpState,
    started_at_ms: Option<u64>,
    /// Bumped per run; a stale timer firing after a newer run started is a
    /// no-op because its sequence no longer matches.
    run_seq: u64,
    timer: Option<(Sender<()>, JoinHandle<()>)>,
}

type Slots = Mutex<HashMap<PumpName, Slot>>;
type Outputs = Mutex<Box<dyn OutputBus + Send>>;

/// Completion handle for one timed run. The run finishes on its own; this
/// only lets a caller that needs sequencing (nutrient A before B) block
/// until the channel is released.
#[derive(Debug)]
pub struct RunHandle {
    pub pump: PumpName,
    pub duration: Duration,
    done: Receiver<()>,
}

impl RunHandle {
    /// Wait for the run to end, natural or cancelled. Returns `false` if
    /// the timer thread is somehow still alive past `duration + grace`.
    pub fn wait(&self, grace: Duration) -> bool {
        self.done
            .recv_timeout(self.duration.saturating_add(grace))
            .is_ok()
    }
}

pub struct PumpActuator {
    slots: Arc<Slots>,
    outputs: Arc<Outputs>,
    calibration: Arc<CalibrationStore>,
    clock: Arc<dyn Clock + Send + Sync>,
    epoch: Instant,
    order: Vec<PumpName>,
}

impl PumpActuator {
    pub fn new(
        outputs: Box<dyn OutputBus + Send>,
        channels: Vec<ChannelCfg>,
        calibration: Arc<CalibrationStore>,
        clock: Arc<dyn Clock + Send + Sync>,
    ) -> Self {
        let epoch = clock.now();
        let order: Vec<PumpName> = channels.iter().map(|c| c.pump).collect();
        let slots = channels
            .into_iter()
            .map(|cfg| {
                (
                    cfg.pump,
                    Slot {
                        cfg,
                        state: PumpState::Idle,
                        started_at_ms: None,
                        run_seq: 0,
                        timer: None,
                    },
                )
            })
            .collect();
        Self {
            slots: Arc::new(Mutex::new(slots)),
            outputs: Arc::new(Mutex::new(outputs)),
            calibration,
            clock,
            epoch,
            order,
        }
    }

    fn now_ms(&self) -> u64 {
        self.clock.ms_since(self.epoch)
    }

    /// Start a timed run. Returns immediately; the armed timer thread stops
    /// the pump when `duration` elapses.
    pub fn run_for(&self, pump: PumpName, duration: Duration) -> Result<RunHandle> {
        if duration.is_zero() {
            return Err(DosingError::State(format!("zero-length run for {pump}")));
        }
        let mut slots = lock(&self.slots);
        let slot = slots
            .get_mut(&pump)
            .ok_or_else(|| DosingError::State(format!("{pump} is not configured")))?;
        if duration > slot.cfg.max_run {
            return Err(DosingError::State(format!(
                "run of {:.1}s exceeds {}s max for {pump}",
                duration.as_secs_f64(),
                slot.cfg.max_run.as_secs()
            )));
        }
        if slot.state == PumpState::Running {
            return Err(DosingError::State(format!("{pump} is already running")));
        }

        {
            let mut out = lock(&self.outputs);
            if let Err(e) = out.set_output(slot.cfg.channel, level(slot.cfg.polarity, true)) {
                // Drive low in case the write half-landed.
                let _ = out.set_output(slot.cfg.channel, level(slot.cfg.polarity, false));
                return Err(DosingError::PumpFault {
                    pump,
                    message: map_hw_error(e).to_string(),
                });
            }
        }

        slot.run_seq += 1;
        let seq = slot.run_seq;
        slot.state = PumpState::Running;
        slot.started_at_ms = Some(self.now_ms());

        let (cancel_tx, cancel_rx) = bounded::<()>(1);
        let (done_tx, done_rx) = bounded::<()>(1);
        let timer_slots = self.slots.clone();
        let timer_outputs = self.outputs.clone();
        let spawn = std::thread::Builder::new()
            .name(format!("pump-timer-{pump}"))
            .spawn(move || {
                let cancelled = !matches!(
                    cancel_rx.recv_timeout(duration),
                    Err(RecvTimeoutError::Timeout)
                );
                if !cancelled {
                    finish_run(&timer_slots, &timer_outputs, pump, seq);
                }
                let _ = done_tx.send(());
            });
        match spawn {
            Ok(handle) => {
                slot.timer = Some((cancel_tx, handle));
                tracing::debug!(pump = %pump, secs = duration.as_secs_f64(), "pump started");
                Ok(RunHandle {
                    pump,
                    duration,
                    done: done_rx,
                })
            }
            Err(e) => {
                // No timer means no auto-stop; shut the channel down now.
                let _ = lock(&self.outputs)
                    .set_output(slot.cfg.channel, level(slot.cfg.polarity, false));
                slot.state = PumpState::Idle;
                slot.started_at_ms = None;
                Err(DosingError::State(format!("spawn pump timer: {e}")))
            }
        }
    }

    /// Seconds of runtime needed for a volume at the current calibrated
    /// flow rate, before the minimum-run floor is applied.
    pub fn duration_for_volume(&self, pump: PumpName, volume_ml: f64) -> Result<Duration> {
        if !(volume_ml.is_finite() && volume_ml > 0.0) {
            return Err(DosingError::State(format!(
                "dose volume must be > 0, got {volume_ml}"
            )));
        }
        let rate = self
            .calibration
            .flow_rate(pump)
            .filter(|r| *r > 0.0)
            .ok_or_else(|| {
                DosingError::InvalidCalibration(format!("{pump} has no calibrated flow rate"))
            })?;
        Ok(Duration::from_secs_f64(volume_ml / rate))
    }

    /// Dispense a volume by timed run, floored at [`MIN_RUN`].
    pub fn run_volume(&self, pump: PumpName, volume_ml: f64) -> Result<RunHandle> {
        let duration = self.duration_for_volume(pump, volume_ml)?.max(MIN_RUN);
        self.run_for(pump, duration)
    }

    /// Cancel every armed timer, join the timer threads, then force every
    /// channel to its de-energized level. Idempotent; safe to call from
    /// signal handlers' shutdown path.
    pub fn stop_all(&self) -> Result<()> {
        let handles: Vec<JoinHandle<()>> = {
            let mut slots = lock(&self.slots);
            slots
                .values_mut()
                .filter_map(|s| s.timer.take())
                .map(|(cancel, handle)| {
                    let _ = cancel.try_send(());
                    handle
                })
                .collect()
        };
        for h in handles {
            let _ = h.join();
        }

        let mut failures: Vec<String> = Vec::new();
        let mut slots = lock(&self.slots);
        let mut out = lock(&self.outputs);
        for slot in slots.values_mut() {
            match out.set_output(slot.cfg.channel, level(slot.cfg.polarity, false)) {
                Ok(()) => {
                    slot.state = PumpState::Idle;
                    slot.started_at_ms = None;
                }
                Err(e) => {
                    slot.state = PumpState::Fault;
                    failures.push(format!("{}: {}", slot.cfg.pump, map_hw_error(e)));
                }
            }
        }
        if failures.is_empty() {
            tracing::info!("all pumps stopped");
            Ok(())
        } else {
            tracing::error!(failures = ?failures, "stop_all could not release every channel");
            Err(DosingError::Hardware(format!(
                "stop_all: {}",
                failures.join("; ")
            )))
        }
    }

    pub fn snapshot(&self, pump: PumpName) -> Option<PumpSnapshot> {
        let slots = lock(&self.slots);
        let slot = slots.get(&pump)?;
        Some(self.snapshot_of(slot))
    }

    pub fn snapshots(&self) -> Vec<PumpSnapshot> {
        let slots = lock(&self.slots);
        self.order
            .iter()
            .filter_map(|p| slots.get(p))
            .map(|s| self.snapshot_of(s))
            .collect()
    }

    pub fn any_running(&self) -> bool {
        lock(&self.slots)
            .values()
            .any(|s| s.state == PumpState::Running)
    }

    fn snapshot_of(&self, slot: &Slot) -> PumpSnapshot {
        let running_secs = match (slot.state, slot.started_at_ms) {
            (PumpState::Running, Some(at)) => {
                Some(self.now_ms().saturating_sub(at) as f64 / 1000.0)
            }
            _ => None,
        };
        PumpSnapshot {
            pump: slot.cfg.pump,
            state: slot.state,
            running_secs,
        }
    }
}

impl Drop for PumpActuator {
    fn drop(&mut self) {
        if let Err(e) = self.stop_all() {
            tracing::error!(error = %e, "pump shutdown on drop failed");
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match m.lock() {
        Ok(g) => g,
        Err(p) => p.into_inner(),
    }
}

fn finish_run(slots: &Slots, outputs: &Outputs, pump: PumpName, seq: u64) {
    let mut slots = lock(slots);
    let Some(slot) = slots.get_mut(&pump) else {
        return;
    };
    if slot.run_seq != seq || slot.state != PumpState::Running {
        return;
    }
    match lock(outputs).set_output(slot.cfg.channel, level(slot.cfg.polarity, false)) {
        Ok(()) => {
            slot.state = PumpState::Idle;
            tracing::debug!(pump = %pump, "pump auto-stopped");
        }
        Err(e) => {
            slot.state = PumpState::Fault;
            tracing::error!(pump = %pump, error = %e, "auto-stop could not release channel");
        }
    }
    slot.started_at_ms = None;
    slot.timer = None;
}

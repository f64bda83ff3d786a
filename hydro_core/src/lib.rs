#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
#![cfg_attr(
    all(not(debug_assertions), not(test)),
    deny(clippy::all, clippy::pedantic, clippy::nursery)
)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]
//! Closed-loop reservoir dosing: cached sensing, banded dose decisions,
//! timed pump actuation under rolling daily caps, and calibration state.
//!
//! The pieces compose through [`System`], which owns the wiring; embedders
//! that need finer control can assemble [`SensorCache`], [`PumpActuator`],
//! [`SafetyLedger`], [`CalibrationStore`] and [`DosingEngine`] directly.
//! Hardware is reached only through the `hydro_traits` buses, so everything
//! here runs unchanged against the simulator.

pub mod actuator;
pub mod calibration;
pub mod engine;
pub mod error;
pub mod events;
pub mod ledger;
pub mod sensors;
pub mod system;

pub use actuator::{ChannelCfg, PumpActuator, PumpSnapshot, PumpState, MIN_RUN};
pub use calibration::{CalPoint, CalibrationSink, CalibrationStore, NullSink};
pub use engine::{
    band_factor, night_window_active, BranchOutcome, CycleReport, DilutionPlan, DoseRecord,
    DosingEngine, EngineCfg, EngineState,
};
pub use error::{DosingError, Result};
pub use events::{DoseEvent, EventSink, MemorySink, TracingSink};
pub use ledger::{SafetyLedger, MIN_DOSE_ML};
pub use sensors::{SensorCache, SensorReading, TDS_FROM_EC};
pub use system::{System, SystemStatus};

// Convenience re-exports so embedders rarely need the leaf crates directly.
pub use hydro_config::PumpName;
pub use hydro_traits::SensorKind;

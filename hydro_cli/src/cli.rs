//! CLI argument definitions and shared statics.

use clap::{ArgAction, Parser, Subcommand};
use hydro_config::PumpName;
use hydro_core::CalPoint;
use hydro_traits::SensorKind;
use std::path::PathBuf;
use std::sync::OnceLock;

pub static FILE_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();
/// Whether the user asked for JSON output (controls structured error output).
pub static JSON_MODE: OnceLock<bool> = OnceLock::new();

#[derive(Parser, Debug)]
#[command(name = "hydrod", version, about = "Hydroponic reservoir dosing controller")]
pub struct Cli {
    /// Path to config TOML
    #[arg(long, value_name = "FILE", default_value = "etc/hydro.toml")]
    pub config: PathBuf,

    /// Where the calibration profile is persisted
    #[arg(long, value_name = "FILE", default_value = "etc/calibration.toml")]
    pub calibration: PathBuf,

    /// Log as JSON lines instead of pretty
    #[arg(long, action = ArgAction::SetTrue)]
    pub json: bool,

    /// Console log level (error|warn|info|debug|trace)
    #[arg(long = "log-level", value_name = "LEVEL", default_value = "info")]
    pub log_level: String,

    /// Command to execute
    #[command(subcommand)]
    pub cmd: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the dosing loop until interrupted
    Run,
    /// Execute a single dosing cycle and exit
    Cycle,
    /// Print sensor readings, pump states and 24 h usage
    Status,
    /// Manually dose a fixed volume through one pump
    Dose {
        /// Pump: ph_up|ph_down|nutrient_a|nutrient_b
        #[arg(long)]
        pump: PumpName,
        /// Volume in milliliters
        #[arg(long, value_name = "ML")]
        ml: f64,
    },
    /// Plan (and with --apply, dose) nutrient replenishment after adding
    /// fresh water
    Dilute {
        /// Fresh water added, in liters
        #[arg(long, value_name = "LITERS")]
        added: f64,
        /// Actually dose the computed amounts instead of only planning
        #[arg(long, action = ArgAction::SetTrue)]
        apply: bool,
    },
    /// Catch-test calibration: optionally run the pump, then derive its
    /// flow rate from the measured volume
    CalibratePump {
        #[arg(long)]
        pump: PumpName,
        /// Seconds the catch test ran (also runs the pump unless --no-run)
        #[arg(long, value_name = "SECS")]
        secs: f64,
        /// Volume collected in the measuring cylinder
        #[arg(long, value_name = "ML")]
        measured_ml: f64,
        /// Skip running the pump; only record the measurement
        #[arg(long, action = ArgAction::SetTrue)]
        no_run: bool,
    },
    /// Record a sensor reference point (ph: low|mid|high, ec: dry|low|high)
    CalibrateSensor {
        /// Sensor: ph|ec|temperature
        #[arg(long)]
        sensor: SensorKind,
        #[arg(long)]
        point: CalPoint,
        /// Reference solution value
        #[arg(long)]
        value: f64,
    },
    /// Quick health check (config parses, backend answers, pumps idle)
    SelfCheck,
}

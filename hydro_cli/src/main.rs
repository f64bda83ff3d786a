mod cli;
mod error_fmt;

use clap::Parser;
use cli::{Cli, Commands, FILE_GUARD, JSON_MODE};
use error_fmt::{exit_code_for_error, format_error_json, humanize};
use eyre::WrapErr;
use hydro_config::{Config, PumpName};
use hydro_core::{BranchOutcome, CalibrationSink, System, TracingSink};
use hydro_hardware::SimulatedBackend;
use hydro_traits::{Clock, MonotonicClock, OutputBus};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn main() {
    let code = match run() {
        Ok(()) => 0,
        Err(err) => {
            if JSON_MODE.get().copied().unwrap_or(false) {
                eprintln!("{}", format_error_json(&err));
            } else {
                eprintln!("{}", humanize(&err));
            }
            exit_code_for_error(&err)
        }
    };
    std::process::exit(code);
}

fn run() -> eyre::Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    let _ = JSON_MODE.set(cli.json);

    let cfg = load_config(&cli.config, &cli.calibration)?;
    init_logging(&cli, &cfg)?;

    let system = build_system(&cli, &cfg)?;
    dispatch(&cli, &system)
}

/// Load the config (defaults when the file is absent) and fold in the
/// persisted calibration profile if one exists.
fn load_config(config_path: &Path, calibration_path: &Path) -> eyre::Result<Config> {
    let mut cfg = if config_path.exists() {
        hydro_config::load_file(config_path)
            .map_err(|e| hydro_core::DosingError::ConfigInvalid(e.to_string()))?
    } else {
        tracing::debug!(path = %config_path.display(), "no config file; using defaults");
        Config::default()
    };
    if cfg.calibration.is_none() && calibration_path.exists() {
        cfg.calibration = Some(
            hydro_config::load_profile(calibration_path)
                .wrap_err("load persisted calibration profile")?,
        );
    }
    Ok(cfg)
}

fn init_logging(cli: &Cli, cfg: &Config) -> eyre::Result<()> {
    use tracing_subscriber::{fmt, EnvFilter};

    let level = cfg.logging.level.as_deref().unwrap_or(&cli.log_level);
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .wrap_err_with(|| format!("invalid log level: {level}"))?;

    if let Some(file) = &cfg.logging.file {
        let path = PathBuf::from(file);
        let dir = path.parent().unwrap_or(Path::new("."));
        let name = path.file_name().map(std::ffi::OsStr::to_owned).unwrap_or_default();
        let appender = match cfg.logging.rotation.as_deref() {
            Some("daily") => tracing_appender::rolling::daily(dir, name),
            Some("hourly") => tracing_appender::rolling::hourly(dir, name),
            _ => tracing_appender::rolling::never(dir, name),
        };
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let _ = FILE_GUARD.set(guard);
        // File logs are always JSON lines; the console stays human-readable
        // unless --json.
        fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(writer)
            .init();
        return Ok(());
    }

    if cli.json {
        fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
    Ok(())
}

/// Calibration persistence: profile TOML next to the config, rewritten
/// atomically after every successful calibration.
struct FileSink {
    path: PathBuf,
}

impl CalibrationSink for FileSink {
    fn persist(&self, profile: &hydro_config::CalibrationProfile) -> eyre::Result<()> {
        if let Some(dir) = self.path.parent()
            && !dir.as_os_str().is_empty()
        {
            std::fs::create_dir_all(dir)
                .wrap_err_with(|| format!("create {}", dir.display()))?;
        }
        hydro_config::save_profile(&self.path, profile)
    }
}

fn build_system(cli: &Cli, cfg: &Config) -> eyre::Result<System> {
    let sim = SimulatedBackend::new();

    #[cfg(all(feature = "hardware", target_os = "linux"))]
    let outputs: Box<dyn OutputBus + Send> = {
        let table = if cfg.pumps.is_empty() {
            hydro_config::default_pump_table()
        } else {
            cfg.pumps.clone()
        };
        let channels: Vec<u8> = table.iter().map(|p| p.channel).collect();
        Box::new(
            hydro_hardware::gpio::GpioOutputs::new(&channels)
                .map_err(|e| eyre::eyre!("claim gpio outputs: {e}"))?,
        )
    };
    #[cfg(not(all(feature = "hardware", target_os = "linux")))]
    let outputs: Box<dyn OutputBus + Send> = Box::new(sim.clone());

    let system = System::new(
        cfg,
        outputs,
        Box::new(sim),
        Arc::new(TracingSink),
        Box::new(FileSink {
            path: cli.calibration.clone(),
        }),
        Arc::new(MonotonicClock::new()),
    )
    .map_err(eyre::Report::new)?;
    Ok(system)
}

fn emit<T: Serialize>(value: &T, text: String) -> eyre::Result<()> {
    if JSON_MODE.get().copied().unwrap_or(false) {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        println!("{text}");
    }
    Ok(())
}

fn dispatch(cli: &Cli, system: &System) -> eyre::Result<()> {
    match &cli.cmd {
        Commands::Run => {
            let shutdown = Arc::new(AtomicBool::new(false));
            let flag = shutdown.clone();
            ctrlc::set_handler(move || {
                tracing::info!("interrupt received; stopping");
                flag.store(true, Ordering::Relaxed);
            })
            .wrap_err("install signal handler")?;
            system.run_loop(&shutdown, &MonotonicClock::new());
            Ok(())
        }
        Commands::Cycle => {
            let report = system.run_cycle();
            let text = report.message.clone();
            emit(&report, text)?;
            // Let in-flight runs finish before System drops and cancels them.
            wait_for_idle(system);
            Ok(())
        }
        Commands::Status => {
            let status = fresh_status(system);
            let text = render_status(&status);
            emit(&status, text)
        }
        Commands::Dose { pump, ml } => {
            let record = system.manual_dose(*pump, *ml).map_err(eyre::Report::new)?;
            let text = format!(
                "dosed {:.2} ml of {} over {:.1}s",
                record.volume_ml, record.pump, record.run_secs
            );
            MonotonicClock::new().sleep(Duration::from_secs_f64(record.run_secs) + GRACE);
            emit(&record, text)
        }
        Commands::Dilute { added, apply } => {
            let plan = system.calculate_dilution(*added).map_err(eyre::Report::new)?;
            if !apply {
                let text = format!(
                    "adding {:.1} L drops EC {:.0} -> {:.0}; replenish with {:.2} ml A + {:.2} ml B (--apply to dose)",
                    plan.added_water_liters,
                    plan.current_ec,
                    plan.diluted_ec,
                    plan.nutrient_a_ml,
                    plan.nutrient_b_ml
                );
                return emit(&plan, text);
            }
            let outcome = system
                .compensate_for_dilution(*added)
                .map_err(eyre::Report::new)?;
            wait_for_idle(system);
            let text = match &outcome {
                BranchOutcome::Dosed { doses } => {
                    let parts: Vec<String> = doses
                        .iter()
                        .map(|d| format!("{} {:.2} ml", d.pump, d.volume_ml))
                        .collect();
                    format!("replenished: {}", parts.join(", "))
                }
                BranchOutcome::WithinTolerance => "nothing to replenish".to_string(),
                BranchOutcome::DilutionRequired { current, target } => {
                    format!("EC still above target ({current:.0} > {target:.0})")
                }
                BranchOutcome::Failed { reason, .. } => {
                    format!("replenishment incomplete: {reason}")
                }
            };
            emit(&outcome, text)
        }
        Commands::CalibratePump {
            pump,
            secs,
            measured_ml,
            no_run,
        } => {
            if *pump == PumpName::Circulation {
                return Err(eyre::Report::new(hydro_core::DosingError::InvalidCalibration(
                    "circulation pump is not a metering pump".into(),
                )));
            }
            if !no_run {
                system
                    .prime_pump(*pump, Duration::from_secs_f64(*secs))
                    .map_err(eyre::Report::new)?;
            }
            let rate = system
                .calibrate_pump(*pump, *measured_ml, *secs)
                .map_err(eyre::Report::new)?;
            emit(
                &serde_json::json!({ "pump": pump.as_str(), "flow_rate_ml_per_sec": rate }),
                format!("{pump}: {rate:.3} ml/s"),
            )
        }
        Commands::CalibrateSensor {
            sensor,
            point,
            value,
        } => {
            system
                .calibrate_sensor(*sensor, *point, *value)
                .map_err(eyre::Report::new)?;
            emit(
                &serde_json::json!({
                    "sensor": sensor.as_str(),
                    "point": point.as_str(),
                    "value": value,
                }),
                format!("{sensor} {} point recorded at {value}", point.as_str()),
            )
        }
        Commands::SelfCheck => {
            let status = fresh_status(system);
            let sensors_ok = status.reading.ph.is_some()
                && status.reading.ec.is_some()
                && status.reading.temperature.is_some();
            let pumps_idle = status.pumps.iter().all(|p| p.running_secs.is_none());
            let healthy = sensors_ok && pumps_idle;
            emit(
                &serde_json::json!({
                    "healthy": healthy,
                    "sensors_ok": sensors_ok,
                    "pumps_idle": pumps_idle,
                }),
                format!(
                    "self-check: {} (sensors {}, pumps {})",
                    if healthy { "ok" } else { "failed" },
                    if sensors_ok { "ok" } else { "silent" },
                    if pumps_idle { "idle" } else { "busy" },
                ),
            )?;
            if healthy {
                Ok(())
            } else {
                Err(eyre::Report::new(hydro_core::DosingError::Hardware(
                    "self-check failed".into(),
                )))
            }
        }
    }
}

const GRACE: Duration = Duration::from_millis(300);

/// Force fresh sensor reads, then snapshot.
fn fresh_status(system: &System) -> hydro_core::SystemStatus {
    let _ = system.read_now();
    system.status()
}

/// Block until no pump is running so process exit does not cancel a dose.
fn wait_for_idle(system: &System) {
    let clock = MonotonicClock::new();
    let deadline = clock.now() + Duration::from_secs(120);
    while system.any_pump_running() && clock.now() < deadline {
        clock.sleep(Duration::from_millis(50));
    }
}

fn render_status(status: &hydro_core::SystemStatus) -> String {
    let mut out = String::new();
    let r = &status.reading;
    let fmt_opt = |v: Option<f64>, unit: &str| match v {
        Some(v) => format!("{v:.2}{unit}"),
        None => "n/a".to_string(),
    };
    out.push_str(&format!("engine: {}\n", status.engine_state));
    out.push_str(&format!(
        "reservoir: {:.1} L (targets pH {:.2}, EC {:.0})\n",
        status.reservoir_liters, status.target_ph, status.target_ec
    ));
    out.push_str(&format!(
        "sensors: pH {}  EC {}  TDS {}  temp {}\n",
        fmt_opt(r.ph, ""),
        fmt_opt(r.ec, " uS/cm"),
        fmt_opt(r.tds, " ppm"),
        fmt_opt(r.temperature, " C"),
    ));
    for p in &status.pumps {
        out.push_str(&format!("pump {}: {:?}\n", p.pump, p.state));
    }
    for u in &status.usage {
        out.push_str(&format!(
            "24h {}: {:.1} ml used, {:.1} ml left\n",
            u.pump, u.used_24h_ml, u.remaining_24h_ml
        ));
    }
    out.pop();
    out
}

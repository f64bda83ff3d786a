use hydro_config::{CalibrationProfile, PolarityCfg, PumpName};
use hydro_core::actuator::{ChannelCfg, PumpActuator, PumpState, MIN_RUN};
use hydro_core::calibration::{CalibrationStore, NullSink};
use hydro_core::DosingError;
use hydro_hardware::{SimHandle, SimulatedBackend};
use hydro_traits::MonotonicClock;
use std::sync::Arc;
use std::time::Duration;

const PH_UP_CH: u8 = 5;
const PH_DOWN_CH: u8 = 6;

fn channel(pump: PumpName, ch: u8, polarity: PolarityCfg) -> ChannelCfg {
    ChannelCfg {
        pump,
        channel: ch,
        max_run: Duration::from_secs(30),
        polarity,
    }
}

fn actuator() -> (PumpActuator, SimHandle) {
    actuator_with(vec![
        channel(PumpName::PhUp, PH_UP_CH, PolarityCfg::Normal),
        channel(PumpName::PhDown, PH_DOWN_CH, PolarityCfg::Normal),
    ])
}

fn actuator_with(channels: Vec<ChannelCfg>) -> (PumpActuator, SimHandle) {
    let backend = SimulatedBackend::new();
    let handle = backend.handle();
    // Profile defaults to 1.0 ml/s everywhere.
    let calibration = Arc::new(CalibrationStore::new(
        CalibrationProfile::default(),
        Box::new(NullSink),
    ));
    let actuator = PumpActuator::new(
        Box::new(backend),
        channels,
        calibration,
        Arc::new(MonotonicClock::new()),
    );
    (actuator, handle)
}

#[test]
fn second_start_on_running_pump_is_rejected() {
    let (actuator, sim) = actuator();
    let _run = actuator
        .run_for(PumpName::PhUp, Duration::from_secs(5))
        .unwrap();
    assert!(sim.output(PH_UP_CH));

    let err = actuator
        .run_for(PumpName::PhUp, Duration::from_secs(1))
        .unwrap_err();
    assert!(matches!(err, DosingError::State(_)));
    // The rejection touched no hardware: one energize, nothing else.
    assert_eq!(sim.output_log(), vec![(PH_UP_CH, true)]);

    actuator.stop_all().unwrap();
    assert!(!sim.output(PH_UP_CH));
}

#[test]
fn over_max_run_is_rejected_without_hardware_action() {
    let (actuator, sim) = actuator();
    let err = actuator
        .run_for(PumpName::PhUp, Duration::from_secs(31))
        .unwrap_err();
    assert!(matches!(err, DosingError::State(_)));
    assert!(sim.output_log().is_empty());
}

#[test]
fn auto_stop_releases_the_channel() {
    let (actuator, sim) = actuator();
    let run = actuator
        .run_for(PumpName::PhUp, Duration::from_millis(100))
        .unwrap();
    assert!(run.wait(Duration::from_secs(2)));
    assert!(!sim.output(PH_UP_CH));
    let snap = actuator.snapshot(PumpName::PhUp).unwrap();
    assert_eq!(snap.state, PumpState::Idle);
    assert_eq!(sim.output_log(), vec![(PH_UP_CH, true), (PH_UP_CH, false)]);
}

#[test]
fn volume_runs_floor_at_the_minimum() {
    let (actuator, _sim) = actuator();
    // 0.1 ml at 1 ml/s is 100 ms of runtime, under the floor.
    let pre_floor = actuator
        .duration_for_volume(PumpName::PhUp, 0.1)
        .unwrap();
    assert_eq!(pre_floor, Duration::from_millis(100));

    let run = actuator.run_volume(PumpName::PhUp, 0.1).unwrap();
    assert_eq!(run.duration, MIN_RUN);
    assert!(run.wait(Duration::from_secs(2)));
}

#[test]
fn volume_duration_follows_calibrated_rate() {
    let backend = SimulatedBackend::new();
    let calibration = Arc::new(CalibrationStore::new(
        CalibrationProfile::default(),
        Box::new(NullSink),
    ));
    let actuator = PumpActuator::new(
        Box::new(backend),
        vec![channel(PumpName::PhUp, PH_UP_CH, PolarityCfg::Normal)],
        calibration.clone(),
        Arc::new(MonotonicClock::new()),
    );

    calibration.calibrate_pump(PumpName::PhUp, 12.0, 6.0).unwrap();
    let d = actuator.duration_for_volume(PumpName::PhUp, 5.0).unwrap();
    assert!((d.as_secs_f64() - 2.5).abs() < 1e-9);
}

#[test]
fn stop_all_cancels_pending_timers() {
    let (actuator, sim) = actuator();
    let run = actuator
        .run_for(PumpName::PhUp, Duration::from_secs(20))
        .unwrap();
    let _run2 = actuator
        .run_for(PumpName::PhDown, Duration::from_secs(20))
        .unwrap();
    actuator.stop_all().unwrap();

    assert!(!sim.output(PH_UP_CH));
    assert!(!sim.output(PH_DOWN_CH));
    assert!(!actuator.any_running());
    // The cancelled timer signalled completion rather than waiting 20 s.
    assert!(run.wait(Duration::ZERO));

    // Idempotent.
    actuator.stop_all().unwrap();
}

#[test]
fn inverted_polarity_swaps_levels() {
    let (actuator, sim) = actuator_with(vec![channel(
        PumpName::PhUp,
        PH_UP_CH,
        PolarityCfg::Inverted,
    )]);
    let run = actuator
        .run_for(PumpName::PhUp, Duration::from_millis(100))
        .unwrap();
    assert!(run.wait(Duration::from_secs(2)));
    // Energized = line low, released = line high.
    assert_eq!(sim.output_log()[0], (PH_UP_CH, false));
    assert_eq!(*sim.output_log().last().unwrap(), (PH_UP_CH, true));
}

#[test]
fn failed_energize_reports_pump_fault_and_stays_idle() {
    let (actuator, sim) = actuator();
    sim.fail_outputs(true);
    let err = actuator
        .run_for(PumpName::PhUp, Duration::from_secs(1))
        .unwrap_err();
    assert!(matches!(err, DosingError::PumpFault { .. }));
    let snap = actuator.snapshot(PumpName::PhUp).unwrap();
    assert_eq!(snap.state, PumpState::Idle);

    sim.fail_outputs(false);
    // Recoverable: the next run works.
    let run = actuator
        .run_for(PumpName::PhUp, Duration::from_millis(100))
        .unwrap();
    assert!(run.wait(Duration::from_secs(2)));
}

#[test]
fn unknown_pump_is_rejected() {
    let (actuator, _sim) = actuator();
    assert!(matches!(
        actuator.run_for(PumpName::Circulation, Duration::from_secs(1)),
        Err(DosingError::State(_))
    ));
}

#[test]
fn drop_forces_everything_low() {
    let backend = SimulatedBackend::new();
    let sim = backend.handle();
    {
        let calibration = Arc::new(CalibrationStore::new(
            CalibrationProfile::default(),
            Box::new(NullSink),
        ));
        let actuator = PumpActuator::new(
            Box::new(backend),
            vec![channel(PumpName::PhUp, PH_UP_CH, PolarityCfg::Normal)],
            calibration,
            Arc::new(MonotonicClock::new()),
        );
        let _run = actuator
            .run_for(PumpName::PhUp, Duration::from_secs(20))
            .unwrap();
        assert!(sim.output(PH_UP_CH));
    }
    assert!(!sim.output(PH_UP_CH));
}

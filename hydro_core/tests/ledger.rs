use hydro_config::{PerPump, PumpName};
use hydro_core::ledger::SafetyLedger;
use hydro_core::DosingError;
use hydro_traits::clock::test_clock::TestClock;
use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;

const CAP: f64 = 100.0;

fn ledger_with_cap() -> (SafetyLedger, Arc<TestClock>) {
    let clock = Arc::new(TestClock::new());
    let caps = PerPump {
        ph_up: CAP,
        ph_down: CAP,
        nutrient_a: CAP,
        nutrient_b: CAP,
    };
    (SafetyLedger::new(caps, clock.clone()), clock)
}

#[test]
fn sums_only_the_last_24_hours() {
    let (ledger, clock) = ledger_with_cap();
    let _g = ledger.authorize(PumpName::NutrientA, 40.0).unwrap();
    clock.advance(Duration::from_secs(12 * 3600));
    let _g = ledger.authorize(PumpName::NutrientA, 40.0).unwrap();
    assert!((ledger.used_last_24h(PumpName::NutrientA) - 80.0).abs() < 1e-9);

    clock.advance(Duration::from_secs(13 * 3600));
    // First entry is now 25 h old.
    assert!((ledger.used_last_24h(PumpName::NutrientA) - 40.0).abs() < 1e-9);
}

#[test]
fn per_pump_accounting_is_independent() {
    let (ledger, _clock) = ledger_with_cap();
    let _g = ledger.authorize(PumpName::PhUp, CAP).unwrap();
    assert!(ledger.authorize(PumpName::PhUp, 5.0).is_err());
    assert!(ledger.authorize(PumpName::PhDown, 5.0).is_ok());
}

#[test]
fn rejection_carries_context() {
    let (ledger, _clock) = ledger_with_cap();
    let _g = ledger.authorize(PumpName::PhUp, CAP).unwrap();
    match ledger.authorize(PumpName::PhUp, 7.5) {
        Err(DosingError::SafetyLimitExceeded {
            pump,
            requested_ml,
            remaining_ml,
        }) => {
            assert_eq!(pump, PumpName::PhUp);
            assert!((requested_ml - 7.5).abs() < 1e-9);
            assert!(remaining_ml < 0.1);
        }
        other => panic!("expected SafetyLimitExceeded, got {other:?}"),
    }
}

proptest! {
    /// No interleaving of doses and waits can push 24 h usage past the cap.
    #[test]
    fn daily_cap_never_exceeded(
        ops in prop::collection::vec((0.1f64..60.0, 0u64..(8 * 3600)), 1..60)
    ) {
        let (ledger, clock) = ledger_with_cap();
        for (volume, advance_secs) in ops {
            clock.advance(Duration::from_secs(advance_secs));
            match ledger.authorize(PumpName::NutrientB, volume) {
                Ok(grant) => {
                    prop_assert!(grant.allowed_ml <= volume + 1e-9);
                    prop_assert!(grant.allowed_ml > 0.0);
                }
                Err(DosingError::SafetyLimitExceeded { remaining_ml, .. }) => {
                    prop_assert!(remaining_ml < 0.1);
                }
                Err(other) => prop_assert!(false, "unexpected error: {other}"),
            }
            let used = ledger.used_last_24h(PumpName::NutrientB);
            prop_assert!(used <= CAP + 1e-6, "24h usage {used} exceeded cap {CAP}");
        }
    }
}

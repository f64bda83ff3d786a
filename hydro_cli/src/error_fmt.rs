//! Human-readable error descriptions, stable exit codes and structured
//! JSON error formatting.

use hydro_core::DosingError;

/// Map an eyre::Report to a human-readable explanation with likely causes
/// and fix hints.
pub fn humanize(err: &eyre::Report) -> String {
    if let Some(de) = err.downcast_ref::<DosingError>() {
        return match de {
            DosingError::SensorUnavailable(kind) => format!(
                "What happened: The {kind} probe did not answer.\nLikely causes: Probe unplugged, wrong bus address, or the probe needs conditioning.\nHow to fix: Check the probe cabling and run `hydrod status` to see which sensors respond."
            ),
            DosingError::PumpFault { pump, message } => format!(
                "What happened: The {pump} pump channel failed ({message}).\nLikely causes: Relay wiring fault or GPIO permissions.\nHow to fix: Verify the channel wiring in [[pumps]] and that the process may drive GPIO."
            ),
            DosingError::SafetyLimitExceeded { pump, requested_ml, remaining_ml } => format!(
                "What happened: Dosing {requested_ml:.1} ml of {pump} would pass the 24 h safety cap ({remaining_ml:.1} ml headroom left).\nLikely causes: Repeated dosing without the reservoir responding, or a cap set too low.\nHow to fix: Investigate why the reservoir is not converging before raising safety.daily_caps_ml."
            ),
            DosingError::InvalidCalibration(msg) => format!(
                "What happened: Calibration was rejected ({msg}).\nHow to fix: Re-run the catch test with a positive measured volume and elapsed time."
            ),
            DosingError::ConfigInvalid(msg) => format!(
                "What happened: Invalid configuration ({msg}).\nLikely causes: Missing or out-of-range values in the TOML.\nHow to fix: Edit the config file, then rerun. Every key is optional; start from an empty file and add overrides."
            ),
            DosingError::Timeout => {
                "What happened: A hardware operation timed out.\nLikely causes: Bus contention or a probe that stopped answering.\nHow to fix: Raise sensors.read_timeout_ms or check the wiring.".to_string()
            }
            DosingError::Hardware(msg) => format!(
                "What happened: Hardware error ({msg}).\nHow to fix: Check wiring and power, then re-run with --log-level=debug."
            ),
            DosingError::State(msg) => format!(
                "What happened: The operation is not valid right now ({msg}).\nHow to fix: Check `hydrod status`; another run may be in progress."
            ),
        };
    }

    // String-based heuristics for errors coming from init or config
    let msg = err.to_string();
    let lower = msg.to_ascii_lowercase();

    if lower.contains("read config") || lower.contains("parse config") {
        return "What happened: The config file could not be read or parsed.\nLikely causes: Wrong --config path or malformed TOML.\nHow to fix: Point --config at a valid TOML file, or omit it to run on defaults.".to_string();
    }

    // Generic fallback
    let mut cause = String::new();
    if let Some(src) = err.chain().nth(1) {
        cause = format!(" Cause: {src}");
    }
    format!(
        "Something went wrong.{cause}\nHow to fix: Re-run with --log-level=debug for details. Original: {msg}"
    )
}

/// Stable exit codes per error class; unknown errors return 1.
pub fn exit_code_for_error(err: &eyre::Report) -> i32 {
    if let Some(de) = err.downcast_ref::<DosingError>() {
        return match de {
            DosingError::SensorUnavailable(_) => 3,
            DosingError::SafetyLimitExceeded { .. } => 4,
            DosingError::PumpFault { .. } => 5,
            DosingError::InvalidCalibration(_) => 6,
            DosingError::ConfigInvalid(_) => 7,
            DosingError::Timeout => 8,
            DosingError::Hardware(_) | DosingError::State(_) => 2,
        };
    }
    1
}

fn error_class(err: &eyre::Report) -> &'static str {
    match err.downcast_ref::<DosingError>() {
        Some(DosingError::SensorUnavailable(_)) => "SensorUnavailable",
        Some(DosingError::PumpFault { .. }) => "PumpFault",
        Some(DosingError::SafetyLimitExceeded { .. }) => "SafetyLimitExceeded",
        Some(DosingError::InvalidCalibration(_)) => "InvalidCalibration",
        Some(DosingError::ConfigInvalid(_)) => "ConfigInvalid",
        Some(DosingError::Timeout) => "Timeout",
        Some(DosingError::Hardware(_)) => "Hardware",
        Some(DosingError::State(_)) => "State",
        None => "Error",
    }
}

/// Structured JSON for errors when --json is enabled.
pub fn format_error_json(err: &eyre::Report) -> String {
    use serde_json::json;

    let obj = match err.downcast_ref::<DosingError>() {
        Some(DosingError::SafetyLimitExceeded {
            pump,
            requested_ml,
            remaining_ml,
        }) => json!({
            "reason": error_class(err),
            "details": {
                "pump": pump.as_str(),
                "requested_ml": requested_ml,
                "remaining_ml": remaining_ml,
            },
            "message": humanize(err),
        }),
        Some(DosingError::PumpFault { pump, .. }) => json!({
            "reason": error_class(err),
            "details": { "pump": pump.as_str() },
            "message": humanize(err),
        }),
        _ => json!({ "reason": error_class(err), "message": humanize(err) }),
    };
    obj.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use hydro_config::PumpName;

    #[test]
    fn exit_codes_are_stable() {
        let err = eyre::Report::new(DosingError::SafetyLimitExceeded {
            pump: PumpName::PhUp,
            requested_ml: 10.0,
            remaining_ml: 0.0,
        });
        assert_eq!(exit_code_for_error(&err), 4);
        assert_eq!(exit_code_for_error(&eyre::eyre!("anything else")), 1);
    }

    #[test]
    fn json_errors_carry_the_class() {
        let err = eyre::Report::new(DosingError::Timeout);
        let v: serde_json::Value = serde_json::from_str(&format_error_json(&err)).unwrap();
        assert_eq!(v["reason"], "Timeout");
    }
}

use hydro_config::PumpName;
use hydro_traits::SensorKind;
use thiserror::Error;

/// Failure taxonomy for dosing operations.
///
/// Variants carry enough context to render an operator-facing message
/// without chasing the source chain.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DosingError {
    #[error("sensor unavailable: {0}")]
    SensorUnavailable(SensorKind),

    #[error("pump fault on {pump}: {message}")]
    PumpFault { pump: PumpName, message: String },

    #[error(
        "safety limit exceeded for {pump}: requested {requested_ml:.2} ml with {remaining_ml:.2} ml of daily headroom"
    )]
    SafetyLimitExceeded {
        pump: PumpName,
        requested_ml: f64,
        remaining_ml: f64,
    },

    #[error("invalid calibration: {0}")]
    InvalidCalibration(String),

    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("hardware error: {0}")]
    Hardware(String),

    #[error("timeout waiting for hardware")]
    Timeout,

    #[error("invalid state: {0}")]
    State(String),
}

pub type Result<T> = std::result::Result<T, DosingError>;

pub(crate) type BoxedHwError = Box<dyn std::error::Error + Send + Sync>;

/// Map a boxed backend error into the core taxonomy.
///
/// With `hardware-errors` enabled the concrete backend error type is
/// downcast; otherwise (and for unknown types) the message is inspected
/// for a timeout marker and the rest becomes `Hardware`.
pub(crate) fn map_hw_error(e: BoxedHwError) -> DosingError {
    #[cfg(feature = "hardware-errors")]
    {
        if let Some(hw) = e.downcast_ref::<hydro_hardware::error::HwError>() {
            return match hw {
                hydro_hardware::error::HwError::Timeout => DosingError::Timeout,
                other => DosingError::Hardware(other.to_string()),
            };
        }
    }
    let msg = e.to_string();
    if msg.to_ascii_lowercase().contains("timeout") {
        DosingError::Timeout
    } else {
        DosingError::Hardware(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_messages_map_to_timeout() {
        let e: BoxedHwError = "i2c read timeout".into();
        assert_eq!(map_hw_error(e), DosingError::Timeout);
    }

    #[test]
    fn other_messages_map_to_hardware() {
        let e: BoxedHwError = "bus fault".into();
        assert_eq!(map_hw_error(e), DosingError::Hardware("bus fault".into()));
    }

    #[cfg(feature = "hardware-errors")]
    #[test]
    fn concrete_backend_errors_downcast() {
        let e: BoxedHwError = Box::new(hydro_hardware::error::HwError::Timeout);
        assert_eq!(map_hw_error(e), DosingError::Timeout);
    }
}

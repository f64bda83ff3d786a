use thiserror::Error;

#[derive(Debug, Error)]
pub enum HwError {
    #[error("gpio error: {0}")]
    Gpio(String),
    #[error("sensor timeout")]
    Timeout,
    #[error("probe returned unparseable payload: {0}")]
    BadResponse(String),
    #[error("probe offline: {0}")]
    Offline(&'static str),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, HwError>;

pub mod clock;

pub use clock::{Clock, MonotonicClock};

/// Sensor channels the hardware backend can be queried for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SensorKind {
    Ph,
    Ec,
    Tds,
    Temperature,
}

impl SensorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SensorKind::Ph => "ph",
            SensorKind::Ec => "ec",
            SensorKind::Tds => "tds",
            SensorKind::Temperature => "temperature",
        }
    }
}

impl std::fmt::Display for SensorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SensorKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ph" => Ok(SensorKind::Ph),
            "ec" => Ok(SensorKind::Ec),
            "tds" => Ok(SensorKind::Tds),
            "temperature" | "temp" => Ok(SensorKind::Temperature),
            other => Err(format!("unknown sensor: {other}")),
        }
    }
}

/// Digital output control for pump channels (relay/MOSFET drivers).
pub trait OutputBus {
    fn set_output(
        &mut self,
        channel: u8,
        energized: bool,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// Analog/serial sensor queries. Responses are the raw probe payload
/// (decimal text for pH/EC/temperature probes); parsing happens upstream.
pub trait SensorBus {
    fn query(
        &mut self,
        kind: SensorKind,
        timeout: std::time::Duration,
    ) -> Result<String, Box<dyn std::error::Error + Send + Sync>>;

    /// Push a temperature compensation value to the pH/EC probes.
    /// Must be called before querying pH or EC with a current temperature.
    fn set_temp_compensation(
        &mut self,
        kind: SensorKind,
        celsius: f64,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

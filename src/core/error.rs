use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum SimulationError {
    #[error("Missing data: {0}")]
    MissingData(String),
    #[error("Invalid period: {0}")]
    InvalidPeriod(String),
    #[error("The given period is out of the historical data, it's either too far in the future or too far in the past")]
    OutOfRange,
    #[error("Invalid configuration: {0}")]
    Configuration(String),
    #[error("Simulation did not finish within {0} ms")]
    Timeout(u64),
}

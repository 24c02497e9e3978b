use dirtree::Rank;

#[derive(Debug, thiserror::Error)]
pub enum BalancerError {
    #[error("unknown load forecaster {0:?}")]
    UnknownForecaster(String),
    #[error("forecast failed: {0}")]
    Forecast(String),
    #[error("invalid balancer configuration: {0}")]
    InvalidConfig(String),
    #[error("rank {rank} reported a load of {load}, expected a positive value")]
    NonPositiveLoad { rank: Rank, load: f64 },
}

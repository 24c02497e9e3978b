use tracing::debug;

use crate::{error::BalancerError, load::LoadSample};

/// Predicts the next epoch's meta load of a fragment from its recent history.
pub trait LoadForecaster: Send {
    fn name(&self) -> &'static str;
    fn predict(&self, history: &[LoadSample]) -> Result<f64, BalancerError>;
}

/// Least squares line over the history, evaluated one epoch ahead.
#[derive(Clone, Copy, Debug, Default)]
pub struct LinearTrend;

impl LoadForecaster for LinearTrend {
    fn name(&self) -> &'static str {
        "trend"
    }
    fn predict(&self, history: &[LoadSample]) -> Result<f64, BalancerError> {
        let n = history.len();
        match n {
            0 => Err(BalancerError::Forecast("no history".to_string())),
            1 => Ok(history[0].meta_load()),
            _ => {
                let count = n as f64;
                let mean_x = (count - 1.0) / 2.0;
                let mean_y = history.iter().map(LoadSample::meta_load).sum::<f64>() / count;
                let (mut cov, mut var) = (0.0, 0.0);
                for (x, sample) in history.iter().enumerate() {
                    let dx = x as f64 - mean_x;
                    cov += dx * (sample.meta_load() - mean_y);
                    var += dx * dx;
                }
                let slope = cov / var;
                let predicted = mean_y + slope * (count - mean_x);
                if !predicted.is_finite() {
                    return Err(BalancerError::Forecast(format!(
                        "trend produced {predicted}"
                    )));
                }
                Ok(predicted.max(0.0))
            }
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct MovingAverage;

impl LoadForecaster for MovingAverage {
    fn name(&self) -> &'static str {
        "avg"
    }
    fn predict(&self, history: &[LoadSample]) -> Result<f64, BalancerError> {
        if history.is_empty() {
            return Err(BalancerError::Forecast("no history".to_string()));
        }
        Ok(history.iter().map(LoadSample::meta_load).sum::<f64>() / history.len() as f64)
    }
}

/// Resolves a configured forecaster by the suffix of its name, `models/x.trend`
/// or `x.avg`. An empty name disables forecasting.
pub fn forecaster_from_name(name: &str) -> Result<Option<Box<dyn LoadForecaster>>, BalancerError> {
    let name = name.trim();
    if name.is_empty() {
        return Ok(None);
    }
    let forecaster: Box<dyn LoadForecaster> = match name.rsplit_once('.') {
        Some((_, "trend")) => Box::new(LinearTrend),
        Some((_, "avg")) => Box::new(MovingAverage),
        _ => return Err(BalancerError::UnknownForecaster(name.to_string())),
    };
    debug!(name, forecaster = forecaster.name(), "Resolved forecaster");
    Ok(Some(forecaster))
}

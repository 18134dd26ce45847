//! Link rate observations and their reduction into a run summary.

use std::time::Duration;

/// One link rate measurement taken during a run.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RateObservation {
    /// Achieved rate, in bytes per second.
    pub rate: f64,
    /// When the measurement was taken, relative to the start of the run.
    pub at: Duration,
}

/// The reduced result of all rate observations from a run.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum RateSummary {
    /// No observations were collected, usually because the run was shorter
    /// than the probe interval.
    NoData,
    /// Unweighted mean of all observations.
    Mean {
        /// Mean rate, in bytes per second.
        rate: f64,
        /// Number of observations averaged.
        count: usize,
    },
}

impl RateSummary {
    /// Get the mean rate, if there is one.
    pub fn mean(&self) -> Option<f64> {
        match self {
            Self::NoData => None,
            Self::Mean { rate, .. } => Some(*rate),
        }
    }
}

/// Reduce a sequence of observations to their arithmetic mean.
pub fn aggregate(observations: &[RateObservation]) -> RateSummary {
    if observations.is_empty() {
        return RateSummary::NoData;
    }
    let sum: f64 = observations.iter().map(|o| o.rate).sum();
    RateSummary::Mean {
        rate: sum / observations.len() as f64,
        count: observations.len(),
    }
}

/// Collects rate observations for a single run.
///
/// Observations can only be appended.
#[derive(Clone, Debug, Default)]
pub struct RateAggregator {
    observations: Vec<RateObservation>,
}

impl RateAggregator {
    /// Make an empty aggregator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an observation.
    pub fn push(&mut self, observation: RateObservation) {
        self.observations.push(observation);
    }

    /// All observations so far, in the order they were taken.
    pub fn observations(&self) -> &[RateObservation] {
        &self.observations
    }

    /// Summarize the observations so far.
    pub fn summary(&self) -> RateSummary {
        aggregate(&self.observations)
    }

    /// Summarize and hand back the observations.
    pub fn into_parts(self) -> (RateSummary, Vec<RateObservation>) {
        (aggregate(&self.observations), self.observations)
    }
}

//! # WSJF Scoring
//!
//! Weighted Shortest Job First: `(value + time_criticality + risk_reduction)
//! / max(job_size, 1)`. Higher scores are claimed first. Pure computation;
//! callers re-score whenever the inputs change (e.g. after decomposition
//! shrinks the estimated size).

use serde::{Deserialize, Serialize};

/// Business inputs for a WSJF score. All fields are non-negative.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WsjfInputs {
    /// Business value of completing the work
    pub value: f64,
    /// Urgency decay: how fast the value erodes if deferred
    pub time_criticality: f64,
    /// Risk retired or opportunity enabled by doing it now
    pub risk_reduction: f64,
    /// Coarse effort estimate (job duration proxy)
    pub job_size: f64,
}

impl WsjfInputs {
    pub fn score(&self) -> f64 {
        score(
            self.value,
            self.time_criticality,
            self.risk_reduction,
            self.job_size,
        )
    }
}

/// Compute a WSJF priority. A `job_size` below 1 is clamped to 1 so that
/// zero-sized jobs divide cleanly instead of panicking or producing inf.
pub fn score(value: f64, time_criticality: f64, risk_reduction: f64, job_size: f64) -> f64 {
    (value + time_criticality + risk_reduction) / job_size.max(1.0)
}

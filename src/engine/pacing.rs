use chrono::{DateTime, Utc};
use rand::Rng;
use std::time::Duration;

use crate::models::{IntervalMode, SubscriptionTask};

/// Delay profile between join attempts.
///
/// Each sleep is drawn uniformly from `baseline * [1 - jitter, 1 + jitter]`
/// so consecutive joins never land on a fixed cadence.
#[derive(Debug, Clone, PartialEq)]
pub struct PacingConfig {
    pub safe: Duration,
    pub aggressive: Duration,
    pub jitter: f64,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            safe: Duration::from_secs(600),
            aggressive: Duration::from_secs(120),
            jitter: 0.2,
        }
    }
}

impl PacingConfig {
    pub fn baseline(&self, mode: IntervalMode) -> Duration {
        match mode {
            IntervalMode::Safe => self.safe,
            IntervalMode::Aggressive => self.aggressive,
        }
    }

    pub fn next_delay<R: Rng>(&self, mode: IntervalMode, rng: &mut R) -> Duration {
        let baseline = self.baseline(mode);
        let jitter = self.jitter.clamp(0.0, 0.95);
        if jitter == 0.0 || baseline.is_zero() {
            return baseline;
        }
        let factor = rng.gen_range((1.0 - jitter)..=(1.0 + jitter));
        baseline.mul_f64(factor)
    }

    /// `now + remaining * baseline`; `None` once the task is terminal.
    pub fn estimate_completion(
        &self,
        task: &SubscriptionTask,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        if !task.status.is_active() {
            return None;
        }
        let remaining = task.remaining() as u32;
        let span = self.baseline(task.interval_mode).checked_mul(remaining)?;
        let span = chrono::Duration::from_std(span).ok()?;
        now.checked_add_signed(span)
    }
}

//! Risk scoring and violation cooldown.
//!
//! The score is recomputed from the full violation history on every accepted
//! violation. It never decays and review decisions never touch it.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;

use crate::config::SeverityWeights;
use crate::session::Violation;

pub const MAX_RISK_SCORE: u32 = 100;

pub fn risk_score(violations: &[Violation], weights: &SeverityWeights) -> u32 {
    let total = violations.iter().fold(0u32, |acc, violation| {
        acc.saturating_add(weights.weight(violation.severity))
    });
    total.min(MAX_RISK_SCORE)
}

/// Last accepted time per violation type for one session.
///
/// Only accepted violations refresh the window; dropped candidates do not
/// extend it.
#[derive(Debug, Default)]
pub struct CooldownMap {
    last_accepted: HashMap<String, DateTime<Utc>>,
}

impl CooldownMap {
    pub fn is_cooling(&self, violation_type: &str, now: DateTime<Utc>, window: Duration) -> bool {
        match self.last_accepted.get(violation_type) {
            // A clock step backwards still counts as inside the window.
            Some(last) => now.signed_duration_since(*last) < window,
            None => false,
        }
    }

    pub fn mark(&mut self, violation_type: &str, now: DateTime<Utc>) {
        self.last_accepted.insert(violation_type.to_string(), now);
    }

    /// Drops entries whose window has elapsed. Returns how many were removed.
    pub fn prune(&mut self, now: DateTime<Utc>, window: Duration) -> usize {
        let before = self.last_accepted.len();
        self.last_accepted
            .retain(|_, last| now.signed_duration_since(*last) < window);
        before - self.last_accepted.len()
    }

    pub fn clear(&mut self) {
        self.last_accepted.clear();
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.last_accepted.len()
    }
}

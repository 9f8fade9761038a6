use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

use crate::config::PacingConfig;
use crate::outcome::ResolutionOutcome;

/// Per-run tallies. Live only as long as one batch run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunCounters {
    pub successes: usize,
    pub failures: usize,
    pub consecutive_failures: usize,
    pub fallback_successes: usize,
}

impl RunCounters {
    pub fn record(&mut self, outcome: &ResolutionOutcome) {
        if outcome.is_success() {
            self.successes += 1;
            self.consecutive_failures = 0;
            if outcome.used_fallback() {
                self.fallback_successes += 1;
            }
        } else {
            self.failures += 1;
            self.consecutive_failures += 1;
        }
    }

    pub fn attempts(&self) -> usize {
        self.successes + self.failures
    }

    /// Failure share of all attempts, in percent.
    pub fn failure_rate(&self) -> f64 {
        match self.attempts() {
            0 => 0.0,
            total => self.failures as f64 / total as f64 * 100.0,
        }
    }
}

/// What the driver should do after an attempt has been counted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Verdict {
    Continue,
    Cooldown(Duration),
    Halt { failure_rate: f64 },
}

/// Inter-request delays plus the failure-rate breaker.
pub struct Pacing {
    config: PacingConfig,
    rng: StdRng,
}

impl Pacing {
    pub fn new(config: PacingConfig) -> Self {
        Self::with_rng(config, StdRng::from_entropy())
    }

    pub fn with_rng(config: PacingConfig, rng: StdRng) -> Self {
        Self { config, rng }
    }

    pub fn config(&self) -> &PacingConfig {
        &self.config
    }

    pub fn request_delay(&mut self) -> Duration {
        let (min, max) = (self.config.request_delay_min_ms, self.config.request_delay_max_ms);
        self.uniform(min, max)
    }

    pub fn cooldown_delay(&mut self) -> Duration {
        let (min, max) = (self.config.cooldown_min_ms, self.config.cooldown_max_ms);
        self.uniform(min, max)
    }

    /// True once the minimum sample is in and failures exceed the ceiling.
    pub fn breaker_tripped(&self, counters: &RunCounters) -> bool {
        counters.attempts() >= self.config.min_sample_size
            && counters.failure_rate() > self.config.max_failure_rate
    }

    pub fn needs_cooldown(&self, counters: &RunCounters) -> bool {
        counters.consecutive_failures >= self.config.max_consecutive_failures
    }

    /// Breaker first: a tripped breaker ends the run even mid-streak.
    pub fn verdict(&mut self, counters: &RunCounters) -> Verdict {
        if self.breaker_tripped(counters) {
            return Verdict::Halt {
                failure_rate: counters.failure_rate(),
            };
        }
        if self.needs_cooldown(counters) {
            return Verdict::Cooldown(self.cooldown_delay());
        }
        Verdict::Continue
    }

    fn uniform(&mut self, min_ms: u64, max_ms: u64) -> Duration {
        let high = max_ms.max(min_ms);
        Duration::from_millis(self.rng.gen_range(min_ms..=high))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingestion::AddressRecord;

    fn tally(successes: usize, failures: usize) -> RunCounters {
        RunCounters {
            successes,
            failures,
            consecutive_failures: 0,
            fallback_successes: 0,
        }
    }

    fn pacing() -> Pacing {
        Pacing::with_rng(PacingConfig::default(), StdRng::seed_from_u64(7))
    }

    #[test]
    fn delays_stay_inside_configured_windows() {
        let mut pacing = pacing();
        for _ in 0..200 {
            let delay = pacing.request_delay();
            assert!(delay >= Duration::from_millis(3_800) && delay <= Duration::from_millis(8_000));
            let cooldown = pacing.cooldown_delay();
            assert!(cooldown >= Duration::from_secs(20) && cooldown <= Duration::from_secs(30));
        }
        let mut immediate = Pacing::with_rng(PacingConfig::immediate(), StdRng::seed_from_u64(1));
        assert_eq!(immediate.request_delay(), Duration::ZERO);
    }

    #[test]
    fn breaker_waits_for_minimum_sample() {
        let pacing = pacing();
        assert!(!pacing.breaker_tripped(&tally(0, 34)));
        assert!(pacing.breaker_tripped(&tally(0, 35)));
    }

    #[test]
    fn breaker_threshold_is_strictly_greater() {
        let pacing = pacing();
        // 6 of 40 is exactly 15%.
        assert!(!pacing.breaker_tripped(&tally(34, 6)));
        assert!(pacing.breaker_tripped(&tally(33, 7)));
        assert!(!pacing.breaker_tripped(&tally(30, 5)));
        assert!(pacing.breaker_tripped(&tally(29, 6)));
    }

    #[test]
    fn consecutive_failures_reset_on_success() {
        let record = AddressRecord::new("1", "a", "t");
        let failed = ResolutionOutcome::failed(&record, "t", "r");
        let ok = ResolutionOutcome::success(
            &record,
            "t",
            "r",
            crate::coordinates::Coordinates::new(1.0, 1.0).unwrap(),
            crate::outcome::Tier::Fallback,
        );

        let mut counters = RunCounters::default();
        for _ in 0..4 {
            counters.record(&failed);
        }
        assert!(!pacing().needs_cooldown(&counters));
        counters.record(&failed);
        assert!(pacing().needs_cooldown(&counters));
        counters.record(&ok);
        assert_eq!(counters.consecutive_failures, 0);
        assert_eq!(counters.fallback_successes, 1);
        assert_eq!(counters.attempts(), 6);
    }

    #[test]
    fn halt_takes_precedence_over_cooldown() {
        let mut pacing = pacing();
        let counters = RunCounters {
            successes: 30,
            failures: 10,
            consecutive_failures: 5,
            fallback_successes: 0,
        };
        assert!(matches!(pacing.verdict(&counters), Verdict::Halt { .. }));

        let streak = RunCounters {
            successes: 3,
            failures: 5,
            consecutive_failures: 5,
            fallback_successes: 0,
        };
        assert!(matches!(pacing.verdict(&streak), Verdict::Cooldown(_)));
    }
}

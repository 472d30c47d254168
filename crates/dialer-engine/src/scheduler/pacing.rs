//! Pacing arithmetic: how many calls to place, and how the dial ratio
//! follows the abandon rate.

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// New dials to place this tick.
///
/// `floor(available_agents * ratio)` concurrent calls are wanted, capped by
/// the campaign's concurrency and line limits; calls already in flight count
/// against that.
pub fn compute_dial_target(
    available_agents: usize,
    active_calls: usize,
    dial_ratio: f64,
    max_concurrent_calls: u32,
    max_lines: u32,
) -> usize {
    if available_agents == 0 || !dial_ratio.is_finite() || dial_ratio <= 0.0 {
        return 0;
    }

    let wanted = (available_agents as f64 * dial_ratio).floor() as usize;
    let cap = max_concurrent_calls.min(max_lines) as usize;
    wanted.min(cap).saturating_sub(active_calls)
}

/// Step function for the self-tuning dial ratio
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RatioStepPolicy {
    /// Ratio decrease when the abandon rate is above threshold
    pub decrease_step: f64,
    /// Ratio increase when comfortably below threshold
    pub increase_step: f64,
    /// The rate must be this many percentage points under the threshold
    /// before the ratio is raised
    pub headroom_pct: f64,
}

impl Default for RatioStepPolicy {
    fn default() -> Self {
        Self {
            decrease_step: 0.1,
            increase_step: 0.05,
            headroom_pct: 1.0,
        }
    }
}

impl RatioStepPolicy {
    pub fn validate(&self) -> Result<(), String> {
        if !(self.decrease_step > 0.0) {
            return Err("ratio_policy.decrease_step must be positive".to_string());
        }
        if !(self.increase_step > 0.0) {
            return Err("ratio_policy.increase_step must be positive".to_string());
        }
        if self.headroom_pct < 0.0 {
            return Err("ratio_policy.headroom_pct cannot be negative".to_string());
        }
        Ok(())
    }

    /// Next dial ratio. `abandon_rate` is a percentage, `None` while no call
    /// has been answered in the window, which leaves the ratio alone.
    pub fn adjust(
        &self,
        current: f64,
        min: f64,
        max: f64,
        abandon_rate: Option<f64>,
        threshold: f64,
    ) -> f64 {
        let (low, high) = if min <= max { (min, max) } else { (max, min) };
        let current = current.clamp(low, high);

        let Some(rate) = abandon_rate else {
            return current;
        };

        let next = if rate > threshold {
            current - self.decrease_step
        } else if rate < threshold - self.headroom_pct {
            current + self.increase_step
        } else {
            current
        };

        // Keep two decimals so stored ratios stay readable
        ((next.clamp(low, high)) * 100.0).round() / 100.0
    }
}

/// Answered calls over a rolling window, with how many found no agent
#[derive(Debug, Clone)]
pub struct AbandonWindow {
    window: Duration,
    samples: VecDeque<(DateTime<Utc>, bool)>,
}

impl AbandonWindow {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            samples: VecDeque::new(),
        }
    }

    pub fn record(&mut self, at: DateTime<Utc>, abandoned: bool) {
        self.samples.push_back((at, abandoned));
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        let cutoff = now - self.window;
        while self.samples.front().map_or(false, |(at, _)| *at < cutoff) {
            self.samples.pop_front();
        }
    }

    /// `(answered, abandoned)` inside the window
    pub fn counts(&mut self, now: DateTime<Utc>) -> (usize, usize) {
        self.prune(now);
        let abandoned = self.samples.iter().filter(|(_, a)| *a).count();
        (self.samples.len(), abandoned)
    }

    /// Abandon rate in percent, `None` with no answered calls
    pub fn rate(&mut self, now: DateTime<Utc>) -> Option<f64> {
        let (answered, abandoned) = self.counts(now);
        if answered == 0 {
            return None;
        }
        Some(abandoned as f64 * 100.0 / answered as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_ratio_two_with_three_agents_targets_six() {
        assert_eq!(compute_dial_target(3, 0, 2.0, 50, 50), 6);
        assert_eq!(compute_dial_target(3, 0, 2.0, 4, 50), 4);
        assert_eq!(compute_dial_target(3, 0, 2.0, 50, 5), 5);
        assert_eq!(compute_dial_target(3, 2, 2.0, 50, 50), 4);
    }

    #[test]
    fn test_no_agents_or_busy_lines_means_no_dials() {
        assert_eq!(compute_dial_target(0, 0, 3.0, 50, 50), 0);
        assert_eq!(compute_dial_target(2, 9, 2.0, 50, 50), 0);
        assert_eq!(compute_dial_target(2, 0, f64::NAN, 50, 50), 0);
    }

    #[test]
    fn test_ratio_drops_above_threshold_and_rises_below() {
        let policy = RatioStepPolicy::default();
        assert_eq!(policy.adjust(2.0, 1.0, 3.0, Some(5.0), 3.0), 1.9);
        assert_eq!(policy.adjust(2.0, 1.0, 3.0, Some(0.5), 3.0), 2.05);
        // Inside the headroom band nothing moves
        assert_eq!(policy.adjust(2.0, 1.0, 3.0, Some(2.5), 3.0), 2.0);
        assert_eq!(policy.adjust(2.0, 1.0, 3.0, None, 3.0), 2.0);
    }

    #[test]
    fn test_ratio_respects_bounds() {
        let policy = RatioStepPolicy::default();
        assert_eq!(policy.adjust(1.0, 1.0, 3.0, Some(50.0), 3.0), 1.0);
        assert_eq!(policy.adjust(3.0, 1.0, 3.0, Some(0.0), 3.0), 3.0);
        assert_eq!(policy.adjust(5.0, 1.0, 3.0, None, 3.0), 3.0);
    }

    #[test]
    fn test_abandon_window_forgets_old_samples() {
        let now = Utc::now();
        let mut window = AbandonWindow::new(Duration::seconds(60));
        window.record(now - Duration::seconds(120), true);
        window.record(now - Duration::seconds(10), false);
        window.record(now - Duration::seconds(5), true);

        assert_eq!(window.counts(now), (2, 1));
        assert_eq!(window.rate(now), Some(50.0));
        assert_eq!(AbandonWindow::new(Duration::seconds(60)).rate(now), None);
    }

    proptest! {
        #[test]
        fn prop_target_never_exceeds_caps(
            agents in 0usize..200,
            active in 0usize..200,
            ratio in 0.0f64..5.0,
            max_calls in 0u32..300,
            max_lines in 0u32..300,
        ) {
            let target = compute_dial_target(agents, active, ratio, max_calls, max_lines);
            let cap = max_calls.min(max_lines) as usize;
            if target > 0 {
                prop_assert!(target + active <= cap);
            }
            prop_assert!(target <= cap);
            prop_assert!(target as f64 <= (agents as f64 * ratio).floor());
        }

        #[test]
        fn prop_adjusted_ratio_stays_in_bounds(
            current in 0.0f64..10.0,
            rate in proptest::option::of(0.0f64..100.0),
            threshold in 0.0f64..20.0,
        ) {
            let next = RatioStepPolicy::default().adjust(current, 1.0, 3.0, rate, threshold);
            prop_assert!((1.0..=3.0).contains(&next));
        }
    }
}

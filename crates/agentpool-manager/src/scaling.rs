//! Autoscaling policy.
//!
//! Two thresholds with a gap between them (hysteresis) plus a cooldown
//! after every action keep the pool from flapping under borderline load.
//! The policy is pure: the manager feeds it counts and applies the result.

use std::time::Duration;

use tokio::time::Instant;

use crate::config::PoolConfig;

/// What the autoscaler wants done.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalingDecision {
    Hold,
    /// Add this many workers.
    ScaleUp(usize),
    /// Remove this many idle workers.
    ScaleDown(usize),
}

#[derive(Debug, Clone)]
pub struct Autoscaler {
    min_workers: usize,
    max_workers: usize,
    scale_up_threshold: f64,
    scale_down_threshold: f64,
    scale_up_step: usize,
    scale_down_step: usize,
    cooldown: Duration,
    last_action: Option<Instant>,
}

impl Autoscaler {
    pub fn new(config: &PoolConfig) -> Self {
        Self {
            min_workers: config.min_workers,
            max_workers: config.max_workers,
            scale_up_threshold: config.scale_up_threshold,
            scale_down_threshold: config.scale_down_threshold,
            scale_up_step: config.scale_up_step,
            scale_down_step: config.scale_down_step,
            cooldown: config.cooldown(),
            last_action: None,
        }
    }

    /// Busy workers over live workers.
    ///
    /// An empty pool with queued work counts as saturated so it can grow.
    pub fn utilization(busy: usize, total: usize, queue_depth: usize) -> f64 {
        if total == 0 {
            return if queue_depth > 0 { 1.0 } else { 0.0 };
        }
        busy as f64 / total as f64
    }

    /// Decide on an action for the given pool shape.
    pub fn evaluate(&self, busy: usize, total: usize, queue_depth: usize, now: Instant) -> ScalingDecision {
        if self.in_cooldown(now) {
            return ScalingDecision::Hold;
        }

        let utilization = Self::utilization(busy, total, queue_depth);
        if utilization >= self.scale_up_threshold && total < self.max_workers {
            ScalingDecision::ScaleUp(self.scale_up_step.min(self.max_workers - total))
        } else if utilization <= self.scale_down_threshold && total > self.min_workers {
            ScalingDecision::ScaleDown(self.scale_down_step.min(total - self.min_workers))
        } else {
            ScalingDecision::Hold
        }
    }

    /// Start the cooldown.
    pub fn record_action(&mut self, at: Instant) {
        self.last_action = Some(at);
    }

    pub fn in_cooldown(&self, now: Instant) -> bool {
        self.last_action
            .map(|last| now.saturating_duration_since(last) < self.cooldown)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scaler(min: usize, max: usize) -> Autoscaler {
        Autoscaler::new(&PoolConfig {
            min_workers: min,
            max_workers: max,
            initial_workers: min,
            cooldown_ms: 30_000,
            ..Default::default()
        })
    }

    #[test]
    fn test_utilization() {
        assert_eq!(Autoscaler::utilization(1, 4, 0), 0.25);
        assert_eq!(Autoscaler::utilization(0, 0, 3), 1.0);
        assert_eq!(Autoscaler::utilization(0, 0, 0), 0.0);
    }

    #[test]
    fn test_scale_up_capped_by_max() {
        let scaler = scaler(2, 5);
        let now = Instant::now();
        assert_eq!(scaler.evaluate(2, 2, 3, now), ScalingDecision::ScaleUp(2));
        assert_eq!(scaler.evaluate(4, 4, 1, now), ScalingDecision::ScaleUp(1));
        assert_eq!(scaler.evaluate(5, 5, 9, now), ScalingDecision::Hold);
    }

    #[test]
    fn test_scale_down_capped_by_min() {
        let scaler = scaler(2, 10);
        let now = Instant::now();
        assert_eq!(scaler.evaluate(0, 6, 0, now), ScalingDecision::ScaleDown(1));
        assert_eq!(scaler.evaluate(0, 2, 0, now), ScalingDecision::Hold);
    }

    #[test]
    fn test_hysteresis_band_holds() {
        let scaler = scaler(1, 10);
        let now = Instant::now();
        // 0.5 sits strictly between 0.2 and 0.8
        for _ in 0..10 {
            assert_eq!(scaler.evaluate(2, 4, 0, now), ScalingDecision::Hold);
        }
    }

    #[test]
    fn test_cooldown_suppresses_actions() {
        let mut scaler = scaler(2, 10);
        let start = Instant::now();
        scaler.record_action(start);
        assert!(scaler.in_cooldown(start + Duration::from_secs(10)));
        assert_eq!(
            scaler.evaluate(2, 2, 5, start + Duration::from_secs(10)),
            ScalingDecision::Hold
        );
        assert_eq!(
            scaler.evaluate(2, 2, 5, start + Duration::from_secs(31)),
            ScalingDecision::ScaleUp(2)
        );
    }
}

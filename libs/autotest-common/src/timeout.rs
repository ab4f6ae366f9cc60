//! Timeout Policy
//!
//! A job's execution budget is the sum of the declared timeouts of every
//! test-data entry the request selects, scaled by a safety multiplier and
//! rounded up to whole seconds.

use std::collections::BTreeSet;

use crate::error::{AutotestError, Result};
use crate::types::TestSpecs;

pub const DEFAULT_TIMEOUT_MULTIPLIER: f64 = 1.5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeoutPolicy {
    multiplier: f64,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self {
            multiplier: DEFAULT_TIMEOUT_MULTIPLIER,
        }
    }
}

impl TimeoutPolicy {
    pub fn new(multiplier: f64) -> Result<Self> {
        if !multiplier.is_finite() || multiplier <= 0.0 {
            return Err(AutotestError::Config(format!(
                "timeout multiplier must be a positive number, got {}",
                multiplier
            )));
        }
        Ok(Self { multiplier })
    }

    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }

    /// Execution budget in seconds for the entries matching `categories`.
    pub fn compute(&self, specs: &TestSpecs, categories: &BTreeSet<String>) -> Result<u64> {
        let total = specs
            .testers
            .iter()
            .flat_map(|tester| tester.test_data.iter())
            .filter(|data| data.category.iter().any(|c| categories.contains(c)))
            .try_fold(0u64, |sum, data| sum.checked_add(data.timeout_secs()))
            .ok_or_else(|| {
                AutotestError::InvalidSpec("declared test timeouts overflow".to_string())
            })?;

        // A zero budget would have the job killed on start
        if total == 0 {
            return Err(AutotestError::TestParameter(
                categories.iter().cloned().collect(),
            ));
        }

        Ok(round_up(total as f64 * self.multiplier))
    }
}

/// Ceiling that ignores representation error, so 10 * 1.1 is 11, not 12.
fn round_up(scaled: f64) -> u64 {
    let nearest = scaled.round();
    if (scaled - nearest).abs() <= scaled * 1e-12 {
        nearest as u64
    } else {
        scaled.ceil() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn specs() -> TestSpecs {
        serde_json::from_value(json!({
            "testers": [
                {"tester_type": "py", "test_data": [
                    {"category": ["a"], "timeout": 10},
                    {"category": ["b"], "timeout": 20}
                ]}
            ]
        }))
        .unwrap()
    }

    fn categories(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_single_category() {
        let policy = TimeoutPolicy::default();
        assert_eq!(policy.compute(&specs(), &categories(&["a"])).unwrap(), 15);
    }

    #[test]
    fn test_no_matching_category() {
        let policy = TimeoutPolicy::default();
        let err = policy.compute(&specs(), &categories(&["c"])).unwrap_err();
        assert!(matches!(err, AutotestError::TestParameter(ref c) if c == &["c".to_string()]));
    }

    #[test]
    fn test_sums_across_testers_and_defaults() {
        let specs: TestSpecs = serde_json::from_value(json!({
            "testers": [
                {"test_data": [{"category": ["a", "b"], "timeout": 10}]},
                {"test_data": [{"category": ["b"]}, {"category": ["z"], "timeout": 1000}]},
                {}
            ]
        }))
        .unwrap();
        // 10 + 30 (default), times 1.5
        let policy = TimeoutPolicy::default();
        assert_eq!(policy.compute(&specs, &categories(&["b"])).unwrap(), 60);
        // an entry matching twice is still counted once
        assert_eq!(policy.compute(&specs, &categories(&["a", "b"])).unwrap(), 60);
    }

    #[test]
    fn test_rounds_up() {
        let policy = TimeoutPolicy::new(1.25).unwrap();
        let specs: TestSpecs = serde_json::from_value(json!({
            "testers": [{"test_data": [{"category": ["a"], "timeout": 3}]}]
        }))
        .unwrap();
        // 3.75 -> 4
        assert_eq!(policy.compute(&specs, &categories(&["a"])).unwrap(), 4);
    }

    #[test]
    fn test_float_noise_does_not_round_up() {
        let policy = TimeoutPolicy::new(1.1).unwrap();
        let specs: TestSpecs = serde_json::from_value(json!({
            "testers": [{"test_data": [{"category": ["a"], "timeout": 10}]}]
        }))
        .unwrap();
        assert_eq!(policy.compute(&specs, &categories(&["a"])).unwrap(), 11);
    }

    #[test]
    fn test_tiny_excess_still_rounds_up() {
        let policy = TimeoutPolicy::new(1.0000001).unwrap();
        let specs: TestSpecs = serde_json::from_value(json!({
            "testers": [{"test_data": [{"category": ["a"], "timeout": 1}]}]
        }))
        .unwrap();
        assert_eq!(policy.compute(&specs, &categories(&["a"])).unwrap(), 2);
    }

    #[test]
    fn test_overflowing_timeouts_are_rejected() {
        let specs: TestSpecs = serde_json::from_value(json!({
            "testers": [{"test_data": [
                {"category": ["a"], "timeout": u64::MAX},
                {"category": ["a"], "timeout": 1}
            ]}]
        }))
        .unwrap();
        assert!(matches!(
            TimeoutPolicy::default().compute(&specs, &categories(&["a"])),
            Err(AutotestError::InvalidSpec(_))
        ));
    }

    #[test]
    fn test_order_independent() {
        let forward = specs();
        let mut reversed = specs();
        reversed.testers[0].test_data.reverse();
        let policy = TimeoutPolicy::default();
        let both = categories(&["a", "b"]);
        assert_eq!(
            policy.compute(&forward, &both).unwrap(),
            policy.compute(&reversed, &both).unwrap()
        );
        assert_eq!(policy.compute(&forward, &both).unwrap(), 45);
    }

    #[test]
    fn test_zero_total_is_rejected() {
        let specs: TestSpecs = serde_json::from_value(json!({
            "testers": [{"test_data": [{"category": ["a"], "timeout": 0}]}]
        }))
        .unwrap();
        assert!(matches!(
            TimeoutPolicy::default().compute(&specs, &categories(&["a"])),
            Err(AutotestError::TestParameter(_))
        ));
    }

    #[test]
    fn test_invalid_multiplier() {
        assert!(TimeoutPolicy::new(0.0).is_err());
        assert!(TimeoutPolicy::new(-1.0).is_err());
        assert!(TimeoutPolicy::new(f64::NAN).is_err());
        assert_eq!(TimeoutPolicy::new(2.0).unwrap().multiplier(), 2.0);
    }
}

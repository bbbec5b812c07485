//! Placement Policies
//!
//! The scheduler strategy that breaks ties between qualifying candidates,
//! and the randomized delay applied before every placement decision.

use crate::error::{Error, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

// =============================================================================
// Scheduler Strategy
// =============================================================================

/// How to choose among candidates sorted by ascending capacity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerStrategy {
    /// Smallest sufficient candidate
    Binpack,
    /// Largest candidate
    Spreadout,
}

impl SchedulerStrategy {
    /// Pick from candidates sorted ascending by capacity
    pub fn pick<'a, T>(&self, sorted: &'a [T]) -> Option<&'a T> {
        match self {
            SchedulerStrategy::Binpack => sorted.first(),
            SchedulerStrategy::Spreadout => sorted.last(),
        }
    }
}

impl FromStr for SchedulerStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "binpack" => Ok(SchedulerStrategy::Binpack),
            "spreadout" => Ok(SchedulerStrategy::Spreadout),
            other => Err(Error::UnsupportedStrategy {
                strategy: other.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for SchedulerStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchedulerStrategy::Binpack => write!(f, "binpack"),
            SchedulerStrategy::Spreadout => write!(f, "spreadout"),
        }
    }
}

// =============================================================================
// Jitter
// =============================================================================

/// Random delay before a placement decision, so concurrent requests do not
/// all land on the same best-fit node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JitterConfig {
    pub min: Duration,
    pub max: Duration,
}

impl Default for JitterConfig {
    fn default() -> Self {
        Self {
            min: Duration::from_secs(1),
            max: Duration::from_secs(30),
        }
    }
}

impl JitterConfig {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self { min, max }
    }

    /// No delay at all
    pub fn disabled() -> Self {
        Self {
            min: Duration::ZERO,
            max: Duration::ZERO,
        }
    }

    /// Draw a delay in `[min, max]`
    pub fn sample(&self) -> Duration {
        if self.max <= self.min {
            return self.min;
        }
        let min_ms = self.min.as_millis() as u64;
        let max_ms = self.max.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(min_ms..=max_ms))
    }

    /// Sleep for a sampled delay
    pub async fn wait(&self) {
        let delay = self.sample();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_strategy_parse() {
        assert_eq!("binpack".parse::<SchedulerStrategy>().unwrap(), SchedulerStrategy::Binpack);
        assert_eq!(
            "spreadout".parse::<SchedulerStrategy>().unwrap(),
            SchedulerStrategy::Spreadout
        );
        assert_matches!(
            "roundrobin".parse::<SchedulerStrategy>(),
            Err(Error::UnsupportedStrategy { strategy }) if strategy == "roundrobin"
        );
    }

    #[test]
    fn test_strategy_pick() {
        let sorted = [10, 20, 30];
        assert_eq!(SchedulerStrategy::Binpack.pick(&sorted), Some(&10));
        assert_eq!(SchedulerStrategy::Spreadout.pick(&sorted), Some(&30));
        assert_eq!(SchedulerStrategy::Binpack.pick::<u64>(&[]), None);
    }

    #[test]
    fn test_jitter_bounds() {
        let jitter = JitterConfig::default();
        for _ in 0..100 {
            let d = jitter.sample();
            assert!(d >= Duration::from_secs(1) && d <= Duration::from_secs(30));
        }
        assert_eq!(JitterConfig::disabled().sample(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_jitter_wait_sleeps() {
        let jitter = JitterConfig::new(Duration::from_secs(2), Duration::from_secs(2));
        let start = tokio::time::Instant::now();
        jitter.wait().await;
        assert!(start.elapsed() >= Duration::from_secs(2));
    }
}

//! Retry policy for provider calls
//!
//! Only transient provider failures are retried. Timeouts, permanent
//! rejections and unknown handles surface on the first occurrence.

use serde::{Deserialize, Serialize};
use std::time::Duration;

// ============================================================================
// Retry Configuration
// ============================================================================

/// Bounded exponential backoff
///
/// # Example
/// ```ignore
/// let retry = RetryConfig::new()
///     .with_max_attempts(5)
///     .with_base_delay_ms(20)
///     .with_max_delay_ms(500);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts per call, including the first (1 = no retries)
    pub max_attempts: usize,
    /// Delay before the first retry, doubled for each further retry
    pub base_delay_ms: u64,
    /// Upper bound on any single delay
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 50,
            max_delay_ms: 2_000,
        }
    }
}

impl RetryConfig {
    /// Create a RetryConfig with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Single attempt, no retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Set total attempts per call
    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Set base delay for exponential backoff
    pub fn with_base_delay_ms(mut self, base_delay_ms: u64) -> Self {
        self.base_delay_ms = base_delay_ms;
        self
    }

    /// Set maximum delay between retries
    pub fn with_max_delay_ms(mut self, max_delay_ms: u64) -> Self {
        self.max_delay_ms = max_delay_ms;
        self
    }

    /// Attempts actually made; a zero setting still makes one attempt
    pub fn attempts(&self) -> usize {
        self.max_attempts.max(1)
    }

    /// Delay after failed attempt number `attempt` (0-based)
    pub fn calculate_delay(&self, attempt: usize) -> Duration {
        // base * 2^attempt, saturating; later attempts all sit at the cap
        let factor = u32::try_from(attempt)
            .map_or(u64::MAX, |exp| 2u64.saturating_pow(exp));
        let delay_ms = self.base_delay_ms.saturating_mul(factor);
        Duration::from_millis(delay_ms.min(self.max_delay_ms))
    }
}

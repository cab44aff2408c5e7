//! Configuration types for the settlement orchestrator.

use std::time::Duration;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{MicropayError, Result, constants};

/// Top-level configuration for ticket settlement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SettlementConfig {
    /// Redemption retry policy.
    pub retry: RetryPolicy,
    /// Sender exposure / admission control.
    pub exposure: ExposureConfig,
    /// Rounds after creation in which a ticket is still accepted.
    pub ticket_validity_rounds: u64,
    /// Number of confirmed redemptions the replay guard remembers.
    pub replay_guard_capacity: usize,
    /// How long an empty per-sender redemption lane is kept.
    pub lane_idle_timeout_ms: u64,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            exposure: ExposureConfig::default(),
            ticket_validity_rounds: constants::DEFAULT_TICKET_VALIDITY_ROUNDS,
            replay_guard_capacity: constants::REPLAY_GUARD_CACHE_SIZE,
            lane_idle_timeout_ms: constants::DEFAULT_LANE_IDLE_TIMEOUT_MS,
        }
    }
}

impl SettlementConfig {
    /// Parse and validate a JSON configuration document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let cfg: Self = serde_json::from_str(json)?;
        cfg.validate()?;
        Ok(cfg)
    }

    #[must_use]
    pub fn lane_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.lane_idle_timeout_ms)
    }

    /// Reject configurations the orchestrator cannot run with.
    pub fn validate(&self) -> Result<()> {
        self.retry.validate()?;
        self.exposure.validate()?;
        if self.replay_guard_capacity == 0 {
            return Err(MicropayError::Configuration(
                "replay_guard_capacity must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Capped exponential backoff for transient redemption failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total submissions allowed per ticket, the first one included.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_backoff_ms: u64,
    /// Upper bound on any single delay.
    pub max_backoff_ms: u64,
    /// Growth factor between consecutive delays.
    pub multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: constants::DEFAULT_MAX_REDEEM_ATTEMPTS,
            initial_backoff_ms: constants::DEFAULT_INITIAL_BACKOFF_MS,
            max_backoff_ms: constants::DEFAULT_MAX_BACKOFF_MS,
            multiplier: constants::DEFAULT_BACKOFF_MULTIPLIER,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after the `attempt`-th failed submission (1-based).
    #[must_use]
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1);
        let factor = u64::from(self.multiplier).saturating_pow(exp);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(MicropayError::Configuration(
                "retry.max_attempts must be > 0".to_string(),
            ));
        }
        if self.multiplier == 0 {
            return Err(MicropayError::Configuration(
                "retry.multiplier must be > 0".to_string(),
            ));
        }
        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err(MicropayError::Configuration(format!(
                "retry.initial_backoff_ms ({}) exceeds max_backoff_ms ({})",
                self.initial_backoff_ms, self.max_backoff_ms
            )));
        }
        Ok(())
    }
}

/// Admission control against a sender's on-chain funds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExposureConfig {
    /// How long a deposit / escrow reading stays fresh.
    pub cache_ttl_ms: u64,
    /// Share of the penalty escrow held back from the deposit's coverage.
    pub escrow_reserve_ratio: Decimal,
}

impl Default for ExposureConfig {
    fn default() -> Self {
        Self {
            cache_ttl_ms: constants::DEFAULT_EXPOSURE_CACHE_TTL_MS,
            escrow_reserve_ratio: Decimal::ONE,
        }
    }
}

impl ExposureConfig {
    #[must_use]
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.escrow_reserve_ratio.is_sign_negative() {
            return Err(MicropayError::Configuration(
                "exposure.escrow_reserve_ratio must not be negative".to_string(),
            ));
        }
        Ok(())
    }
}

//! Settlement configuration.
//!
//! Every threshold the executor and the gate consult lives here so it can be
//! supplied externally; the algorithms never embed their own defaults.

use crate::error::{RentflowError, RentflowResult};
use crate::types::CurrencyUnit;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level settlement configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SettlementConfig {
    /// Status polling behavior
    #[serde(default)]
    pub poll: PollConfig,

    /// Largest single transfer accepted, in minor units
    #[serde(default = "default_per_transfer_ceiling")]
    pub per_transfer_ceiling_minor: u64,

    /// Autonomous decision gate policy
    #[serde(default)]
    pub gate: GateConfig,

    /// Currency unit used when lease terms omit one
    #[serde(default)]
    pub currency: CurrencyUnit,

    /// Submitted obligations re-polled at once during a reconciliation sweep
    #[serde(default = "default_sweep_concurrency")]
    pub sweep_concurrency: usize,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            poll: PollConfig::default(),
            per_transfer_ceiling_minor: default_per_transfer_ceiling(),
            gate: GateConfig::default(),
            currency: CurrencyUnit::default(),
            sweep_concurrency: default_sweep_concurrency(),
        }
    }
}

impl SettlementConfig {
    pub fn validate(&self) -> RentflowResult<()> {
        if self.poll.max_attempts == 0 {
            return Err(RentflowError::Configuration(
                "poll.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.sweep_concurrency == 0 {
            return Err(RentflowError::Configuration(
                "sweep_concurrency must be at least 1".to_string(),
            ));
        }
        if self.per_transfer_ceiling_minor == 0 {
            return Err(RentflowError::Configuration(
                "per_transfer_ceiling_minor must be positive".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.gate.reliability_threshold) {
            return Err(RentflowError::Configuration(format!(
                "gate.reliability_threshold {} outside 0.0..=1.0",
                self.gate.reliability_threshold
            )));
        }
        if self.gate.no_history_confidence > 100 {
            return Err(RentflowError::Configuration(
                "gate.no_history_confidence must be within 0..=100".to_string(),
            ));
        }
        if self.gate.history_window_days <= 0 {
            return Err(RentflowError::Configuration(
                "gate.history_window_days must be positive".to_string(),
            ));
        }
        self.currency
            .validate()
            .map_err(|e| RentflowError::Configuration(e.to_string()))
    }
}

/// Bounded status polling.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PollConfig {
    /// Delay between status fetches in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub interval_ms: u64,

    /// Status fetches before the outcome is reported indeterminate
    #[serde(default = "default_max_poll_attempts")]
    pub max_attempts: u32,
}

impl PollConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_poll_interval_ms(),
            max_attempts: default_max_poll_attempts(),
        }
    }
}

/// Autonomous decision gate policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GateConfig {
    /// Minimum settled/attempted ratio for autonomous approval
    #[serde(default = "default_reliability_threshold")]
    pub reliability_threshold: f64,

    /// Confidence reported when the payer has no history
    #[serde(default = "default_no_history_confidence")]
    pub no_history_confidence: u8,

    /// Lookback window for payment history
    #[serde(default = "default_history_window_days")]
    pub history_window_days: i64,

    /// Most recent terminal obligations considered
    #[serde(default = "default_history_max_samples")]
    pub history_max_samples: usize,

    /// Autonomous settlement is declined above this amount
    #[serde(default)]
    pub autonomous_max_amount_minor: Option<u64>,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            reliability_threshold: default_reliability_threshold(),
            no_history_confidence: default_no_history_confidence(),
            history_window_days: default_history_window_days(),
            history_max_samples: default_history_max_samples(),
            autonomous_max_amount_minor: None,
        }
    }
}

// Default value helpers
fn default_poll_interval_ms() -> u64 {
    2_000
}

fn default_max_poll_attempts() -> u32 {
    30
}

fn default_sweep_concurrency() -> usize {
    16
}

fn default_per_transfer_ceiling() -> u64 {
    // 50,000.000000 USDC
    50_000_000_000
}

fn default_reliability_threshold() -> f64 {
    0.8
}

fn default_no_history_confidence() -> u8 {
    60
}

fn default_history_window_days() -> i64 {
    180
}

fn default_history_max_samples() -> usize {
    50
}

//! Payment rail adapters for RentFlow.
//!
//! Exactly one rail is active per process; [`build_registry`] turns the
//! configured [`RailConfig`] into a registry the engine consumes.

#![deny(unsafe_code)]

mod custodial;
mod simulated;

pub use custodial::HttpCustodialRail;
pub use simulated::{SimulatedBehavior, SimulatedRail};

use rentflow_core::error::{RentflowError, RentflowResult};
use rentflow_core::rail::{PaymentRailAdapter, RailRegistry};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Rail backend selection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum RailConfig {
    /// Local deterministic rail
    Simulated {
        /// Status polls before a transfer settles
        #[serde(default = "default_settle_after_polls")]
        settle_after_polls: u32,
    },

    /// Custodial wallet provider REST API
    Custodial {
        base_url: String,

        /// Bearer credential; usually supplied through the environment
        #[serde(default)]
        api_key: Option<String>,

        #[serde(default = "default_request_timeout")]
        request_timeout_secs: u64,
    },
}

impl Default for RailConfig {
    fn default() -> Self {
        Self::Simulated {
            settle_after_polls: default_settle_after_polls(),
        }
    }
}

impl RailConfig {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Simulated { .. } => simulated::RAIL_ID,
            Self::Custodial { .. } => custodial::RAIL_ID,
        }
    }
}

fn default_settle_after_polls() -> u32 {
    1
}

fn default_request_timeout() -> u64 {
    10
}

/// Build the adapter for `config`. Missing credentials are a configuration error.
pub fn build_rail(config: &RailConfig) -> RentflowResult<Arc<dyn PaymentRailAdapter>> {
    match config {
        RailConfig::Simulated { settle_after_polls } => Ok(Arc::new(SimulatedRail::new(
            SimulatedBehavior::SettleAfter(*settle_after_polls),
        ))),
        RailConfig::Custodial {
            base_url,
            api_key,
            request_timeout_secs,
        } => {
            let api_key = api_key
                .as_deref()
                .map(str::trim)
                .filter(|key| !key.is_empty())
                .ok_or_else(|| {
                    RentflowError::Configuration(
                        "custodial rail requires an api key".to_string(),
                    )
                })?;
            Ok(Arc::new(HttpCustodialRail::new(
                base_url,
                api_key,
                *request_timeout_secs,
            )?))
        }
    }
}

/// Registry holding the configured rail as the active one.
pub fn build_registry(config: &RailConfig) -> RentflowResult<RailRegistry> {
    Ok(RailRegistry::with_active(build_rail(config)?))
}

/// Base58 wallet address check (32..=44 characters, no `0`, `O`, `I`, `l`).
pub fn validate_base58_wallet(wallet_id: &str) -> RentflowResult<()> {
    const ALPHABET: &str = "123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";

    if !(32..=44).contains(&wallet_id.len()) {
        return Err(RentflowError::Validation(format!(
            "wallet '{wallet_id}' must be 32 to 44 characters"
        )));
    }
    if let Some(bad) = wallet_id.chars().find(|c| !ALPHABET.contains(*c)) {
        return Err(RentflowError::Validation(format!(
            "wallet '{wallet_id}' contains non-base58 character '{bad}'"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_builds_simulated_rail() {
        let registry = build_registry(&RailConfig::default()).unwrap();
        assert_eq!(registry.active_rail(), Some("simulated"));
    }

    #[test]
    fn custodial_without_key_is_configuration_error() {
        for api_key in [None, Some("  ".to_string())] {
            let config = RailConfig::Custodial {
                base_url: "http://localhost:9".to_string(),
                api_key,
                request_timeout_secs: 5,
            };
            assert!(matches!(
                build_rail(&config),
                Err(RentflowError::Configuration(_))
            ));
        }
    }

    #[test]
    fn config_deserializes_by_backend_tag() {
        let config: RailConfig = serde_json::from_str(
            r#"{"backend":"custodial","base_url":"https://api.example.test","api_key":"k"}"#,
        )
        .unwrap();
        assert_eq!(config.label(), "custodial");
        assert!(matches!(
            config,
            RailConfig::Custodial {
                request_timeout_secs: 10,
                ..
            }
        ));
    }

    #[test]
    fn base58_wallets() {
        assert!(validate_base58_wallet("7xKXtg2CW87d97TXJSDpbD5jBkheTqA83TZRuJosgAsU").is_ok());
        assert!(validate_base58_wallet("short").is_err());
        assert!(validate_base58_wallet("0xKXtg2CW87d97TXJSDpbD5jBkheTqA83TZRuJosgAsU").is_err());
    }
}

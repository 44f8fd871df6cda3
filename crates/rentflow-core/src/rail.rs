use crate::error::{RentflowError, RentflowResult};
use crate::types::CurrencyUnit;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// One transfer handed to a rail. The amount has already passed validation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransferRequest {
    /// Obligation id, usable by rails as an idempotency key.
    pub obligation_id: String,
    pub amount_minor: u64,
    pub currency: CurrencyUnit,
    pub source_wallet: String,
    pub destination_wallet: String,
}

impl TransferRequest {
    /// Decimal rendering of the amount for rails that take decimal strings.
    pub fn decimal_amount(&self) -> String {
        self.currency.format_minor(self.amount_minor)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RailTransferState {
    Settled,
    Failed,
    InFlight,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RailSubmission {
    pub reference: String,
    pub initial_state: RailTransferState,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RailStatus {
    pub state: RailTransferState,
    pub reference: Option<String>,
    pub settled_at: Option<DateTime<Utc>>,
    pub reason: Option<String>,
}

impl RailStatus {
    pub fn in_flight() -> Self {
        Self {
            state: RailTransferState::InFlight,
            reference: None,
            settled_at: None,
            reason: None,
        }
    }

    pub fn settled(at: DateTime<Utc>) -> Self {
        Self {
            state: RailTransferState::Settled,
            reference: None,
            settled_at: Some(at),
            reason: None,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            state: RailTransferState::Failed,
            reference: None,
            settled_at: None,
            reason: Some(reason.into()),
        }
    }
}

/// Capability set implemented once per settlement backend.
///
/// Adapters translate between the rail's wire format and these types and
/// carry no settlement policy. From `submit`, `RentflowError::Rail` is an
/// explicit rejection and `RentflowError::RailUnavailable` means the rail may
/// or may not have accepted the transfer. `status` errors are treated by
/// callers as transient.
#[async_trait]
pub trait PaymentRailAdapter: Send + Sync {
    fn rail_id(&self) -> &str;

    /// Reject wallet identifiers the rail cannot route to.
    fn validate_wallet(&self, wallet_id: &str) -> RentflowResult<()>;

    /// Submit a transfer keyed by `request.obligation_id`. Resubmitting the
    /// same key must not create a second transfer.
    async fn submit(&self, request: &TransferRequest) -> RentflowResult<RailSubmission>;

    async fn status(&self, reference: &str) -> RentflowResult<RailStatus>;

    /// Find a transfer by the idempotency key it was submitted under.
    ///
    /// Used when a submission got no definite answer. `Ok(None)` means the
    /// rail has no record of the key yet. Rails without key lookup keep the
    /// default, which leaves such obligations indeterminate.
    async fn lookup(&self, _idempotency_key: &str) -> RentflowResult<Option<RailStatus>> {
        Ok(None)
    }
}

/// Registry of rail adapters with one active backend chosen at startup.
///
/// Obligations record the rail that accepted them, so a submitted obligation
/// can still be polled through its original adapter after the active rail
/// changes between restarts.
#[derive(Default)]
pub struct RailRegistry {
    adapters: HashMap<String, Arc<dyn PaymentRailAdapter>>,
    active: Option<String>,
}

impl RailRegistry {
    pub fn new() -> Self {
        Self {
            adapters: HashMap::new(),
            active: None,
        }
    }

    /// Registry with a single adapter that is also the active one.
    pub fn with_active(adapter: Arc<dyn PaymentRailAdapter>) -> Self {
        let mut registry = Self::new();
        let rail = adapter.rail_id().to_string();
        registry.register(adapter);
        registry.active = Some(rail);
        registry
    }

    pub fn register(&mut self, adapter: Arc<dyn PaymentRailAdapter>) {
        self.adapters.insert(adapter.rail_id().to_string(), adapter);
    }

    pub fn get(&self, rail: &str) -> Option<Arc<dyn PaymentRailAdapter>> {
        self.adapters.get(rail).cloned()
    }

    pub fn active_rail(&self) -> Option<&str> {
        self.active.as_deref()
    }

    /// Adapter used for new submissions.
    pub fn active(&self) -> RentflowResult<Arc<dyn PaymentRailAdapter>> {
        let rail = self.active.as_deref().ok_or_else(|| {
            RentflowError::Configuration("no payment rail configured".to_string())
        })?;
        self.get(rail).ok_or_else(|| {
            RentflowError::Configuration(format!("active rail '{rail}' is not registered"))
        })
    }

    /// Adapter for an obligation that was already submitted on `rail`.
    pub fn for_submitted(&self, rail: Option<&str>) -> RentflowResult<Arc<dyn PaymentRailAdapter>> {
        match rail {
            Some(rail) => self.get(rail).ok_or_else(|| {
                RentflowError::Configuration(format!(
                    "rail '{rail}' recorded on obligation is not registered"
                ))
            }),
            None => self.active(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct DummyRail;

    #[async_trait]
    impl PaymentRailAdapter for DummyRail {
        fn rail_id(&self) -> &str {
            "dummy"
        }

        fn validate_wallet(&self, _wallet_id: &str) -> RentflowResult<()> {
            Ok(())
        }

        async fn submit(&self, _request: &TransferRequest) -> RentflowResult<RailSubmission> {
            Ok(RailSubmission {
                reference: "r1".to_string(),
                initial_state: RailTransferState::InFlight,
            })
        }

        async fn status(&self, _reference: &str) -> RentflowResult<RailStatus> {
            Ok(RailStatus::in_flight())
        }
    }

    #[test]
    fn empty_registry_reports_configuration_error() {
        let registry = RailRegistry::new();
        assert!(matches!(
            registry.active(),
            Err(RentflowError::Configuration(_))
        ));
    }

    #[test]
    fn submitted_obligations_poll_through_their_recorded_rail() {
        let registry = RailRegistry::with_active(Arc::new(DummyRail));
        assert_eq!(registry.active_rail(), Some("dummy"));
        assert!(registry.for_submitted(Some("dummy")).is_ok());
        assert!(registry.for_submitted(None).is_ok());
        assert!(matches!(
            registry.for_submitted(Some("other")),
            Err(RentflowError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn lookup_defaults_to_unknown() {
        assert_eq!(DummyRail.lookup("ob-1").await.unwrap(), None);
    }

    #[test]
    fn rail_state_uses_wire_names() {
        let json = serde_json::to_string(&RailTransferState::InFlight).unwrap();
        assert_eq!(json, "\"IN_FLIGHT\"");
    }
}

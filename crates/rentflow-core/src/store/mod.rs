//! Persistence for leases and payment obligations.
//!
//! Obligation state changes go through [`SettlementStore::transition_obligation`],
//! a single conditional update: the write only lands when the stored state
//! still equals the expected `from` state. This is the in-flight slot for
//! submissions and the immutability guard for terminal states.

mod memory;
mod postgres;

pub use memory::InMemorySettlementStore;
pub use postgres::PostgresSettlementStore;

use crate::error::{RentflowError, RentflowResult};
use crate::types::{Lease, ObligationPatch, ObligationState, PaymentObligation};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;

/// Storage backend selection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Process memory only (development and tests)
    #[default]
    Memory,

    /// PostgreSQL for leases, obligations and the audit ledger
    Postgres {
        url: String,

        #[serde(default = "default_pool_size")]
        max_connections: u32,

        #[serde(default = "default_connect_timeout")]
        connect_timeout_secs: u64,
    },
}

impl StorageConfig {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Postgres { .. } => "postgres",
        }
    }
}

fn default_pool_size() -> u32 {
    10
}

fn default_connect_timeout() -> u64 {
    5
}

pub async fn connect_pool(
    url: &str,
    max_connections: u32,
    connect_timeout_secs: u64,
) -> RentflowResult<PgPool> {
    PgPoolOptions::new()
        .max_connections(max_connections.max(1))
        .acquire_timeout(Duration::from_secs(connect_timeout_secs.max(1)))
        .connect(url)
        .await
        .map_err(|e| RentflowError::Storage(format!("postgres connect failed: {e}")))
}

/// Lease and obligation persistence.
#[async_trait]
pub trait SettlementStore: Send + Sync {
    fn backend_label(&self) -> &'static str;

    /// Insert a new lease; fails if the id is already taken.
    async fn insert_lease(&self, lease: &Lease) -> RentflowResult<()>;

    async fn get_lease(&self, lease_id: &str) -> RentflowResult<Option<Lease>>;

    /// Overwrite an existing lease. Callers hold the per-lease lock.
    async fn update_lease(&self, lease: &Lease) -> RentflowResult<()>;

    /// Leases whose activation signal still awaits delivery.
    async fn list_leases_pending_signal(&self) -> RentflowResult<Vec<Lease>>;

    /// Insert obligations all-or-nothing. A second obligation with the same
    /// [`dedupe_key`] is rejected.
    async fn insert_obligations(&self, obligations: &[PaymentObligation]) -> RentflowResult<()>;

    async fn get_obligation(&self, obligation_id: &str)
        -> RentflowResult<Option<PaymentObligation>>;

    async fn list_obligations_for_lease(
        &self,
        lease_id: &str,
    ) -> RentflowResult<Vec<PaymentObligation>>;

    async fn list_obligations_in_state(
        &self,
        state: ObligationState,
    ) -> RentflowResult<Vec<PaymentObligation>>;

    /// Terminal obligations for a payer updated at or after `since`, newest first.
    async fn list_payer_history(
        &self,
        payer_id: &str,
        since: DateTime<Utc>,
        limit: usize,
    ) -> RentflowResult<Vec<PaymentObligation>>;

    /// Conditional state change `from -> to` with field updates.
    async fn transition_obligation(
        &self,
        obligation_id: &str,
        from: ObligationState,
        to: ObligationState,
        patch: ObligationPatch,
    ) -> RentflowResult<PaymentObligation>;
}

/// Key that makes obligation generation idempotent at the storage level.
pub fn dedupe_key(obligation: &PaymentObligation) -> String {
    match &obligation.replaces {
        Some(failed_id) => format!("replaces:{failed_id}"),
        None => format!("{}:{}", obligation.lease_id, obligation.kind.label()),
    }
}

/// Error for a conditional update whose expected state no longer holds.
pub(crate) fn stale_transition(
    obligation_id: &str,
    from: ObligationState,
    current: ObligationState,
) -> RentflowError {
    if from == ObligationState::Pending && current.is_in_flight() {
        RentflowError::SubmissionConflict {
            obligation_id: obligation_id.to_string(),
            state: current.to_string(),
        }
    } else {
        RentflowError::InvalidState(format!(
            "obligation '{obligation_id}' expected '{from}' but is '{current}'"
        ))
    }
}

pub(crate) fn check_transition(
    obligation_id: &str,
    from: ObligationState,
    to: ObligationState,
) -> RentflowResult<()> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(RentflowError::transition_violation(
            &format!("obligation '{obligation_id}'"),
            from.as_str(),
            to.as_str(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_config_parses_tagged_postgres() {
        let config: StorageConfig =
            serde_json::from_str(r#"{"type": "postgres", "url": "postgres://localhost/rentflow"}"#)
                .unwrap();
        assert_eq!(config.label(), "postgres");
        assert!(matches!(
            config,
            StorageConfig::Postgres {
                max_connections: 10,
                ..
            }
        ));
    }

    #[test]
    fn pending_conflict_names_current_state() {
        let err = stale_transition("obl-1", ObligationState::Pending, ObligationState::Submitting);
        assert!(matches!(err, RentflowError::SubmissionConflict { ref state, .. } if state == "submitting"));

        let err = stale_transition("obl-1", ObligationState::Submitted, ObligationState::Settled);
        assert!(matches!(err, RentflowError::InvalidState(_)));
    }
}

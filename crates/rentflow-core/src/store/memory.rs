//! In-memory settlement store

use super::{check_transition, dedupe_key, stale_transition, SettlementStore};
use crate::error::{RentflowError, RentflowResult};
use crate::types::{Lease, ObligationPatch, ObligationState, PaymentObligation};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

#[derive(Debug, Default)]
struct ObligationTable {
    rows: HashMap<String, PaymentObligation>,
    dedupe_keys: HashSet<String>,
}

/// In-memory store for development and testing.
///
/// Obligation rows sit behind one mutex so the compare-and-set in
/// `transition_obligation` is atomic with respect to concurrent callers.
#[derive(Debug, Clone, Default)]
pub struct InMemorySettlementStore {
    leases: Arc<RwLock<HashMap<String, Lease>>>,
    obligations: Arc<Mutex<ObligationTable>>,
}

impl InMemorySettlementStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SettlementStore for InMemorySettlementStore {
    fn backend_label(&self) -> &'static str {
        "memory"
    }

    async fn insert_lease(&self, lease: &Lease) -> RentflowResult<()> {
        let mut leases = self.leases.write().await;
        if leases.contains_key(&lease.lease_id) {
            return Err(RentflowError::Validation(format!(
                "lease '{}' already exists",
                lease.lease_id
            )));
        }
        leases.insert(lease.lease_id.clone(), lease.clone());
        Ok(())
    }

    async fn get_lease(&self, lease_id: &str) -> RentflowResult<Option<Lease>> {
        let leases = self.leases.read().await;
        Ok(leases.get(lease_id).cloned())
    }

    async fn update_lease(&self, lease: &Lease) -> RentflowResult<()> {
        let mut leases = self.leases.write().await;
        match leases.get_mut(&lease.lease_id) {
            Some(existing) => {
                *existing = lease.clone();
                Ok(())
            }
            None => Err(RentflowError::LeaseNotFound(lease.lease_id.clone())),
        }
    }

    async fn list_leases_pending_signal(&self) -> RentflowResult<Vec<Lease>> {
        let leases = self.leases.read().await;
        let mut pending: Vec<Lease> = leases
            .values()
            .filter(|l| l.activation_signal_pending)
            .cloned()
            .collect();
        pending.sort_by_key(|l| l.updated_at);
        Ok(pending)
    }

    async fn insert_obligations(&self, obligations: &[PaymentObligation]) -> RentflowResult<()> {
        let mut table = self.obligations.lock().await;

        let mut batch_keys = HashSet::new();
        for obligation in obligations {
            let key = dedupe_key(obligation);
            if table.dedupe_keys.contains(&key)
                || table.rows.contains_key(&obligation.obligation_id)
                || !batch_keys.insert(key.clone())
            {
                return Err(RentflowError::InvalidState(format!(
                    "obligation '{key}' already exists"
                )));
            }
        }

        for obligation in obligations {
            table.dedupe_keys.insert(dedupe_key(obligation));
            table
                .rows
                .insert(obligation.obligation_id.clone(), obligation.clone());
        }
        Ok(())
    }

    async fn get_obligation(
        &self,
        obligation_id: &str,
    ) -> RentflowResult<Option<PaymentObligation>> {
        let table = self.obligations.lock().await;
        Ok(table.rows.get(obligation_id).cloned())
    }

    async fn list_obligations_for_lease(
        &self,
        lease_id: &str,
    ) -> RentflowResult<Vec<PaymentObligation>> {
        let table = self.obligations.lock().await;
        let mut rows: Vec<_> = table
            .rows
            .values()
            .filter(|o| o.lease_id == lease_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.obligation_id.cmp(&b.obligation_id))
        });
        Ok(rows)
    }

    async fn list_obligations_in_state(
        &self,
        state: ObligationState,
    ) -> RentflowResult<Vec<PaymentObligation>> {
        let table = self.obligations.lock().await;
        let mut rows: Vec<_> = table
            .rows
            .values()
            .filter(|o| o.state == state)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.updated_at.cmp(&b.updated_at));
        Ok(rows)
    }

    async fn list_payer_history(
        &self,
        payer_id: &str,
        since: DateTime<Utc>,
        limit: usize,
    ) -> RentflowResult<Vec<PaymentObligation>> {
        let table = self.obligations.lock().await;
        let mut rows: Vec<_> = table
            .rows
            .values()
            .filter(|o| o.payer_id == payer_id && o.state.is_terminal() && o.updated_at >= since)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn transition_obligation(
        &self,
        obligation_id: &str,
        from: ObligationState,
        to: ObligationState,
        patch: ObligationPatch,
    ) -> RentflowResult<PaymentObligation> {
        check_transition(obligation_id, from, to)?;

        let mut table = self.obligations.lock().await;
        let row = table
            .rows
            .get_mut(obligation_id)
            .ok_or_else(|| RentflowError::ObligationNotFound(obligation_id.to_string()))?;

        if row.state != from {
            return Err(stale_transition(obligation_id, from, row.state));
        }

        row.state = to;
        row.updated_at = Utc::now();
        patch.apply(row);
        Ok(row.clone())
    }
}

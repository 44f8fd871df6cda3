use crate::error::{RentflowError, RentflowResult};
use crate::ledger::{AuditEvent, EntrySubject};
use crate::ledger_storage::SharedLedger;
use crate::store::SettlementStore;
use crate::types::{Lease, LeaseState, ObligationKind, ObligationState, PaymentObligation};
use chrono::{DateTime, Months, Utc};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Derives the payments a lease requires.
///
/// Every method is idempotent: asking twice returns what the first call
/// created. Callers serialize on the lease lock.
pub struct PaymentObligationGenerator {
    store: Arc<dyn SettlementStore>,
    ledger: SharedLedger,
}

impl PaymentObligationGenerator {
    pub fn new(store: Arc<dyn SettlementStore>, ledger: SharedLedger) -> Self {
        Self { store, ledger }
    }

    /// Deposit and first-period rent for a fully signed lease.
    pub async fn generate(&self, lease: &Lease) -> RentflowResult<Vec<PaymentObligation>> {
        if !lease.is_fully_signed() {
            return Err(RentflowError::InvalidState(format!(
                "lease '{}' needs both signatures before obligations are generated",
                lease.lease_id
            )));
        }

        let existing: Vec<_> = self
            .store
            .list_obligations_for_lease(&lease.lease_id)
            .await?
            .into_iter()
            .filter(|o| o.kind.gates_activation() && o.replaces.is_none())
            .collect();
        if !existing.is_empty() {
            debug!(
                lease_id = %lease.lease_id,
                count = existing.len(),
                "obligations already generated"
            );
            return Ok(existing);
        }

        let now = Utc::now();
        let obligations = vec![
            build_obligation(
                lease,
                ObligationKind::Deposit,
                lease.deposit_amount_minor,
                format!("{}:deposit", lease.lease_id),
                now,
            ),
            build_obligation(
                lease,
                ObligationKind::FirstPeriodRent,
                lease.monthly_amount_minor,
                lease.start_date.date_naive().to_string(),
                now,
            ),
        ];
        self.store.insert_obligations(&obligations).await?;
        self.record_generated(&obligations).await?;

        info!(
            lease_id = %lease.lease_id,
            deposit_minor = lease.deposit_amount_minor,
            rent_minor = lease.monthly_amount_minor,
            "generated activation obligations"
        );
        Ok(obligations)
    }

    /// New pending obligation superseding a failed one.
    pub async fn replacement(&self, failed_obligation_id: &str) -> RentflowResult<PaymentObligation> {
        let failed = self
            .store
            .get_obligation(failed_obligation_id)
            .await?
            .ok_or_else(|| RentflowError::ObligationNotFound(failed_obligation_id.to_string()))?;

        if failed.state != ObligationState::Failed {
            return Err(RentflowError::InvalidState(format!(
                "obligation '{}' is '{}'; only failed obligations can be replaced",
                failed.obligation_id, failed.state
            )));
        }

        let siblings = self
            .store
            .list_obligations_for_lease(&failed.lease_id)
            .await?;
        if let Some(existing) = siblings
            .into_iter()
            .find(|o| o.replaces.as_deref() == Some(failed.obligation_id.as_str()))
        {
            return Ok(existing);
        }

        let now = Utc::now();
        let replacement = PaymentObligation {
            obligation_id: Uuid::new_v4().to_string(),
            state: ObligationState::Pending,
            rail: None,
            external_reference: None,
            failure_reason: None,
            settled_at: None,
            replaces: Some(failed.obligation_id.clone()),
            created_at: now,
            updated_at: now,
            ..failed
        };
        self.store
            .insert_obligations(std::slice::from_ref(&replacement))
            .await?;
        self.record_generated(std::slice::from_ref(&replacement))
            .await?;

        info!(
            lease_id = %replacement.lease_id,
            obligation_id = %replacement.obligation_id,
            replaces = %failed_obligation_id,
            "generated replacement obligation"
        );
        Ok(replacement)
    }

    /// Rent for billing period `period` (period 1 is the first-period rent).
    pub async fn recurring(&self, lease: &Lease, period: u32) -> RentflowResult<PaymentObligation> {
        if lease.state != LeaseState::Active {
            return Err(RentflowError::InvalidState(format!(
                "recurring rent requires an active lease; '{}' is '{}'",
                lease.lease_id, lease.state
            )));
        }
        if period < 2 {
            return Err(RentflowError::Validation(
                "recurring rent periods start at 2".to_string(),
            ));
        }

        let kind = ObligationKind::RecurringRent { period };
        if let Some(existing) = self
            .store
            .list_obligations_for_lease(&lease.lease_id)
            .await?
            .into_iter()
            .find(|o| o.kind == kind && o.replaces.is_none())
        {
            return Ok(existing);
        }

        let due = lease
            .start_date
            .checked_add_months(Months::new(period - 1))
            .ok_or_else(|| RentflowError::Validation(format!("period {period} out of range")))?;
        if due >= lease.end_date {
            return Err(RentflowError::Validation(format!(
                "period {period} starts after lease '{}' ends",
                lease.lease_id
            )));
        }

        let obligation = build_obligation(
            lease,
            kind,
            lease.monthly_amount_minor,
            due.date_naive().to_string(),
            Utc::now(),
        );
        self.store
            .insert_obligations(std::slice::from_ref(&obligation))
            .await?;
        self.record_generated(std::slice::from_ref(&obligation))
            .await?;
        Ok(obligation)
    }

    async fn record_generated(&self, obligations: &[PaymentObligation]) -> RentflowResult<()> {
        let mut ledger = self.ledger.lock().await;
        for obligation in obligations {
            ledger
                .append_audit(
                    EntrySubject::obligation(&obligation.lease_id, &obligation.obligation_id),
                    AuditEvent::new(
                        "obligation_generated",
                        format!(
                            "kind={} amount_minor={} due={}{}",
                            obligation.kind.label(),
                            obligation.amount_minor,
                            obligation.due_reference,
                            obligation
                                .replaces
                                .as_deref()
                                .map(|id| format!(" replaces={id}"))
                                .unwrap_or_default()
                        ),
                    ),
                )
                .await?;
        }
        Ok(())
    }
}

fn build_obligation(
    lease: &Lease,
    kind: ObligationKind,
    amount_minor: i64,
    due_reference: String,
    now: DateTime<Utc>,
) -> PaymentObligation {
    PaymentObligation {
        obligation_id: Uuid::new_v4().to_string(),
        lease_id: lease.lease_id.clone(),
        kind,
        payer_id: lease.tenant_id.clone(),
        payee_id: lease.landlord_id.clone(),
        amount_minor,
        currency: lease.currency.clone(),
        due_reference,
        state: ObligationState::Pending,
        rail: None,
        external_reference: None,
        failure_reason: None,
        settled_at: None,
        replaces: None,
        created_at: now,
        updated_at: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{signed_lease, terms};
    use crate::ledger_storage::PersistentLedger;
    use crate::store::InMemorySettlementStore;
    use crate::types::ObligationPatch;

    fn generator() -> (PaymentObligationGenerator, Arc<InMemorySettlementStore>) {
        let store = Arc::new(InMemorySettlementStore::new());
        let generator =
            PaymentObligationGenerator::new(store.clone(), PersistentLedger::memory().shared());
        (generator, store)
    }

    #[tokio::test]
    async fn generates_deposit_and_first_rent_once() {
        let (generator, store) = generator();
        let lease = signed_lease(terms("lease-g1"));
        store.insert_lease(&lease).await.unwrap();

        let first = generator.generate(&lease).await.unwrap();
        assert_eq!(first.len(), 2);
        assert!(first.iter().all(|o| o.state == ObligationState::Pending));
        assert!(first.iter().all(|o| o.payer_id == lease.tenant_id));
        assert!(first
            .iter()
            .any(|o| o.kind == ObligationKind::Deposit && o.amount_minor == lease.deposit_amount_minor));
        assert!(first.iter().any(|o| o.kind == ObligationKind::FirstPeriodRent
            && o.amount_minor == lease.monthly_amount_minor));

        let second = generator.generate(&lease).await.unwrap();
        assert_eq!(second.len(), 2);
        assert_eq!(
            store.list_obligations_for_lease("lease-g1").await.unwrap().len(),
            2
        );
    }

    #[tokio::test]
    async fn refuses_single_signature() {
        let (generator, _) = generator();
        let mut lease = signed_lease(terms("lease-g2"));
        lease.tenant_signature = None;

        assert!(matches!(
            generator.generate(&lease).await,
            Err(RentflowError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn replacement_requires_failed_and_is_idempotent() {
        let (generator, store) = generator();
        let lease = signed_lease(terms("lease-g3"));
        let generated = generator.generate(&lease).await.unwrap();
        let deposit = generated
            .iter()
            .find(|o| o.kind == ObligationKind::Deposit)
            .unwrap();

        assert!(generator.replacement(&deposit.obligation_id).await.is_err());

        store
            .transition_obligation(
                &deposit.obligation_id,
                ObligationState::Pending,
                ObligationState::Submitting,
                ObligationPatch::default(),
            )
            .await
            .unwrap();
        store
            .transition_obligation(
                &deposit.obligation_id,
                ObligationState::Submitting,
                ObligationState::Failed,
                ObligationPatch::failed("rejected"),
            )
            .await
            .unwrap();

        let replacement = generator.replacement(&deposit.obligation_id).await.unwrap();
        assert_eq!(replacement.kind, ObligationKind::Deposit);
        assert_eq!(replacement.state, ObligationState::Pending);
        assert_eq!(replacement.replaces.as_deref(), Some(deposit.obligation_id.as_str()));

        let again = generator.replacement(&deposit.obligation_id).await.unwrap();
        assert_eq!(again.obligation_id, replacement.obligation_id);
        assert_eq!(
            store.list_obligations_for_lease("lease-g3").await.unwrap().len(),
            3
        );
    }

    #[tokio::test]
    async fn recurring_rent_requires_active_lease() {
        let (generator, _) = generator();
        let mut lease = signed_lease(terms("lease-g4"));
        lease.state = LeaseState::AwaitingPayment;
        assert!(generator.recurring(&lease, 2).await.is_err());

        lease.state = LeaseState::Active;
        let rent = generator.recurring(&lease, 2).await.unwrap();
        assert_eq!(rent.kind, ObligationKind::RecurringRent { period: 2 });
        let again = generator.recurring(&lease, 2).await.unwrap();
        assert_eq!(again.obligation_id, rent.obligation_id);
        assert!(generator.recurring(&lease, 1).await.is_err());
    }
}

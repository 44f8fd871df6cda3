//! Lease lifecycle driven by signature events.
//!
//! ```text
//! draft -> pending_counterparty -> fully_signed -> awaiting_payment -> active
//!   |              |                                                  |   |
//!   +--> withdrawn <+                                     terminated <-+   +-> completed
//! ```
//!
//! `awaiting_payment -> active` belongs to the payment reconciler; everything
//! else is driven from here. All mutations of one lease serialize on
//! [`LeaseLocks`].

use crate::error::{RentflowError, RentflowResult};
use crate::ledger::{AuditEvent, EntrySubject};
use crate::ledger_storage::SharedLedger;
use crate::obligations::PaymentObligationGenerator;
use crate::store::SettlementStore;
use crate::types::{
    signature_digest, Lease, LeaseState, LeaseTerms, PartyRole, PaymentObligation,
    SignatureProof, SignatureRecord,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{info, warn};

type LockTable = Arc<StdMutex<HashMap<String, Arc<Mutex<()>>>>>;

/// Per-lease async locks shared by the state machine and the reconciler.
///
/// An entry lives only while some task holds or waits for that lease.
#[derive(Debug, Clone, Default)]
pub struct LeaseLocks {
    inner: LockTable,
}

impl LeaseLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, lease_id: &str) -> LeaseGuard {
        let lock = {
            let mut locks = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            locks.entry(lease_id.to_string()).or_default().clone()
        };
        LeaseGuard {
            lease_id: lease_id.to_string(),
            table: self.inner.clone(),
            guard: Some(lock.lock_owned().await),
        }
    }

    /// Leases with a live lock entry.
    pub fn tracked(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Exclusive hold on one lease; releases and prunes its table entry on drop.
#[derive(Debug)]
pub struct LeaseGuard {
    lease_id: String,
    table: LockTable,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        self.guard.take();
        let mut locks = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        // Waiters hold a clone of the Arc, so a count of one means nobody is queued.
        if locks
            .get(&self.lease_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.lease_id);
        }
    }
}

pub(crate) fn lease_transition_allowed(from: LeaseState, to: LeaseState) -> bool {
    use LeaseState::*;
    matches!(
        (from, to),
        (Draft, PendingCounterparty)
            | (PendingCounterparty, FullySigned)
            | (FullySigned, AwaitingPayment)
            | (AwaitingPayment, Active)
            | (Draft, Withdrawn)
            | (PendingCounterparty, Withdrawn)
            | (Active, Terminated)
            | (Active, Completed)
    )
}

/// Move `lease` to `next`, stamping timestamps. Does not persist.
pub(crate) fn apply_transition(
    lease: &mut Lease,
    next: LeaseState,
    now: DateTime<Utc>,
) -> RentflowResult<()> {
    if !lease_transition_allowed(lease.state, next) {
        return Err(RentflowError::transition_violation(
            &format!("lease '{}'", lease.lease_id),
            lease.state.as_str(),
            next.as_str(),
        ));
    }
    lease.state = next;
    lease.updated_at = now;
    if next == LeaseState::Active {
        lease.activated_at = Some(now);
    }
    Ok(())
}

/// Result of a signature event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SignOutcome {
    pub lease_id: String,
    /// State after the event and any automatic follow-up transitions.
    pub lease_state: LeaseState,
    /// Every state the lease passed through, in order.
    pub transitions: Vec<LeaseState>,
    /// Obligations generated by this event (empty unless it completed the pair).
    pub obligations: Vec<PaymentObligation>,
    pub activated: bool,
}

/// Read-only lease verification: both parties signed and the lease is live.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LeaseVerification {
    pub lease_id: String,
    pub landlord_signed: bool,
    pub tenant_signed: bool,
    pub state: LeaseState,
    pub valid: bool,
}

pub struct LeaseSignatureStateMachine {
    store: Arc<dyn SettlementStore>,
    ledger: SharedLedger,
    generator: Arc<PaymentObligationGenerator>,
    locks: LeaseLocks,
}

impl LeaseSignatureStateMachine {
    pub fn new(
        store: Arc<dyn SettlementStore>,
        ledger: SharedLedger,
        generator: Arc<PaymentObligationGenerator>,
        locks: LeaseLocks,
    ) -> Self {
        Self {
            store,
            ledger,
            generator,
            locks,
        }
    }

    /// Create a draft lease from manager-issued terms.
    pub async fn issue(&self, terms: LeaseTerms) -> RentflowResult<Lease> {
        let lease = Lease::from_terms(terms)?;
        let _guard = self.locks.acquire(&lease.lease_id).await;

        self.store.insert_lease(&lease).await?;
        self.audit(
            &lease.lease_id,
            "lease_created",
            format!(
                "property={} landlord={} tenant={} monthly_minor={} deposit_minor={} terms_digest={}",
                lease.property_id,
                lease.landlord_id,
                lease.tenant_id,
                lease.monthly_amount_minor,
                lease.deposit_amount_minor,
                lease.terms_digest
            ),
        )
        .await?;

        info!(lease_id = %lease.lease_id, "lease issued");
        Ok(lease)
    }

    pub async fn get(&self, lease_id: &str) -> RentflowResult<Lease> {
        self.store
            .get_lease(lease_id)
            .await?
            .ok_or_else(|| RentflowError::LeaseNotFound(lease_id.to_string()))
    }

    /// Record one party's signature.
    ///
    /// The second signature moves the lease through `fully_signed` to
    /// `awaiting_payment` and generates the activation obligations in the
    /// same call. Audit entries are appended before the lease is saved, so
    /// on any error the signature is not stored and the caller may retry.
    pub async fn sign(
        &self,
        lease_id: &str,
        role: PartyRole,
        proof: SignatureProof,
    ) -> RentflowResult<SignOutcome> {
        let _guard = self.locks.acquire(lease_id).await;
        let mut lease = self.get(lease_id).await?;

        if lease.signature(role).is_some() {
            warn!(lease_id, role = %role, "duplicate signature rejected");
            return Err(RentflowError::DuplicateSignature {
                lease_id: lease_id.to_string(),
                role: role.to_string(),
            });
        }
        if !lease.state.accepts_signatures() {
            return Err(RentflowError::InvalidState(format!(
                "lease '{lease_id}' is '{}' and no longer accepts signatures",
                lease.state
            )));
        }
        verify_proof(&lease, role, &proof)?;

        let now = Utc::now();
        lease.set_signature(
            role,
            SignatureRecord {
                signer_id: proof.signer_id,
                digest: proof.digest,
                signed_at: now,
            },
        );

        let mut transitions = Vec::new();
        let mut obligations = Vec::new();
        if lease.signature(role.counterpart()).is_none() {
            apply_transition(&mut lease, LeaseState::PendingCounterparty, now)?;
            transitions.push(LeaseState::PendingCounterparty);
        } else {
            apply_transition(&mut lease, LeaseState::FullySigned, now)?;
            transitions.push(LeaseState::FullySigned);

            obligations = self.generator.generate(&lease).await?;
            apply_transition(&mut lease, LeaseState::AwaitingPayment, now)?;
            transitions.push(LeaseState::AwaitingPayment);
        }

        self.audit(lease_id, "lease_signed", format!("role={role}"))
            .await?;
        let mut previous = if transitions.len() == 1 {
            LeaseState::Draft
        } else {
            LeaseState::PendingCounterparty
        };
        for state in &transitions {
            self.audit(
                lease_id,
                "lease_status_changed",
                format!("{previous} -> {state}"),
            )
            .await?;
            previous = *state;
        }
        self.store.update_lease(&lease).await?;

        info!(
            lease_id,
            role = %role,
            state = %lease.state,
            obligations = obligations.len(),
            "lease signature recorded"
        );

        Ok(SignOutcome {
            lease_id: lease_id.to_string(),
            lease_state: lease.state,
            transitions,
            activated: lease.state == LeaseState::Active,
            obligations,
        })
    }

    /// Withdraw a lease before both parties have signed.
    pub async fn withdraw(&self, lease_id: &str, reason: &str) -> RentflowResult<Lease> {
        self.transition(lease_id, LeaseState::Withdrawn, reason, Utc::now())
            .await
    }

    /// End an active lease early.
    pub async fn terminate(&self, lease_id: &str, reason: &str) -> RentflowResult<Lease> {
        self.transition(lease_id, LeaseState::Terminated, reason, Utc::now())
            .await
    }

    /// Close an active lease whose end date has passed at `now`.
    pub async fn complete(&self, lease_id: &str, now: DateTime<Utc>) -> RentflowResult<Lease> {
        {
            let lease = self.get(lease_id).await?;
            if now < lease.end_date {
                return Err(RentflowError::InvalidState(format!(
                    "lease '{lease_id}' has not ended (ends {})",
                    lease.end_date
                )));
            }
        }
        self.transition(lease_id, LeaseState::Completed, "end date reached", now)
            .await
    }

    pub async fn verify(&self, lease_id: &str) -> RentflowResult<LeaseVerification> {
        let lease = self.get(lease_id).await?;
        let landlord_signed = lease.landlord_signature.is_some();
        let tenant_signed = lease.tenant_signature.is_some();
        Ok(LeaseVerification {
            valid: landlord_signed && tenant_signed && lease.state == LeaseState::Active,
            lease_id: lease.lease_id,
            landlord_signed,
            tenant_signed,
            state: lease.state,
        })
    }

    async fn transition(
        &self,
        lease_id: &str,
        next: LeaseState,
        reason: &str,
        now: DateTime<Utc>,
    ) -> RentflowResult<Lease> {
        let _guard = self.locks.acquire(lease_id).await;
        let mut lease = self.get(lease_id).await?;
        let previous = lease.state;

        apply_transition(&mut lease, next, now)?;
        self.audit(
            lease_id,
            "lease_status_changed",
            format!("{previous} -> {next}: {reason}"),
        )
        .await?;
        self.store.update_lease(&lease).await?;

        info!(lease_id, from = %previous, to = %next, "lease status changed");
        Ok(lease)
    }

    async fn audit(&self, lease_id: &str, stage: &str, detail: String) -> RentflowResult<()> {
        self.ledger
            .lock()
            .await
            .append_audit(EntrySubject::lease(lease_id), AuditEvent::new(stage, detail))
            .await?;
        Ok(())
    }
}

fn verify_proof(lease: &Lease, role: PartyRole, proof: &SignatureProof) -> RentflowResult<()> {
    if proof.signer_id != lease.party_id(role) {
        return Err(RentflowError::InvalidProof(format!(
            "signer '{}' is not the {role} of lease '{}'",
            proof.signer_id, lease.lease_id
        )));
    }
    let expected = signature_digest(&lease.terms_digest, role, &proof.signer_id);
    if proof.digest != expected {
        return Err(RentflowError::InvalidProof(format!(
            "digest does not match the terms of lease '{}'",
            lease.lease_id
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::terms;
    use crate::ledger_storage::PersistentLedger;
    use crate::store::InMemorySettlementStore;
    use crate::types::{ObligationKind, ObligationState};
    use chrono::Duration;

    struct Harness {
        machine: Arc<LeaseSignatureStateMachine>,
        store: Arc<InMemorySettlementStore>,
        ledger: SharedLedger,
    }

    fn harness() -> Harness {
        let store = Arc::new(InMemorySettlementStore::new());
        let ledger = PersistentLedger::memory().shared();
        let generator = Arc::new(PaymentObligationGenerator::new(
            store.clone(),
            ledger.clone(),
        ));
        let machine = Arc::new(LeaseSignatureStateMachine::new(
            store.clone(),
            ledger.clone(),
            generator,
            LeaseLocks::new(),
        ));
        Harness {
            machine,
            store,
            ledger,
        }
    }

    #[tokio::test]
    async fn landlord_then_tenant_reaches_awaiting_payment() {
        let h = harness();
        let lease = h.machine.issue(terms("lease-s1")).await.unwrap();
        assert_eq!(lease.state, LeaseState::Draft);

        let first = h
            .machine
            .sign(
                "lease-s1",
                PartyRole::Landlord,
                SignatureProof::for_party(&lease, PartyRole::Landlord),
            )
            .await
            .unwrap();
        assert_eq!(first.lease_state, LeaseState::PendingCounterparty);
        assert!(first.obligations.is_empty());
        assert!(h
            .store
            .list_obligations_for_lease("lease-s1")
            .await
            .unwrap()
            .is_empty());

        let second = h
            .machine
            .sign(
                "lease-s1",
                PartyRole::Tenant,
                SignatureProof::for_party(&lease, PartyRole::Tenant),
            )
            .await
            .unwrap();
        assert_eq!(
            second.transitions,
            vec![LeaseState::FullySigned, LeaseState::AwaitingPayment]
        );
        assert_eq!(second.lease_state, LeaseState::AwaitingPayment);
        assert!(!second.activated);

        let kinds: Vec<_> = second.obligations.iter().map(|o| o.kind).collect();
        assert!(kinds.contains(&ObligationKind::Deposit));
        assert!(kinds.contains(&ObligationKind::FirstPeriodRent));
        assert!(second
            .obligations
            .iter()
            .all(|o| o.state == ObligationState::Pending));
        assert!(h.ledger.lock().await.verify_chain());
    }

    #[tokio::test]
    async fn tenant_may_sign_first() {
        let h = harness();
        let lease = h.machine.issue(terms("lease-s2")).await.unwrap();

        let first = h
            .machine
            .sign(
                "lease-s2",
                PartyRole::Tenant,
                SignatureProof::for_party(&lease, PartyRole::Tenant),
            )
            .await
            .unwrap();
        assert_eq!(first.lease_state, LeaseState::PendingCounterparty);

        let second = h
            .machine
            .sign(
                "lease-s2",
                PartyRole::Landlord,
                SignatureProof::for_party(&lease, PartyRole::Landlord),
            )
            .await
            .unwrap();
        assert_eq!(second.lease_state, LeaseState::AwaitingPayment);
        assert_eq!(second.obligations.len(), 2);
    }

    #[tokio::test]
    async fn duplicate_signature_leaves_state_unchanged() {
        let h = harness();
        let lease = h.machine.issue(terms("lease-s3")).await.unwrap();
        let proof = SignatureProof::for_party(&lease, PartyRole::Landlord);
        h.machine
            .sign("lease-s3", PartyRole::Landlord, proof.clone())
            .await
            .unwrap();

        let err = h
            .machine
            .sign("lease-s3", PartyRole::Landlord, proof)
            .await
            .unwrap_err();
        assert!(matches!(err, RentflowError::DuplicateSignature { .. }));
        assert_eq!(
            h.machine.get("lease-s3").await.unwrap().state,
            LeaseState::PendingCounterparty
        );
    }

    #[tokio::test]
    async fn rejects_unknown_lease_and_bad_proofs() {
        let h = harness();
        let lease = h.machine.issue(terms("lease-s4")).await.unwrap();

        let missing = h
            .machine
            .sign(
                "lease-missing",
                PartyRole::Tenant,
                SignatureProof::for_party(&lease, PartyRole::Tenant),
            )
            .await;
        assert!(matches!(missing, Err(RentflowError::LeaseNotFound(_))));

        // Landlord's proof presented as the tenant.
        let wrong_signer = h
            .machine
            .sign(
                "lease-s4",
                PartyRole::Tenant,
                SignatureProof::for_party(&lease, PartyRole::Landlord),
            )
            .await;
        assert!(matches!(wrong_signer, Err(RentflowError::InvalidProof(_))));

        let mut forged = SignatureProof::for_party(&lease, PartyRole::Tenant);
        forged.digest = "00".repeat(32);
        let bad_digest = h.machine.sign("lease-s4", PartyRole::Tenant, forged).await;
        assert!(matches!(bad_digest, Err(RentflowError::InvalidProof(_))));

        assert_eq!(
            h.machine.get("lease-s4").await.unwrap().state,
            LeaseState::Draft
        );
    }

    #[tokio::test]
    async fn concurrent_counter_signatures_generate_one_set() {
        let h = harness();
        let lease = h.machine.issue(terms("lease-s5")).await.unwrap();

        let landlord = {
            let machine = h.machine.clone();
            let proof = SignatureProof::for_party(&lease, PartyRole::Landlord);
            tokio::spawn(async move { machine.sign("lease-s5", PartyRole::Landlord, proof).await })
        };
        let tenant = {
            let machine = h.machine.clone();
            let proof = SignatureProof::for_party(&lease, PartyRole::Tenant);
            tokio::spawn(async move { machine.sign("lease-s5", PartyRole::Tenant, proof).await })
        };
        landlord.await.unwrap().unwrap();
        tenant.await.unwrap().unwrap();

        assert_eq!(
            h.machine.get("lease-s5").await.unwrap().state,
            LeaseState::AwaitingPayment
        );
        assert_eq!(
            h.store
                .list_obligations_for_lease("lease-s5")
                .await
                .unwrap()
                .len(),
            2
        );
    }

    #[tokio::test]
    async fn withdraw_only_before_full_signature() {
        let h = harness();
        h.machine.issue(terms("lease-s6")).await.unwrap();
        let withdrawn = h.machine.withdraw("lease-s6", "unit rented").await.unwrap();
        assert_eq!(withdrawn.state, LeaseState::Withdrawn);
        assert!(h.machine.withdraw("lease-s6", "again").await.is_err());
    }

    #[tokio::test]
    async fn completion_requires_end_date() {
        let h = harness();
        let mut lease = h.machine.issue(terms("lease-s7")).await.unwrap();
        lease.state = LeaseState::Active;
        h.store.update_lease(&lease).await.unwrap();

        let early = h.machine.complete("lease-s7", Utc::now()).await;
        assert!(matches!(early, Err(RentflowError::InvalidState(_))));

        let done = h
            .machine
            .complete("lease-s7", lease.end_date + Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(done.state, LeaseState::Completed);
        assert!(h.machine.terminate("lease-s7", "late").await.is_err());
    }

    #[tokio::test]
    async fn verify_requires_active_and_both_signatures() {
        let h = harness();
        let lease = h.machine.issue(terms("lease-s8")).await.unwrap();
        h.machine
            .sign(
                "lease-s8",
                PartyRole::Landlord,
                SignatureProof::for_party(&lease, PartyRole::Landlord),
            )
            .await
            .unwrap();

        let report = h.machine.verify("lease-s8").await.unwrap();
        assert!(report.landlord_signed);
        assert!(!report.tenant_signed);
        assert!(!report.valid);
    }

    #[tokio::test]
    async fn failed_audit_leaves_signature_retryable() {
        let h = harness();
        let lease = h.machine.issue(terms("lease-s9")).await.unwrap();
        let offline = LeaseSignatureStateMachine::new(
            h.store.clone(),
            PersistentLedger::unreachable().shared(),
            Arc::new(PaymentObligationGenerator::new(
                h.store.clone(),
                h.ledger.clone(),
            )),
            LeaseLocks::new(),
        );
        let proof = SignatureProof::for_party(&lease, PartyRole::Landlord);

        let err = offline
            .sign("lease-s9", PartyRole::Landlord, proof.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, RentflowError::Ledger(_)));
        let stored = h.store.get_lease("lease-s9").await.unwrap().unwrap();
        assert_eq!(stored.state, LeaseState::Draft);
        assert!(stored.landlord_signature.is_none());

        let retried = h
            .machine
            .sign("lease-s9", PartyRole::Landlord, proof)
            .await
            .unwrap();
        assert_eq!(retried.lease_state, LeaseState::PendingCounterparty);
    }

    #[tokio::test]
    async fn lock_entries_are_dropped_once_released() {
        let locks = LeaseLocks::new();
        for n in 0..5 {
            let _guard = locks.acquire(&format!("lease-l{n}")).await;
        }
        assert_eq!(locks.tracked(), 0);

        let held = locks.acquire("lease-l0").await;
        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.acquire("lease-l0").await;
            })
        };
        tokio::task::yield_now().await;
        assert_eq!(locks.tracked(), 1);
        drop(held);
        waiter.await.unwrap();
        assert_eq!(locks.tracked(), 0);
    }

    #[tokio::test]
    async fn lease_lifecycle_leaves_no_lock_entries() {
        let h = harness();
        let lease = h.machine.issue(terms("lease-s10")).await.unwrap();
        h.machine
            .sign(
                "lease-s10",
                PartyRole::Landlord,
                SignatureProof::for_party(&lease, PartyRole::Landlord),
            )
            .await
            .unwrap();
        h.machine.withdraw("lease-s10", "tenant walked").await.unwrap();
        assert_eq!(h.machine.locks.tracked(), 0);
    }
}

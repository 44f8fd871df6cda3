use crate::config::SettlementConfig;
use crate::error::{RentflowError, RentflowResult};
use crate::executor::{ensure_pending, TransferExecutor};
use crate::gate::{AutonomousDecisionGate, GateDecision, ReliabilityProfile};
use crate::lease::{LeaseLocks, LeaseSignatureStateMachine, LeaseVerification, SignOutcome};
use crate::ledger::{AuditEvent, EntrySubject, LedgerEntry};
use crate::ledger_storage::{PersistentLedger, SharedLedger};
use crate::obligations::PaymentObligationGenerator;
use crate::rail::RailRegistry;
use crate::reconciler::{ActivationSink, PaymentReconciler, SweepReport};
use crate::store::{
    connect_pool, InMemorySettlementStore, PostgresSettlementStore, SettlementStore, StorageConfig,
};
use crate::types::{
    ActivationSignal, Initiation, Lease, LeaseTerms, PartyRole, PaymentObligation,
    SignatureProof, TransferOutcome,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// Result of a settlement request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SettlementAttempt {
    /// The autonomy gate declined; nothing was submitted.
    Declined { decision: GateDecision },
    /// A transfer was submitted and polled.
    Executed {
        decision: Option<GateDecision>,
        outcome: TransferOutcome,
        activation: Option<ActivationSignal>,
    },
}

/// Settlement engine wiring the lease state machine, obligation generator,
/// autonomy gate, transfer executor and reconciler over one store and ledger.
pub struct SettlementEngine {
    config: SettlementConfig,
    store: Arc<dyn SettlementStore>,
    ledger: SharedLedger,
    locks: LeaseLocks,
    leases: LeaseSignatureStateMachine,
    generator: Arc<PaymentObligationGenerator>,
    gate: AutonomousDecisionGate,
    executor: TransferExecutor,
    reconciler: PaymentReconciler,
}

impl SettlementEngine {
    pub fn new(
        config: SettlementConfig,
        store: Arc<dyn SettlementStore>,
        ledger: SharedLedger,
        rails: RailRegistry,
        sink: Arc<dyn ActivationSink>,
    ) -> RentflowResult<Self> {
        config.validate()?;

        let locks = LeaseLocks::new();
        let generator = Arc::new(PaymentObligationGenerator::new(
            store.clone(),
            ledger.clone(),
        ));
        let leases = LeaseSignatureStateMachine::new(
            store.clone(),
            ledger.clone(),
            generator.clone(),
            locks.clone(),
        );
        let executor = TransferExecutor::new(
            store.clone(),
            Arc::new(rails),
            ledger.clone(),
            config.clone(),
        );
        let reconciler =
            PaymentReconciler::new(store.clone(), ledger.clone(), locks.clone(), sink);

        Ok(Self {
            gate: AutonomousDecisionGate::new(config.gate.clone()),
            config,
            store,
            ledger,
            locks,
            leases,
            generator,
            executor,
            reconciler,
        })
    }

    /// Open storage per `storage` and build the engine on top of it.
    pub async fn bootstrap(
        config: SettlementConfig,
        storage: &StorageConfig,
        rails: RailRegistry,
        sink: Arc<dyn ActivationSink>,
    ) -> RentflowResult<Self> {
        let (store, ledger): (Arc<dyn SettlementStore>, PersistentLedger) = match storage {
            StorageConfig::Memory => (
                Arc::new(InMemorySettlementStore::new()),
                PersistentLedger::memory(),
            ),
            StorageConfig::Postgres {
                url,
                max_connections,
                connect_timeout_secs,
            } => {
                let pool = connect_pool(url, *max_connections, *connect_timeout_secs).await?;
                (
                    Arc::new(PostgresSettlementStore::new(pool.clone()).await?),
                    PersistentLedger::postgres(pool).await?,
                )
            }
        };
        info!(
            storage = storage.label(),
            entries = ledger.entries().len(),
            "settlement storage ready"
        );
        Self::new(config, store, ledger.shared(), rails, sink)
    }

    pub fn config(&self) -> &SettlementConfig {
        &self.config
    }

    pub fn store_backend(&self) -> &'static str {
        self.store.backend_label()
    }

    pub fn active_rail(&self) -> Option<&str> {
        self.executor.active_rail()
    }

    pub async fn issue_lease(&self, terms: LeaseTerms) -> RentflowResult<Lease> {
        self.leases.issue(terms).await
    }

    pub async fn lease(&self, lease_id: &str) -> RentflowResult<Lease> {
        self.leases.get(lease_id).await
    }

    pub async fn sign(
        &self,
        lease_id: &str,
        role: PartyRole,
        proof: SignatureProof,
    ) -> RentflowResult<SignOutcome> {
        self.leases.sign(lease_id, role, proof).await
    }

    pub async fn withdraw(&self, lease_id: &str, reason: &str) -> RentflowResult<Lease> {
        self.leases.withdraw(lease_id, reason).await
    }

    pub async fn terminate(&self, lease_id: &str, reason: &str) -> RentflowResult<Lease> {
        self.leases.terminate(lease_id, reason).await
    }

    pub async fn complete(&self, lease_id: &str) -> RentflowResult<Lease> {
        self.leases.complete(lease_id, Utc::now()).await
    }

    pub async fn verify(&self, lease_id: &str) -> RentflowResult<LeaseVerification> {
        self.leases.verify(lease_id).await
    }

    pub async fn obligation(&self, obligation_id: &str) -> RentflowResult<PaymentObligation> {
        self.store
            .get_obligation(obligation_id)
            .await?
            .ok_or_else(|| RentflowError::ObligationNotFound(obligation_id.to_string()))
    }

    pub async fn obligations_for_lease(
        &self,
        lease_id: &str,
    ) -> RentflowResult<Vec<PaymentObligation>> {
        self.leases.get(lease_id).await?;
        self.store.list_obligations_for_lease(lease_id).await
    }

    /// Settle one obligation.
    ///
    /// Autonomous requests pass through the decision gate first and the
    /// decision is written to the ledger before any transfer is attempted.
    /// Human requests skip the gate.
    pub async fn settle(
        &self,
        obligation_id: &str,
        source_wallet: &str,
        destination_wallet: &str,
        initiation: Initiation,
    ) -> RentflowResult<SettlementAttempt> {
        let obligation = self.obligation(obligation_id).await?;
        ensure_pending(&obligation)?;
        let subject = EntrySubject::obligation(&obligation.lease_id, &obligation.obligation_id);

        let decision = match &initiation {
            Initiation::Human { actor_id } => {
                self.ledger
                    .lock()
                    .await
                    .append_audit(
                        subject,
                        AuditEvent::new("settlement_requested", format!("human actor={actor_id}")),
                    )
                    .await?;
                None
            }
            Initiation::Autonomous { agent_id } => {
                let decision = self.evaluate(&obligation).await?;
                self.ledger
                    .lock()
                    .await
                    .append_decision(subject, &decision)
                    .await?;
                info!(
                    obligation_id,
                    agent = %agent_id,
                    approve = decision.approve,
                    confidence = decision.confidence,
                    "autonomous settlement decision"
                );
                if !decision.approve {
                    return Ok(SettlementAttempt::Declined { decision });
                }
                Some(decision)
            }
        };

        let outcome = self
            .executor
            .execute(obligation_id, source_wallet, destination_wallet)
            .await?;
        let activation = if outcome.is_terminal() {
            self.reconciler.on_obligation_terminal(obligation_id).await?
        } else {
            None
        };

        Ok(SettlementAttempt::Executed {
            decision,
            outcome,
            activation,
        })
    }

    /// Gate decision for an obligation without recording or executing it.
    pub async fn evaluate(&self, obligation: &PaymentObligation) -> RentflowResult<GateDecision> {
        let gate = self.gate.config();
        let history = self
            .store
            .list_payer_history(
                &obligation.payer_id,
                self.gate.history_since(Utc::now()),
                gate.history_max_samples,
            )
            .await?;
        let profile =
            ReliabilityProfile::from_history(&obligation.payer_id, &history, gate.history_window_days);
        Ok(self.gate.authorize(obligation, &profile))
    }

    /// Pending obligation superseding a failed one.
    pub async fn replace_failed(&self, obligation_id: &str) -> RentflowResult<PaymentObligation> {
        let failed = self.obligation(obligation_id).await?;
        let _guard = self.locks.acquire(&failed.lease_id).await;
        self.generator.replacement(obligation_id).await
    }

    /// Rent obligation for billing period `period` of an active lease.
    pub async fn generate_recurring(
        &self,
        lease_id: &str,
        period: u32,
    ) -> RentflowResult<PaymentObligation> {
        let _guard = self.locks.acquire(lease_id).await;
        let lease = self.leases.get(lease_id).await?;
        self.generator.recurring(&lease, period).await
    }

    /// Re-poll submitted obligations and activate leases that became fully paid.
    pub async fn reconcile(&self) -> RentflowResult<SweepReport> {
        self.reconciler.sweep(&self.executor).await
    }

    /// Run the activation check for one lease, e.g. after a restart.
    pub async fn reconcile_lease(&self, lease_id: &str) -> RentflowResult<Option<ActivationSignal>> {
        self.reconciler.reconcile_lease(lease_id).await
    }

    pub async fn ledger_entries(&self) -> Vec<LedgerEntry> {
        self.ledger.lock().await.entries().to_vec()
    }

    pub async fn ledger_entries_for_lease(&self, lease_id: &str) -> Vec<LedgerEntry> {
        self.ledger
            .lock()
            .await
            .as_append_only()
            .entries_for_lease(lease_id)
            .cloned()
            .collect()
    }

    pub async fn verify_ledger_chain(&self) -> bool {
        self.ledger.lock().await.verify_chain()
    }

    pub async fn ledger_backend(&self) -> &'static str {
        self.ledger.lock().await.backend_label()
    }
}

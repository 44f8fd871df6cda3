use crate::error::{RentflowError, RentflowResult};
use crate::executor::TransferExecutor;
use crate::lease::{apply_transition, LeaseLocks};
use crate::ledger::{AuditEvent, EntrySubject};
use crate::ledger_storage::SharedLedger;
use crate::store::SettlementStore;
use crate::types::{
    ActivationSignal, Lease, LeaseState, ObligationKind, ObligationState, PaymentObligation,
};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Receiver of lease activation signals (tenant role promotion).
#[async_trait]
pub trait ActivationSink: Send + Sync {
    async fn notify(&self, signal: ActivationSignal) -> RentflowResult<()>;
}

/// Forwards activation signals over an mpsc channel.
#[derive(Debug, Clone)]
pub struct ChannelActivationSink {
    tx: mpsc::Sender<ActivationSignal>,
}

impl ChannelActivationSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<ActivationSignal>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl ActivationSink for ChannelActivationSink {
    async fn notify(&self, signal: ActivationSignal) -> RentflowResult<()> {
        self.tx.send(signal).await.map_err(|e| {
            RentflowError::Configuration(format!("activation receiver dropped: {e}"))
        })
    }
}

/// Logs signals and drops them.
#[derive(Debug, Clone, Default)]
pub struct LoggingActivationSink;

#[async_trait]
impl ActivationSink for LoggingActivationSink {
    async fn notify(&self, signal: ActivationSignal) -> RentflowResult<()> {
        info!(
            lease_id = %signal.lease_id,
            tenant = %signal.tenant_user_id,
            "tenant activation signal"
        );
        Ok(())
    }
}

/// Result of one reconciliation sweep over in-flight obligations.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SweepReport {
    pub examined: usize,
    pub resolved: usize,
    pub still_indeterminate: usize,
    pub activated_leases: Vec<String>,
    pub errors: Vec<String>,
    /// Obligations stuck in `submitting`; held for manual review, never resubmitted.
    pub stuck_submitting: Vec<String>,
    /// Leases whose earlier undelivered activation signal went out this sweep.
    pub redelivered_signals: Vec<String>,
}

enum Resumed {
    Resolved {
        activated: Option<String>,
        error: Option<String>,
    },
    Indeterminate,
    Failed(String),
}

/// Activates leases once their activation obligations have all settled.
///
/// Activation marks the lease `activation_signal_pending` in the same write,
/// and the mark is cleared only after the sink accepts the signal. Sweeps
/// re-send every lease still marked.
pub struct PaymentReconciler {
    store: Arc<dyn SettlementStore>,
    ledger: SharedLedger,
    locks: LeaseLocks,
    sink: Arc<dyn ActivationSink>,
}

impl PaymentReconciler {
    pub fn new(
        store: Arc<dyn SettlementStore>,
        ledger: SharedLedger,
        locks: LeaseLocks,
        sink: Arc<dyn ActivationSink>,
    ) -> Self {
        Self {
            store,
            ledger,
            locks,
            sink,
        }
    }

    /// React to an obligation reaching `settled` or `failed`.
    ///
    /// Returns the activation signal when this call activated the lease.
    /// Any later call for the same lease returns `None`.
    pub async fn on_obligation_terminal(
        &self,
        obligation_id: &str,
    ) -> RentflowResult<Option<ActivationSignal>> {
        let obligation = self
            .store
            .get_obligation(obligation_id)
            .await?
            .ok_or_else(|| RentflowError::ObligationNotFound(obligation_id.to_string()))?;

        if !obligation.state.is_terminal() || !obligation.kind.gates_activation() {
            return Ok(None);
        }
        if obligation.state == ObligationState::Failed {
            info!(
                obligation_id,
                lease_id = %obligation.lease_id,
                reason = obligation.failure_reason.as_deref().unwrap_or("unknown"),
                "activation payment failed; lease stays awaiting payment"
            );
            return Ok(None);
        }

        self.reconcile_lease(&obligation.lease_id).await
    }

    /// Activate `lease_id` if it is awaiting payment and fully paid.
    pub async fn reconcile_lease(&self, lease_id: &str) -> RentflowResult<Option<ActivationSignal>> {
        let _guard = self.locks.acquire(lease_id).await;
        let mut lease = self
            .store
            .get_lease(lease_id)
            .await?
            .ok_or_else(|| RentflowError::LeaseNotFound(lease_id.to_string()))?;

        if lease.state != LeaseState::AwaitingPayment {
            debug!(lease_id, state = %lease.state, "lease not awaiting payment");
            return Ok(None);
        }

        let obligations = self.store.list_obligations_for_lease(lease_id).await?;
        if !activation_ready(&obligations) {
            debug!(lease_id, "activation obligations not yet settled");
            return Ok(None);
        }

        apply_transition(&mut lease, LeaseState::Active, Utc::now())?;
        lease.activation_signal_pending = true;
        self.ledger
            .lock()
            .await
            .append_audit(
                EntrySubject::lease(lease_id),
                AuditEvent::new(
                    "lease_status_changed",
                    format!(
                        "{} -> {}: activation payments settled",
                        LeaseState::AwaitingPayment,
                        LeaseState::Active
                    ),
                ),
            )
            .await?;
        self.store.update_lease(&lease).await?;
        info!(lease_id, tenant = %lease.tenant_id, "lease activated");

        let signal = activation_signal(&lease);
        if let Err(err) = self.deliver(&mut lease).await {
            warn!(lease_id, error = %err, "could not clear pending activation signal");
        }
        Ok(Some(signal))
    }

    /// Re-send activation signals that were not delivered when the lease
    /// activated. Returns the leases delivered this time.
    pub async fn redeliver_pending_signals(&self) -> RentflowResult<Vec<String>> {
        let mut delivered = Vec::new();
        for pending in self.store.list_leases_pending_signal().await? {
            let lease_id = pending.lease_id;
            let _guard = self.locks.acquire(&lease_id).await;
            let Some(mut lease) = self.store.get_lease(&lease_id).await? else {
                continue;
            };
            if !lease.activation_signal_pending {
                continue;
            }
            if self.deliver(&mut lease).await? {
                info!(lease_id = %lease_id, "activation signal redelivered");
                delivered.push(lease_id);
            }
        }
        Ok(delivered)
    }

    /// Hand the lease's activation signal to the sink. On success the
    /// pending mark is cleared; on failure it stays for the next sweep.
    async fn deliver(&self, lease: &mut Lease) -> RentflowResult<bool> {
        if let Err(err) = self.sink.notify(activation_signal(lease)).await {
            warn!(
                lease_id = %lease.lease_id,
                error = %err,
                "activation signal delivery failed; retrying on next sweep"
            );
            return Ok(false);
        }
        lease.activation_signal_pending = false;
        self.store.update_lease(lease).await?;
        Ok(true)
    }

    /// Re-poll every `submitted` obligation, re-send undelivered activation
    /// signals and report stuck `submitting` rows.
    ///
    /// Obligations are polled concurrently, at most `sweep_concurrency` at a
    /// time, so one transfer that never resolves does not hold up the rest.
    pub async fn sweep(&self, executor: &TransferExecutor) -> RentflowResult<SweepReport> {
        let mut report = SweepReport::default();

        match self.redeliver_pending_signals().await {
            Ok(leases) => report.redelivered_signals = leases,
            Err(err) => {
                warn!(error = %err, "activation signal redelivery failed");
                report.errors.push(format!("activation signals: {err}"));
            }
        }

        let submitted = self
            .store
            .list_obligations_in_state(ObligationState::Submitted)
            .await?;
        report.examined = submitted.len();

        let concurrency = executor.config().sweep_concurrency.max(1);
        let mut results = stream::iter(submitted)
            .map(|obligation| self.resume_one(executor, obligation.obligation_id))
            .buffer_unordered(concurrency);
        while let Some(result) = results.next().await {
            match result {
                Resumed::Resolved { activated, error } => {
                    report.resolved += 1;
                    report.activated_leases.extend(activated);
                    report.errors.extend(error);
                }
                Resumed::Indeterminate => report.still_indeterminate += 1,
                Resumed::Failed(error) => report.errors.push(error),
            }
        }
        report.activated_leases.sort();

        let poll = &executor.config().poll;
        let stale_after = Duration::milliseconds(
            i64::try_from(poll.interval_ms.saturating_mul(u64::from(poll.max_attempts)))
                .unwrap_or(i64::MAX),
        );
        let cutoff = Utc::now() - stale_after;
        report.stuck_submitting = self
            .store
            .list_obligations_in_state(ObligationState::Submitting)
            .await?
            .into_iter()
            .filter(|o| o.updated_at < cutoff)
            .map(|o| o.obligation_id)
            .collect();
        for id in &report.stuck_submitting {
            warn!(obligation_id = %id, "obligation stuck in submitting; manual review required");
        }

        info!(
            examined = report.examined,
            resolved = report.resolved,
            indeterminate = report.still_indeterminate,
            activated = report.activated_leases.len(),
            redelivered = report.redelivered_signals.len(),
            stuck = report.stuck_submitting.len(),
            "reconciliation sweep finished"
        );
        Ok(report)
    }

    async fn resume_one(&self, executor: &TransferExecutor, id: String) -> Resumed {
        match executor.resume(&id).await {
            Ok(outcome) if outcome.is_terminal() => match self.on_obligation_terminal(&id).await {
                Ok(signal) => Resumed::Resolved {
                    activated: signal.map(|s| s.lease_id),
                    error: None,
                },
                Err(err) => Resumed::Resolved {
                    activated: None,
                    error: Some(format!("{id}: {err}")),
                },
            },
            Ok(_) => Resumed::Indeterminate,
            Err(err) => {
                warn!(obligation_id = %id, error = %err, "sweep could not resume obligation");
                Resumed::Failed(format!("{id}: {err}"))
            }
        }
    }
}

fn activation_signal(lease: &Lease) -> ActivationSignal {
    ActivationSignal {
        lease_id: lease.lease_id.clone(),
        tenant_user_id: lease.tenant_id.clone(),
        activated_at: lease.activated_at.unwrap_or(lease.updated_at),
    }
}

/// Gating obligations that still count: superseded rows drop out once a
/// replacement exists.
pub fn activation_set(obligations: &[PaymentObligation]) -> Vec<&PaymentObligation> {
    obligations
        .iter()
        .filter(|o| o.kind.gates_activation())
        .filter(|o| {
            !obligations
                .iter()
                .any(|other| other.replaces.as_deref() == Some(o.obligation_id.as_str()))
        })
        .collect()
}

/// True when a deposit and a first-period rent exist and every counted
/// gating obligation is settled.
pub fn activation_ready(obligations: &[PaymentObligation]) -> bool {
    let set = activation_set(obligations);
    let has = |kind: ObligationKind| set.iter().any(|o| o.kind == kind);
    has(ObligationKind::Deposit)
        && has(ObligationKind::FirstPeriodRent)
        && set.iter().all(|o| o.state == ObligationState::Settled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SettlementConfig;
    use crate::fixtures::{obligation, signed_lease, terms, ObligationSeed};
    use crate::ledger_storage::PersistentLedger;
    use crate::rail::{
        PaymentRailAdapter, RailRegistry, RailStatus, RailSubmission, TransferRequest,
    };
    use crate::store::InMemorySettlementStore;
    use crate::types::ObligationPatch;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn settled(kind: ObligationKind) -> PaymentObligation {
        let mut row = obligation(ObligationSeed::new("lease-r", kind));
        row.state = ObligationState::Settled;
        row
    }

    #[test]
    fn ready_requires_both_kinds_settled() {
        let deposit = settled(ObligationKind::Deposit);
        let rent = settled(ObligationKind::FirstPeriodRent);
        assert!(!activation_ready(std::slice::from_ref(&deposit)));
        assert!(activation_ready(&[deposit.clone(), rent.clone()]));

        let mut pending_rent = rent;
        pending_rent.state = ObligationState::Pending;
        assert!(!activation_ready(&[deposit, pending_rent]));
    }

    #[test]
    fn replacement_supersedes_failed_row() {
        let mut failed = settled(ObligationKind::Deposit);
        failed.state = ObligationState::Failed;
        let mut replacement = settled(ObligationKind::Deposit);
        replacement.replaces = Some(failed.obligation_id.clone());
        let rent = settled(ObligationKind::FirstPeriodRent);

        assert!(!activation_ready(&[failed.clone(), rent.clone()]));
        assert!(activation_ready(&[failed, replacement, rent]));
    }

    #[test]
    fn recurring_rent_does_not_gate_activation() {
        let mut recurring = settled(ObligationKind::RecurringRent { period: 2 });
        recurring.state = ObligationState::Pending;
        assert!(activation_ready(&[
            settled(ObligationKind::Deposit),
            settled(ObligationKind::FirstPeriodRent),
            recurring,
        ]));
    }

    async fn settle_row(store: &InMemorySettlementStore, id: &str) {
        for (from, to, patch) in [
            (ObligationState::Pending, ObligationState::Submitting, ObligationPatch::default()),
            (ObligationState::Submitting, ObligationState::Submitted, ObligationPatch::submitted("scripted", "tx-1")),
            (ObligationState::Submitted, ObligationState::Settled, ObligationPatch::settled(Utc::now())),
        ] {
            store.transition_obligation(id, from, to, patch).await.unwrap();
        }
    }

    #[tokio::test]
    async fn activates_once_and_signals_once() {
        let store = Arc::new(InMemorySettlementStore::new());
        let (sink, mut rx) = ChannelActivationSink::new(8);
        let reconciler = PaymentReconciler::new(
            store.clone(),
            PersistentLedger::memory().shared(),
            LeaseLocks::new(),
            Arc::new(sink),
        );

        let mut lease = signed_lease(terms("lease-r1"));
        lease.state = LeaseState::AwaitingPayment;
        store.insert_lease(&lease).await.unwrap();
        let deposit = obligation(ObligationSeed::new("lease-r1", ObligationKind::Deposit));
        let rent = obligation(ObligationSeed::new("lease-r1", ObligationKind::FirstPeriodRent));
        store
            .insert_obligations(&[deposit.clone(), rent.clone()])
            .await
            .unwrap();

        settle_row(&store, &deposit.obligation_id).await;
        assert!(reconciler
            .on_obligation_terminal(&deposit.obligation_id)
            .await
            .unwrap()
            .is_none());

        settle_row(&store, &rent.obligation_id).await;
        let signal = reconciler
            .on_obligation_terminal(&rent.obligation_id)
            .await
            .unwrap()
            .expect("activation");
        assert_eq!(signal.tenant_user_id, "tenant-1");

        assert!(reconciler
            .on_obligation_terminal(&rent.obligation_id)
            .await
            .unwrap()
            .is_none());
        assert!(reconciler
            .on_obligation_terminal(&deposit.obligation_id)
            .await
            .unwrap()
            .is_none());

        assert_eq!(rx.recv().await.unwrap().lease_id, "lease-r1");
        assert!(rx.try_recv().is_err());

        let stored = store.get_lease("lease-r1").await.unwrap().unwrap();
        assert_eq!(stored.state, LeaseState::Active);
        assert!(stored.activated_at.is_some());
        assert!(!stored.activation_signal_pending);
    }

    /// Refuses the first `failures` signals, then records the rest.
    struct FlakySink {
        failures: AtomicUsize,
        delivered: Mutex<Vec<ActivationSignal>>,
    }

    impl FlakySink {
        fn failing(failures: usize) -> Self {
            Self {
                failures: AtomicUsize::new(failures),
                delivered: Mutex::new(Vec::new()),
            }
        }

        fn delivered(&self) -> Vec<String> {
            self.delivered
                .lock()
                .unwrap()
                .iter()
                .map(|s| s.lease_id.clone())
                .collect()
        }
    }

    #[async_trait]
    impl ActivationSink for FlakySink {
        async fn notify(&self, signal: ActivationSignal) -> RentflowResult<()> {
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(RentflowError::Configuration("sink offline".to_string()));
            }
            self.delivered.lock().unwrap().push(signal);
            Ok(())
        }
    }

    #[tokio::test]
    async fn undelivered_signal_is_resent_by_the_next_sweep() {
        let store = Arc::new(InMemorySettlementStore::new());
        let ledger = PersistentLedger::memory().shared();
        let sink = Arc::new(FlakySink::failing(1));
        let reconciler =
            PaymentReconciler::new(store.clone(), ledger.clone(), LeaseLocks::new(), sink.clone());
        let executor = TransferExecutor::new(
            store.clone(),
            Arc::new(RailRegistry::new()),
            ledger,
            SettlementConfig::default(),
        );

        let mut lease = signed_lease(terms("lease-r3"));
        lease.state = LeaseState::AwaitingPayment;
        store.insert_lease(&lease).await.unwrap();
        let deposit = obligation(ObligationSeed::new("lease-r3", ObligationKind::Deposit));
        let rent = obligation(ObligationSeed::new("lease-r3", ObligationKind::FirstPeriodRent));
        store
            .insert_obligations(&[deposit.clone(), rent.clone()])
            .await
            .unwrap();
        settle_row(&store, &deposit.obligation_id).await;
        settle_row(&store, &rent.obligation_id).await;

        let signal = reconciler.reconcile_lease("lease-r3").await.unwrap();
        assert!(signal.is_some());
        assert!(sink.delivered().is_empty());
        let stored = store.get_lease("lease-r3").await.unwrap().unwrap();
        assert_eq!(stored.state, LeaseState::Active);
        assert!(stored.activation_signal_pending);
        assert!(reconciler.reconcile_lease("lease-r3").await.unwrap().is_none());

        let report = reconciler.sweep(&executor).await.unwrap();
        assert_eq!(report.redelivered_signals, vec!["lease-r3".to_string()]);
        assert_eq!(sink.delivered(), vec!["lease-r3".to_string()]);
        let stored = store.get_lease("lease-r3").await.unwrap().unwrap();
        assert!(!stored.activation_signal_pending);

        let report = reconciler.sweep(&executor).await.unwrap();
        assert!(report.redelivered_signals.is_empty());
        assert_eq!(sink.delivered().len(), 1);
    }

    /// Settles one reference and leaves every other transfer in flight.
    struct SplitRail {
        settles: &'static str,
    }

    #[async_trait]
    impl PaymentRailAdapter for SplitRail {
        fn rail_id(&self) -> &str {
            "split"
        }

        fn validate_wallet(&self, _wallet_id: &str) -> RentflowResult<()> {
            Ok(())
        }

        async fn submit(&self, _request: &TransferRequest) -> RentflowResult<RailSubmission> {
            Err(RentflowError::rail("split", "submissions closed"))
        }

        async fn status(&self, reference: &str) -> RentflowResult<RailStatus> {
            if reference == self.settles {
                Ok(RailStatus::settled(Utc::now()))
            } else {
                Ok(RailStatus::in_flight())
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_transfers_do_not_delay_a_settled_one() {
        let store = Arc::new(InMemorySettlementStore::new());
        let ledger = PersistentLedger::memory().shared();
        let reconciler = PaymentReconciler::new(
            store.clone(),
            ledger.clone(),
            LeaseLocks::new(),
            Arc::new(LoggingActivationSink),
        );
        let mut config = SettlementConfig::default();
        config.poll.interval_ms = 2_000;
        config.poll.max_attempts = 30;
        let executor = TransferExecutor::new(
            store.clone(),
            Arc::new(RailRegistry::with_active(Arc::new(SplitRail { settles: "tx-fast" }))),
            ledger,
            config,
        );

        let base = Utc::now() - Duration::minutes(10);
        let references = ["tx-stuck-1", "tx-stuck-2", "tx-stuck-3", "tx-fast"];
        let rows: Vec<_> = references
            .iter()
            .enumerate()
            .map(|(n, reference)| {
                let mut row = obligation(ObligationSeed::new(
                    &format!("lease-c{n}"),
                    ObligationKind::RecurringRent { period: 2 },
                ));
                row.state = ObligationState::Submitted;
                row.rail = Some("split".to_string());
                row.external_reference = Some(reference.to_string());
                row.updated_at = base + Duration::seconds(n as i64);
                row
            })
            .collect();
        let fast = rows[3].obligation_id.clone();
        store.insert_obligations(&rows).await.unwrap();

        let started = tokio::time::Instant::now();
        let report = reconciler.sweep(&executor).await.unwrap();
        let elapsed = started.elapsed();

        assert_eq!(report.examined, 4);
        assert_eq!(report.resolved, 1);
        assert_eq!(report.still_indeterminate, 3);
        assert!(report.errors.is_empty());
        // One polling window, not four back to back.
        assert!(elapsed <= std::time::Duration::from_secs(61), "{elapsed:?}");

        let row = store.get_obligation(&fast).await.unwrap().unwrap();
        assert_eq!(row.state, ObligationState::Settled);
    }

    #[tokio::test]
    async fn sweep_reports_stuck_submitting_without_resubmitting() {
        let store = Arc::new(InMemorySettlementStore::new());
        let ledger = PersistentLedger::memory().shared();
        let reconciler = PaymentReconciler::new(
            store.clone(),
            ledger.clone(),
            LeaseLocks::new(),
            Arc::new(LoggingActivationSink),
        );
        let mut config = SettlementConfig::default();
        config.poll.interval_ms = 1;
        config.poll.max_attempts = 1;
        let executor = TransferExecutor::new(
            store.clone(),
            Arc::new(RailRegistry::new()),
            ledger,
            config,
        );

        let mut stuck = obligation(ObligationSeed::new("lease-r2", ObligationKind::Deposit));
        stuck.state = ObligationState::Submitting;
        stuck.updated_at = Utc::now() - Duration::hours(1);
        store.insert_obligations(std::slice::from_ref(&stuck)).await.unwrap();

        let report = reconciler.sweep(&executor).await.unwrap();
        assert_eq!(report.examined, 0);
        assert_eq!(report.stuck_submitting, vec![stuck.obligation_id.clone()]);

        let row = store.get_obligation(&stuck.obligation_id).await.unwrap().unwrap();
        assert_eq!(row.state, ObligationState::Submitting);
    }
}

use crate::config::SettlementConfig;
use crate::error::{RentflowError, RentflowResult};
use crate::ledger::{AuditEvent, EntrySubject};
use crate::ledger_storage::SharedLedger;
use crate::rail::{PaymentRailAdapter, RailRegistry, RailTransferState, TransferRequest};
use crate::store::SettlementStore;
use crate::types::{
    ObligationPatch, ObligationState, PaymentObligation, TransferOutcome, TransferResolution,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Submits one transfer per obligation and resolves it by bounded polling.
///
/// Outcomes are three-way. `Indeterminate` means polling ran out before the
/// rail reported a terminal state: the obligation stays `submitted` with its
/// external reference so the reconciliation sweep can pick it up later.
/// A submission the rail never confirmed also lands in `submitted`, without a
/// reference; it is polled by idempotency key and never submitted again.
pub struct TransferExecutor {
    store: Arc<dyn SettlementStore>,
    rails: Arc<RailRegistry>,
    ledger: SharedLedger,
    config: SettlementConfig,
}

impl TransferExecutor {
    pub fn new(
        store: Arc<dyn SettlementStore>,
        rails: Arc<RailRegistry>,
        ledger: SharedLedger,
        config: SettlementConfig,
    ) -> Self {
        Self {
            store,
            rails,
            ledger,
            config,
        }
    }

    pub fn config(&self) -> &SettlementConfig {
        &self.config
    }

    /// Rail new submissions go to.
    pub fn active_rail(&self) -> Option<&str> {
        self.rails.active_rail()
    }

    /// Submit the obligation's transfer and poll until terminal or exhausted.
    ///
    /// Validation and configuration problems are returned as errors before
    /// the obligation is touched. A rail rejection is not an error: the
    /// obligation moves to `failed` and a `Failed` outcome is returned. An
    /// unavailable rail leaves the obligation `submitted` under its key.
    pub async fn execute(
        &self,
        obligation_id: &str,
        source_wallet: &str,
        destination_wallet: &str,
    ) -> RentflowResult<TransferOutcome> {
        let obligation = self.load(obligation_id).await?;
        ensure_pending(&obligation)?;

        let amount_minor = self.validate_amount(&obligation)?;
        obligation
            .currency
            .validate()
            .map_err(|e| RentflowError::Validation(e.to_string()))?;
        let adapter = self.rails.active()?;
        validate_wallets(adapter.as_ref(), source_wallet, destination_wallet)?;

        // The in-flight slot. Losers get SubmissionConflict and never reach the rail.
        let obligation = self
            .store
            .transition_obligation(
                obligation_id,
                ObligationState::Pending,
                ObligationState::Submitting,
                ObligationPatch::default(),
            )
            .await?;

        let request = TransferRequest {
            obligation_id: obligation.obligation_id.clone(),
            amount_minor,
            currency: obligation.currency.clone(),
            source_wallet: source_wallet.to_string(),
            destination_wallet: destination_wallet.to_string(),
        };

        let submission = match adapter.submit(&request).await {
            Ok(submission) => submission,
            Err(err @ RentflowError::RailUnavailable { .. }) => {
                warn!(
                    obligation_id,
                    rail = adapter.rail_id(),
                    error = %err,
                    "submission unconfirmed; resolving by idempotency key"
                );
                let unconfirmed = self
                    .store
                    .transition_obligation(
                        obligation_id,
                        ObligationState::Submitting,
                        ObligationState::Submitted,
                        ObligationPatch::unconfirmed(adapter.rail_id()),
                    )
                    .await?;
                self.audit(
                    &unconfirmed,
                    "submission_unconfirmed",
                    format!("rail={} error={err}", adapter.rail_id()),
                )
                .await?;
                return self.poll(&unconfirmed, adapter.as_ref(), None).await;
            }
            Err(err) => {
                warn!(
                    obligation_id,
                    rail = adapter.rail_id(),
                    error = %err,
                    "rail rejected transfer"
                );
                let failed = self
                    .store
                    .transition_obligation(
                        obligation_id,
                        ObligationState::Submitting,
                        ObligationState::Failed,
                        ObligationPatch::failed(err.to_string()),
                    )
                    .await?;
                return self.finish(&failed, 0).await;
            }
        };

        let submitted = self
            .store
            .transition_obligation(
                obligation_id,
                ObligationState::Submitting,
                ObligationState::Submitted,
                ObligationPatch::submitted(adapter.rail_id(), &submission.reference),
            )
            .await?;
        self.audit(
            &submitted,
            "transfer_submitted",
            format!(
                "rail={} reference={} amount={} {}",
                adapter.rail_id(),
                submission.reference,
                request.decimal_amount(),
                request.currency.code
            ),
        )
        .await?;
        info!(
            obligation_id,
            lease_id = %submitted.lease_id,
            rail = adapter.rail_id(),
            reference = %submission.reference,
            "transfer submitted"
        );

        match submission.initial_state {
            RailTransferState::Settled => self.settle(&submitted, Utc::now(), 0, None).await,
            RailTransferState::Failed => {
                self.fail(&submitted, "rail reported failure on submission", 0, None)
                    .await
            }
            RailTransferState::InFlight => {
                self.poll(&submitted, adapter.as_ref(), Some(&submission.reference))
                    .await
            }
        }
    }

    /// Re-poll an obligation left `submitted` by an earlier indeterminate run.
    pub async fn resume(&self, obligation_id: &str) -> RentflowResult<TransferOutcome> {
        let obligation = self.load(obligation_id).await?;
        if obligation.state.is_terminal() {
            return Ok(outcome_from(&obligation, 0));
        }
        if obligation.state != ObligationState::Submitted {
            return Err(RentflowError::InvalidState(format!(
                "obligation '{obligation_id}' is {} and has nothing to poll",
                obligation.state
            )));
        }
        let adapter = self.rails.for_submitted(obligation.rail.as_deref())?;
        let reference = obligation.external_reference.clone();
        self.poll(&obligation, adapter.as_ref(), reference.as_deref())
            .await
    }

    /// Bounded status loop. Without a reference the transfer is looked up
    /// by its idempotency key until the rail reports one.
    async fn poll(
        &self,
        obligation: &PaymentObligation,
        adapter: &dyn PaymentRailAdapter,
        reference: Option<&str>,
    ) -> RentflowResult<TransferOutcome> {
        let interval = self.config.poll.interval();
        let max_attempts = self.config.poll.max_attempts;
        let mut reference = reference.map(str::to_string);

        for attempt in 1..=max_attempts {
            tokio::time::sleep(interval).await;

            let fetched = match reference.as_deref() {
                Some(reference) => adapter.status(reference).await.map(Some),
                None => adapter.lookup(&obligation.obligation_id).await,
            };

            match fetched {
                Ok(Some(status)) => {
                    if reference.is_none() && status.reference.is_some() {
                        reference = status.reference.clone();
                        info!(
                            obligation_id = %obligation.obligation_id,
                            reference = reference.as_deref().unwrap_or_default(),
                            "unconfirmed transfer located by idempotency key"
                        );
                    }
                    let discovered = reference
                        .clone()
                        .filter(|_| obligation.external_reference.is_none());
                    match status.state {
                        RailTransferState::Settled => {
                            let at = status.settled_at.unwrap_or_else(Utc::now);
                            return self.settle(obligation, at, attempt, discovered).await;
                        }
                        RailTransferState::Failed => {
                            let reason = status
                                .reason
                                .unwrap_or_else(|| "rail reported failure".to_string());
                            return self.fail(obligation, &reason, attempt, discovered).await;
                        }
                        RailTransferState::InFlight => {
                            debug!(
                                obligation_id = %obligation.obligation_id,
                                reference = reference.as_deref().unwrap_or("unknown"),
                                attempt,
                                "transfer still in flight"
                            );
                        }
                    }
                }
                Ok(None) => {
                    debug!(
                        obligation_id = %obligation.obligation_id,
                        attempt,
                        "rail has no record of the idempotency key yet"
                    );
                }
                Err(err) => {
                    // A failed status fetch says nothing about the transfer.
                    warn!(
                        obligation_id = %obligation.obligation_id,
                        reference = reference.as_deref().unwrap_or("unknown"),
                        attempt,
                        error = %err,
                        "status fetch failed; treating as in flight"
                    );
                }
            }
        }

        let shown = reference.as_deref().unwrap_or("unknown");
        let outcome = TransferOutcome {
            obligation_id: obligation.obligation_id.clone(),
            external_reference: reference.clone(),
            resolution: TransferResolution::Indeterminate,
            settled_at: None,
            failure_reason: None,
            poll_attempts: max_attempts,
        };
        self.audit(
            obligation,
            "poll_exhausted",
            format!("reference={shown} attempts={max_attempts}"),
        )
        .await?;
        self.record_outcome(obligation, &outcome).await?;
        warn!(
            obligation_id = %obligation.obligation_id,
            reference = shown,
            attempts = max_attempts,
            "settlement indeterminate; obligation left submitted"
        );
        Ok(outcome)
    }

    async fn settle(
        &self,
        obligation: &PaymentObligation,
        at: DateTime<Utc>,
        attempts: u32,
        discovered: Option<String>,
    ) -> RentflowResult<TransferOutcome> {
        let result = self
            .store
            .transition_obligation(
                &obligation.obligation_id,
                ObligationState::Submitted,
                ObligationState::Settled,
                ObligationPatch::settled(at).with_reference(discovered),
            )
            .await;
        self.resolve(obligation, result, attempts).await
    }

    async fn fail(
        &self,
        obligation: &PaymentObligation,
        reason: &str,
        attempts: u32,
        discovered: Option<String>,
    ) -> RentflowResult<TransferOutcome> {
        let result = self
            .store
            .transition_obligation(
                &obligation.obligation_id,
                ObligationState::Submitted,
                ObligationState::Failed,
                ObligationPatch::failed(reason).with_reference(discovered),
            )
            .await;
        self.resolve(obligation, result, attempts).await
    }

    /// Terminal writes race with the reconciliation sweep polling the same
    /// obligation. Whoever loses reports what the winner stored.
    async fn resolve(
        &self,
        obligation: &PaymentObligation,
        result: RentflowResult<PaymentObligation>,
        attempts: u32,
    ) -> RentflowResult<TransferOutcome> {
        match result {
            Ok(updated) => self.finish(&updated, attempts).await,
            Err(RentflowError::InvalidState(_)) => {
                let current = self.load(&obligation.obligation_id).await?;
                if current.state.is_terminal() {
                    debug!(
                        obligation_id = %current.obligation_id,
                        state = %current.state,
                        "obligation resolved concurrently"
                    );
                    Ok(outcome_from(&current, attempts))
                } else {
                    Err(RentflowError::InvalidState(format!(
                        "obligation '{}' moved to {} while resolving",
                        current.obligation_id, current.state
                    )))
                }
            }
            Err(err) => Err(err),
        }
    }

    async fn finish(
        &self,
        obligation: &PaymentObligation,
        attempts: u32,
    ) -> RentflowResult<TransferOutcome> {
        let outcome = outcome_from(obligation, attempts);
        self.record_outcome(obligation, &outcome).await?;
        info!(
            obligation_id = %obligation.obligation_id,
            lease_id = %obligation.lease_id,
            resolution = outcome.resolution.as_str(),
            attempts,
            "transfer resolved"
        );
        Ok(outcome)
    }

    fn validate_amount(&self, obligation: &PaymentObligation) -> RentflowResult<u64> {
        if obligation.amount_minor <= 0 {
            return Err(RentflowError::Validation(format!(
                "obligation '{}' amount {} must be positive",
                obligation.obligation_id, obligation.amount_minor
            )));
        }
        let amount = obligation.amount_minor.unsigned_abs();
        if amount > self.config.per_transfer_ceiling_minor {
            return Err(RentflowError::Validation(format!(
                "obligation '{}' amount {} exceeds per-transfer ceiling {}",
                obligation.obligation_id, amount, self.config.per_transfer_ceiling_minor
            )));
        }
        Ok(amount)
    }

    async fn load(&self, obligation_id: &str) -> RentflowResult<PaymentObligation> {
        self.store
            .get_obligation(obligation_id)
            .await?
            .ok_or_else(|| RentflowError::ObligationNotFound(obligation_id.to_string()))
    }

    async fn audit(
        &self,
        obligation: &PaymentObligation,
        stage: &str,
        detail: String,
    ) -> RentflowResult<()> {
        self.ledger
            .lock()
            .await
            .append_audit(
                EntrySubject::obligation(&obligation.lease_id, &obligation.obligation_id),
                AuditEvent::new(stage, detail),
            )
            .await?;
        Ok(())
    }

    async fn record_outcome(
        &self,
        obligation: &PaymentObligation,
        outcome: &TransferOutcome,
    ) -> RentflowResult<()> {
        self.ledger
            .lock()
            .await
            .append_outcome(
                EntrySubject::obligation(&obligation.lease_id, &obligation.obligation_id),
                outcome,
            )
            .await?;
        Ok(())
    }
}

/// Only `pending` obligations may be submitted.
pub(crate) fn ensure_pending(obligation: &PaymentObligation) -> RentflowResult<()> {
    match obligation.state {
        ObligationState::Pending => Ok(()),
        state if state.is_in_flight() => Err(RentflowError::SubmissionConflict {
            obligation_id: obligation.obligation_id.clone(),
            state: state.to_string(),
        }),
        state => Err(RentflowError::InvalidState(format!(
            "obligation '{}' is already {state}",
            obligation.obligation_id
        ))),
    }
}

fn validate_wallets(
    adapter: &dyn PaymentRailAdapter,
    source_wallet: &str,
    destination_wallet: &str,
) -> RentflowResult<()> {
    adapter
        .validate_wallet(source_wallet)
        .map_err(|e| RentflowError::Validation(format!("source wallet: {e}")))?;
    adapter
        .validate_wallet(destination_wallet)
        .map_err(|e| RentflowError::Validation(format!("destination wallet: {e}")))?;
    if source_wallet == destination_wallet {
        return Err(RentflowError::Validation(
            "source and destination wallets must differ".to_string(),
        ));
    }
    Ok(())
}

fn outcome_from(obligation: &PaymentObligation, attempts: u32) -> TransferOutcome {
    let resolution = match obligation.state {
        ObligationState::Settled => TransferResolution::Settled,
        ObligationState::Failed => TransferResolution::Failed,
        _ => TransferResolution::Indeterminate,
    };
    TransferOutcome {
        obligation_id: obligation.obligation_id.clone(),
        external_reference: obligation.external_reference.clone(),
        resolution,
        settled_at: obligation.settled_at,
        failure_reason: obligation.failure_reason.clone(),
        poll_attempts: attempts,
    }
}

//! Shared builders and a scripted rail for unit tests.

use crate::error::{RentflowError, RentflowResult};
use crate::rail::{PaymentRailAdapter, RailStatus, RailSubmission, RailTransferState, TransferRequest};
use crate::types::{
    CurrencyUnit, Lease, LeaseState, LeaseTerms, ObligationKind, ObligationState, PartyRole,
    PaymentObligation, SignatureProof, SignatureRecord,
};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use uuid::Uuid;

pub const SOURCE_WALLET: &str = "7xKXtg2CW87d97TXJSDpbD5jBkheTqA83TZRuJosgAsU";
pub const DEST_WALLET: &str = "9WzDXwBbmkg8ZTbNMqUxvQRAyrZzDsGYdLVL9zYtAWWM";

pub fn terms(lease_id: &str) -> LeaseTerms {
    let start = Utc::now();
    LeaseTerms {
        lease_id: lease_id.to_string(),
        property_id: "prop-7".to_string(),
        landlord_id: "landlord-1".to_string(),
        tenant_id: "tenant-1".to_string(),
        monthly_amount_minor: 1_500_000_000,
        deposit_amount_minor: 3_000_000_000,
        currency: CurrencyUnit::usdc(),
        start_date: start,
        end_date: start + Duration::days(365),
    }
}

/// Lease with both signatures already recorded, parked in `fully_signed`.
pub fn signed_lease(terms: LeaseTerms) -> Lease {
    let mut lease = Lease::from_terms(terms).unwrap();
    for role in [PartyRole::Landlord, PartyRole::Tenant] {
        let proof = SignatureProof::for_party(&lease, role);
        lease.set_signature(
            role,
            SignatureRecord {
                signer_id: proof.signer_id,
                digest: proof.digest,
                signed_at: Utc::now(),
            },
        );
    }
    lease.state = LeaseState::FullySigned;
    lease
}

pub struct ObligationSeed {
    lease_id: String,
    kind: ObligationKind,
    amount_minor: i64,
    payer_id: String,
}

impl ObligationSeed {
    pub fn new(lease_id: &str, kind: ObligationKind) -> Self {
        Self {
            lease_id: lease_id.to_string(),
            kind,
            amount_minor: 1_500_000_000,
            payer_id: "tenant-1".to_string(),
        }
    }

    pub fn amount(mut self, amount_minor: i64) -> Self {
        self.amount_minor = amount_minor;
        self
    }

    pub fn payer(mut self, payer_id: &str) -> Self {
        self.payer_id = payer_id.to_string();
        self
    }
}

pub fn obligation(seed: ObligationSeed) -> PaymentObligation {
    let now = Utc::now();
    PaymentObligation {
        obligation_id: Uuid::new_v4().to_string(),
        lease_id: seed.lease_id,
        kind: seed.kind,
        payer_id: seed.payer_id,
        payee_id: "landlord-1".to_string(),
        amount_minor: seed.amount_minor,
        currency: CurrencyUnit::usdc(),
        due_reference: now.date_naive().to_string(),
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

/// One scripted `status` response.
#[derive(Debug, Clone)]
pub enum Step {
    InFlight,
    Settled,
    Failed(String),
    StatusError,
}

/// Rail whose status answers come from a queue; an empty queue reads as in flight.
pub struct ScriptedRail {
    steps: Mutex<VecDeque<Step>>,
    submits: AtomicUsize,
    reject_submit: Option<String>,
    unconfirmed: bool,
    accepted_keys: Mutex<HashSet<String>>,
}

impl ScriptedRail {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            submits: AtomicUsize::new(0),
            reject_submit: None,
            unconfirmed: false,
            accepted_keys: Mutex::new(HashSet::new()),
        }
    }

    pub fn rejecting(reason: &str) -> Self {
        Self {
            reject_submit: Some(reason.to_string()),
            ..Self::new(Vec::new())
        }
    }

    /// Accepts every transfer but never answers the submit call.
    pub fn unconfirmed(steps: Vec<Step>) -> Self {
        Self {
            unconfirmed: true,
            ..Self::new(steps)
        }
    }

    pub fn push(&self, step: Step) {
        self.steps.lock().unwrap().push_back(step);
    }

    pub fn submit_count(&self) -> usize {
        self.submits.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PaymentRailAdapter for ScriptedRail {
    fn rail_id(&self) -> &str {
        "scripted"
    }

    fn validate_wallet(&self, wallet_id: &str) -> RentflowResult<()> {
        if wallet_id.len() < 32 || !wallet_id.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(RentflowError::Validation(format!(
                "malformed wallet '{wallet_id}'"
            )));
        }
        Ok(())
    }

    async fn submit(&self, request: &TransferRequest) -> RentflowResult<RailSubmission> {
        let n = self.submits.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(reason) = &self.reject_submit {
            return Err(RentflowError::rail("scripted", reason.clone()));
        }
        if self.unconfirmed {
            self.accepted_keys
                .lock()
                .unwrap()
                .insert(request.obligation_id.clone());
            return Err(RentflowError::rail_unavailable("scripted", "submit timed out"));
        }
        Ok(RailSubmission {
            reference: format!("tx-{}-{n}", request.obligation_id),
            initial_state: RailTransferState::InFlight,
        })
    }

    async fn status(&self, _reference: &str) -> RentflowResult<RailStatus> {
        self.next_status()
    }

    async fn lookup(&self, idempotency_key: &str) -> RentflowResult<Option<RailStatus>> {
        if !self.accepted_keys.lock().unwrap().contains(idempotency_key) {
            return Ok(None);
        }
        let mut status = self.next_status()?;
        status.reference = Some(format!("tx-{idempotency_key}-1"));
        Ok(Some(status))
    }
}

impl ScriptedRail {
    fn next_status(&self) -> RentflowResult<RailStatus> {
        let step = self.steps.lock().unwrap().pop_front();
        match step {
            None | Some(Step::InFlight) => Ok(RailStatus::in_flight()),
            Some(Step::Settled) => Ok(RailStatus::settled(Utc::now())),
            Some(Step::Failed(reason)) => Ok(RailStatus::failed(reason)),
            Some(Step::StatusError) => Err(RentflowError::rail("scripted", "status timeout")),
        }
    }
}

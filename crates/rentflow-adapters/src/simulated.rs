use crate::validate_base58_wallet;
use async_trait::async_trait;
use chrono::Utc;
use rentflow_core::error::{RentflowError, RentflowResult};
use rentflow_core::rail::{
    PaymentRailAdapter, RailStatus, RailSubmission, RailTransferState, TransferRequest,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;
use uuid::Uuid;

pub(crate) const RAIL_ID: &str = "simulated";

/// Resolved transfers remembered for late status or key lookups.
const FINISHED_CAPACITY: usize = 1024;

/// How a [`SimulatedRail`] resolves transfers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimulatedBehavior {
    /// Settle on the n-th status poll; `0` settles at submission.
    SettleAfter(u32),
    /// Report failure on the n-th status poll.
    FailAfter { polls: u32, reason: String },
    /// Reject every submission.
    RejectSubmit(String),
    /// Stay in flight forever.
    NeverResolve,
}

#[derive(Debug)]
struct LiveTransfer {
    idempotency_key: String,
    polls: u32,
}

#[derive(Debug)]
struct FinishedTransfer {
    idempotency_key: String,
    status: RailStatus,
}

#[derive(Debug, Default)]
struct Book {
    live: HashMap<String, LiveTransfer>,
    finished: VecDeque<FinishedTransfer>,
}

impl Book {
    fn resolved(&self, reference: &str) -> Option<&FinishedTransfer> {
        self.finished
            .iter()
            .find(|f| f.status.reference.as_deref() == Some(reference))
    }

    fn reference_for_key(&self, key: &str) -> Option<String> {
        self.live
            .iter()
            .find(|(_, t)| t.idempotency_key == key)
            .map(|(reference, _)| reference.clone())
            .or_else(|| {
                self.finished
                    .iter()
                    .find(|f| f.idempotency_key == key)
                    .and_then(|f| f.status.reference.clone())
            })
    }

    fn retire(&mut self, idempotency_key: String, status: RailStatus) {
        if self.finished.len() == FINISHED_CAPACITY {
            self.finished.pop_front();
        }
        self.finished.push_back(FinishedTransfer {
            idempotency_key,
            status,
        });
    }
}

/// Deterministic in-process rail for local runs and chaos tests.
///
/// Live transfers are dropped from the poll table once resolved; only the
/// most recent resolutions are kept.
#[derive(Debug)]
pub struct SimulatedRail {
    behavior: SimulatedBehavior,
    book: Mutex<Book>,
    accepted: AtomicUsize,
}

impl SimulatedRail {
    pub fn new(behavior: SimulatedBehavior) -> Self {
        Self {
            behavior,
            book: Mutex::new(Book::default()),
            accepted: AtomicUsize::new(0),
        }
    }

    /// Number of transfers accepted so far.
    pub fn submitted(&self) -> usize {
        self.accepted.load(Ordering::Relaxed)
    }

    /// Transfers still being polled.
    pub fn in_flight(&self) -> usize {
        self.book().map(|b| b.live.len()).unwrap_or_default()
    }

    fn book(&self) -> RentflowResult<MutexGuard<'_, Book>> {
        self.book
            .lock()
            .map_err(|_| RentflowError::rail(RAIL_ID, "simulated rail state poisoned"))
    }
}

#[async_trait]
impl PaymentRailAdapter for SimulatedRail {
    fn rail_id(&self) -> &str {
        RAIL_ID
    }

    fn validate_wallet(&self, wallet_id: &str) -> RentflowResult<()> {
        validate_base58_wallet(wallet_id)
    }

    async fn submit(&self, request: &TransferRequest) -> RentflowResult<RailSubmission> {
        if let SimulatedBehavior::RejectSubmit(reason) = &self.behavior {
            return Err(RentflowError::rail(RAIL_ID, reason.clone()));
        }

        let mut book = self.book()?;
        if let Some(reference) = book.reference_for_key(&request.obligation_id) {
            debug!(
                obligation_id = %request.obligation_id,
                reference = %reference,
                "simulated transfer already accepted for key"
            );
            return Ok(RailSubmission {
                reference,
                initial_state: RailTransferState::InFlight,
            });
        }

        let reference = format!("sim-{}", Uuid::new_v4());
        if matches!(self.behavior, SimulatedBehavior::SettleAfter(0)) {
            book.retire(
                request.obligation_id.clone(),
                RailStatus {
                    reference: Some(reference.clone()),
                    ..RailStatus::settled(Utc::now())
                },
            );
        } else {
            book.live.insert(
                reference.clone(),
                LiveTransfer {
                    idempotency_key: request.obligation_id.clone(),
                    polls: 0,
                },
            );
        }
        self.accepted.fetch_add(1, Ordering::Relaxed);
        debug!(
            obligation_id = %request.obligation_id,
            reference = %reference,
            amount = %request.decimal_amount(),
            "simulated transfer accepted"
        );

        let initial_state = match self.behavior {
            SimulatedBehavior::SettleAfter(0) => RailTransferState::Settled,
            _ => RailTransferState::InFlight,
        };
        Ok(RailSubmission {
            reference,
            initial_state,
        })
    }

    async fn status(&self, reference: &str) -> RentflowResult<RailStatus> {
        let mut book = self.book()?;
        let Some(transfer) = book.live.get_mut(reference) else {
            return book
                .resolved(reference)
                .map(|f| f.status.clone())
                .ok_or_else(|| {
                    RentflowError::rail(RAIL_ID, format!("unknown transfer '{reference}'"))
                });
        };
        transfer.polls += 1;
        let polls = transfer.polls;

        let status = match &self.behavior {
            SimulatedBehavior::SettleAfter(n) if polls >= *n => RailStatus::settled(Utc::now()),
            SimulatedBehavior::FailAfter { polls: n, reason } if polls >= *n => {
                RailStatus::failed(reason.clone())
            }
            _ => RailStatus::in_flight(),
        };
        let status = RailStatus {
            reference: Some(reference.to_string()),
            ..status
        };
        if status.state != RailTransferState::InFlight {
            if let Some(done) = book.live.remove(reference) {
                book.retire(done.idempotency_key, status.clone());
            }
        }
        Ok(status)
    }

    async fn lookup(&self, idempotency_key: &str) -> RentflowResult<Option<RailStatus>> {
        let reference = self.book()?.reference_for_key(idempotency_key);
        match reference {
            Some(reference) => self.status(&reference).await.map(Some),
            None => Ok(None),
        }
    }
}

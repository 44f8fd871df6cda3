//! RentFlow settlement core.
//!
//! Turns signed leases into payment obligations, settles them over a
//! pluggable payment rail with bounded status polling, and activates a lease
//! once its deposit and first-period rent have settled. Every decision and
//! outcome lands in a hash-chained append-only ledger.

#![deny(unsafe_code)]

pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod gate;
pub mod lease;
pub mod ledger;
pub mod ledger_storage;
pub mod obligations;
pub mod rail;
pub mod reconciler;
pub mod store;
pub mod types;

#[cfg(test)]
pub(crate) mod fixtures;

pub use config::{GateConfig, PollConfig, SettlementConfig};
pub use engine::{SettlementAttempt, SettlementEngine};
pub use error::{RentflowError, RentflowResult};
pub use executor::TransferExecutor;
pub use gate::{AutonomousDecisionGate, GateDecision, ReliabilityProfile};
pub use lease::{LeaseGuard, LeaseLocks, LeaseSignatureStateMachine, LeaseVerification, SignOutcome};
pub use ledger::{AppendOnlyLedger, AuditEvent, EntrySubject, LedgerEntry, LedgerEntryKind};
pub use ledger_storage::{PersistentLedger, SharedLedger};
pub use obligations::PaymentObligationGenerator;
pub use rail::{
    PaymentRailAdapter, RailRegistry, RailStatus, RailSubmission, RailTransferState,
    TransferRequest,
};
pub use reconciler::{
    activation_ready, ActivationSink, ChannelActivationSink, LoggingActivationSink,
    PaymentReconciler, SweepReport,
};
pub use store::{
    connect_pool, dedupe_key, InMemorySettlementStore, PostgresSettlementStore, SettlementStore,
    StorageConfig,
};
pub use types::{
    signature_digest, ActivationSignal, CurrencyUnit, Initiation, Lease, LeaseState, LeaseTerms,
    ObligationKind, ObligationPatch, ObligationState, PartyRole, PaymentObligation,
    SignatureProof, SignatureRecord, TransferOutcome, TransferResolution,
};

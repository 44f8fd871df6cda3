use crate::error::{RentflowError, RentflowResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Maximum lease identifier length accepted at issuance.
pub const MAX_LEASE_ID_LEN: usize = 64;

/// Stable-value currency unit. Amounts are always carried in minor units.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CurrencyUnit {
    pub code: String,
    pub decimals: u8,
}

impl CurrencyUnit {
    pub fn new(code: impl Into<String>, decimals: u8) -> Self {
        Self {
            code: code.into(),
            decimals,
        }
    }

    pub fn usdc() -> Self {
        Self::new("USDC", 6)
    }

    pub fn validate(&self) -> RentflowResult<()> {
        if self.code.trim().is_empty() {
            return Err(RentflowError::Validation(
                "currency code must not be empty".to_string(),
            ));
        }
        if !(2..=6).contains(&self.decimals) {
            return Err(RentflowError::Validation(format!(
                "currency '{}' precision {} outside supported range 2..=6",
                self.code, self.decimals
            )));
        }
        Ok(())
    }

    /// Render a minor-unit amount as a decimal string, e.g. `1500.000000`.
    pub fn format_minor(&self, amount_minor: u64) -> String {
        let scale = 10_u64.pow(u32::from(self.decimals));
        format!(
            "{}.{:0width$}",
            amount_minor / scale,
            amount_minor % scale,
            width = usize::from(self.decimals)
        )
    }
}

impl Default for CurrencyUnit {
    fn default() -> Self {
        Self::usdc()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PartyRole {
    Landlord,
    Tenant,
}

impl PartyRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Landlord => "landlord",
            Self::Tenant => "tenant",
        }
    }

    pub fn counterpart(self) -> Self {
        match self {
            Self::Landlord => Self::Tenant,
            Self::Tenant => Self::Landlord,
        }
    }
}

impl std::fmt::Display for PartyRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lease lifecycle states.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LeaseState {
    Draft,
    PendingCounterparty,
    FullySigned,
    AwaitingPayment,
    Active,
    Withdrawn,
    Terminated,
    Completed,
}

impl LeaseState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::PendingCounterparty => "pending_counterparty",
            Self::FullySigned => "fully_signed",
            Self::AwaitingPayment => "awaiting_payment",
            Self::Active => "active",
            Self::Withdrawn => "withdrawn",
            Self::Terminated => "terminated",
            Self::Completed => "completed",
        }
    }

    pub fn parse(value: &str) -> RentflowResult<Self> {
        match value {
            "draft" => Ok(Self::Draft),
            "pending_counterparty" => Ok(Self::PendingCounterparty),
            "fully_signed" => Ok(Self::FullySigned),
            "awaiting_payment" => Ok(Self::AwaitingPayment),
            "active" => Ok(Self::Active),
            "withdrawn" => Ok(Self::Withdrawn),
            "terminated" => Ok(Self::Terminated),
            "completed" => Ok(Self::Completed),
            other => Err(RentflowError::Serialization(format!(
                "unknown lease state '{other}'"
            ))),
        }
    }

    /// Signatures are only accepted before the pair is complete.
    pub fn accepts_signatures(self) -> bool {
        matches!(self, Self::Draft | Self::PendingCounterparty)
    }
}

impl std::fmt::Display for LeaseState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SignatureRecord {
    pub signer_id: String,
    pub digest: String,
    pub signed_at: DateTime<Utc>,
}

/// Proof submitted with a signature event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SignatureProof {
    pub signer_id: String,
    pub digest: String,
}

impl SignatureProof {
    /// Build the proof the given party is expected to present for `lease`.
    pub fn for_party(lease: &Lease, role: PartyRole) -> Self {
        let signer_id = lease.party_id(role).to_string();
        Self {
            digest: signature_digest(&lease.terms_digest, role, &signer_id),
            signer_id,
        }
    }
}

/// Terms supplied by the CRUD layer when a manager issues a lease.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseTerms {
    pub lease_id: String,
    pub property_id: String,
    pub landlord_id: String,
    pub tenant_id: String,
    pub monthly_amount_minor: i64,
    pub deposit_amount_minor: i64,
    #[serde(default)]
    pub currency: CurrencyUnit,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
}

impl LeaseTerms {
    pub fn validate(&self) -> RentflowResult<()> {
        if self.lease_id.trim().is_empty() {
            return Err(RentflowError::Validation(
                "lease id must not be empty".to_string(),
            ));
        }
        if self.lease_id.len() > MAX_LEASE_ID_LEN {
            return Err(RentflowError::Validation(format!(
                "lease id exceeds {MAX_LEASE_ID_LEN} characters"
            )));
        }
        for (field, value) in [
            ("property_id", &self.property_id),
            ("landlord_id", &self.landlord_id),
            ("tenant_id", &self.tenant_id),
        ] {
            if value.trim().is_empty() {
                return Err(RentflowError::Validation(format!(
                    "{field} must not be empty"
                )));
            }
        }
        if self.landlord_id == self.tenant_id {
            return Err(RentflowError::Validation(
                "landlord and tenant must be distinct parties".to_string(),
            ));
        }
        if self.monthly_amount_minor <= 0 {
            return Err(RentflowError::Validation(
                "monthly amount must be positive".to_string(),
            ));
        }
        if self.deposit_amount_minor <= 0 {
            return Err(RentflowError::Validation(
                "deposit amount must be positive".to_string(),
            ));
        }
        if self.end_date <= self.start_date {
            return Err(RentflowError::Validation(
                "lease end date must be after start date".to_string(),
            ));
        }
        self.currency.validate()
    }

    /// BLAKE3 digest over the canonical JSON form of the terms.
    pub fn digest(&self) -> RentflowResult<String> {
        let material = serde_json::json!({
            "lease_id": self.lease_id,
            "property_id": self.property_id,
            "landlord_id": self.landlord_id,
            "tenant_id": self.tenant_id,
            "monthly_amount_minor": self.monthly_amount_minor,
            "deposit_amount_minor": self.deposit_amount_minor,
            "currency": self.currency,
            "start_date": self.start_date,
            "end_date": self.end_date,
        });
        let bytes = serde_json::to_vec(&material)?;
        Ok(blake3::hash(&bytes).to_hex().to_string())
    }
}

/// Digest a party signs: binds the terms digest to the role and signer.
pub fn signature_digest(terms_digest: &str, role: PartyRole, signer_id: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(terms_digest.as_bytes());
    hasher.update(b"|");
    hasher.update(role.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(signer_id.as_bytes());
    hasher.finalize().to_hex().to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Lease {
    pub lease_id: String,
    pub property_id: String,
    pub landlord_id: String,
    pub tenant_id: String,
    pub monthly_amount_minor: i64,
    pub deposit_amount_minor: i64,
    pub currency: CurrencyUnit,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub terms_digest: String,
    pub state: LeaseState,
    pub landlord_signature: Option<SignatureRecord>,
    pub tenant_signature: Option<SignatureRecord>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub activated_at: Option<DateTime<Utc>>,
    /// Activated, but the tenant activation signal is not delivered yet.
    #[serde(default)]
    pub activation_signal_pending: bool,
}

impl Lease {
    pub fn from_terms(terms: LeaseTerms) -> RentflowResult<Self> {
        terms.validate()?;
        let terms_digest = terms.digest()?;
        let now = Utc::now();
        Ok(Self {
            lease_id: terms.lease_id,
            property_id: terms.property_id,
            landlord_id: terms.landlord_id,
            tenant_id: terms.tenant_id,
            monthly_amount_minor: terms.monthly_amount_minor,
            deposit_amount_minor: terms.deposit_amount_minor,
            currency: terms.currency,
            start_date: terms.start_date,
            end_date: terms.end_date,
            terms_digest,
            state: LeaseState::Draft,
            landlord_signature: None,
            tenant_signature: None,
            created_at: now,
            updated_at: now,
            activated_at: None,
            activation_signal_pending: false,
        })
    }

    pub fn party_id(&self, role: PartyRole) -> &str {
        match role {
            PartyRole::Landlord => &self.landlord_id,
            PartyRole::Tenant => &self.tenant_id,
        }
    }

    pub fn signature(&self, role: PartyRole) -> Option<&SignatureRecord> {
        match role {
            PartyRole::Landlord => self.landlord_signature.as_ref(),
            PartyRole::Tenant => self.tenant_signature.as_ref(),
        }
    }

    pub(crate) fn set_signature(&mut self, role: PartyRole, record: SignatureRecord) {
        match role {
            PartyRole::Landlord => self.landlord_signature = Some(record),
            PartyRole::Tenant => self.tenant_signature = Some(record),
        }
    }

    pub fn is_fully_signed(&self) -> bool {
        self.landlord_signature.is_some() && self.tenant_signature.is_some()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ObligationKind {
    Deposit,
    FirstPeriodRent,
    RecurringRent { period: u32 },
}

impl ObligationKind {
    /// Deposit and first-period rent gate lease activation; recurring rent does not.
    pub fn gates_activation(self) -> bool {
        matches!(self, Self::Deposit | Self::FirstPeriodRent)
    }

    pub fn label(self) -> String {
        match self {
            Self::Deposit => "deposit".to_string(),
            Self::FirstPeriodRent => "first_period_rent".to_string(),
            Self::RecurringRent { period } => format!("recurring_rent:{period}"),
        }
    }

    pub fn parse(value: &str) -> RentflowResult<Self> {
        match value {
            "deposit" => Ok(Self::Deposit),
            "first_period_rent" => Ok(Self::FirstPeriodRent),
            other => other
                .strip_prefix("recurring_rent:")
                .and_then(|period| period.parse().ok())
                .map(|period| Self::RecurringRent { period })
                .ok_or_else(|| {
                    RentflowError::Serialization(format!("unknown obligation kind '{other}'"))
                }),
        }
    }
}

/// Obligation lifecycle. `Settled` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ObligationState {
    Pending,
    Submitting,
    Submitted,
    Settled,
    Failed,
}

impl ObligationState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Submitting => "submitting",
            Self::Submitted => "submitted",
            Self::Settled => "settled",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> RentflowResult<Self> {
        match value {
            "pending" => Ok(Self::Pending),
            "submitting" => Ok(Self::Submitting),
            "submitted" => Ok(Self::Submitted),
            "settled" => Ok(Self::Settled),
            "failed" => Ok(Self::Failed),
            other => Err(RentflowError::Serialization(format!(
                "unknown obligation state '{other}'"
            ))),
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Settled | Self::Failed)
    }

    pub fn is_in_flight(self) -> bool {
        matches!(self, Self::Submitting | Self::Submitted)
    }

    /// Allowed obligation transitions.
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Submitting)
                | (Self::Submitting, Self::Submitted)
                | (Self::Submitting, Self::Failed)
                | (Self::Submitted, Self::Settled)
                | (Self::Submitted, Self::Failed)
        )
    }
}

impl std::fmt::Display for ObligationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PaymentObligation {
    pub obligation_id: String,
    pub lease_id: String,
    pub kind: ObligationKind,
    pub payer_id: String,
    pub payee_id: String,
    pub amount_minor: i64,
    pub currency: CurrencyUnit,
    pub due_reference: String,
    pub state: ObligationState,
    pub rail: Option<String>,
    pub external_reference: Option<String>,
    pub failure_reason: Option<String>,
    pub settled_at: Option<DateTime<Utc>>,
    pub replaces: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Field changes applied together with a conditional state transition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObligationPatch {
    pub rail: Option<String>,
    pub external_reference: Option<String>,
    pub failure_reason: Option<String>,
    pub settled_at: Option<DateTime<Utc>>,
}

impl ObligationPatch {
    pub fn submitted(rail: impl Into<String>, reference: impl Into<String>) -> Self {
        Self {
            rail: Some(rail.into()),
            external_reference: Some(reference.into()),
            ..Self::default()
        }
    }

    /// Submission with no definite answer from `rail`; the reference is
    /// learned later through a key lookup.
    pub fn unconfirmed(rail: impl Into<String>) -> Self {
        Self {
            rail: Some(rail.into()),
            ..Self::default()
        }
    }

    pub fn settled(at: DateTime<Utc>) -> Self {
        Self {
            settled_at: Some(at),
            ..Self::default()
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            failure_reason: Some(reason.into()),
            ..Self::default()
        }
    }

    pub fn with_reference(mut self, reference: Option<String>) -> Self {
        if reference.is_some() {
            self.external_reference = reference;
        }
        self
    }

    pub(crate) fn apply(self, obligation: &mut PaymentObligation) {
        if let Some(rail) = self.rail {
            obligation.rail = Some(rail);
        }
        if let Some(reference) = self.external_reference {
            obligation.external_reference = Some(reference);
        }
        if let Some(reason) = self.failure_reason {
            obligation.failure_reason = Some(reason);
        }
        if let Some(at) = self.settled_at {
            obligation.settled_at = Some(at);
        }
    }
}

/// Normalized three-way transfer result.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransferResolution {
    Settled,
    Failed,
    Indeterminate,
}

impl TransferResolution {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Settled => "settled",
            Self::Failed => "failed",
            Self::Indeterminate => "indeterminate",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransferOutcome {
    pub obligation_id: String,
    pub external_reference: Option<String>,
    pub resolution: TransferResolution,
    pub settled_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    pub poll_attempts: u32,
}

impl TransferOutcome {
    pub fn is_terminal(&self) -> bool {
        !matches!(self.resolution, TransferResolution::Indeterminate)
    }
}

/// Role-promotion signal for the user-management collaborator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActivationSignal {
    pub lease_id: String,
    pub tenant_user_id: String,
    pub activated_at: DateTime<Utc>,
}

/// Who asked for a settlement to run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Initiation {
    /// A human confirmed the payment; the autonomy gate is bypassed.
    Human { actor_id: String },
    /// An unattended process; the autonomy gate decides.
    Autonomous { agent_id: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::terms;
    use chrono::Duration;

    #[test]
    fn rejects_lease_id_longer_than_limit() {
        let terms = terms(&"x".repeat(MAX_LEASE_ID_LEN + 1));
        assert!(matches!(
            terms.validate(),
            Err(RentflowError::Validation(_))
        ));
    }

    #[test]
    fn rejects_end_before_start() {
        let mut terms = terms("lease-a");
        terms.end_date = terms.start_date - Duration::days(1);
        assert!(terms.validate().is_err());
    }

    #[test]
    fn terms_digest_changes_with_amount() {
        let a = terms("lease-a");
        let mut b = a.clone();
        b.monthly_amount_minor += 1;
        assert_ne!(a.digest().unwrap(), b.digest().unwrap());
    }

    #[test]
    fn signature_digest_is_bound_to_role() {
        let lease = Lease::from_terms(terms("lease-a")).unwrap();
        let landlord = SignatureProof::for_party(&lease, PartyRole::Landlord);
        let forged = signature_digest(&lease.terms_digest, PartyRole::Tenant, &lease.landlord_id);
        assert_ne!(landlord.digest, forged);
    }

    #[test]
    fn formats_minor_units_with_precision() {
        assert_eq!(CurrencyUnit::usdc().format_minor(1_500_250_000), "1500.250000");
        assert_eq!(CurrencyUnit::new("USD", 2).format_minor(5), "0.05");
    }

    #[test]
    fn obligation_transitions_never_leave_terminal_states() {
        use ObligationState::*;
        for terminal in [Settled, Failed] {
            for next in [Pending, Submitting, Submitted, Settled, Failed] {
                assert!(!terminal.can_transition_to(next));
            }
        }
        assert!(Pending.can_transition_to(Submitting));
        assert!(!Pending.can_transition_to(Submitted));
    }

    #[test]
    fn recurring_kind_label_parses_back() {
        let kind = ObligationKind::RecurringRent { period: 4 };
        assert_eq!(ObligationKind::parse(&kind.label()).unwrap(), kind);
        assert!(ObligationKind::parse("recurring_rent:x").is_err());
    }
}

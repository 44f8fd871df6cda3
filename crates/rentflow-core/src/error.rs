use thiserror::Error;

/// Settlement engine errors.
///
/// Rail rejections and validation failures are distinct variants because the
/// executor handles them differently: validation happens before the obligation
/// is touched, while a rail rejection moves the obligation to `failed`.
/// Indeterminate polling is not an error and never appears here.
#[derive(Debug, Error)]
pub enum RentflowError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Rail '{rail}' rejected transfer: {message}")]
    Rail { rail: String, message: String },

    /// The rail could not be reached or gave no definite answer. A transfer
    /// submitted when this is returned may or may not have been accepted.
    #[error("Rail '{rail}' unavailable: {message}")]
    RailUnavailable { rail: String, message: String },

    #[error("Party '{role}' already signed lease '{lease_id}'")]
    DuplicateSignature { lease_id: String, role: String },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Lease '{0}' not found")]
    LeaseNotFound(String),

    #[error("Obligation '{0}' not found")]
    ObligationNotFound(String),

    #[error("Invalid signature proof: {0}")]
    InvalidProof(String),

    #[error("Obligation '{obligation_id}' is already {state}")]
    SubmissionConflict {
        obligation_id: String,
        state: String,
    },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Ledger error: {0}")]
    Ledger(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl RentflowError {
    pub fn rail(rail: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Rail {
            rail: rail.into(),
            message: message.into(),
        }
    }

    pub fn rail_unavailable(rail: impl Into<String>, message: impl Into<String>) -> Self {
        Self::RailUnavailable {
            rail: rail.into(),
            message: message.into(),
        }
    }

    pub fn transition_violation(entity: &str, from: &str, to: &str) -> Self {
        Self::InvalidState(format!(
            "{entity} transition not allowed: '{from}' -> '{to}'"
        ))
    }
}

impl From<serde_json::Error> for RentflowError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

pub type RentflowResult<T> = Result<T, RentflowError>;

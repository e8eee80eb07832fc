//! Error types for Geniesafe
//!
//! Provides a unified error type and domain-specific error variants

use thiserror::Error;
use uuid::Uuid;

use crate::types::subject::SubjectStatus;

/// Result type alias using GenieError
pub type Result<T> = std::result::Result<T, GenieError>;

/// Unified error type for Geniesafe operations
#[derive(Debug, Error)]
pub enum GenieError {
    // Quorum state machine errors
    #[error("Quorum error: {0}")]
    Quorum(#[from] QuorumError),

    // Panel assignment errors
    #[error("Panel error: {0}")]
    Panel(#[from] PanelError),

    // Beneficiary allocation errors
    #[error("Allocation error: {0}")]
    Allocation(#[from] AllocationError),

    // Record store errors
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    // Side-effect dispatch errors
    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl GenieError {
    /// Whether the error means a subject, attestor or user does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            GenieError::Quorum(QuorumError::SubjectNotFound(_))
                | GenieError::Quorum(QuorumError::AttestorNotFound { .. })
                | GenieError::Store(StoreError::SubjectNotFound(_))
                | GenieError::Store(StoreError::AttestorNotFound { .. })
                | GenieError::Store(StoreError::UserNotFound(_))
        )
    }
}

/// Attestation quorum errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum QuorumError {
    #[error("Cannot {operation} subject {subject_id} while it is {status}")]
    InvalidState {
        subject_id: Uuid,
        status: SubjectStatus,
        operation: &'static str,
    },

    #[error("Subject {0} has no attestors assigned")]
    EmptyPanel(Uuid),

    #[error("Subject not found: {0}")]
    SubjectNotFound(Uuid),

    #[error("Attestor {attestor_id} not found on subject {subject_id}")]
    AttestorNotFound { subject_id: Uuid, attestor_id: Uuid },

    #[error("User {user_id} is not authorized for this operation")]
    Unauthorized { user_id: Uuid },

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Concurrent update on subject {subject_id} after {attempts} attempts, please retry")]
    Conflict { subject_id: Uuid, attempts: u32 },

    #[error("Confirmation link is invalid or belongs to an earlier activation")]
    InvalidLink,
}

/// Panel assignment errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum PanelError {
    #[error("Panel must have {expected} attestors, got {actual}")]
    WrongSize { expected: usize, actual: usize },

    #[error("Panel must have between {min} and {max} attestors, got {actual}")]
    OutOfBounds { min: usize, max: usize, actual: usize },

    #[error("User {0} appears more than once on the panel")]
    DuplicateAttestor(Uuid),

    #[error("Owner {0} cannot attest to their own record")]
    SelfAttestation(Uuid),
}

/// Beneficiary allocation errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum AllocationError {
    #[error("A will needs at least one beneficiary")]
    NoBeneficiaries,

    #[error("Beneficiary {0} must receive a positive share")]
    NonPositiveShare(Uuid),

    #[error("Beneficiary {0} is listed more than once")]
    DuplicateBeneficiary(Uuid),

    #[error("Shares must sum to {expected}%, got {actual}%")]
    IncompleteAllocation {
        expected: rust_decimal::Decimal,
        actual: rust_decimal::Decimal,
    },
}

/// Record store errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum StoreError {
    #[error("Subject not found: {0}")]
    SubjectNotFound(Uuid),

    #[error("Attestor {attestor_id} not found on subject {subject_id}")]
    AttestorNotFound { subject_id: Uuid, attestor_id: Uuid },

    #[error("User not found: {0}")]
    UserNotFound(Uuid),

    #[error("Subject already exists: {0}")]
    Duplicate(Uuid),

    #[error("Version conflict: expected {expected}, found {found}")]
    VersionConflict { expected: u64, found: u64 },

    #[error("Status mismatch: expected {expected}, found {found}")]
    StatusMismatch {
        expected: SubjectStatus,
        found: SubjectStatus,
    },

    #[error("Subject {0} holds no secret")]
    NoSecret(Uuid),

    #[error("Backend error: {0}")]
    Backend(String),
}

/// Notification and ledger failures
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DispatchError {
    #[error("Notification to {to} failed: {reason}")]
    Notify { to: String, reason: String },

    #[error("Ledger call failed: {0}")]
    Ledger(String),

    #[error("Email could not be rendered: {0}")]
    Render(String),

    #[error("Event channel closed")]
    ChannelClosed,
}

impl From<serde_json::Error> for GenieError {
    fn from(err: serde_json::Error) -> Self {
        GenieError::Serialization(err.to_string())
    }
}

impl From<hex::FromHexError> for GenieError {
    fn from(err: hex::FromHexError) -> Self {
        GenieError::Serialization(err.to_string())
    }
}

//! # Geniesafe Common
//!
//! Shared types, errors, and constants for the Geniesafe will and safeguard services.
//!
//! ## Core Types
//!
//! - [`SubjectRecord`]: a will or a recovery config together with its attestor panel
//! - [`Attestor`]: one panel member (validator or verifier) and its confirmation state
//! - [`SubjectStatus`]: lifecycle status shared by both subject kinds
//! - [`Beneficiary`]: a share of the owner's funds under a will
//! - [`SealedSecret`]: an opaque, client-sealed recovery secret
//! - [`UserProfile`]/[`AttestorProfile`]: identity projection used for notifications

pub mod error;
pub mod types;

// Re-export commonly used types at crate root
pub use error::{
    AllocationError, DispatchError, GenieError, PanelError, QuorumError, Result, StoreError,
};
pub use types::{
    subject::{
        Attestor, AttestorId, SubjectId, SubjectKind, SubjectPayload, SubjectRecord,
        SubjectStatus, SubjectView,
    },
    beneficiary::{validate_allocation, Beneficiary},
    secret::SealedSecret,
    user::{AttestorProfile, UserId, UserProfile},
};

/// Geniesafe version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Number of verifiers on every safeguard panel
pub const SAFEGUARD_PANEL_SIZE: usize = 3;

/// Upper bound on will validators
pub const MAX_WILL_VALIDATORS: usize = 3;

/// Attempts at a conditional write before a conflict is surfaced
pub const MAX_CONFIRM_ATTEMPTS: u32 = 3;

/// Beneficiary percentages must sum to this
pub const FULL_ALLOCATION_PERCENT: u32 = 100;

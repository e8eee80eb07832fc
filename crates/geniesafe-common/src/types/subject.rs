//! Subjects - the records attestors vouch for
//!
//! A subject is either a will (validated by its validators once the owner has
//! passed away) or a recovery config (verified by exactly three verifiers before
//! the sealed secret is released). Both share one lifecycle shape:
//!
//! ```text
//! INACTIVE --activate--> ACTIVE --last confirm--> VALIDATED | VERIFIED
//! ```
//!
//! Every write bumps `version`, which stores use for compare-and-swap. Every
//! reset of the panel's confirmations bumps `cycle`, which invalidates the
//! confirmation links handed out for the previous activation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::beneficiary::Beneficiary;
use super::secret::SealedSecret;
use super::user::{AttestorProfile, UserId};

pub type SubjectId = Uuid;
pub type AttestorId = Uuid;

/// Lifecycle status shared by wills and recovery configs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubjectStatus {
    Inactive,
    Active,
    Validated,
    Verified,
    Executed,
}

impl SubjectStatus {
    /// Whether `self -> to` is a legal move for a subject of `kind`
    pub fn can_transition(self, kind: SubjectKind, to: SubjectStatus) -> bool {
        use SubjectStatus::*;
        match kind {
            SubjectKind::Will => matches!(
                (self, to),
                (Inactive, Active) | (Active, Validated) | (Active, Inactive) | (Validated, Executed)
            ),
            SubjectKind::RecoveryConfig => matches!(
                (self, to),
                (Inactive, Active) | (Active, Verified) | (Active, Inactive) | (Verified, Inactive)
            ),
        }
    }
}

impl std::fmt::Display for SubjectStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubjectStatus::Inactive => write!(f, "INACTIVE"),
            SubjectStatus::Active => write!(f, "ACTIVE"),
            SubjectStatus::Validated => write!(f, "VALIDATED"),
            SubjectStatus::Verified => write!(f, "VERIFIED"),
            SubjectStatus::Executed => write!(f, "EXECUTED"),
        }
    }
}

/// Which kind of record is being attested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubjectKind {
    Will,
    RecoveryConfig,
}

impl SubjectKind {
    /// Status reached once every attestor has confirmed
    pub fn completion_status(self) -> SubjectStatus {
        match self {
            SubjectKind::Will => SubjectStatus::Validated,
            SubjectKind::RecoveryConfig => SubjectStatus::Verified,
        }
    }

    /// What a panel member is called for this kind
    pub fn attestor_role(self) -> &'static str {
        match self {
            SubjectKind::Will => "validator",
            SubjectKind::RecoveryConfig => "verifier",
        }
    }
}

impl std::fmt::Display for SubjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubjectKind::Will => write!(f, "will"),
            SubjectKind::RecoveryConfig => write!(f, "safeguard"),
        }
    }
}

/// Kind-specific contents of a subject
#[derive(Debug, Clone)]
pub enum SubjectPayload {
    Will { beneficiaries: Vec<Beneficiary> },
    RecoveryConfig { secret: SealedSecret },
}

/// One panel member
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attestor {
    pub id: AttestorId,
    pub subject_id: SubjectId,
    pub user_id: UserId,
    pub has_confirmed: bool,
    pub confirmed_at: Option<DateTime<Utc>>,
}

impl Attestor {
    pub fn new(subject_id: SubjectId, user_id: UserId) -> Self {
        Self {
            id: Uuid::now_v7(),
            subject_id,
            user_id,
            has_confirmed: false,
            confirmed_at: None,
        }
    }

    /// Mark confirmed; returns false if it already was
    pub fn confirm(&mut self, at: DateTime<Utc>) -> bool {
        if self.has_confirmed {
            return false;
        }
        self.has_confirmed = true;
        self.confirmed_at = Some(at);
        true
    }

    fn reset(&mut self) {
        self.has_confirmed = false;
        self.confirmed_at = None;
    }
}

/// A will or recovery config with its attestor panel
#[derive(Debug, Clone)]
pub struct SubjectRecord {
    pub id: SubjectId,
    pub owner_id: UserId,
    pub status: SubjectStatus,
    pub payload: SubjectPayload,
    pub panel: Vec<Attestor>,
    /// Activation cycle, bumped whenever confirmations are cleared
    pub cycle: u64,
    /// Version for optimistic concurrency control
    pub version: u64,
    pub activated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SubjectRecord {
    /// Create an inactive subject; the panel is attached separately
    pub fn new(owner_id: UserId, payload: SubjectPayload) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            owner_id,
            status: SubjectStatus::Inactive,
            payload,
            panel: Vec::new(),
            cycle: 0,
            version: 0,
            activated_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn kind(&self) -> SubjectKind {
        match self.payload {
            SubjectPayload::Will { .. } => SubjectKind::Will,
            SubjectPayload::RecoveryConfig { .. } => SubjectKind::RecoveryConfig,
        }
    }

    pub fn beneficiaries(&self) -> Option<&[Beneficiary]> {
        match &self.payload {
            SubjectPayload::Will { beneficiaries } => Some(beneficiaries),
            SubjectPayload::RecoveryConfig { .. } => None,
        }
    }

    pub fn secret(&self) -> Option<&SealedSecret> {
        match &self.payload {
            SubjectPayload::RecoveryConfig { secret } => Some(secret),
            SubjectPayload::Will { .. } => None,
        }
    }

    pub fn attestor(&self, attestor_id: AttestorId) -> Option<&Attestor> {
        self.panel.iter().find(|a| a.id == attestor_id)
    }

    pub fn attestor_mut(&mut self, attestor_id: AttestorId) -> Option<&mut Attestor> {
        self.panel.iter_mut().find(|a| a.id == attestor_id)
    }

    pub fn is_panel_member(&self, user_id: UserId) -> bool {
        self.panel.iter().any(|a| a.user_id == user_id)
    }

    #[inline]
    pub fn confirmed_count(&self) -> usize {
        self.panel.iter().filter(|a| a.has_confirmed).count()
    }

    #[inline]
    pub fn total_count(&self) -> usize {
        self.panel.len()
    }

    /// Quorum holds only for a non-empty, fully confirmed panel
    pub fn is_fully_confirmed(&self) -> bool {
        !self.panel.is_empty() && self.confirmed_count() == self.total_count()
    }

    /// Clear every confirmation and open a new cycle
    pub fn reset_confirmations(&mut self) {
        for attestor in &mut self.panel {
            attestor.reset();
        }
        self.cycle += 1;
    }

    /// Update version and timestamp
    pub fn touch(&mut self) {
        self.version += 1;
        self.updated_at = Utc::now();
    }

    /// Check and update with optimistic concurrency
    pub fn check_version(&self, expected: u64) -> Result<(), crate::StoreError> {
        if self.version != expected {
            return Err(crate::StoreError::VersionConflict {
                expected,
                found: self.version,
            });
        }
        Ok(())
    }
}

/// Secret-free projection of a subject returned to callers
#[derive(Debug, Clone, Serialize)]
pub struct SubjectView {
    pub id: SubjectId,
    pub kind: SubjectKind,
    pub owner_id: UserId,
    pub status: SubjectStatus,
    pub cycle: u64,
    pub confirmed_count: usize,
    pub total_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub beneficiaries: Option<Vec<Beneficiary>>,
    pub attestors: Vec<AttestorProfile>,
    pub activated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SubjectView {
    pub fn new(record: &SubjectRecord, attestors: Vec<AttestorProfile>) -> Self {
        Self {
            id: record.id,
            kind: record.kind(),
            owner_id: record.owner_id,
            status: record.status,
            cycle: record.cycle,
            confirmed_count: record.confirmed_count(),
            total_count: record.total_count(),
            beneficiaries: record.beneficiaries().map(|b| b.to_vec()),
            attestors,
            activated_at: record.activated_at,
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }
}

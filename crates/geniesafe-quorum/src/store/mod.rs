//! Record storage
//!
//! The quorum's state lives entirely in a [`RecordStore`]. Besides plain
//! reads and single-field writes, a store must offer the compound conditional
//! primitives below. Each of them is one atomic unit: the version check, the
//! write and any counting happen together, so two attestors confirming at the
//! same instant cannot both observe a full panel.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use geniesafe_common::{
    Attestor, AttestorId, AttestorProfile, SealedSecret, StoreError, SubjectId, SubjectRecord,
    SubjectStatus, UserId, UserProfile,
};

pub use memory::InMemoryRecordStore;

/// Result of [`RecordStore::commit_confirmation`]
#[derive(Debug, Clone)]
pub struct ConfirmationCommit {
    /// The attestor had already confirmed; nothing was written
    pub already_confirmed: bool,
    pub confirmed_count: usize,
    pub total_count: usize,
    /// This write moved the subject to its completion status
    pub completed: bool,
    /// Subject as committed
    pub record: SubjectRecord,
}

/// A guarded status move applied by [`RecordStore::transition_subject`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusChange {
    pub from: SubjectStatus,
    pub to: SubjectStatus,
    /// Clear every confirmation and open a new cycle
    pub reset_confirmations: bool,
    /// Stamp `activated_at`
    pub activated_at: Option<DateTime<Utc>>,
}

impl StatusChange {
    pub fn new(from: SubjectStatus, to: SubjectStatus) -> Self {
        Self {
            from,
            to,
            reset_confirmations: false,
            activated_at: None,
        }
    }

    pub fn resetting(mut self) -> Self {
        self.reset_confirmations = true;
        self
    }

    pub fn stamped(mut self, at: DateTime<Utc>) -> Self {
        self.activated_at = Some(at);
        self
    }
}

/// Trait for subject/attestor storage backends
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert a subject together with its panel
    async fn insert_subject(&self, record: SubjectRecord) -> Result<(), StoreError>;

    /// Get a subject by ID
    async fn get_subject(&self, id: SubjectId) -> Result<SubjectRecord, StoreError>;

    /// Move status from `expected` to `new`, failing if the current status differs
    async fn update_subject_status(
        &self,
        id: SubjectId,
        expected: SubjectStatus,
        new: SubjectStatus,
    ) -> Result<SubjectRecord, StoreError>;

    /// Get one attestor of a subject
    async fn get_attestor(
        &self,
        subject_id: SubjectId,
        attestor_id: AttestorId,
    ) -> Result<Attestor, StoreError>;

    /// Set an attestor's confirmation; returns false if it was already set
    async fn set_attestor_confirmed(
        &self,
        subject_id: SubjectId,
        attestor_id: AttestorId,
    ) -> Result<bool, StoreError>;

    /// Number of confirmed attestors on a subject
    async fn count_confirmed(&self, subject_id: SubjectId) -> Result<usize, StoreError>;

    /// Conditionally record a confirmation and evaluate the quorum
    ///
    /// Fails with `VersionConflict` unless the subject is still at
    /// `expected_version`, and with `StatusMismatch` unless it is ACTIVE.
    async fn commit_confirmation(
        &self,
        subject_id: SubjectId,
        attestor_id: AttestorId,
        expected_version: u64,
        at: DateTime<Utc>,
    ) -> Result<ConfirmationCommit, StoreError>;

    /// Conditionally apply a status change
    async fn transition_subject(
        &self,
        id: SubjectId,
        expected_version: u64,
        change: StatusChange,
    ) -> Result<SubjectRecord, StoreError>;

    /// Return the sealed secret and reset a VERIFIED config to INACTIVE
    async fn take_secret(
        &self,
        id: SubjectId,
        expected_version: u64,
    ) -> Result<SealedSecret, StoreError>;

    /// Replace the panel of an INACTIVE subject
    async fn replace_panel(
        &self,
        id: SubjectId,
        expected_version: u64,
        panel: Vec<Attestor>,
    ) -> Result<SubjectRecord, StoreError>;

    /// Insert or update a user profile
    async fn upsert_user(&self, profile: UserProfile) -> Result<(), StoreError>;

    /// Get a user profile by ID
    async fn get_user(&self, id: UserId) -> Result<UserProfile, StoreError>;

    /// Attestors of a subject joined with their user profiles
    async fn attestor_profiles(
        &self,
        subject_id: SubjectId,
    ) -> Result<Vec<AttestorProfile>, StoreError>;
}

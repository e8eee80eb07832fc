//! In-memory record store
//!
//! Uses DashMap: `get_mut` holds the shard's write lock for the whole
//! closure, which makes every compound primitive a single atomic unit.
//! Closures validate before they mutate, so a rejected write leaves the
//! record untouched.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use geniesafe_common::{
    Attestor, AttestorId, AttestorProfile, SealedSecret, StoreError, SubjectId, SubjectRecord,
    SubjectStatus, UserId, UserProfile,
};

use super::{ConfirmationCommit, RecordStore, StatusChange};

/// In-memory storage implementation
#[derive(Default)]
pub struct InMemoryRecordStore {
    subjects: DashMap<SubjectId, SubjectRecord>,
    users: DashMap<UserId, UserProfile>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subject_count(&self) -> usize {
        self.subjects.len()
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    fn with_subject_mut<T>(
        &self,
        id: SubjectId,
        f: impl FnOnce(&mut SubjectRecord) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut entry = self
            .subjects
            .get_mut(&id)
            .ok_or(StoreError::SubjectNotFound(id))?;
        f(entry.value_mut())
    }
}

fn expect_status(record: &SubjectRecord, expected: SubjectStatus) -> Result<(), StoreError> {
    if record.status != expected {
        return Err(StoreError::StatusMismatch {
            expected,
            found: record.status,
        });
    }
    Ok(())
}

/// Reject moves the kind does not allow, and completion without a full panel
fn check_move(record: &SubjectRecord, to: SubjectStatus) -> Result<(), StoreError> {
    let kind = record.kind();
    if !record.status.can_transition(kind, to) {
        return Err(StoreError::Backend(format!(
            "illegal {} transition {} -> {}",
            kind, record.status, to
        )));
    }
    if to == kind.completion_status() && !record.is_fully_confirmed() {
        return Err(StoreError::Backend(format!(
            "{} of {} attestors confirmed, cannot move to {}",
            record.confirmed_count(),
            record.total_count(),
            to
        )));
    }
    Ok(())
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn insert_subject(&self, record: SubjectRecord) -> Result<(), StoreError> {
        use dashmap::mapref::entry::Entry;

        match self.subjects.entry(record.id) {
            Entry::Occupied(_) => Err(StoreError::Duplicate(record.id)),
            Entry::Vacant(slot) => {
                slot.insert(record);
                Ok(())
            }
        }
    }

    async fn get_subject(&self, id: SubjectId) -> Result<SubjectRecord, StoreError> {
        self.subjects
            .get(&id)
            .map(|r| r.clone())
            .ok_or(StoreError::SubjectNotFound(id))
    }

    async fn update_subject_status(
        &self,
        id: SubjectId,
        expected: SubjectStatus,
        new: SubjectStatus,
    ) -> Result<SubjectRecord, StoreError> {
        self.with_subject_mut(id, |record| {
            expect_status(record, expected)?;
            check_move(record, new)?;
            record.status = new;
            record.touch();
            Ok(record.clone())
        })
    }

    async fn get_attestor(
        &self,
        subject_id: SubjectId,
        attestor_id: AttestorId,
    ) -> Result<Attestor, StoreError> {
        let record = self
            .subjects
            .get(&subject_id)
            .ok_or(StoreError::SubjectNotFound(subject_id))?;
        record
            .attestor(attestor_id)
            .cloned()
            .ok_or(StoreError::AttestorNotFound {
                subject_id,
                attestor_id,
            })
    }

    async fn set_attestor_confirmed(
        &self,
        subject_id: SubjectId,
        attestor_id: AttestorId,
    ) -> Result<bool, StoreError> {
        self.with_subject_mut(subject_id, |record| {
            let attestor = record
                .attestor_mut(attestor_id)
                .ok_or(StoreError::AttestorNotFound {
                    subject_id,
                    attestor_id,
                })?;
            let changed = attestor.confirm(Utc::now());
            if changed {
                record.touch();
            }
            Ok(changed)
        })
    }

    async fn count_confirmed(&self, subject_id: SubjectId) -> Result<usize, StoreError> {
        self.subjects
            .get(&subject_id)
            .map(|r| r.confirmed_count())
            .ok_or(StoreError::SubjectNotFound(subject_id))
    }

    async fn commit_confirmation(
        &self,
        subject_id: SubjectId,
        attestor_id: AttestorId,
        expected_version: u64,
        at: DateTime<Utc>,
    ) -> Result<ConfirmationCommit, StoreError> {
        self.with_subject_mut(subject_id, |record| {
            record.check_version(expected_version)?;
            expect_status(record, SubjectStatus::Active)?;

            let attestor = record
                .attestor_mut(attestor_id)
                .ok_or(StoreError::AttestorNotFound {
                    subject_id,
                    attestor_id,
                })?;

            if !attestor.confirm(at) {
                return Ok(ConfirmationCommit {
                    already_confirmed: true,
                    confirmed_count: record.confirmed_count(),
                    total_count: record.total_count(),
                    completed: false,
                    record: record.clone(),
                });
            }

            let completed = record.is_fully_confirmed();
            if completed {
                record.status = record.kind().completion_status();
            }
            record.touch();

            Ok(ConfirmationCommit {
                already_confirmed: false,
                confirmed_count: record.confirmed_count(),
                total_count: record.total_count(),
                completed,
                record: record.clone(),
            })
        })
    }

    async fn transition_subject(
        &self,
        id: SubjectId,
        expected_version: u64,
        change: StatusChange,
    ) -> Result<SubjectRecord, StoreError> {
        self.with_subject_mut(id, |record| {
            record.check_version(expected_version)?;
            expect_status(record, change.from)?;
            check_move(record, change.to)?;

            if change.reset_confirmations {
                record.reset_confirmations();
            }
            if let Some(at) = change.activated_at {
                record.activated_at = Some(at);
            }
            record.status = change.to;
            record.touch();
            Ok(record.clone())
        })
    }

    async fn take_secret(
        &self,
        id: SubjectId,
        expected_version: u64,
    ) -> Result<SealedSecret, StoreError> {
        self.with_subject_mut(id, |record| {
            record.check_version(expected_version)?;
            expect_status(record, SubjectStatus::Verified)?;
            check_move(record, SubjectStatus::Inactive)?;

            let secret = record.secret().cloned().ok_or(StoreError::NoSecret(id))?;
            record.reset_confirmations();
            record.status = SubjectStatus::Inactive;
            record.touch();
            Ok(secret)
        })
    }

    async fn replace_panel(
        &self,
        id: SubjectId,
        expected_version: u64,
        panel: Vec<Attestor>,
    ) -> Result<SubjectRecord, StoreError> {
        self.with_subject_mut(id, |record| {
            record.check_version(expected_version)?;
            expect_status(record, SubjectStatus::Inactive)?;
            if let Some(stray) = panel.iter().find(|a| a.subject_id != id) {
                return Err(StoreError::Backend(format!(
                    "attestor {} belongs to subject {}",
                    stray.id, stray.subject_id
                )));
            }
            record.panel = panel;
            record.touch();
            Ok(record.clone())
        })
    }

    async fn upsert_user(&self, profile: UserProfile) -> Result<(), StoreError> {
        self.users.insert(profile.id, profile);
        Ok(())
    }

    async fn get_user(&self, id: UserId) -> Result<UserProfile, StoreError> {
        self.users
            .get(&id)
            .map(|p| p.clone())
            .ok_or(StoreError::UserNotFound(id))
    }

    async fn attestor_profiles(
        &self,
        subject_id: SubjectId,
    ) -> Result<Vec<AttestorProfile>, StoreError> {
        let panel = self
            .subjects
            .get(&subject_id)
            .map(|r| r.panel.clone())
            .ok_or(StoreError::SubjectNotFound(subject_id))?;

        Ok(panel
            .into_iter()
            .map(|attestor| {
                let profile = self.users.get(&attestor.user_id).map(|p| p.clone());
                AttestorProfile { attestor, profile }
            })
            .collect())
    }
}

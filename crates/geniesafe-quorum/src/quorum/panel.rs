//! Panel assignment
//!
//! Pure validation of an attestor panel before it is attached to a subject.
//! The quorum's counting is only meaningful if these hold going into
//! `activate`: no duplicate users, no self-attestation, size within bounds.

use std::collections::HashSet;

use geniesafe_common::{
    Attestor, PanelError, SubjectId, SubjectKind, UserId, MAX_WILL_VALIDATORS,
    SAFEGUARD_PANEL_SIZE,
};

/// Size bounds for each subject kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PanelRules {
    /// Exact number of verifiers on a safeguard
    pub safeguard_size: usize,
    /// Maximum validators on a will (minimum is always 1)
    pub max_will_validators: usize,
}

impl Default for PanelRules {
    fn default() -> Self {
        Self {
            safeguard_size: SAFEGUARD_PANEL_SIZE,
            max_will_validators: MAX_WILL_VALIDATORS,
        }
    }
}

impl PanelRules {
    /// Check a complete panel of user ids for `owner`
    pub fn validate(
        &self,
        kind: SubjectKind,
        owner: UserId,
        users: &[UserId],
    ) -> Result<(), PanelError> {
        self.validate_members(owner, users)?;
        self.validate_size(kind, users.len())
    }

    /// Membership rules only, for panels still being edited
    pub fn validate_members(&self, owner: UserId, users: &[UserId]) -> Result<(), PanelError> {
        let mut seen = HashSet::with_capacity(users.len());
        for user in users {
            if *user == owner {
                return Err(PanelError::SelfAttestation(owner));
            }
            if !seen.insert(*user) {
                return Err(PanelError::DuplicateAttestor(*user));
            }
        }
        Ok(())
    }

    pub fn validate_size(&self, kind: SubjectKind, actual: usize) -> Result<(), PanelError> {
        match kind {
            SubjectKind::RecoveryConfig if actual != self.safeguard_size => {
                Err(PanelError::WrongSize {
                    expected: self.safeguard_size,
                    actual,
                })
            }
            SubjectKind::Will if actual == 0 || actual > self.max_will_validators => {
                Err(PanelError::OutOfBounds {
                    min: 1,
                    max: self.max_will_validators,
                    actual,
                })
            }
            _ => Ok(()),
        }
    }

    /// Upper bound only, for panels being grown one member at a time
    pub fn validate_capacity(&self, kind: SubjectKind, actual: usize) -> Result<(), PanelError> {
        match kind {
            SubjectKind::RecoveryConfig if actual > self.safeguard_size => {
                Err(PanelError::WrongSize {
                    expected: self.safeguard_size,
                    actual,
                })
            }
            SubjectKind::Will if actual > self.max_will_validators => Err(PanelError::OutOfBounds {
                min: 1,
                max: self.max_will_validators,
                actual,
            }),
            _ => Ok(()),
        }
    }

    /// Validate and build fresh attestor rows for `subject_id`
    pub fn assign(
        &self,
        kind: SubjectKind,
        subject_id: SubjectId,
        owner: UserId,
        users: &[UserId],
    ) -> Result<Vec<Attestor>, PanelError> {
        self.validate(kind, owner, users)?;
        Ok(users
            .iter()
            .map(|user| Attestor::new(subject_id, *user))
            .collect())
    }
}

//! Attestation quorum engine
//!
//! Coordinates one subject's panel through its lifecycle:
//! 1. Owner creates the subject with its panel (INACTIVE)
//! 2. Owner activates it, every attestor is invited
//! 3. Attestors confirm, each exactly once
//! 4. The confirmation that fills the panel completes the subject
//! 5. Safeguard owners release the secret once, which starts a new cycle
//!
//! Every write is a conditional store primitive guarded by the version read
//! just before it. A `VersionConflict` means another attestor got there
//! first; the engine re-reads and tries again, up to `max_confirm_attempts`.
//! Only the caller whose write flipped the status publishes `Completed`.

use std::sync::Arc;

use chrono::Utc;
use geniesafe_common::{
    validate_allocation, Attestor, AttestorId, Beneficiary, GenieError, QuorumError, Result,
    SealedSecret, StoreError, SubjectId, SubjectKind, SubjectPayload, SubjectRecord,
    SubjectStatus, SubjectView, UserId,
};
use tracing::{debug, info, instrument, warn};

use super::outcome::QuorumOutcome;
use super::panel::PanelRules;
use crate::dispatch::{
    AttestorInvite, EventPublisher, LinkSigner, PendingMirrors, QuorumEvent, SubjectSummary,
};
use crate::metrics::QuorumMetrics;
use crate::store::{ConfirmationCommit, RecordStore, StatusChange};
use crate::QuorumConfig;

fn invalid_state(record: &SubjectRecord, operation: &'static str) -> GenieError {
    QuorumError::InvalidState {
        subject_id: record.id,
        status: record.status,
        operation,
    }
    .into()
}

fn map_store(err: StoreError, subject_id: SubjectId, operation: &'static str) -> GenieError {
    match err {
        StoreError::SubjectNotFound(id) => QuorumError::SubjectNotFound(id).into(),
        StoreError::AttestorNotFound {
            subject_id,
            attestor_id,
        } => QuorumError::AttestorNotFound {
            subject_id,
            attestor_id,
        }
        .into(),
        StoreError::StatusMismatch { found, .. } => QuorumError::InvalidState {
            subject_id,
            status: found,
            operation,
        }
        .into(),
        other => other.into(),
    }
}

fn require_owner(record: &SubjectRecord, caller: UserId) -> Result<()> {
    if record.owner_id != caller {
        return Err(QuorumError::Unauthorized { user_id: caller }.into());
    }
    Ok(())
}

fn require_kind(record: &SubjectRecord, kind: SubjectKind, action: &str) -> Result<()> {
    if record.kind() != kind {
        return Err(QuorumError::Forbidden(format!("a {} cannot be {}", record.kind(), action)).into());
    }
    Ok(())
}

/// Confirm-once, complete-once attestation over a subject's panel
pub struct AttestationQuorum {
    config: QuorumConfig,
    rules: PanelRules,
    store: Arc<dyn RecordStore>,
    links: LinkSigner,
    events: EventPublisher,
    mirrors: PendingMirrors,
    metrics: Arc<QuorumMetrics>,
}

impl AttestationQuorum {
    /// Create an engine that publishes nowhere
    pub fn new(config: QuorumConfig, store: Arc<dyn RecordStore>, links: LinkSigner) -> Self {
        Self {
            rules: config.panel_rules(),
            config,
            store,
            links,
            events: EventPublisher::disabled(),
            mirrors: PendingMirrors::new(),
            metrics: Arc::new(QuorumMetrics::new()),
        }
    }

    /// Publish committed state changes to a dispatcher
    pub fn with_events(mut self, events: EventPublisher) -> Self {
        self.events = events;
        self
    }

    /// Share the pending ledger calls tracked by the dispatcher
    pub fn with_mirrors(mut self, mirrors: PendingMirrors) -> Self {
        self.mirrors = mirrors;
        self
    }

    /// Share metrics with the dispatcher and the scrape endpoint
    pub fn with_metrics(mut self, metrics: Arc<QuorumMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn config(&self) -> &QuorumConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    pub fn links(&self) -> &LinkSigner {
        &self.links
    }

    pub fn metrics(&self) -> &Arc<QuorumMetrics> {
        &self.metrics
    }

    pub fn pending_mirrors(&self) -> &PendingMirrors {
        &self.mirrors
    }

    fn attempts(&self) -> u32 {
        self.config.max_confirm_attempts.max(1)
    }

    async fn load(&self, subject_id: SubjectId) -> Result<SubjectRecord> {
        self.store
            .get_subject(subject_id)
            .await
            .map_err(|e| map_store(e, subject_id, "load"))
    }

    fn note_conflict(&self, subject_id: SubjectId, attempt: u32, expected: u64, found: u64) {
        self.metrics.version_conflicts_total.inc();
        debug!(
            subject_id = %subject_id,
            attempt = attempt,
            expected = expected,
            found = found,
            "Concurrent update, retrying with a fresh read"
        );
    }

    fn conflict(&self, subject_id: SubjectId) -> GenieError {
        warn!(subject_id = %subject_id, attempts = self.attempts(), "Giving up after repeated conflicts");
        QuorumError::Conflict {
            subject_id,
            attempts: self.attempts(),
        }
        .into()
    }

    /// Read, plan a status change against that read, apply it conditionally
    async fn transition<F>(
        &self,
        subject_id: SubjectId,
        operation: &'static str,
        plan: F,
    ) -> Result<SubjectRecord>
    where
        F: Fn(&SubjectRecord) -> Result<StatusChange> + Send + Sync,
    {
        for attempt in 1..=self.attempts() {
            let record = self.load(subject_id).await?;
            let change = plan(&record)?;
            match self
                .store
                .transition_subject(subject_id, record.version, change)
                .await
            {
                Ok(updated) => return Ok(updated),
                Err(StoreError::VersionConflict { expected, found }) => {
                    self.note_conflict(subject_id, attempt, expected, found)
                }
                Err(err) => return Err(map_store(err, subject_id, operation)),
            }
        }
        Err(self.conflict(subject_id))
    }

    /// Read, build a new panel against that read, replace it conditionally
    async fn edit_panel<F>(
        &self,
        subject_id: SubjectId,
        caller: UserId,
        edit: F,
    ) -> Result<SubjectRecord>
    where
        F: Fn(&SubjectRecord) -> Result<Vec<Attestor>> + Send + Sync,
    {
        for attempt in 1..=self.attempts() {
            let record = self.load(subject_id).await?;
            require_owner(&record, caller)?;
            if record.status != SubjectStatus::Inactive {
                return Err(invalid_state(&record, "edit the panel of"));
            }
            let panel = edit(&record)?;
            match self
                .store
                .replace_panel(subject_id, record.version, panel)
                .await
            {
                Ok(updated) => return Ok(updated),
                Err(StoreError::VersionConflict { expected, found }) => {
                    self.note_conflict(subject_id, attempt, expected, found)
                }
                Err(err) => return Err(map_store(err, subject_id, "edit the panel of")),
            }
        }
        Err(self.conflict(subject_id))
    }

    async fn insert(&self, record: SubjectRecord) -> Result<SubjectRecord> {
        self.store.insert_subject(record.clone()).await?;
        info!(
            subject_id = %record.id,
            kind = %record.kind(),
            owner = %record.owner_id,
            panel = record.total_count(),
            "Subject created"
        );
        Ok(record)
    }

    /// Create an inactive will with its beneficiaries and validators
    #[instrument(skip(self, beneficiaries, validators))]
    pub async fn create_will(
        &self,
        owner: UserId,
        beneficiaries: Vec<Beneficiary>,
        validators: &[UserId],
    ) -> Result<SubjectRecord> {
        validate_allocation(&beneficiaries)?;
        let mut record = SubjectRecord::new(owner, SubjectPayload::Will { beneficiaries });
        record.panel = self
            .rules
            .assign(SubjectKind::Will, record.id, owner, validators)?;
        self.insert(record).await
    }

    /// Create an inactive safeguard holding `secret`, verified by `verifiers`
    #[instrument(skip(self, secret, verifiers))]
    pub async fn create_safeguard(
        &self,
        owner: UserId,
        secret: SealedSecret,
        verifiers: &[UserId],
    ) -> Result<SubjectRecord> {
        let mut record = SubjectRecord::new(owner, SubjectPayload::RecoveryConfig { secret });
        record.panel = self
            .rules
            .assign(SubjectKind::RecoveryConfig, record.id, owner, verifiers)?;
        self.insert(record).await
    }

    /// Add a panel member while the subject is INACTIVE
    #[instrument(skip(self))]
    pub async fn add_attestor(
        &self,
        subject_id: SubjectId,
        caller: UserId,
        user_id: UserId,
    ) -> Result<SubjectRecord> {
        let rules = self.rules;
        let updated = self
            .edit_panel(subject_id, caller, |record| {
                let mut users: Vec<UserId> = record.panel.iter().map(|a| a.user_id).collect();
                users.push(user_id);
                rules.validate_members(record.owner_id, &users)?;
                rules.validate_capacity(record.kind(), users.len())?;

                let mut panel = record.panel.clone();
                panel.push(Attestor::new(record.id, user_id));
                Ok(panel)
            })
            .await?;

        info!(subject_id = %subject_id, user_id = %user_id, "Attestor added");
        Ok(updated)
    }

    /// Remove a panel member while the subject is INACTIVE
    #[instrument(skip(self))]
    pub async fn remove_attestor(
        &self,
        subject_id: SubjectId,
        caller: UserId,
        attestor_id: AttestorId,
    ) -> Result<SubjectRecord> {
        let updated = self
            .edit_panel(subject_id, caller, |record| {
                if record.attestor(attestor_id).is_none() {
                    return Err(QuorumError::AttestorNotFound {
                        subject_id,
                        attestor_id,
                    }
                    .into());
                }
                Ok(record
                    .panel
                    .iter()
                    .filter(|a| a.id != attestor_id)
                    .cloned()
                    .collect())
            })
            .await?;

        info!(subject_id = %subject_id, attestor_id = %attestor_id, "Attestor removed");
        Ok(updated)
    }

    /// Open the subject for confirmation and invite every attestor
    ///
    /// Clears any confirmations left from an earlier cycle.
    #[instrument(skip(self))]
    pub async fn activate(&self, subject_id: SubjectId, caller: UserId) -> Result<SubjectRecord> {
        let rules = self.rules;
        let updated = self
            .transition(subject_id, "activate", |record| {
                require_owner(record, caller)?;
                if record.status != SubjectStatus::Inactive {
                    return Err(invalid_state(record, "activate"));
                }
                if record.panel.is_empty() {
                    return Err(QuorumError::EmptyPanel(record.id).into());
                }
                rules.validate_size(record.kind(), record.total_count())?;
                Ok(
                    StatusChange::new(SubjectStatus::Inactive, SubjectStatus::Active)
                        .resetting()
                        .stamped(Utc::now()),
                )
            })
            .await?;

        self.metrics.activations_total.inc();
        info!(
            subject_id = %subject_id,
            cycle = updated.cycle,
            attestors = updated.total_count(),
            "Subject activated"
        );

        let invites = updated
            .panel
            .iter()
            .map(|a| AttestorInvite {
                attestor_id: a.id,
                user_id: a.user_id,
                link: self.links.link(updated.id, a.id, updated.cycle),
            })
            .collect();
        let _ = self
            .events
            .publish(QuorumEvent::Activated {
                subject: SubjectSummary::from(&updated),
                invites,
            })
            .await;

        Ok(updated)
    }

    /// Record one attestor's confirmation and evaluate the quorum
    #[instrument(skip(self))]
    pub async fn confirm(
        &self,
        subject_id: SubjectId,
        attestor_id: AttestorId,
        caller: UserId,
    ) -> Result<QuorumOutcome> {
        self.confirm_in_cycle(subject_id, attestor_id, caller, None)
            .await
    }

    /// `confirm` reached through an emailed link; the token must match the current cycle
    #[instrument(skip(self, token))]
    pub async fn confirm_link(
        &self,
        subject_id: SubjectId,
        attestor_id: AttestorId,
        caller: UserId,
        token: &str,
    ) -> Result<QuorumOutcome> {
        let record = self.load(subject_id).await?;
        if !self.links.verify(subject_id, attestor_id, record.cycle, token) {
            return Err(QuorumError::InvalidLink.into());
        }
        self.confirm_in_cycle(subject_id, attestor_id, caller, Some(record.cycle))
            .await
    }

    async fn confirm_in_cycle(
        &self,
        subject_id: SubjectId,
        attestor_id: AttestorId,
        caller: UserId,
        cycle: Option<u64>,
    ) -> Result<QuorumOutcome> {
        for attempt in 1..=self.attempts() {
            let record = self.load(subject_id).await?;
            // The link was signed for a cycle that has since been reset
            if cycle.is_some_and(|c| c != record.cycle) {
                return Err(QuorumError::InvalidLink.into());
            }

            if record.owner_id == caller {
                return Err(QuorumError::Forbidden(format!(
                    "owners cannot attest to their own {}",
                    record.kind()
                ))
                .into());
            }
            let attestor = record
                .attestor(attestor_id)
                .ok_or(QuorumError::AttestorNotFound {
                    subject_id,
                    attestor_id,
                })?;
            if attestor.user_id != caller {
                return Err(QuorumError::Unauthorized { user_id: caller }.into());
            }

            // A repeat click stays a no-op, even once the quorum completed
            let this_cycle = matches!(record.status, SubjectStatus::Active)
                || record.status == record.kind().completion_status();
            if attestor.has_confirmed && this_cycle {
                self.metrics.duplicate_confirmations_total.inc();
                debug!(subject_id = %subject_id, attestor_id = %attestor_id, "Already confirmed");
                return Ok(QuorumOutcome::AlreadyConfirmed);
            }
            if record.status != SubjectStatus::Active {
                return Err(invalid_state(&record, "confirm"));
            }

            match self
                .store
                .commit_confirmation(subject_id, attestor_id, record.version, Utc::now())
                .await
            {
                Ok(commit) => return Ok(self.on_commit(attestor_id, commit).await),
                Err(StoreError::VersionConflict { expected, found }) => {
                    self.note_conflict(subject_id, attempt, expected, found)
                }
                Err(err) => return Err(map_store(err, subject_id, "confirm")),
            }
        }
        Err(self.conflict(subject_id))
    }

    async fn on_commit(&self, attestor_id: AttestorId, commit: ConfirmationCommit) -> QuorumOutcome {
        let subject_id = commit.record.id;

        if commit.already_confirmed {
            self.metrics.duplicate_confirmations_total.inc();
            return QuorumOutcome::AlreadyConfirmed;
        }
        self.metrics.confirmations_total.inc();

        if !commit.completed {
            info!(
                subject_id = %subject_id,
                attestor_id = %attestor_id,
                confirmed = commit.confirmed_count,
                total = commit.total_count,
                "Confirmation recorded"
            );
            return QuorumOutcome::PartialQuorum {
                confirmed_count: commit.confirmed_count,
                total_count: commit.total_count,
            };
        }

        self.metrics.completions_total.inc();
        info!(
            subject_id = %subject_id,
            attestor_id = %attestor_id,
            status = %commit.record.status,
            "Quorum complete"
        );
        // The dispatcher mirrors a validated will on-chain; hold off owner retries
        let mirrored = commit.record.kind() == SubjectKind::Will;
        if mirrored {
            self.mirrors.claim(subject_id);
        }
        let published = self
            .events
            .publish(QuorumEvent::Completed {
                subject: SubjectSummary::from(&commit.record),
                total_count: commit.total_count,
            })
            .await;
        if mirrored && published.is_err() {
            self.mirrors.release(subject_id);
        }

        QuorumOutcome::QuorumComplete {
            status: commit.record.status,
            total_count: commit.total_count,
        }
    }

    /// Abandon an active safeguard without a full quorum
    ///
    /// Recorded confirmations are kept; the next `activate` clears them.
    #[instrument(skip(self))]
    pub async fn decline(&self, subject_id: SubjectId, caller: UserId) -> Result<SubjectRecord> {
        let updated = self
            .transition(subject_id, "decline", |record| {
                require_kind(record, SubjectKind::RecoveryConfig, "declined")?;
                if record.owner_id != caller && !record.is_panel_member(caller) {
                    return Err(QuorumError::Unauthorized { user_id: caller }.into());
                }
                if record.status != SubjectStatus::Active {
                    return Err(invalid_state(record, "decline"));
                }
                Ok(StatusChange::new(
                    SubjectStatus::Active,
                    SubjectStatus::Inactive,
                ))
            })
            .await?;

        info!(
            subject_id = %subject_id,
            by = %caller,
            confirmed = updated.confirmed_count(),
            "Safeguard declined"
        );
        Ok(updated)
    }

    /// Withdraw an active will, clearing every confirmation
    #[instrument(skip(self))]
    pub async fn cancel_activation(
        &self,
        subject_id: SubjectId,
        caller: UserId,
    ) -> Result<SubjectRecord> {
        let updated = self
            .transition(subject_id, "cancel", |record| {
                require_kind(record, SubjectKind::Will, "cancelled")?;
                require_owner(record, caller)?;
                if record.status != SubjectStatus::Active {
                    return Err(invalid_state(record, "cancel"));
                }
                Ok(StatusChange::new(SubjectStatus::Active, SubjectStatus::Inactive).resetting())
            })
            .await?;

        info!(subject_id = %subject_id, cycle = updated.cycle, "Will activation cancelled");
        Ok(updated)
    }

    /// Hand the sealed secret of a verified safeguard back to its owner, once
    #[instrument(skip(self))]
    pub async fn release_secret(&self, subject_id: SubjectId, caller: UserId) -> Result<SealedSecret> {
        for attempt in 1..=self.attempts() {
            let record = self.load(subject_id).await?;
            require_kind(&record, SubjectKind::RecoveryConfig, "released")?;
            require_owner(&record, caller)?;
            if record.status != SubjectStatus::Verified {
                return Err(invalid_state(&record, "release the secret of"));
            }

            match self.store.take_secret(subject_id, record.version).await {
                Ok(secret) => {
                    self.metrics.secrets_released_total.inc();
                    info!(
                        subject_id = %subject_id,
                        fingerprint = %secret.fingerprint(),
                        "Secret released, safeguard reset"
                    );
                    return Ok(secret);
                }
                Err(StoreError::VersionConflict { expected, found }) => {
                    self.note_conflict(subject_id, attempt, expected, found)
                }
                Err(err) => return Err(map_store(err, subject_id, "release the secret of")),
            }
        }
        Err(self.conflict(subject_id))
    }

    /// Ask the dispatcher to mirror a validated will on-chain again
    ///
    /// Refused while an earlier ledger call for the same will is pending.
    #[instrument(skip(self))]
    pub async fn execute_will(&self, subject_id: SubjectId, caller: UserId) -> Result<SubjectRecord> {
        let record = self.load(subject_id).await?;
        require_kind(&record, SubjectKind::Will, "executed")?;
        require_owner(&record, caller)?;
        if record.status != SubjectStatus::Validated {
            return Err(invalid_state(&record, "execute"));
        }
        if !self.mirrors.claim(subject_id) {
            debug!(subject_id = %subject_id, "Ledger call already pending");
            return Err(invalid_state(&record, "execute"));
        }

        info!(subject_id = %subject_id, "Ledger execution requested");
        let published = self
            .events
            .publish(QuorumEvent::ExecutionRequested {
                subject: SubjectSummary::from(&record),
            })
            .await;
        if let Err(e) = published {
            self.mirrors.release(subject_id);
            return Err(e.into());
        }
        Ok(record)
    }

    /// Secret-free view of a subject and its panel
    pub async fn view(&self, subject_id: SubjectId) -> Result<SubjectView> {
        let record = self.load(subject_id).await?;
        let attestors = self
            .store
            .attestor_profiles(subject_id)
            .await
            .map_err(|e| map_store(e, subject_id, "view"))?;
        Ok(SubjectView::new(&record, attestors))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryRecordStore, MockRecordStore};
    use geniesafe_common::PanelError;
    use rust_decimal_macros::dec;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    struct Harness {
        engine: AttestationQuorum,
        store: Arc<InMemoryRecordStore>,
        events: mpsc::Receiver<QuorumEvent>,
        owner: UserId,
        panel_users: Vec<UserId>,
    }

    impl Harness {
        fn new() -> Self {
            let store = Arc::new(InMemoryRecordStore::new());
            let (publisher, events) = EventPublisher::channel(64);
            let engine = AttestationQuorum::new(
                QuorumConfig::default(),
                store.clone(),
                LinkSigner::new("https://geniesafe.app", [5u8; 32]),
            )
            .with_events(publisher);

            Self {
                engine,
                store,
                events,
                owner: Uuid::new_v4(),
                panel_users: (0..3).map(|_| Uuid::new_v4()).collect(),
            }
        }

        async fn safeguard(&self) -> SubjectRecord {
            self.engine
                .create_safeguard(
                    self.owner,
                    SealedSecret::new(b"sealed-mnemonic".to_vec()),
                    &self.panel_users,
                )
                .await
                .unwrap()
        }

        async fn will(&self, validators: usize) -> SubjectRecord {
            self.engine
                .create_will(
                    self.owner,
                    vec![Beneficiary::new(Uuid::new_v4(), dec!(100))],
                    &self.panel_users[..validators],
                )
                .await
                .unwrap()
        }

        fn drain(&mut self) -> Vec<QuorumEvent> {
            let mut out = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                out.push(event);
            }
            out
        }

        fn completions(&mut self) -> usize {
            self.drain()
                .iter()
                .filter(|e| matches!(e, QuorumEvent::Completed { .. }))
                .count()
        }
    }

    #[tokio::test]
    async fn test_safeguard_three_verifiers() {
        let mut h = Harness::new();
        let record = h.safeguard().await;
        h.engine.activate(record.id, h.owner).await.unwrap();

        let outcomes = {
            let mut out = Vec::new();
            for a in &record.panel {
                out.push(h.engine.confirm(record.id, a.id, a.user_id).await.unwrap());
            }
            out
        };

        assert_eq!(
            outcomes[0],
            QuorumOutcome::PartialQuorum {
                confirmed_count: 1,
                total_count: 3
            }
        );
        assert_eq!(
            outcomes[1],
            QuorumOutcome::PartialQuorum {
                confirmed_count: 2,
                total_count: 3
            }
        );
        assert_eq!(
            outcomes[2],
            QuorumOutcome::QuorumComplete {
                status: SubjectStatus::Verified,
                total_count: 3
            }
        );

        let stored = h.store.get_subject(record.id).await.unwrap();
        assert_eq!(stored.status, SubjectStatus::Verified);
        assert_eq!(h.completions(), 1);
        assert_eq!(h.engine.metrics().completions_total.get(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_confirmation() {
        let h = Harness::new();
        let record = h.safeguard().await;
        h.engine.activate(record.id, h.owner).await.unwrap();
        let a = &record.panel[0];

        h.engine.confirm(record.id, a.id, a.user_id).await.unwrap();
        let again = h.engine.confirm(record.id, a.id, a.user_id).await.unwrap();

        assert_eq!(again, QuorumOutcome::AlreadyConfirmed);
        assert_eq!(h.store.count_confirmed(record.id).await.unwrap(), 1);
        assert_eq!(h.engine.metrics().duplicate_confirmations_total.get(), 1);
    }

    #[tokio::test]
    async fn test_repeat_after_completion_is_noop() {
        let mut h = Harness::new();
        let record = h.will(1).await;
        h.engine.activate(record.id, h.owner).await.unwrap();
        let a = &record.panel[0];

        let first = h.engine.confirm(record.id, a.id, a.user_id).await.unwrap();
        let again = h.engine.confirm(record.id, a.id, a.user_id).await.unwrap();

        assert!(first.is_complete());
        assert_eq!(again, QuorumOutcome::AlreadyConfirmed);
        assert_eq!(h.completions(), 1);
    }

    #[tokio::test]
    async fn test_activation_invites_every_attestor() {
        let mut h = Harness::new();
        let record = h.safeguard().await;
        let active = h.engine.activate(record.id, h.owner).await.unwrap();

        assert_eq!(active.status, SubjectStatus::Active);
        assert_eq!(active.cycle, 1);
        assert!(active.activated_at.is_some());

        let events = h.drain();
        assert_eq!(events.len(), 1);
        match &events[0] {
            QuorumEvent::Activated { invites, .. } => {
                assert_eq!(invites.len(), 3);
                for invite in invites {
                    assert!(h.engine.links().verify(
                        record.id,
                        invite.attestor_id,
                        1,
                        &invite.link.token
                    ));
                }
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_activate_twice_is_invalid_and_changes_nothing() {
        let h = Harness::new();
        let record = h.safeguard().await;
        h.engine.activate(record.id, h.owner).await.unwrap();
        let a = &record.panel[0];
        h.engine.confirm(record.id, a.id, a.user_id).await.unwrap();
        let before = h.store.get_subject(record.id).await.unwrap();

        let err = h.engine.activate(record.id, h.owner).await.unwrap_err();

        assert!(matches!(
            err,
            GenieError::Quorum(QuorumError::InvalidState {
                status: SubjectStatus::Active,
                ..
            })
        ));
        let after = h.store.get_subject(record.id).await.unwrap();
        assert_eq!(after.version, before.version);
        assert_eq!(after.cycle, before.cycle);
        assert_eq!(after.confirmed_count(), 1);
    }

    #[tokio::test]
    async fn test_activate_empty_panel() {
        let h = Harness::new();
        let record = h.will(1).await;
        h.engine
            .remove_attestor(record.id, h.owner, record.panel[0].id)
            .await
            .unwrap();

        let err = h.engine.activate(record.id, h.owner).await.unwrap_err();
        assert!(matches!(err, GenieError::Quorum(QuorumError::EmptyPanel(_))));
    }

    #[tokio::test]
    async fn test_activate_short_safeguard_panel() {
        let h = Harness::new();
        let record = h.safeguard().await;
        h.engine
            .remove_attestor(record.id, h.owner, record.panel[2].id)
            .await
            .unwrap();

        let err = h.engine.activate(record.id, h.owner).await.unwrap_err();
        assert!(matches!(
            err,
            GenieError::Panel(PanelError::WrongSize {
                expected: 3,
                actual: 2
            })
        ));
    }

    #[tokio::test]
    async fn test_only_owner_activates() {
        let h = Harness::new();
        let record = h.safeguard().await;
        let stranger = Uuid::new_v4();

        let err = h.engine.activate(record.id, stranger).await.unwrap_err();
        assert!(matches!(
            err,
            GenieError::Quorum(QuorumError::Unauthorized { user_id }) if user_id == stranger
        ));
    }

    #[tokio::test]
    async fn test_confirm_requires_active() {
        let h = Harness::new();
        let record = h.safeguard().await;
        let a = &record.panel[0];

        let err = h.engine.confirm(record.id, a.id, a.user_id).await.unwrap_err();
        assert!(matches!(
            err,
            GenieError::Quorum(QuorumError::InvalidState {
                status: SubjectStatus::Inactive,
                operation: "confirm",
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_confirm_identity_checks() {
        let h = Harness::new();
        let record = h.safeguard().await;
        h.engine.activate(record.id, h.owner).await.unwrap();
        let (a, b) = (&record.panel[0], &record.panel[1]);

        // B may not confirm on A's behalf
        let err = h.engine.confirm(record.id, a.id, b.user_id).await.unwrap_err();
        assert!(matches!(err, GenieError::Quorum(QuorumError::Unauthorized { .. })));

        let err = h.engine.confirm(record.id, a.id, h.owner).await.unwrap_err();
        assert!(matches!(err, GenieError::Quorum(QuorumError::Forbidden(_))));

        let err = h
            .engine
            .confirm(record.id, Uuid::new_v4(), a.user_id)
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        let err = h
            .engine
            .confirm(Uuid::new_v4(), a.id, a.user_id)
            .await
            .unwrap_err();
        assert!(matches!(err, GenieError::Quorum(QuorumError::SubjectNotFound(_))));

        assert_eq!(h.store.count_confirmed(record.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_confirm_link() {
        let h = Harness::new();
        let record = h.safeguard().await;
        let active = h.engine.activate(record.id, h.owner).await.unwrap();
        let a = &record.panel[0];
        let token = h.engine.links().token(record.id, a.id, active.cycle);
        let stale = h.engine.links().token(record.id, a.id, active.cycle - 1);

        let err = h
            .engine
            .confirm_link(record.id, a.id, a.user_id, &stale)
            .await
            .unwrap_err();
        assert!(matches!(err, GenieError::Quorum(QuorumError::InvalidLink)));

        let outcome = h
            .engine
            .confirm_link(record.id, a.id, a.user_id, &token)
            .await
            .unwrap();
        assert_eq!(outcome.remaining(), 2);
    }

    #[tokio::test]
    async fn test_release_secret_once() {
        let h = Harness::new();
        let record = h.safeguard().await;
        h.engine.activate(record.id, h.owner).await.unwrap();
        for a in &record.panel {
            h.engine.confirm(record.id, a.id, a.user_id).await.unwrap();
        }

        let err = h
            .engine
            .release_secret(record.id, record.panel[0].user_id)
            .await
            .unwrap_err();
        assert!(matches!(err, GenieError::Quorum(QuorumError::Unauthorized { .. })));

        let secret = h.engine.release_secret(record.id, h.owner).await.unwrap();
        assert_eq!(secret.as_bytes(), b"sealed-mnemonic");

        let err = h.engine.release_secret(record.id, h.owner).await.unwrap_err();
        assert!(matches!(
            err,
            GenieError::Quorum(QuorumError::InvalidState {
                status: SubjectStatus::Inactive,
                ..
            })
        ));

        let after = h.store.get_subject(record.id).await.unwrap();
        assert_eq!(after.status, SubjectStatus::Inactive);
        assert!(after.panel.iter().all(|a| !a.has_confirmed));
        assert_eq!(h.engine.metrics().secrets_released_total.get(), 1);
    }

    #[tokio::test]
    async fn test_safeguard_reusable_after_release() {
        let mut h = Harness::new();
        let record = h.safeguard().await;
        for _ in 0..2 {
            h.engine.activate(record.id, h.owner).await.unwrap();
            for a in &record.panel {
                h.engine.confirm(record.id, a.id, a.user_id).await.unwrap();
            }
            h.engine.release_secret(record.id, h.owner).await.unwrap();
        }
        assert_eq!(h.completions(), 2);
    }

    #[tokio::test]
    async fn test_decline_keeps_confirmations() {
        let h = Harness::new();
        let record = h.safeguard().await;
        h.engine.activate(record.id, h.owner).await.unwrap();
        let a = &record.panel[0];
        h.engine.confirm(record.id, a.id, a.user_id).await.unwrap();

        let err = h
            .engine
            .decline(record.id, Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, GenieError::Quorum(QuorumError::Unauthorized { .. })));

        let declined = h
            .engine
            .decline(record.id, record.panel[1].user_id)
            .await
            .unwrap();
        assert_eq!(declined.status, SubjectStatus::Inactive);
        assert_eq!(declined.confirmed_count(), 1);

        // Re-activation starts clean
        let reactivated = h.engine.activate(record.id, h.owner).await.unwrap();
        assert_eq!(reactivated.confirmed_count(), 0);
        assert_eq!(reactivated.cycle, 2);
    }

    #[tokio::test]
    async fn test_will_has_no_decline() {
        let h = Harness::new();
        let record = h.will(2).await;
        h.engine.activate(record.id, h.owner).await.unwrap();

        let err = h.engine.decline(record.id, h.owner).await.unwrap_err();
        assert!(matches!(err, GenieError::Quorum(QuorumError::Forbidden(_))));
    }

    #[tokio::test]
    async fn test_cancel_will_activation_resets_cycle() {
        let h = Harness::new();
        let record = h.will(2).await;
        h.engine.activate(record.id, h.owner).await.unwrap();
        let a = &record.panel[0];
        h.engine.confirm(record.id, a.id, a.user_id).await.unwrap();

        let cancelled = h.engine.cancel_activation(record.id, h.owner).await.unwrap();

        assert_eq!(cancelled.status, SubjectStatus::Inactive);
        assert_eq!(cancelled.confirmed_count(), 0);
        assert_eq!(cancelled.cycle, 2);
    }

    #[tokio::test]
    async fn test_execute_will_requires_validated() {
        let mut h = Harness::new();
        let record = h.will(1).await;
        h.engine.activate(record.id, h.owner).await.unwrap();

        let err = h.engine.execute_will(record.id, h.owner).await.unwrap_err();
        assert!(matches!(err, GenieError::Quorum(QuorumError::InvalidState { .. })));

        let a = &record.panel[0];
        h.engine.confirm(record.id, a.id, a.user_id).await.unwrap();
        h.drain();

        // The completion mirror is still queued
        let mirrors = h.engine.pending_mirrors().clone();
        assert!(mirrors.is_pending(record.id));
        let err = h.engine.execute_will(record.id, h.owner).await.unwrap_err();
        assert!(matches!(
            err,
            GenieError::Quorum(QuorumError::InvalidState {
                status: SubjectStatus::Validated,
                ..
            })
        ));

        // Once the dispatcher let go, one retry goes through
        mirrors.release(record.id);
        h.engine.execute_will(record.id, h.owner).await.unwrap();
        assert!(h.engine.execute_will(record.id, h.owner).await.is_err());
        let events = h.drain();
        assert!(matches!(
            events.as_slice(),
            [QuorumEvent::ExecutionRequested { .. }]
        ));
    }

    #[tokio::test]
    async fn test_execute_without_dispatcher_fails_and_frees_the_will() {
        let h = Harness::new();
        let record = h.will(1).await;
        let engine = AttestationQuorum::new(
            QuorumConfig::default(),
            h.store.clone(),
            LinkSigner::random("http://localhost"),
        );
        engine.activate(record.id, h.owner).await.unwrap();
        let a = &record.panel[0];
        engine.confirm(record.id, a.id, a.user_id).await.unwrap();
        assert!(!engine.pending_mirrors().is_pending(record.id));

        let err = engine.execute_will(record.id, h.owner).await.unwrap_err();
        assert!(matches!(
            err,
            GenieError::Dispatch(geniesafe_common::DispatchError::ChannelClosed)
        ));
        assert!(!engine.pending_mirrors().is_pending(record.id));
    }

    #[tokio::test]
    async fn test_link_from_reset_cycle_is_rejected() {
        let owner = Uuid::new_v4();
        let validator = Uuid::new_v4();
        let mut record = SubjectRecord::new(
            owner,
            SubjectPayload::Will {
                beneficiaries: vec![Beneficiary::new(Uuid::new_v4(), dec!(100))],
            },
        );
        record.panel.push(Attestor::new(record.id, validator));
        record.status = SubjectStatus::Active;
        record.cycle = 1;
        let (subject_id, attestor_id) = (record.id, record.panel[0].id);

        // Cancelled and re-activated between the token check and the confirm
        let mut reactivated = record.clone();
        reactivated.cycle = 2;
        reactivated.version = record.version + 2;

        let links = LinkSigner::new("https://geniesafe.app", [5u8; 32]);
        let token = links.token(subject_id, attestor_id, 1);

        let mut store = MockRecordStore::new();
        let mut reads = vec![reactivated, record];
        store
            .expect_get_subject()
            .times(2)
            .returning(move |_| Ok(reads.pop().unwrap()));
        store.expect_commit_confirmation().never();

        let engine = AttestationQuorum::new(QuorumConfig::default(), Arc::new(store), links);
        let err = engine
            .confirm_link(subject_id, attestor_id, validator, &token)
            .await
            .unwrap_err();

        assert!(matches!(err, GenieError::Quorum(QuorumError::InvalidLink)));
    }

    #[tokio::test]
    async fn test_create_rejects_bad_input() {
        let h = Harness::new();

        let err = h
            .engine
            .create_will(
                h.owner,
                vec![Beneficiary::new(Uuid::new_v4(), dec!(60))],
                &h.panel_users[..1],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, GenieError::Allocation(_)));

        let err = h
            .engine
            .create_safeguard(
                h.owner,
                SealedSecret::new(vec![1]),
                &[h.panel_users[0], h.panel_users[1], h.owner],
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            GenieError::Panel(PanelError::SelfAttestation(_))
        ));
    }

    #[tokio::test]
    async fn test_panel_edits() {
        let h = Harness::new();
        let record = h.will(2).await;

        let grown = h
            .engine
            .add_attestor(record.id, h.owner, h.panel_users[2])
            .await
            .unwrap();
        assert_eq!(grown.total_count(), 3);

        let err = h
            .engine
            .add_attestor(record.id, h.owner, Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, GenieError::Panel(PanelError::OutOfBounds { .. })));

        let err = h
            .engine
            .add_attestor(record.id, h.owner, h.panel_users[0])
            .await
            .unwrap_err();
        assert!(matches!(err, GenieError::Panel(PanelError::DuplicateAttestor(_))));

        h.engine.activate(record.id, h.owner).await.unwrap();
        let err = h
            .engine
            .remove_attestor(record.id, h.owner, record.panel[0].id)
            .await
            .unwrap_err();
        assert!(matches!(err, GenieError::Quorum(QuorumError::InvalidState { .. })));
    }

    #[tokio::test]
    async fn test_view_joins_profiles() {
        let h = Harness::new();
        let record = h.will(2).await;
        h.store
            .upsert_user(geniesafe_common::UserProfile::new(
                h.panel_users[0],
                "val@example.com",
                "Val",
            ))
            .await
            .unwrap();

        let view = h.engine.view(record.id).await.unwrap();
        assert_eq!(view.total_count, 2);
        assert_eq!(view.attestors[0].profile.as_ref().unwrap().display_name, "Val");
        assert_eq!(view.beneficiaries.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_conflict_surfaces_after_bounded_retries() {
        let owner = Uuid::new_v4();
        let verifier = Uuid::new_v4();
        let mut record = SubjectRecord::new(
            owner,
            SubjectPayload::RecoveryConfig {
                secret: SealedSecret::new(vec![1]),
            },
        );
        record.panel.push(Attestor::new(record.id, verifier));
        record.status = SubjectStatus::Active;
        let (subject_id, attestor_id) = (record.id, record.panel[0].id);

        let mut store = MockRecordStore::new();
        store
            .expect_get_subject()
            .times(3)
            .returning(move |_| Ok(record.clone()));
        store
            .expect_commit_confirmation()
            .times(3)
            .returning(|_, _, expected, _| {
                Err(StoreError::VersionConflict {
                    expected,
                    found: expected + 1,
                })
            });

        let engine = AttestationQuorum::new(
            QuorumConfig::default(),
            Arc::new(store),
            LinkSigner::random("http://localhost"),
        );
        let err = engine
            .confirm(subject_id, attestor_id, verifier)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            GenieError::Quorum(QuorumError::Conflict { attempts: 3, .. })
        ));
        assert_eq!(engine.metrics().version_conflicts_total.get(), 3);
    }
}

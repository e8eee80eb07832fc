//! Completion dispatcher
//!
//! Turns committed [`QuorumEvent`]s into emails and ledger calls:
//! 1. Activated: one invite per attestor, carrying its confirmation link
//! 2. Completed: exactly one notice to the owner; wills are mirrored on-chain
//! 3. ExecutionRequested: the ledger mirror alone
//!
//! A ledger receipt moves the will from VALIDATED to EXECUTED. Failures are
//! logged and kept in the subject's latest [`DispatchReport`].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use geniesafe_common::{DispatchError, SubjectId, SubjectKind, SubjectStatus, UserId};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use super::ledger::{LedgerClient, TxReceipt};
use super::notifier::{templates, Notifier};
use super::{AttestorInvite, PendingMirrors, QuorumEvent, SubjectSummary};
use crate::metrics::QuorumMetrics;
use crate::store::RecordStore;

/// What happened while handling one event
#[derive(Debug, Clone, Serialize)]
pub struct DispatchReport {
    pub subject_id: SubjectId,
    pub event: &'static str,
    /// Emails accepted by the notifier
    pub delivered: usize,
    pub warnings: Vec<String>,
    pub receipt: Option<TxReceipt>,
    pub handled_at: DateTime<Utc>,
}

impl DispatchReport {
    fn new(event: &QuorumEvent) -> Self {
        Self {
            subject_id: event.subject().id,
            event: event.name(),
            delivered: 0,
            warnings: Vec::new(),
            receipt: None,
            handled_at: Utc::now(),
        }
    }

    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }
}

/// Reacts to quorum events with notifications and ledger calls
pub struct CompletionDispatcher {
    store: Arc<dyn RecordStore>,
    notifier: Arc<dyn Notifier>,
    ledger: Arc<dyn LedgerClient>,
    metrics: Arc<QuorumMetrics>,
    mirrors: PendingMirrors,
    /// Latest report per subject
    reports: DashMap<SubjectId, DispatchReport>,
}

impl CompletionDispatcher {
    pub fn new(
        store: Arc<dyn RecordStore>,
        notifier: Arc<dyn Notifier>,
        ledger: Arc<dyn LedgerClient>,
    ) -> Self {
        Self {
            store,
            notifier,
            ledger,
            metrics: Arc::new(QuorumMetrics::new()),
            mirrors: PendingMirrors::new(),
            reports: DashMap::new(),
        }
    }

    /// Wills whose ledger call is queued or running; share with the engine
    pub fn pending_mirrors(&self) -> PendingMirrors {
        self.mirrors.clone()
    }

    /// Share metrics with the engine
    pub fn with_metrics(mut self, metrics: Arc<QuorumMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Latest report for a subject
    pub fn last_report(&self, subject_id: SubjectId) -> Option<DispatchReport> {
        self.reports.get(&subject_id).map(|r| r.clone())
    }

    /// Handle one event; never fails, problems end up in the report
    #[instrument(skip(self, event), fields(subject_id = %event.subject().id, event = event.name()))]
    pub async fn handle(&self, event: QuorumEvent) -> DispatchReport {
        let mut report = DispatchReport::new(&event);

        match &event {
            QuorumEvent::Activated { subject, invites } => {
                self.invite_attestors(subject, invites, &mut report).await;
            }
            QuorumEvent::Completed {
                subject,
                total_count,
            } => {
                self.notify_owner(subject, *total_count, &mut report).await;
                if subject.kind == SubjectKind::Will {
                    self.mirror_to_ledger(subject, &mut report).await;
                }
            }
            QuorumEvent::ExecutionRequested { subject } => {
                self.mirror_to_ledger(subject, &mut report).await;
            }
        }

        if !report.is_clean() {
            warn!(warnings = report.warnings.len(), "Dispatch finished with warnings");
        }
        self.reports.insert(report.subject_id, report.clone());
        report
    }

    async fn display_name(&self, user_id: UserId) -> String {
        self.store
            .get_user(user_id)
            .await
            .map(|p| p.display_name)
            .unwrap_or_else(|_| "A Geniesafe user".to_string())
    }

    async fn email(&self, to: &str, subject: &str, body: &str, report: &mut DispatchReport) {
        match self.notifier.send(to, subject, body).await {
            Ok(()) => report.delivered += 1,
            Err(e) => {
                self.metrics.dispatch_failures_total.inc();
                warn!(to = %to, error = %e, "Notification failed");
                report.warnings.push(e.to_string());
            }
        }
    }

    fn render_failed(&self, err: DispatchError, report: &mut DispatchReport) {
        self.metrics.dispatch_failures_total.inc();
        warn!(error = %err, "Email rendering failed");
        report.warnings.push(err.to_string());
    }

    async fn invite_attestors(
        &self,
        subject: &SubjectSummary,
        invites: &[AttestorInvite],
        report: &mut DispatchReport,
    ) {
        let owner_name = self.display_name(subject.owner_id).await;

        for invite in invites {
            let profile = match self.store.get_user(invite.user_id).await {
                Ok(profile) => profile,
                Err(e) => {
                    warn!(attestor_id = %invite.attestor_id, error = %e, "No contact for attestor");
                    report
                        .warnings
                        .push(format!("attestor {} has no profile: {}", invite.attestor_id, e));
                    continue;
                }
            };

            match templates::activation_invite(
                subject.kind,
                &owner_name,
                &profile.display_name,
                &invite.link,
            ) {
                Ok((title, body)) => self.email(&profile.email, &title, &body, report).await,
                Err(e) => self.render_failed(e, report),
            }
        }

        debug!(delivered = report.delivered, invited = invites.len(), "Attestors invited");
    }

    async fn notify_owner(
        &self,
        subject: &SubjectSummary,
        total_count: usize,
        report: &mut DispatchReport,
    ) {
        let owner = match self.store.get_user(subject.owner_id).await {
            Ok(owner) => owner,
            Err(e) => {
                warn!(owner_id = %subject.owner_id, error = %e, "No contact for owner");
                report.warnings.push(format!("owner has no profile: {}", e));
                return;
            }
        };

        match templates::completion_notice(subject.kind, &owner.display_name, total_count) {
            Ok((title, body)) => self.email(&owner.email, &title, &body, report).await,
            Err(e) => self.render_failed(e, report),
        }
    }

    async fn mirror_to_ledger(&self, subject: &SubjectSummary, report: &mut DispatchReport) {
        // Claimed by the publisher when it went through the engine
        self.mirrors.claim(subject.id);
        self.execute_validated(subject.id, report).await;
        self.mirrors.release(subject.id);
    }

    async fn execute_validated(&self, subject_id: SubjectId, report: &mut DispatchReport) {
        match self.store.get_subject(subject_id).await {
            Ok(record) if record.status == SubjectStatus::Validated => {}
            Ok(record) => {
                debug!(status = %record.status, "Will no longer VALIDATED, ledger call skipped");
                return;
            }
            Err(e) => {
                warn!(error = %e, "Will could not be read, ledger call skipped");
                report.warnings.push(e.to_string());
                return;
            }
        }

        let receipt = match self.ledger.record_validation_and_execution(subject_id).await {
            Ok(receipt) => receipt,
            Err(e) => {
                self.metrics.dispatch_failures_total.inc();
                warn!(error = %e, "Ledger mirror failed, will stays VALIDATED");
                report.warnings.push(e.to_string());
                return;
            }
        };

        match self
            .store
            .update_subject_status(subject_id, SubjectStatus::Validated, SubjectStatus::Executed)
            .await
        {
            Ok(_) => info!(tx_hash = %receipt.tx_hash, "Will executed"),
            Err(e) => {
                warn!(error = %e, "Ledger receipt received but status not updated");
                report.warnings.push(e.to_string());
            }
        }
        report.receipt = Some(receipt);
    }
}

/// Drains the event channel on a background task
pub struct DispatchWorker;

impl DispatchWorker {
    /// Run until every publisher is dropped or `shutdown` fires
    ///
    /// On shutdown the channel is closed and events already queued are still
    /// handled.
    pub fn spawn(
        dispatcher: Arc<CompletionDispatcher>,
        mut events: mpsc::Receiver<QuorumEvent>,
        mut shutdown: oneshot::Receiver<()>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Some(event) => {
                            dispatcher.handle(event).await;
                        }
                        None => break,
                    },
                    _ = &mut shutdown => {
                        events.close();
                        while let Some(event) = events.recv().await {
                            dispatcher.handle(event).await;
                        }
                        break;
                    }
                }
            }
            info!("Dispatch worker stopped");
        })
    }
}

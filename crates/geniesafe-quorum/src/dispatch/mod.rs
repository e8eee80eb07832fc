//! Side-effect dispatch
//!
//! The engine never sends email or calls the ledger itself. After a state
//! change commits it publishes a [`QuorumEvent`]; the
//! [`CompletionDispatcher`], usually driven by a [`DispatchWorker`], reacts
//! to it. A slow or failing collaborator therefore cannot block or undo an
//! attestation.

pub mod dispatcher;
pub mod ledger;
pub mod link;
pub mod notifier;

pub use dispatcher::{CompletionDispatcher, DispatchReport, DispatchWorker};
pub use ledger::{DryRunLedger, LedgerClient, OfflineLedger, TxReceipt};
pub use link::{ConfirmationLink, LinkSigner};
pub use notifier::{LogNotifier, Notifier, OutboxNotifier, SentEmail};

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use geniesafe_common::{
    AttestorId, DispatchError, SubjectId, SubjectKind, SubjectRecord, SubjectStatus, UserId,
};
use tokio::sync::mpsc;
use tracing::warn;

/// Identity of the subject an event is about
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectSummary {
    pub id: SubjectId,
    pub kind: SubjectKind,
    pub owner_id: UserId,
    pub status: SubjectStatus,
    pub cycle: u64,
}

impl From<&SubjectRecord> for SubjectSummary {
    fn from(record: &SubjectRecord) -> Self {
        Self {
            id: record.id,
            kind: record.kind(),
            owner_id: record.owner_id,
            status: record.status,
            cycle: record.cycle,
        }
    }
}

/// Invitation for one attestor of a freshly activated subject
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttestorInvite {
    pub attestor_id: AttestorId,
    pub user_id: UserId,
    pub link: ConfirmationLink,
}

/// Committed state changes that carry side effects
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuorumEvent {
    /// Subject opened for confirmation; every attestor gets an invite
    Activated {
        subject: SubjectSummary,
        invites: Vec<AttestorInvite>,
    },
    /// Last attestor confirmed; owner is told once, wills go to the ledger
    Completed {
        subject: SubjectSummary,
        total_count: usize,
    },
    /// Owner asked to retry the ledger mirror of a validated will
    ExecutionRequested { subject: SubjectSummary },
}

impl QuorumEvent {
    pub fn subject(&self) -> &SubjectSummary {
        match self {
            QuorumEvent::Activated { subject, .. }
            | QuorumEvent::Completed { subject, .. }
            | QuorumEvent::ExecutionRequested { subject } => subject,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            QuorumEvent::Activated { .. } => "activated",
            QuorumEvent::Completed { .. } => "completed",
            QuorumEvent::ExecutionRequested { .. } => "execution_requested",
        }
    }
}

/// Sending half of the event channel held by the engine
#[derive(Debug, Clone, Default)]
pub struct EventPublisher {
    tx: Option<mpsc::Sender<QuorumEvent>>,
}

impl EventPublisher {
    /// Bounded channel of `buffer` events
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<QuorumEvent>) {
        let (tx, rx) = mpsc::channel(buffer);
        (Self { tx: Some(tx) }, rx)
    }

    /// Publisher that drops every event
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Publish after commit
    ///
    /// `ChannelClosed` means nobody will act on the event. The committed
    /// state change stands either way.
    pub async fn publish(&self, event: QuorumEvent) -> Result<(), DispatchError> {
        let Some(tx) = &self.tx else {
            return Err(DispatchError::ChannelClosed);
        };
        let subject_id = event.subject().id;
        let name = event.name();
        tx.send(event).await.map_err(|_| {
            warn!(subject_id = %subject_id, event = name, "Event channel closed, side effects skipped");
            DispatchError::ChannelClosed
        })
    }
}

/// Wills with a ledger call queued or running
///
/// Claimed by whoever publishes the event that leads to a ledger call and
/// released by the dispatcher once that call is over, so one will has at
/// most one ledger call in flight.
#[derive(Debug, Clone, Default)]
pub struct PendingMirrors {
    inner: Arc<DashMap<SubjectId, ()>>,
}

impl PendingMirrors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when a call for `subject_id` is already pending
    pub fn claim(&self, subject_id: SubjectId) -> bool {
        match self.inner.entry(subject_id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(());
                true
            }
        }
    }

    pub fn release(&self, subject_id: SubjectId) {
        self.inner.remove(&subject_id);
    }

    pub fn is_pending(&self, subject_id: SubjectId) -> bool {
        self.inner.contains_key(&subject_id)
    }
}

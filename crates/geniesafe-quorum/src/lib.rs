//! # Geniesafe Quorum
//!
//! Attestation engine behind Geniesafe wills and safeguards.
//!
//! ## Components
//!
//! - **Quorum**: panel rules and the confirm-once, complete-once state machine
//! - **Store**: record storage with version-guarded compound writes
//! - **Dispatch**: invitations, owner notices and ledger mirroring, off the request path
//! - **Metrics**: Prometheus counters for every state change
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      QuorumService                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────┐ │
//! │  │ Attestation │  │   Record    │  │     Completion      │ │
//! │  │   Quorum    │──│    Store    │  │     Dispatcher      │ │
//! │  │             │  │  (CAS ops)  │  │ (notifier, ledger)  │ │
//! │  └──────┬──────┘  └─────────────┘  └──────────▲──────────┘ │
//! │         │          QuorumEvent (mpsc)          │            │
//! │         └──────────────────────────────────────┘            │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod dispatch;
pub mod metrics;
pub mod quorum;
pub mod store;

pub use dispatch::{
    CompletionDispatcher, ConfirmationLink, DispatchReport, DispatchWorker, DryRunLedger,
    EventPublisher, LedgerClient, LinkSigner, LogNotifier, Notifier, OfflineLedger, OutboxNotifier,
    PendingMirrors, QuorumEvent, TxReceipt,
};
pub use metrics::QuorumMetrics;
pub use quorum::{AttestationQuorum, PanelRules, QuorumOutcome};
pub use store::{InMemoryRecordStore, RecordStore};

use std::sync::Arc;

use geniesafe_common::{MAX_CONFIRM_ATTEMPTS, MAX_WILL_VALIDATORS, SAFEGUARD_PANEL_SIZE};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Quorum engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuorumConfig {
    /// Conditional write attempts before a conflict is surfaced
    pub max_confirm_attempts: u32,
    /// Exact safeguard panel size
    pub safeguard_panel_size: usize,
    /// Upper bound on will validators
    pub max_will_validators: usize,
    /// Events buffered between engine and dispatcher
    pub event_buffer: usize,
}

impl Default for QuorumConfig {
    fn default() -> Self {
        Self {
            max_confirm_attempts: MAX_CONFIRM_ATTEMPTS,
            safeguard_panel_size: SAFEGUARD_PANEL_SIZE,
            max_will_validators: MAX_WILL_VALIDATORS,
            event_buffer: 256,
        }
    }
}

impl QuorumConfig {
    pub fn panel_rules(&self) -> PanelRules {
        PanelRules {
            safeguard_size: self.safeguard_panel_size,
            max_will_validators: self.max_will_validators,
        }
    }
}

/// Engine and dispatcher wired together over one event channel
pub struct QuorumService {
    engine: Arc<AttestationQuorum>,
    dispatcher: Arc<CompletionDispatcher>,
    metrics: Arc<QuorumMetrics>,
    shutdown: oneshot::Sender<()>,
    worker: JoinHandle<()>,
}

impl QuorumService {
    /// Start the dispatch worker and return the running service
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        config: QuorumConfig,
        store: Arc<dyn RecordStore>,
        notifier: Arc<dyn Notifier>,
        ledger: Arc<dyn LedgerClient>,
        links: LinkSigner,
    ) -> Self {
        let metrics = Arc::new(QuorumMetrics::new());
        let (publisher, events) = EventPublisher::channel(config.event_buffer.max(1));

        let dispatcher = Arc::new(
            CompletionDispatcher::new(store.clone(), notifier, ledger)
                .with_metrics(metrics.clone()),
        );
        let (shutdown, stop) = oneshot::channel();
        let worker = DispatchWorker::spawn(dispatcher.clone(), events, stop);

        info!(
            max_confirm_attempts = config.max_confirm_attempts,
            event_buffer = config.event_buffer,
            "Quorum service started"
        );

        let engine = Arc::new(
            AttestationQuorum::new(config, store, links)
                .with_events(publisher)
                .with_mirrors(dispatcher.pending_mirrors())
                .with_metrics(metrics.clone()),
        );

        Self {
            engine,
            dispatcher,
            metrics,
            shutdown,
            worker,
        }
    }

    pub fn engine(&self) -> Arc<AttestationQuorum> {
        self.engine.clone()
    }

    pub fn dispatcher(&self) -> Arc<CompletionDispatcher> {
        self.dispatcher.clone()
    }

    pub fn metrics(&self) -> Arc<QuorumMetrics> {
        self.metrics.clone()
    }

    /// Stop the worker after it handled every queued event
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(());
        if let Err(e) = self.worker.await {
            warn!(error = %e, "Dispatch worker ended abnormally");
        }
        info!("Quorum service stopped");
    }
}

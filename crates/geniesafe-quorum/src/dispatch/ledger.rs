//! On-chain mirror of will execution
//!
//! Once a will is validated, the contract is asked to record validation and
//! execute the payout. The call is best-effort: a failure leaves the will
//! VALIDATED off-chain and is reported, never rolled back.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use geniesafe_common::{DispatchError, SubjectId};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::info;

/// Receipt of a submitted ledger transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TxReceipt {
    pub tx_hash: String,
    /// No transaction was broadcast
    pub dry_run: bool,
    pub submitted_at: DateTime<Utc>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Record validation of `will_id` and execute its distribution
    async fn record_validation_and_execution(
        &self,
        will_id: SubjectId,
    ) -> Result<TxReceipt, DispatchError>;
}

/// Ledger client that records the intended call without broadcasting
#[derive(Debug, Default)]
pub struct DryRunLedger {
    calls: Mutex<Vec<SubjectId>>,
}

impl DryRunLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wills submitted so far, in order
    pub fn calls(&self) -> Vec<SubjectId> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl LedgerClient for DryRunLedger {
    async fn record_validation_and_execution(
        &self,
        will_id: SubjectId,
    ) -> Result<TxReceipt, DispatchError> {
        let submitted_at = Utc::now();

        let mut hasher = blake3::Hasher::new();
        hasher.update(will_id.as_bytes());
        hasher.update(&submitted_at.timestamp_nanos_opt().unwrap_or_default().to_le_bytes());
        let tx_hash = format!("0x{}", hex::encode(hasher.finalize().as_bytes()));

        self.calls.lock().push(will_id);
        info!(will_id = %will_id, tx_hash = %tx_hash, "Dry-run ledger execution");

        Ok(TxReceipt {
            tx_hash,
            dry_run: true,
            submitted_at,
        })
    }
}

/// Ledger client for deployments without chain access
///
/// Every call fails, so validated wills stay VALIDATED until an owner
/// re-requests execution against a connected ledger.
#[derive(Debug, Default)]
pub struct OfflineLedger;

#[async_trait]
impl LedgerClient for OfflineLedger {
    async fn record_validation_and_execution(
        &self,
        will_id: SubjectId,
    ) -> Result<TxReceipt, DispatchError> {
        Err(DispatchError::Ledger(format!(
            "no ledger connected, will {} not mirrored",
            will_id
        )))
    }
}

//! Prometheus metrics for the quorum engine and dispatcher

use prometheus::{IntCounter, Registry};

/// Counters for attestation activity
pub struct QuorumMetrics {
    pub activations_total: IntCounter,
    pub confirmations_total: IntCounter,
    pub duplicate_confirmations_total: IntCounter,
    pub completions_total: IntCounter,
    pub version_conflicts_total: IntCounter,
    pub secrets_released_total: IntCounter,
    pub dispatch_failures_total: IntCounter,
}

fn counter(name: &str, help: &str) -> IntCounter {
    IntCounter::new(name, help).expect("metric name and help are valid")
}

impl QuorumMetrics {
    pub fn new() -> Self {
        Self {
            activations_total: counter(
                "geniesafe_activations_total",
                "Subjects opened for confirmation",
            ),
            confirmations_total: counter(
                "geniesafe_confirmations_total",
                "Attestor confirmations recorded",
            ),
            duplicate_confirmations_total: counter(
                "geniesafe_duplicate_confirmations_total",
                "Confirmations ignored because the attestor had already confirmed",
            ),
            completions_total: counter(
                "geniesafe_quorum_completions_total",
                "Subjects that reached full quorum",
            ),
            version_conflicts_total: counter(
                "geniesafe_version_conflicts_total",
                "Conditional writes retried after a concurrent update",
            ),
            secrets_released_total: counter(
                "geniesafe_secrets_released_total",
                "Sealed secrets handed back to their owners",
            ),
            dispatch_failures_total: counter(
                "geniesafe_dispatch_failures_total",
                "Notification or ledger calls that failed",
            ),
        }
    }

    pub fn register(&self, registry: &Registry) -> prometheus::Result<()> {
        registry.register(Box::new(self.activations_total.clone()))?;
        registry.register(Box::new(self.confirmations_total.clone()))?;
        registry.register(Box::new(self.duplicate_confirmations_total.clone()))?;
        registry.register(Box::new(self.completions_total.clone()))?;
        registry.register(Box::new(self.version_conflicts_total.clone()))?;
        registry.register(Box::new(self.secrets_released_total.clone()))?;
        registry.register(Box::new(self.dispatch_failures_total.clone()))?;
        Ok(())
    }
}

impl Default for QuorumMetrics {
    fn default() -> Self {
        Self::new()
    }
}

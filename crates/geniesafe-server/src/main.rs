//! Geniesafe Server Binary
//!
//! Will validation and safeguard verification over a JSON REST API

mod api;
mod config;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use geniesafe_common::VERSION;
use geniesafe_quorum::{
    DryRunLedger, InMemoryRecordStore, LedgerClient, LinkSigner, LogNotifier, OfflineLedger,
    QuorumService,
};
use prometheus::Registry;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::api::AppState;
use crate::config::{LedgerMode, ServerConfig};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    info!("Starting Geniesafe server v{}", VERSION);

    let config = ServerConfig::load()?;
    info!("Loaded configuration: {:?}", config);

    let links = match &config.link_key {
        Some(key) => LinkSigner::from_hex_key(&config.public_base_url, key)?,
        None => {
            warn!("GENIESAFE_LINK_KEY not set, confirmation links will not survive a restart");
            LinkSigner::random(&config.public_base_url)
        }
    };

    let ledger: Arc<dyn LedgerClient> = match config.ledger {
        LedgerMode::DryRun => Arc::new(DryRunLedger::new()),
        LedgerMode::Offline => Arc::new(OfflineLedger),
    };

    let service = QuorumService::start(
        config.quorum.clone(),
        Arc::new(InMemoryRecordStore::new()),
        Arc::new(LogNotifier),
        ledger,
        links,
    );

    let registry = Registry::new();
    service.metrics().register(&registry)?;

    info!(
        "Quorum config: max_confirm_attempts={}, safeguard_panel_size={}, max_will_validators={}",
        config.quorum.max_confirm_attempts,
        config.quorum.safeguard_panel_size,
        config.quorum.max_will_validators
    );

    let app = api::router(AppState::new(&service, registry));

    let addr: SocketAddr = config.listen_addr().parse()?;
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("REST API server started on {}", addr);

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for shutdown signal");
        }
        info!("Received shutdown signal");
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    service.shutdown().await;
    info!("Shutting down Geniesafe server");
    Ok(())
}

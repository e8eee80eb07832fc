//! Geniesafe server configuration

use anyhow::Result;
use geniesafe_quorum::QuorumConfig;
use serde::{Deserialize, Serialize};

/// How validated wills reach the chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LedgerMode {
    /// Record the intended call and return a synthetic receipt
    DryRun,
    /// No chain access; wills stay VALIDATED until executed elsewhere
    Offline,
}

impl std::str::FromStr for LedgerMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "dry-run" | "dryrun" | "dry_run" => Ok(LedgerMode::DryRun),
            "offline" | "off" => Ok(LedgerMode::Offline),
            other => Err(format!("unknown ledger mode: {}", other)),
        }
    }
}

/// Geniesafe server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Service host
    pub host: String,
    /// Service port
    pub port: u16,
    /// Public URL confirmation links point at
    pub public_base_url: String,
    /// Hex-encoded 32-byte key for confirmation links; random per process if unset
    #[serde(skip_serializing)]
    pub link_key: Option<String>,
    /// Ledger backend
    pub ledger: LedgerMode,
    /// Quorum engine settings
    pub quorum: QuorumConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            public_base_url: "http://localhost:8080".to_string(),
            link_key: None,
            ledger: LedgerMode::DryRun,
            quorum: QuorumConfig::default(),
        }
    }
}

fn parse_into<T: std::str::FromStr>(name: &str, slot: &mut T) {
    if let Ok(val) = std::env::var(name) {
        if let Ok(v) = val.parse() {
            *slot = v;
        }
    }
}

impl ServerConfig {
    /// Load configuration from `.env` and the environment
    pub fn load() -> Result<Self> {
        let _ = dotenvy::dotenv();
        Ok(Self::from_env())
    }

    /// Defaults overridden by `PORT`, then `GENIESAFE_*` variables
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        // Platform-assigned port first, an explicit GENIESAFE_PORT wins
        parse_into("PORT", &mut cfg.port);

        if let Ok(host) = std::env::var("GENIESAFE_HOST") {
            cfg.host = host;
        }
        parse_into("GENIESAFE_PORT", &mut cfg.port);
        if let Ok(url) = std::env::var("GENIESAFE_PUBLIC_URL") {
            cfg.public_base_url = url;
        }
        if let Ok(key) = std::env::var("GENIESAFE_LINK_KEY") {
            if !key.trim().is_empty() {
                cfg.link_key = Some(key.trim().to_string());
            }
        }
        parse_into("GENIESAFE_LEDGER", &mut cfg.ledger);

        // Quorum settings
        parse_into(
            "GENIESAFE_MAX_CONFIRM_ATTEMPTS",
            &mut cfg.quorum.max_confirm_attempts,
        );
        parse_into(
            "GENIESAFE_SAFEGUARD_PANEL_SIZE",
            &mut cfg.quorum.safeguard_panel_size,
        );
        parse_into(
            "GENIESAFE_MAX_WILL_VALIDATORS",
            &mut cfg.quorum.max_will_validators,
        );
        parse_into("GENIESAFE_EVENT_BUFFER", &mut cfg.quorum.event_buffer);

        cfg
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

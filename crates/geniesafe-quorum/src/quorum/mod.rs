//! Quorum module - confirm-once attestation over a fixed panel
//!
//! This module provides:
//! - Panel assignment rules checked before activation
//! - The attestation state machine shared by wills and safeguards
//! - Typed confirmation outcomes

pub mod engine;
pub mod outcome;
pub mod panel;

pub use engine::AttestationQuorum;
pub use outcome::QuorumOutcome;
pub use panel::PanelRules;

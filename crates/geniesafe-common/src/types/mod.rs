//! Core types for Geniesafe

pub mod beneficiary;
pub mod secret;
pub mod subject;
pub mod user;

//! Confirmation links
//!
//! Each activation mails every attestor a link bound to (subject, attestor,
//! cycle). The token is a blake3 keyed hash, so links cannot be forged without
//! the server key and stop verifying as soon as the panel is reset.

use geniesafe_common::{AttestorId, GenieError, SubjectId};
use rand::RngCore;
use serde::Serialize;

/// A link an attestor follows to confirm
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfirmationLink {
    pub url: String,
    pub token: String,
}

/// Issues and checks confirmation tokens
#[derive(Clone)]
pub struct LinkSigner {
    base_url: String,
    key: [u8; 32],
}

impl LinkSigner {
    pub fn new(base_url: impl Into<String>, key: [u8; 32]) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            key,
        }
    }

    /// Signer with a fresh random key; links do not survive a restart
    pub fn random(base_url: impl Into<String>) -> Self {
        let mut key = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut key);
        Self::new(base_url, key)
    }

    /// Signer from a 64-character hex key
    pub fn from_hex_key(base_url: impl Into<String>, key_hex: &str) -> Result<Self, GenieError> {
        let bytes = hex::decode(key_hex.trim())?;
        let key: [u8; 32] = bytes.try_into().map_err(|b: Vec<u8>| {
            GenieError::Config(format!("link key must be 32 bytes, got {}", b.len()))
        })?;
        Ok(Self::new(base_url, key))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn digest(&self, subject_id: SubjectId, attestor_id: AttestorId, cycle: u64) -> blake3::Hash {
        let mut hasher = blake3::Hasher::new_keyed(&self.key);
        hasher.update(subject_id.as_bytes());
        hasher.update(attestor_id.as_bytes());
        hasher.update(&cycle.to_le_bytes());
        hasher.finalize()
    }

    pub fn token(&self, subject_id: SubjectId, attestor_id: AttestorId, cycle: u64) -> String {
        hex::encode(self.digest(subject_id, attestor_id, cycle).as_bytes())
    }

    pub fn link(&self, subject_id: SubjectId, attestor_id: AttestorId, cycle: u64) -> ConfirmationLink {
        let token = self.token(subject_id, attestor_id, cycle);
        ConfirmationLink {
            url: format!(
                "{}/confirm/{}/{}?token={}",
                self.base_url, subject_id, attestor_id, token
            ),
            token,
        }
    }

    /// Constant-time check of a presented token
    pub fn verify(
        &self,
        subject_id: SubjectId,
        attestor_id: AttestorId,
        cycle: u64,
        token: &str,
    ) -> bool {
        let presented: [u8; 32] = match hex::decode(token).ok().and_then(|b| b.try_into().ok()) {
            Some(bytes) => bytes,
            None => return false,
        };
        // blake3::Hash equality is constant-time
        blake3::Hash::from(presented) == self.digest(subject_id, attestor_id, cycle)
    }
}

impl std::fmt::Debug for LinkSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkSigner")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

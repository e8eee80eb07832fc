//! User identity and the attestor-with-profile projection

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::subject::Attestor;

pub type UserId = Uuid;

/// Contact details for a registered user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: UserId,
    pub email: String,
    pub display_name: String,
    /// EVM address, if the user has connected a wallet
    #[serde(default)]
    pub wallet_address: Option<String>,
}

impl UserProfile {
    pub fn new(id: UserId, email: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id,
            email: email.into(),
            display_name: display_name.into(),
            wallet_address: None,
        }
    }
}

/// An attestor joined with its user's profile
///
/// `profile` is `None` when the attestor's user has not registered contact
/// details yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttestorProfile {
    #[serde(flatten)]
    pub attestor: Attestor,
    pub profile: Option<UserProfile>,
}

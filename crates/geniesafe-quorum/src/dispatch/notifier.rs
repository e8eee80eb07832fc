//! Email notification
//!
//! The quorum only needs "send this rendered email to this address". Delivery,
//! retries and SMTP details belong to whatever implements [`Notifier`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use geniesafe_common::{DispatchError, SubjectKind};
use parking_lot::Mutex;
use tracing::info;

use super::link::ConfirmationLink;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Send one email
    async fn send(&self, to: &str, subject: &str, body_html: &str) -> Result<(), DispatchError>;
}

/// Notifier that only writes to the trace log
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, to: &str, subject: &str, body_html: &str) -> Result<(), DispatchError> {
        info!(to = %to, subject = %subject, bytes = body_html.len(), "Email dispatched");
        Ok(())
    }
}

/// A message captured by [`OutboxNotifier`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentEmail {
    pub to: String,
    pub subject: String,
    pub body_html: String,
    pub sent_at: DateTime<Utc>,
}

/// Notifier that keeps every message in memory
#[derive(Debug, Default)]
pub struct OutboxNotifier {
    outbox: Mutex<Vec<SentEmail>>,
}

impl OutboxNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<SentEmail> {
        self.outbox.lock().clone()
    }

    pub fn sent_to(&self, address: &str) -> Vec<SentEmail> {
        self.outbox
            .lock()
            .iter()
            .filter(|m| m.to == address)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.outbox.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.outbox.lock().is_empty()
    }
}

#[async_trait]
impl Notifier for OutboxNotifier {
    async fn send(&self, to: &str, subject: &str, body_html: &str) -> Result<(), DispatchError> {
        self.outbox.lock().push(SentEmail {
            to: to.to_string(),
            subject: subject.to_string(),
            body_html: body_html.to_string(),
            sent_at: Utc::now(),
        });
        Ok(())
    }
}

/// Email subjects and bodies
///
/// Bodies are askama HTML templates, so display names and links are escaped.
/// Subject lines are plain text stripped of control characters.
pub mod templates {
    use askama::Template;

    use super::*;

    #[derive(Template)]
    #[template(
        source = "<p>Hi {{ attestor_name }},</p><p>{{ ask }}</p><p><a href=\"{{ url }}\">Confirm as {{ role }}</a></p>",
        ext = "html"
    )]
    struct InviteBody<'a> {
        attestor_name: &'a str,
        ask: &'a str,
        url: &'a str,
        role: &'a str,
    }

    #[derive(Template)]
    #[template(
        source = "<p>Hi {{ owner_name }},</p><p>All {{ total }} {{ role }}s have confirmed. {{ next_step }}</p>",
        ext = "html"
    )]
    struct CompletionBody<'a> {
        owner_name: &'a str,
        total: usize,
        role: &'a str,
        next_step: &'a str,
    }

    fn header_text(value: &str) -> String {
        value.chars().filter(|c| !c.is_control()).collect()
    }

    fn render(template: &impl Template) -> Result<String, DispatchError> {
        template
            .render()
            .map_err(|e| DispatchError::Render(e.to_string()))
    }

    /// Invitation sent to each attestor when a subject is activated
    pub fn activation_invite(
        kind: SubjectKind,
        owner_name: &str,
        attestor_name: &str,
        link: &ConfirmationLink,
    ) -> Result<(String, String), DispatchError> {
        let (subject, ask) = match kind {
            SubjectKind::Will => (
                format!("{} named you a validator of their will", owner_name),
                format!(
                    "{} has activated their will. Please confirm only once you know they have passed away.",
                    owner_name
                ),
            ),
            SubjectKind::RecoveryConfig => (
                format!("{} asked you to verify a key recovery", owner_name),
                format!(
                    "{} has started recovering their key and needs you to verify it is really them.",
                    owner_name
                ),
            ),
        };
        let body = render(&InviteBody {
            attestor_name,
            ask: &ask,
            url: &link.url,
            role: kind.attestor_role(),
        })?;
        Ok((header_text(&subject), body))
    }

    /// Notice sent to the owner once every attestor has confirmed
    pub fn completion_notice(
        kind: SubjectKind,
        owner_name: &str,
        total: usize,
    ) -> Result<(String, String), DispatchError> {
        let (subject, next_step) = match kind {
            SubjectKind::Will => (
                "Your will has been validated",
                "Your will is being executed on-chain.",
            ),
            SubjectKind::RecoveryConfig => (
                "Your safeguard has been verified",
                "You can now reveal your secret once.",
            ),
        };
        let body = render(&CompletionBody {
            owner_name,
            total,
            role: kind.attestor_role(),
            next_step,
        })?;
        Ok((subject.to_string(), body))
    }
}

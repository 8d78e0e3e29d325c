//! Notification delivery for `EMAIL_SEND` and `PUSH_SEND`.

use async_trait::async_trait;
use tracing::info;

use crate::jobs::{EmailSendPayload, PushSendPayload};

#[derive(Debug, Clone, thiserror::Error)]
pub enum NotifyError {
    #[error("notification rejected: {0}")]
    Rejected(String),
    #[error("notification service unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_email(&self, email: &EmailSendPayload) -> Result<(), NotifyError>;

    async fn send_push(&self, push: &PushSendPayload) -> Result<(), NotifyError>;
}

/// Logs deliveries instead of sending them.
///
/// Template data is never logged: invite emails carry the claim preimage.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn send_email(&self, email: &EmailSendPayload) -> Result<(), NotifyError> {
        if email.to.trim().is_empty() {
            return Err(NotifyError::Rejected("email recipient is empty".to_string()));
        }
        info!(template = %email.template, to = %email.to, "email delivery");
        Ok(())
    }

    async fn send_push(&self, push: &PushSendPayload) -> Result<(), NotifyError> {
        info!(title = %push.title, "push delivery");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tracing_notifier_rejects_blank_address() {
        let notifier = TracingNotifier;
        let email = EmailSendPayload {
            template: "invite".into(),
            to: " ".into(),
            data: serde_json::json!({}),
        };
        assert!(matches!(
            notifier.send_email(&email).await,
            Err(NotifyError::Rejected(_))
        ));

        let email = EmailSendPayload {
            to: "friend@example.com".into(),
            ..email
        };
        assert!(notifier.send_email(&email).await.is_ok());
    }
}

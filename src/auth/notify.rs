//! Outbound notification seam. Delivery is someone else's job; the core only
//! hands over recipient, kind, token and link.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    EmailVerification,
    PasswordReset,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::EmailVerification => "email_verification",
            NotificationKind::PasswordReset => "password_reset",
        }
    }

    fn path(&self) -> &'static str {
        match self {
            NotificationKind::EmailVerification => "/verify-email",
            NotificationKind::PasswordReset => "/reset-password",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Notification {
    pub recipient: String,
    pub kind: NotificationKind,
    pub token: String,
    pub link: String,
}

impl Notification {
    pub fn new(
        kind: NotificationKind,
        recipient: impl Into<String>,
        token: impl Into<String>,
        frontend_url: &str,
    ) -> Self {
        let token = token.into();
        let link = format!(
            "{}{}?token={}",
            frontend_url.trim_end_matches('/'),
            kind.path(),
            token
        );
        Self {
            recipient: recipient.into(),
            kind,
            token,
            link,
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn dispatch(&self, notification: Notification) -> anyhow::Result<()>;
}

/// Writes notifications to the log instead of delivering them.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn dispatch(&self, notification: Notification) -> anyhow::Result<()> {
        info!(
            recipient = %notification.recipient,
            kind = notification.kind.as_str(),
            "notification queued"
        );
        debug!(link = %notification.link, "notification link");
        Ok(())
    }
}

/// Fire and forget; failures only reach the log.
pub fn dispatch_detached(notifier: Arc<dyn Notifier>, notification: Notification) {
    tokio::spawn(async move {
        let kind = notification.kind;
        if let Err(e) = notifier.dispatch(notification).await {
            warn!(error = %e, kind = kind.as_str(), "notification dispatch failed");
        }
    });
}

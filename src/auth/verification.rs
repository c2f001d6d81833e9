//! One-time tokens for email verification and password reset.

use std::sync::Arc;

use time::{Duration, OffsetDateTime};
use tracing::info;
use uuid::Uuid;

use crate::{
    auth::{
        claims::ClientContext,
        repo::{AuthStore, PasswordReset},
        repo_types::{Activity, ActivityKind},
        tokens::generate_token,
    },
    clock::Clock,
    error::AuthError,
};

/// Result of presenting an email-verification token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmailVerification {
    Verified(Uuid),
    AlreadyVerified(Uuid),
}

#[derive(Clone)]
pub struct VerificationLedger {
    store: Arc<dyn AuthStore>,
    clock: Arc<dyn Clock>,
    reset_ttl: Duration,
}

impl VerificationLedger {
    pub fn new(store: Arc<dyn AuthStore>, clock: Arc<dyn Clock>, reset_ttl: Duration) -> Self {
        Self {
            store,
            clock,
            reset_ttl,
        }
    }

    /// Overwrites any outstanding email token.
    pub async fn issue_email_token(&self, user_id: Uuid) -> Result<String, AuthError> {
        let token = generate_token()?;
        self.store.set_email_token(user_id, &token).await?;
        Ok(token)
    }

    pub async fn consume_email_token(
        &self,
        token: &str,
        client: &ClientContext,
    ) -> Result<EmailVerification, AuthError> {
        let record = self
            .store
            .find_verification_by_email_token(token)
            .await?
            .ok_or(AuthError::TokenInvalid)?;
        if record.email_verified {
            return Ok(EmailVerification::AlreadyVerified(record.user_id));
        }

        let now = self.clock.now();
        let activity = Activity {
            user_id: record.user_id,
            kind: ActivityKind::EmailVerified,
            ip_address: client.ip_address.clone(),
            user_agent: client.user_agent.clone(),
            created_at: now,
        };
        if self
            .store
            .mark_email_verified(record.user_id, token, now, &activity)
            .await?
        {
            info!(user_id = %record.user_id, "email verified");
            return Ok(EmailVerification::Verified(record.user_id));
        }

        // Lost a race with another verification of the same token.
        match self.store.find_verification(record.user_id).await? {
            Some(current) if current.email_verified => {
                Ok(EmailVerification::AlreadyVerified(record.user_id))
            }
            _ => Err(AuthError::TokenInvalid),
        }
    }

    /// Overwrites any outstanding reset token.
    pub async fn issue_reset_token(&self, user_id: Uuid) -> Result<(String, OffsetDateTime), AuthError> {
        let token = generate_token()?;
        let expires_at = self.clock.now() + self.reset_ttl;
        self.store.set_reset_token(user_id, &token, expires_at).await?;
        Ok((token, expires_at))
    }

    /// Resolves a reset token to its owner without consuming it.
    pub async fn check_reset_token(&self, token: &str) -> Result<Uuid, AuthError> {
        let record = self
            .store
            .find_verification_by_reset_token(token)
            .await?
            .ok_or(AuthError::TokenInvalid)?;
        match record.password_reset_expiry {
            Some(expiry) if expiry > self.clock.now() => Ok(record.user_id),
            Some(_) => Err(AuthError::TokenExpired),
            None => Err(AuthError::TokenInvalid),
        }
    }

    /// Single-use: clears the token, stores `new_password_hash` and revokes
    /// every session of the owner in one commit.
    pub async fn consume_reset_token(
        &self,
        token: &str,
        new_password_hash: String,
        client: &ClientContext,
    ) -> Result<Uuid, AuthError> {
        let user_id = self.check_reset_token(token).await?;
        let now = self.clock.now();
        let reset = PasswordReset {
            user_id,
            token: token.to_string(),
            new_password_hash,
            now,
            activity: Activity {
                user_id,
                kind: ActivityKind::PasswordResetCompleted,
                ip_address: client.ip_address.clone(),
                user_agent: client.user_agent.clone(),
                created_at: now,
            },
        };

        if !self.store.complete_password_reset(&reset).await? {
            // Consumed or expired between the check and the commit.
            self.check_reset_token(token).await?;
            return Err(AuthError::TokenInvalid);
        }
        info!(user_id = %user_id, "password reset completed; sessions revoked");
        Ok(user_id)
    }
}

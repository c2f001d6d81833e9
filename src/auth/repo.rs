//! Credential store adapter: the persistence seam of the auth core.
//!
//! Every mutating flow maps to exactly one call here, and each call commits
//! all of its writes or none of them.

use async_trait::async_trait;
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::auth::repo_types::{
    Activity, NewAccount, RevokeScope, Session, User, VerificationRecord,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unique constraint violated: {0}")]
    Conflict(String),

    #[error("store backend failure: {0}")]
    Backend(String),
}

/// Arguments of the password-reset commit.
#[derive(Debug, Clone)]
pub struct PasswordReset {
    pub user_id: Uuid,
    pub token: String,
    pub new_password_hash: String,
    pub now: OffsetDateTime,
    pub activity: Activity,
}

/// Arguments of the authenticated password-change commit.
#[derive(Debug, Clone)]
pub struct PasswordChange {
    pub user_id: Uuid,
    pub new_password_hash: String,
    /// Sessions created from this IP stay active.
    pub keep_ip: String,
    pub now: OffsetDateTime,
    pub activity: Activity,
}

#[async_trait]
pub trait AuthStore: Send + Sync {
    /// Short backend name for health output.
    fn backend(&self) -> &'static str;

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError>;

    async fn find_user_by_id(&self, id: Uuid) -> Result<Option<User>, StoreError>;

    /// Inserts user, profile, verification record, first session and the
    /// `register` activity. Fails with `Conflict` when the email is taken.
    async fn create_account(&self, account: &NewAccount) -> Result<(), StoreError>;

    /// Returns false when no such user exists.
    async fn set_user_active(
        &self,
        user_id: Uuid,
        active: bool,
        at: OffsetDateTime,
    ) -> Result<bool, StoreError>;

    /// Stamps last-login, stores the new session and the `login` activity.
    async fn record_login(
        &self,
        user_id: Uuid,
        at: OffsetDateTime,
        session: &Session,
        activity: &Activity,
    ) -> Result<(), StoreError>;

    async fn insert_session(&self, session: &Session) -> Result<(), StoreError>;

    async fn find_session(&self, token: &str) -> Result<Option<Session>, StoreError>;

    /// Deactivates `old_token` only if it is still active and unexpired at
    /// `replacement.created_at`, then stores `replacement`. Returns false,
    /// writing nothing, when the condition does not hold.
    async fn rotate_session(
        &self,
        old_token: &str,
        replacement: &Session,
        activity: &Activity,
    ) -> Result<bool, StoreError>;

    /// Deactivates the user's active sessions matching `scope`; returns how many.
    async fn revoke_sessions(&self, user_id: Uuid, scope: &RevokeScope) -> Result<u64, StoreError>;

    async fn find_verification(&self, user_id: Uuid) -> Result<Option<VerificationRecord>, StoreError>;

    async fn find_verification_by_email_token(
        &self,
        token: &str,
    ) -> Result<Option<VerificationRecord>, StoreError>;

    async fn find_verification_by_reset_token(
        &self,
        token: &str,
    ) -> Result<Option<VerificationRecord>, StoreError>;

    /// Creates or overwrites the email-verification token of a user.
    async fn set_email_token(&self, user_id: Uuid, token: &str) -> Result<(), StoreError>;

    /// Marks the email verified and clears the token, if `token` is still the
    /// outstanding one. Returns false otherwise.
    async fn mark_email_verified(
        &self,
        user_id: Uuid,
        token: &str,
        at: OffsetDateTime,
        activity: &Activity,
    ) -> Result<bool, StoreError>;

    /// Creates or overwrites the password-reset token of a user.
    async fn set_reset_token(
        &self,
        user_id: Uuid,
        token: &str,
        expires_at: OffsetDateTime,
    ) -> Result<(), StoreError>;

    /// Clears the reset token (only if it still matches and is unexpired),
    /// replaces the password hash, deactivates every session of the user and
    /// logs the activity. Returns false, writing nothing, when the token is
    /// no longer usable.
    async fn complete_password_reset(&self, reset: &PasswordReset) -> Result<bool, StoreError>;

    /// Replaces the password hash and deactivates sessions from other IPs.
    /// Returns the number of revoked sessions.
    async fn change_password(&self, change: &PasswordChange) -> Result<u64, StoreError>;

    async fn log_activity(&self, activity: &Activity) -> Result<(), StoreError>;
}

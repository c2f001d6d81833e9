//! In-process `AuthStore`, used when no database is configured and by tests.

use std::collections::HashMap;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::auth::repo::{AuthStore, PasswordChange, PasswordReset, StoreError};
use crate::auth::repo_types::{
    Activity, NewAccount, RevokeScope, Session, User, UserProfile, VerificationRecord,
};

#[derive(Default)]
struct Tables {
    users: HashMap<Uuid, User>,
    user_ids_by_email: HashMap<String, Uuid>,
    profiles: HashMap<Uuid, UserProfile>,
    sessions: HashMap<String, Session>,
    verifications: HashMap<Uuid, VerificationRecord>,
    activities: Vec<Activity>,
}

impl Tables {
    fn revoke(&mut self, user_id: Uuid, scope: &RevokeScope) -> u64 {
        let mut revoked = 0;
        for session in self.sessions.values_mut() {
            if session.user_id != user_id || !session.is_active {
                continue;
            }
            let matches = match scope {
                RevokeScope::All => true,
                RevokeScope::Token(token) => &session.token == token,
                RevokeScope::Fingerprint {
                    ip_address,
                    user_agent,
                } => &session.ip_address == ip_address && &session.user_agent == user_agent,
                RevokeScope::OtherThanIp(ip) => &session.ip_address != ip,
            };
            if matches {
                session.is_active = false;
                revoked += 1;
            }
        }
        revoked
    }
}

/// Every operation takes one lock over all tables, which gives the same
/// all-or-nothing behaviour as a database transaction.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn profile(&self, user_id: Uuid) -> Option<UserProfile> {
        self.tables.lock().await.profiles.get(&user_id).cloned()
    }

    /// Scans user rows rather than the email index.
    pub async fn count_users_with_email(&self, email: &str) -> usize {
        let tables = self.tables.lock().await;
        tables.users.values().filter(|u| u.email == email).count()
    }

    pub async fn sessions_for(&self, user_id: Uuid) -> Vec<Session> {
        let tables = self.tables.lock().await;
        let mut sessions: Vec<Session> = tables
            .sessions
            .values()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect();
        sessions.sort_by_key(|s| s.created_at);
        sessions
    }

    pub async fn activities_for(&self, user_id: Uuid) -> Vec<Activity> {
        let tables = self.tables.lock().await;
        tables
            .activities
            .iter()
            .filter(|a| a.user_id == user_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl AuthStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .user_ids_by_email
            .get(email)
            .and_then(|id| tables.users.get(id))
            .cloned())
    }

    async fn find_user_by_id(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        Ok(self.tables.lock().await.users.get(&id).cloned())
    }

    async fn create_account(&self, account: &NewAccount) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        if tables.user_ids_by_email.contains_key(&account.user.email) {
            return Err(StoreError::Conflict("users.email".into()));
        }
        if tables.sessions.contains_key(&account.session.token) {
            return Err(StoreError::Conflict("user_sessions.session_token".into()));
        }

        let user_id = account.user.id;
        tables
            .user_ids_by_email
            .insert(account.user.email.clone(), user_id);
        tables.users.insert(user_id, account.user.clone());
        tables.profiles.insert(user_id, account.profile.clone());
        tables
            .verifications
            .insert(user_id, account.verification.clone());
        tables
            .sessions
            .insert(account.session.token.clone(), account.session.clone());
        tables.activities.push(account.activity.clone());
        Ok(())
    }

    async fn set_user_active(
        &self,
        user_id: Uuid,
        active: bool,
        at: OffsetDateTime,
    ) -> Result<bool, StoreError> {
        let mut tables = self.tables.lock().await;
        match tables.users.get_mut(&user_id) {
            Some(user) => {
                user.is_active = active;
                user.updated_at = at;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn record_login(
        &self,
        user_id: Uuid,
        at: OffsetDateTime,
        session: &Session,
        activity: &Activity,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        if tables.sessions.contains_key(&session.token) {
            return Err(StoreError::Conflict("user_sessions.session_token".into()));
        }
        if let Some(user) = tables.users.get_mut(&user_id) {
            user.last_login = Some(at);
            user.updated_at = at;
        }
        tables
            .sessions
            .insert(session.token.clone(), session.clone());
        tables.activities.push(activity.clone());
        Ok(())
    }

    async fn insert_session(&self, session: &Session) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        if tables.sessions.contains_key(&session.token) {
            return Err(StoreError::Conflict("user_sessions.session_token".into()));
        }
        tables
            .sessions
            .insert(session.token.clone(), session.clone());
        Ok(())
    }

    async fn find_session(&self, token: &str) -> Result<Option<Session>, StoreError> {
        Ok(self.tables.lock().await.sessions.get(token).cloned())
    }

    async fn rotate_session(
        &self,
        old_token: &str,
        replacement: &Session,
        activity: &Activity,
    ) -> Result<bool, StoreError> {
        let mut tables = self.tables.lock().await;
        if tables.sessions.contains_key(&replacement.token) {
            return Err(StoreError::Conflict("user_sessions.session_token".into()));
        }
        match tables.sessions.get_mut(old_token) {
            Some(old) if old.is_valid_at(replacement.created_at) => old.is_active = false,
            _ => return Ok(false),
        }
        tables
            .sessions
            .insert(replacement.token.clone(), replacement.clone());
        tables.activities.push(activity.clone());
        Ok(true)
    }

    async fn revoke_sessions(&self, user_id: Uuid, scope: &RevokeScope) -> Result<u64, StoreError> {
        Ok(self.tables.lock().await.revoke(user_id, scope))
    }

    async fn find_verification(
        &self,
        user_id: Uuid,
    ) -> Result<Option<VerificationRecord>, StoreError> {
        Ok(self.tables.lock().await.verifications.get(&user_id).cloned())
    }

    async fn find_verification_by_email_token(
        &self,
        token: &str,
    ) -> Result<Option<VerificationRecord>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .verifications
            .values()
            .find(|v| v.email_token.as_deref() == Some(token))
            .cloned())
    }

    async fn find_verification_by_reset_token(
        &self,
        token: &str,
    ) -> Result<Option<VerificationRecord>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .verifications
            .values()
            .find(|v| v.password_reset_token.as_deref() == Some(token))
            .cloned())
    }

    async fn set_email_token(&self, user_id: Uuid, token: &str) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        let record = tables
            .verifications
            .entry(user_id)
            .or_insert_with(|| VerificationRecord {
                user_id,
                ..Default::default()
            });
        record.email_token = Some(token.to_string());
        Ok(())
    }

    async fn mark_email_verified(
        &self,
        user_id: Uuid,
        token: &str,
        at: OffsetDateTime,
        activity: &Activity,
    ) -> Result<bool, StoreError> {
        let mut tables = self.tables.lock().await;
        match tables.verifications.get_mut(&user_id) {
            Some(record) if record.email_token.as_deref() == Some(token) => {
                record.email_verified = true;
                record.verified_at = Some(at);
                record.email_token = None;
            }
            _ => return Ok(false),
        }
        tables.activities.push(activity.clone());
        Ok(true)
    }

    async fn set_reset_token(
        &self,
        user_id: Uuid,
        token: &str,
        expires_at: OffsetDateTime,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        let record = tables
            .verifications
            .entry(user_id)
            .or_insert_with(|| VerificationRecord {
                user_id,
                ..Default::default()
            });
        record.password_reset_token = Some(token.to_string());
        record.password_reset_expiry = Some(expires_at);
        Ok(())
    }

    async fn complete_password_reset(&self, reset: &PasswordReset) -> Result<bool, StoreError> {
        let mut tables = self.tables.lock().await;
        match tables.verifications.get_mut(&reset.user_id) {
            Some(record)
                if record.password_reset_token.as_deref() == Some(reset.token.as_str())
                    && record
                        .password_reset_expiry
                        .is_some_and(|expiry| expiry > reset.now) =>
            {
                record.password_reset_token = None;
                record.password_reset_expiry = None;
            }
            _ => return Ok(false),
        }

        if let Some(user) = tables.users.get_mut(&reset.user_id) {
            user.password_hash = reset.new_password_hash.clone();
            user.updated_at = reset.now;
        }
        tables.revoke(reset.user_id, &RevokeScope::All);
        tables.activities.push(reset.activity.clone());
        Ok(true)
    }

    async fn change_password(&self, change: &PasswordChange) -> Result<u64, StoreError> {
        let mut tables = self.tables.lock().await;
        match tables.users.get_mut(&change.user_id) {
            Some(user) => {
                user.password_hash = change.new_password_hash.clone();
                user.updated_at = change.now;
            }
            None => return Err(StoreError::Backend("user row vanished".into())),
        }
        let revoked = tables.revoke(
            change.user_id,
            &RevokeScope::OtherThanIp(change.keep_ip.clone()),
        );
        tables.activities.push(change.activity.clone());
        Ok(revoked)
    }

    async fn log_activity(&self, activity: &Activity) -> Result<(), StoreError> {
        self.tables.lock().await.activities.push(activity.clone());
        Ok(())
    }
}

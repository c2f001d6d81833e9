//! Refresh-token session lifecycle: lookup, rotation and revocation.

use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    auth::{
        claims::ClientContext,
        repo::AuthStore,
        repo_types::{Activity, ActivityKind, RevokeScope, Session},
        tokens::TokenService,
    },
    clock::Clock,
    error::AuthError,
};

#[derive(Clone)]
pub struct SessionRegistry {
    store: Arc<dyn AuthStore>,
    tokens: TokenService,
    clock: Arc<dyn Clock>,
}

impl SessionRegistry {
    pub fn new(store: Arc<dyn AuthStore>, tokens: TokenService, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            tokens,
            clock,
        }
    }

    /// Exact match on the stored token value.
    pub async fn lookup(&self, token: &str) -> Result<Session, AuthError> {
        self.store
            .find_session(token)
            .await?
            .ok_or(AuthError::RefreshTokenInvalid)
    }

    pub fn is_valid(&self, session: &Session) -> bool {
        session.is_valid_at(self.clock.now())
    }

    /// Retires `old` and issues its replacement in one conditional write.
    /// Losing a concurrent race, or presenting a retired or expired session,
    /// yields `RefreshTokenExpired`.
    pub async fn rotate(&self, old: &Session, client: &ClientContext) -> Result<Session, AuthError> {
        if !self.is_valid(old) {
            if old.is_active {
                // Expired but still flagged active.
                self.store
                    .revoke_sessions(old.user_id, &RevokeScope::Token(old.token.clone()))
                    .await?;
                info!(session_id = %old.id, user_id = %old.user_id, "expired session deactivated");
            } else {
                warn!(
                    session_id = %old.id,
                    user_id = %old.user_id,
                    "retired refresh token presented; suspected replay"
                );
            }
            return Err(AuthError::RefreshTokenExpired);
        }

        let replacement = self.tokens.mint_session(old.user_id, client)?;
        let activity = Activity {
            user_id: old.user_id,
            kind: ActivityKind::TokenRefresh,
            ip_address: client.ip_address.clone(),
            user_agent: client.user_agent.clone(),
            created_at: replacement.created_at,
        };

        if !self.store.rotate_session(&old.token, &replacement, &activity).await? {
            warn!(
                session_id = %old.id,
                user_id = %old.user_id,
                "refresh token already rotated by a concurrent request; suspected replay"
            );
            return Err(AuthError::RefreshTokenExpired);
        }
        Ok(replacement)
    }

    pub async fn revoke_all(&self, user_id: Uuid) -> Result<u64, AuthError> {
        let revoked = self.store.revoke_sessions(user_id, &RevokeScope::All).await?;
        info!(user_id = %user_id, revoked, "all sessions revoked");
        Ok(revoked)
    }

    pub async fn revoke_one(&self, token: &str, user_id: Uuid) -> Result<u64, AuthError> {
        Ok(self
            .store
            .revoke_sessions(user_id, &RevokeScope::Token(token.to_string()))
            .await?)
    }

    pub async fn revoke_by_client_fingerprint(
        &self,
        user_id: Uuid,
        client: &ClientContext,
    ) -> Result<u64, AuthError> {
        Ok(self
            .store
            .revoke_sessions(
                user_id,
                &RevokeScope::Fingerprint {
                    ip_address: client.ip_address.clone(),
                    user_agent: client.user_agent.clone(),
                },
            )
            .await?)
    }
}

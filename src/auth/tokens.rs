//! Access-token issuance and verification plus refresh-session minting.

use std::sync::Arc;

use base64ct::{Base64UrlUnpadded, Encoding};
use rand::{rngs::OsRng, RngCore};
use time::{Duration, OffsetDateTime};
use tracing::error;
use uuid::Uuid;

use crate::{
    auth::{
        claims::{ClientContext, Identity},
        jwt::JwtKeys,
        repo::AuthStore,
        repo_types::{Session, User},
    },
    clock::Clock,
    error::AuthError,
};

/// 256 bits of entropy per opaque token.
const TOKEN_BYTES: usize = 32;

/// Opaque, URL-safe token from the OS CSPRNG. An entropy failure is an
/// error, never a weaker fallback.
pub fn generate_token() -> Result<String, AuthError> {
    let mut buffer = [0u8; TOKEN_BYTES];
    OsRng.try_fill_bytes(&mut buffer).map_err(|e| {
        error!(error = %e, "os random source unavailable");
        AuthError::Internal(format!("os random source unavailable: {e}"))
    })?;
    Ok(Base64UrlUnpadded::encode_string(&buffer))
}

#[derive(Debug, Clone)]
pub struct AccessToken {
    pub token: String,
    pub expires_at: OffsetDateTime,
}

#[derive(Clone)]
pub struct TokenService {
    keys: JwtKeys,
    store: Arc<dyn AuthStore>,
    clock: Arc<dyn Clock>,
    refresh_ttl: Duration,
}

impl TokenService {
    pub fn new(
        keys: JwtKeys,
        store: Arc<dyn AuthStore>,
        clock: Arc<dyn Clock>,
        refresh_ttl: Duration,
    ) -> Self {
        Self {
            keys,
            store,
            clock,
            refresh_ttl,
        }
    }

    pub fn issue_access_token(&self, user: &User) -> Result<AccessToken, AuthError> {
        let (token, expires_at) = self.keys.sign(user, self.clock.now())?;
        Ok(AccessToken { token, expires_at })
    }

    pub fn verify_access_token(&self, token: &str) -> Result<Identity, AuthError> {
        self.keys
            .verify(token, self.clock.now())
            .map(Identity::from)
    }

    /// Builds a fresh active session without storing it, for flows that
    /// persist it together with their other writes.
    pub fn mint_session(&self, user_id: Uuid, client: &ClientContext) -> Result<Session, AuthError> {
        let now = self.clock.now();
        Ok(Session {
            id: Uuid::new_v4(),
            user_id,
            token: generate_token()?,
            expires_at: now + self.refresh_ttl,
            ip_address: client.ip_address.clone(),
            user_agent: client.user_agent.clone(),
            is_active: true,
            created_at: now,
        })
    }

    /// Mints and stores a standalone session.
    pub async fn issue_refresh_token(
        &self,
        user_id: Uuid,
        client: &ClientContext,
    ) -> Result<Session, AuthError> {
        let session = self.mint_session(user_id, client)?;
        self.store.insert_session(&session).await?;
        Ok(session)
    }
}

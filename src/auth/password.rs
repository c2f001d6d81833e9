use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Algorithm, Argon2, Params, Version,
};
use std::sync::Arc;

use tokio::sync::OnceCell;
use tracing::error;

use crate::error::AuthError;

pub const MIN_PASSWORD_LENGTH: usize = 8;
const SPECIAL_CHARACTERS: &str = "!@#$%^&*()_+-=[]{}|;:,.<>?";
const DECOY_PASSWORD: &str = "decoy-password-never-issued";

/// Rejects passwords that miss any of: minimum length, uppercase,
/// lowercase, digit, special character.
pub fn validate_strength(password: &str) -> Result<(), AuthError> {
    if password.chars().count() < MIN_PASSWORD_LENGTH {
        return Err(AuthError::WeakPassword(format!(
            "Password must be at least {MIN_PASSWORD_LENGTH} characters long"
        )));
    }
    if !password.chars().any(|c| c.is_ascii_uppercase()) {
        return Err(AuthError::WeakPassword(
            "Password must contain at least one uppercase letter".into(),
        ));
    }
    if !password.chars().any(|c| c.is_ascii_lowercase()) {
        return Err(AuthError::WeakPassword(
            "Password must contain at least one lowercase letter".into(),
        ));
    }
    if !password.chars().any(|c| c.is_ascii_digit()) {
        return Err(AuthError::WeakPassword(
            "Password must contain at least one digit".into(),
        ));
    }
    if !password.chars().any(|c| SPECIAL_CHARACTERS.contains(c)) {
        return Err(AuthError::WeakPassword(
            "Password must contain at least one special character".into(),
        ));
    }
    Ok(())
}

/// Argon2id hasher. Cloneable so work can move onto a blocking thread.
#[derive(Clone, Default)]
pub struct PasswordHashing {
    params: Params,
    decoy: Arc<OnceCell<String>>,
}

impl PasswordHashing {
    pub fn with_params(params: Params) -> Self {
        Self {
            params,
            decoy: Arc::default(),
        }
    }

    /// Minimum-cost parameters for test suites.
    pub fn fast_insecure() -> Self {
        match Params::new(Params::MIN_M_COST, 1, 1, None) {
            Ok(params) => Self::with_params(params),
            Err(_) => Self::default(),
        }
    }

    fn argon2(&self) -> Argon2<'static> {
        Argon2::new(Algorithm::Argon2id, Version::V0x13, self.params.clone())
    }

    pub fn hash(&self, plain: &str) -> Result<String, AuthError> {
        let salt = SaltString::generate(&mut OsRng);
        let hash = self
            .argon2()
            .hash_password(plain.as_bytes(), &salt)
            .map_err(|e| {
                error!(error = %e, "argon2 hash_password error");
                AuthError::HashingFailed(e.to_string())
            })?
            .to_string();
        Ok(hash)
    }

    /// Parameters are read from the stored PHC string, so hashes made with
    /// other settings still verify.
    pub fn verify(&self, plain: &str, hash: &str) -> Result<bool, AuthError> {
        let parsed = PasswordHash::new(hash).map_err(|e| {
            error!(error = %e, "argon2 parse hash error");
            AuthError::HashingFailed(e.to_string())
        })?;
        Ok(self
            .argon2()
            .verify_password(plain.as_bytes(), &parsed)
            .is_ok())
    }

    pub async fn hash_blocking(&self, plain: String) -> Result<String, AuthError> {
        let hasher = self.clone();
        tokio::task::spawn_blocking(move || hasher.hash(&plain))
            .await
            .map_err(|e| AuthError::HashingFailed(e.to_string()))?
    }

    pub async fn verify_blocking(&self, plain: String, hash: String) -> Result<bool, AuthError> {
        let hasher = self.clone();
        tokio::task::spawn_blocking(move || hasher.verify(&plain, &hash))
            .await
            .map_err(|e| AuthError::HashingFailed(e.to_string()))?
    }

    /// Hash of a password nobody holds, made with these parameters. Built on
    /// first use and shared by clones.
    pub async fn decoy_hash(&self) -> Result<&str, AuthError> {
        let hash = self
            .decoy
            .get_or_try_init(|| self.hash_blocking(DECOY_PASSWORD.to_string()))
            .await?;
        Ok(hash.as_str())
    }

    /// Costs the same as `verify_blocking` on a real account. Used when no
    /// account matched, so the outcome cannot be timed.
    pub async fn verify_decoy(&self, plain: String) -> Result<(), AuthError> {
        let hash = self.decoy_hash().await?.to_string();
        self.verify_blocking(plain, hash).await?;
        Ok(())
    }

    pub(crate) fn has_decoy(&self) -> bool {
        self.decoy.initialized()
    }
}

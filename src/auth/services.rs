//! Auth orchestrator: composes the store, token service, session registry,
//! verification ledger and lockout guard into the user-facing flows.

use std::sync::Arc;

use lazy_static::lazy_static;
use regex::Regex;
use time::{Duration, OffsetDateTime};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::{
    auth::{
        claims::{ClientContext, Identity},
        dto::{
            ChangePasswordRequest, LoginRequest, LogoutRequest, RegisterRequest,
            ResetPasswordRequest,
        },
        jwt::JwtKeys,
        lockout::LoginGuard,
        notify::{dispatch_detached, Notification, NotificationKind, Notifier},
        password::{validate_strength, PasswordHashing},
        repo::{AuthStore, PasswordChange, StoreError},
        repo_types::{
            Activity, ActivityKind, NewAccount, Role, Session, User, UserProfile,
            VerificationRecord,
        },
        sessions::SessionRegistry,
        tokens::{generate_token, AccessToken, TokenService},
        verification::{EmailVerification, VerificationLedger},
    },
    clock::Clock,
    config::AppConfig,
    error::AuthError,
};

pub const RESET_REQUESTED_MESSAGE: &str =
    "If the email exists, a password reset link has been sent";
pub const VERIFICATION_RESENT_MESSAGE: &str =
    "If the email exists and is not verified, a verification email has been sent";

pub(crate) fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

pub(crate) fn is_valid_email(email: &str) -> bool {
    lazy_static! {
        static ref EMAIL_RE: Option<Regex> = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").ok();
    }
    EMAIL_RE.as_ref().is_some_and(|re| re.is_match(email))
}

fn require_email(raw: &str) -> Result<String, AuthError> {
    let email = normalize_email(raw);
    if !is_valid_email(&email) {
        return Err(AuthError::validation("email", "must be a valid email address"));
    }
    Ok(email)
}

fn require_present(field: &str, value: &str) -> Result<String, AuthError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(AuthError::validation(field, "is required"));
    }
    Ok(value.to_string())
}

/// Credentials handed out by register, login and refresh.
#[derive(Debug, Clone)]
pub struct AuthSession {
    pub user: User,
    pub access: AccessToken,
    pub refresh: Session,
    pub issued_at: OffsetDateTime,
}

pub struct AuthService {
    store: Arc<dyn AuthStore>,
    clock: Arc<dyn Clock>,
    tokens: TokenService,
    sessions: SessionRegistry,
    ledger: VerificationLedger,
    hashing: PasswordHashing,
    guard: LoginGuard,
    notifier: Arc<dyn Notifier>,
    frontend_url: String,
}

impl AuthService {
    pub fn new(
        config: &AppConfig,
        store: Arc<dyn AuthStore>,
        clock: Arc<dyn Clock>,
        notifier: Arc<dyn Notifier>,
        hashing: PasswordHashing,
    ) -> Self {
        let tokens = TokenService::new(
            JwtKeys::new(&config.jwt),
            store.clone(),
            clock.clone(),
            Duration::minutes(config.jwt.refresh_ttl_minutes),
        );
        let sessions = SessionRegistry::new(store.clone(), tokens.clone(), clock.clone());
        let ledger = VerificationLedger::new(
            store.clone(),
            clock.clone(),
            Duration::minutes(config.security.reset_ttl_minutes),
        );
        let guard = LoginGuard::new(
            config.security.lockout_max_failures,
            Duration::minutes(config.security.lockout_minutes),
            clock.clone(),
        );
        Self {
            store,
            clock,
            tokens,
            sessions,
            ledger,
            hashing,
            guard,
            notifier,
            frontend_url: config.frontend_url.clone(),
        }
    }

    pub fn tokens(&self) -> &TokenService {
        &self.tokens
    }

    pub fn now(&self) -> OffsetDateTime {
        self.clock.now()
    }

    pub fn store_backend(&self) -> &'static str {
        self.store.backend()
    }

    pub fn sweep_lockouts(&self) -> usize {
        self.guard.sweep()
    }

    fn activity(&self, user_id: Uuid, kind: ActivityKind, client: &ClientContext) -> Activity {
        Activity {
            user_id,
            kind,
            ip_address: client.ip_address.clone(),
            user_agent: client.user_agent.clone(),
            created_at: self.clock.now(),
        }
    }

    fn notify(&self, kind: NotificationKind, recipient: &str, token: String) {
        dispatch_detached(
            self.notifier.clone(),
            Notification::new(kind, recipient, token, &self.frontend_url),
        );
    }

    #[instrument(skip(self, req, client), fields(email = %normalize_email(&req.email)))]
    pub async fn register(
        &self,
        req: RegisterRequest,
        client: &ClientContext,
    ) -> Result<AuthSession, AuthError> {
        let email = require_email(&req.email)?;
        let first_name = require_present("first_name", &req.first_name)?;
        let last_name = require_present("last_name", &req.last_name)?;
        let role: Role = req
            .role
            .parse()
            .map_err(|msg: String| AuthError::validation("role", msg))?;
        validate_strength(&req.password)?;

        if self.store.find_user_by_email(&email).await?.is_some() {
            warn!(email = %email, "email already registered");
            return Err(AuthError::EmailTaken);
        }

        let password_hash = self.hashing.hash_blocking(req.password).await?;
        let now = self.clock.now();
        let user = User {
            id: Uuid::new_v4(),
            email,
            password_hash,
            first_name,
            last_name,
            phone: req
                .phone
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty()),
            role,
            is_active: true,
            last_login: None,
            timezone: "UTC".into(),
            created_at: now,
            updated_at: now,
        };

        // Everything is minted before the single commit, so a failure here
        // leaves nothing behind.
        let email_token = generate_token()?;
        let refresh = self.tokens.mint_session(user.id, client)?;
        let access = self.tokens.issue_access_token(&user)?;
        let account = NewAccount {
            profile: UserProfile::default_for(user.id),
            verification: VerificationRecord::pending(user.id, email_token.clone()),
            session: refresh.clone(),
            activity: self.activity(user.id, ActivityKind::Register, client),
            user: user.clone(),
        };

        match self.store.create_account(&account).await {
            Ok(()) => {}
            Err(StoreError::Conflict(constraint)) if constraint.contains("email") => {
                warn!(email = %user.email, "email registered concurrently");
                return Err(AuthError::EmailTaken);
            }
            Err(e) => return Err(e.into()),
        }

        info!(user_id = %user.id, email = %user.email, role = %user.role, "user registered");
        self.notify(NotificationKind::EmailVerification, &user.email, email_token);
        Ok(AuthSession {
            user,
            access,
            refresh,
            issued_at: now,
        })
    }

    #[instrument(skip(self, req, client), fields(email = %normalize_email(&req.email)))]
    pub async fn login(
        &self,
        req: LoginRequest,
        client: &ClientContext,
    ) -> Result<AuthSession, AuthError> {
        let email = require_email(&req.email)?;
        if req.password.is_empty() {
            return Err(AuthError::validation("password", "is required"));
        }
        let attempt = self.guard.begin(&email)?;

        let Some(mut user) = self.store.find_user_by_email(&email).await? else {
            self.hashing.verify_decoy(req.password).await?;
            attempt.failed();
            warn!(email = %email, ip = %client.ip_address, "login failed: unknown email");
            return Err(AuthError::InvalidCredentials);
        };

        if !self
            .hashing
            .verify_blocking(req.password, user.password_hash.clone())
            .await?
        {
            attempt.failed();
            warn!(email = %email, ip = %client.ip_address, "login failed: wrong password");
            return Err(AuthError::InvalidCredentials);
        }

        if !user.is_active {
            warn!(user_id = %user.id, "login refused: account deactivated");
            return Err(AuthError::AccountDeactivated);
        }
        attempt.succeeded();

        let now = self.clock.now();
        let refresh = self.tokens.mint_session(user.id, client)?;
        let access = self.tokens.issue_access_token(&user)?;
        let activity = self.activity(user.id, ActivityKind::Login, client);
        self.store
            .record_login(user.id, now, &refresh, &activity)
            .await?;
        user.last_login = Some(now);
        user.updated_at = now;

        info!(user_id = %user.id, "user logged in");
        Ok(AuthSession {
            user,
            access,
            refresh,
            issued_at: now,
        })
    }

    #[instrument(skip_all)]
    pub async fn refresh(
        &self,
        refresh_token: &str,
        client: &ClientContext,
    ) -> Result<AuthSession, AuthError> {
        if refresh_token.trim().is_empty() {
            return Err(AuthError::validation("refresh_token", "is required"));
        }
        let old = self.sessions.lookup(refresh_token).await?;
        let user = self
            .store
            .find_user_by_id(old.user_id)
            .await?
            .ok_or(AuthError::RefreshTokenInvalid)?;
        if !user.is_active {
            warn!(user_id = %user.id, "refresh refused: account deactivated");
            return Err(AuthError::AccountDeactivated);
        }

        let refresh = self.sessions.rotate(&old, client).await?;
        let access = self.tokens.issue_access_token(&user)?;
        info!(user_id = %user.id, "token refreshed");
        Ok(AuthSession {
            issued_at: refresh.created_at,
            user,
            access,
            refresh,
        })
    }

    /// Idempotent; returns how many sessions were deactivated.
    #[instrument(skip(self, req, client), fields(user_id = %identity.user_id))]
    pub async fn logout(
        &self,
        identity: &Identity,
        req: LogoutRequest,
        client: &ClientContext,
    ) -> Result<u64, AuthError> {
        let revoked = if req.logout_all {
            self.sessions.revoke_all(identity.user_id).await?
        } else if let Some(token) = req.refresh_token.filter(|t| !t.is_empty()) {
            self.sessions.revoke_one(&token, identity.user_id).await?
        } else {
            self.sessions
                .revoke_by_client_fingerprint(identity.user_id, client)
                .await?
        };

        self.store
            .log_activity(&self.activity(identity.user_id, ActivityKind::Logout, client))
            .await?;
        info!(user_id = %identity.user_id, revoked, logout_all = req.logout_all, "user logged out");
        Ok(revoked)
    }

    /// Outcome is invisible to the caller; only the store differs.
    #[instrument(skip(self, client))]
    pub async fn forgot_password(&self, email: &str, client: &ClientContext) -> Result<(), AuthError> {
        let email = require_email(email)?;
        let user = match self.store.find_user_by_email(&email).await? {
            Some(user) if user.is_active => user,
            _ => {
                info!("password reset requested for unknown or inactive account");
                return Ok(());
            }
        };

        let (token, expires_at) = self.ledger.issue_reset_token(user.id).await?;
        self.store
            .log_activity(&self.activity(user.id, ActivityKind::PasswordResetRequested, client))
            .await?;
        info!(user_id = %user.id, expires_at = %expires_at, "password reset token issued");
        self.notify(NotificationKind::PasswordReset, &user.email, token);
        Ok(())
    }

    #[instrument(skip_all)]
    pub async fn reset_password(
        &self,
        req: ResetPasswordRequest,
        client: &ClientContext,
    ) -> Result<(), AuthError> {
        if req.new_password != req.confirm_password {
            return Err(AuthError::PasswordMismatch);
        }
        validate_strength(&req.new_password)?;
        self.ledger.check_reset_token(&req.token).await?;

        let new_hash = self.hashing.hash_blocking(req.new_password).await?;
        let user_id = self
            .ledger
            .consume_reset_token(&req.token, new_hash, client)
            .await?;
        // A completed reset also lifts any login lockout.
        if let Some(user) = self.store.find_user_by_id(user_id).await? {
            self.guard.record_success(&user.email);
        }
        Ok(())
    }

    /// Sessions opened from the caller's current IP survive.
    #[instrument(skip(self, req, client), fields(user_id = %identity.user_id))]
    pub async fn change_password(
        &self,
        identity: &Identity,
        req: ChangePasswordRequest,
        client: &ClientContext,
    ) -> Result<u64, AuthError> {
        if req.current_password.is_empty() {
            return Err(AuthError::validation("current_password", "is required"));
        }
        validate_strength(&req.new_password)?;

        let user = self
            .store
            .find_user_by_id(identity.user_id)
            .await?
            .ok_or(AuthError::UserNotFound)?;
        if !self
            .hashing
            .verify_blocking(req.current_password, user.password_hash.clone())
            .await?
        {
            warn!(user_id = %user.id, "password change refused: current password incorrect");
            return Err(AuthError::CurrentPasswordIncorrect);
        }

        let new_password_hash = self.hashing.hash_blocking(req.new_password).await?;
        let change = PasswordChange {
            user_id: user.id,
            new_password_hash,
            keep_ip: client.ip_address.clone(),
            now: self.clock.now(),
            activity: self.activity(user.id, ActivityKind::PasswordChanged, client),
        };
        let revoked = self.store.change_password(&change).await?;
        info!(user_id = %user.id, revoked, "password changed");
        Ok(revoked)
    }

    #[instrument(skip_all)]
    pub async fn verify_email(
        &self,
        token: &str,
        client: &ClientContext,
    ) -> Result<EmailVerification, AuthError> {
        if token.trim().is_empty() {
            return Err(AuthError::validation("token", "is required"));
        }
        self.ledger.consume_email_token(token, client).await
    }

    /// Same outcome for unknown, verified and pending accounts.
    #[instrument(skip(self, client))]
    pub async fn resend_verification(
        &self,
        email: &str,
        client: &ClientContext,
    ) -> Result<(), AuthError> {
        let email = require_email(email)?;
        let Some(user) = self.store.find_user_by_email(&email).await? else {
            return Ok(());
        };
        let verified = self
            .store
            .find_verification(user.id)
            .await?
            .is_some_and(|record| record.email_verified);
        if verified || !user.is_active {
            return Ok(());
        }

        let token = self.ledger.issue_email_token(user.id).await?;
        self.store
            .log_activity(&self.activity(user.id, ActivityKind::VerificationEmailResent, client))
            .await?;
        info!(user_id = %user.id, "verification email re-issued");
        self.notify(NotificationKind::EmailVerification, &user.email, token);
        Ok(())
    }

    pub async fn profile(&self, identity: &Identity) -> Result<User, AuthError> {
        self.store
            .find_user_by_id(identity.user_id)
            .await?
            .ok_or(AuthError::UserNotFound)
    }

    pub async fn set_account_active(&self, user_id: Uuid, active: bool) -> Result<(), AuthError> {
        if !self
            .store
            .set_user_active(user_id, active, self.clock.now())
            .await?
        {
            return Err(AuthError::UserNotFound);
        }
        if !active {
            self.sessions.revoke_all(user_id).await?;
        }
        info!(user_id = %user_id, active, "account activity flag changed");
        Ok(())
    }
}

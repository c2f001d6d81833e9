use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// Closed set of platform roles carried in the access token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Customer,
    BusinessOwner,
    Staff,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Customer => "customer",
            Role::BusinessOwner => "business_owner",
            Role::Staff => "staff",
            Role::Admin => "admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "customer" => Ok(Role::Customer),
            "business_owner" => Ok(Role::BusinessOwner),
            "staff" => Ok(Role::Staff),
            "admin" => Ok(Role::Admin),
            other => Err(format!(
                "unknown role '{other}', expected one of customer, business_owner, staff, admin"
            )),
        }
    }
}

/// User record in the store.
#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub id: Uuid,
    pub email: String, // normalized, unique
    #[serde(skip_serializing)]
    pub password_hash: String, // Argon2 PHC string, never exposed
    pub first_name: String,
    pub last_name: String,
    pub phone: Option<String>,
    pub role: Role,
    pub is_active: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_login: Option<OffsetDateTime>,
    pub timezone: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Preferences row created alongside every new user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserProfile {
    pub user_id: Uuid,
    pub email_notifications: bool,
    pub sms_notifications: bool,
    pub push_notifications: bool,
    pub preferred_language: String,
    pub currency: String,
}

impl UserProfile {
    pub fn default_for(user_id: Uuid) -> Self {
        Self {
            user_id,
            email_notifications: true,
            sms_notifications: false,
            push_notifications: true,
            preferred_language: "en".into(),
            currency: "USD".into(),
        }
    }
}

/// One refresh-token session (one logged-in device). Never deleted, only deactivated.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: Uuid,
    pub user_id: Uuid,
    pub token: String,
    pub expires_at: OffsetDateTime,
    pub ip_address: String,
    pub user_agent: String,
    pub is_active: bool,
    pub created_at: OffsetDateTime,
}

impl Session {
    /// Valid iff active and not yet expired at `now`.
    pub fn is_valid_at(&self, now: OffsetDateTime) -> bool {
        self.is_active && now < self.expires_at
    }
}

/// Per-user holder of the outstanding email-verification and password-reset tokens.
#[derive(Debug, Clone, Default)]
pub struct VerificationRecord {
    pub user_id: Uuid,
    pub email_verified: bool,
    pub email_token: Option<String>,
    pub verified_at: Option<OffsetDateTime>,
    pub password_reset_token: Option<String>,
    pub password_reset_expiry: Option<OffsetDateTime>,
}

impl VerificationRecord {
    pub fn pending(user_id: Uuid, email_token: String) -> Self {
        Self {
            user_id,
            email_token: Some(email_token),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityKind {
    Register,
    Login,
    TokenRefresh,
    Logout,
    PasswordResetRequested,
    PasswordResetCompleted,
    PasswordChanged,
    EmailVerified,
    VerificationEmailResent,
}

impl ActivityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityKind::Register => "register",
            ActivityKind::Login => "login",
            ActivityKind::TokenRefresh => "token_refresh",
            ActivityKind::Logout => "logout",
            ActivityKind::PasswordResetRequested => "password_reset_requested",
            ActivityKind::PasswordResetCompleted => "password_reset_completed",
            ActivityKind::PasswordChanged => "password_changed",
            ActivityKind::EmailVerified => "email_verified",
            ActivityKind::VerificationEmailResent => "verification_email_resent",
        }
    }
}

/// Append-only audit entry.
#[derive(Debug, Clone)]
pub struct Activity {
    pub user_id: Uuid,
    pub kind: ActivityKind,
    pub ip_address: String,
    pub user_agent: String,
    pub created_at: OffsetDateTime,
}

impl Activity {
    pub fn metadata(&self) -> serde_json::Value {
        serde_json::json!({
            "ip_address": self.ip_address,
            "user_agent": self.user_agent,
        })
    }
}

/// Everything registration writes, committed as one unit.
#[derive(Debug, Clone)]
pub struct NewAccount {
    pub user: User,
    pub profile: UserProfile,
    pub verification: VerificationRecord,
    pub session: Session,
    pub activity: Activity,
}

/// Which sessions of a user a revocation touches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RevokeScope {
    All,
    Token(String),
    Fingerprint { ip_address: String, user_agent: String },
    /// Every session created from an IP other than this one.
    OtherThanIp(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    #[test]
    fn role_parses_closed_set_only() {
        assert_eq!("business_owner".parse::<Role>(), Ok(Role::BusinessOwner));
        assert_eq!("admin".parse::<Role>(), Ok(Role::Admin));
        assert!("root".parse::<Role>().is_err());
        assert_eq!(Role::Staff.to_string(), "staff");
    }

    #[test]
    fn session_validity_requires_active_and_unexpired() {
        let now = OffsetDateTime::now_utc();
        let mut session = Session {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            token: "t".into(),
            expires_at: now + Duration::days(7),
            ip_address: "127.0.0.1".into(),
            user_agent: "test".into(),
            is_active: true,
            created_at: now,
        };
        assert!(session.is_valid_at(now));
        assert!(!session.is_valid_at(now + Duration::days(7)));

        session.is_active = false;
        assert!(!session.is_valid_at(now));
    }

    #[test]
    fn user_serialization_hides_password_hash() {
        let now = OffsetDateTime::now_utc();
        let user = User {
            id: Uuid::new_v4(),
            email: "a@b.com".into(),
            password_hash: "$argon2id$secret".into(),
            first_name: "Ada".into(),
            last_name: "Lovelace".into(),
            phone: None,
            role: Role::Customer,
            is_active: true,
            last_login: None,
            timezone: "UTC".into(),
            created_at: now,
            updated_at: now,
        };
        let json = serde_json::to_string(&user).expect("serialize user");
        assert!(json.contains("a@b.com"));
        assert!(!json.contains("argon2"));
        assert!(!json.contains("password_hash"));
    }
}

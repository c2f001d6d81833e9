//! Postgres-backed `AuthStore`.

use anyhow::Context;
use async_trait::async_trait;
use sqlx::{postgres::PgPoolOptions, FromRow, PgConnection, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::auth::repo::{AuthStore, PasswordChange, PasswordReset, StoreError};
use crate::auth::repo_types::{
    Activity, NewAccount, RevokeScope, Session, User, VerificationRecord,
};

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &err {
            if db.code().as_deref() == Some("23505") {
                return StoreError::Conflict(db.constraint().unwrap_or("unique").to_string());
            }
        }
        StoreError::Backend(err.to_string())
    }
}

#[derive(Debug, FromRow)]
struct UserRow {
    id: Uuid,
    email: String,
    password_hash: String,
    first_name: String,
    last_name: String,
    phone: Option<String>,
    role: String,
    is_active: bool,
    last_login: Option<OffsetDateTime>,
    timezone: String,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<UserRow> for User {
    type Error = StoreError;

    fn try_from(row: UserRow) -> Result<Self, Self::Error> {
        Ok(User {
            role: row.role.parse().map_err(StoreError::Backend)?,
            id: row.id,
            email: row.email,
            password_hash: row.password_hash,
            first_name: row.first_name,
            last_name: row.last_name,
            phone: row.phone,
            is_active: row.is_active,
            last_login: row.last_login,
            timezone: row.timezone,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct SessionRow {
    id: Uuid,
    user_id: Uuid,
    session_token: String,
    expires_at: OffsetDateTime,
    ip_address: String,
    user_agent: String,
    is_active: bool,
    created_at: OffsetDateTime,
}

impl From<SessionRow> for Session {
    fn from(row: SessionRow) -> Self {
        Session {
            id: row.id,
            user_id: row.user_id,
            token: row.session_token,
            expires_at: row.expires_at,
            ip_address: row.ip_address,
            user_agent: row.user_agent,
            is_active: row.is_active,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct VerificationRow {
    user_id: Uuid,
    email_verified: bool,
    email_token: Option<String>,
    verified_at: Option<OffsetDateTime>,
    password_reset_token: Option<String>,
    password_reset_expiry: Option<OffsetDateTime>,
}

impl From<VerificationRow> for VerificationRecord {
    fn from(row: VerificationRow) -> Self {
        VerificationRecord {
            user_id: row.user_id,
            email_verified: row.email_verified,
            email_token: row.email_token,
            verified_at: row.verified_at,
            password_reset_token: row.password_reset_token,
            password_reset_expiry: row.password_reset_expiry,
        }
    }
}

const USER_COLUMNS: &str = "id, email, password_hash, first_name, last_name, phone, role, \
                            is_active, last_login, timezone, created_at, updated_at";
const SESSION_COLUMNS: &str =
    "id, user_id, session_token, expires_at, ip_address, user_agent, is_active, created_at";
const VERIFICATION_COLUMNS: &str = "user_id, email_verified, email_token, verified_at, \
                                    password_reset_token, password_reset_expiry";

async fn insert_session(conn: &mut PgConnection, session: &Session) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO user_sessions
            (id, user_id, session_token, expires_at, ip_address, user_agent, is_active, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(session.id)
    .bind(session.user_id)
    .bind(&session.token)
    .bind(session.expires_at)
    .bind(&session.ip_address)
    .bind(&session.user_agent)
    .bind(session.is_active)
    .bind(session.created_at)
    .execute(conn)
    .await?;
    Ok(())
}

async fn insert_activity(conn: &mut PgConnection, activity: &Activity) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO user_activities (user_id, activity, metadata, created_at)
        VALUES ($1, $2, $3, $4)
        "#,
    )
    .bind(activity.user_id)
    .bind(activity.kind.as_str())
    .bind(activity.metadata())
    .bind(activity.created_at)
    .execute(conn)
    .await?;
    Ok(())
}

async fn revoke(conn: &mut PgConnection, user_id: Uuid, scope: &RevokeScope) -> Result<u64, StoreError> {
    let result = match scope {
        RevokeScope::All => {
            sqlx::query(
                "UPDATE user_sessions SET is_active = FALSE WHERE user_id = $1 AND is_active",
            )
            .bind(user_id)
            .execute(conn)
            .await?
        }
        RevokeScope::Token(token) => {
            sqlx::query(
                r#"
                UPDATE user_sessions SET is_active = FALSE
                WHERE user_id = $1 AND session_token = $2 AND is_active
                "#,
            )
            .bind(user_id)
            .bind(token)
            .execute(conn)
            .await?
        }
        RevokeScope::Fingerprint {
            ip_address,
            user_agent,
        } => {
            sqlx::query(
                r#"
                UPDATE user_sessions SET is_active = FALSE
                WHERE user_id = $1 AND ip_address = $2 AND user_agent = $3 AND is_active
                "#,
            )
            .bind(user_id)
            .bind(ip_address)
            .bind(user_agent)
            .execute(conn)
            .await?
        }
        RevokeScope::OtherThanIp(ip) => {
            sqlx::query(
                r#"
                UPDATE user_sessions SET is_active = FALSE
                WHERE user_id = $1 AND ip_address <> $2 AND is_active
                "#,
            )
            .bind(user_id)
            .bind(ip)
            .execute(conn)
            .await?
        }
    };
    Ok(result.rows_affected())
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .context("connect to database")?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("run migrations")?;
        Ok(())
    }
}

#[async_trait]
impl AuthStore for PgStore {
    fn backend(&self) -> &'static str {
        "postgres"
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        let row = sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE email = $1"
        ))
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;
        row.map(User::try_from).transpose()
    }

    async fn find_user_by_id(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        let row = sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(User::try_from).transpose()
    }

    async fn create_account(&self, account: &NewAccount) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let user = &account.user;

        sqlx::query(
            r#"
            INSERT INTO users
                (id, email, password_hash, first_name, last_name, phone, role,
                 is_active, last_login, timezone, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(user.id)
        .bind(&user.email)
        .bind(&user.password_hash)
        .bind(&user.first_name)
        .bind(&user.last_name)
        .bind(&user.phone)
        .bind(user.role.as_str())
        .bind(user.is_active)
        .bind(user.last_login)
        .bind(&user.timezone)
        .bind(user.created_at)
        .bind(user.updated_at)
        .execute(&mut *tx)
        .await?;

        let profile = &account.profile;
        sqlx::query(
            r#"
            INSERT INTO user_profiles
                (user_id, email_notifications, sms_notifications, push_notifications,
                 preferred_language, currency)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(profile.user_id)
        .bind(profile.email_notifications)
        .bind(profile.sms_notifications)
        .bind(profile.push_notifications)
        .bind(&profile.preferred_language)
        .bind(&profile.currency)
        .execute(&mut *tx)
        .await?;

        let verification = &account.verification;
        sqlx::query(
            r#"
            INSERT INTO user_verifications (user_id, email_verified, email_token)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(verification.user_id)
        .bind(verification.email_verified)
        .bind(&verification.email_token)
        .execute(&mut *tx)
        .await?;

        insert_session(&mut tx, &account.session).await?;
        insert_activity(&mut tx, &account.activity).await?;

        tx.commit().await?;
        Ok(())
    }

    async fn set_user_active(
        &self,
        user_id: Uuid,
        active: bool,
        at: OffsetDateTime,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query("UPDATE users SET is_active = $2, updated_at = $3 WHERE id = $1")
            .bind(user_id)
            .bind(active)
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn record_login(
        &self,
        user_id: Uuid,
        at: OffsetDateTime,
        session: &Session,
        activity: &Activity,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE users SET last_login = $2, updated_at = $2 WHERE id = $1")
            .bind(user_id)
            .bind(at)
            .execute(&mut *tx)
            .await?;
        insert_session(&mut tx, session).await?;
        insert_activity(&mut tx, activity).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn insert_session(&self, session: &Session) -> Result<(), StoreError> {
        let mut conn = self.pool.acquire().await?;
        insert_session(&mut conn, session).await
    }

    async fn find_session(&self, token: &str) -> Result<Option<Session>, StoreError> {
        let row = sqlx::query_as::<_, SessionRow>(&format!(
            "SELECT {SESSION_COLUMNS} FROM user_sessions WHERE session_token = $1"
        ))
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Session::from))
    }

    async fn rotate_session(
        &self,
        old_token: &str,
        replacement: &Session,
        activity: &Activity,
    ) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;
        let claimed = sqlx::query(
            r#"
            UPDATE user_sessions SET is_active = FALSE
            WHERE session_token = $1 AND is_active AND expires_at > $2
            "#,
        )
        .bind(old_token)
        .bind(replacement.created_at)
        .execute(&mut *tx)
        .await?;

        if claimed.rows_affected() != 1 {
            tx.rollback().await?;
            return Ok(false);
        }

        insert_session(&mut tx, replacement).await?;
        insert_activity(&mut tx, activity).await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn revoke_sessions(&self, user_id: Uuid, scope: &RevokeScope) -> Result<u64, StoreError> {
        let mut conn = self.pool.acquire().await?;
        revoke(&mut conn, user_id, scope).await
    }

    async fn find_verification(
        &self,
        user_id: Uuid,
    ) -> Result<Option<VerificationRecord>, StoreError> {
        let row = sqlx::query_as::<_, VerificationRow>(&format!(
            "SELECT {VERIFICATION_COLUMNS} FROM user_verifications WHERE user_id = $1"
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(VerificationRecord::from))
    }

    async fn find_verification_by_email_token(
        &self,
        token: &str,
    ) -> Result<Option<VerificationRecord>, StoreError> {
        let row = sqlx::query_as::<_, VerificationRow>(&format!(
            "SELECT {VERIFICATION_COLUMNS} FROM user_verifications WHERE email_token = $1"
        ))
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(VerificationRecord::from))
    }

    async fn find_verification_by_reset_token(
        &self,
        token: &str,
    ) -> Result<Option<VerificationRecord>, StoreError> {
        let row = sqlx::query_as::<_, VerificationRow>(&format!(
            "SELECT {VERIFICATION_COLUMNS} FROM user_verifications WHERE password_reset_token = $1"
        ))
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(VerificationRecord::from))
    }

    async fn set_email_token(&self, user_id: Uuid, token: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO user_verifications (user_id, email_token)
            VALUES ($1, $2)
            ON CONFLICT (user_id) DO UPDATE SET email_token = EXCLUDED.email_token
            "#,
        )
        .bind(user_id)
        .bind(token)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_email_verified(
        &self,
        user_id: Uuid,
        token: &str,
        at: OffsetDateTime,
        activity: &Activity,
    ) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query(
            r#"
            UPDATE user_verifications
            SET email_verified = TRUE, verified_at = $3, email_token = NULL
            WHERE user_id = $1 AND email_token = $2
            "#,
        )
        .bind(user_id)
        .bind(token)
        .bind(at)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() != 1 {
            tx.rollback().await?;
            return Ok(false);
        }
        insert_activity(&mut tx, activity).await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn set_reset_token(
        &self,
        user_id: Uuid,
        token: &str,
        expires_at: OffsetDateTime,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO user_verifications (user_id, password_reset_token, password_reset_expiry)
            VALUES ($1, $2, $3)
            ON CONFLICT (user_id) DO UPDATE
            SET password_reset_token = EXCLUDED.password_reset_token,
                password_reset_expiry = EXCLUDED.password_reset_expiry
            "#,
        )
        .bind(user_id)
        .bind(token)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn complete_password_reset(&self, reset: &PasswordReset) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;
        let claimed = sqlx::query(
            r#"
            UPDATE user_verifications
            SET password_reset_token = NULL, password_reset_expiry = NULL
            WHERE user_id = $1 AND password_reset_token = $2 AND password_reset_expiry > $3
            "#,
        )
        .bind(reset.user_id)
        .bind(&reset.token)
        .bind(reset.now)
        .execute(&mut *tx)
        .await?;

        if claimed.rows_affected() != 1 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query("UPDATE users SET password_hash = $2, updated_at = $3 WHERE id = $1")
            .bind(reset.user_id)
            .bind(&reset.new_password_hash)
            .bind(reset.now)
            .execute(&mut *tx)
            .await?;
        revoke(&mut tx, reset.user_id, &RevokeScope::All).await?;
        insert_activity(&mut tx, &reset.activity).await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn change_password(&self, change: &PasswordChange) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE users SET password_hash = $2, updated_at = $3 WHERE id = $1")
            .bind(change.user_id)
            .bind(&change.new_password_hash)
            .bind(change.now)
            .execute(&mut *tx)
            .await?;
        let revoked = revoke(
            &mut tx,
            change.user_id,
            &RevokeScope::OtherThanIp(change.keep_ip.clone()),
        )
        .await?;
        insert_activity(&mut tx, &change.activity).await?;
        tx.commit().await?;
        Ok(revoked)
    }

    async fn log_activity(&self, activity: &Activity) -> Result<(), StoreError> {
        let mut conn = self.pool.acquire().await?;
        insert_activity(&mut conn, activity).await
    }
}

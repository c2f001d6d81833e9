use std::{net::IpAddr, str::FromStr};

use anyhow::Context;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct JwtConfig {
    pub secret: String,
    pub issuer: String,
    pub audience: String,
    pub ttl_minutes: i64,
    pub refresh_ttl_minutes: i64,
}

/// Lifetimes and thresholds of the abuse controls and one-time tokens.
#[derive(Debug, Clone, Deserialize)]
pub struct SecurityConfig {
    pub reset_ttl_minutes: i64,
    pub lockout_max_failures: usize,
    pub lockout_minutes: i64,
    pub rate_limit_sweep_secs: u64,
    /// Peers allowed to name the client through forwarding headers.
    pub trusted_proxies: Vec<IpAddr>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            reset_ttl_minutes: 60,
            lockout_max_failures: 5,
            lockout_minutes: 15,
            rate_limit_sweep_secs: 60,
            trusted_proxies: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    /// In-memory store when unset.
    pub database_url: Option<String>,
    pub frontend_url: String,
    pub jwt: JwtConfig,
    pub security: SecurityConfig,
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

/// Comma-separated addresses; entries that do not parse are skipped.
fn parse_ip_list(raw: &str) -> Vec<IpAddr> {
    raw.split(',')
        .filter_map(|entry| entry.trim().parse().ok())
        .collect()
}

impl AppConfig {
    /// Defaults for everything except the signing secret.
    pub fn with_jwt_secret(secret: impl Into<String>) -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
            database_url: None,
            frontend_url: "http://localhost:3000".into(),
            jwt: JwtConfig {
                secret: secret.into(),
                issuer: "booking-auth".into(),
                audience: "booking-platform".into(),
                ttl_minutes: 15,
                refresh_ttl_minutes: 60 * 24 * 7,
            },
            security: SecurityConfig::default(),
        }
    }

    pub fn from_env() -> anyhow::Result<Self> {
        let secret = std::env::var("JWT_SECRET").context("JWT_SECRET must be set")?;
        if secret.trim().is_empty() {
            anyhow::bail!("JWT_SECRET must not be empty");
        }
        let defaults = Self::with_jwt_secret(secret);

        let jwt = JwtConfig {
            issuer: std::env::var("JWT_ISSUER").unwrap_or(defaults.jwt.issuer),
            audience: std::env::var("JWT_AUDIENCE").unwrap_or(defaults.jwt.audience),
            ttl_minutes: env_or("JWT_TTL_MINUTES", defaults.jwt.ttl_minutes),
            refresh_ttl_minutes: env_or("REFRESH_TTL_MINUTES", defaults.jwt.refresh_ttl_minutes),
            secret: defaults.jwt.secret,
        };
        let security = SecurityConfig {
            reset_ttl_minutes: env_or("RESET_TTL_MINUTES", defaults.security.reset_ttl_minutes),
            lockout_max_failures: env_or(
                "LOCKOUT_MAX_FAILURES",
                defaults.security.lockout_max_failures,
            ),
            lockout_minutes: env_or("LOCKOUT_MINUTES", defaults.security.lockout_minutes),
            rate_limit_sweep_secs: env_or(
                "RATE_LIMIT_SWEEP_SECS",
                defaults.security.rate_limit_sweep_secs,
            ),
            trusted_proxies: std::env::var("TRUSTED_PROXIES")
                .map(|raw| parse_ip_list(&raw))
                .unwrap_or(defaults.security.trusted_proxies),
        };

        Ok(Self {
            host: std::env::var("APP_HOST").unwrap_or(defaults.host),
            port: env_or("APP_PORT", defaults.port),
            database_url: std::env::var("DATABASE_URL")
                .ok()
                .filter(|url| !url.trim().is_empty()),
            frontend_url: std::env::var("FRONTEND_URL").unwrap_or(defaults.frontend_url),
            jwt,
            security,
        })
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

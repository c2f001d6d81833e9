//! Sliding-window admission control per (endpoint, client IP).

use std::{collections::VecDeque, fmt, sync::Arc};

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use dashmap::DashMap;
use time::{Duration, OffsetDateTime};
use tracing::{debug, warn};

use crate::{
    auth::extractors::{peer_addr, TrustedProxies},
    clock::Clock,
    error::AuthError,
};

/// Credential-sensitive endpoints, each with its own limit and window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Register,
    Login,
    Refresh,
    ForgotPassword,
    ResetPassword,
    VerifyEmail,
    ResendVerification,
    Logout,
    ChangePassword,
}

impl Endpoint {
    pub fn as_str(&self) -> &'static str {
        match self {
            Endpoint::Register => "register",
            Endpoint::Login => "login",
            Endpoint::Refresh => "refresh",
            Endpoint::ForgotPassword => "forgot-password",
            Endpoint::ResetPassword => "reset-password",
            Endpoint::VerifyEmail => "verify-email",
            Endpoint::ResendVerification => "resend-verification",
            Endpoint::Logout => "logout",
            Endpoint::ChangePassword => "change-password",
        }
    }

    /// (requests allowed, window length)
    pub fn policy(&self) -> (usize, Duration) {
        match self {
            Endpoint::Register => (5, Duration::minutes(10)),
            Endpoint::Login => (5, Duration::minutes(15)),
            Endpoint::ForgotPassword => (3, Duration::hours(1)),
            Endpoint::ResetPassword => (5, Duration::minutes(10)),
            Endpoint::ResendVerification => (3, Duration::minutes(10)),
            Endpoint::Refresh
            | Endpoint::VerifyEmail
            | Endpoint::Logout
            | Endpoint::ChangePassword => (10, Duration::minutes(5)),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allowed,
    Limited { retry_after: u64 },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed)
    }
}

#[derive(Debug)]
struct RequestWindow {
    length: Duration,
    timestamps: VecDeque<OffsetDateTime>,
}

impl RequestWindow {
    fn prune(&mut self, now: OffsetDateTime) {
        let cutoff = now - self.length;
        while self.timestamps.front().is_some_and(|ts| *ts <= cutoff) {
            self.timestamps.pop_front();
        }
    }

    fn retry_after(&self, now: OffsetDateTime) -> u64 {
        let Some(oldest) = self.timestamps.front() else {
            return 1;
        };
        let wait = (*oldest + self.length - now).as_seconds_f64().ceil();
        (wait as u64).max(1)
    }
}

/// Windows live in a `DashMap`; the entry guard serialises the
/// prune-count-record sequence for one key.
pub struct RateLimiter {
    windows: DashMap<(String, String), RequestWindow>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            windows: DashMap::new(),
            clock,
        }
    }

    fn admit(&self, scope: String, identity: &str, limit: usize, length: Duration) -> Decision {
        let now = self.clock.now();
        let mut window = self
            .windows
            .entry((scope, identity.to_string()))
            .or_insert_with(|| RequestWindow {
                length,
                timestamps: VecDeque::new(),
            });
        window.prune(now);

        if window.timestamps.len() < limit {
            window.timestamps.push_back(now);
            Decision::Allowed
        } else {
            Decision::Limited {
                retry_after: window.retry_after(now),
            }
        }
    }

    /// Generic form: one independent window per (limit, window) pair.
    pub fn allow(&self, identity: &str, limit: usize, window: Duration) -> bool {
        let scope = format!("{limit}/{}", window.whole_milliseconds());
        self.admit(scope, identity, limit, window).is_allowed()
    }

    pub fn check(&self, endpoint: Endpoint, identity: &str) -> Decision {
        let (limit, window) = endpoint.policy();
        self.admit(endpoint.as_str().to_string(), identity, limit, window)
    }

    /// Drops identities whose window has emptied. Returns how many.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let before = self.windows.len();
        self.windows.retain(|_, window| {
            window.prune(now);
            !window.timestamps.is_empty()
        });
        let removed = before.saturating_sub(self.windows.len());
        debug!(removed, tracked = self.windows.len(), "rate limiter swept");
        removed
    }

    pub fn tracked(&self) -> usize {
        self.windows.len()
    }
}

/// Route-layer middleware: admits or rejects before the handler runs.
pub async fn enforce(
    State((limiter, proxies, endpoint)): State<(
        Arc<RateLimiter>,
        Arc<TrustedProxies>,
        Endpoint,
    )>,
    request: Request,
    next: Next,
) -> Response {
    let ip = proxies.client_ip(request.headers(), peer_addr(request.extensions()));

    match limiter.check(endpoint, &ip) {
        Decision::Allowed => next.run(request).await,
        Decision::Limited { retry_after } => {
            warn!(endpoint = %endpoint, ip = %ip, retry_after, "rate limit exceeded");
            AuthError::RateLimited { retry_after }.into_response()
        }
    }
}

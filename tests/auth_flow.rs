use std::{net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use axum::{
    body::Body,
    extract::ConnectInfo,
    http::{header, HeaderMap, Method, Request, StatusCode},
    Router,
};
use booking_auth::{
    app::build_app,
    auth::{
        notify::{Notification, NotificationKind, Notifier},
        password::PasswordHashing,
        repo_memory::MemoryStore,
    },
    clock::ManualClock,
    config::AppConfig,
    state::AppState,
};
use serde_json::{json, Value};
use time::Duration;
use tokio::sync::{mpsc, Mutex};
use tower::ServiceExt;

struct ChannelNotifier(mpsc::UnboundedSender<Notification>);

#[async_trait]
impl Notifier for ChannelNotifier {
    async fn dispatch(&self, notification: Notification) -> anyhow::Result<()> {
        self.0.send(notification)?;
        Ok(())
    }
}

struct TestApp {
    router: Router,
    clock: ManualClock,
    store: Arc<MemoryStore>,
    outbox: Mutex<mpsc::UnboundedReceiver<Notification>>,
}

struct Reply {
    status: StatusCode,
    headers: HeaderMap,
    body: Value,
}

impl TestApp {
    fn new() -> Self {
        Self::with_config(AppConfig::with_jwt_secret("integration-secret"))
    }

    fn with_config(config: AppConfig) -> Self {
        let clock = ManualClock::starting_now();
        let store = Arc::new(MemoryStore::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let state = AppState::from_parts(
            config,
            store.clone(),
            Arc::new(clock.clone()),
            Arc::new(ChannelNotifier(tx)),
            PasswordHashing::fast_insecure(),
        );
        Self {
            router: build_app(state),
            clock,
            store,
            outbox: Mutex::new(rx),
        }
    }

    /// `peer` is the socket address the request arrives from.
    async fn call(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        bearer: Option<&str>,
        peer: &str,
    ) -> Reply {
        self.call_with_headers(method, uri, body, bearer, peer, &[])
            .await
    }

    async fn call_with_headers(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        bearer: Option<&str>,
        peer: &str,
        headers: &[(&str, &str)],
    ) -> Reply {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::USER_AGENT, "integration-test");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        if let Some(token) = bearer {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        let mut request = match body {
            Some(json) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json.to_string()))
                .expect("request"),
            None => builder.body(Body::empty()).expect("request"),
        };
        let peer: SocketAddr = format!("{peer}:40000").parse().expect("peer address");
        request.extensions_mut().insert(ConnectInfo(peer));

        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("router is infallible");
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("read body");
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).expect("json body")
        };
        Reply {
            status,
            headers,
            body,
        }
    }

    async fn post(&self, uri: &str, body: Value, ip: &str) -> Reply {
        self.call(Method::POST, uri, Some(body), None, ip).await
    }

    async fn next_notification(&self, kind: NotificationKind) -> Notification {
        let mut outbox = self.outbox.lock().await;
        loop {
            let note = outbox.recv().await.expect("notification");
            if note.kind == kind {
                return note;
            }
        }
    }

    async fn register(&self, email: &str, ip: &str) -> Reply {
        self.post(
            "/api/v1/auth/register",
            json!({
                "email": email,
                "password": "Abcdef1!",
                "first_name": "Ada",
                "last_name": "Lovelace",
                "role": "customer"
            }),
            ip,
        )
        .await
    }
}

fn token(reply: &Reply, field: &str) -> String {
    reply.body["data"][field]
        .as_str()
        .unwrap_or_else(|| panic!("{field} missing in {}", reply.body))
        .to_string()
}

#[tokio::test]
async fn register_login_refresh_logout_all() {
    let app = TestApp::new();
    let ip = "203.0.113.1";

    let registered = app.register("a@b.com", ip).await;
    assert_eq!(registered.status, StatusCode::CREATED);
    assert_eq!(registered.body["success"], true);
    assert_eq!(registered.body["data"]["token_type"], "Bearer");
    assert_eq!(registered.body["data"]["expires_in"], 900);
    assert_eq!(registered.body["data"]["user"]["email"], "a@b.com");
    assert!(registered.body["data"]["user"].get("password_hash").is_none());

    let login = app
        .post(
            "/api/v1/auth/login",
            json!({"email": "a@b.com", "password": "Abcdef1!"}),
            ip,
        )
        .await;
    assert_eq!(login.status, StatusCode::OK);
    let login_refresh = token(&login, "refresh_token");
    assert_ne!(login_refresh, token(&registered, "refresh_token"));

    let refreshed = app
        .post(
            "/api/v1/auth/refresh",
            json!({"refresh_token": login_refresh}),
            ip,
        )
        .await;
    assert_eq!(refreshed.status, StatusCode::OK);
    let newest_refresh = token(&refreshed, "refresh_token");
    let newest_access = token(&refreshed, "access_token");

    let replay = app
        .post(
            "/api/v1/auth/refresh",
            json!({"refresh_token": login_refresh}),
            ip,
        )
        .await;
    assert_eq!(replay.status, StatusCode::UNAUTHORIZED);
    assert_eq!(replay.body["error"], "Refresh token expired");

    let logout = app
        .call(
            Method::POST,
            "/api/v1/auth/logout",
            Some(json!({"logout_all": true})),
            Some(&newest_access),
            ip,
        )
        .await;
    assert_eq!(logout.status, StatusCode::OK);

    let after_logout = app
        .post(
            "/api/v1/auth/refresh",
            json!({"refresh_token": newest_refresh}),
            ip,
        )
        .await;
    assert_eq!(after_logout.status, StatusCode::UNAUTHORIZED);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_refresh_has_exactly_one_winner() {
    let app = Arc::new(TestApp::new());
    let registered = app.register("race@b.com", "203.0.113.2").await;
    let refresh = token(&registered, "refresh_token");

    let attempts: Vec<_> = (0..2)
        .map(|i| {
            let app = app.clone();
            let refresh = refresh.clone();
            tokio::spawn(async move {
                app.post(
                    "/api/v1/auth/refresh",
                    json!({"refresh_token": refresh}),
                    &format!("198.51.100.{i}"),
                )
                .await
            })
        })
        .collect();

    let mut statuses = Vec::new();
    for attempt in attempts {
        let reply = attempt.await.expect("task");
        if reply.status == StatusCode::UNAUTHORIZED {
            assert_eq!(reply.body["error"], "Refresh token expired");
        }
        statuses.push(reply.status);
    }
    statuses.sort();
    assert_eq!(statuses, vec![StatusCode::OK, StatusCode::UNAUTHORIZED]);
}

#[tokio::test]
async fn forgot_password_is_enumeration_resistant() {
    let app = TestApp::new();
    app.register("real@x.com", "203.0.113.3").await;

    let ghost = app
        .post(
            "/api/v1/auth/forgot-password",
            json!({"email": "ghost@x.com"}),
            "198.51.100.30",
        )
        .await;
    let real = app
        .post(
            "/api/v1/auth/forgot-password",
            json!({"email": "real@x.com"}),
            "198.51.100.31",
        )
        .await;

    assert_eq!(ghost.status, StatusCode::OK);
    assert_eq!(ghost.status, real.status);
    assert_eq!(ghost.body, real.body);
    assert_eq!(
        real.body["message"],
        "If the email exists, a password reset link has been sent"
    );

    let note = app.next_notification(NotificationKind::PasswordReset).await;
    assert_eq!(note.recipient, "real@x.com");
}

#[tokio::test]
async fn reset_token_boundary_and_session_revocation() {
    let app = TestApp::new();
    let ip = "203.0.113.4";
    let registered = app.register("reset@x.com", ip).await;
    let old_refresh = token(&registered, "refresh_token");

    // Expired one second past the hour.
    app.post(
        "/api/v1/auth/forgot-password",
        json!({"email": "reset@x.com"}),
        ip,
    )
    .await;
    let stale = app.next_notification(NotificationKind::PasswordReset).await;
    app.clock.advance(Duration::hours(1) + Duration::seconds(1));
    let expired = app
        .post(
            "/api/v1/auth/reset-password",
            json!({
                "token": stale.token,
                "new_password": "Newpass1!",
                "confirm_password": "Newpass1!"
            }),
            ip,
        )
        .await;
    assert_eq!(expired.status, StatusCode::UNAUTHORIZED);

    // Accepted one second before the hour.
    app.post(
        "/api/v1/auth/forgot-password",
        json!({"email": "reset@x.com"}),
        ip,
    )
    .await;
    let fresh = app.next_notification(NotificationKind::PasswordReset).await;
    app.clock.advance(Duration::hours(1) - Duration::seconds(1));

    let mismatch = app
        .post(
            "/api/v1/auth/reset-password",
            json!({
                "token": fresh.token,
                "new_password": "Newpass1!",
                "confirm_password": "Newpass2!"
            }),
            ip,
        )
        .await;
    assert_eq!(mismatch.status, StatusCode::BAD_REQUEST);
    assert_eq!(mismatch.body["error"], "Password confirmation does not match");

    let reset = app
        .post(
            "/api/v1/auth/reset-password",
            json!({
                "token": fresh.token,
                "new_password": "Newpass1!",
                "confirm_password": "Newpass1!"
            }),
            ip,
        )
        .await;
    assert_eq!(reset.status, StatusCode::OK);

    let revoked = app
        .post(
            "/api/v1/auth/refresh",
            json!({"refresh_token": old_refresh}),
            ip,
        )
        .await;
    assert_eq!(revoked.status, StatusCode::UNAUTHORIZED);

    let old_password = app
        .post(
            "/api/v1/auth/login",
            json!({"email": "reset@x.com", "password": "Abcdef1!"}),
            ip,
        )
        .await;
    assert_eq!(old_password.status, StatusCode::UNAUTHORIZED);
    assert_eq!(old_password.body["error"], "Invalid email or password");

    let new_password = app
        .post(
            "/api/v1/auth/login",
            json!({"email": "reset@x.com", "password": "Newpass1!"}),
            ip,
        )
        .await;
    assert_eq!(new_password.status, StatusCode::OK);
}

#[tokio::test]
async fn login_is_rate_limited_per_ip() {
    let app = TestApp::new();
    let body = json!({"email": "nobody@x.com", "password": "Whatever1!"});

    for _ in 0..5 {
        let reply = app.post("/api/v1/auth/login", body.clone(), "192.0.2.50").await;
        assert_eq!(reply.status, StatusCode::UNAUTHORIZED);
    }
    let limited = app.post("/api/v1/auth/login", body.clone(), "192.0.2.50").await;
    assert_eq!(limited.status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(limited.body["retry_after"], 900);
    assert_eq!(
        limited
            .headers
            .get(header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok()),
        Some("900")
    );

    let elsewhere = app.post("/api/v1/auth/login", body, "192.0.2.51").await;
    assert_ne!(elsewhere.status, StatusCode::TOO_MANY_REQUESTS);

    app.clock.advance(Duration::minutes(15));
    let resumed = app
        .post(
            "/api/v1/auth/login",
            json!({"email": "nobody@x.com", "password": "Whatever1!"}),
            "192.0.2.50",
        )
        .await;
    assert_ne!(resumed.status, StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn forged_forwarding_headers_share_the_peer_window() {
    let app = TestApp::new();
    let body = json!({"email": "nobody@x.com", "password": "Whatever1!"});

    let mut limited = 0;
    for i in 0..20 {
        let forged = format!("10.0.0.{i}");
        let reply = app
            .call_with_headers(
                Method::POST,
                "/api/v1/auth/login",
                Some(body.clone()),
                None,
                "192.0.2.60",
                &[("x-forwarded-for", forged.as_str()), ("x-real-ip", forged.as_str())],
            )
            .await;
        if reply.status == StatusCode::TOO_MANY_REQUESTS {
            limited += 1;
        }
    }
    assert_eq!(limited, 15);
}

#[tokio::test]
async fn trusted_proxy_forwards_each_client_separately() {
    let mut config = AppConfig::with_jwt_secret("integration-secret");
    config.security.trusted_proxies = vec!["10.1.1.1".parse().expect("proxy ip")];
    let app = TestApp::with_config(config);
    let body = json!({"email": "nobody@x.com", "password": "Whatever1!"});

    let login_via_proxy = |client: &'static str| {
        let body = body.clone();
        let app = &app;
        async move {
            app.call_with_headers(
                Method::POST,
                "/api/v1/auth/login",
                Some(body),
                None,
                "10.1.1.1",
                &[("x-forwarded-for", client)],
            )
            .await
        }
    };

    for _ in 0..5 {
        assert_ne!(
            login_via_proxy("198.51.100.70").await.status,
            StatusCode::TOO_MANY_REQUESTS
        );
    }
    assert_eq!(
        login_via_proxy("198.51.100.70").await.status,
        StatusCode::TOO_MANY_REQUESTS
    );
    assert_ne!(
        login_via_proxy("198.51.100.71").await.status,
        StatusCode::TOO_MANY_REQUESTS
    );
}

#[tokio::test]
async fn profile_requires_a_valid_access_token() {
    let app = TestApp::new();
    let registered = app.register("me@x.com", "203.0.113.6").await;
    let access = token(&registered, "access_token");

    let anonymous = app
        .call(Method::GET, "/api/v1/auth/profile", None, None, "203.0.113.6")
        .await;
    assert_eq!(anonymous.status, StatusCode::UNAUTHORIZED);

    let forged = app
        .call(
            Method::GET,
            "/api/v1/auth/profile",
            None,
            Some("eyJhbGciOiJIUzI1NiJ9.e30.bad"),
            "203.0.113.6",
        )
        .await;
    assert_eq!(forged.status, StatusCode::UNAUTHORIZED);
    assert_eq!(forged.body["error"], "Invalid or expired token");

    let me = app
        .call(
            Method::GET,
            "/api/v1/auth/profile",
            None,
            Some(&access),
            "203.0.113.6",
        )
        .await;
    assert_eq!(me.status, StatusCode::OK);
    assert_eq!(me.body["data"]["email"], "me@x.com");
    assert_eq!(me.body["data"]["role"], "customer");

    app.clock.advance(Duration::minutes(15));
    let expired = app
        .call(
            Method::GET,
            "/api/v1/auth/profile",
            None,
            Some(&access),
            "203.0.113.6",
        )
        .await;
    assert_eq!(expired.status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn verification_link_and_resend() {
    let app = TestApp::new();
    app.register("verify@x.com", "203.0.113.7").await;
    let first = app
        .next_notification(NotificationKind::EmailVerification)
        .await;
    assert!(first.link.contains("/verify-email?token="));

    let resent = app
        .post(
            "/api/v1/auth/resend-verification",
            json!({"email": "verify@x.com"}),
            "203.0.113.7",
        )
        .await;
    let unknown = app
        .post(
            "/api/v1/auth/resend-verification",
            json!({"email": "ghost@x.com"}),
            "203.0.113.7",
        )
        .await;
    assert_eq!(resent.body, unknown.body);
    let second = app
        .next_notification(NotificationKind::EmailVerification)
        .await;

    let stale = app
        .call(
            Method::GET,
            &format!("/api/v1/auth/verify-email?token={}", first.token),
            None,
            None,
            "203.0.113.7",
        )
        .await;
    assert_eq!(stale.status, StatusCode::UNAUTHORIZED);

    let verified = app
        .call(
            Method::GET,
            &format!("/api/v1/auth/verify-email?token={}", second.token),
            None,
            None,
            "203.0.113.7",
        )
        .await;
    assert_eq!(verified.status, StatusCode::OK);
    assert_eq!(verified.body["message"], "Email verified successfully");

    let missing = app
        .post("/api/v1/auth/verify-email", json!({}), "203.0.113.7")
        .await;
    assert_eq!(missing.status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn change_password_and_default_logout() {
    let app = TestApp::new();
    let here = "203.0.113.8";
    let registered = app.register("change@x.com", here).await;
    let access = token(&registered, "access_token");
    let here_refresh = token(&registered, "refresh_token");

    let other = app
        .post(
            "/api/v1/auth/login",
            json!({"email": "change@x.com", "password": "Abcdef1!"}),
            "198.51.100.80",
        )
        .await;
    let other_refresh = token(&other, "refresh_token");

    let wrong = app
        .call(
            Method::POST,
            "/api/v1/auth/change-password",
            Some(json!({"current_password": "Nope1234!", "new_password": "Changed1!"})),
            Some(&access),
            here,
        )
        .await;
    assert_eq!(wrong.status, StatusCode::UNAUTHORIZED);
    assert_eq!(wrong.body["error"], "Current password is incorrect");

    let changed = app
        .call(
            Method::POST,
            "/api/v1/auth/change-password",
            Some(json!({"current_password": "Abcdef1!", "new_password": "Changed1!"})),
            Some(&access),
            here,
        )
        .await;
    assert_eq!(changed.status, StatusCode::OK);

    let other_refresh_reply = app
        .post(
            "/api/v1/auth/refresh",
            json!({"refresh_token": other_refresh}),
            "198.51.100.80",
        )
        .await;
    assert_eq!(other_refresh_reply.status, StatusCode::UNAUTHORIZED);

    // Empty body logs out this device only.
    let logout = app
        .call(Method::POST, "/api/v1/auth/logout", None, Some(&access), here)
        .await;
    assert_eq!(logout.status, StatusCode::OK);
    let here_refresh_reply = app
        .post(
            "/api/v1/auth/refresh",
            json!({"refresh_token": here_refresh}),
            here,
        )
        .await;
    assert_eq!(here_refresh_reply.status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn malformed_bodies_and_duplicates() {
    let app = TestApp::new();
    let ip = "203.0.113.9";

    let missing_fields = app
        .post("/api/v1/auth/register", json!({"email": "x@y.com"}), ip)
        .await;
    assert_eq!(missing_fields.status, StatusCode::BAD_REQUEST);
    assert_eq!(missing_fields.body["success"], false);
    assert!(missing_fields.body["details"].is_string());

    assert_eq!(app.register("dup@x.com", ip).await.status, StatusCode::CREATED);
    let duplicate = app.register("DUP@x.com", ip).await;
    assert_eq!(duplicate.status, StatusCode::CONFLICT);
    assert_eq!(app.store.count_users_with_email("dup@x.com").await, 1);
}

#[tokio::test]
async fn health_reports_store_backend() {
    let app = TestApp::new();
    app.clock.set(time::macros::datetime!(2030-01-01 0:00 UTC));
    let reply = app
        .call(Method::GET, "/api/v1/auth/health", None, None, "203.0.113.10")
        .await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.body["data"]["status"], "healthy");
    assert_eq!(reply.body["data"]["store"], "memory");
    assert_eq!(reply.body["data"]["timestamp"], "2030-01-01T00:00:00Z");
}

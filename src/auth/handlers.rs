use axum::{
    extract::{Query, State},
    http::StatusCode,
    middleware,
    routing::{get, post, MethodRouter},
    Json, Router,
};
use bytes::Bytes;
use tracing::{info, instrument};

use crate::{
    auth::{
        claims::ClientContext,
        dto::{
            ApiResponse, AuthResponse, ChangePasswordRequest, EmailRequest, HealthResponse,
            LoginRequest, LogoutRequest, PublicUser, RefreshRequest, RegisterRequest,
            ResetPasswordRequest, VerifyEmailRequest,
        },
        extractors::{AuthUser, JsonBody},
        rate_limit::{self, Endpoint},
        services::{RESET_REQUESTED_MESSAGE, VERIFICATION_RESENT_MESSAGE},
        verification::EmailVerification,
    },
    error::AuthError,
    state::AppState,
};

fn limited(
    route: MethodRouter<AppState>,
    state: &AppState,
    endpoint: Endpoint,
) -> MethodRouter<AppState> {
    route.route_layer(middleware::from_fn_with_state(
        (state.limiter.clone(), state.proxies.clone(), endpoint),
        rate_limit::enforce,
    ))
}

pub fn auth_routes(state: &AppState) -> Router<AppState> {
    Router::new()
        .route(
            "/auth/register",
            limited(post(register), state, Endpoint::Register),
        )
        .route("/auth/login", limited(post(login), state, Endpoint::Login))
        .route(
            "/auth/refresh",
            limited(post(refresh), state, Endpoint::Refresh),
        )
        .route(
            "/auth/forgot-password",
            limited(post(forgot_password), state, Endpoint::ForgotPassword),
        )
        .route(
            "/auth/reset-password",
            limited(post(reset_password), state, Endpoint::ResetPassword),
        )
        .route(
            "/auth/verify-email",
            limited(
                get(verify_email_link).post(verify_email),
                state,
                Endpoint::VerifyEmail,
            ),
        )
        .route(
            "/auth/resend-verification",
            limited(
                post(resend_verification),
                state,
                Endpoint::ResendVerification,
            ),
        )
        .route("/auth/logout", limited(post(logout), state, Endpoint::Logout))
        .route(
            "/auth/change-password",
            limited(post(change_password), state, Endpoint::ChangePassword),
        )
        .route("/auth/profile", get(profile))
        .route("/auth/health", get(health))
}

#[instrument(skip_all, fields(ip = %client.ip_address))]
pub async fn register(
    State(state): State<AppState>,
    client: ClientContext,
    JsonBody(payload): JsonBody<RegisterRequest>,
) -> Result<(StatusCode, Json<ApiResponse<AuthResponse>>), AuthError> {
    let session = state.service.register(payload, &client).await?;
    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::data(
            AuthResponse::from(session),
            "User registered successfully",
        )),
    ))
}

#[instrument(skip_all, fields(ip = %client.ip_address))]
pub async fn login(
    State(state): State<AppState>,
    client: ClientContext,
    JsonBody(payload): JsonBody<LoginRequest>,
) -> Result<Json<ApiResponse<AuthResponse>>, AuthError> {
    let session = state.service.login(payload, &client).await?;
    Ok(Json(ApiResponse::data(
        AuthResponse::from(session),
        "Login successful",
    )))
}

#[instrument(skip_all, fields(ip = %client.ip_address))]
pub async fn refresh(
    State(state): State<AppState>,
    client: ClientContext,
    JsonBody(payload): JsonBody<RefreshRequest>,
) -> Result<Json<ApiResponse<AuthResponse>>, AuthError> {
    let session = state
        .service
        .refresh(&payload.refresh_token, &client)
        .await?;
    Ok(Json(ApiResponse::data(
        AuthResponse::from(session),
        "Token refreshed successfully",
    )))
}

#[instrument(skip_all, fields(ip = %client.ip_address))]
pub async fn forgot_password(
    State(state): State<AppState>,
    client: ClientContext,
    JsonBody(payload): JsonBody<EmailRequest>,
) -> Result<Json<ApiResponse<()>>, AuthError> {
    state
        .service
        .forgot_password(&payload.email, &client)
        .await?;
    Ok(Json(ApiResponse::message(RESET_REQUESTED_MESSAGE)))
}

#[instrument(skip_all, fields(ip = %client.ip_address))]
pub async fn reset_password(
    State(state): State<AppState>,
    client: ClientContext,
    JsonBody(payload): JsonBody<ResetPasswordRequest>,
) -> Result<Json<ApiResponse<()>>, AuthError> {
    state.service.reset_password(payload, &client).await?;
    Ok(Json(ApiResponse::message(
        "Password reset successfully. Please log in again.",
    )))
}

async fn finish_verification(
    state: &AppState,
    token: &str,
    client: &ClientContext,
) -> Result<Json<ApiResponse<()>>, AuthError> {
    let message = match state.service.verify_email(token, client).await? {
        EmailVerification::Verified(user_id) => {
            info!(user_id = %user_id, "email verification accepted");
            "Email verified successfully"
        }
        EmailVerification::AlreadyVerified(_) => "Email already verified",
    };
    Ok(Json(ApiResponse::message(message)))
}

#[instrument(skip_all, fields(ip = %client.ip_address))]
pub async fn verify_email(
    State(state): State<AppState>,
    client: ClientContext,
    JsonBody(payload): JsonBody<VerifyEmailRequest>,
) -> Result<Json<ApiResponse<()>>, AuthError> {
    finish_verification(&state, &payload.token, &client).await
}

/// GET form used by links in verification emails.
#[instrument(skip_all, fields(ip = %client.ip_address))]
pub async fn verify_email_link(
    State(state): State<AppState>,
    client: ClientContext,
    query: Option<Query<VerifyEmailRequest>>,
) -> Result<Json<ApiResponse<()>>, AuthError> {
    let Query(params) = query.unwrap_or_default();
    finish_verification(&state, &params.token, &client).await
}

#[instrument(skip_all, fields(ip = %client.ip_address))]
pub async fn resend_verification(
    State(state): State<AppState>,
    client: ClientContext,
    JsonBody(payload): JsonBody<EmailRequest>,
) -> Result<Json<ApiResponse<()>>, AuthError> {
    state
        .service
        .resend_verification(&payload.email, &client)
        .await?;
    Ok(Json(ApiResponse::message(VERIFICATION_RESENT_MESSAGE)))
}

#[instrument(skip_all, fields(user_id = %identity.user_id))]
pub async fn profile(
    State(state): State<AppState>,
    AuthUser(identity): AuthUser,
) -> Result<Json<ApiResponse<PublicUser>>, AuthError> {
    let user = state.service.profile(&identity).await?;
    Ok(Json(ApiResponse::data(
        PublicUser::from(user),
        "Profile retrieved successfully",
    )))
}

/// The body is optional; an empty one means "this device".
#[instrument(skip_all, fields(user_id = %identity.user_id))]
pub async fn logout(
    State(state): State<AppState>,
    AuthUser(identity): AuthUser,
    client: ClientContext,
    body: Bytes,
) -> Result<Json<ApiResponse<()>>, AuthError> {
    let payload = if body.iter().all(u8::is_ascii_whitespace) {
        LogoutRequest::default()
    } else {
        serde_json::from_slice::<LogoutRequest>(&body)
            .map_err(|e| AuthError::validation("body", e.to_string()))?
    };
    state.service.logout(&identity, payload, &client).await?;
    Ok(Json(ApiResponse::message("Logged out successfully")))
}

#[instrument(skip_all, fields(user_id = %identity.user_id))]
pub async fn change_password(
    State(state): State<AppState>,
    AuthUser(identity): AuthUser,
    client: ClientContext,
    JsonBody(payload): JsonBody<ChangePasswordRequest>,
) -> Result<Json<ApiResponse<()>>, AuthError> {
    state
        .service
        .change_password(&identity, payload, &client)
        .await?;
    Ok(Json(ApiResponse::message("Password changed successfully")))
}

pub async fn health(State(state): State<AppState>) -> Json<ApiResponse<HealthResponse>> {
    Json(ApiResponse::data(
        HealthResponse {
            status: "healthy",
            service: "booking-auth",
            timestamp: state.service.now(),
            version: env!("CARGO_PKG_VERSION"),
            store: state.service.store_backend(),
        },
        "Service is healthy",
    ))
}

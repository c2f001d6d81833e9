use axum::Router;

use crate::state::AppState;

pub mod claims;
pub mod dto;
pub mod extractors;
pub mod handlers;
pub mod jwt;
pub mod lockout;
pub mod notify;
pub mod password;
pub mod rate_limit;
pub mod repo;
pub mod repo_memory;
pub mod repo_types;
pub mod services;
pub mod sessions;
pub mod tokens;
pub mod verification;

pub fn router(state: &AppState) -> Router<AppState> {
    handlers::auth_routes(state)
}

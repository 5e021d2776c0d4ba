// Per-route authorization middleware
//
// Routes declare their requirement at wire-up by layering `require_admin`
// (writes) or `require_auth` (reads). Tokens are stored hashed; the
// incoming bearer token is hashed and matched against the configured sets.

use std::collections::HashSet;

use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use sha2::{Digest, Sha256};

use super::config::{AuthConfig, AuthMode};
use crate::common::ErrorBody;

/// Role granted by a presented token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Admin,
    Reader,
}

/// Shared state for the auth middleware
#[derive(Clone)]
pub struct AuthState {
    mode: AuthMode,
    admin_hashes: HashSet<String>,
    reader_hashes: HashSet<String>,
}

impl AuthState {
    pub fn new(config: &AuthConfig) -> Self {
        Self {
            mode: config.mode,
            admin_hashes: config.admin_tokens.iter().map(|t| hash_token(t)).collect(),
            reader_hashes: config.reader_tokens.iter().map(|t| hash_token(t)).collect(),
        }
    }

    fn role_for(&self, request: &Request) -> Option<Role> {
        if self.mode == AuthMode::None {
            return Some(Role::Admin);
        }

        let token = bearer_token(request)?;
        let hash = hash_token(token);
        if self.admin_hashes.contains(&hash) {
            Some(Role::Admin)
        } else if self.reader_hashes.contains(&hash) {
            Some(Role::Reader)
        } else {
            None
        }
    }
}

fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

fn bearer_token(request: &Request) -> Option<&str> {
    request
        .headers()
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

fn denied(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}

/// Write operations require an administrator token.
pub async fn require_admin(
    State(auth): State<AuthState>,
    request: Request,
    next: Next,
) -> Response {
    match auth.role_for(&request) {
        Some(Role::Admin) => next.run(request).await,
        Some(Role::Reader) => denied(StatusCode::FORBIDDEN, "administrator token required"),
        None => denied(StatusCode::UNAUTHORIZED, "authentication required"),
    }
}

/// Read operations require any authenticated token.
pub async fn require_auth(State(auth): State<AuthState>, request: Request, next: Next) -> Response {
    match auth.role_for(&request) {
        Some(_) => next.run(request).await,
        None => denied(StatusCode::UNAUTHORIZED, "authentication required"),
    }
}

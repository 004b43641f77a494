//! Authentication middleware

use axum::{
    extract::{Request, State},
    http::{header::AUTHORIZATION, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use uuid::Uuid;

use super::jwt::Role;
use crate::state::AppState;

/// Authenticated actor, inserted into request extensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthUser {
    pub user_id: Uuid,
    pub role: Role,
}

impl AuthUser {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    pub fn require_admin(&self) -> Result<(), AuthError> {
        if self.is_admin() {
            Ok(())
        } else {
            tracing::warn!(user_id = %self.user_id, role = ?self.role, "Admin route denied");
            Err(AuthError::InsufficientPermissions)
        }
    }

    /// Seller id of the caller; seller routes act on the caller only.
    pub fn require_seller(&self) -> Result<Uuid, AuthError> {
        match self.role {
            Role::Seller => Ok(self.user_id),
            _ => {
                tracing::warn!(user_id = %self.user_id, role = ?self.role, "Seller route denied");
                Err(AuthError::InsufficientPermissions)
            }
        }
    }
}

/// Require a valid bearer token
pub async fn require_auth(State(state): State<AppState>, mut request: Request, next: Next) -> Response {
    let token = match extract_bearer(&request) {
        Ok(token) => token,
        Err(e) => return e.into_response(),
    };

    match state.jwt_manager.validate(token) {
        Ok(claims) => {
            let auth_user = AuthUser {
                user_id: claims.sub,
                role: claims.role,
            };
            request.extensions_mut().insert(auth_user);
            next.run(request).await
        }
        Err(e) => e.into_response(),
    }
}

fn extract_bearer(request: &Request) -> Result<&str, AuthError> {
    let header = request
        .headers()
        .get(AUTHORIZATION)
        .ok_or(AuthError::MissingAuth)?
        .to_str()
        .map_err(|_| AuthError::InvalidAuthFormat)?;

    match header.strip_prefix("Bearer ") {
        Some(token) if !token.trim().is_empty() => Ok(token.trim()),
        _ => Err(AuthError::InvalidAuthFormat),
    }
}

/// Authentication errors
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Missing authentication")]
    MissingAuth,
    #[error("Invalid authentication format")]
    InvalidAuthFormat,
    #[error("Invalid or expired token")]
    InvalidToken,
    #[error("Insufficient permissions")]
    InsufficientPermissions,
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AuthError {
    pub fn status(&self) -> StatusCode {
        match self {
            AuthError::MissingAuth | AuthError::InvalidAuthFormat | AuthError::InvalidToken => {
                StatusCode::UNAUTHORIZED
            }
            AuthError::InsufficientPermissions => StatusCode::FORBIDDEN,
            AuthError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match self {
            AuthError::MissingAuth => "Authentication required",
            AuthError::InvalidAuthFormat => "Invalid authentication format",
            AuthError::InvalidToken => "Invalid or expired token",
            AuthError::InsufficientPermissions => "Insufficient permissions",
            AuthError::Internal(_) => "Internal server error",
        };

        let body = Json(json!({
            "error": message,
            "code": status.as_u16(),
            "kind": "auth"
        }));

        (status, body).into_response()
    }
}

//! Authentication middleware
//!
//! Resolves the caller's identity from a bearer token and stores it as an
//! [`AuthUser`] request extension.

use axum::{
    extract::{Request, State},
    http::{header::AUTHORIZATION, HeaderMap},
    middleware::Next,
    response::Response,
};
use revroom_shared::UserId;

use super::jwt::{JwtError, JwtManager};
use crate::error::ApiError;
use crate::state::AppState;

/// Fallback when a token carries no display name
const DEFAULT_DISPLAY_NAME: &str = "Student";

/// Authenticated caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser {
    pub user_id: UserId,
    pub display_name: String,
}

impl AuthUser {
    /// Decode a token into an identity
    pub fn from_token(jwt: &JwtManager, token: &str) -> Result<Self, ApiError> {
        let claims = jwt.validate_token(token).map_err(|e| {
            tracing::debug!(error = %e, "Rejected bearer token");
            match e {
                JwtError::Expired => ApiError::Unauthorized("Token has expired".into()),
                _ => ApiError::Unauthorized("Invalid token".into()),
            }
        })?;

        let display_name = claims
            .name
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| DEFAULT_DISPLAY_NAME.to_string());

        Ok(Self {
            user_id: UserId(claims.sub),
            display_name,
        })
    }
}

/// Extract the token from `Authorization: Bearer <token>`
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Reject requests without a valid bearer token
pub async fn require_auth(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = bearer_token(req.headers())
        .ok_or_else(|| ApiError::Unauthorized("Missing bearer token".into()))?;
    let user = AuthUser::from_token(&state.jwt, token)?;

    req.extensions_mut().insert(user);
    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use time::Duration;
    use uuid::Uuid;

    const SECRET: &str = "test-secret-key-at-least-32-chars!";

    #[test]
    fn test_bearer_token_extraction() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(bearer_token(&headers), None);

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer abc.def"));
        assert_eq!(bearer_token(&headers), Some("abc.def"));
    }

    #[test]
    fn test_missing_name_falls_back() {
        let jwt = JwtManager::new(SECRET);
        let user_id = Uuid::new_v4();
        let token = jwt
            .generate_access_token(user_id, "   ", Duration::hours(1))
            .unwrap();

        let user = AuthUser::from_token(&jwt, &token).unwrap();
        assert_eq!(user.user_id, UserId(user_id));
        assert_eq!(user.display_name, DEFAULT_DISPLAY_NAME);
    }

    #[test]
    fn test_garbage_token_is_unauthorized() {
        let jwt = JwtManager::new(SECRET);
        assert!(matches!(
            AuthUser::from_token(&jwt, "not-a-token"),
            Err(ApiError::Unauthorized(_))
        ));
    }
}

//! Authentication middleware.
//!
//! This provides a simple Bearer token extraction mechanism. When an
//! `AUTH_SECRET` is configured the token must equal it; otherwise requests
//! without a token are served anonymously.

use axum::{
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts},
};

use crate::error::AppError;
use crate::AppState;

/// Authenticated user extracted from request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser {
    /// The bearer token, or "anonymous" when auth is disabled
    pub token: String,
}

impl AuthUser {
    fn authenticate(header: Option<&str>, secret: Option<&str>) -> Result<Self, AppError> {
        match (header, secret) {
            (Some(header), _) if header.starts_with("Bearer ") => {
                let token = header.trim_start_matches("Bearer ").trim().to_string();
                if token.is_empty() {
                    return Err(AppError::Unauthorized);
                }
                match secret {
                    Some(secret) if secret != token => Err(AppError::Unauthorized),
                    _ => Ok(AuthUser { token }),
                }
            }
            (Some(_), _) => Err(AppError::Unauthorized),
            (None, None) => Ok(AuthUser {
                token: "anonymous".to_string(),
            }),
            (None, Some(_)) => Err(AppError::Unauthorized),
        }
    }
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok());

        let user = Self::authenticate(header, state.config.auth_secret.as_deref());
        if user.is_err() {
            tracing::debug!(path = %parts.uri.path(), "Rejected unauthenticated request");
        }
        user
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anonymous_without_secret() {
        let user = AuthUser::authenticate(None, None).unwrap();
        assert_eq!(user.token, "anonymous");
        assert_eq!(
            AuthUser::authenticate(Some("Bearer abc"), None).unwrap().token,
            "abc"
        );
    }

    #[test]
    fn secret_must_match() {
        assert!(AuthUser::authenticate(None, Some("s3cret")).is_err());
        assert!(AuthUser::authenticate(Some("Bearer wrong"), Some("s3cret")).is_err());
        assert!(AuthUser::authenticate(Some("Basic s3cret"), Some("s3cret")).is_err());
        assert!(AuthUser::authenticate(Some("Bearer "), None).is_err());
        assert!(AuthUser::authenticate(Some("Bearer s3cret"), Some("s3cret")).is_ok());
    }
}

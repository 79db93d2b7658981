//! Authentication middleware.
//!
//! Every engine shares one bearer token, configured with `TANDEM_AUTH_TOKEN`.
//! When no token is configured the service accepts anonymous requests.

use axum::{
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts, StatusCode},
};

use crate::AppState;

type Rejection = (StatusCode, &'static str);

/// Authenticated caller extracted from request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser {
    /// Whether the caller presented the configured token
    pub authenticated: bool,
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = Rejection;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok());

        check_bearer(header, state.config.auth_token.as_deref())
    }
}

/// Check an `Authorization` header value against the expected token.
fn check_bearer(header: Option<&str>, expected: Option<&str>) -> Result<AuthUser, Rejection> {
    let Some(expected) = expected else {
        return Ok(AuthUser {
            authenticated: false,
        });
    };

    match header {
        Some(header) => {
            let token = header
                .strip_prefix("Bearer ")
                .ok_or((StatusCode::UNAUTHORIZED, "Invalid authorization header format"))?;
            if token.is_empty() {
                return Err((StatusCode::UNAUTHORIZED, "Empty bearer token"));
            }
            if token != expected {
                return Err((StatusCode::UNAUTHORIZED, "Invalid bearer token"));
            }
            Ok(AuthUser {
                authenticated: true,
            })
        }
        None => Err((StatusCode::UNAUTHORIZED, "Missing authorization header")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anonymous_when_no_token_configured() {
        let user = check_bearer(None, None).unwrap();
        assert!(!user.authenticated);
    }

    #[test]
    fn token_must_match() {
        assert!(check_bearer(Some("Bearer s3cret"), Some("s3cret")).unwrap().authenticated);
        assert_eq!(
            check_bearer(Some("Bearer wrong"), Some("s3cret")).unwrap_err().1,
            "Invalid bearer token"
        );
        assert_eq!(
            check_bearer(Some("Basic s3cret"), Some("s3cret")).unwrap_err().1,
            "Invalid authorization header format"
        );
        assert_eq!(
            check_bearer(None, Some("s3cret")).unwrap_err().1,
            "Missing authorization header"
        );
    }
}

use axum::http::{HeaderMap, StatusCode, header};
use serde::Serialize;
use subtle::ConstantTimeEq;

use opsrelay_crypto::TokenCodec;

/// Configured operator credentials the login endpoint checks against.
#[derive(Debug, Clone)]
pub struct AdminCredentials {
    pub username: String,
    pub password: String,
}

/// Authenticated operator identity attached to a request.
#[derive(Debug, Clone, Serialize)]
pub struct SessionUser {
    pub id: u64,
    pub username: String,
    pub name: String,
}

/// Extract the credential from an Authorization header value. Tolerates
/// duplicated "Bearer" markers: requires at least one case-insensitive
/// marker up front and takes the last non-marker token.
pub fn extract_bearer(header: &str) -> Option<&str> {
    let parts: Vec<&str> = header.split_whitespace().collect();
    let first = parts.first()?;
    if parts.len() < 2 || !first.eq_ignore_ascii_case("bearer") {
        return None;
    }
    parts
        .iter()
        .rev()
        .find(|part| !part.eq_ignore_ascii_case("bearer"))
        .copied()
}

pub fn require_auth(
    tokens: &TokenCodec,
    headers: &HeaderMap,
) -> Result<SessionUser, (StatusCode, String)> {
    let header = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| {
            (
                StatusCode::UNAUTHORIZED,
                "missing Authorization header".to_string(),
            )
        })?;
    let token = extract_bearer(header).ok_or_else(|| {
        (
            StatusCode::UNAUTHORIZED,
            "malformed Authorization header".to_string(),
        )
    })?;
    verify_token(tokens, token)
}

pub fn verify_token(
    tokens: &TokenCodec,
    token: &str,
) -> Result<SessionUser, (StatusCode, String)> {
    match tokens.verify(token) {
        Ok(claims) => Ok(SessionUser {
            id: claims.id,
            username: claims.username,
            name: "Administrator".to_string(),
        }),
        Err(err) => Err((StatusCode::UNAUTHORIZED, err.to_string())),
    }
}

/// Constant-time credential check; username and password are both
/// compared without early exit.
pub fn check_credentials(admin: &AdminCredentials, username: &str, password: &str) -> bool {
    let user_ok = admin.username.as_bytes().ct_eq(username.as_bytes());
    let pass_ok = admin.password.as_bytes().ct_eq(password.as_bytes());
    bool::from(user_ok & pass_ok)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_extraction_is_tolerant() {
        assert_eq!(extract_bearer("Bearer abc"), Some("abc"));
        assert_eq!(extract_bearer("bearer abc"), Some("abc"));
        assert_eq!(extract_bearer("Bearer Bearer abc"), Some("abc"));
        assert_eq!(extract_bearer("BEARER  abc  "), Some("abc"));
    }

    #[test]
    fn bearer_extraction_rejects_malformed() {
        assert_eq!(extract_bearer("abc"), None);
        assert_eq!(extract_bearer("Bearer"), None);
        assert_eq!(extract_bearer("Bearer Bearer"), None);
        assert_eq!(extract_bearer("Token abc"), None);
        assert_eq!(extract_bearer(""), None);
    }

    #[test]
    fn credential_check_requires_both_fields() {
        let admin = AdminCredentials {
            username: "admin".to_string(),
            password: "hunter2hunter2".to_string(),
        };
        assert!(check_credentials(&admin, "admin", "hunter2hunter2"));
        assert!(!check_credentials(&admin, "admin", "wrong"));
        assert!(!check_credentials(&admin, "root", "hunter2hunter2"));
        assert!(!check_credentials(&admin, "", ""));
    }
}

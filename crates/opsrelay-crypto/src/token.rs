use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::warn;

use crate::time::now_ms;

type HmacSha256 = Hmac<Sha256>;

const TOKEN_VERSION: u32 = 1;

/// Stateless session token claims. Validity is determined purely by the
/// signature and expiry at verification time; tokens are not revocable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    pub id: u64,
    pub username: String,
    pub iat: u64,
    pub exp: u64,
    #[serde(default)]
    pub v: u32,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("invalid token")]
    InvalidToken,

    #[error("token expired")]
    ExpiredToken,

    #[error("bad token signature")]
    BadSignature,

    #[error("signed token verification requires a configured secret")]
    MissingSecret,
}

/// Issues and verifies signed session tokens.
///
/// Token format: `base64(json claims) + "." + hex(hmac_sha256(payload))`.
/// Unsigned legacy tokens (payload only) are a migration compatibility
/// hole: they are accepted only when no secret is configured AND
/// `allow_unsigned` is explicitly enabled, and every use is logged.
pub struct TokenCodec {
    secret: Option<String>,
    allow_unsigned: bool,
}

impl TokenCodec {
    pub fn new(secret: Option<String>, allow_unsigned: bool) -> Self {
        let secret = secret.filter(|s| !s.is_empty());
        if secret.is_none() && allow_unsigned {
            warn!("no auth secret configured and unsigned tokens enabled: tokens are forgeable");
        }
        Self {
            secret,
            allow_unsigned,
        }
    }

    pub fn has_secret(&self) -> bool {
        self.secret.is_some()
    }

    /// Issue a token for `username` valid for `ttl_ms` from now.
    pub fn issue(&self, id: u64, username: &str, ttl_ms: u64) -> Result<String, TokenError> {
        let iat = now_ms();
        let claims = TokenClaims {
            id,
            username: username.to_string(),
            iat,
            exp: iat.saturating_add(ttl_ms),
            v: TOKEN_VERSION,
        };
        self.encode(&claims)
    }

    pub fn encode(&self, claims: &TokenClaims) -> Result<String, TokenError> {
        let json = serde_json::to_vec(claims).map_err(|_| TokenError::InvalidToken)?;
        let payload = base64::engine::general_purpose::STANDARD.encode(json);
        match &self.secret {
            Some(secret) => {
                let sig = hex::encode(sign(secret, &payload));
                Ok(format!("{payload}.{sig}"))
            }
            None if self.allow_unsigned => {
                warn!("issuing UNSIGNED token (legacy mode)");
                Ok(payload)
            }
            None => Err(TokenError::MissingSecret),
        }
    }

    /// Verify signature and expiry; returns the claims on success.
    pub fn verify(&self, token: &str) -> Result<TokenClaims, TokenError> {
        let claims = self.decode(token)?;
        if claims.exp < now_ms() {
            return Err(TokenError::ExpiredToken);
        }
        Ok(claims)
    }

    fn decode(&self, token: &str) -> Result<TokenClaims, TokenError> {
        let parts: Vec<&str> = token.split('.').collect();
        match parts.as_slice() {
            [payload] => {
                if self.secret.is_some() || !self.allow_unsigned {
                    return Err(TokenError::InvalidToken);
                }
                warn!("accepting unsigned legacy token");
                parse_payload(payload)
            }
            [payload, sig] => {
                let Some(secret) = &self.secret else {
                    return Err(TokenError::MissingSecret);
                };
                let given = hex::decode(sig).map_err(|_| TokenError::BadSignature)?;
                let expected = sign(secret, payload);
                if expected.ct_eq(given.as_slice()).unwrap_u8() == 0 {
                    return Err(TokenError::BadSignature);
                }
                parse_payload(payload)
            }
            _ => Err(TokenError::InvalidToken),
        }
    }
}

fn sign(secret: &str, payload: &str) -> Vec<u8> {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(payload.as_bytes());
    mac.finalize().into_bytes().to_vec()
}

fn parse_payload(payload: &str) -> Result<TokenClaims, TokenError> {
    let json = base64::engine::general_purpose::STANDARD
        .decode(payload)
        .map_err(|_| TokenError::InvalidToken)?;
    serde_json::from_slice(&json).map_err(|_| TokenError::InvalidToken)
}

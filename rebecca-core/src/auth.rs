//! Session gate and credential hashing.
//!
//! Tokens are `base64url(claims) "." base64url(hmac_sha256(claims_segment))`
//! with claims `{sub, iat, exp}` in unix seconds. The gate only answers
//! "which user is this"; everything downstream trusts the returned id.

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

use crate::config::AuthConfig;
use crate::error::ChatError;

type HmacSha256 = Hmac<Sha256>;

pub const MIN_SECRET_LEN: usize = 32;

#[derive(Error, Debug)]
pub enum AuthSetupError {
    #[error("auth secret must be at least {MIN_SECRET_LEN} bytes, got {0}")]
    SecretTooShort(usize),

    #[error("token ttl must be positive, got {0}")]
    InvalidTtl(i64),
}

#[derive(Error, Debug)]
pub enum PasswordError {
    #[error("password hashing failed: {0}")]
    Hash(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Claims {
    pub sub: i64,
    pub iat: i64,
    pub exp: i64,
}

/// Validates bearer credentials and mints new ones.
#[derive(Clone)]
pub struct SessionGate {
    mac: HmacSha256,
    ttl_seconds: i64,
}

impl std::fmt::Debug for SessionGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionGate")
            .field("ttl_seconds", &self.ttl_seconds)
            .finish_non_exhaustive()
    }
}

impl SessionGate {
    pub fn new(secret: &str, ttl_seconds: i64) -> Result<Self, AuthSetupError> {
        if secret.len() < MIN_SECRET_LEN {
            return Err(AuthSetupError::SecretTooShort(secret.len()));
        }
        if ttl_seconds <= 0 {
            return Err(AuthSetupError::InvalidTtl(ttl_seconds));
        }
        // HMAC accepts keys of any length.
        let mac = <HmacSha256 as Mac>::new_from_slice(secret.as_bytes())
            .map_err(|_| AuthSetupError::SecretTooShort(secret.len()))?;
        Ok(Self { mac, ttl_seconds })
    }

    pub fn from_config(config: &AuthConfig) -> Result<Self, AuthSetupError> {
        Self::new(&config.secret, config.token_ttl_seconds)
    }

    pub fn ttl_seconds(&self) -> i64 {
        self.ttl_seconds
    }

    pub fn issue(&self, user_id: i64) -> String {
        self.issue_at(user_id, Utc::now().timestamp())
    }

    pub fn issue_at(&self, user_id: i64, now: i64) -> String {
        let claims = Claims {
            sub: user_id,
            iat: now,
            exp: now + self.ttl_seconds,
        };
        // Serializing three integers cannot fail.
        let payload = serde_json::to_vec(&claims).unwrap_or_default();
        let claims_segment = URL_SAFE_NO_PAD.encode(payload);
        let signature = URL_SAFE_NO_PAD.encode(self.sign(claims_segment.as_bytes()));
        format!("{}.{}", claims_segment, signature)
    }

    /// Resolve a raw token to its user id.
    pub fn resolve(&self, token: &str) -> Result<i64, ChatError> {
        self.resolve_at(token, Utc::now().timestamp())
    }

    pub fn resolve_at(&self, token: &str, now: i64) -> Result<i64, ChatError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(ChatError::Unauthenticated);
        }

        let (claims_segment, signature_segment) =
            token.split_once('.').ok_or(ChatError::TokenInvalid)?;
        if signature_segment.contains('.') {
            return Err(ChatError::TokenInvalid);
        }

        let signature = URL_SAFE_NO_PAD
            .decode(signature_segment)
            .map_err(|_| ChatError::TokenInvalid)?;
        let mut mac = self.mac.clone();
        mac.update(claims_segment.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| ChatError::TokenInvalid)?;

        let payload = URL_SAFE_NO_PAD
            .decode(claims_segment)
            .map_err(|_| ChatError::TokenInvalid)?;
        let claims: Claims =
            serde_json::from_slice(&payload).map_err(|_| ChatError::TokenInvalid)?;

        if now >= claims.exp {
            return Err(ChatError::TokenExpired);
        }
        Ok(claims.sub)
    }

    /// Resolve the value of an `Authorization` header.
    pub fn resolve_bearer(&self, header: Option<&str>) -> Result<i64, ChatError> {
        let header = header.map(str::trim).unwrap_or_default();
        if header.is_empty() {
            return Err(ChatError::Unauthenticated);
        }

        let (scheme, token) = header.split_once(' ').unwrap_or((header, ""));
        if !scheme.eq_ignore_ascii_case("bearer") {
            return Err(ChatError::TokenInvalid);
        }
        self.resolve(token)
    }

    fn sign(&self, data: &[u8]) -> Vec<u8> {
        let mut mac = self.mac.clone();
        mac.update(data);
        mac.finalize().into_bytes().to_vec()
    }
}

/// Argon2id PHC string for `password` with a fresh random salt.
pub fn hash_password(password: &str) -> Result<String, PasswordError> {
    let salt = SaltString::generate(&mut rand::rngs::OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| PasswordError::Hash(e.to_string()))
}

/// False for a wrong password and for an unparseable stored hash.
pub fn verify_password(password: &str, stored_hash: &str) -> bool {
    match PasswordHash::new(stored_hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(e) => {
            tracing::warn!(error = %e, "Stored password hash is not a valid PHC string");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "test-secret-test-secret-test-secret!";

    fn gate() -> SessionGate {
        SessionGate::new(SECRET, 3600).unwrap()
    }

    #[test]
    fn issued_token_resolves_to_user() {
        let g = gate();
        let token = g.issue_at(42, 1_000);
        assert_eq!(g.resolve_at(&token, 1_001), Ok(42));
    }

    #[test]
    fn token_past_expiry_is_expired() {
        let g = gate();
        let token = g.issue_at(42, 1_000);
        assert_eq!(g.resolve_at(&token, 1_000 + 3600), Err(ChatError::TokenExpired));
    }

    #[test]
    fn token_from_other_secret_is_invalid() {
        let other = SessionGate::new("another-secret-another-secret-another", 3600).unwrap();
        let token = other.issue_at(42, 1_000);
        assert_eq!(gate().resolve_at(&token, 1_001), Err(ChatError::TokenInvalid));
    }

    #[test]
    fn tampered_claims_are_invalid() {
        let g = gate();
        let token = g.issue_at(42, 1_000);
        let (_, sig) = token.split_once('.').unwrap();
        let forged_claims = URL_SAFE_NO_PAD.encode(br#"{"sub":1,"iat":1000,"exp":99999}"#);
        let forged = format!("{}.{}", forged_claims, sig);
        assert_eq!(g.resolve_at(&forged, 1_001), Err(ChatError::TokenInvalid));
    }

    #[test]
    fn malformed_tokens_are_invalid() {
        let g = gate();
        for bad in ["garbage", "a.b.c", "!!!.###", "abc."] {
            assert_eq!(g.resolve_at(bad, 0), Err(ChatError::TokenInvalid), "{}", bad);
        }
    }

    #[test]
    fn bearer_header_variants() {
        let g = gate();
        let token = g.issue(7);
        assert_eq!(g.resolve_bearer(Some(&format!("Bearer {}", token))), Ok(7));
        assert_eq!(g.resolve_bearer(Some(&format!("bearer {}", token))), Ok(7));
        assert_eq!(g.resolve_bearer(None), Err(ChatError::Unauthenticated));
        assert_eq!(g.resolve_bearer(Some("   ")), Err(ChatError::Unauthenticated));
        assert_eq!(g.resolve_bearer(Some("Bearer ")), Err(ChatError::Unauthenticated));
        assert_eq!(g.resolve_bearer(Some("Basic dXNlcjpwYXNz")), Err(ChatError::TokenInvalid));
    }

    #[test]
    fn short_secret_is_rejected() {
        assert!(matches!(
            SessionGate::new("short", 60),
            Err(AuthSetupError::SecretTooShort(5))
        ));
        assert!(matches!(
            SessionGate::new(SECRET, 0),
            Err(AuthSetupError::InvalidTtl(0))
        ));
    }

    #[test]
    fn password_hash_verifies_only_the_original() {
        let hash = hash_password("hunter22").unwrap();
        assert!(hash.starts_with("$argon2id$"));
        assert!(verify_password("hunter22", &hash));
        assert!(!verify_password("hunter23", &hash));
        assert!(!verify_password("hunter22", "not-a-phc-string"));
    }
}

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use jsonwebtoken::{
    decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use serde::{Deserialize, Serialize};

use crate::store::Account;

/// Identity claims carried by a bearer token. Re-derived from the token on
/// every call, never stored server-side; expiry is the only revocation.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub username: String,
    /// Issued at (Unix seconds).
    pub iat: i64,
    /// Expiration (Unix seconds).
    pub exp: i64,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("token has expired")]
    Expired,
    #[error("token signature is invalid")]
    InvalidSignature,
    #[error("token is malformed")]
    Malformed,
}

/// Issues and verifies HS256-signed identity tokens under a single symmetric
/// server secret. No refresh or rotation: Login and Register reissue.
pub struct TokenManager {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    lifetime: Duration,
}

impl TokenManager {
    pub fn new(secret: &str, lifetime: Duration) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            lifetime,
        }
    }

    fn now() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64
    }

    /// Produce a fresh token for `account`, returning it with its expiration
    /// timestamp (Unix seconds).
    pub fn issue(&self, account: &Account) -> Result<(String, i64)> {
        let now = Self::now();
        let expires_at = now + self.lifetime.as_secs() as i64;
        let claims = Claims {
            username: account.username.clone(),
            iat: now,
            exp: expires_at,
        };

        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .context("could not sign access token")?;
        Ok((token, expires_at))
    }

    /// Verify signature and expiry in one step. Zero leeway: a token is
    /// valid up to its `exp` second and invalid after it.
    pub fn verify(&self, token: &str) -> Result<Claims, TokenError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;

        match decode::<Claims>(token, &self.decoding_key, &validation) {
            Ok(data) => Ok(data.claims),
            Err(e) => Err(match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => TokenError::Expired,
                jsonwebtoken::errors::ErrorKind::InvalidSignature
                | jsonwebtoken::errors::ErrorKind::InvalidAlgorithm => {
                    TokenError::InvalidSignature
                }
                _ => TokenError::Malformed,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account(username: &str) -> Account {
        Account {
            id: 1,
            username: username.into(),
            password_hash: "hash".into(),
            blocked: false,
        }
    }

    fn raw_token(secret: &str, username: &str, iat: i64, exp: i64) -> String {
        let claims = Claims {
            username: username.into(),
            iat,
            exp,
        };
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn issue_and_verify_round_trip() {
        let manager = TokenManager::new("server-secret", Duration::from_secs(120));
        let (token, expires_at) = manager.issue(&account("alice")).unwrap();

        let claims = manager.verify(&token).unwrap();
        assert_eq!(claims.username, "alice");
        assert_eq!(claims.exp, expires_at);
        assert!(claims.exp > claims.iat);
    }

    #[test]
    fn expired_token_fails_with_expiry_reason() {
        let manager = TokenManager::new("server-secret", Duration::from_secs(120));
        let now = TokenManager::now();
        let token = raw_token("server-secret", "alice", now - 200, now - 100);
        assert_eq!(manager.verify(&token).unwrap_err(), TokenError::Expired);
    }

    #[test]
    fn token_just_before_expiry_still_verifies() {
        let manager = TokenManager::new("server-secret", Duration::from_secs(120));
        let now = TokenManager::now();
        let token = raw_token("server-secret", "alice", now - 118, now + 2);
        assert!(manager.verify(&token).is_ok());
    }

    #[test]
    fn foreign_secret_fails_signature_check() {
        let manager = TokenManager::new("server-secret", Duration::from_secs(120));
        let now = TokenManager::now();
        let token = raw_token("some-other-secret", "alice", now, now + 100);
        assert_eq!(
            manager.verify(&token).unwrap_err(),
            TokenError::InvalidSignature
        );
    }

    #[test]
    fn garbage_is_malformed() {
        let manager = TokenManager::new("server-secret", Duration::from_secs(120));
        assert_eq!(
            manager.verify("not-a-token").unwrap_err(),
            TokenError::Malformed
        );
    }
}

//! Bearer Token Validation
//!
//! Validates JWTs issued by the external identity provider (the server
//! does NOT issue tokens - only validates them) and resolves them into
//! a [`UserIdentity`] for the REST surface.

use jsonwebtoken::{decode, Algorithm, DecodingKey, TokenData, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

use crate::race::model::{UserId, UserIdentity};

/// Authentication configuration.
#[derive(Clone, Debug, Default)]
pub struct AuthConfig {
    /// Expected issuer claim ("iss"). If None, any issuer accepted.
    pub issuer: Option<String>,
    /// RS256 public key in PEM format (preferred for external providers).
    pub public_key_pem: Option<String>,
    /// HS256 secret (fallback for simple setups).
    pub secret: Option<String>,
    /// Whether to skip expiry validation (for testing only).
    pub skip_expiry: bool,
}

impl AuthConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self {
            issuer: std::env::var("AUTH_ISSUER").ok(),
            public_key_pem: std::env::var("AUTH_PUBLIC_KEY_PEM").ok(),
            secret: std::env::var("AUTH_SECRET").ok(),
            skip_expiry: std::env::var("AUTH_SKIP_EXPIRY")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
        }
    }

    /// Check if authentication is configured.
    pub fn is_configured(&self) -> bool {
        self.public_key_pem.is_some() || self.secret.is_some()
    }
}

/// Claims we expect from the identity provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Subject - the user id from the identity provider.
    pub sub: String,
    /// Display name.
    #[serde(default)]
    pub username: Option<String>,
    /// Expiry timestamp (Unix seconds).
    #[serde(default)]
    pub exp: u64,
    /// Issued at timestamp.
    #[serde(default)]
    pub iat: u64,
    /// Issuer (identity provider).
    #[serde(default)]
    pub iss: Option<String>,
}

impl TokenClaims {
    /// Resolve the claims into a user identity.
    ///
    /// Providers with non-UUID subjects get a deterministic id derived
    /// from a SHA-256 digest of the subject string.
    pub fn identity(&self) -> UserIdentity {
        let id = UserId::parse(&self.sub).unwrap_or_else(|| {
            let mut hasher = Sha256::new();
            hasher.update(b"typerace-user:");
            hasher.update(self.sub.as_bytes());
            let hash = hasher.finalize();

            let mut bytes = [0u8; 16];
            bytes.copy_from_slice(&hash[..16]);
            UserId(Uuid::from_bytes(bytes))
        });

        let username = self
            .username
            .clone()
            .unwrap_or_else(|| format!("racer-{}", &self.sub[..self.sub.len().min(8)]));

        UserIdentity::new(id, username)
    }
}

/// Authentication errors.
#[derive(Debug, Error)]
pub enum AuthError {
    /// No authentication configured on server.
    #[error("authentication not configured")]
    NotConfigured,
    /// Token format is invalid.
    #[error("invalid token format")]
    InvalidFormat,
    /// Token signature verification failed.
    #[error("invalid signature")]
    InvalidSignature,
    /// Token has expired.
    #[error("token expired")]
    Expired,
    /// Issuer claim doesn't match expected value.
    #[error("invalid issuer")]
    InvalidIssuer,
    /// JWT decoding error.
    #[error("decode error: {0}")]
    Decode(String),
}

/// Validate a bearer token and resolve the caller's identity.
pub fn verify_token(config: &AuthConfig, token: &str) -> Result<UserIdentity, AuthError> {
    let (key, algorithm) = if let Some(pem) = &config.public_key_pem {
        let key = DecodingKey::from_rsa_pem(pem.as_bytes())
            .map_err(|e| AuthError::Decode(e.to_string()))?;
        (key, Algorithm::RS256)
    } else if let Some(secret) = &config.secret {
        (DecodingKey::from_secret(secret.as_bytes()), Algorithm::HS256)
    } else {
        return Err(AuthError::NotConfigured);
    };

    let mut validation = Validation::new(algorithm);
    validation.validate_exp = !config.skip_expiry;
    if let Some(issuer) = &config.issuer {
        validation.set_issuer(&[issuer]);
    }
    // Audience claims vary by provider; not enforced here
    validation.validate_aud = false;

    let data: TokenData<TokenClaims> = decode(token, &key, &validation).map_err(|e| {
        use jsonwebtoken::errors::ErrorKind;
        match e.kind() {
            ErrorKind::ExpiredSignature => AuthError::Expired,
            ErrorKind::InvalidSignature => AuthError::InvalidSignature,
            ErrorKind::InvalidIssuer => AuthError::InvalidIssuer,
            ErrorKind::InvalidToken => AuthError::InvalidFormat,
            _ => AuthError::Decode(e.to_string()),
        }
    })?;

    Ok(data.claims.identity())
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn hs256_config() -> AuthConfig {
        AuthConfig {
            secret: Some("test-secret".into()),
            skip_expiry: true,
            ..Default::default()
        }
    }

    fn sign(claims: &TokenClaims, secret: &str) -> String {
        encode(
            &Header::new(Algorithm::HS256),
            claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn claims(sub: &str, username: Option<&str>) -> TokenClaims {
        TokenClaims {
            sub: sub.into(),
            username: username.map(String::from),
            exp: 0,
            iat: 0,
            iss: None,
        }
    }

    #[test]
    fn test_not_configured() {
        let result = verify_token(&AuthConfig::default(), "whatever");
        assert!(matches!(result, Err(AuthError::NotConfigured)));
    }

    #[test]
    fn test_valid_hs256_token() {
        let config = hs256_config();
        let user_id = UserId::generate();
        let token = sign(&claims(&user_id.to_string(), Some("alice")), "test-secret");

        let identity = verify_token(&config, &token).unwrap();
        assert_eq!(identity.id, user_id);
        assert_eq!(identity.username, "alice");
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let config = hs256_config();
        let token = sign(&claims("user-1", Some("alice")), "other-secret");

        let result = verify_token(&config, &token);
        assert!(matches!(result, Err(AuthError::InvalidSignature)));
    }

    #[test]
    fn test_garbage_token_rejected() {
        let config = hs256_config();
        assert!(verify_token(&config, "not-a-jwt").is_err());
    }

    #[test]
    fn test_non_uuid_subject_derives_stable_id() {
        let config = hs256_config();
        let token_a = sign(&claims("provider|12345", None), "test-secret");
        let token_b = sign(&claims("provider|12345", None), "test-secret");

        let a = verify_token(&config, &token_a).unwrap();
        let b = verify_token(&config, &token_b).unwrap();
        assert_eq!(a.id, b.id);
        assert!(a.username.starts_with("racer-"));

        let other = sign(&claims("provider|99999", None), "test-secret");
        let c = verify_token(&config, &other).unwrap();
        assert_ne!(a.id, c.id);
    }

    #[test]
    fn test_issuer_enforced_when_configured() {
        let config = AuthConfig {
            issuer: Some("https://auth.example".into()),
            ..hs256_config()
        };

        let mut wrong = claims("user-1", Some("alice"));
        wrong.iss = Some("https://rogue.example".into());
        let result = verify_token(&config, &sign(&wrong, "test-secret"));
        assert!(matches!(result, Err(AuthError::InvalidIssuer)));

        let mut right = claims("user-1", Some("alice"));
        right.iss = Some("https://auth.example".into());
        assert!(verify_token(&config, &sign(&right, "test-secret")).is_ok());
    }
}

//! Signed bearer credentials (HS256 JWT).
//!
//! The role is embedded at issue time and trusted until the token expires,
//! so a role change takes effect for a user only on their next login.

use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use ulid::Ulid;

use crate::guard::Actor;
use crate::model::Role;

#[derive(Clone)]
pub struct CredentialConfig {
    pub secret: Vec<u8>,
    pub ttl_secs: u64,
    pub issuer: String,
}

impl std::fmt::Debug for CredentialConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialConfig")
            .field("secret", &"<redacted>")
            .field("ttl_secs", &self.ttl_secs)
            .field("issuer", &self.issuer)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Identity id (ULID string).
    pub sub: String,
    pub role: Role,
    pub iss: String,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("credential expired")]
    Expired,
    #[error("invalid credential: {0}")]
    Invalid(String),
    #[error("credential crypto error: {0}")]
    Crypto(String),
}

pub fn issue(actor: &Actor, config: &CredentialConfig) -> Result<String, CredentialError> {
    issue_at(actor, config, Utc::now().timestamp())
}

/// Issue with an explicit `iat` (Unix seconds).
pub fn issue_at(actor: &Actor, config: &CredentialConfig, now: i64) -> Result<String, CredentialError> {
    let claims = Claims {
        sub: actor.id.to_string(),
        role: actor.role,
        iss: config.issuer.clone(),
        iat: now,
        exp: now + config.ttl_secs as i64,
    };
    let key = EncodingKey::from_secret(&config.secret);
    jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &key)
        .map_err(|e| CredentialError::Crypto(format!("JWT encode: {e}")))
}

/// Check signature, issuer and expiry, and return the embedded identity.
pub fn verify(token: &str, config: &CredentialConfig) -> Result<Actor, CredentialError> {
    let key = DecodingKey::from_secret(&config.secret);
    let mut validation = Validation::new(Algorithm::HS256);
    validation.set_issuer(&[&config.issuer]);
    validation.set_required_spec_claims(&["sub", "exp", "iat", "iss"]);
    validation.leeway = 0;

    let claims = jsonwebtoken::decode::<Claims>(token, &key, &validation)
        .map(|data| data.claims)
        .map_err(|e| match e.kind() {
            jsonwebtoken::errors::ErrorKind::ExpiredSignature => CredentialError::Expired,
            _ => CredentialError::Invalid(e.to_string()),
        })?;

    let id = Ulid::from_string(&claims.sub)
        .map_err(|e| CredentialError::Invalid(format!("bad subject: {e}")))?;
    Ok(Actor {
        id,
        role: claims.role,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> CredentialConfig {
        CredentialConfig {
            secret: b"test-secret-with-enough-bytes-0123456789".to_vec(),
            ttl_secs: 3600,
            issuer: "bookmyroom-test".into(),
        }
    }

    #[test]
    fn roundtrip_carries_identity() {
        let actor = Actor { id: Ulid::new(), role: Role::Admin };
        let token = issue(&actor, &config()).unwrap();
        assert_eq!(verify(&token, &config()).unwrap(), actor);
    }

    #[test]
    fn expired_token_rejected() {
        let actor = Actor { id: Ulid::new(), role: Role::Standard };
        let issued = Utc::now().timestamp() - 7200;
        let token = issue_at(&actor, &config(), issued).unwrap();
        assert!(matches!(verify(&token, &config()), Err(CredentialError::Expired)));
    }

    #[test]
    fn wrong_secret_rejected() {
        let actor = Actor { id: Ulid::new(), role: Role::Standard };
        let token = issue(&actor, &config()).unwrap();
        let mut other = config();
        other.secret = b"another-secret-another-secret-0000".to_vec();
        assert!(matches!(verify(&token, &other), Err(CredentialError::Invalid(_))));
    }

    #[test]
    fn wrong_issuer_rejected() {
        let actor = Actor { id: Ulid::new(), role: Role::Standard };
        let token = issue(&actor, &config()).unwrap();
        let mut other = config();
        other.issuer = "someone-else".into();
        assert!(verify(&token, &other).is_err());
    }

    #[test]
    fn garbage_rejected() {
        assert!(matches!(
            verify("not.a.token", &config()),
            Err(CredentialError::Invalid(_))
        ));
    }

    #[test]
    fn debug_redacts_secret() {
        let rendered = format!("{:?}", config());
        assert!(!rendered.contains("test-secret"));
    }
}

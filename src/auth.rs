//! Bearer credential verification for the connection handshake.
//!
//! Credentials are HS256 JWTs signed with a shared secret; the `sub` claim
//! carries the subject id and `exp` bounds the credential's lifetime. All
//! failure modes — missing, malformed, expired, wrong signature, non-UUID
//! subject — collapse into one `InvalidCredential` so a caller cannot probe
//! which check rejected it.

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// JWT claim set the gateway cares about.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// Subject id as a UUID string.
    pub sub: String,
    /// Expiry, seconds since the UNIX epoch.
    pub exp: u64,
}

/// Authentication errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("invalid credential")]
    InvalidCredential,
}

/// Verify a bearer credential and extract the subject id.
///
/// Stateless and deterministic given the secret and the clock.
pub fn verify_credential(token: &str, secret: &str) -> Result<Uuid, AuthError> {
    let key = DecodingKey::from_secret(secret.as_bytes());
    let validation = Validation::new(Algorithm::HS256);
    let data = jsonwebtoken::decode::<Claims>(token, &key, &validation)
        .map_err(|_| AuthError::InvalidCredential)?;
    Uuid::parse_str(&data.claims.sub).map_err(|_| AuthError::InvalidCredential)
}

/// Sign a credential for the given subject.
///
/// Token minting is external to the gateway; this exists for harnesses and
/// embedding hosts that need a signed token to hand to a client.
pub fn mint_credential(subject: Uuid, secret: &str, ttl_secs: u64) -> String {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let claims = Claims {
        sub: subject.to_string(),
        exp: now + ttl_secs,
    };
    let key = EncodingKey::from_secret(secret.as_bytes());
    jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &key)
        .unwrap_or_default()
}

/// Pull the bearer token out of handshake metadata.
///
/// Accepts either an `Authorization: Bearer <t>` header or a `token=<t>`
/// query parameter, header winning when both are present.
pub fn extract_bearer(auth_header: Option<&str>, query: Option<&str>) -> Option<String> {
    if let Some(header) = auth_header {
        if let Some(token) = header.strip_prefix("Bearer ") {
            if !token.is_empty() {
                return Some(token.to_string());
            }
        }
    }
    query?
        .split('&')
        .find_map(|pair| pair.strip_prefix("token="))
        .filter(|t| !t.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "test-secret";

    #[test]
    fn test_mint_and_verify() {
        let subject = Uuid::new_v4();
        let token = mint_credential(subject, SECRET, 60);
        assert_eq!(verify_credential(&token, SECRET), Ok(subject));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let token = mint_credential(Uuid::new_v4(), SECRET, 60);
        assert_eq!(
            verify_credential(&token, "other-secret"),
            Err(AuthError::InvalidCredential)
        );
    }

    #[test]
    fn test_expired_rejected() {
        // jsonwebtoken applies default leeway (60s), so expire well in the past
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs();
        let claims = Claims {
            sub: Uuid::new_v4().to_string(),
            exp: now - 600,
        };
        let key = EncodingKey::from_secret(SECRET.as_bytes());
        let token =
            jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &key).unwrap();
        assert_eq!(
            verify_credential(&token, SECRET),
            Err(AuthError::InvalidCredential)
        );
    }

    #[test]
    fn test_malformed_rejected() {
        assert_eq!(
            verify_credential("", SECRET),
            Err(AuthError::InvalidCredential)
        );
        assert_eq!(
            verify_credential("not.a.jwt", SECRET),
            Err(AuthError::InvalidCredential)
        );
    }

    #[test]
    fn test_non_uuid_subject_rejected() {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs();
        let claims = Claims {
            sub: "user-42".to_string(),
            exp: now + 60,
        };
        let key = EncodingKey::from_secret(SECRET.as_bytes());
        let token =
            jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &key).unwrap();
        assert_eq!(
            verify_credential(&token, SECRET),
            Err(AuthError::InvalidCredential)
        );
    }

    #[test]
    fn test_extract_bearer_header() {
        let token = extract_bearer(Some("Bearer abc123"), None);
        assert_eq!(token.as_deref(), Some("abc123"));
    }

    #[test]
    fn test_extract_bearer_query() {
        let token = extract_bearer(None, Some("room=x&token=abc123&v=2"));
        assert_eq!(token.as_deref(), Some("abc123"));
    }

    #[test]
    fn test_extract_bearer_header_wins() {
        let token = extract_bearer(Some("Bearer from-header"), Some("token=from-query"));
        assert_eq!(token.as_deref(), Some("from-header"));
    }

    #[test]
    fn test_extract_bearer_missing() {
        assert_eq!(extract_bearer(None, None), None);
        assert_eq!(extract_bearer(Some("Basic xyz"), None), None);
        assert_eq!(extract_bearer(Some("Bearer "), Some("token=")), None);
    }
}

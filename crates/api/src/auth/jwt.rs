//! Bearer token verification
//!
//! Tokens are minted by the identity service that fronts the storefront; this
//! side only checks the HS256 signature and expiry and reads the actor.

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use super::AuthError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Seller,
    Customer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Actor id; for sellers this is the seller id.
    pub sub: Uuid,
    pub role: Role,
    pub exp: i64,
}

#[derive(Clone)]
pub struct JwtManager {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtManager {
    pub fn new(secret: &str) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }

    /// Mint a token. Used by operator tooling and tests.
    pub fn issue(&self, sub: Uuid, role: Role, ttl: Duration) -> Result<String, AuthError> {
        let claims = Claims {
            sub,
            role,
            exp: (OffsetDateTime::now_utc() + ttl).unix_timestamp(),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key).map_err(|e| {
            tracing::error!(error = %e, "Failed to encode token");
            AuthError::Internal(e.to_string())
        })
    }

    pub fn validate(&self, token: &str) -> Result<Claims, AuthError> {
        decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| {
                tracing::debug!(error = %e, "Token rejected");
                AuthError::InvalidToken
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "test-secret-with-enough-entropy-0123456789";

    #[test]
    fn test_issue_then_validate() {
        let jwt = JwtManager::new(SECRET);
        let seller = Uuid::new_v4();
        let token = jwt.issue(seller, Role::Seller, Duration::hours(1)).unwrap();

        let claims = jwt.validate(&token).unwrap();
        assert_eq!(claims.sub, seller);
        assert_eq!(claims.role, Role::Seller);
    }

    #[test]
    fn test_expired_token_rejected() {
        let jwt = JwtManager::new(SECRET);
        let token = jwt
            .issue(Uuid::new_v4(), Role::Admin, Duration::hours(-2))
            .unwrap();
        assert!(matches!(jwt.validate(&token), Err(AuthError::InvalidToken)));
    }

    #[test]
    fn test_foreign_secret_rejected() {
        let ours = JwtManager::new(SECRET);
        let theirs = JwtManager::new("some-other-secret-entirely-9876543210");
        let token = theirs
            .issue(Uuid::new_v4(), Role::Admin, Duration::hours(1))
            .unwrap();
        assert!(matches!(ours.validate(&token), Err(AuthError::InvalidToken)));
    }

    #[test]
    fn test_role_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Role::Customer).unwrap(), "\"customer\"");
    }
}

use async_trait::async_trait;
use jsonwebtoken::{decode, encode, errors::ErrorKind, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::collaborators::AuthValidator;
use crate::error::AuthError;

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: i64,
    pub exp: usize,
    pub iat: usize,
}

/// HS256 bearer-token validator backed by a shared secret. The issuing
/// side is an external service; this only needs to agree on the claims.
pub struct JwtValidator {
    decoding_key: DecodingKey,
}

impl JwtValidator {
    pub fn new(secret: &str) -> Self {
        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
        }
    }
}

#[async_trait]
impl AuthValidator for JwtValidator {
    async fn validate(&self, token: &str) -> Result<i64, AuthError> {
        decode::<Claims>(token, &self.decoding_key, &Validation::default())
            .map(|data| data.claims.sub)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::TokenExpired,
                _ => AuthError::InvalidToken,
            })
    }
}

/// Mint a token for tooling and tests. Production tokens come from the
/// external auth service.
pub fn create_token(user_id: i64, secret: &str, expiry_secs: u64) -> Result<String, AuthError> {
    let now = chrono::Utc::now().timestamp() as usize;
    let claims = Claims {
        sub: user_id,
        iat: now,
        exp: now + expiry_secs as usize,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| AuthError::Internal(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_a_valid_token() {
        let token = create_token(42, "s3cret", 60).unwrap();
        let validator = JwtValidator::new("s3cret");
        assert_eq!(validator.validate(&token).await.unwrap(), 42);
    }

    #[tokio::test]
    async fn rejects_wrong_secret() {
        let token = create_token(42, "s3cret", 60).unwrap();
        let validator = JwtValidator::new("other");
        assert!(matches!(
            validator.validate(&token).await,
            Err(AuthError::InvalidToken)
        ));
    }

    #[tokio::test]
    async fn rejects_expired_token() {
        let now = chrono::Utc::now().timestamp() as usize;
        let claims = Claims {
            sub: 42,
            iat: now - 600,
            exp: now - 300,
        };
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(b"s3cret"),
        )
        .unwrap();
        let validator = JwtValidator::new("s3cret");
        assert!(matches!(
            validator.validate(&token).await,
            Err(AuthError::TokenExpired)
        ));
    }
}

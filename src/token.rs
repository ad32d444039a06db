//! Token verification boundary
//!
//! Issuing tokens is somebody else's job. The engine only needs to turn a
//! bearer token into a [`Context`] and to map token failures onto its own
//! `Unauthorized` outcome.

use async_trait::async_trait;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::context::Context;
use crate::error::{AppError, AppResult};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("token invalid")]
    Invalid,

    #[error("token expired")]
    Expired,
}

impl From<jsonwebtoken::errors::Error> for TokenError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        match err.kind() {
            jsonwebtoken::errors::ErrorKind::ExpiredSignature => TokenError::Expired,
            _ => TokenError::Invalid,
        }
    }
}

// The caller only learns that authentication failed, not why.
impl From<TokenError> for AppError {
    fn from(err: TokenError) -> Self {
        tracing::debug!("Token rejected: {}", err);
        AppError::Unauthorized
    }
}

/// Who a verified token speaks for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subject {
    pub tenant_id: i64,
    pub user_id: i64,
}

#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<Subject, TokenError>;
}

/// Claims carried by access tokens
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User id
    pub sub: String,
    /// Tenant id
    pub tid: i64,
    /// Expiry (unix seconds)
    pub exp: usize,
}

/// HS256 JWT verifier
pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn hs256(secret: &[u8]) -> Self {
        Self {
            key: DecodingKey::from_secret(secret),
            validation: Validation::new(Algorithm::HS256),
        }
    }
}

#[async_trait]
impl TokenVerifier for JwtVerifier {
    async fn verify(&self, token: &str) -> Result<Subject, TokenError> {
        let token = token.strip_prefix("Bearer ").unwrap_or(token).trim();
        let data = decode::<Claims>(token, &self.key, &self.validation)?;
        let user_id = data.claims.sub.parse().map_err(|_| TokenError::Invalid)?;
        Ok(Subject {
            tenant_id: data.claims.tid,
            user_id,
        })
    }
}

/// Verify a bearer token and open a context for its subject
pub async fn authenticate(verifier: &dyn TokenVerifier, token: &str) -> AppResult<Context> {
    let subject = verifier.verify(token).await?;
    Ok(Context::new(subject.tenant_id, subject.user_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    const SECRET: &[u8] = b"test-secret";

    fn token(exp: i64) -> String {
        let claims = Claims {
            sub: "42".to_string(),
            tid: 7,
            exp: exp as usize,
        };
        encode(&Header::default(), &claims, &EncodingKey::from_secret(SECRET)).unwrap()
    }

    #[tokio::test]
    async fn test_valid_token() {
        let verifier = JwtVerifier::hs256(SECRET);
        let bearer = format!("Bearer {}", token(chrono::Utc::now().timestamp() + 3600));
        let ctx = authenticate(&verifier, &bearer).await.unwrap();
        assert_eq!(ctx.tenant_id(), 7);
        assert_eq!(ctx.user_id(), 42);
    }

    #[tokio::test]
    async fn test_expired_token() {
        let verifier = JwtVerifier::hs256(SECRET);
        let expired = token(chrono::Utc::now().timestamp() - 3600);
        assert_eq!(verifier.verify(&expired).await, Err(TokenError::Expired));
        let err = authenticate(&verifier, &expired).await.unwrap_err();
        assert!(matches!(err, AppError::Unauthorized));
    }

    #[tokio::test]
    async fn test_garbage_token() {
        let verifier = JwtVerifier::hs256(SECRET);
        assert_eq!(verifier.verify("not-a-jwt").await, Err(TokenError::Invalid));
        let other = JwtVerifier::hs256(b"other-secret");
        let forged = token(chrono::Utc::now().timestamp() + 3600);
        assert_eq!(other.verify(&forged).await, Err(TokenError::Invalid));
    }
}

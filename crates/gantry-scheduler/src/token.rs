//! Short-lived execution tokens scoped to one task.
//!
//! Tokens are HS256 JWTs so runners can read the claims with any JWT library.

use chrono::{DateTime, TimeDelta, Utc};
use gantry_core::{Error, JobId, RunId, TaskId};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeClaims {
    pub task_id: TaskId,
    pub job_id: JobId,
    pub run_id: RunId,
    /// Issue time as a unix timestamp.
    pub iat: i64,
    pub nbf: i64,
    /// Expiry as a unix timestamp.
    pub exp: i64,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("malformed token")]
    Malformed,

    #[error("invalid token signature")]
    BadSignature,

    #[error("token expired")]
    Expired,
}

impl From<TokenError> for Error {
    fn from(e: TokenError) -> Self {
        Error::Unauthorized(e.to_string())
    }
}

#[derive(Clone)]
pub struct TokenSigner {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl: TimeDelta,
}

impl TokenSigner {
    pub fn new(key: &[u8], ttl: TimeDelta) -> Self {
        Self {
            encoding: EncodingKey::from_secret(key),
            decoding: DecodingKey::from_secret(key),
            ttl,
        }
    }

    pub fn mint(
        &self,
        task_id: TaskId,
        job_id: JobId,
        run_id: RunId,
        now: DateTime<Utc>,
    ) -> gantry_core::Result<String> {
        let expires = now.checked_add_signed(self.ttl).ok_or_else(|| {
            Error::InvalidInput(format!("token ttl {} is out of range", self.ttl))
        })?;
        let claims = RuntimeClaims {
            task_id,
            job_id,
            run_id,
            iat: now.timestamp(),
            nbf: now.timestamp(),
            exp: expires.timestamp(),
        };
        jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| Error::Internal(format!("failed to sign runtime token: {}", e)))
    }

    /// Check the signature and expiry of `token` against `now`.
    pub fn verify(&self, token: &str, now: DateTime<Utc>) -> Result<RuntimeClaims, TokenError> {
        let mut validation = Validation::new(Algorithm::HS256);
        // Expiry is checked against the caller's clock below.
        validation.validate_exp = false;

        let claims = jsonwebtoken::decode::<RuntimeClaims>(token, &self.decoding, &validation)
            .map_err(|e| match e.kind() {
                ErrorKind::InvalidSignature => TokenError::BadSignature,
                _ => TokenError::Malformed,
            })?
            .claims;
        if claims.exp <= now.timestamp() {
            return Err(TokenError::Expired);
        }
        Ok(claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signer() -> TokenSigner {
        TokenSigner::new(b"secret", TimeDelta::hours(3))
    }

    #[test]
    fn test_mint_and_verify() {
        let now = Utc::now();
        let token = signer()
            .mint(TaskId::new(3), JobId::new(2), RunId::new(1), now)
            .unwrap();

        let claims = signer().verify(&token, now).unwrap();
        assert_eq!(claims.task_id, TaskId::new(3));
        assert_eq!(claims.job_id, JobId::new(2));
        assert_eq!(claims.run_id, RunId::new(1));
        assert_eq!(claims.exp - claims.iat, 3 * 3600);
    }

    #[test]
    fn test_token_is_a_standard_jwt() {
        let token = signer()
            .mint(TaskId::new(3), JobId::new(2), RunId::new(1), Utc::now())
            .unwrap();

        assert_eq!(token.split('.').count(), 3);
        let header = jsonwebtoken::decode_header(&token).unwrap();
        assert_eq!(header.alg, Algorithm::HS256);
    }

    #[test]
    fn test_expired_token() {
        let now = Utc::now();
        let token = signer()
            .mint(TaskId::new(3), JobId::new(2), RunId::new(1), now)
            .unwrap();

        assert_eq!(
            signer().verify(&token, now + TimeDelta::hours(4)),
            Err(TokenError::Expired)
        );
    }

    #[test]
    fn test_tampered_token() {
        let now = Utc::now();
        let token = signer()
            .mint(TaskId::new(3), JobId::new(2), RunId::new(1), now)
            .unwrap();
        let other = TokenSigner::new(b"other", TimeDelta::hours(3));

        assert_eq!(other.verify(&token, now), Err(TokenError::BadSignature));
        assert_eq!(signer().verify("garbage", now), Err(TokenError::Malformed));
    }

    #[test]
    fn test_out_of_range_ttl() {
        let signer = TokenSigner::new(b"secret", TimeDelta::MAX);
        let err = signer
            .mint(TaskId::new(3), JobId::new(2), RunId::new(1), Utc::now())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }
}

//! JWT user tokens.
//!
//! Tokens are HS256 with the issuing app as subject, the user id as audience
//! and the user's details embedded as `userinfo`. Keys are compiled once and
//! shared through `Arc`.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// User details embedded in a token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub attrs: BTreeMap<String, String>,
}

/// JWT claims structure following RFC 7519.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (app id)
    pub sub: String,
    /// Audience (user id)
    pub aud: String,
    pub iss: String,
    pub jti: String,
    pub exp: i64,
    pub iat: i64,
    pub nbf: i64,
    pub userinfo: UserInfo,
}

/// JWT errors.
#[derive(Debug, thiserror::Error)]
pub enum JwtError {
    #[error("invalid or expired token")]
    InvalidToken,
    #[error("invalid claim: {0}")]
    InvalidClaim(&'static str),
    #[error("token encoding failed: {0}")]
    Encoding(#[source] jsonwebtoken::errors::Error),
}

/// Issues and validates user tokens with cached keys.
#[derive(Clone)]
pub struct JwtValidator {
    encoding_key: Arc<EncodingKey>,
    decoding_key: Arc<DecodingKey>,
    issuer: String,
    validation: Validation,
}

impl JwtValidator {
    #[must_use]
    pub fn new(secret: &SecretString, issuer: impl Into<String>) -> Self {
        let issuer = issuer.into();
        let secret_bytes = secret.expose_secret().as_bytes();

        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[issuer.as_str()]);
        // Audience is per user and checked against `userinfo.id`
        validation.validate_aud = false;
        validation.validate_nbf = true;

        Self {
            encoding_key: Arc::new(EncodingKey::from_secret(secret_bytes)),
            decoding_key: Arc::new(DecodingKey::from_secret(secret_bytes)),
            issuer,
            validation,
        }
    }

    /// Issue a token for `user` on behalf of `app_id`.
    ///
    /// # Errors
    /// Returns [`JwtError::Encoding`] if signing fails.
    pub fn issue(&self, app_id: &str, user: &UserInfo, ttl: Duration) -> Result<String, JwtError> {
        let now = Utc::now();

        let claims = Claims {
            sub: app_id.to_string(),
            aud: user.id.clone(),
            iss: self.issuer.clone(),
            jti: Uuid::new_v4().to_string(),
            exp: (now + ttl).timestamp(),
            iat: now.timestamp(),
            nbf: now.timestamp(),
            userinfo: user.clone(),
        };

        encode(&Header::default(), &claims, &self.encoding_key).map_err(JwtError::Encoding)
    }

    /// Validate `token` and return the embedded user.
    ///
    /// When `app_id` is given the token must have been issued for that app.
    ///
    /// # Errors
    /// Returns [`JwtError`] for bad signatures, expired tokens or mismatched claims.
    pub fn validate(&self, token: &str, app_id: Option<&str>) -> Result<UserInfo, JwtError> {
        let claims = decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map_err(|_| JwtError::InvalidToken)?
            .claims;

        if claims.aud != claims.userinfo.id {
            return Err(JwtError::InvalidClaim("aud"));
        }
        if let Some(app_id) = app_id
            && claims.sub != app_id
        {
            return Err(JwtError::InvalidClaim("sub"));
        }

        Ok(claims.userinfo)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> JwtValidator {
        JwtValidator::new(&SecretString::from("test_secret_key_minimum_32_chars!"), "gateway")
    }

    fn user() -> UserInfo {
        UserInfo {
            id: "u-42".to_string(),
            name: "Ada".to_string(),
            attrs: BTreeMap::from([("tier".to_string(), "gold".to_string())]),
        }
    }

    #[test]
    fn issue_and_validate() {
        let validator = validator();
        let token = validator.issue("app-1", &user(), Duration::minutes(15)).unwrap();
        assert_eq!(validator.validate(&token, Some("app-1")).unwrap(), user());
        assert_eq!(validator.validate(&token, None).unwrap(), user());
    }

    #[test]
    fn token_for_other_app_rejected() {
        let validator = validator();
        let token = validator.issue("app-1", &user(), Duration::minutes(15)).unwrap();
        assert!(matches!(
            validator.validate(&token, Some("app-2")),
            Err(JwtError::InvalidClaim("sub"))
        ));
    }

    #[test]
    fn expired_or_foreign_tokens_rejected() {
        let validator = validator();
        let expired = validator.issue("app-1", &user(), Duration::minutes(-10)).unwrap();
        assert!(matches!(validator.validate(&expired, None), Err(JwtError::InvalidToken)));

        let other = JwtValidator::new(&SecretString::from("another_secret_key_of_32_chars!!"), "gateway");
        let token = other.issue("app-1", &user(), Duration::minutes(15)).unwrap();
        assert!(matches!(validator.validate(&token, None), Err(JwtError::InvalidToken)));

        assert!(validator.validate("invalid.token.here", None).is_err());
    }
}

//! Provider contracts for the pipeline stages.
//!
//! Providers own identity, crypto, signature and permission data. The gateway
//! only calls them, bounded by the configured timeout.

pub mod jwt;

use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use axum::body::Bytes;
use gateway_core::{ApiError, BoxError};

use crate::principal::{AppPrincipal, UserPrincipal};

pub use jwt::JwtUserProvider;

/// Provider call failures.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("{0}")]
    Rejected(String),
    #[error("provider unavailable: {0}")]
    Unavailable(#[source] BoxError),
    #[error("provider call timed out after {0:?}")]
    Timeout(Duration),
    /// Provider-defined error kept as the cause so its own code reaches the client.
    #[error(transparent)]
    Api(#[from] ApiError),
}

impl ProviderError {
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected(reason.into())
    }

    pub fn unavailable(err: impl Into<BoxError>) -> Self {
        Self::Unavailable(err.into())
    }

    /// Cause to attach to the stage's `ApiError`.
    #[must_use]
    pub fn into_cause(self) -> BoxError {
        match self {
            Self::Api(err) => Box::new(err),
            other => Box::new(other),
        }
    }
}

/// Request fields a signature covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignSubject<'a> {
    pub app_id: &'a str,
    pub user_id: &'a str,
    pub method: &'a str,
    pub uri: &'a str,
}

/// Parsed `signature-timestamp-nonce` token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignToken {
    pub signature: String,
    pub timestamp: String,
    pub nonce: String,
}

/// Malformed sign tokens.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignTokenError {
    #[error("signature format error")]
    Format,
    #[error("signature not contain 3 segment")]
    Segments,
}

impl SignToken {
    #[must_use]
    pub fn new(
        signature: impl Into<String>,
        timestamp: impl Into<String>,
        nonce: impl Into<String>,
    ) -> Self {
        Self {
            signature: signature.into(),
            timestamp: timestamp.into(),
            nonce: nonce.into(),
        }
    }
}

impl FromStr for SignToken {
    type Err = SignTokenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if !s.contains('-') {
            return Err(SignTokenError::Format);
        }
        let mut segments = s.split('-');
        match (segments.next(), segments.next(), segments.next(), segments.next()) {
            (Some(signature), Some(timestamp), Some(nonce), None) => {
                Ok(Self::new(signature, timestamp, nonce))
            }
            _ => Err(SignTokenError::Segments),
        }
    }
}

impl fmt::Display for SignToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.signature, self.timestamp, self.nonce)
    }
}

/// Resolves the calling app.
#[tonic::async_trait]
pub trait AppProvider: Send + Sync + 'static {
    /// Fetch `app_id` for `project`, validating it when `validate` is set.
    async fn get_valid_app(
        &self,
        app_id: &str,
        project: u32,
        validate: bool,
    ) -> Result<AppPrincipal, ProviderError>;
}

/// Resolves a user from a token.
#[tonic::async_trait]
pub trait UserProvider: Send + Sync + 'static {
    async fn get_token_user(
        &self,
        request_id: &str,
        app_id: &str,
        token: &str,
    ) -> Result<UserPrincipal, ProviderError>;
}

/// Body encryption.
#[tonic::async_trait]
pub trait CryptProvider: Send + Sync + 'static {
    async fn decrypt(
        &self,
        app_id: &str,
        user_id: &str,
        iv: &[u8],
        data: Bytes,
    ) -> Result<Bytes, ProviderError>;

    async fn encrypt(
        &self,
        app_id: &str,
        user_id: &str,
        iv: &[u8],
        data: Bytes,
    ) -> Result<Bytes, ProviderError>;
}

/// Request signature checks.
#[tonic::async_trait]
pub trait SignProvider: Send + Sync + 'static {
    async fn validate(&self, subject: SignSubject<'_>, token: &SignToken) -> Result<(), ProviderError>;

    async fn generate(&self, subject: SignSubject<'_>) -> Result<SignToken, ProviderError>;
}

/// Route permission checks. An error denies access.
#[tonic::async_trait]
pub trait PermissionProvider: Send + Sync + 'static {
    async fn can(
        &self,
        app_id: &str,
        user_id: &str,
        method: &str,
        template: &str,
    ) -> Result<(), ProviderError>;
}

/// Await `call`, failing with [`ProviderError::Timeout`] after `limit`.
///
/// `None` waits indefinitely.
pub async fn bounded<T, F>(limit: Option<Duration>, call: F) -> Result<T, ProviderError>
where
    F: Future<Output = Result<T, ProviderError>>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, call)
            .await
            .map_err(|_| ProviderError::Timeout(limit))?,
        None => call.await,
    }
}

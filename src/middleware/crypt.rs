//! Body encryption stage.
//!
//! Decrypts the request body before the handler and encrypts every
//! non-failure response body after it. Responses without content stay empty. Key material is selected by the provider from the
//! app id, user id and the client IV header.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::{Body, Bytes};
use gateway_core::{ApiError, HttpStatus, code};
use http::header::CONTENT_LENGTH;
use http::{Request, Response, StatusCode};
use tower::{Layer, Service};
use tracing::debug;

use super::{HeaderNames, StageName, header_str, is_failure, reject, request_id_of};
use crate::providers::{CryptProvider, bounded};

/// Crypt stage configuration.
pub struct CryptStage {
    pub provider: Arc<dyn CryptProvider>,
    pub headers: Arc<HeaderNames>,
    /// Largest request or response body buffered for the provider.
    pub max_body_bytes: usize,
    pub timeout: Option<Duration>,
}

struct Keys {
    app_id: String,
    user_id: String,
    iv: Vec<u8>,
}

impl CryptStage {
    async fn decrypt(&self, keys: &Keys, body: Body) -> Result<Bytes, ApiError> {
        let cipher = axum::body::to_bytes(body, self.max_body_bytes)
            .await
            .map_err(|e| ApiError::wrap(HttpStatus::BadRequest, code::DECRYPT_FAILED, e))?;

        bounded(
            self.timeout,
            self.provider.decrypt(&keys.app_id, &keys.user_id, &keys.iv, cipher),
        )
        .await
        .map_err(|e| ApiError::wrap(HttpStatus::BadRequest, code::DECRYPT_FAILED, e.into_cause()))
    }

    async fn encrypt(&self, keys: &Keys, body: Body) -> Result<Bytes, ApiError> {
        let plain = axum::body::to_bytes(body, self.max_body_bytes)
            .await
            .map_err(|e| ApiError::internal_code(code::ENCRYPT_FAILED, e))?;

        bounded(
            self.timeout,
            self.provider.encrypt(&keys.app_id, &keys.user_id, &keys.iv, plain),
        )
        .await
        .map_err(|e| ApiError::wrap(HttpStatus::Internal, code::ENCRYPT_FAILED, e.into_cause()))
    }
}

/// Tower layer for the crypt stage. `None` passes requests through.
#[derive(Clone, Default)]
pub struct CryptLayer {
    stage: Option<Arc<CryptStage>>,
}

impl CryptLayer {
    #[must_use]
    pub const fn new(stage: Option<Arc<CryptStage>>) -> Self {
        Self { stage }
    }
}

impl<S> Layer<S> for CryptLayer {
    type Service = CryptMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        CryptMiddleware {
            inner,
            stage: self.stage.clone(),
        }
    }
}

/// Crypt stage middleware service.
#[derive(Clone)]
pub struct CryptMiddleware<S> {
    inner: S,
    stage: Option<Arc<CryptStage>>,
}

impl<S> Service<Request<Body>> for CryptMiddleware<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let mut inner = self.inner.clone();
        let Some(stage) = self.stage.clone() else {
            return Box::pin(async move { inner.call(req).await });
        };

        Box::pin(async move {
            let request_id = request_id_of(&req);
            let (mut parts, body) = req.into_parts();
            let keys = Keys {
                app_id: header_str(&parts.headers, &stage.headers.authed_app_id).to_string(),
                user_id: header_str(&parts.headers, &stage.headers.user_id).to_string(),
                iv: parts
                    .headers
                    .get(&stage.headers.user_iv)
                    .map(|v| v.as_bytes().to_vec())
                    .unwrap_or_default(),
            };

            let plain = match stage.decrypt(&keys, body).await {
                Ok(plain) => plain,
                Err(err) => return Ok(reject(StageName::Crypt, &request_id, err)),
            };
            debug!(request_id, bytes = plain.len(), "Request body decrypted");
            parts.headers.remove(CONTENT_LENGTH);

            let response = inner.call(Request::from_parts(parts, Body::from(plain))).await?;
            if is_failure(&response) || response.status() == StatusCode::NO_CONTENT {
                return Ok(response);
            }

            let (mut parts, body) = response.into_parts();
            match stage.encrypt(&keys, body).await {
                Ok(cipher) => {
                    parts.headers.remove(CONTENT_LENGTH);
                    Ok(Response::from_parts(parts, Body::from(cipher)))
                }
                Err(err) => Ok(reject(StageName::Crypt, &request_id, err)),
            }
        })
    }
}

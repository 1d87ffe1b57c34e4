//! Request signature stage.
//!
//! Verifies the `signature-timestamp-nonce` header against the app, user,
//! method and path, then signs successful responses the same way.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::Body;
use gateway_core::{ApiError, HttpStatus, code};
use http::{HeaderValue, Request, Response};
use tower::{Layer, Service};
use tracing::debug;

use super::{HeaderNames, StageName, header_str, is_failure, reject, request_id_of};
use crate::providers::{SignProvider, SignSubject, SignToken, bounded};

/// Sign stage configuration.
pub struct SignStage {
    pub provider: Arc<dyn SignProvider>,
    pub headers: Arc<HeaderNames>,
    pub timeout: Option<Duration>,
}

/// Owned request fields covered by the signature.
struct Signed {
    app_id: String,
    user_id: String,
    method: String,
    uri: String,
}

impl Signed {
    fn subject(&self) -> SignSubject<'_> {
        SignSubject {
            app_id: &self.app_id,
            user_id: &self.user_id,
            method: &self.method,
            uri: &self.uri,
        }
    }
}

impl SignStage {
    async fn validate(&self, signed: &Signed, raw: &str) -> Result<(), ApiError> {
        let token: SignToken = raw
            .parse()
            .map_err(|e| ApiError::wrap(HttpStatus::BadRequest, code::SIGNATURE_INVALID, e))?;

        bounded(self.timeout, self.provider.validate(signed.subject(), &token))
            .await
            .map_err(|e| ApiError::wrap(HttpStatus::BadRequest, code::SIGNATURE_INVALID, e.into_cause()))
    }

    async fn generate(&self, signed: &Signed) -> Result<HeaderValue, ApiError> {
        let token = bounded(self.timeout, self.provider.generate(signed.subject()))
            .await
            .map_err(|e| {
                ApiError::wrap(HttpStatus::BadRequest, code::SIGNATURE_GENERATE_FAILED, e.into_cause())
            })?;

        HeaderValue::from_str(&token.to_string())
            .map_err(|e| ApiError::wrap(HttpStatus::BadRequest, code::SIGNATURE_GENERATE_FAILED, e))
    }
}

/// Tower layer for the sign stage. `None` passes requests through.
#[derive(Clone, Default)]
pub struct SignLayer {
    stage: Option<Arc<SignStage>>,
}

impl SignLayer {
    #[must_use]
    pub const fn new(stage: Option<Arc<SignStage>>) -> Self {
        Self { stage }
    }
}

impl<S> Layer<S> for SignLayer {
    type Service = SignMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        SignMiddleware {
            inner,
            stage: self.stage.clone(),
        }
    }
}

/// Sign stage middleware service.
#[derive(Clone)]
pub struct SignMiddleware<S> {
    inner: S,
    stage: Option<Arc<SignStage>>,
}

impl<S> Service<Request<Body>> for SignMiddleware<S>
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

        let request_id = request_id_of(&req);
        let headers = req.headers();
        let signed = Signed {
            app_id: header_str(headers, &stage.headers.authed_app_id).to_string(),
            user_id: header_str(headers, &stage.headers.user_id).to_string(),
            method: req.method().as_str().to_string(),
            uri: req.uri().path().to_string(),
        };
        let raw = header_str(headers, &stage.headers.signature).to_string();

        Box::pin(async move {
            if let Err(err) = stage.validate(&signed, &raw).await {
                return Ok(reject(StageName::Sign, &request_id, err));
            }
            debug!(request_id, "Signature verified");

            let mut response = inner.call(req).await?;
            if is_failure(&response) {
                return Ok(response);
            }

            match stage.generate(&signed).await {
                Ok(value) => {
                    response.headers_mut().insert(stage.headers.signature.clone(), value);
                    Ok(response)
                }
                Err(err) => Ok(reject(StageName::Sign, &request_id, err)),
            }
        })
    }
}

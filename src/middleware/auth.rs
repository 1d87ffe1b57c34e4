//! User authentication stage.
//!
//! Resolves the user behind the bearer token, stamps the user id header and
//! binds the user to the request id. Requests without a token continue
//! anonymously unless a token is required.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::Body;
use gateway_core::{ApiError, HttpStatus, code};
use http::{HeaderMap, HeaderValue, Request, Response};
use tower::{Layer, Service};
use tracing::{Span, debug};

use super::{HeaderNames, RequestPredicate, StageName, header_str, reject, request_id_of};
use crate::correlation::PrincipalBridge;
use crate::principal::UserPrincipal;
use crate::providers::{UserProvider, bounded};

/// Auth stage configuration.
pub struct AuthStage {
    pub provider: Arc<dyn UserProvider>,
    pub bridge: PrincipalBridge,
    pub headers: Arc<HeaderNames>,
    pub timeout: Option<Duration>,
    /// Reject requests that carry no token.
    pub require_token: bool,
    /// Requests matching this skip authentication.
    pub ignore: Option<RequestPredicate>,
}

impl AuthStage {
    /// Token from the token header with any bearer scheme removed.
    fn token<'a>(&self, headers: &'a HeaderMap) -> &'a str {
        let raw = header_str(headers, &self.headers.token).trim();
        raw.strip_prefix("Bearer ")
            .or_else(|| raw.strip_prefix("bearer "))
            .unwrap_or(raw)
            .trim()
    }

    async fn resolve(
        &self,
        request_id: &str,
        app_id: &str,
        token: &str,
    ) -> Result<Arc<UserPrincipal>, ApiError> {
        let user = bounded(
            self.timeout,
            self.provider.get_token_user(request_id, app_id, token),
        )
        .await
        .map_err(|e| ApiError::wrap(HttpStatus::Unauthorized, code::TOKEN_INVALID, e.into_cause()))?;

        Ok(Arc::new(user))
    }
}

/// Tower layer for the auth stage. `None` passes requests through.
#[derive(Clone, Default)]
pub struct AuthLayer {
    stage: Option<Arc<AuthStage>>,
}

impl AuthLayer {
    #[must_use]
    pub const fn new(stage: Option<Arc<AuthStage>>) -> Self {
        Self { stage }
    }
}

impl<S> Layer<S> for AuthLayer {
    type Service = AuthMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AuthMiddleware {
            inner,
            stage: self.stage.clone(),
        }
    }
}

/// Auth stage middleware service.
#[derive(Clone)]
pub struct AuthMiddleware<S> {
    inner: S,
    stage: Option<Arc<AuthStage>>,
}

impl<S> Service<Request<Body>> for AuthMiddleware<S>
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

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        let mut inner = self.inner.clone();
        let Some(stage) = self.stage.clone() else {
            return Box::pin(async move { inner.call(req).await });
        };

        // Only this stage may assert a user id.
        req.headers_mut().remove(&stage.headers.user_id);

        Box::pin(async move {
            let request_id = request_id_of(&req);

            if stage.ignore.as_ref().is_some_and(|ignore| ignore(&req)) {
                debug!(request_id, "Authentication skipped");
                return inner.call(req).await;
            }

            let token = stage.token(req.headers()).to_string();
            if token.is_empty() {
                if stage.require_token {
                    let err = ApiError::unauthorized(code::TOKEN_INVALID).with_message("token required");
                    return Ok(reject(StageName::Auth, &request_id, err));
                }
                return inner.call(req).await;
            }

            let app_id = header_str(req.headers(), &stage.headers.authed_app_id).to_string();
            let user = match stage.resolve(&request_id, &app_id, &token).await {
                Ok(user) => user,
                Err(err) => return Ok(reject(StageName::Auth, &request_id, err)),
            };

            match HeaderValue::from_str(&user.user_id) {
                Ok(value) => {
                    req.headers_mut().insert(stage.headers.user_id.clone(), value);
                }
                Err(_) => debug!(request_id, "User id is not a valid header value"),
            }
            Span::current().record("user_id", user.user_id.as_str());
            debug!(request_id, user_id = %user.user_id, "User authenticated");

            let _binding = stage.bridge.bind_user(&request_id, user);
            inner.call(req).await
        })
    }
}

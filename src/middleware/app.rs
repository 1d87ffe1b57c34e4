//! App identification stage.
//!
//! Resolves the calling app, stamps its external id into the authenticated
//! app header and binds it to the request id for the rest of the request.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::Body;
use gateway_core::{ApiError, HttpStatus, code};
use http::{HeaderName, HeaderValue, Request, Response};
use tower::{Layer, Service};
use tracing::{Span, debug};

use super::{HeaderNames, RequestPredicate, StageName, header_str, reject, request_id_of};
use crate::correlation::PrincipalBridge;
use crate::principal::AppPrincipal;
use crate::providers::{AppProvider, bounded};

/// Where the app id comes from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum AppValidation {
    /// Clients call the gateway directly; the client app header is validated.
    #[default]
    Internal,
    /// An outer proxy already validated the app and set the authenticated
    /// header; the app is only looked up.
    Outside,
}

/// App stage configuration.
pub struct AppStage {
    pub provider: Arc<dyn AppProvider>,
    pub bridge: PrincipalBridge,
    pub headers: Arc<HeaderNames>,
    pub project: u32,
    pub mode: AppValidation,
    pub timeout: Option<Duration>,
    /// Requests matching this skip the provider and use `fallback`.
    pub ignore: Option<RequestPredicate>,
    pub fallback: Arc<AppPrincipal>,
}

impl AppStage {
    fn source(&self) -> (&HeaderName, bool) {
        match self.mode {
            AppValidation::Internal => (&self.headers.app_id, true),
            AppValidation::Outside => (&self.headers.authed_app_id, false),
        }
    }

    async fn resolve(&self, app_id: &str, validate: bool) -> Result<Arc<AppPrincipal>, ApiError> {
        let app = bounded(
            self.timeout,
            self.provider.get_valid_app(app_id, self.project, validate),
        )
        .await
        .map_err(|e| ApiError::wrap(HttpStatus::Unauthorized, code::APP_INVALID, e.into_cause()))?;

        Ok(Arc::new(app))
    }
}

/// Tower layer for the app stage. `None` passes requests through.
#[derive(Clone, Default)]
pub struct AppLayer {
    stage: Option<Arc<AppStage>>,
}

impl AppLayer {
    #[must_use]
    pub const fn new(stage: Option<Arc<AppStage>>) -> Self {
        Self { stage }
    }
}

impl<S> Layer<S> for AppLayer {
    type Service = AppMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AppMiddleware {
            inner,
            stage: self.stage.clone(),
        }
    }
}

/// App stage middleware service.
#[derive(Clone)]
pub struct AppMiddleware<S> {
    inner: S,
    stage: Option<Arc<AppStage>>,
}

impl<S> Service<Request<Body>> for AppMiddleware<S>
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

        Box::pin(async move {
            let request_id = request_id_of(&req);
            let app = if stage.ignore.as_ref().is_some_and(|ignore| ignore(&req)) {
                debug!(request_id, "App check skipped");
                Arc::clone(&stage.fallback)
            } else {
                let (header, validate) = stage.source();
                let app_id = header_str(req.headers(), header).to_string();
                match stage.resolve(&app_id, validate).await {
                    Ok(app) => app,
                    Err(err) => return Ok(reject(StageName::App, &request_id, err)),
                }
            };

            match HeaderValue::from_str(&app.app_id) {
                Ok(value) => {
                    req.headers_mut().insert(stage.headers.authed_app_id.clone(), value);
                }
                Err(_) => debug!(request_id, "App id is not a valid header value"),
            }
            Span::current().record("app_id", app.app_id.as_str());
            debug!(request_id, app_id = %app.app_id, "App resolved");

            let _binding = stage.bridge.bind_app(&request_id, app);
            inner.call(req).await
        })
    }
}

//! Request metrics middleware.
//!
//! Installed as a route layer, so the `route` label is the matched template
//! and label cardinality stays bounded by the route table.
//!
//! # Metrics Emitted
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `gateway_requests_total` | Counter | `method`, `route`, `status` | Total request count |
//! | `gateway_request_duration_seconds` | Histogram | `method`, `route`, `status` | Request latency |
//! | `gateway_stage_rejections_total` | Counter | `stage`, `code` | Requests aborted by a stage |

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use axum::extract::MatchedPath;
use http::{Request, Response};
use tower::{Layer, Service};

/// Route label when no template matched.
const UNMATCHED_ROUTE: &str = "/*";

/// Tower layer for request metrics collection.
#[derive(Clone, Copy, Default)]
pub struct MetricsLayer;

impl MetricsLayer {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MetricsMiddleware { inner }
    }
}

/// Metrics middleware service.
#[derive(Clone)]
pub struct MetricsMiddleware<S> {
    inner: S,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for MetricsMiddleware<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send,
    ReqBody: Send + 'static,
    ResBody: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let method = req.method().to_string();
        let route = route_label(req.extensions().get::<MatchedPath>());

        let start = Instant::now();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let response = inner.call(req).await?;

            let duration = start.elapsed().as_secs_f64();
            let labels = [
                ("method", method),
                ("route", route),
                ("status", response.status().as_u16().to_string()),
            ];

            metrics::counter!("gateway_requests_total", &labels).increment(1);
            metrics::histogram!("gateway_request_duration_seconds", &labels).record(duration);

            Ok(response)
        })
    }
}

fn route_label(matched: Option<&MatchedPath>) -> String {
    matched.map_or_else(|| UNMATCHED_ROUTE.to_string(), |path| path.as_str().to_string())
}

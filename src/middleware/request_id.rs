//! Request ID middleware.
//!
//! Accepts a caller-supplied id of the form `rq_` + 32 characters and
//! generates one otherwise. Stamps the request type and origin and echoes the
//! id on the response.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use http::{HeaderValue, Request, Response};
use tower::{Layer, Service};
use tracing::Span;
use uuid::Uuid;

use super::{HeaderNames, REQUEST_FROM_CLIENT, REQUEST_TYPE_HTTP};

/// Prefix of every request id.
pub const REQUEST_ID_PREFIX: &str = "rq_";

/// Length of a valid request id.
pub const REQUEST_ID_LEN: usize = 35;

/// Request ID for the current request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestId(pub Arc<str>);

impl RequestId {
    /// Generate `rq_` followed by 32 hex digits.
    #[must_use]
    pub fn new() -> Self {
        Self(format!("{REQUEST_ID_PREFIX}{}", Uuid::new_v4().simple()).into())
    }

    /// Accept `s` if it has the request id shape.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        (s.len() == REQUEST_ID_LEN && s.starts_with(REQUEST_ID_PREFIX)).then(|| Self(s.into()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Tower layer for request ID propagation.
#[derive(Clone, Default)]
pub struct RequestIdLayer {
    headers: Arc<HeaderNames>,
}

impl RequestIdLayer {
    #[must_use]
    pub const fn new(headers: Arc<HeaderNames>) -> Self {
        Self { headers }
    }
}

impl<S> Layer<S> for RequestIdLayer {
    type Service = RequestIdMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RequestIdMiddleware {
            inner,
            headers: Arc::clone(&self.headers),
        }
    }
}

/// Request ID middleware service.
#[derive(Clone)]
pub struct RequestIdMiddleware<S> {
    inner: S,
    headers: Arc<HeaderNames>,
}

impl<S, ResBody> Service<Request<Body>> for RequestIdMiddleware<S>
where
    S: Service<Request<Body>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send,
    ResBody: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        let request_id = extract_or_generate(&req, &self.headers);
        Span::current().record("request_id", request_id.as_str());

        let id_value = HeaderValue::from_str(request_id.as_str()).ok();
        let headers = req.headers_mut();
        if let Some(value) = &id_value {
            headers.insert(self.headers.request_id.clone(), value.clone());
        }
        headers.insert(
            self.headers.request_type.clone(),
            HeaderValue::from_static(REQUEST_TYPE_HTTP),
        );
        headers.insert(
            self.headers.request_from.clone(),
            HeaderValue::from_static(REQUEST_FROM_CLIENT),
        );
        req.extensions_mut().insert(request_id);

        let header_name = self.headers.request_id.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let mut response = inner.call(req).await?;
            if let Some(value) = id_value {
                response.headers_mut().insert(header_name, value);
            }
            Ok(response)
        })
    }
}

fn extract_or_generate<T>(req: &Request<T>, headers: &HeaderNames) -> RequestId {
    req.headers()
        .get(&headers.request_id)
        .and_then(|v| v.to_str().ok())
        .and_then(RequestId::parse)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;

    use tower::ServiceExt;

    use super::*;

    #[test]
    fn generated_ids_have_the_accepted_shape() {
        let id = RequestId::new();
        assert_eq!(id.as_str().len(), REQUEST_ID_LEN);
        assert!(RequestId::parse(id.as_str()).is_some());
        assert_ne!(RequestId::new(), RequestId::new());
    }

    #[test]
    fn malformed_ids_are_refused() {
        assert!(RequestId::parse("custom-id").is_none());
        assert!(RequestId::parse("xx_0123456789abcdef0123456789abcdef").is_none());
        assert!(RequestId::parse("rq_0123456789abcdef0123456789abcdef0").is_none());
    }

    async fn echo(req: Request<Body>) -> Result<Response<Body>, Infallible> {
        let kind = req.headers()["x-request-type"].clone();
        let from = req.headers()["x-request-from"].clone();
        let id = req.extensions().get::<RequestId>().unwrap().to_string();
        Ok(Response::builder()
            .header("seen-id", id)
            .header("seen-type", kind)
            .header("seen-from", from)
            .body(Body::empty())
            .unwrap())
    }

    #[tokio::test]
    async fn valid_caller_id_is_kept() {
        let svc = RequestIdLayer::default().layer(tower::service_fn(echo));
        let id = "rq_0123456789abcdef0123456789abcdef";
        let req = Request::builder()
            .header("x-request-id", id)
            .header("x-request-type", "rpc")
            .body(Body::empty())
            .unwrap();

        let res = svc.oneshot(req).await.unwrap();
        assert_eq!(res.headers()["x-request-id"], id);
        assert_eq!(res.headers()["seen-id"], id);
        assert_eq!(res.headers()["seen-type"], "http");
        assert_eq!(res.headers()["seen-from"], "client");
    }

    #[tokio::test]
    async fn invalid_caller_id_is_replaced() {
        let svc = RequestIdLayer::default().layer(tower::service_fn(echo));
        let req = Request::builder()
            .header("x-request-id", "short")
            .body(Body::empty())
            .unwrap();

        let res = svc.oneshot(req).await.unwrap();
        let id = res.headers()["x-request-id"].to_str().unwrap();
        assert_ne!(id, "short");
        assert!(id.starts_with(REQUEST_ID_PREFIX));
        assert_eq!(res.headers()["seen-id"], id);
    }
}

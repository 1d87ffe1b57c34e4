//! Error rendering middleware.
//!
//! Stages and handlers return `ApiError` responses; each carries an
//! [`ErrorReport`] extension. [`RenderLayer`] replaces their body with the
//! envelope in the encoding the client accepts, localized to
//! `Accept-Language`. [`SuccessLayer`] renders the success classes (Created,
//! Deleted) next to the handler so the body and signature stages treat them
//! like any other successful response.

use std::any::Any;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::BoxError;
use axum::body::{Body, Bytes, HttpBody};
use gateway_core::{ApiError, ErrorEnvelope, ErrorReport, HttpStatus, Marshaler, MessageCatalog, messages};
use http::header::{ACCEPT_LANGUAGE, CONTENT_LENGTH, CONTENT_TYPE};
use http::response::Parts;
use http::{HeaderMap, Request, Response};
use serde_json::Value;
use tower::{Layer, Service};
use tracing::{debug, error};

use super::RequestId;

/// Reshapes the JSON envelope before it is written.
pub type EnvelopeMapper = Arc<dyn Fn(ErrorEnvelope) -> Value + Send + Sync>;

/// Turns an `ApiError` into the client-facing response.
#[derive(Clone, Default)]
pub struct ErrorResponder {
    debug: bool,
    mapper: Option<EnvelopeMapper>,
    catalog: Option<Arc<MessageCatalog>>,
}

impl ErrorResponder {
    /// `debug` exposes internal error text in the envelope.
    #[must_use]
    pub fn new(debug: bool) -> Self {
        Self {
            debug,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_mapper(mut self, mapper: EnvelopeMapper) -> Self {
        self.mapper = Some(mapper);
        self
    }

    /// Use `catalog` instead of the process-wide one.
    #[must_use]
    pub fn with_catalog(mut self, catalog: Arc<MessageCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Render `err` onto `parts`.
    ///
    /// Created carries its data in the accepted encoding, Deleted has no body,
    /// everything else carries the envelope.
    pub fn render(
        &self,
        mut parts: Parts,
        err: &ApiError,
        marshaler: Marshaler,
        locale: Option<&str>,
    ) -> Response<Body> {
        parts.status = err.http_status();
        parts.headers.remove(CONTENT_LENGTH);

        let body = match err.status() {
            HttpStatus::Deleted => {
                parts.headers.remove(CONTENT_TYPE);
                Body::empty()
            }
            HttpStatus::Created => match err.encode_data(marshaler) {
                Ok((content_type, data)) => {
                    parts.headers.insert(CONTENT_TYPE, content_type);
                    Body::from(data)
                }
                Err(e) => {
                    error!(error = %e, "Failed to encode created data");
                    Body::empty()
                }
            },
            _ => {
                let catalog = self.catalog.clone().unwrap_or_else(messages::catalog);
                let envelope = err.envelope_in(&catalog, locale, self.debug);
                parts.headers.insert(CONTENT_TYPE, marshaler.content_type());
                Body::from(self.encode(envelope, marshaler))
            }
        };

        Response::from_parts(parts, body)
    }

    fn encode(&self, envelope: ErrorEnvelope, marshaler: Marshaler) -> Vec<u8> {
        let encoded = match (&self.mapper, marshaler) {
            (Some(mapper), Marshaler::Json) => serde_json::to_vec(&mapper(envelope)),
            _ => marshaler.encode(&envelope),
        };
        encoded.unwrap_or_else(|e| {
            error!(error = %e, "Failed to encode error envelope");
            Vec::new()
        })
    }
}

/// Primary subtag of the first `Accept-Language` entry, lowercased.
pub(crate) fn preferred_language(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(ACCEPT_LANGUAGE)?.to_str().ok()?;
    let tag = value.split(',').next()?.split(';').next()?.trim();
    let primary = tag.split(['-', '_']).next()?;
    (!primary.is_empty() && primary != "*").then(|| primary.to_ascii_lowercase())
}

/// Response for a handler panic, used with `CatchPanicLayer::custom`.
pub fn panic_response(payload: Box<dyn Any + Send + 'static>) -> Response<Body> {
    use axum::response::IntoResponse;

    let detail = payload
        .downcast_ref::<String>()
        .cloned()
        .or_else(|| payload.downcast_ref::<&str>().map(ToString::to_string))
        .unwrap_or_else(|| "unknown panic".to_string());

    ApiError::internal(HandlerPanic(detail)).into_response()
}

#[derive(Debug, thiserror::Error)]
#[error("handler panicked: {0}")]
struct HandlerPanic(String);

/// Tower layer rendering `ApiError` responses.
#[derive(Clone, Default)]
pub struct RenderLayer {
    responder: ErrorResponder,
}

impl RenderLayer {
    #[must_use]
    pub const fn new(responder: ErrorResponder) -> Self {
        Self { responder }
    }
}

impl<S> Layer<S> for RenderLayer {
    type Service = RenderMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RenderMiddleware {
            inner,
            responder: self.responder.clone(),
        }
    }
}

/// Error rendering middleware service.
#[derive(Clone)]
pub struct RenderMiddleware<S> {
    inner: S,
    responder: ErrorResponder,
}

impl<S, ResBody> Service<Request<Body>> for RenderMiddleware<S>
where
    S: Service<Request<Body>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send,
    ResBody: HttpBody<Data = Bytes> + Send + 'static,
    ResBody::Error: Into<BoxError>,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let marshaler = Marshaler::from_accept(req.headers());
        let locale = preferred_language(req.headers());
        let request_id = req
            .extensions()
            .get::<RequestId>()
            .map(ToString::to_string)
            .unwrap_or_default();
        let responder = self.responder.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let response = inner.call(req).await?;
            let Some(ErrorReport(err)) = response.extensions().get::<ErrorReport>().cloned() else {
                return Ok(response.map(Body::new));
            };

            if err.status().is_server_error() {
                error!(request_id, code = err.code(), error = %err.debug_chain(), "Request failed");
                gateway_telemetry::capture_error(&err.debug_chain(), err.code());
            } else {
                debug!(request_id, code = err.code(), status = %err.http_status(), "Request refused");
            }

            let (parts, _) = response.into_parts();
            Ok(responder.render(parts, &err, marshaler, locale.as_deref()))
        })
    }
}

/// Tower layer rendering Created and Deleted responses.
///
/// The rendered response no longer carries an [`ErrorReport`], so the outer
/// stages encrypt and sign it like a plain handler response.
#[derive(Clone, Copy, Default)]
pub struct SuccessLayer;

impl<S> Layer<S> for SuccessLayer {
    type Service = SuccessMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        SuccessMiddleware { inner }
    }
}

/// Success rendering middleware service.
#[derive(Clone)]
pub struct SuccessMiddleware<S> {
    inner: S,
}

impl<S> Service<Request<Body>> for SuccessMiddleware<S>
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
        let marshaler = Marshaler::from_accept(req.headers());
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let response = inner.call(req).await?;
            let err = match response.extensions().get::<ErrorReport>() {
                Some(ErrorReport(err)) if !err.status().is_failure() => Arc::clone(err),
                _ => return Ok(response),
            };

            let (mut parts, _) = response.into_parts();
            parts.extensions.remove::<ErrorReport>();
            Ok(ErrorResponder::default().render(parts, &err, marshaler, None))
        })
    }
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;

    use axum::response::IntoResponse;
    use gateway_core::code;
    use http::StatusCode;
    use prost::Message;
    use tower::ServiceExt;

    use super::*;

    fn catalog() -> Arc<MessageCatalog> {
        let mut catalog = MessageCatalog::new();
        catalog
            .load(0, "en", br#"{"17": "permission denied"}"#)
            .unwrap();
        catalog.load(0, "de", br#"{"17": "keine Berechtigung"}"#).unwrap();
        Arc::new(catalog)
    }

    async fn body_bytes(res: Response<Body>) -> Bytes {
        axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap()
    }

    async fn forbidden(_req: Request<Body>) -> Result<Response<Body>, Infallible> {
        Ok(ApiError::forbidden(code::NO_PERMISSION).into_response())
    }

    #[test]
    fn accept_language_primary_tag() {
        let mut headers = HeaderMap::new();
        assert_eq!(preferred_language(&headers), None);
        headers.insert(ACCEPT_LANGUAGE, "zh-CN,zh;q=0.9,en;q=0.8".parse().unwrap());
        assert_eq!(preferred_language(&headers).as_deref(), Some("zh"));
        headers.insert(ACCEPT_LANGUAGE, "*".parse().unwrap());
        assert_eq!(preferred_language(&headers), None);
    }

    #[tokio::test]
    async fn localizes_envelope() {
        let svc = RenderLayer::new(ErrorResponder::new(false).with_catalog(catalog()))
            .layer(tower::service_fn(forbidden));
        let req = Request::builder()
            .header(ACCEPT_LANGUAGE, "de-DE")
            .body(Body::empty())
            .unwrap();

        let res = svc.oneshot(req).await.unwrap();
        assert_eq!(res.status(), StatusCode::FORBIDDEN);
        let body: Value = serde_json::from_slice(&body_bytes(res).await).unwrap();
        assert_eq!(body["code"], 17);
        assert_eq!(body["message"], "keine Berechtigung");
    }

    #[tokio::test]
    async fn binary_accept_gets_protobuf() {
        let svc = RenderLayer::new(ErrorResponder::new(false).with_catalog(catalog()))
            .layer(tower::service_fn(forbidden));
        let req = Request::builder()
            .header("accept", "application/x-protobuf")
            .body(Body::empty())
            .unwrap();

        let res = svc.oneshot(req).await.unwrap();
        assert_eq!(res.headers()[CONTENT_TYPE], "application/octet-stream");
        let envelope = ErrorEnvelope::decode(body_bytes(res).await).unwrap();
        assert_eq!(envelope.code, 17);
        assert_eq!(envelope.message, "permission denied");
    }

    #[tokio::test]
    async fn mapper_reshapes_json_only() {
        let mapper: EnvelopeMapper =
            Arc::new(|envelope| serde_json::json!({ "error": envelope.code }));
        let svc = RenderLayer::new(ErrorResponder::new(false).with_mapper(mapper))
            .layer(tower::service_fn(forbidden));

        let res = svc.oneshot(Request::new(Body::empty())).await.unwrap();
        let body: Value = serde_json::from_slice(&body_bytes(res).await).unwrap();
        assert_eq!(body, serde_json::json!({ "error": 17 }));
    }

    #[tokio::test]
    async fn created_and_deleted() {
        let created = tower::service_fn(|_req: Request<Body>| async {
            Ok::<_, Infallible>(ApiError::created(serde_json::json!({ "id": 9 })).into_response())
        });
        let res = RenderLayer::default()
            .layer(created)
            .oneshot(Request::new(Body::empty()))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::CREATED);
        assert_eq!(&body_bytes(res).await[..], br#"{"id":9}"#);

        let deleted = tower::service_fn(|_req: Request<Body>| async {
            Ok::<_, Infallible>(ApiError::deleted().into_response())
        });
        let res = RenderLayer::default()
            .layer(deleted)
            .oneshot(Request::new(Body::empty()))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::NO_CONTENT);
        assert!(body_bytes(res).await.is_empty());
    }

    #[tokio::test]
    async fn success_layer_renders_before_outer_stages() {
        let created = tower::service_fn(|_req: Request<Body>| async {
            let entry = gateway_core::ErrorEntry::new(9, "order");
            Ok::<_, Infallible>(ApiError::created_message(&entry).into_response())
        });
        let req = Request::builder()
            .header("accept", "application/octet-stream")
            .body(Body::empty())
            .unwrap();

        let res = SuccessLayer.layer(created).oneshot(req).await.unwrap();
        assert_eq!(res.status(), StatusCode::CREATED);
        assert!(res.extensions().get::<ErrorReport>().is_none());
        assert_eq!(res.headers()[CONTENT_TYPE], "application/octet-stream");
        let entry = gateway_core::ErrorEntry::decode(body_bytes(res).await).unwrap();
        assert_eq!(entry, gateway_core::ErrorEntry::new(9, "order"));

        let res = SuccessLayer
            .layer(tower::service_fn(forbidden))
            .oneshot(Request::new(Body::empty()))
            .await
            .unwrap();
        assert!(res.extensions().get::<ErrorReport>().is_some());
    }

    #[tokio::test]
    async fn plain_responses_pass_through() {
        let ok = tower::service_fn(|_req: Request<Body>| async {
            Ok::<_, Infallible>(Response::new(Body::from("hello")))
        });
        let res = RenderLayer::default()
            .layer(ok)
            .oneshot(Request::new(Body::empty()))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(&body_bytes(res).await[..], b"hello");
    }

    #[test]
    fn panics_become_internal_errors() {
        let res = panic_response(Box::new("boom"));
        assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let report = res.extensions().get::<ErrorReport>().unwrap();
        assert!(report.0.debug_chain().contains("boom"));
    }
}

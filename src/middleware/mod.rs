//! Gateway middleware stages.
//!
//! # Stage order
//! Layers added with `ServiceBuilder` run top to bottom on the request and
//! bottom to top on the response:
//! 1. `TraceLayer` - request span with `request_id`, `app_id`, `user_id` fields
//! 2. [`RequestIdLayer`] - accept or generate the request id
//! 3. [`RenderLayer`] - serialize any `ApiError` into the client envelope
//! 4. `CatchPanicLayer` - panics become internal errors
//! 5. [`AppLayer`] - resolve and bind the calling app
//! 6. [`CryptLayer`] - decrypt the request body, encrypt the response body
//! 7. [`AuthLayer`] - resolve and bind the user
//! 8. [`SignLayer`] - verify the request signature, sign the response
//! 9. [`SuccessLayer`] - render Created and Deleted so they are signed and
//!    encrypted like other successes
//!
//! Route layers run after route matching, so they see the matched template:
//! 10. [`MetricsLayer`] - request counters labelled by template
//! 11. [`PermLayer`] - permission check against the template
//!
//! A stage that rejects returns an `ApiError` response immediately; nothing
//! below it runs. Correlation bindings made by the app and auth stages are
//! released when their futures finish or unwind.

pub mod app;
pub mod auth;
pub mod crypt;
pub mod metrics;
pub mod perm;
pub mod render;
pub mod request_id;
pub mod sign;

use std::fmt;
use std::sync::Arc;

use axum::body::Body;
use axum::response::IntoResponse;
use gateway_core::{ApiError, ErrorReport};
use http::header::{AUTHORIZATION, HeaderName};
use http::{HeaderMap, Request, Response};
use tracing::warn;

pub use app::{AppLayer, AppStage, AppValidation};
pub use auth::{AuthLayer, AuthStage};
pub use crypt::{CryptLayer, CryptStage};
pub use metrics::MetricsLayer;
pub use perm::{PermLayer, PermStage};
pub use render::{EnvelopeMapper, ErrorResponder, RenderLayer, SuccessLayer, panic_response};
pub use request_id::{RequestId, RequestIdLayer};
pub use sign::{SignLayer, SignStage};

/// Request type stamped on every request entering through HTTP.
pub const REQUEST_TYPE_HTTP: &str = "http";
/// Request origin stamped on every request entering through HTTP.
pub const REQUEST_FROM_CLIENT: &str = "client";

/// Predicate over the whole request, used by ignore hooks.
pub type RequestPredicate = Arc<dyn Fn(&Request<Body>) -> bool + Send + Sync>;

/// Pipeline stages in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StageName {
    RequestId,
    App,
    Crypt,
    Auth,
    Sign,
    Perm,
}

impl StageName {
    pub const ALL: [Self; 6] = [
        Self::RequestId,
        Self::App,
        Self::Crypt,
        Self::Auth,
        Self::Sign,
        Self::Perm,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RequestId => "request_id",
            Self::App => "app",
            Self::Crypt => "crypt",
            Self::Auth => "auth",
            Self::Sign => "sign",
            Self::Perm => "perm",
        }
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Header names used by the stages.
#[derive(Debug, Clone)]
pub struct HeaderNames {
    pub request_id: HeaderName,
    pub request_type: HeaderName,
    pub request_from: HeaderName,
    /// App id sent by the client.
    pub app_id: HeaderName,
    /// App id after resolution, or pre-verified by an outer proxy.
    pub authed_app_id: HeaderName,
    pub user_id: HeaderName,
    pub user_iv: HeaderName,
    pub signature: HeaderName,
    pub token: HeaderName,
}

impl Default for HeaderNames {
    fn default() -> Self {
        Self {
            request_id: HeaderName::from_static("x-request-id"),
            request_type: HeaderName::from_static("x-request-type"),
            request_from: HeaderName::from_static("x-request-from"),
            app_id: HeaderName::from_static("x-app-id"),
            authed_app_id: HeaderName::from_static("x-app-id"),
            user_id: HeaderName::from_static("x-user-id"),
            user_iv: HeaderName::from_static("x-user-iv"),
            signature: HeaderName::from_static("x-signature"),
            token: AUTHORIZATION,
        }
    }
}

/// Header value as a string, empty when absent or not visible ASCII.
pub(crate) fn header_str<'a>(headers: &'a HeaderMap, name: &HeaderName) -> &'a str {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
}

/// Request id assigned by [`RequestIdLayer`].
pub(crate) fn request_id_of<B>(req: &Request<B>) -> String {
    req.extensions()
        .get::<RequestId>()
        .map(|id| id.as_str().to_string())
        .unwrap_or_default()
}

/// Whether `response` carries a failure envelope. Those leave the gateway
/// unencrypted and unsigned.
pub(crate) fn is_failure(response: &Response<Body>) -> bool {
    response
        .extensions()
        .get::<ErrorReport>()
        .is_some_and(|ErrorReport(err)| err.status().is_failure())
}

/// Abort the pipeline at `stage` with `err`.
pub(crate) fn reject(stage: StageName, request_id: &str, err: ApiError) -> Response<Body> {
    let code = err.code();
    warn!(
        stage = stage.as_str(),
        request_id,
        code,
        error = %err.debug_chain(),
        "Request rejected"
    );
    ::metrics::counter!(
        "gateway_stage_rejections_total",
        "stage" => stage.as_str(),
        "code" => code.to_string(),
    )
    .increment(1);

    err.with_request(REQUEST_TYPE_HTTP, request_id).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stages_are_ordered() {
        let mut sorted = StageName::ALL;
        sorted.sort();
        assert_eq!(sorted, StageName::ALL);
        assert_eq!(StageName::RequestId.to_string(), "request_id");
    }

    #[test]
    fn only_failure_reports_count_as_failures() {
        assert!(is_failure(&ApiError::forbidden(gateway_core::code::NO_PERMISSION).into_response()));
        assert!(!is_failure(&ApiError::created(serde_json::json!({})).into_response()));
        assert!(!is_failure(&ApiError::deleted().into_response()));
        assert!(!is_failure(&Response::new(Body::empty())));
    }

    #[test]
    fn header_str_defaults_to_empty() {
        let mut headers = HeaderMap::new();
        let names = HeaderNames::default();
        assert_eq!(header_str(&headers, &names.app_id), "");
        headers.insert(names.app_id.clone(), "app-1".parse().unwrap());
        assert_eq!(header_str(&headers, &names.authed_app_id), "app-1");
    }
}

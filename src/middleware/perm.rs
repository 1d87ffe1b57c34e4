//! Permission stage.
//!
//! Runs as a route layer so the check sees the matched route template
//! (`/v1/users/{id}`) rather than the concrete path.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::Body;
use axum::extract::MatchedPath;
use gateway_core::{ApiError, HttpStatus, code};
use http::{Request, Response};
use tower::{Layer, Service};
use tracing::debug;

use super::{HeaderNames, StageName, header_str, reject, request_id_of};
use crate::providers::{PermissionProvider, bounded};

/// Decides whether `(method, template)` skips the check. Methods are lowercase.
pub type PermIgnore = Arc<dyn Fn(&str, &str) -> bool + Send + Sync>;

/// Rewrites the template before it reaches the provider.
pub type TemplateFormatter = Arc<dyn Fn(&Request<Body>, &str) -> String + Send + Sync>;

/// Perm stage configuration.
pub struct PermStage {
    pub provider: Arc<dyn PermissionProvider>,
    pub headers: Arc<HeaderNames>,
    pub timeout: Option<Duration>,
    /// Mount prefix removed from templates.
    pub prefix: Option<String>,
    pub ignore: Option<PermIgnore>,
    pub formatter: Option<TemplateFormatter>,
}

impl PermStage {
    /// Matched template without the mount prefix, falling back to the path.
    fn template(&self, req: &Request<Body>) -> String {
        let matched = req
            .extensions()
            .get::<MatchedPath>()
            .map_or_else(|| req.uri().path(), MatchedPath::as_str);

        let template = self
            .prefix
            .as_deref()
            .and_then(|prefix| matched.strip_prefix(prefix))
            .filter(|rest| rest.starts_with('/'))
            .unwrap_or(matched);

        match &self.formatter {
            Some(format) => format(req, template),
            None => template.to_string(),
        }
    }
}

/// Tower route layer for the perm stage. `None` passes requests through.
#[derive(Clone, Default)]
pub struct PermLayer {
    stage: Option<Arc<PermStage>>,
}

impl PermLayer {
    #[must_use]
    pub const fn new(stage: Option<Arc<PermStage>>) -> Self {
        Self { stage }
    }
}

impl<S> Layer<S> for PermLayer {
    type Service = PermMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        PermMiddleware {
            inner,
            stage: self.stage.clone(),
        }
    }
}

/// Perm stage middleware service.
#[derive(Clone)]
pub struct PermMiddleware<S> {
    inner: S,
    stage: Option<Arc<PermStage>>,
}

impl<S> Service<Request<Body>> for PermMiddleware<S>
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
        let method = req.method().as_str().to_ascii_lowercase();
        let template = stage.template(&req);

        if stage.ignore.as_ref().is_some_and(|ignore| ignore(&method, &template)) {
            debug!(request_id, method, template, "Permission check skipped");
            return Box::pin(async move { inner.call(req).await });
        }

        let app_id = header_str(req.headers(), &stage.headers.authed_app_id).to_string();
        let user_id = header_str(req.headers(), &stage.headers.user_id).to_string();

        Box::pin(async move {
            let allowed = bounded(
                stage.timeout,
                stage.provider.can(&app_id, &user_id, &method, &template),
            )
            .await;

            if let Err(e) = allowed {
                let err = ApiError::wrap(HttpStatus::Forbidden, code::NO_PERMISSION, e.into_cause());
                return Ok(reject(StageName::Perm, &request_id, err));
            }
            inner.call(req).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ProviderError;

    struct DenyAll;

    #[tonic::async_trait]
    impl PermissionProvider for DenyAll {
        async fn can(&self, _: &str, _: &str, _: &str, _: &str) -> Result<(), ProviderError> {
            Err(ProviderError::rejected("denied"))
        }
    }

    fn stage(prefix: Option<&str>, formatter: Option<TemplateFormatter>) -> PermStage {
        PermStage {
            provider: Arc::new(DenyAll),
            headers: Arc::default(),
            timeout: None,
            prefix: prefix.map(ToString::to_string),
            ignore: None,
            formatter,
        }
    }

    #[test]
    fn template_falls_back_to_path_without_prefix() {
        let req = Request::builder().uri("/api/v1/users/7").body(Body::empty()).unwrap();
        assert_eq!(stage(Some("/api"), None).template(&req), "/v1/users/7");
        assert_eq!(stage(None, None).template(&req), "/api/v1/users/7");
        assert_eq!(stage(Some("/ap"), None).template(&req), "/api/v1/users/7");
    }

    #[test]
    fn formatter_rewrites_template() {
        let formatter: TemplateFormatter =
            Arc::new(|req, template| format!("{}:{template}", req.method()));
        let req = Request::builder()
            .method("DELETE")
            .uri("/v1/users/7")
            .body(Body::empty())
            .unwrap();
        assert_eq!(stage(None, Some(formatter)).template(&req), "DELETE:/v1/users/7");
    }
}

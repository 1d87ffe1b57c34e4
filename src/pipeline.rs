//! Pipeline assembly.
//!
//! [`PipelineBuilder`] collects providers and options; [`Pipeline::apply`]
//! wraps an RPC router in the stage layers in their fixed order. A stage is
//! active when its provider is set and it has not been disabled.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use gateway_core::MessageCatalog;
use http::Request;
use serde_json::Value;
use tower::ServiceBuilder;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::{DefaultOnResponse, TraceLayer};
use tracing::Level;

use crate::correlation::PrincipalBridge;
use crate::metadata::MetadataBridge;
use crate::middleware::perm::{PermIgnore, TemplateFormatter};
use crate::middleware::{
    AppLayer, AppStage, AppValidation, AuthLayer, AuthStage, CryptLayer, CryptStage,
    EnvelopeMapper, ErrorResponder, HeaderNames, MetricsLayer, PermLayer, PermStage, RenderLayer,
    RequestIdLayer, RequestPredicate, SignLayer, SignStage, StageName, SuccessLayer,
    panic_response,
};
use crate::principal::AppPrincipal;
use crate::providers::{AppProvider, CryptProvider, PermissionProvider, SignProvider, UserProvider};

/// Default limit on buffered bodies in the crypt stage (4 MiB).
pub const DEFAULT_MAX_BODY_BYTES: usize = 4 * 1024 * 1024;

/// Default bound on a single provider call.
pub const DEFAULT_PROVIDER_TIMEOUT: Duration = Duration::from_secs(5);

/// Fluent pipeline configuration.
pub struct PipelineBuilder {
    headers: HeaderNames,
    bridge: PrincipalBridge,
    project: u32,
    mode: AppValidation,
    timeout: Option<Duration>,
    debug: bool,
    mapper: Option<EnvelopeMapper>,
    catalog: Option<Arc<MessageCatalog>>,
    prefix: String,
    max_body_bytes: usize,
    require_token: bool,
    disabled: BTreeSet<StageName>,
    app: Option<Arc<dyn AppProvider>>,
    app_ignore: Option<RequestPredicate>,
    app_fallback: AppPrincipal,
    crypt: Option<Arc<dyn CryptProvider>>,
    user: Option<Arc<dyn UserProvider>>,
    auth_ignore: Option<RequestPredicate>,
    sign: Option<Arc<dyn SignProvider>>,
    perm: Option<Arc<dyn PermissionProvider>>,
    perm_ignore: Option<PermIgnore>,
    formatter: Option<TemplateFormatter>,
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self {
            headers: HeaderNames::default(),
            bridge: PrincipalBridge::new(),
            project: 0,
            mode: AppValidation::default(),
            timeout: Some(DEFAULT_PROVIDER_TIMEOUT),
            debug: false,
            mapper: None,
            catalog: None,
            prefix: String::new(),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            require_token: false,
            disabled: BTreeSet::new(),
            app: None,
            app_ignore: None,
            app_fallback: AppPrincipal::default(),
            crypt: None,
            user: None,
            auth_ignore: None,
            sign: None,
            perm: None,
            perm_ignore: None,
            formatter: None,
        }
    }
}

impl PipelineBuilder {
    #[must_use]
    pub fn headers(mut self, headers: HeaderNames) -> Self {
        self.headers = headers;
        self
    }

    /// Share an existing principal bridge.
    #[must_use]
    pub fn bridge(mut self, bridge: PrincipalBridge) -> Self {
        self.bridge = bridge;
        self
    }

    /// Error-code project passed to the app provider.
    #[must_use]
    pub const fn project(mut self, project: u32) -> Self {
        self.project = project;
        self
    }

    #[must_use]
    pub const fn app_validation(mut self, mode: AppValidation) -> Self {
        self.mode = mode;
        self
    }

    /// Bound every provider call; `None` waits indefinitely.
    #[must_use]
    pub const fn provider_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Expose internal error text in envelopes.
    #[must_use]
    pub const fn debug_errors(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    #[must_use]
    pub fn envelope_mapper<F>(mut self, mapper: F) -> Self
    where
        F: Fn(gateway_core::ErrorEnvelope) -> Value + Send + Sync + 'static,
    {
        self.mapper = Some(Arc::new(mapper));
        self
    }

    /// Message catalog for rendering; the process-wide one otherwise.
    #[must_use]
    pub fn catalog(mut self, catalog: Arc<MessageCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Mount point of the RPC routes. Empty or `/` mounts at the root.
    #[must_use]
    pub fn path_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    #[must_use]
    pub const fn max_body_bytes(mut self, limit: usize) -> Self {
        self.max_body_bytes = limit;
        self
    }

    #[must_use]
    pub const fn require_token(mut self, require: bool) -> Self {
        self.require_token = require;
        self
    }

    /// Turn a stage off. The request id stage always runs.
    #[must_use]
    pub fn disable(mut self, stage: StageName) -> Self {
        if stage != StageName::RequestId {
            self.disabled.insert(stage);
        }
        self
    }

    #[must_use]
    pub fn enable(mut self, stage: StageName) -> Self {
        self.disabled.remove(&stage);
        self
    }

    #[must_use]
    pub fn app_provider(mut self, provider: Arc<dyn AppProvider>) -> Self {
        self.app = Some(provider);
        self
    }

    /// Requests matching `ignore` skip the app provider and run as `fallback`.
    #[must_use]
    pub fn ignore_app<F>(mut self, ignore: F, fallback: AppPrincipal) -> Self
    where
        F: Fn(&Request<Body>) -> bool + Send + Sync + 'static,
    {
        self.app_ignore = Some(Arc::new(ignore));
        self.app_fallback = fallback;
        self
    }

    #[must_use]
    pub fn crypt_provider(mut self, provider: Arc<dyn CryptProvider>) -> Self {
        self.crypt = Some(provider);
        self
    }

    #[must_use]
    pub fn user_provider(mut self, provider: Arc<dyn UserProvider>) -> Self {
        self.user = Some(provider);
        self
    }

    #[must_use]
    pub fn ignore_auth<F>(mut self, ignore: F) -> Self
    where
        F: Fn(&Request<Body>) -> bool + Send + Sync + 'static,
    {
        self.auth_ignore = Some(Arc::new(ignore));
        self
    }

    #[must_use]
    pub fn sign_provider(mut self, provider: Arc<dyn SignProvider>) -> Self {
        self.sign = Some(provider);
        self
    }

    #[must_use]
    pub fn permission_provider(mut self, provider: Arc<dyn PermissionProvider>) -> Self {
        self.perm = Some(provider);
        self
    }

    /// Skip the permission check for `(lowercase method, template)` pairs.
    #[must_use]
    pub fn ignore_permission<F>(mut self, ignore: F) -> Self
    where
        F: Fn(&str, &str) -> bool + Send + Sync + 'static,
    {
        self.perm_ignore = Some(Arc::new(ignore));
        self
    }

    #[must_use]
    pub fn template_formatter<F>(mut self, formatter: F) -> Self
    where
        F: Fn(&Request<Body>, &str) -> String + Send + Sync + 'static,
    {
        self.formatter = Some(Arc::new(formatter));
        self
    }

    fn active<P: ?Sized>(&self, stage: StageName, provider: Option<Arc<P>>) -> Option<Arc<P>> {
        provider.filter(|_| !self.disabled.contains(&stage))
    }

    #[must_use]
    pub fn build(self) -> Pipeline {
        let headers = Arc::new(self.headers.clone());
        let prefix = normalize_prefix(&self.prefix);

        let mut responder = ErrorResponder::new(self.debug);
        if let Some(mapper) = self.mapper.clone() {
            responder = responder.with_mapper(mapper);
        }
        if let Some(catalog) = self.catalog.clone() {
            responder = responder.with_catalog(catalog);
        }

        let app = self.active(StageName::App, self.app.clone()).map(|provider| {
            Arc::new(AppStage {
                provider,
                bridge: self.bridge.clone(),
                headers: Arc::clone(&headers),
                project: self.project,
                mode: self.mode,
                timeout: self.timeout,
                ignore: self.app_ignore.clone(),
                fallback: Arc::new(self.app_fallback.clone()),
            })
        });
        let crypt = self.active(StageName::Crypt, self.crypt.clone()).map(|provider| {
            Arc::new(CryptStage {
                provider,
                headers: Arc::clone(&headers),
                max_body_bytes: self.max_body_bytes,
                timeout: self.timeout,
            })
        });
        let auth = self.active(StageName::Auth, self.user.clone()).map(|provider| {
            Arc::new(AuthStage {
                provider,
                bridge: self.bridge.clone(),
                headers: Arc::clone(&headers),
                timeout: self.timeout,
                require_token: self.require_token,
                ignore: self.auth_ignore.clone(),
            })
        });
        let sign = self.active(StageName::Sign, self.sign.clone()).map(|provider| {
            Arc::new(SignStage {
                provider,
                headers: Arc::clone(&headers),
                timeout: self.timeout,
            })
        });
        let perm = self.active(StageName::Perm, self.perm.clone()).map(|provider| {
            Arc::new(PermStage {
                provider,
                headers: Arc::clone(&headers),
                timeout: self.timeout,
                prefix: prefix.clone(),
                ignore: self.perm_ignore.clone(),
                formatter: self.formatter.clone(),
            })
        });

        Pipeline {
            headers,
            bridge: self.bridge,
            responder,
            prefix,
            app,
            crypt,
            auth,
            sign,
            perm,
        }
    }
}

/// `None` for a root mount, otherwise `/segment` without a trailing slash.
fn normalize_prefix(prefix: &str) -> Option<String> {
    let trimmed = prefix.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return None;
    }
    Some(if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    })
}

/// Assembled stage set, ready to wrap a router.
#[derive(Clone)]
pub struct Pipeline {
    headers: Arc<HeaderNames>,
    bridge: PrincipalBridge,
    responder: ErrorResponder,
    prefix: Option<String>,
    app: Option<Arc<AppStage>>,
    crypt: Option<Arc<CryptStage>>,
    auth: Option<Arc<AuthStage>>,
    sign: Option<Arc<SignStage>>,
    perm: Option<Arc<PermStage>>,
}

impl Pipeline {
    #[must_use]
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::default()
    }

    /// Correlation state shared by the stages.
    #[must_use]
    pub const fn bridge(&self) -> &PrincipalBridge {
        &self.bridge
    }

    #[must_use]
    pub fn headers(&self) -> Arc<HeaderNames> {
        Arc::clone(&self.headers)
    }

    /// Metadata bridge reading this pipeline's headers and principals.
    #[must_use]
    pub fn metadata_bridge(&self) -> MetadataBridge {
        MetadataBridge::new(self.headers(), self.bridge.clone())
    }

    #[must_use]
    pub fn prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }

    /// Active stages in execution order.
    #[must_use]
    pub fn stages(&self) -> Vec<StageName> {
        StageName::ALL
            .into_iter()
            .filter(|stage| match stage {
                StageName::RequestId => true,
                StageName::App => self.app.is_some(),
                StageName::Crypt => self.crypt.is_some(),
                StageName::Auth => self.auth.is_some(),
                StageName::Sign => self.sign.is_some(),
                StageName::Perm => self.perm.is_some(),
            })
            .collect()
    }

    /// Wrap `routes` in the pipeline and mount it under the prefix.
    ///
    /// # Panics
    /// If `routes` has no routes; route layers need something to attach to.
    #[must_use]
    pub fn apply(&self, routes: Router) -> Router {
        let routes = routes
            .route_layer(PermLayer::new(self.perm.clone()))
            .route_layer(MetricsLayer::new());

        let routes = match &self.prefix {
            Some(prefix) => Router::new().nest(prefix, routes),
            None => routes,
        };

        let middleware = ServiceBuilder::new()
            .layer(
                TraceLayer::new_for_http()
                    .make_span_with(|req: &Request<Body>| {
                        tracing::info_span!(
                            "request",
                            method = %req.method(),
                            uri = %req.uri(),
                            request_id = tracing::field::Empty,
                            app_id = tracing::field::Empty,
                            user_id = tracing::field::Empty,
                        )
                    })
                    .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
            )
            .layer(RequestIdLayer::new(self.headers()))
            .layer(RenderLayer::new(self.responder.clone()))
            .layer(CatchPanicLayer::custom(panic_response))
            .layer(AppLayer::new(self.app.clone()))
            .layer(CryptLayer::new(self.crypt.clone()))
            .layer(AuthLayer::new(self.auth.clone()))
            .layer(SignLayer::new(self.sign.clone()))
            .layer(SuccessLayer);

        routes.layer(middleware)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::principal::UserPrincipal;
    use crate::providers::ProviderError;

    struct Anyone;

    #[tonic::async_trait]
    impl UserProvider for Anyone {
        async fn get_token_user(&self, _: &str, _: &str, token: &str) -> Result<UserPrincipal, ProviderError> {
            Ok(UserPrincipal::new(1, token, ""))
        }
    }

    #[test]
    fn prefix_normalization() {
        assert_eq!(normalize_prefix(""), None);
        assert_eq!(normalize_prefix("/"), None);
        assert_eq!(normalize_prefix("/api/"), Some("/api".to_string()));
        assert_eq!(normalize_prefix("api"), Some("/api".to_string()));
    }

    #[test]
    fn stages_follow_providers_and_switches() {
        let pipeline = Pipeline::builder().build();
        assert_eq!(pipeline.stages(), vec![StageName::RequestId]);

        let pipeline = Pipeline::builder().user_provider(Arc::new(Anyone)).build();
        assert_eq!(pipeline.stages(), vec![StageName::RequestId, StageName::Auth]);

        let pipeline = Pipeline::builder()
            .user_provider(Arc::new(Anyone))
            .disable(StageName::Auth)
            .disable(StageName::RequestId)
            .build();
        assert_eq!(pipeline.stages(), vec![StageName::RequestId]);

        let pipeline = Pipeline::builder()
            .user_provider(Arc::new(Anyone))
            .disable(StageName::Auth)
            .enable(StageName::Auth)
            .build();
        assert!(pipeline.stages().contains(&StageName::Auth));
    }
}

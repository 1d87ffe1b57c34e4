//! HTTP header to RPC metadata translation.
//!
//! Handlers forwarding a request to a gRPC backend build the outgoing
//! `MetadataMap` here. Either every inbound header is forwarded, or only the
//! request id, type and origin plus values computed by registered providers.
//! Providers may read the principals bound to the request id.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use gateway_core::request_ext::{
    APP_ID_KEY, REQUEST_FROM_KEY, REQUEST_ID_KEY, REQUEST_TYPE_KEY, USER_ID_KEY,
};
use http::HeaderMap;
use tonic::metadata::{AsciiMetadataKey, AsciiMetadataValue, MetadataMap};
use tracing::debug;

use crate::correlation::PrincipalBridge;
use crate::middleware::HeaderNames;
use crate::principal::{AppPrincipal, UserPrincipal};

/// What a metadata provider can see.
pub struct MetadataContext<'a> {
    pub headers: &'a HeaderMap,
    pub request_id: &'a str,
    pub app: Option<Arc<AppPrincipal>>,
    pub user: Option<Arc<UserPrincipal>>,
}

/// Computes one metadata value. `None` omits the key.
pub type MetadataFn = Arc<dyn Fn(&MetadataContext<'_>) -> Option<String> + Send + Sync>;

#[derive(Clone)]
enum MethodMetadata {
    All,
    Selected(Vec<(String, MetadataFn)>),
}

/// Builds outgoing RPC metadata from inbound headers.
#[derive(Clone)]
pub struct MetadataBridge {
    headers: Arc<HeaderNames>,
    principals: PrincipalBridge,
    forward_all: bool,
    defaults: Vec<(String, MetadataFn)>,
    methods: HashMap<String, MethodMetadata>,
}

impl MetadataBridge {
    #[must_use]
    pub fn new(headers: Arc<HeaderNames>, principals: PrincipalBridge) -> Self {
        Self {
            headers,
            principals,
            forward_all: false,
            defaults: Vec::new(),
            methods: HashMap::new(),
        }
    }

    /// Forward every inbound header for every method.
    #[must_use]
    pub fn forward_all(mut self) -> Self {
        self.forward_all = true;
        self
    }

    /// Add a provider used for every method in selective mode.
    #[must_use]
    pub fn with_default<F>(mut self, key: impl Into<String>, provider: F) -> Self
    where
        F: Fn(&MetadataContext<'_>) -> Option<String> + Send + Sync + 'static,
    {
        self.defaults.push((key.into(), Arc::new(provider)));
        self
    }

    /// Default providers for the bound app and user external ids.
    #[must_use]
    pub fn with_identity(self) -> Self {
        self.with_default(APP_ID_KEY, |ctx| ctx.app.as_ref().map(|app| app.app_id.clone()))
            .with_default(USER_ID_KEY, |ctx| ctx.user.as_ref().map(|user| user.user_id.clone()))
    }

    /// Add a provider for one RPC method. Ignored once the method forwards all headers.
    #[must_use]
    pub fn with_method<F>(mut self, method: impl Into<String>, key: impl Into<String>, provider: F) -> Self
    where
        F: Fn(&MetadataContext<'_>) -> Option<String> + Send + Sync + 'static,
    {
        let entry = self
            .methods
            .entry(method.into())
            .or_insert_with(|| MethodMetadata::Selected(Vec::new()));
        if let MethodMetadata::Selected(providers) = entry {
            providers.push((key.into(), Arc::new(provider)));
        }
        self
    }

    /// Forward every inbound header for `method` only.
    #[must_use]
    pub fn with_method_all(mut self, method: impl Into<String>) -> Self {
        self.methods.insert(method.into(), MethodMetadata::All);
        self
    }

    /// Metadata for a call to `method` made while serving a request with `headers`.
    #[must_use]
    pub fn metadata(&self, method: Option<&str>, headers: &HeaderMap) -> MetadataMap {
        let selected = method.and_then(|m| self.methods.get(m));
        if self.forward_all || matches!(selected, Some(MethodMetadata::All)) {
            return all_headers(headers);
        }

        let request_id = header(headers, &self.headers.request_id);
        let mut metadata = MetadataMap::new();
        insert(&mut metadata, REQUEST_ID_KEY, request_id);
        insert(&mut metadata, REQUEST_TYPE_KEY, header(headers, &self.headers.request_type));
        insert(&mut metadata, REQUEST_FROM_KEY, header(headers, &self.headers.request_from));

        let ctx = MetadataContext {
            headers,
            request_id,
            app: self.principals.app(request_id),
            user: self.principals.user(request_id),
        };

        let per_method = match selected {
            Some(MethodMetadata::Selected(providers)) => providers.as_slice(),
            _ => &[],
        };
        for (key, provider) in self.defaults.iter().chain(per_method) {
            if let Some(value) = provider(&ctx) {
                insert(&mut metadata, key, &value);
            }
        }
        metadata
    }

    /// Wrap `message` in a `tonic::Request` carrying the metadata for `method`.
    #[must_use]
    pub fn request<T>(&self, method: &str, headers: &HeaderMap, message: T) -> tonic::Request<T> {
        let mut request = tonic::Request::new(message);
        *request.metadata_mut() = self.metadata(Some(method), headers);
        request
    }
}

impl fmt::Debug for MetadataBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetadataBridge")
            .field("forward_all", &self.forward_all)
            .field("defaults", &self.defaults.len())
            .field("methods", &self.methods.len())
            .finish_non_exhaustive()
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &http::HeaderName) -> &'a str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
}

/// Every header, repeated values joined by a space.
fn all_headers(headers: &HeaderMap) -> MetadataMap {
    let mut metadata = MetadataMap::new();
    for name in headers.keys() {
        let joined = headers
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect::<Vec<_>>()
            .join(" ");
        insert(&mut metadata, name.as_str(), &joined);
    }
    metadata
}

fn insert(metadata: &mut MetadataMap, key: &str, value: &str) {
    let Ok(key) = AsciiMetadataKey::from_bytes(key.to_ascii_lowercase().as_bytes()) else {
        debug!(key, "Skipping invalid metadata key");
        return;
    };
    match AsciiMetadataValue::try_from(value) {
        Ok(value) => {
            metadata.insert(key, value);
        }
        Err(_) => debug!(key = key.as_str(), "Skipping invalid metadata value"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("x-request-id", "rq_1".parse().unwrap());
        headers.insert("x-request-type", "http".parse().unwrap());
        headers.insert("x-request-from", "client".parse().unwrap());
        headers.append("x-tag", "a".parse().unwrap());
        headers.append("x-tag", "b".parse().unwrap());
        headers
    }

    fn bridge() -> MetadataBridge {
        MetadataBridge::new(Arc::default(), PrincipalBridge::new())
    }

    #[test]
    fn forwards_all_headers_joined() {
        let metadata = bridge().forward_all().metadata(None, &headers());
        assert_eq!(metadata.get("x-tag").unwrap(), "a b");
        assert_eq!(metadata.get("x-request-id").unwrap(), "rq_1");
    }

    #[test]
    fn selective_mode_uses_request_keys_and_providers() {
        let bridge = bridge()
            .with_default("tenant", |_| Some("acme".to_string()))
            .with_method("GetUser", "scope", |ctx| Some(format!("{}:read", ctx.request_id)))
            .with_method("Skip", "never", |_| None);

        let metadata = bridge.metadata(Some("GetUser"), &headers());
        assert_eq!(metadata.get(REQUEST_ID_KEY).unwrap(), "rq_1");
        assert_eq!(metadata.get(REQUEST_TYPE_KEY).unwrap(), "http");
        assert_eq!(metadata.get(REQUEST_FROM_KEY).unwrap(), "client");
        assert_eq!(metadata.get("tenant").unwrap(), "acme");
        assert_eq!(metadata.get("scope").unwrap(), "rq_1:read");
        assert!(metadata.get("x-tag").is_none());

        let metadata = bridge.metadata(Some("Skip"), &headers());
        assert!(metadata.get("never").is_none());
        assert!(metadata.get("scope").is_none());
    }

    #[test]
    fn method_can_switch_to_all_headers() {
        let bridge = bridge()
            .with_method("Proxy", "ignored", |_| Some("x".to_string()))
            .with_method_all("Proxy")
            .with_method("Proxy", "still-ignored", |_| Some("y".to_string()));

        let metadata = bridge.metadata(Some("Proxy"), &headers());
        assert_eq!(metadata.get("x-tag").unwrap(), "a b");
        assert!(metadata.get("ignored").is_none());
        assert!(metadata.get("still-ignored").is_none());
    }

    #[test]
    fn identity_reads_bound_principals() {
        let principals = PrincipalBridge::new();
        let bridge = MetadataBridge::new(Arc::default(), principals.clone()).with_identity();

        let _app = principals.bind_app("rq_1", Arc::new(AppPrincipal::new(1, "app-1", "")));
        let _user = principals.bind_user("rq_1", Arc::new(UserPrincipal::new(2, "u-2", "")));

        let request = bridge.request("GetUser", &headers(), ());
        assert_eq!(request.metadata().get(APP_ID_KEY).unwrap(), "app-1");
        assert_eq!(request.metadata().get(USER_ID_KEY).unwrap(), "u-2");
    }
}

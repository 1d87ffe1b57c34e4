//! Resolved caller identities.
//!
//! Providers build principals once per request; stages and metadata
//! providers share them read-only through the correlation store.

use std::collections::BTreeMap;

/// Identity fields common to apps and users.
pub trait Identity: Send + Sync {
    /// Numeric id in the owning service.
    fn id(&self) -> u64;
    /// Id carried in headers and metadata.
    fn external_id(&self) -> &str;
    fn name(&self) -> &str;
    /// Whether the caller is a backend (admin console) rather than an end client.
    fn is_backend(&self) -> bool;
}

/// Free-form string attributes.
pub trait Attributes: Send + Sync {
    fn attrs(&self) -> &BTreeMap<String, String>;

    fn attr(&self, key: &str) -> Option<&str> {
        self.attrs().get(key).map(String::as_str)
    }
}

/// Calling application.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppPrincipal {
    pub id: u64,
    pub app_id: String,
    pub name: String,
    pub backend: bool,
    pub scopes: Vec<String>,
    pub manage: bool,
    pub attrs: BTreeMap<String, String>,
}

impl AppPrincipal {
    #[must_use]
    pub fn new(id: u64, app_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id,
            app_id: app_id.into(),
            name: name.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s == scope)
    }

    /// Whether the app may use management endpoints.
    #[inline]
    #[must_use]
    pub const fn can_manage(&self) -> bool {
        self.manage
    }
}

impl Identity for AppPrincipal {
    fn id(&self) -> u64 {
        self.id
    }

    fn external_id(&self) -> &str {
        &self.app_id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn is_backend(&self) -> bool {
        self.backend
    }
}

impl Attributes for AppPrincipal {
    fn attrs(&self) -> &BTreeMap<String, String> {
        &self.attrs
    }
}

/// Authenticated end user.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserPrincipal {
    pub id: u64,
    pub user_id: String,
    pub name: String,
    pub backend: bool,
    pub attrs: BTreeMap<String, String>,
}

impl UserPrincipal {
    #[must_use]
    pub fn new(id: u64, user_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id,
            user_id: user_id.into(),
            name: name.into(),
            ..Self::default()
        }
    }
}

impl Identity for UserPrincipal {
    fn id(&self) -> u64 {
        self.id
    }

    fn external_id(&self) -> &str {
        &self.user_id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn is_backend(&self) -> bool {
        self.backend
    }
}

impl Attributes for UserPrincipal {
    fn attrs(&self) -> &BTreeMap<String, String> {
        &self.attrs
    }
}

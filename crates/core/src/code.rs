//! Error codes and project namespacing.
//!
//! Common codes are shared by every project and keep their raw value, even
//! once bound to a project.
//! Project codes are namespaced by concatenating the project id, a `0`
//! separator and the raw code: raw `5` in project `7` becomes `705`.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::messages::{self, COMMON_PROJECT, MessageCatalog, format_message};

const TARGET_KEY: &str = "target";
const LOCALE_KEY: &str = "locale";

pub const SUCCESS: ErrorCode = ErrorCode::common(0, "success");
pub const INTERNAL: ErrorCode = ErrorCode::common(1, "internal error");
pub const INVALID_ARGUMENTS: ErrorCode = ErrorCode::common(2, "invalid arguments");
pub const CONFLICT: ErrorCode = ErrorCode::common(3, "operate conflict");
pub const APP_INVALID: ErrorCode = ErrorCode::common(11, "application identify invalid");
pub const TOKEN_INVALID: ErrorCode = ErrorCode::common(12, "authorization token invalid");
pub const DECRYPT_FAILED: ErrorCode = ErrorCode::common(13, "data decrypt failed");
pub const ENCRYPT_FAILED: ErrorCode = ErrorCode::common(14, "data encrypt failed");
pub const SIGNATURE_INVALID: ErrorCode = ErrorCode::common(15, "signature invalid");
pub const SIGNATURE_GENERATE_FAILED: ErrorCode =
    ErrorCode::common(16, "signature generate failed");
pub const NO_PERMISSION: ErrorCode = ErrorCode::common(17, "no permission");
pub const RPC_FAILED: ErrorCode = ErrorCode::common(18, "rpc call failed");

/// Custom message function. Returning `None` falls back to the target string.
pub type MessageFn = dyn Fn(&ErrorCode, &[String]) -> Option<String> + Send + Sync;

/// How an [`ErrorCode`] turns into human-readable text.
#[derive(Clone)]
pub enum MessageResolver {
    /// Look the target up in the message catalog; `fallback` is used when
    /// no catalog entry exists.
    Catalog { fallback: Cow<'static, str> },
    /// Fixed text with `%s`-style placeholders.
    Literal(Cow<'static, str>),
    Custom(Arc<MessageFn>),
    /// No message; callers substitute a generic one.
    None,
}

impl fmt::Debug for MessageResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Catalog { fallback } => f.debug_struct("Catalog").field("fallback", fallback).finish(),
            Self::Literal(text) => f.debug_tuple("Literal").field(text).finish(),
            Self::Custom(_) => f.write_str("Custom(..)"),
            Self::None => f.write_str("None"),
        }
    }
}

/// Project an error code belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Project {
    pub id: u32,
    pub name: Cow<'static, str>,
}

/// Localizable numeric error identifier.
#[derive(Debug, Clone)]
pub struct ErrorCode {
    raw: u32,
    common: bool,
    project: Option<Project>,
    resolver: MessageResolver,
    overrides: BTreeMap<String, String>,
}

impl ErrorCode {
    /// Common code resolved through the catalog with `fallback` as default text.
    #[must_use]
    pub const fn common(raw: u32, fallback: &'static str) -> Self {
        Self {
            raw,
            common: true,
            project: None,
            resolver: MessageResolver::Catalog {
                fallback: Cow::Borrowed(fallback),
            },
            overrides: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn new(raw: u32, resolver: MessageResolver) -> Self {
        Self {
            raw,
            common: false,
            project: None,
            resolver,
            overrides: BTreeMap::new(),
        }
    }

    /// Wire value of the code.
    ///
    /// Falls back to the raw value when the composite does not fit in `u32`.
    #[must_use]
    pub fn code(&self) -> u32 {
        match &self.project {
            Some(project) if !self.common => format!("{}0{}", project.id, self.raw)
                .parse()
                .unwrap_or(self.raw),
            _ => self.raw,
        }
    }

    #[inline]
    #[must_use]
    pub const fn raw(&self) -> u32 {
        self.raw
    }

    #[must_use]
    pub const fn project(&self) -> Option<&Project> {
        self.project.as_ref()
    }

    /// Catalog project id, `0` for common codes.
    #[must_use]
    pub fn project_id(&self) -> u32 {
        self.project.as_ref().map_or(COMMON_PROJECT, |p| p.id)
    }

    #[must_use]
    pub const fn is_common(&self) -> bool {
        self.common
    }

    /// Catalog key: the raw code, or `"{raw}.{target}"` when a target is set.
    #[must_use]
    pub fn target(&self) -> String {
        match self.overrides.get(TARGET_KEY) {
            Some(target) => format!("{}.{target}", self.raw),
            None => self.raw.to_string(),
        }
    }

    #[must_use]
    pub fn locale(&self) -> Option<&str> {
        self.overrides.get(LOCALE_KEY).map(String::as_str)
    }

    #[must_use]
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.overrides.insert(TARGET_KEY.to_string(), target.into());
        self
    }

    #[must_use]
    pub fn with_locale(mut self, locale: impl Into<String>) -> Self {
        self.overrides.insert(LOCALE_KEY.to_string(), locale.into());
        self
    }

    /// Bind the code to a project. Binding an already namespaced code replaces
    /// the project. Common codes keep their raw value but pick up the
    /// project's messages and name.
    #[must_use]
    pub fn with_project(mut self, id: u32, name: impl Into<Cow<'static, str>>) -> Self {
        self.project = Some(Project {
            id,
            name: name.into(),
        });
        self
    }

    /// Message resolved against the process-wide catalog.
    #[must_use]
    pub fn message(&self, params: &[String]) -> String {
        self.message_in(&messages::catalog(), params)
    }

    /// Message resolved against `catalog`. Empty when the resolver is
    /// [`MessageResolver::None`].
    #[must_use]
    pub fn message_in(&self, catalog: &MessageCatalog, params: &[String]) -> String {
        let text = match &self.resolver {
            MessageResolver::Catalog { fallback } => catalog
                .translate(self.project_id(), self.locale(), &self.target(), params)
                .or_else(|| (!fallback.is_empty()).then(|| format_message(fallback, params)))
                .unwrap_or_else(|| self.target()),
            MessageResolver::Literal(text) => format_message(text, params),
            MessageResolver::Custom(resolve) => {
                resolve(self, params).unwrap_or_else(|| self.target())
            }
            MessageResolver::None => return String::new(),
        };

        match &self.project {
            Some(Project { name, .. }) if !name.is_empty() => format!("{name}: {text}"),
            _ => text,
        }
    }
}

impl PartialEq for ErrorCode {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
            && self.common == other.common
            && (self.common || self.project_id() == other.project_id())
    }
}

impl Eq for ErrorCode {}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Creates codes namespaced to one project.
#[derive(Debug, Clone)]
pub struct ErrorCodeFactory {
    project: Project,
}

impl ErrorCodeFactory {
    #[must_use]
    pub fn new(id: u32, name: impl Into<Cow<'static, str>>) -> Self {
        Self {
            project: Project {
                id,
                name: name.into(),
            },
        }
    }

    #[must_use]
    pub const fn project(&self) -> &Project {
        &self.project
    }

    /// Code resolved through the message catalog.
    #[must_use]
    pub fn code(&self, raw: u32) -> ErrorCode {
        self.bind(ErrorCode::new(
            raw,
            MessageResolver::Catalog {
                fallback: Cow::Borrowed(""),
            },
        ))
    }

    #[must_use]
    pub fn literal(&self, raw: u32, text: impl Into<Cow<'static, str>>) -> ErrorCode {
        self.bind(ErrorCode::new(raw, MessageResolver::Literal(text.into())))
    }

    #[must_use]
    pub fn custom<F>(&self, raw: u32, resolve: F) -> ErrorCode
    where
        F: Fn(&ErrorCode, &[String]) -> Option<String> + Send + Sync + 'static,
    {
        self.bind(ErrorCode::new(raw, MessageResolver::Custom(Arc::new(resolve))))
    }

    /// Code without a message of its own.
    #[must_use]
    pub fn silent(&self, raw: u32) -> ErrorCode {
        self.bind(ErrorCode::new(raw, MessageResolver::None))
    }

    fn bind(&self, code: ErrorCode) -> ErrorCode {
        code.with_project(self.project.id, self.project.name.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn common_codes_keep_raw_value() {
        assert_eq!(INTERNAL.code(), 1);
        assert_eq!(NO_PERMISSION.code(), 17);
        assert_eq!(ErrorCode::common(5, "x").code(), 5);
    }

    #[test]
    fn project_binding_keeps_common_codes_raw() {
        let code = ErrorCode::common(5, "x").with_project(7, "orders");
        assert_eq!(code.code(), 5);
        assert!(code.is_common());
        assert_eq!(code, ErrorCode::common(5, "x"));
        assert_eq!(code.message_in(&MessageCatalog::new(), &[]), "orders: x");

        let project = ErrorCodeFactory::new(7, "orders").code(5);
        assert!(!project.is_common());
        assert_ne!(project, code);
    }

    #[test]
    fn project_codes_are_composed_without_collisions() {
        let mut seen = std::collections::HashSet::new();
        for (project, expected) in [(7, [705, 7015, 70105]), (12, [1205, 12015, 120105])] {
            let factory = ErrorCodeFactory::new(project, "");
            for (raw, want) in [5, 15, 105].into_iter().zip(expected) {
                let code = factory.code(raw).code();
                assert_eq!(code, want);
                assert!(seen.insert(code), "duplicate composite {code}");
            }
        }
    }

    #[test]
    fn oversized_composite_falls_back_to_raw() {
        let code = ErrorCodeFactory::new(4_000_000, "").code(123_456);
        assert_eq!(code.code(), 123_456);
    }

    #[test]
    fn target_and_locale_overrides() {
        let code = INVALID_ARGUMENTS.with_target("email").with_locale("zh");
        assert_eq!(code.target(), "2.email");
        assert_eq!(code.locale(), Some("zh"));
        assert_eq!(code, INVALID_ARGUMENTS);
    }

    #[test]
    fn messages_fall_back_to_default_text_then_target() {
        let catalog = MessageCatalog::new();
        assert_eq!(INTERNAL.message_in(&catalog, &[]), "internal error");

        let factory = ErrorCodeFactory::new(7, "");
        assert_eq!(factory.code(5).message_in(&catalog, &[]), "5");
        assert_eq!(factory.code(5).with_target("id").message_in(&catalog, &[]), "5.id");
    }

    #[test]
    fn project_name_prefixes_message() {
        let mut catalog = MessageCatalog::new();
        catalog.load(7, "en", br#"{"5": "order %s missing"}"#).unwrap();

        let factory = ErrorCodeFactory::new(7, "orders");
        let message = factory.code(5).message_in(&catalog, &["9".to_string()]);
        assert_eq!(message, "orders: order 9 missing");
    }

    #[test]
    fn literal_custom_and_silent_resolvers() {
        let catalog = MessageCatalog::new();
        let factory = ErrorCodeFactory::new(3, "");

        assert_eq!(
            factory.literal(1, "bad %s").message_in(&catalog, &["x".into()]),
            "bad x"
        );
        assert_eq!(
            factory
                .custom(2, |code, _| Some(format!("custom {}", code.raw())))
                .message_in(&catalog, &[]),
            "custom 2"
        );
        assert_eq!(factory.custom(4, |_, _| None).message_in(&catalog, &[]), "4");
        assert!(factory.silent(6).message_in(&catalog, &[]).is_empty());
    }
}

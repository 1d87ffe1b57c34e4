//! Localized error message catalog.
//!
//! Messages are JSON objects grouped by project and language. A group maps a
//! target to either a string or a nested object addressed with one level of
//! dot notation (`"2.email"`); a bare target resolves a nested object through
//! its `default` key.
//!
//! The process-wide catalog is populated at startup with [`install`] and is
//! read lock-free afterwards.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use arc_swap::ArcSwap;
use serde_json::{Map, Value};

/// Project id used by common (non-namespaced) error codes.
pub const COMMON_PROJECT: u32 = 0;

/// Last-resort language in the fallback chain.
pub const ENGLISH: &str = "en";

type MessageGroup = Map<String, Value>;

static CATALOG: LazyLock<ArcSwap<MessageCatalog>> =
    LazyLock::new(|| ArcSwap::from_pointee(MessageCatalog::default()));

/// Replace the process-wide catalog.
pub fn install(catalog: MessageCatalog) {
    CATALOG.store(Arc::new(catalog));
}

/// Snapshot of the process-wide catalog.
#[must_use]
pub fn catalog() -> Arc<MessageCatalog> {
    CATALOG.load_full()
}

/// Catalog loading errors.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("invalid message data for language `{language}`: {source}")]
    InvalidData {
        language: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("message data for language `{0}` must be a JSON object")]
    NotAnObject(String),
}

/// Messages indexed by project, then language, in load order.
#[derive(Debug, Clone)]
pub struct MessageCatalog {
    default_language: String,
    projects: HashMap<u32, HashMap<String, Vec<MessageGroup>>>,
}

impl Default for MessageCatalog {
    fn default() -> Self {
        Self {
            default_language: ENGLISH.to_string(),
            projects: HashMap::new(),
        }
    }
}

impl MessageCatalog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the language tried after the requested one. Empty values are ignored.
    #[must_use]
    pub fn with_default_language(mut self, language: &str) -> Self {
        if !language.is_empty() {
            self.default_language = language.to_string();
        }
        self
    }

    #[must_use]
    pub fn default_language(&self) -> &str {
        &self.default_language
    }

    /// Append one JSON message group for `project` and `language`.
    ///
    /// # Errors
    /// Returns [`CatalogError`] if `data` is not a JSON object.
    pub fn load(&mut self, project: u32, language: &str, data: &[u8]) -> Result<(), CatalogError> {
        let group = match serde_json::from_slice::<Value>(data) {
            Ok(Value::Object(group)) => group,
            Ok(_) => return Err(CatalogError::NotAnObject(language.to_string())),
            Err(source) => {
                return Err(CatalogError::InvalidData {
                    language: language.to_string(),
                    source,
                });
            }
        };

        self.projects
            .entry(project)
            .or_default()
            .entry(language.to_string())
            .or_default()
            .push(group);
        Ok(())
    }

    /// Append every group of `other` after the groups already loaded.
    pub fn merge(&mut self, other: Self) {
        for (project, languages) in other.projects {
            let target = self.projects.entry(project).or_default();
            for (language, groups) in languages {
                target.entry(language).or_default().extend(groups);
            }
        }
    }

    /// Resolve `target` for `project`.
    ///
    /// Languages are tried in order: requested, catalog default, English. The
    /// project's own groups win over the common project's. Returns `None` when
    /// no group defines the target.
    #[must_use]
    pub fn translate(
        &self,
        project: u32,
        language: Option<&str>,
        target: &str,
        params: &[String],
    ) -> Option<String> {
        let mut projects = vec![project];
        if project != COMMON_PROJECT {
            projects.push(COMMON_PROJECT);
        }

        let languages = self.language_chain(language);

        projects
            .iter()
            .filter_map(|id| self.projects.get(id))
            .find_map(|by_language| {
                languages.iter().find_map(|language| {
                    by_language
                        .get(*language)
                        .and_then(|groups| lookup(groups, target))
                })
            })
            .map(|template| format_message(template, params))
    }

    fn language_chain<'a>(&'a self, requested: Option<&'a str>) -> Vec<&'a str> {
        let mut chain = Vec::with_capacity(3);
        for language in [requested.unwrap_or_default(), &self.default_language, ENGLISH] {
            if !language.is_empty() && !chain.contains(&language) {
                chain.push(language);
            }
        }
        chain
    }
}

fn lookup<'a>(groups: &'a [MessageGroup], target: &str) -> Option<&'a str> {
    let (head, key) = target.split_once('.').unwrap_or((target, "default"));

    groups.iter().find_map(|group| match group.get(head)? {
        Value::String(message) => Some(message.as_str()),
        Value::Object(nested) => nested.get(key)?.as_str(),
        _ => None,
    })
}

/// Substitute `%s`, `%d` and `%v` placeholders with `params` in order.
///
/// `%%` renders a literal percent sign. Placeholders without a matching
/// parameter are kept verbatim.
#[must_use]
pub fn format_message(template: &str, params: &[String]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut params = params.iter();
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.peek().copied() {
            Some('%') => {
                chars.next();
                out.push('%');
            }
            Some(verb @ ('s' | 'd' | 'v')) => {
                chars.next();
                match params.next() {
                    Some(param) => out.push_str(param),
                    None => {
                        out.push('%');
                        out.push(verb);
                    }
                }
            }
            _ => out.push('%'),
        }
    }
    out
}

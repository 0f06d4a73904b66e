//! Declarative selectors over [`Scope`] fields.
//!
//! A matcher is written as a string or an array of strings:
//!
//! | Form | Meaning |
//! |------|---------|
//! | `"*"` | field is present and non-empty |
//! | `"*.example.com"` | field ends with the suffix |
//! | `"/v1/*"` | field starts with the prefix |
//! | `"GET"` | exact value |
//! | `["a", "*.b"]` | any alternative matches |
//!
//! An undeclared matcher matches everything.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::scope::Scope;

/// One field pattern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "MatcherSpec", into = "MatcherSpec")]
pub enum Matcher {
    Present,
    Literal(String),
    Suffix(String),
    Prefix(String),
    OneOf(Vec<Matcher>),
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum MatcherSpec {
    One(String),
    Many(Vec<String>),
}

impl From<MatcherSpec> for Matcher {
    fn from(spec: MatcherSpec) -> Self {
        match spec {
            MatcherSpec::One(pattern) => Self::parse(&pattern),
            MatcherSpec::Many(patterns) => {
                Self::OneOf(patterns.iter().map(|pattern| Self::parse(pattern)).collect())
            }
        }
    }
}

impl From<Matcher> for MatcherSpec {
    fn from(matcher: Matcher) -> Self {
        match matcher {
            Matcher::OneOf(alternatives) => Self::Many(
                alternatives
                    .into_iter()
                    .map(|alternative| alternative.pattern())
                    .collect(),
            ),
            other => Self::One(other.pattern()),
        }
    }
}

impl From<&str> for Matcher {
    fn from(pattern: &str) -> Self {
        Self::parse(pattern)
    }
}

/// How string comparison behaves for a given field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FieldKind {
    Plain,
    /// Case-insensitive; suffixes respect dot label boundaries.
    Hostname,
    /// Case-insensitive exact comparison.
    CaseInsensitive,
}

impl Matcher {
    /// Parses a single pattern string. Never yields `OneOf`.
    pub fn parse(pattern: &str) -> Self {
        if pattern == "*" {
            return Self::Present;
        }
        if let Some(suffix) = pattern.strip_prefix('*') {
            return Self::Suffix(suffix.to_string());
        }
        if let Some(prefix) = pattern.strip_suffix('*') {
            return Self::Prefix(prefix.to_string());
        }
        Self::Literal(pattern.to_string())
    }

    pub fn one_of<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self::OneOf(
            patterns
                .into_iter()
                .map(|pattern| Self::parse(pattern.as_ref()))
                .collect(),
        )
    }

    fn pattern(&self) -> String {
        match self {
            Self::Present => String::from("*"),
            Self::Literal(value) => value.clone(),
            Self::Suffix(suffix) => format!("*{suffix}"),
            Self::Prefix(prefix) => format!("{prefix}*"),
            Self::OneOf(alternatives) => alternatives
                .iter()
                .map(Self::pattern)
                .collect::<Vec<_>>()
                .join(","),
        }
    }

    /// Plain string semantics.
    pub fn matches(&self, value: Option<&str>) -> bool {
        self.matches_as(value, FieldKind::Plain)
    }

    /// Hostname semantics: case-insensitive with label-boundary suffixes.
    pub fn matches_hostname(&self, value: Option<&str>) -> bool {
        self.matches_as(value, FieldKind::Hostname)
    }

    fn matches_as(&self, value: Option<&str>, kind: FieldKind) -> bool {
        let Some(value) = value.filter(|value| !value.is_empty()) else {
            return false;
        };

        match self {
            Self::Present => true,
            Self::Literal(expected) => match kind {
                FieldKind::Plain => value == expected,
                FieldKind::Hostname | FieldKind::CaseInsensitive => {
                    value.eq_ignore_ascii_case(expected)
                }
            },
            Self::Prefix(prefix) => match kind {
                FieldKind::Plain => value.starts_with(prefix.as_str()),
                FieldKind::Hostname | FieldKind::CaseInsensitive => value
                    .to_ascii_lowercase()
                    .starts_with(&prefix.to_ascii_lowercase()),
            },
            Self::Suffix(suffix) => match kind {
                FieldKind::Plain => value.ends_with(suffix.as_str()),
                FieldKind::CaseInsensitive => value
                    .to_ascii_lowercase()
                    .ends_with(&suffix.to_ascii_lowercase()),
                FieldKind::Hostname => hostname_suffix_matches(value, suffix),
            },
            Self::OneOf(alternatives) => alternatives
                .iter()
                .any(|alternative| alternative.matches_as(Some(value), kind)),
        }
    }
}

fn hostname_suffix_matches(hostname: &str, suffix: &str) -> bool {
    let hostname = hostname.to_ascii_lowercase();
    let suffix = suffix.to_ascii_lowercase();

    if !hostname.ends_with(&suffix) {
        return false;
    }
    if suffix.starts_with('.') || hostname.len() == suffix.len() {
        return true;
    }
    hostname.as_bytes()[hostname.len() - suffix.len() - 1] == b'.'
}

/// Rule selector. Every declared field must match; undeclared fields are wildcards.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Selector {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<Matcher>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_name: Option<Matcher>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation: Option<Matcher>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<Matcher>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_class: Option<Matcher>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<Matcher>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<Matcher>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<Matcher>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pathname: Option<Matcher>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<Matcher>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<Matcher>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<Matcher>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<Matcher>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool: Option<Matcher>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<Matcher>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub extensions: BTreeMap<String, Matcher>,
}

impl Selector {
    /// Selector that matches every scope.
    pub fn any() -> Self {
        Self::default()
    }

    pub fn with_client_name(mut self, matcher: impl Into<Matcher>) -> Self {
        self.client_name = Some(matcher.into());
        self
    }

    pub fn with_operation(mut self, matcher: impl Into<Matcher>) -> Self {
        self.operation = Some(matcher.into());
        self
    }

    pub fn with_method(mut self, matcher: impl Into<Matcher>) -> Self {
        self.method = Some(matcher.into());
        self
    }

    pub fn with_hostname(mut self, matcher: impl Into<Matcher>) -> Self {
        self.hostname = Some(matcher.into());
        self
    }

    pub fn with_pathname(mut self, matcher: impl Into<Matcher>) -> Self {
        self.pathname = Some(matcher.into());
        self
    }

    pub fn with_category(mut self, matcher: impl Into<Matcher>) -> Self {
        self.category = Some(matcher.into());
        self
    }

    pub fn with_model(mut self, matcher: impl Into<Matcher>) -> Self {
        self.model = Some(matcher.into());
        self
    }

    pub fn with_provider(mut self, matcher: impl Into<Matcher>) -> Self {
        self.provider = Some(matcher.into());
        self
    }

    pub fn with_tenant_id(mut self, matcher: impl Into<Matcher>) -> Self {
        self.tenant_id = Some(matcher.into());
        self
    }

    pub fn with_kind(mut self, matcher: impl Into<Matcher>) -> Self {
        self.kind = Some(matcher.into());
        self
    }

    pub fn with_extension(mut self, name: impl Into<String>, matcher: impl Into<Matcher>) -> Self {
        self.extensions.insert(name.into(), matcher.into());
        self
    }

    pub fn matches(&self, scope: &Scope) -> bool {
        let method = scope.method.map(|method| method.as_str());
        let port = scope.port.map(|port| port.to_string());

        field_matches(&self.kind, Some(scope.kind.as_str()), FieldKind::Plain)
            && field_matches(&self.client_name, Some(&scope.client_name), FieldKind::Plain)
            && field_matches(&self.operation, scope.operation.as_deref(), FieldKind::Plain)
            && field_matches(&self.method, method, FieldKind::CaseInsensitive)
            && field_matches(&self.request_class, scope.request_class.as_deref(), FieldKind::Plain)
            && field_matches(&self.protocol, Some(&scope.protocol), FieldKind::CaseInsensitive)
            && field_matches(&self.hostname, Some(&scope.hostname), FieldKind::Hostname)
            && field_matches(&self.port, port.as_deref(), FieldKind::Plain)
            && field_matches(&self.pathname, Some(&scope.pathname), FieldKind::Plain)
            && field_matches(&self.category, scope.category.as_deref(), FieldKind::Plain)
            && field_matches(&self.tenant_id, scope.tenant_id.as_deref(), FieldKind::Plain)
            && field_matches(
                &self.provider,
                scope.provider_tags.provider.as_deref(),
                FieldKind::Plain,
            )
            && field_matches(&self.model, scope.provider_tags.model.as_deref(), FieldKind::Plain)
            && field_matches(&self.tool, scope.provider_tags.tool.as_deref(), FieldKind::Plain)
            && field_matches(&self.agent, scope.agent_context.agent.as_deref(), FieldKind::Plain)
            && self.extensions.iter().all(|(name, matcher)| {
                matcher.matches(scope.extensions.get(name).map(String::as_str))
            })
    }
}

fn field_matches(matcher: &Option<Matcher>, value: Option<&str>, kind: FieldKind) -> bool {
    matcher
        .as_ref()
        .map_or(true, |matcher| matcher.matches_as(value, kind))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http_client::{HttpMethod, HttpRequestOptions};
    use crate::scope::EXT_AI_MODEL;

    fn scope(url: &str) -> Scope {
        let request = HttpRequestOptions::new(HttpMethod::Post, url)
            .with_operation("chat.completions")
            .with_extension(EXT_AI_MODEL, "gpt-4o");
        Scope::from_request("llm", &request).expect("valid scope")
    }

    #[test]
    fn parse_recognizes_every_pattern_form() {
        assert_eq!(Matcher::parse("*"), Matcher::Present);
        assert_eq!(Matcher::parse("*.example.com"), Matcher::Suffix(String::from(".example.com")));
        assert_eq!(Matcher::parse("/v1/*"), Matcher::Prefix(String::from("/v1/")));
        assert_eq!(Matcher::parse("GET"), Matcher::Literal(String::from("GET")));
    }

    #[test]
    fn present_requires_non_empty_value() {
        assert!(Matcher::Present.matches(Some("x")));
        assert!(!Matcher::Present.matches(Some("")));
        assert!(!Matcher::Present.matches(None));
    }

    #[test]
    fn hostname_suffix_respects_label_boundary() {
        let dotted = Matcher::parse("*.example.com");
        assert!(dotted.matches_hostname(Some("api.example.com")));
        assert!(!dotted.matches_hostname(Some("notexample.com")));
        assert!(!dotted.matches_hostname(Some("example.com")));

        let bare = Matcher::parse("*example.com");
        assert!(bare.matches_hostname(Some("example.com")));
        assert!(bare.matches_hostname(Some("API.Example.com")));
        assert!(!bare.matches_hostname(Some("notexample.com")));
    }

    #[test]
    fn one_of_matches_any_alternative() {
        let matcher = Matcher::one_of(["gpt-4o", "claude-*"]);

        assert!(matcher.matches(Some("gpt-4o")));
        assert!(matcher.matches(Some("claude-3")));
        assert!(!matcher.matches(Some("llama")));
    }

    #[test]
    fn selector_requires_every_declared_field() {
        let scope = scope("https://api.example.com/v1/chat");

        assert!(Selector::any().matches(&scope));
        assert!(Selector::any()
            .with_hostname("*.example.com")
            .with_method("post")
            .with_model("gpt-*")
            .matches(&scope));
        assert!(!Selector::any()
            .with_hostname("*.example.com")
            .with_operation("embeddings")
            .matches(&scope));
        assert!(!Selector::any().with_tenant_id("*").matches(&scope));
    }

    #[test]
    fn selector_deserializes_strings_and_arrays() {
        let selector: Selector = serde_json::from_str(
            r#"{"hostname":"*.example.com","method":["GET","POST"],"extensions":{"ai.model":"*"}}"#,
        )
        .expect("valid selector");

        assert_eq!(selector.method, Some(Matcher::one_of(["GET", "POST"])));
        assert!(selector.matches(&scope("https://api.example.com/")));
        assert!(!selector.matches(&scope("https://other.test/")));
    }

    #[test]
    fn selector_rejects_unknown_fields() {
        let result = serde_json::from_str::<Selector>(r#"{"hostnme":"x"}"#);
        assert!(result.is_err());
    }
}

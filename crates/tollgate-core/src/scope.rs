//! Structured request classification used by policy and guardrail selectors.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::error::{ScopeError, TemplateError};
use crate::http_client::{AgentContext, HttpMethod, HttpRequestOptions};

pub const EXT_TENANT_ID: &str = "tenant.id";
pub const EXT_AI_PROVIDER: &str = "ai.provider";
pub const EXT_AI_MODEL: &str = "ai.model";
pub const EXT_AI_TOOL: &str = "ai.tool";
pub const EXT_REQUEST_CLASS: &str = "request.class";
pub const EXT_REQUEST_CATEGORY: &str = "request.category";

/// What kind of outbound action a scope describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScopeKind {
    Http,
    BrowserNavigation,
}

impl ScopeKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::BrowserNavigation => "browser-navigation",
        }
    }
}

impl Display for ScopeKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProviderTags {
    pub provider: Option<String>,
    pub model: Option<String>,
    pub tool: Option<String>,
}

/// Per-request classification. Lives for one evaluation and is never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scope {
    pub kind: ScopeKind,
    pub client_name: String,
    pub operation: Option<String>,
    pub method: Option<HttpMethod>,
    pub request_class: Option<String>,
    pub protocol: String,
    pub hostname: String,
    pub port: Option<u16>,
    pub pathname: String,
    pub category: Option<String>,
    pub tenant_id: Option<String>,
    pub provider_tags: ProviderTags,
    pub agent_context: AgentContext,
    pub extensions: BTreeMap<String, String>,
}

/// Scope consumed by the policy engine.
pub type PolicyScope = Scope;
/// Scope consumed by the guardrail engine.
pub type GuardrailScope = Scope;

impl Scope {
    /// Derives the scope of an HTTP call.
    pub fn from_request(
        client_name: impl Into<String>,
        request: &HttpRequestOptions,
    ) -> Result<Self, ScopeError> {
        let raw_url = request.resolved_url().ok_or(ScopeError::MissingUrl)?;
        let url = parse_url(&raw_url)?;
        let extensions = request.extensions.clone();

        Ok(Self {
            kind: ScopeKind::Http,
            client_name: client_name.into(),
            operation: request.operation.clone(),
            method: Some(request.method),
            request_class: extensions.get(EXT_REQUEST_CLASS).cloned(),
            protocol: url.scheme().to_string(),
            hostname: host_of(&url, &raw_url)?,
            port: url.port_or_known_default(),
            pathname: url.path().to_string(),
            category: extensions.get(EXT_REQUEST_CATEGORY).cloned(),
            tenant_id: extensions.get(EXT_TENANT_ID).cloned(),
            provider_tags: ProviderTags {
                provider: extensions.get(EXT_AI_PROVIDER).cloned(),
                model: extensions.get(EXT_AI_MODEL).cloned(),
                tool: extensions.get(EXT_AI_TOOL).cloned(),
            },
            agent_context: request.agent_context.clone(),
            extensions,
        })
    }

    /// Derives the scope of a browser page load. There is no method, header or body.
    pub fn for_navigation(
        client_name: impl Into<String>,
        url: &str,
        agent_context: &AgentContext,
    ) -> Result<Self, ScopeError> {
        let parsed = parse_url(url)?;

        Ok(Self {
            kind: ScopeKind::BrowserNavigation,
            client_name: client_name.into(),
            operation: None,
            method: None,
            request_class: None,
            protocol: parsed.scheme().to_string(),
            hostname: host_of(&parsed, url)?,
            port: parsed.port_or_known_default(),
            pathname: parsed.path().to_string(),
            category: None,
            tenant_id: agent_context.attributes.get(EXT_TENANT_ID).cloned(),
            provider_tags: ProviderTags::default(),
            agent_context: agent_context.clone(),
            extensions: BTreeMap::new(),
        })
    }

    /// Looks up a field by its template name.
    ///
    /// `Ok(None)` means the field exists but is unset for this request.
    pub fn field(&self, name: &str) -> Result<Option<String>, TemplateError> {
        if let Some(key) = name.strip_prefix("ext.") {
            return Ok(self.extensions.get(key).cloned());
        }

        let value = match name {
            "kind" => Some(self.kind.as_str().to_string()),
            "clientName" => Some(self.client_name.clone()),
            "operation" => self.operation.clone(),
            "method" => self.method.map(|method| method.as_str().to_string()),
            "requestClass" => self.request_class.clone(),
            "protocol" => Some(self.protocol.clone()),
            "hostname" => Some(self.hostname.clone()),
            "port" => self.port.map(|port| port.to_string()),
            "pathname" => Some(self.pathname.clone()),
            "category" => self.category.clone(),
            "tenantId" => self.tenant_id.clone(),
            "provider" => self.provider_tags.provider.clone(),
            "model" => self.provider_tags.model.clone(),
            "tool" => self.provider_tags.tool.clone(),
            "agent" => self.agent_context.agent.clone(),
            _ => {
                return Err(TemplateError::UnknownField {
                    field: name.to_string(),
                })
            }
        };
        Ok(value)
    }
}

fn parse_url(raw: &str) -> Result<Url, ScopeError> {
    Url::parse(raw).map_err(|error| ScopeError::InvalidUrl {
        url: raw.to_string(),
        reason: error.to_string(),
    })
}

fn host_of(url: &Url, raw: &str) -> Result<String, ScopeError> {
    url.host_str()
        .map(str::to_ascii_lowercase)
        .ok_or_else(|| ScopeError::MissingHost {
            url: raw.to_string(),
        })
}

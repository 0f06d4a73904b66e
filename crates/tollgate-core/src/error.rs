use thiserror::Error;

use crate::scope::Scope;

/// Rule-set construction and loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("duplicate rule key '{key}'")]
    DuplicateRuleKey { key: String },
    #[error("rule key cannot be empty")]
    EmptyRuleKey,
    #[error("rule '{key}' is invalid: {reason}")]
    InvalidRule { key: String, reason: String },

    #[error("failed to read rule file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("rule file is not valid json: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("environment variable {name} is not set")]
    MissingEnv { name: &'static str },
}

/// Bucket-key template rendering errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TemplateError {
    #[error("unterminated placeholder in template '{template}'")]
    Unterminated { template: String },
    #[error("empty placeholder in template '{template}'")]
    EmptyField { template: String },
    #[error("unknown template field '{field}'")]
    UnknownField { field: String },
}

/// Errors deriving a scope from a raw outbound request.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ScopeError {
    #[error("request has neither url nor url parts")]
    MissingUrl,
    #[error("invalid request url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("request url '{url}' has no host")]
    MissingHost { url: String },
}

/// Admission denial raised when a policy rejects a request.
///
/// This is an expected control-flow signal: callers should try later or route
/// elsewhere rather than retry against the same bucket.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error(
    "request denied by policy {}: {}",
    .policy_key.as_deref().unwrap_or("<none>"),
    .reason.as_deref().unwrap_or("denied")
)]
pub struct PolicyDeniedError {
    pub policy_key: Option<String>,
    pub scope: Box<Scope>,
    pub reason: Option<String>,
}

impl PolicyDeniedError {
    pub fn new(policy_key: Option<String>, scope: Scope, reason: impl Into<String>) -> Self {
        Self {
            policy_key,
            scope: Box::new(scope),
            reason: Some(reason.into()),
        }
    }
}

/// Security or compliance block. Never retried, never swallowed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error(
    "guardrail violation {}: {}",
    .rule_key.as_deref().unwrap_or("<default>"),
    .reason.as_deref().unwrap_or("blocked")
)]
pub struct GuardrailViolationError {
    pub rule_key: Option<String>,
    pub scope: Box<Scope>,
    pub reason: Option<String>,
}

impl GuardrailViolationError {
    pub fn new(rule_key: Option<String>, scope: Scope, reason: impl Into<String>) -> Self {
        Self {
            rule_key,
            scope: Box::new(scope),
            reason: Some(reason.into()),
        }
    }
}

/// Errors raised from interceptor `before_send` hooks.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InterceptError {
    #[error(transparent)]
    PolicyDenied(#[from] PolicyDeniedError),
    #[error(transparent)]
    GuardrailViolation(#[from] GuardrailViolationError),
    #[error(transparent)]
    Scope(#[from] ScopeError),
    #[error("request aborted before send")]
    Aborted,
}

impl InterceptError {
    pub fn is_policy_denied(&self) -> bool {
        matches!(self, Self::PolicyDenied(_))
    }

    pub fn is_guardrail_violation(&self) -> bool {
        matches!(self, Self::GuardrailViolation(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http_client::HttpRequestOptions;

    fn scope() -> Scope {
        let request = HttpRequestOptions::get("https://api.example.com/v1/items");
        Scope::from_request("demo", &request).expect("valid scope")
    }

    #[test]
    fn policy_denial_message_names_key_and_reason() {
        let error =
            PolicyDeniedError::new(Some(String::from("demo:rps")), scope(), "rate-limit exceeded");
        let message = error.to_string();

        assert!(message.contains("demo:rps"));
        assert!(message.contains("rate-limit exceeded"));
    }

    #[test]
    fn intercept_error_distinguishes_denial_from_violation() {
        let denied: InterceptError =
            PolicyDeniedError::new(None, scope(), "concurrency limit exceeded").into();
        let blocked: InterceptError =
            GuardrailViolationError::new(None, scope(), "no matching rule").into();

        assert!(denied.is_policy_denied());
        assert!(!denied.is_guardrail_violation());
        assert!(blocked.is_guardrail_violation());
        assert!(blocked.to_string().contains("<default>"));
    }
}

//! Allow/block guardrails with header, query and body sanitization.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, GuardrailViolationError, InterceptError};
use crate::http_client::{AgentContext, HttpRequestOptions};
use crate::scope::Scope;
use crate::selector::Selector;

/// Replacement value for masked query parameters.
pub const MASK_TOKEN: &str = "***";
pub const NO_MATCHING_RULE: &str = "no matching rule";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardrailEffect {
    Allow,
    Block,
}

/// Header allowlist and/or denylist. Names compare case-insensitively; the
/// allowlist is applied before the denylist.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HeaderRedaction {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_only_headers: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strip_headers: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct QueryMask {
    pub mask_params: Vec<String>,
    /// Remove masked parameters instead of replacing their values with [`MASK_TOKEN`].
    #[serde(default)]
    pub drop_masked_params: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BodyConstraints {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_body_bytes: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_content_types: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardrailAction {
    pub effect: GuardrailEffect,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header_redaction: Option<HeaderRedaction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_mask: Option<QueryMask>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_constraints: Option<BodyConstraints>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl GuardrailAction {
    pub fn allow() -> Self {
        Self {
            effect: GuardrailEffect::Allow,
            header_redaction: None,
            query_mask: None,
            body_constraints: None,
            reason: None,
        }
    }

    pub fn block(reason: impl Into<String>) -> Self {
        Self {
            effect: GuardrailEffect::Block,
            reason: Some(reason.into()),
            ..Self::allow()
        }
    }

    pub fn with_allow_only_headers<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.header_redaction
            .get_or_insert_with(HeaderRedaction::default)
            .allow_only_headers = Some(names.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_strip_headers<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.header_redaction
            .get_or_insert_with(HeaderRedaction::default)
            .strip_headers = Some(names.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_query_mask<I, S>(mut self, params: I, drop_masked_params: bool) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.query_mask = Some(QueryMask {
            mask_params: params.into_iter().map(Into::into).collect(),
            drop_masked_params,
        });
        self
    }

    pub fn with_body_constraints(mut self, constraints: BodyConstraints) -> Self {
        self.body_constraints = Some(constraints);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardrailRule {
    pub key: String,
    #[serde(default)]
    pub selector: Selector,
    #[serde(default)]
    pub priority: i32,
    pub action: GuardrailAction,
}

impl GuardrailRule {
    pub fn new(key: impl Into<String>, selector: Selector, action: GuardrailAction) -> Self {
        Self {
            key: key.into(),
            selector,
            priority: 0,
            action,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// Outcome of a guardrail evaluation. An allow may still carry sanitizers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardrailDecision {
    pub effect: GuardrailEffect,
    /// `None` when the engine's default action applied.
    pub rule_key: Option<String>,
    pub reason: Option<String>,
    pub header_redaction: Option<HeaderRedaction>,
    pub query_mask: Option<QueryMask>,
    pub body_constraints: Option<BodyConstraints>,
}

impl GuardrailDecision {
    fn from_action(rule_key: Option<&str>, action: &GuardrailAction) -> Self {
        Self {
            effect: action.effect,
            rule_key: rule_key.map(str::to_string),
            reason: action.reason.clone(),
            header_redaction: action.header_redaction.clone(),
            query_mask: action.query_mask.clone(),
            body_constraints: action.body_constraints.clone(),
        }
    }

    pub fn is_blocked(&self) -> bool {
        self.effect == GuardrailEffect::Block
    }

    /// Raises the violation a block requires. The request must not proceed on `Err`.
    pub fn enforce(&self, scope: &Scope) -> Result<(), GuardrailViolationError> {
        if !self.is_blocked() {
            return Ok(());
        }
        Err(self.violation(scope, self.reason.as_deref().unwrap_or("blocked by guardrail")))
    }

    /// Checks body constraints, then redacts headers and masks the query in place.
    pub fn apply(
        &self,
        scope: &Scope,
        request: &mut HttpRequestOptions,
    ) -> Result<(), GuardrailViolationError> {
        self.enforce(scope)?;

        if let Some(constraints) = &self.body_constraints {
            if let Err(reason) = check_body(constraints, request) {
                return Err(self.violation(scope, &reason));
            }
        }
        if let Some(redaction) = &self.header_redaction {
            request.headers = redact_headers(&request.headers, redaction);
        }
        if let Some(mask) = &self.query_mask {
            let pairs = request.query_pairs();
            if pairs.iter().any(|(name, _)| mask.mask_params.contains(name)) {
                request.set_query_pairs(mask_query(pairs, mask));
            }
        }
        Ok(())
    }

    fn violation(&self, scope: &Scope, reason: &str) -> GuardrailViolationError {
        GuardrailViolationError::new(self.rule_key.clone(), scope.clone(), reason)
    }
}

/// Applies the allowlist, then the denylist. Idempotent.
pub fn redact_headers(
    headers: &BTreeMap<String, String>,
    redaction: &HeaderRedaction,
) -> BTreeMap<String, String> {
    let lowered = |names: &Option<Vec<String>>| {
        names.as_ref().map(|names| {
            names
                .iter()
                .map(|name| name.to_ascii_lowercase())
                .collect::<HashSet<_>>()
        })
    };
    let allowed = lowered(&redaction.allow_only_headers);
    let stripped = lowered(&redaction.strip_headers);

    headers
        .iter()
        .filter(|(name, _)| {
            let name = name.to_ascii_lowercase();
            allowed.as_ref().map_or(true, |allowed| allowed.contains(&name))
                && stripped.as_ref().map_or(true, |stripped| !stripped.contains(&name))
        })
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

/// Masks or drops every occurrence of each listed parameter. Idempotent.
pub fn mask_query(pairs: Vec<(String, String)>, mask: &QueryMask) -> Vec<(String, String)> {
    pairs
        .into_iter()
        .filter_map(|(name, value)| {
            if !mask.mask_params.contains(&name) {
                return Some((name, value));
            }
            if mask.drop_masked_params {
                None
            } else {
                Some((name, String::from(MASK_TOKEN)))
            }
        })
        .collect()
}

fn check_body(constraints: &BodyConstraints, request: &HttpRequestOptions) -> Result<(), String> {
    let Some(body) = request.body.as_deref() else {
        return Ok(());
    };

    if let Some(max) = constraints.max_body_bytes {
        if body.len() > max {
            return Err(format!("request body of {} bytes exceeds max {max}", body.len()));
        }
    }

    if let Some(allowed) = &constraints.allowed_content_types {
        let content_type = request
            .content_type()
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        let permitted = allowed
            .iter()
            .any(|prefix| content_type.starts_with(&prefix.to_ascii_lowercase()));
        if !permitted {
            return Err(format!(
                "content type '{content_type}' is not one of the allowed content types"
            ));
        }
    }
    Ok(())
}

/// Static rule table; holds no counters.
#[derive(Debug, Clone)]
pub struct GuardrailEngine {
    rules: Vec<GuardrailRule>,
    default_action: GuardrailAction,
}

impl GuardrailEngine {
    pub fn new(
        rules: Vec<GuardrailRule>,
        default_action: GuardrailAction,
    ) -> Result<Self, ConfigError> {
        let mut seen = HashSet::new();
        for rule in &rules {
            if rule.key.trim().is_empty() {
                return Err(ConfigError::EmptyRuleKey);
            }
            if !seen.insert(rule.key.clone()) {
                return Err(ConfigError::DuplicateRuleKey {
                    key: rule.key.clone(),
                });
            }
        }

        let mut rules = rules;
        rules.sort_by(|left, right| {
            right
                .priority
                .cmp(&left.priority)
                .then_with(|| left.key.cmp(&right.key))
        });

        Ok(Self {
            rules,
            default_action,
        })
    }

    /// Allowlist posture: anything no rule allows is blocked.
    pub fn default_deny(rules: Vec<GuardrailRule>) -> Result<Self, ConfigError> {
        Self::new(rules, GuardrailAction::block(NO_MATCHING_RULE))
    }

    pub fn default_allow(rules: Vec<GuardrailRule>) -> Result<Self, ConfigError> {
        Self::new(rules, GuardrailAction::allow())
    }

    pub fn rules(&self) -> &[GuardrailRule] {
        &self.rules
    }

    pub fn evaluate(&self, scope: &Scope) -> GuardrailDecision {
        let matched = self.rules.iter().find(|rule| rule.selector.matches(scope));
        let decision = match matched {
            Some(rule) => GuardrailDecision::from_action(Some(&rule.key), &rule.action),
            None => GuardrailDecision::from_action(None, &self.default_action),
        };

        if decision.is_blocked() {
            tracing::warn!(
                rule_key = decision.rule_key.as_deref().unwrap_or("<default>"),
                kind = %scope.kind,
                hostname = %scope.hostname,
                reason = decision.reason.as_deref().unwrap_or("-"),
                "guardrail blocked request"
            );
        } else {
            tracing::debug!(
                rule_key = decision.rule_key.as_deref().unwrap_or("<default>"),
                hostname = %scope.hostname,
                "guardrail allowed request"
            );
        }
        decision
    }
}

/// Gates browser page loads with the same rule table as HTTP calls.
#[derive(Debug, Clone)]
pub struct NavigationGuard {
    client_name: String,
    engine: Arc<GuardrailEngine>,
}

impl NavigationGuard {
    pub fn new(client_name: impl Into<String>, engine: Arc<GuardrailEngine>) -> Self {
        Self {
            client_name: client_name.into(),
            engine,
        }
    }

    /// Returns the URL to load (with masked parameters applied) or the violation.
    pub fn check(&self, url: &str, agent_context: &AgentContext) -> Result<String, InterceptError> {
        let scope = Scope::for_navigation(self.client_name.as_str(), url, agent_context)?;
        let decision = self.engine.evaluate(&scope);
        decision.enforce(&scope)?;

        let Some(mask) = &decision.query_mask else {
            return Ok(url.to_string());
        };
        let Ok(mut parsed) = Url::parse(url) else {
            return Ok(url.to_string());
        };
        let pairs = parsed
            .query_pairs()
            .map(|(name, value)| (name.into_owned(), value.into_owned()))
            .collect::<Vec<_>>();
        if !pairs.iter().any(|(name, _)| mask.mask_params.contains(name)) {
            return Ok(url.to_string());
        }

        let masked = mask_query(pairs, mask);
        if masked.is_empty() {
            parsed.set_query(None);
        } else {
            parsed.query_pairs_mut().clear().extend_pairs(masked.iter());
        }
        Ok(parsed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http_client::HttpMethod;

    fn scope_for(request: &HttpRequestOptions) -> Scope {
        Scope::from_request("crawler", request).expect("valid scope")
    }

    fn headers(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect()
    }

    #[test]
    fn empty_default_deny_engine_blocks_everything() {
        let engine = GuardrailEngine::default_deny(Vec::new()).expect("valid rules");
        let request = HttpRequestOptions::get("https://api.example.com/");
        let scope = scope_for(&request);

        let error = engine.evaluate(&scope).enforce(&scope).expect_err("must block");
        assert_eq!(error.reason.as_deref(), Some(NO_MATCHING_RULE));
        assert_eq!(error.rule_key, None);
    }

    #[test]
    fn block_rule_outranks_lower_priority_allow() {
        let engine = GuardrailEngine::default_allow(vec![
            GuardrailRule::new("allow-all", Selector::any(), GuardrailAction::allow()),
            GuardrailRule::new(
                "block-internal",
                Selector::any().with_hostname("*.internal"),
                GuardrailAction::block("internal hosts are off limits"),
            )
            .with_priority(100),
        ])
        .expect("valid rules");

        let request = HttpRequestOptions::get("https://db.internal/admin");
        let scope = scope_for(&request);
        let error = engine.evaluate(&scope).enforce(&scope).expect_err("blocked");

        assert_eq!(error.rule_key.as_deref(), Some("block-internal"));
        assert_eq!(error.reason.as_deref(), Some("internal hosts are off limits"));
    }

    #[test]
    fn allowlist_then_denylist_equals_intersection_and_is_idempotent() {
        let redaction = HeaderRedaction {
            allow_only_headers: Some(vec![
                String::from("Accept"),
                String::from("Authorization"),
                String::from("X-Trace"),
            ]),
            strip_headers: Some(vec![String::from("AUTHORIZATION")]),
        };
        let original = headers(&[
            ("accept", "application/json"),
            ("authorization", "Bearer secret"),
            ("cookie", "a=b"),
            ("x-trace", "t-1"),
        ]);

        let once = redact_headers(&original, &redaction);
        assert_eq!(once, headers(&[("accept", "application/json"), ("x-trace", "t-1")]));
        assert_eq!(redact_headers(&once, &redaction), once);
    }

    #[test]
    fn query_mask_replaces_or_drops_every_occurrence() {
        let pairs = vec![
            (String::from("api_key"), String::from("k1")),
            (String::from("q"), String::from("aapl")),
            (String::from("api_key"), String::from("k2")),
        ];

        let masked = mask_query(
            pairs.clone(),
            &QueryMask {
                mask_params: vec![String::from("api_key")],
                drop_masked_params: false,
            },
        );
        assert_eq!(masked[0].1, MASK_TOKEN);
        assert_eq!(masked[2].1, MASK_TOKEN);

        let dropped = mask_query(
            pairs,
            &QueryMask {
                mask_params: vec![String::from("api_key")],
                drop_masked_params: true,
            },
        );
        assert_eq!(dropped, vec![(String::from("q"), String::from("aapl"))]);
    }

    #[test]
    fn apply_sanitizes_request_in_place() {
        let engine = GuardrailEngine::default_deny(vec![GuardrailRule::new(
            "feeds",
            Selector::any().with_hostname("*.example.com"),
            GuardrailAction::allow()
                .with_strip_headers(["cookie"])
                .with_query_mask(["token"], false),
        )])
        .expect("valid rules");

        let mut request =
            HttpRequestOptions::get("https://feed.example.com/v1/quotes?token=abc&symbol=AAPL")
                .with_header("Cookie", "session=1")
                .with_header("Accept", "application/json");
        let scope = scope_for(&request);
        engine
            .evaluate(&scope)
            .apply(&scope, &mut request)
            .expect("allowed");

        assert!(!request.headers.contains_key("cookie"));
        assert!(request.headers.contains_key("accept"));
        assert_eq!(
            request.query_pairs(),
            vec![
                (String::from("token"), String::from(MASK_TOKEN)),
                (String::from("symbol"), String::from("AAPL")),
            ]
        );
    }

    #[test]
    fn body_constraints_reject_oversized_or_wrong_type() {
        let engine = GuardrailEngine::default_allow(vec![GuardrailRule::new(
            "uploads",
            Selector::any().with_method("POST"),
            GuardrailAction::allow().with_body_constraints(BodyConstraints {
                max_body_bytes: Some(8),
                allowed_content_types: Some(vec![String::from("application/json")]),
            }),
        )])
        .expect("valid rules");

        let mut large = HttpRequestOptions::new(HttpMethod::Post, "https://api.example.com/upload")
            .with_header("content-type", "application/json")
            .with_body("{\"a\":\"0123456789\"}");
        let scope = scope_for(&large);
        let error = engine
            .evaluate(&scope)
            .apply(&scope, &mut large)
            .expect_err("too large");
        assert!(error.reason.unwrap_or_default().contains("exceeds"));

        let mut wrong_type =
            HttpRequestOptions::new(HttpMethod::Post, "https://api.example.com/upload")
                .with_header("content-type", "text/plain")
                .with_body("hi");
        let scope = scope_for(&wrong_type);
        assert!(engine.evaluate(&scope).apply(&scope, &mut wrong_type).is_err());

        let mut ok = HttpRequestOptions::new(HttpMethod::Post, "https://api.example.com/upload")
            .with_header("Content-Type", "application/json; charset=utf-8")
            .with_body("{}");
        let scope = scope_for(&ok);
        assert!(engine.evaluate(&scope).apply(&scope, &mut ok).is_ok());
    }

    #[test]
    fn navigation_guard_uses_same_rules_and_masks_url() {
        let engine = Arc::new(
            GuardrailEngine::default_deny(vec![GuardrailRule::new(
                "docs",
                Selector::any()
                    .with_kind("browser-navigation")
                    .with_hostname("*.example.com"),
                GuardrailAction::allow().with_query_mask(["session"], true),
            )])
            .expect("valid rules"),
        );
        let guard = NavigationGuard::new("browser", engine);

        let url = guard
            .check("https://docs.example.com/page?session=s1&lang=en", &AgentContext::default())
            .expect("allowed");
        assert_eq!(url, "https://docs.example.com/page?lang=en");

        let error = guard
            .check("https://evil.test/", &AgentContext::default())
            .expect_err("blocked");
        assert!(error.is_guardrail_violation());
    }

    #[test]
    fn duplicate_rule_keys_are_rejected() {
        let result = GuardrailEngine::default_allow(vec![
            GuardrailRule::new("same", Selector::any(), GuardrailAction::allow()),
            GuardrailRule::new("same", Selector::any(), GuardrailAction::allow()),
        ]);
        assert!(matches!(result, Err(ConfigError::DuplicateRuleKey { .. })));
    }
}

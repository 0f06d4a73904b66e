//! Declarative rule sets loaded from JSON.
//!
//! ```json
//! {
//!   "policies": [
//!     {
//!       "key": "demo:rps",
//!       "selector": { "hostname": "*.example.com" },
//!       "action": { "rate_limit": { "max_requests": 10, "window_ms": 1000 } }
//!     }
//!   ],
//!   "guardrails": {
//!     "default_effect": "block",
//!     "rules": [
//!       {
//!         "key": "providers",
//!         "selector": { "hostname": "*.example.com" },
//!         "action": { "effect": "allow" }
//!       }
//!     ]
//!   }
//! }
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::guardrail::{
    GuardrailAction, GuardrailEffect, GuardrailEngine, GuardrailRule, NO_MATCHING_RULE,
};
use crate::policy::{PolicyDefinition, PolicyEngine, PolicyEngineConfig};

/// Environment variable naming the rule file read by [`RuleSet::from_env`].
pub const RULES_FILE_ENV: &str = "TOLLGATE_RULES_FILE";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GuardrailSet {
    /// Applied when no rule matches. Rule files without guardrails allow everything.
    pub default_effect: GuardrailEffect,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_reason: Option<String>,
    pub rules: Vec<GuardrailRule>,
}

impl Default for GuardrailSet {
    fn default() -> Self {
        Self {
            default_effect: GuardrailEffect::Allow,
            default_reason: None,
            rules: Vec::new(),
        }
    }
}

impl GuardrailSet {
    fn default_action(&self) -> GuardrailAction {
        match self.default_effect {
            GuardrailEffect::Allow => GuardrailAction::allow(),
            GuardrailEffect::Block => {
                GuardrailAction::block(self.default_reason.as_deref().unwrap_or(NO_MATCHING_RULE))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuleSet {
    pub policies: Vec<PolicyDefinition>,
    pub guardrails: GuardrailSet,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_buckets: Option<usize>,
}

/// Engines built from one [`RuleSet`].
#[derive(Debug)]
pub struct Engines {
    pub policy: PolicyEngine,
    pub guardrail: GuardrailEngine,
}

impl RuleSet {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&json)
    }

    /// Loads the file named by `TOLLGATE_RULES_FILE`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_var(RULES_FILE_ENV)
    }

    pub fn from_env_var(name: &'static str) -> Result<Self, ConfigError> {
        let path = std::env::var_os(name).ok_or(ConfigError::MissingEnv { name })?;
        Self::from_path(path)
    }

    /// Validates every rule and builds both engines.
    pub fn into_engines(self) -> Result<Engines, ConfigError> {
        let mut engine_config = PolicyEngineConfig::default();
        if let Some(max_buckets) = self.max_buckets {
            engine_config.max_buckets = max_buckets;
        }

        let default_action = self.guardrails.default_action();
        Ok(Engines {
            policy: PolicyEngine::new(self.policies, engine_config)?,
            guardrail: GuardrailEngine::new(self.guardrails.rules, default_action)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::http_client::HttpRequestOptions;
    use crate::scope::Scope;

    const RULES: &str = r#"{
        "policies": [
            {
                "key": "demo:rps",
                "selector": { "hostname": "*.example.com" },
                "priority": 10,
                "action": {
                    "rate_limit": { "max_requests": 1, "window_ms": 60000 },
                    "failure_mode": "fail_closed"
                }
            }
        ],
        "guardrails": {
            "default_effect": "block",
            "rules": [
                {
                    "key": "providers",
                    "selector": { "hostname": ["*.example.com", "example.org"] },
                    "action": { "effect": "allow", "query_mask": { "mask_params": ["api_key"] } }
                }
            ]
        },
        "max_buckets": 64
    }"#;

    fn scope(url: &str) -> Scope {
        Scope::from_request("config-test", &HttpRequestOptions::get(url)).expect("valid scope")
    }

    #[test]
    fn json_rules_build_working_engines() {
        let engines = RuleSet::from_json_str(RULES)
            .expect("valid json")
            .into_engines()
            .expect("valid rules");

        let provider = scope("https://api.example.com/v1/items");
        assert!(engines.policy.evaluate(&provider).decision.is_allow());
        assert!(engines.policy.evaluate(&provider).decision.is_deny());
        assert!(!engines.guardrail.evaluate(&provider).is_blocked());

        let unknown = engines.guardrail.evaluate(&scope("https://elsewhere.test/"));
        assert!(unknown.is_blocked());
        assert_eq!(unknown.reason.as_deref(), Some(NO_MATCHING_RULE));
    }

    #[test]
    fn missing_sections_default_to_allow_everything() {
        let engines = RuleSet::from_json_str("{}")
            .expect("valid json")
            .into_engines()
            .expect("valid rules");

        assert!(engines.policy.definitions().is_empty());
        assert!(!engines.guardrail.evaluate(&scope("https://any.test/")).is_blocked());
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let error = RuleSet::from_json_str(r#"{ "policy": [] }"#).expect_err("typo rejected");
        assert!(matches!(error, ConfigError::Parse(_)));
    }

    #[test]
    fn duplicate_keys_fail_engine_construction() {
        let json = r#"{
            "policies": [
                { "key": "dup", "action": { "concurrency": { "max_concurrent": 1 } } },
                { "key": "dup", "action": { "concurrency": { "max_concurrent": 2 } } }
            ]
        }"#;

        let error = RuleSet::from_json_str(json)
            .expect("valid json")
            .into_engines()
            .expect_err("duplicate rejected");
        assert!(matches!(error, ConfigError::DuplicateRuleKey { key } if key == "dup"));
    }

    #[test]
    fn rules_load_from_file_and_env() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        file.write_all(RULES.as_bytes()).expect("write rules");

        let from_path = RuleSet::from_path(file.path()).expect("load from path");
        assert_eq!(from_path.policies.len(), 1);
        assert_eq!(from_path.max_buckets, Some(64));

        std::env::set_var("TOLLGATE_CONFIG_TEST_RULES", file.path());
        let from_env = RuleSet::from_env_var("TOLLGATE_CONFIG_TEST_RULES").expect("load from env");
        assert_eq!(from_env, from_path);
    }

    #[test]
    fn unset_env_var_is_reported_by_name() {
        let error = RuleSet::from_env_var("TOLLGATE_CONFIG_TEST_UNSET").expect_err("unset");
        assert!(matches!(error, ConfigError::MissingEnv { name: "TOLLGATE_CONFIG_TEST_UNSET" }));
    }

    #[test]
    fn unreadable_file_reports_path() {
        let dir = tempfile::tempdir().expect("temp dir");
        let missing = dir.path().join("absent.json");

        let error = RuleSet::from_path(&missing).expect_err("missing file");
        assert!(matches!(error, ConfigError::Io { ref path, .. } if path.ends_with("absent.json")));
    }
}

//! Admission policy: rate limits, concurrency caps, queuing and resilience overrides.
//!
//! Rules are matched highest priority first (ties broken by ascending key). The
//! first matching rule decides; when nothing matches the request is allowed.
//!
//! ```rust
//! use tollgate_core::policy::{PolicyAction, PolicyDecision, PolicyDefinition, PolicyEngine};
//! use tollgate_core::{HttpRequestOptions, Scope, Selector};
//!
//! let engine = PolicyEngine::with_definitions(vec![PolicyDefinition::new(
//!     "demo:rps",
//!     Selector::any(),
//!     PolicyAction::default().with_rate_limit(1, 1_000),
//! )])
//! .expect("valid rules");
//!
//! let request = HttpRequestOptions::get("https://api.example.com/v1/items");
//! let scope = Scope::from_request("demo", &request).expect("valid scope");
//!
//! let first = engine.evaluate(&scope);
//! assert!(matches!(first.decision, PolicyDecision::Allow { .. }));
//! let second = engine.evaluate(&scope);
//! assert!(matches!(second.decision, PolicyDecision::Deny { .. }));
//! ```

use std::collections::HashSet;
use std::fmt::{Display, Formatter};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::buckets::{BucketState, BucketStore};
use crate::error::{ConfigError, PolicyDeniedError, TemplateError};
use crate::resilience::ResilienceProfile;
use crate::scope::Scope;
use crate::selector::Selector;
use crate::template;

/// Fixed-window request budget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    pub max_requests: u32,
    pub window_ms: u64,
    /// Bucket-key template; defaults to the rule key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket_key: Option<String>,
}

/// In-flight request cap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcurrencyPolicy {
    pub max_concurrent: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket_key: Option<String>,
}

/// Bounded waiting room for saturated buckets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuePolicy {
    pub max_queue_size: u32,
    /// Fixed delay handed to every queued request.
    pub max_queue_time_ms: u64,
}

/// What to do when a rule cannot be evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    #[default]
    FailOpen,
    FailClosed,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PolicyAction {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<ConcurrencyPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<QueuePolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resilience_override: Option<ResilienceProfile>,
    #[serde(default)]
    pub failure_mode: FailureMode,
}

impl PolicyAction {
    pub fn with_rate_limit(mut self, max_requests: u32, window_ms: u64) -> Self {
        self.rate_limit = Some(RateLimitPolicy {
            max_requests,
            window_ms,
            bucket_key: None,
        });
        self
    }

    pub fn with_rate_limit_key(mut self, template: impl Into<String>) -> Self {
        if let Some(rate_limit) = self.rate_limit.as_mut() {
            rate_limit.bucket_key = Some(template.into());
        }
        self
    }

    pub fn with_concurrency(mut self, max_concurrent: u32) -> Self {
        self.concurrency = Some(ConcurrencyPolicy {
            max_concurrent,
            bucket_key: None,
        });
        self
    }

    pub fn with_concurrency_key(mut self, template: impl Into<String>) -> Self {
        if let Some(concurrency) = self.concurrency.as_mut() {
            concurrency.bucket_key = Some(template.into());
        }
        self
    }

    pub fn with_queue(mut self, max_queue_size: u32, max_queue_time_ms: u64) -> Self {
        self.queue = Some(QueuePolicy {
            max_queue_size,
            max_queue_time_ms,
        });
        self
    }

    pub fn with_resilience_override(mut self, profile: ResilienceProfile) -> Self {
        self.resilience_override = Some(profile);
        self
    }

    pub fn with_failure_mode(mut self, failure_mode: FailureMode) -> Self {
        self.failure_mode = failure_mode;
        self
    }
}

/// Operator-authored admission rule. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyDefinition {
    pub key: String,
    #[serde(default)]
    pub selector: Selector,
    #[serde(default)]
    pub priority: i32,
    pub action: PolicyAction,
}

impl PolicyDefinition {
    pub fn new(key: impl Into<String>, selector: Selector, action: PolicyAction) -> Self {
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

    fn validate(&self) -> Result<(), ConfigError> {
        if self.key.trim().is_empty() {
            return Err(ConfigError::EmptyRuleKey);
        }
        let invalid = |reason: &str| ConfigError::InvalidRule {
            key: self.key.clone(),
            reason: reason.to_string(),
        };
        if matches!(&self.action.rate_limit, Some(rate) if rate.window_ms == 0) {
            return Err(invalid("rate limit window_ms must be greater than zero"));
        }
        if self.action.queue.is_some()
            && self.action.rate_limit.is_none()
            && self.action.concurrency.is_none()
        {
            return Err(invalid("queue policy requires a rate limit or concurrency control"));
        }
        Ok(())
    }
}

/// Which admission control saturated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Control {
    RateLimit,
    Concurrency,
}

impl Control {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RateLimit => "rateLimit",
            Self::Concurrency => "concurrency",
        }
    }
}

impl Display for Control {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PolicyDecision {
    Allow {
        resilience_override: Option<ResilienceProfile>,
    },
    Delay {
        delay_before_send_ms: u64,
        control: Control,
    },
    Deny {
        reason: String,
        control: Option<Control>,
    },
}

impl PolicyDecision {
    pub fn is_allow(&self) -> bool {
        matches!(self, Self::Allow { .. })
    }

    pub fn is_delay(&self) -> bool {
        matches!(self, Self::Delay { .. })
    }

    pub fn is_deny(&self) -> bool {
        matches!(self, Self::Deny { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseKind {
    InFlight,
    Queued,
}

/// A counter increment that must be given back when the request finishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketLease {
    pub key: String,
    pub kind: LeaseKind,
}

/// Admission bookkeeping for one request.
///
/// Deliberately not `Clone`: [`PolicyEngine::on_result`] consumes it, so the
/// leases it records are released exactly once.
#[derive(Debug, PartialEq, Eq, Default)]
pub struct PolicyOutcome {
    pub policy_key: Option<String>,
    pub buckets: Vec<BucketLease>,
}

impl PolicyOutcome {
    fn unmatched() -> Self {
        Self::default()
    }

    fn for_rule(key: &str) -> Self {
        Self {
            policy_key: Some(key.to_string()),
            buckets: Vec::new(),
        }
    }
}

#[derive(Debug)]
pub struct PolicyEvaluation {
    pub decision: PolicyDecision,
    pub outcome: PolicyOutcome,
}

impl PolicyEvaluation {
    /// Converts a denial into the boundary error type.
    pub fn denial(&self, scope: &Scope) -> Option<PolicyDeniedError> {
        match &self.decision {
            PolicyDecision::Deny { reason, .. } => Some(PolicyDeniedError::new(
                self.outcome.policy_key.clone(),
                scope.clone(),
                reason.clone(),
            )),
            _ => None,
        }
    }
}

/// How a request finished, reported to [`PolicyEngine::on_result`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestOutcome {
    Success { status: u16 },
    Failure { message: String },
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicyEngineConfig {
    /// Upper bound on tracked buckets before idle ones are evicted.
    pub max_buckets: usize,
}

impl Default for PolicyEngineConfig {
    fn default() -> Self {
        Self {
            max_buckets: 10_000,
        }
    }
}

struct RenderedKeys {
    rate_limit: Option<String>,
    concurrency: Option<String>,
}

/// Thread-safe admission engine. Owns its bucket state exclusively.
#[derive(Debug)]
pub struct PolicyEngine {
    definitions: Vec<PolicyDefinition>,
    buckets: Mutex<BucketStore>,
}

impl PolicyEngine {
    pub fn new(
        definitions: Vec<PolicyDefinition>,
        config: PolicyEngineConfig,
    ) -> Result<Self, ConfigError> {
        let mut seen = HashSet::new();
        for definition in &definitions {
            definition.validate()?;
            if !seen.insert(definition.key.clone()) {
                return Err(ConfigError::DuplicateRuleKey {
                    key: definition.key.clone(),
                });
            }
        }

        let mut definitions = definitions;
        definitions.sort_by(|left, right| {
            right
                .priority
                .cmp(&left.priority)
                .then_with(|| left.key.cmp(&right.key))
        });

        Ok(Self {
            definitions,
            buckets: Mutex::new(BucketStore::new(config.max_buckets)),
        })
    }

    pub fn with_definitions(definitions: Vec<PolicyDefinition>) -> Result<Self, ConfigError> {
        Self::new(definitions, PolicyEngineConfig::default())
    }

    /// Rules in evaluation order.
    pub fn definitions(&self) -> &[PolicyDefinition] {
        &self.definitions
    }

    pub fn matching_rule(&self, scope: &Scope) -> Option<&PolicyDefinition> {
        self.definitions
            .iter()
            .find(|definition| definition.selector.matches(scope))
    }

    pub fn evaluate(&self, scope: &Scope) -> PolicyEvaluation {
        let Some(rule) = self.matching_rule(scope) else {
            return PolicyEvaluation {
                decision: PolicyDecision::Allow {
                    resilience_override: None,
                },
                outcome: PolicyOutcome::unmatched(),
            };
        };

        let keys = match render_keys(rule, scope) {
            Ok(keys) => keys,
            Err(error) => return evaluation_failure(rule, &error),
        };

        let mut outcome = PolicyOutcome::for_rule(&rule.key);
        let mut store = self.lock();
        let now = Instant::now();

        if let (Some(rate), Some(key)) = (&rule.action.rate_limit, &keys.rate_limit) {
            let window = Duration::from_millis(rate.window_ms);
            if !store.try_acquire_rate(key, rate.max_requests, window, now) {
                let reason = format!(
                    "rate-limit exceeded for bucket '{key}' ({} requests per {}ms)",
                    rate.max_requests, rate.window_ms
                );
                return queue_or_deny(
                    &mut store,
                    rule,
                    Control::RateLimit,
                    key,
                    reason,
                    outcome,
                    now,
                );
            }
        }

        if let (Some(concurrency), Some(key)) = (&rule.action.concurrency, &keys.concurrency) {
            if !store.try_acquire_slot(key, concurrency.max_concurrent, now) {
                let reason = format!(
                    "concurrency limit exceeded for bucket '{key}' (max {} in flight)",
                    concurrency.max_concurrent
                );
                return queue_or_deny(
                    &mut store,
                    rule,
                    Control::Concurrency,
                    key,
                    reason,
                    outcome,
                    now,
                );
            }
            outcome.buckets.push(BucketLease {
                key: key.clone(),
                kind: LeaseKind::InFlight,
            });
        }

        tracing::debug!(policy_key = %rule.key, "request admitted");
        PolicyEvaluation {
            decision: PolicyDecision::Allow {
                resilience_override: rule.action.resilience_override.clone(),
            },
            outcome,
        }
    }

    /// Releases every lease recorded on `outcome`. Call once per finished request.
    pub fn on_result(&self, scope: &Scope, result: &RequestOutcome, outcome: PolicyOutcome) {
        if outcome.buckets.is_empty() {
            return;
        }

        let mut store = self.lock();
        for lease in &outcome.buckets {
            match lease.kind {
                LeaseKind::InFlight => store.release_slot(&lease.key),
                LeaseKind::Queued => store.release_queued(&lease.key),
            }
        }
        drop(store);

        tracing::debug!(
            policy_key = outcome.policy_key.as_deref().unwrap_or("-"),
            client = %scope.client_name,
            released = outcome.buckets.len(),
            result = ?result,
            "policy leases released"
        );
    }

    pub fn in_flight(&self, bucket_key: &str) -> u32 {
        self.lock().in_flight(bucket_key)
    }

    pub fn queued(&self, bucket_key: &str) -> u32 {
        self.lock().queued(bucket_key)
    }

    pub fn window_count(&self, bucket_key: &str) -> u32 {
        self.lock().window_count(bucket_key)
    }

    pub fn bucket_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, BucketStore> {
        self.buckets.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn render_keys(rule: &PolicyDefinition, scope: &Scope) -> Result<RenderedKeys, TemplateError> {
    let render = |template: Option<&String>| {
        template::render(template.map_or(rule.key.as_str(), String::as_str), scope)
    };

    Ok(RenderedKeys {
        rate_limit: rule
            .action
            .rate_limit
            .as_ref()
            .map(|rate| render(rate.bucket_key.as_ref()))
            .transpose()?,
        concurrency: rule
            .action
            .concurrency
            .as_ref()
            .map(|concurrency| render(concurrency.bucket_key.as_ref()))
            .transpose()?,
    })
}

fn queue_or_deny(
    store: &mut BucketStore,
    rule: &PolicyDefinition,
    control: Control,
    key: &str,
    reason: String,
    mut outcome: PolicyOutcome,
    now: Instant,
) -> PolicyEvaluation {
    if let Some(queue) = &rule.action.queue {
        match store.try_enqueue(key, queue.max_queue_size, now) {
            BucketState::Queued { queued } => {
                tracing::debug!(
                    policy_key = %rule.key,
                    bucket = key,
                    control = %control,
                    queued,
                    "bucket saturated; request queued"
                );
                outcome.buckets.push(BucketLease {
                    key: key.to_string(),
                    kind: LeaseKind::Queued,
                });
                return PolicyEvaluation {
                    decision: PolicyDecision::Delay {
                        delay_before_send_ms: queue.max_queue_time_ms,
                        control,
                    },
                    outcome,
                };
            }
            BucketState::Full { queued } => {
                let reason = format!("{reason}; queue full ({queued}/{})", queue.max_queue_size);
                return deny(rule, control, key, reason, outcome);
            }
            BucketState::Open => {}
        }
    }
    deny(rule, control, key, reason, outcome)
}

fn deny(
    rule: &PolicyDefinition,
    control: Control,
    key: &str,
    reason: String,
    outcome: PolicyOutcome,
) -> PolicyEvaluation {
    tracing::warn!(
        policy_key = %rule.key,
        bucket = key,
        control = %control,
        %reason,
        "request denied"
    );
    PolicyEvaluation {
        decision: PolicyDecision::Deny {
            reason,
            control: Some(control),
        },
        outcome,
    }
}

fn evaluation_failure(rule: &PolicyDefinition, error: &TemplateError) -> PolicyEvaluation {
    let outcome = PolicyOutcome::for_rule(&rule.key);
    match rule.action.failure_mode {
        FailureMode::FailOpen => {
            tracing::warn!(
                policy_key = %rule.key,
                %error,
                "policy evaluation failed; failing open"
            );
            PolicyEvaluation {
                decision: PolicyDecision::Allow {
                    resilience_override: None,
                },
                outcome,
            }
        }
        FailureMode::FailClosed => {
            tracing::warn!(
                policy_key = %rule.key,
                %error,
                "policy evaluation failed; failing closed"
            );
            PolicyEvaluation {
                decision: PolicyDecision::Deny {
                    reason: format!("policy evaluation failed: {error}"),
                    control: None,
                },
                outcome,
            }
        }
    }
}

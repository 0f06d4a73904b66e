//! Outbound-call controls for tollgate.
//!
//! This crate contains:
//! - Scope derivation from abstract HTTP requests
//! - Wildcard selectors and bucket-key templates
//! - The admission policy engine (rate limits, concurrency, queuing)
//! - The guardrail engine (allow/block, header, query and body sanitizing)
//! - Bounded multi-strategy pagination
//! - Interceptor adapters and an intercepted `HttpClient`
//!
//! | Control | Stateful | Failure signal |
//! |---------|----------|----------------|
//! | Policy | yes, per engine | [`PolicyDeniedError`] |
//! | Guardrail | no | [`GuardrailViolationError`] |
//! | Pagination | per run | [`pagination::PaginationFailure`] |

pub mod buckets;
pub mod config;
pub mod error;
pub mod guardrail;
pub mod http_client;
pub mod interceptor;
pub mod pagination;
pub mod policy;
pub mod resilience;
pub mod scope;
pub mod selector;
pub mod template;

pub use buckets::BucketState;
pub use config::{Engines, GuardrailSet, RuleSet, RULES_FILE_ENV};
pub use error::{
    ConfigError, GuardrailViolationError, InterceptError, PolicyDeniedError, ScopeError,
    TemplateError,
};
pub use guardrail::{
    BodyConstraints, GuardrailAction, GuardrailDecision, GuardrailEffect, GuardrailEngine,
    GuardrailRule, HeaderRedaction, NavigationGuard, QueryMask,
};
pub use http_client::{
    AgentContext, Correlation, HttpClient, HttpClientExt, HttpError, HttpErrorKind, HttpMethod,
    HttpRequestOptions, HttpResponse, NoopHttpClient, ReqwestHttpClient, UrlParts,
};
pub use interceptor::{
    GuardrailInterceptor, InterceptedHttpClient, Interceptor, PolicyInterceptor, TICKET_EXTENSION,
};
pub use pagination::{
    paginate, paginate_until, CursorStrategy, Extraction, OffsetLimitStrategy, Page, PageStream,
    PaginateRequest, PaginationError, PaginationLimits, PaginationResult, TruncationReason,
};
pub use policy::{
    FailureMode, PolicyAction, PolicyDecision, PolicyDefinition, PolicyEngine, PolicyEngineConfig,
    PolicyEvaluation, PolicyOutcome, RequestOutcome,
};
pub use resilience::{send_with_retry, Backoff, ResilienceProfile, RetryConfig};
pub use scope::{GuardrailScope, PolicyScope, Scope, ScopeKind};
pub use selector::{Matcher, Selector};

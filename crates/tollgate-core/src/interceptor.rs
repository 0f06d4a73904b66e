//! Request lifecycle hooks and the adapters that attach the policy and
//! guardrail engines to them.
//!
//! A host calls three hooks around every request: `before_send` (which may
//! reject the request), then exactly one of `after_response` or `on_error`.
//! [`InterceptedHttpClient`] drives that lifecycle for any [`HttpClient`], so
//! callers such as pagination get admission and guardrails without knowing
//! they exist.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{InterceptError, PolicyDeniedError};
use crate::guardrail::GuardrailEngine;
use crate::http_client::{HttpClient, HttpError, HttpFuture, HttpRequestOptions, HttpResponse};
use crate::policy::{PolicyDecision, PolicyEngine, PolicyEvaluation, PolicyOutcome, RequestOutcome};
use crate::scope::Scope;

/// Prefix of the extension under which a [`PolicyInterceptor`] records its
/// admission ticket. Each interceptor appends its own instance id, so several
/// policy interceptors can share one request.
pub const TICKET_EXTENSION: &str = "tollgate.ticket";

pub type InterceptFuture<'a> =
    Pin<Box<dyn Future<Output = Result<(), InterceptError>> + Send + 'a>>;

pub struct BeforeSend<'a> {
    pub request: &'a mut HttpRequestOptions,
    pub signal: &'a CancellationToken,
}

pub struct AfterResponse<'a> {
    pub request: &'a HttpRequestOptions,
    pub response: &'a HttpResponse,
    pub attempt: u32,
}

pub struct OnError<'a> {
    pub request: &'a HttpRequestOptions,
    pub error: &'a HttpError,
    pub attempt: u32,
}

pub trait Interceptor: Send + Sync {
    fn name(&self) -> &str;

    /// May rewrite the request or reject it. A rejection stops the request.
    fn before_send<'a>(&'a self, context: BeforeSend<'a>) -> InterceptFuture<'a>;

    fn after_response(&self, _context: &AfterResponse<'_>) {}

    fn on_error(&self, _context: &OnError<'_>) {}
}

struct ParkedAdmission {
    scope: Scope,
    outcome: PolicyOutcome,
}

/// Admission control at the `before_send` hook.
///
/// Leases taken during admission are parked under a ticket written into the
/// request's extensions and released by whichever completion hook fires.
pub struct PolicyInterceptor {
    client_name: String,
    engine: Arc<PolicyEngine>,
    ticket_key: String,
    parked: Mutex<HashMap<String, ParkedAdmission>>,
}

impl PolicyInterceptor {
    pub fn new(client_name: impl Into<String>, engine: Arc<PolicyEngine>) -> Self {
        Self {
            client_name: client_name.into(),
            engine,
            ticket_key: format!("{TICKET_EXTENSION}.{}", Uuid::new_v4()),
            parked: Mutex::new(HashMap::new()),
        }
    }

    /// Extension name this interceptor writes its tickets under.
    pub fn ticket_key(&self) -> &str {
        &self.ticket_key
    }

    pub fn engine(&self) -> &PolicyEngine {
        &self.engine
    }

    /// Admissions waiting for a completion hook.
    pub fn parked_count(&self) -> usize {
        self.lock_parked().len()
    }

    fn lock_parked(&self) -> MutexGuard<'_, HashMap<String, ParkedAdmission>> {
        self.parked.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn park(&self, request: &mut HttpRequestOptions, admission: Admission<'_>) {
        let Some((scope, outcome)) = admission.into_parts() else {
            return;
        };
        if outcome.buckets.is_empty() {
            return;
        }
        let ticket = Uuid::new_v4().to_string();
        request
            .extensions
            .insert(self.ticket_key.clone(), ticket.clone());
        self.lock_parked()
            .insert(ticket, ParkedAdmission { scope, outcome });
    }

    fn complete(&self, request: &HttpRequestOptions, result: &RequestOutcome) {
        let Some(ticket) = request.extensions.get(&self.ticket_key) else {
            return;
        };
        let parked = self.lock_parked().remove(ticket);
        if let Some(ParkedAdmission { scope, outcome }) = parked {
            self.engine.on_result(&scope, result, outcome);
        }
    }
}

/// Releases an admission's leases unless it was handed off with `into_parts`.
/// Covers early returns and a `before_send` future dropped mid-delay.
struct Admission<'a> {
    engine: &'a PolicyEngine,
    scope: Option<Scope>,
    outcome: Option<PolicyOutcome>,
}

impl<'a> Admission<'a> {
    fn new(engine: &'a PolicyEngine, scope: Scope, outcome: PolicyOutcome) -> Self {
        Self {
            engine,
            scope: Some(scope),
            outcome: Some(outcome),
        }
    }

    fn into_parts(mut self) -> Option<(Scope, PolicyOutcome)> {
        Some((self.scope.take()?, self.outcome.take()?))
    }
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        if let (Some(scope), Some(outcome)) = (self.scope.take(), self.outcome.take()) {
            self.engine.on_result(&scope, &RequestOutcome::Aborted, outcome);
        }
    }
}

impl Interceptor for PolicyInterceptor {
    fn name(&self) -> &str {
        "policy"
    }

    fn before_send<'a>(&'a self, context: BeforeSend<'a>) -> InterceptFuture<'a> {
        Box::pin(async move {
            let BeforeSend { request, signal } = context;
            if signal.is_cancelled() {
                return Err(InterceptError::Aborted);
            }

            let scope = Scope::from_request(self.client_name.as_str(), request)?;
            let PolicyEvaluation { decision, outcome } = self.engine.evaluate(&scope);
            let policy_key = outcome.policy_key.clone();
            let admission = Admission::new(&self.engine, scope.clone(), outcome);

            match decision {
                PolicyDecision::Deny { reason, control } => {
                    warn!(
                        policy_key = policy_key.as_deref().unwrap_or("-"),
                        control = control.map(|control| control.as_str()),
                        reason = %reason,
                        "request denied by policy"
                    );
                    drop(admission);
                    return Err(PolicyDeniedError::new(policy_key, scope, reason).into());
                }
                PolicyDecision::Delay {
                    delay_before_send_ms,
                    control,
                } => {
                    if signal.is_cancelled() {
                        return Err(InterceptError::Aborted);
                    }
                    debug!(
                        policy_key = policy_key.as_deref().unwrap_or("-"),
                        control = control.as_str(),
                        delay_ms = delay_before_send_ms,
                        "delaying request before send"
                    );
                    tokio::select! {
                        biased;
                        _ = signal.cancelled() => return Err(InterceptError::Aborted),
                        _ = tokio::time::sleep(Duration::from_millis(delay_before_send_ms)) => {}
                    }
                }
                PolicyDecision::Allow {
                    resilience_override,
                } => {
                    if let Some(profile) = resilience_override {
                        request.resilience = Some(profile);
                    }
                }
            }

            self.park(request, admission);
            Ok(())
        })
    }

    fn after_response(&self, context: &AfterResponse<'_>) {
        self.complete(
            context.request,
            &RequestOutcome::Success {
                status: context.response.status,
            },
        );
    }

    fn on_error(&self, context: &OnError<'_>) {
        let result = if context.error.rejection() == Some(&InterceptError::Aborted) {
            RequestOutcome::Aborted
        } else {
            RequestOutcome::Failure {
                message: context.error.message().to_string(),
            }
        };
        self.complete(context.request, &result);
    }
}

/// Guardrail enforcement and request sanitizing at the `before_send` hook.
pub struct GuardrailInterceptor {
    client_name: String,
    engine: Arc<GuardrailEngine>,
}

impl GuardrailInterceptor {
    pub fn new(client_name: impl Into<String>, engine: Arc<GuardrailEngine>) -> Self {
        Self {
            client_name: client_name.into(),
            engine,
        }
    }
}

impl Interceptor for GuardrailInterceptor {
    fn name(&self) -> &str {
        "guardrail"
    }

    fn before_send<'a>(&'a self, context: BeforeSend<'a>) -> InterceptFuture<'a> {
        Box::pin(async move {
            let scope = Scope::from_request(self.client_name.as_str(), context.request)?;
            let decision = self.engine.evaluate(&scope);
            decision.apply(&scope, context.request)?;
            Ok(())
        })
    }
}

/// An [`HttpClient`] that runs every request through an ordered interceptor chain.
///
/// `before_send` hooks run in registration order. When one rejects, or the
/// call is dropped part way through, the interceptors whose `before_send`
/// already finished see `on_error` so their leases are released.
pub struct InterceptedHttpClient<C> {
    inner: C,
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl<C: HttpClient> InterceptedHttpClient<C> {
    pub fn new(inner: C) -> Self {
        Self {
            inner,
            interceptors: Vec::new(),
        }
    }

    pub fn with_interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    pub fn with_guardrails(self, engine: Arc<GuardrailEngine>) -> Self {
        let name = self.inner.client_name().to_string();
        self.with_interceptor(Arc::new(GuardrailInterceptor::new(name, engine)))
    }

    pub fn with_policies(self, engine: Arc<PolicyEngine>) -> Self {
        let name = self.inner.client_name().to_string();
        self.with_interceptor(Arc::new(PolicyInterceptor::new(name, engine)))
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }

    /// Sends `request`, aborting at the next suspension point once `signal` fires.
    pub async fn request_with_signal(
        &self,
        request: HttpRequestOptions,
        signal: &CancellationToken,
    ) -> Result<HttpResponse, HttpError> {
        let mut pending = PendingCompletion {
            interceptors: &self.interceptors,
            request,
            ran: 0,
            armed: true,
        };

        for interceptor in &self.interceptors {
            let admitted = interceptor
                .before_send(BeforeSend {
                    request: &mut pending.request,
                    signal,
                })
                .await;
            if let Err(rejection) = admitted {
                debug!(
                    interceptor = interceptor.name(),
                    client = self.inner.client_name(),
                    "request rejected before send"
                );
                let error = HttpError::from(rejection);
                pending.disarm();
                notify_error(&self.interceptors[..pending.ran], &pending.request, &error);
                return Err(error);
            }
            pending.ran += 1;
        }

        let sent = tokio::select! {
            biased;
            _ = signal.cancelled() => Err(HttpError::from(InterceptError::Aborted)),
            sent = self.inner.request_raw(pending.request.clone()) => sent,
        };
        pending.disarm();

        match &sent {
            Ok(response) => {
                let context = AfterResponse {
                    request: &pending.request,
                    response,
                    attempt: 1,
                };
                for interceptor in &self.interceptors {
                    interceptor.after_response(&context);
                }
            }
            Err(error) => notify_error(&self.interceptors, &pending.request, error),
        }
        sent
    }
}

impl<C: HttpClient> HttpClient for InterceptedHttpClient<C> {
    fn client_name(&self) -> &str {
        self.inner.client_name()
    }

    fn request_raw<'a>(&'a self, request: HttpRequestOptions) -> HttpFuture<'a> {
        Box::pin(async move {
            let signal = CancellationToken::new();
            self.request_with_signal(request, &signal).await
        })
    }
}

fn notify_error(
    interceptors: &[Arc<dyn Interceptor>],
    request: &HttpRequestOptions,
    error: &HttpError,
) {
    let context = OnError {
        request,
        error,
        attempt: 1,
    };
    for interceptor in interceptors {
        interceptor.on_error(&context);
    }
}

/// Owns the in-flight request and fires `on_error` on the first `ran`
/// interceptors if the call is dropped before a completion hook ran.
struct PendingCompletion<'a> {
    interceptors: &'a [Arc<dyn Interceptor>],
    request: HttpRequestOptions,
    ran: usize,
    armed: bool,
}

impl PendingCompletion<'_> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PendingCompletion<'_> {
    fn drop(&mut self) {
        if self.armed {
            notify_error(
                &self.interceptors[..self.ran],
                &self.request,
                &HttpError::from(InterceptError::Aborted),
            );
        }
    }
}

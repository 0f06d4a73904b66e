//! Resilience profiles carried by policy overrides.
//!
//! A matched policy may swap the profile the transport applies to one request;
//! the transport reads it from
//! [`HttpRequestOptions::resilience`](crate::http_client::HttpRequestOptions).
//! [`send_with_retry`] is the retry loop
//! [`ReqwestHttpClient`](crate::http_client::ReqwestHttpClient) runs with that
//! profile, and host transports can reuse it.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::http_client::{HttpError, HttpErrorKind, HttpResponse};

/// Backoff strategy for retrying failed requests.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Backoff {
    /// Uses a fixed delay between retries.
    Fixed { delay_ms: u64 },
    /// Delay is `base_ms * factor^attempt`, capped at `max_ms`.
    Exponential {
        base_ms: u64,
        factor: f64,
        max_ms: u64,
        /// Apply random jitter (+/- 50%) to the delay.
        #[serde(default)]
        jitter: bool,
    },
}

impl Default for Backoff {
    fn default() -> Self {
        Self::Exponential {
            base_ms: 200,
            factor: 2.0,
            max_ms: 3_000,
            jitter: true,
        }
    }
}

impl Backoff {
    /// Delay before retry `attempt` (0-based).
    pub fn delay(self, attempt: u32) -> Duration {
        match self {
            Self::Fixed { delay_ms } => Duration::from_millis(delay_ms),
            Self::Exponential {
                base_ms,
                factor,
                max_ms,
                jitter,
            } => {
                let scale = factor.powi(attempt.min(i32::MAX as u32) as i32);
                let millis = (base_ms as f64 * scale).min(max_ms as f64).max(0.0) as u64;

                if !jitter {
                    return Duration::from_millis(millis);
                }

                let spread = millis / 2;
                let offset = fastrand::u64(0..=spread * 2);
                Duration::from_millis((millis + offset).saturating_sub(spread))
            }
        }
    }
}

/// Automatic retry settings the host transport honours.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub enabled: bool,
    /// Total attempts = `max_retries + 1`.
    pub max_retries: u32,
    pub backoff: Backoff,
    pub retry_on_status: Vec<u16>,
    pub retry_on_timeout: bool,
    pub retry_on_connect: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 4,
            backoff: Backoff::default(),
            retry_on_status: vec![408, 429, 500, 502, 503, 504],
            retry_on_timeout: true,
            retry_on_connect: true,
        }
    }
}

impl RetryConfig {
    pub fn fixed(delay: Duration, max_retries: u32) -> Self {
        Self {
            max_retries,
            backoff: Backoff::Fixed {
                delay_ms: delay.as_millis().min(u128::from(u64::MAX)) as u64,
            },
            ..Self::default()
        }
    }

    pub fn no_retry() -> Self {
        Self {
            enabled: false,
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn should_retry_status(&self, status: u16) -> bool {
        self.enabled && self.retry_on_status.contains(&status)
    }

    pub fn should_retry_error(&self, error: &HttpError) -> bool {
        self.enabled
            && match error.kind() {
                HttpErrorKind::Timeout => self.retry_on_timeout,
                HttpErrorKind::Connect => self.retry_on_connect,
                _ => false,
            }
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.backoff.delay(attempt)
    }
}

/// Named retry/timeout profile applied to a single request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResilienceProfile {
    pub name: String,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl ResilienceProfile {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            retry: RetryConfig::default(),
            timeout_ms: None,
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }
}

/// Calls `attempt` with the 0-based retry number until it produces a result
/// `retry` does not ask to repeat, or `max_retries` retries have been spent.
/// The last result is returned as is, so an exhausted retryable status still
/// reaches the caller as a response.
pub async fn send_with_retry<F, Fut>(
    retry: &RetryConfig,
    mut attempt: F,
) -> Result<HttpResponse, HttpError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<HttpResponse, HttpError>>,
{
    let mut retries = 0;
    loop {
        let result = attempt(retries).await;
        let retryable = match &result {
            Ok(response) => retry.should_retry_status(response.status),
            Err(error) => retry.should_retry_error(error),
        };
        if !retryable || retries >= retry.max_retries {
            return result;
        }

        let delay = retry.delay_for_attempt(retries);
        tracing::debug!(
            retry = retries + 1,
            max_retries = retry.max_retries,
            delay_ms = delay.as_millis() as u64,
            "retrying request"
        );
        tokio::time::sleep(delay).await;
        retries += 1;
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use super::*;

    fn scripted(
        results: Vec<Result<HttpResponse, HttpError>>,
    ) -> (Mutex<VecDeque<Result<HttpResponse, HttpError>>>, Mutex<Vec<u32>>) {
        (Mutex::new(results.into()), Mutex::new(Vec::new()))
    }

    fn quick_retry(max_retries: u32) -> RetryConfig {
        RetryConfig::fixed(Duration::from_millis(1), max_retries)
    }

    #[test]
    fn test_fixed_backoff() {
        let backoff = Backoff::Fixed { delay_ms: 100 };

        assert_eq!(backoff.delay(0), Duration::from_millis(100));
        assert_eq!(backoff.delay(10), Duration::from_millis(100));
    }

    #[test]
    fn test_exponential_backoff_is_capped() {
        let backoff = Backoff::Exponential {
            base_ms: 100,
            factor: 2.0,
            max_ms: 1_000,
            jitter: false,
        };

        assert_eq!(backoff.delay(0), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(400));
        assert_eq!(backoff.delay(4), Duration::from_secs(1));
    }

    #[test]
    fn test_exponential_backoff_with_jitter_stays_in_band() {
        let backoff = Backoff::Exponential {
            base_ms: 100,
            factor: 2.0,
            max_ms: 1_000,
            jitter: true,
        };

        for _ in 0..10 {
            for attempt in 0..5 {
                let expected = (100.0 * 2_f64.powi(attempt as i32)).min(1_000.0);
                let delay_ms = backoff.delay(attempt).as_millis() as f64;
                assert!(delay_ms >= expected * 0.5, "attempt={attempt}, delay_ms={delay_ms}");
                assert!(delay_ms <= expected * 1.5, "attempt={attempt}, delay_ms={delay_ms}");
            }
        }
    }

    #[test]
    fn test_no_retry_disables_status_retries() {
        let config = RetryConfig::no_retry();

        assert!(!config.enabled);
        assert!(!config.should_retry_status(503));
    }

    #[test]
    fn profile_deserializes_with_defaults() {
        let profile: ResilienceProfile = serde_json::from_value(serde_json::json!({
            "name": "slow-inference",
            "timeout_ms": 60000,
            "retry": { "max_retries": 1, "backoff": { "type": "fixed", "delay_ms": 250 } }
        }))
        .expect("valid profile");

        assert_eq!(profile.timeout_ms, Some(60_000));
        assert_eq!(profile.retry.max_retries, 1);
        assert_eq!(profile.retry.backoff.delay(3), Duration::from_millis(250));
        assert!(profile.retry.should_retry_status(429));
    }

    #[tokio::test]
    async fn retryable_statuses_are_repeated_until_success() {
        let (script, calls) = scripted(vec![
            Ok(HttpResponse::new(503, "unavailable")),
            Ok(HttpResponse::new(429, "slow down")),
            Ok(HttpResponse::ok_json("{}")),
        ]);

        let result = send_with_retry(&quick_retry(4), |retry| {
            calls.lock().expect("calls lock").push(retry);
            let next = script.lock().expect("script lock").pop_front();
            async move { next.expect("scripted result") }
        })
        .await;

        assert_eq!(result.expect("eventually succeeds").status, 200);
        assert_eq!(*calls.lock().expect("calls lock"), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn exhausted_retries_return_the_last_response() {
        let (script, calls) = scripted(vec![
            Ok(HttpResponse::new(502, "bad gateway")),
            Ok(HttpResponse::new(502, "bad gateway")),
            Ok(HttpResponse::ok_json("{}")),
        ]);

        let result = send_with_retry(&quick_retry(1), |retry| {
            calls.lock().expect("calls lock").push(retry);
            let next = script.lock().expect("script lock").pop_front();
            async move { next.expect("scripted result") }
        })
        .await;

        assert_eq!(result.expect("response").status, 502);
        assert_eq!(calls.lock().expect("calls lock").len(), 2);
    }

    #[tokio::test]
    async fn only_configured_error_kinds_are_retried() {
        let mut config = quick_retry(3);
        config.retry_on_connect = false;
        let (script, calls) = scripted(vec![
            Err(HttpError::with_kind(HttpErrorKind::Timeout, "timed out")),
            Err(HttpError::with_kind(HttpErrorKind::Connect, "refused")),
            Ok(HttpResponse::ok_json("{}")),
        ]);

        let result = send_with_retry(&config, |retry| {
            calls.lock().expect("calls lock").push(retry);
            let next = script.lock().expect("script lock").pop_front();
            async move { next.expect("scripted result") }
        })
        .await;

        let error = result.expect_err("connect failure is final");
        assert_eq!(error.kind(), HttpErrorKind::Connect);
        assert_eq!(calls.lock().expect("calls lock").len(), 2);
    }

    #[tokio::test]
    async fn disabled_retry_makes_a_single_attempt() {
        let (script, calls) = scripted(vec![
            Ok(HttpResponse::new(503, "unavailable")),
            Ok(HttpResponse::ok_json("{}")),
        ]);

        let result = send_with_retry(&RetryConfig::no_retry(), |retry| {
            calls.lock().expect("calls lock").push(retry);
            let next = script.lock().expect("script lock").pop_front();
            async move { next.expect("scripted result") }
        })
        .await;

        assert_eq!(result.expect("response").status, 503);
        assert_eq!(calls.lock().expect("calls lock").len(), 1);
    }
}

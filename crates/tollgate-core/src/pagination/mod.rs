//! Bounded, resumable iteration over paginated APIs.
//!
//! A run issues one request at a time through an [`HttpClient`], extracts items
//! from each decoded page and asks a [`PaginationStrategy`] for the next request.
//! Three ceilings bound every run:
//!
//! | Ceiling | Checked |
//! |---------|---------|
//! | `max_pages` | before each request |
//! | `max_items` | before each request and after each page |
//! | `max_duration` | before each request and after each page |
//!
//! Ceilings apply at page granularity: a page that overshoots `max_items` is
//! kept, and no further request is issued.
//!
//! ```rust,ignore
//! use tollgate_core::pagination::{paginate, Extraction, OffsetLimitStrategy, PaginateRequest};
//!
//! let request = PaginateRequest::new(
//!     client,
//!     HttpRequestOptions::get("https://api.example.com/v1/filings"),
//!     OffsetLimitStrategy::new(100),
//!     |body: &serde_json::Value| -> Result<Extraction<serde_json::Value>, String> {
//!         Ok(Extraction::new(body["results"].as_array().cloned().unwrap_or_default()))
//!     },
//! );
//! let result = paginate(request).await?;
//! println!("{} items across {} pages", result.item_count, result.page_count);
//! ```

mod strategy;
mod stream;

use std::fmt::{Debug, Display, Formatter};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::http_client::{HttpClient, HttpError, HttpRequestOptions, HttpResponse};

pub use strategy::{CursorStrategy, OffsetLimitStrategy, PaginationStrategy};
pub use stream::PageStream;

/// Hard resource ceilings for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaginationLimits {
    pub max_pages: usize,
    pub max_items: usize,
    pub max_duration: Duration,
}

impl Default for PaginationLimits {
    fn default() -> Self {
        Self {
            max_pages: 100,
            max_items: 10_000,
            max_duration: Duration::from_secs(300),
        }
    }
}

impl PaginationLimits {
    pub fn with_max_pages(mut self, max_pages: usize) -> Self {
        self.max_pages = max_pages;
        self
    }

    pub fn with_max_items(mut self, max_items: usize) -> Self {
        self.max_items = max_items;
        self
    }

    pub fn with_max_duration(mut self, max_duration: Duration) -> Self {
        self.max_duration = max_duration;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TruncationReason {
    #[serde(rename = "maxPages")]
    MaxPages,
    #[serde(rename = "maxItems")]
    MaxItems,
    #[serde(rename = "maxDurationMs")]
    MaxDuration,
    #[serde(rename = "error")]
    Error,
    /// The consumer finished the stream before it was exhausted.
    #[serde(rename = "abandoned")]
    Abandoned,
}

impl TruncationReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::MaxPages => "maxPages",
            Self::MaxItems => "maxItems",
            Self::MaxDuration => "maxDurationMs",
            Self::Error => "error",
            Self::Abandoned => "abandoned",
        }
    }
}

impl Display for TruncationReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What an extractor pulled out of one decoded page.
#[derive(Debug, Clone, PartialEq)]
pub struct Extraction<T> {
    pub items: Vec<T>,
    /// Raw value kept on the page; `None` keeps the whole decoded body.
    pub raw: Option<Value>,
    pub state: Option<Value>,
}

impl<T> Extraction<T> {
    pub fn new(items: Vec<T>) -> Self {
        Self {
            items,
            raw: None,
            state: None,
        }
    }

    pub fn with_raw(mut self, raw: Value) -> Self {
        self.raw = Some(raw);
        self
    }

    pub fn with_state(mut self, state: Value) -> Self {
        self.state = Some(state);
        self
    }
}

pub trait PageExtractor<T>: Send + Sync {
    fn extract(&self, body: &Value) -> Result<Extraction<T>, String>;
}

impl<T, F> PageExtractor<T> for F
where
    F: Fn(&Value) -> Result<Extraction<T>, String> + Send + Sync,
{
    fn extract(&self, body: &Value) -> Result<Extraction<T>, String> {
        self(body)
    }
}

/// One fetched page. Immutable once produced.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub index: usize,
    pub items: Vec<T>,
    pub raw: Value,
    pub state: Option<Value>,
    pub response: HttpResponse,
    pub request_used: HttpRequestOptions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageOutcome {
    pub index: usize,
    pub status: u16,
    pub duration_ms: u64,
}

/// Aggregate over one run, built when the run ends or the stream is abandoned.
#[derive(Debug, Clone, PartialEq)]
pub struct PaginationResult<T> {
    pub pages: Vec<Page<T>>,
    /// Items of every page, in page order.
    pub items: Vec<T>,
    pub page_count: usize,
    pub item_count: usize,
    pub page_outcomes: Vec<PageOutcome>,
    /// Outcome of the last page.
    pub aggregate_outcome: Option<PageOutcome>,
    pub truncated: bool,
    pub truncation_reason: Option<TruncationReason>,
    pub duration_ms: u64,
}

pub trait PaginationObserver<T>: Send + Sync {
    fn on_page(&self, _page: &Page<T>) {}

    /// Fires exactly once per run, including failed and abandoned runs.
    fn on_complete(&self, _result: &PaginationResult<T>) {}
}

#[derive(Debug, Clone, Error)]
pub enum PaginationError {
    #[error("page request failed: {0}")]
    Http(#[from] HttpError),
    #[error("upstream returned status {status}")]
    UpstreamStatus { status: u16 },
    #[error("page body is not valid json: {0}")]
    Decode(String),
    #[error("extractor failed: {0}")]
    Extract(String),
    #[error("pagination strategy failed: {0}")]
    Strategy(String),
}

/// A failed run. The pages fetched before the failure are kept in `partial`.
#[derive(Debug, Clone)]
pub struct PaginationFailure<T> {
    pub error: PaginationError,
    pub partial: PaginationResult<T>,
}

impl<T> Display for PaginationFailure<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} (after {} pages, {} items)",
            self.error, self.partial.page_count, self.partial.item_count
        )
    }
}

impl<T: Debug> std::error::Error for PaginationFailure<T> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

type StopPredicate<T> = Box<dyn Fn(&T, &Page<T>) -> bool + Send + Sync>;

/// Everything a run needs.
pub struct PaginateRequest<T> {
    pub(crate) client: Arc<dyn HttpClient>,
    pub(crate) initial_request: HttpRequestOptions,
    pub(crate) strategy: Box<dyn PaginationStrategy<T>>,
    pub(crate) extractor: Arc<dyn PageExtractor<T>>,
    pub(crate) limits: PaginationLimits,
    pub(crate) observer: Option<Arc<dyn PaginationObserver<T>>>,
    pub(crate) stop_when: Option<StopPredicate<T>>,
}

impl<T: 'static> PaginateRequest<T> {
    pub fn new<S, E>(
        client: Arc<dyn HttpClient>,
        initial_request: HttpRequestOptions,
        strategy: S,
        extractor: E,
    ) -> Self
    where
        S: PaginationStrategy<T> + 'static,
        E: PageExtractor<T> + 'static,
    {
        Self {
            client,
            initial_request,
            strategy: Box::new(strategy),
            extractor: Arc::new(extractor),
            limits: PaginationLimits::default(),
            observer: None,
            stop_when: None,
        }
    }

    pub fn with_limits(mut self, limits: PaginationLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn PaginationObserver<T>>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Stops after the first page containing an item that satisfies `predicate`.
    pub fn stop_when<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&T, &Page<T>) -> bool + Send + Sync + 'static,
    {
        self.stop_when = Some(Box::new(predicate));
        self
    }
}

/// Drives a run to completion and returns the aggregate.
pub async fn paginate<T>(
    request: PaginateRequest<T>,
) -> Result<PaginationResult<T>, PaginationFailure<T>>
where
    T: Clone + Send + 'static,
{
    let mut stream = PageStream::start(request);
    while let Some(next) = stream.next_page().await {
        if let Err(error) = next {
            let partial = stream.finish();
            return Err(PaginationFailure { error, partial });
        }
    }
    Ok(stream.finish())
}

/// [`paginate`] that also stops after the first page with an item matching `predicate`.
pub async fn paginate_until<T, P>(
    request: PaginateRequest<T>,
    predicate: P,
) -> Result<PaginationResult<T>, PaginationFailure<T>>
where
    T: Clone + Send + 'static,
    P: Fn(&T, &Page<T>) -> bool + Send + Sync + 'static,
{
    paginate(request.stop_when(predicate)).await
}

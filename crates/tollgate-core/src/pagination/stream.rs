use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tracing::{debug, warn};

use crate::http_client::{HttpClient, HttpRequestOptions};

use super::{
    Page, PageExtractor, PageOutcome, PaginateRequest, PaginationError, PaginationLimits,
    PaginationObserver, PaginationResult, PaginationStrategy, StopPredicate, TruncationReason,
};

/// Pull-based pagination run.
///
/// Call [`next_page`](Self::next_page) until it returns `None`, then
/// [`finish`](Self::finish) for the aggregate. Finishing early records the run as
/// abandoned. Dropping the stream without finishing still fires the observer's
/// `on_complete`.
pub struct PageStream<T> {
    client: Arc<dyn HttpClient>,
    strategy: Box<dyn PaginationStrategy<T>>,
    extractor: Arc<dyn PageExtractor<T>>,
    limits: PaginationLimits,
    observer: Option<Arc<dyn PaginationObserver<T>>>,
    stop_when: Option<StopPredicate<T>>,
    next_request: Option<HttpRequestOptions>,
    pages: Vec<Page<T>>,
    items: Vec<T>,
    page_outcomes: Vec<PageOutcome>,
    started: Instant,
    truncation: Option<TruncationReason>,
    finished: bool,
    completed: bool,
}

impl<T> PageStream<T> {
    pub fn start(request: PaginateRequest<T>) -> Self {
        let PaginateRequest {
            client,
            initial_request,
            mut strategy,
            extractor,
            limits,
            observer,
            stop_when,
        } = request;
        let first = strategy.initial_request(initial_request);

        Self {
            client,
            strategy,
            extractor,
            limits,
            observer,
            stop_when,
            next_request: Some(first),
            pages: Vec::new(),
            items: Vec::new(),
            page_outcomes: Vec::new(),
            started: Instant::now(),
            truncation: None,
            finished: false,
            completed: false,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn item_count(&self) -> usize {
        self.items.len()
    }

    pub fn truncation_reason(&self) -> Option<TruncationReason> {
        self.truncation
    }

    /// Ends the run and returns its aggregate, firing `on_complete` once.
    pub fn finish(mut self) -> PaginationResult<T> {
        if !self.finished {
            self.stop(Some(TruncationReason::Abandoned));
        }
        self.complete()
    }

    fn stop(&mut self, reason: Option<TruncationReason>) {
        self.finished = true;
        self.next_request = None;
        if self.truncation.is_none() {
            self.truncation = reason;
        }
    }

    fn fail(&mut self, error: PaginationError) -> PaginationError {
        warn!(
            pages = self.pages.len(),
            items = self.items.len(),
            error = %error,
            "pagination run failed"
        );
        self.stop(Some(TruncationReason::Error));
        error
    }

    fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    fn ceiling_reached(&self, include_pages: bool) -> Option<TruncationReason> {
        if include_pages && self.pages.len() >= self.limits.max_pages {
            return Some(TruncationReason::MaxPages);
        }
        if self.items.len() >= self.limits.max_items {
            return Some(TruncationReason::MaxItems);
        }
        if self.started.elapsed() >= self.limits.max_duration {
            return Some(TruncationReason::MaxDuration);
        }
        None
    }

    fn complete(&mut self) -> PaginationResult<T> {
        self.completed = true;
        let page_outcomes = std::mem::take(&mut self.page_outcomes);
        let pages = std::mem::take(&mut self.pages);
        let items = std::mem::take(&mut self.items);

        let result = PaginationResult {
            page_count: pages.len(),
            item_count: items.len(),
            aggregate_outcome: page_outcomes.last().copied(),
            truncated: self.truncation.is_some(),
            truncation_reason: self.truncation,
            duration_ms: self.elapsed_ms(),
            pages,
            items,
            page_outcomes,
        };
        debug!(
            pages = result.page_count,
            items = result.item_count,
            truncated = result.truncated,
            reason = result.truncation_reason.map(TruncationReason::as_str),
            "pagination run complete"
        );
        if let Some(observer) = &self.observer {
            observer.on_complete(&result);
        }
        result
    }
}

impl<T: Clone> PageStream<T> {
    /// Fetches the next page. `None` once the run has ended for any reason.
    pub async fn next_page(&mut self) -> Option<Result<Page<T>, PaginationError>> {
        if self.finished {
            return None;
        }
        if let Some(reason) = self.ceiling_reached(true) {
            debug!(reason = reason.as_str(), "pagination ceiling reached");
            self.stop(Some(reason));
            return None;
        }
        let Some(request) = self.next_request.take() else {
            self.stop(None);
            return None;
        };

        let index = self.pages.len();
        let page_started = Instant::now();
        let response = match self.client.request_raw(request.clone()).await {
            Ok(response) => response,
            Err(error) => return Some(Err(self.fail(PaginationError::Http(error)))),
        };
        let duration_ms = u64::try_from(page_started.elapsed().as_millis()).unwrap_or(u64::MAX);
        if !response.is_success() {
            let status = response.status;
            return Some(Err(self.fail(PaginationError::UpstreamStatus { status })));
        }

        let body: Value = match serde_json::from_str(&response.body) {
            Ok(body) => body,
            Err(error) => return Some(Err(self.fail(PaginationError::Decode(error.to_string())))),
        };
        let extraction = match self.extractor.extract(&body) {
            Ok(extraction) => extraction,
            Err(reason) => return Some(Err(self.fail(PaginationError::Extract(reason)))),
        };

        let page = Page {
            index,
            items: extraction.items,
            raw: extraction.raw.unwrap_or(body),
            state: extraction.state,
            response,
            request_used: request,
        };
        self.page_outcomes.push(PageOutcome {
            index,
            status: page.response.status,
            duration_ms,
        });
        self.items.extend(page.items.iter().cloned());
        self.pages.push(page.clone());
        debug!(index, items = page.items.len(), status = page.response.status, "fetched page");
        if let Some(observer) = &self.observer {
            observer.on_page(&page);
        }

        if let Some(reason) = self.ceiling_reached(false) {
            debug!(reason = reason.as_str(), "pagination ceiling reached");
            self.stop(Some(reason));
            return Some(Ok(page));
        }

        let stop_hit = self
            .stop_when
            .as_ref()
            .is_some_and(|predicate| page.items.iter().any(|item| predicate(item, &page)));
        if stop_hit {
            self.stop(None);
            return Some(Ok(page));
        }

        match self.strategy.next_request(&page.request_used, &page) {
            Ok(Some(next)) => self.next_request = Some(next),
            Ok(None) => self.stop(None),
            Err(error) => return Some(Err(self.fail(error))),
        }
        Some(Ok(page))
    }
}

impl<T> Drop for PageStream<T> {
    fn drop(&mut self) {
        if self.completed {
            return;
        }
        if !self.finished {
            self.stop(Some(TruncationReason::Abandoned));
        }
        self.complete();
    }
}

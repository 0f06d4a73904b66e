//! Next-request strategies. A next request is a clone of the previous one, so
//! headers, correlation ids, agent context and extensions carry over; only the
//! paging query parameters change.

use crate::http_client::HttpRequestOptions;

use super::{Page, PaginationError};

pub trait PaginationStrategy<T>: Send {
    /// Prepares the first request. The default leaves it untouched.
    fn initial_request(&mut self, request: HttpRequestOptions) -> HttpRequestOptions {
        request
    }

    /// `Ok(None)` ends the run without truncation.
    fn next_request(
        &mut self,
        previous: &HttpRequestOptions,
        page: &Page<T>,
    ) -> Result<Option<HttpRequestOptions>, PaginationError>;
}

/// `offset`/`limit` paging. Stops on the first empty page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetLimitStrategy {
    offset_param: String,
    limit_param: String,
    page_size: u64,
    next_offset: u64,
}

impl OffsetLimitStrategy {
    pub fn new(page_size: u64) -> Self {
        Self {
            offset_param: String::from("offset"),
            limit_param: String::from("limit"),
            page_size,
            next_offset: 0,
        }
    }

    pub fn with_params(
        mut self,
        offset_param: impl Into<String>,
        limit_param: impl Into<String>,
    ) -> Self {
        self.offset_param = offset_param.into();
        self.limit_param = limit_param.into();
        self
    }

    pub fn starting_at(mut self, offset: u64) -> Self {
        self.next_offset = offset;
        self
    }

    fn apply(&self, request: &mut HttpRequestOptions) {
        request.set_query_param(&self.offset_param, self.next_offset.to_string());
        request.set_query_param(&self.limit_param, self.page_size.to_string());
    }
}

impl<T> PaginationStrategy<T> for OffsetLimitStrategy {
    fn initial_request(&mut self, mut request: HttpRequestOptions) -> HttpRequestOptions {
        self.apply(&mut request);
        request
    }

    fn next_request(
        &mut self,
        previous: &HttpRequestOptions,
        page: &Page<T>,
    ) -> Result<Option<HttpRequestOptions>, PaginationError> {
        if page.items.is_empty() {
            return Ok(None);
        }
        if self.page_size == 0 {
            return Err(PaginationError::Strategy(String::from(
                "offset strategy page_size must be greater than zero",
            )));
        }

        self.next_offset = self.next_offset.saturating_add(self.page_size);
        let mut next = previous.clone();
        self.apply(&mut next);
        Ok(Some(next))
    }
}

/// Cursor paging. The caller reads the next cursor from each page; `None` ends the run.
pub struct CursorStrategy<F> {
    cursor_param: String,
    initial_cursor: Option<String>,
    next_cursor: F,
}

impl<F> CursorStrategy<F> {
    pub fn new(cursor_param: impl Into<String>, next_cursor: F) -> Self {
        Self {
            cursor_param: cursor_param.into(),
            initial_cursor: None,
            next_cursor,
        }
    }

    pub fn with_initial_cursor(mut self, cursor: impl Into<String>) -> Self {
        self.initial_cursor = Some(cursor.into());
        self
    }
}

impl<T, F> PaginationStrategy<T> for CursorStrategy<F>
where
    F: Fn(&Page<T>) -> Option<String> + Send,
{
    fn initial_request(&mut self, mut request: HttpRequestOptions) -> HttpRequestOptions {
        if let Some(cursor) = self.initial_cursor.take() {
            request.set_query_param(&self.cursor_param, cursor);
        }
        request
    }

    fn next_request(
        &mut self,
        previous: &HttpRequestOptions,
        page: &Page<T>,
    ) -> Result<Option<HttpRequestOptions>, PaginationError> {
        let Some(cursor) = (self.next_cursor)(page).filter(|cursor| !cursor.is_empty()) else {
            return Ok(None);
        };

        let mut next = previous.clone();
        next.set_query_param(&self.cursor_param, cursor);
        Ok(Some(next))
    }
}

// Shared fixtures for the behavior tests.
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

pub use std::sync::Arc;
pub use tollgate_core::{
    HttpClient, HttpError, HttpRequestOptions, HttpResponse, Scope, Selector,
};

use tollgate_core::http_client::HttpFuture;

/// Transport double that replays scripted responses and records every request it sees.
pub struct ScriptedProvider {
    name: String,
    latency: Duration,
    responses: Mutex<VecDeque<Result<HttpResponse, HttpError>>>,
    seen: Mutex<Vec<HttpRequestOptions>>,
}

impl ScriptedProvider {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            latency: Duration::ZERO,
            responses: Mutex::new(VecDeque::new()),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn respond(self, response: Result<HttpResponse, HttpError>) -> Self {
        self.responses.lock().expect("responses lock").push_back(response);
        self
    }

    /// Queues one `{"results": [...]}` page per slice.
    pub fn with_pages(self, pages: &[&[u64]]) -> Self {
        pages.iter().fold(self, |provider, items| {
            let body = serde_json::json!({ "results": items }).to_string();
            provider.respond(Ok(HttpResponse::ok_json(body)))
        })
    }

    pub fn requests(&self) -> Vec<HttpRequestOptions> {
        self.seen.lock().expect("seen lock").clone()
    }

    pub fn request_count(&self) -> usize {
        self.seen.lock().expect("seen lock").len()
    }
}

impl HttpClient for ScriptedProvider {
    fn client_name(&self) -> &str {
        &self.name
    }

    fn request_raw<'a>(&'a self, request: HttpRequestOptions) -> HttpFuture<'a> {
        Box::pin(async move {
            self.seen.lock().expect("seen lock").push(request);
            if !self.latency.is_zero() {
                tokio::time::sleep(self.latency).await;
            }
            self.responses
                .lock()
                .expect("responses lock")
                .pop_front()
                .unwrap_or_else(|| Ok(HttpResponse::ok_json(r#"{"results":[]}"#)))
        })
    }
}

pub fn scope_for(client: &str, url: &str) -> Scope {
    Scope::from_request(client, &HttpRequestOptions::get(url)).expect("valid scope")
}

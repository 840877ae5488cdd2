//! Fixture-first fetch backend.
//!
//! Maps exact URLs to canned responses so the pipeline can run offline in
//! tests and local development; unknown URLs resolve to a transport error.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use pricewatch_storage::{FetchBackend, FetchError, FetchedPage};

#[derive(Debug, Default)]
pub struct FixtureFetcher {
    responses: HashMap<String, Result<FetchedPage, FetchError>>,
    requests: Mutex<Vec<String>>,
}

impl FixtureFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_response(mut self, url: &str, page: FetchedPage) -> Self {
        self.responses.insert(url.to_string(), Ok(page));
        self
    }

    /// Canned 200 text/html response.
    pub fn with_html(self, url: &str, html: &str) -> Self {
        let page = FetchedPage {
            final_url: url.to_string(),
            status: 200,
            content_type: Some("text/html; charset=utf-8".to_string()),
            body: html.to_string(),
        };
        self.with_response(url, page)
    }

    /// Canned empty text/html response with the given status code.
    pub fn with_status(self, url: &str, status: u16) -> Self {
        let page = FetchedPage {
            final_url: url.to_string(),
            status,
            content_type: Some("text/html".to_string()),
            body: String::new(),
        };
        self.with_response(url, page)
    }

    pub fn with_timeout(mut self, url: &str) -> Self {
        self.responses
            .insert(url.to_string(), Err(FetchError::Timeout));
        self
    }

    pub fn with_transport_error(mut self, url: &str, message: &str) -> Self {
        self.responses
            .insert(url.to_string(), Err(FetchError::Transport(message.to_string())));
        self
    }

    /// Every URL fetched so far, in order.
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().expect("requests mutex").clone()
    }
}

#[async_trait]
impl FetchBackend for FixtureFetcher {
    async fn fetch_page(&self, url: &str) -> Result<FetchedPage, FetchError> {
        self.requests
            .lock()
            .expect("requests mutex")
            .push(url.to_string());
        match self.responses.get(url) {
            Some(result) => result.clone(),
            None => Err(FetchError::Transport(format!("no fixture for {url}"))),
        }
    }
}

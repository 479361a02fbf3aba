//! Outbound connectors used by the request pipeline.
//!
//! Both connectors are plain GET calls. The web fetcher goes through a
//! reader service that turns a page URL into structured text
//! (`GET {reader_url}/{page_url}`); query APIs hit their configured
//! endpoint directly and hand back the raw body. Traits sit in front of
//! the HTTP implementations so pipeline tests can substitute stubs.

use crate::config::QueryApiConfig;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("connector request timed out after {0}s")]
    Timeout(u64),
    #[error("connector returned status {status}")]
    Status { status: u16 },
    #[error("connector transport error: {0}")]
    Transport(String),
    #[error("connector response could not be decoded: {0}")]
    Decode(String),
}

impl ConnectorError {
    fn from_reqwest(err: reqwest::Error, timeout: Duration) -> Self {
        if err.is_timeout() {
            ConnectorError::Timeout(timeout.as_secs())
        } else {
            ConnectorError::Transport(err.to_string())
        }
    }
}

/// Structured page content as returned by the reader service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebPage {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub content: String,
}

pub trait WebFetcher: Send + Sync {
    fn fetch(
        &self,
        url: &str,
    ) -> Pin<Box<dyn Future<Output = Result<WebPage, ConnectorError>> + Send + '_>>;
}

/// Fetches pages through a Jina-reader-style service.
pub struct ReaderFetcher {
    client: reqwest::Client,
    reader_url: String,
    headers: Vec<(String, String)>,
    timeout: Duration,
}

impl ReaderFetcher {
    pub fn new(
        client: reqwest::Client,
        reader_url: String,
        headers: Vec<(String, String)>,
        timeout: Duration,
    ) -> Self {
        let reader_url = reader_url.trim_end_matches('/').to_owned();
        Self {
            client,
            reader_url,
            headers,
            timeout,
        }
    }

    fn endpoint(&self, page_url: &str) -> String {
        format!("{}/{}", self.reader_url, page_url)
    }
}

impl WebFetcher for ReaderFetcher {
    fn fetch(
        &self,
        url: &str,
    ) -> Pin<Box<dyn Future<Output = Result<WebPage, ConnectorError>> + Send + '_>> {
        let endpoint = self.endpoint(url);
        let page_url = url.to_owned();
        Box::pin(async move {
            debug!(url = %page_url, "fetching page via reader");
            let mut req = self
                .client
                .get(&endpoint)
                .header("accept", "application/json")
                .timeout(self.timeout);
            for (name, value) in &self.headers {
                req = req.header(name, value);
            }
            let response = req
                .send()
                .await
                .map_err(|e| ConnectorError::from_reqwest(e, self.timeout))?;

            let status = response.status();
            if !status.is_success() {
                return Err(ConnectorError::Status {
                    status: status.as_u16(),
                });
            }

            let body = response
                .text()
                .await
                .map_err(|e| ConnectorError::Transport(e.to_string()))?;

            // Reader services wrap the payload in {"code":..,"data":{..}} or
            // return the page object bare. Accept either shape.
            let value: serde_json::Value = serde_json::from_str(&body)
                .map_err(|e| ConnectorError::Decode(e.to_string()))?;
            let page_value = value.get("data").cloned().unwrap_or(value);
            let mut page: WebPage = serde_json::from_value(page_value)
                .map_err(|e| ConnectorError::Decode(e.to_string()))?;
            if page.url.is_empty() {
                page.url = page_url;
            }
            Ok(page)
        })
    }
}

pub trait QueryApi: Send + Sync {
    fn name(&self) -> &str;
    fn invoke(&self)
    -> Pin<Box<dyn Future<Output = Result<String, ConnectorError>> + Send + '_>>;
}

/// Calls a configured GET endpoint and returns the raw response body.
pub struct HttpQueryApi {
    client: reqwest::Client,
    config: QueryApiConfig,
    timeout: Duration,
}

impl HttpQueryApi {
    pub fn new(client: reqwest::Client, config: QueryApiConfig, timeout: Duration) -> Self {
        Self {
            client,
            config,
            timeout,
        }
    }
}

impl QueryApi for HttpQueryApi {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn invoke(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<String, ConnectorError>> + Send + '_>> {
        Box::pin(async move {
            debug!(api = %self.config.name, "invoking query api");
            let mut req = self
                .client
                .get(&self.config.url)
                .query(&self.config.params)
                .timeout(self.timeout);
            for (name, value) in &self.config.headers {
                req = req.header(name, value);
            }
            let response = req
                .send()
                .await
                .map_err(|e| ConnectorError::from_reqwest(e, self.timeout))?;

            let status = response.status();
            if !status.is_success() {
                return Err(ConnectorError::Status {
                    status: status.as_u16(),
                });
            }

            response
                .text()
                .await
                .map_err(|e| ConnectorError::Transport(e.to_string()))
        })
    }
}

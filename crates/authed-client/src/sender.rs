//! Transmission of a prepared request
//!
//! The pipeline decides which headers go out; the sender only moves bytes.
//! Keeping it behind a trait lets tests script the backend.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use reqwest::header::HeaderMap;
use tracing::debug;

use crate::descriptor::{ApiResponse, RequestDescriptor};
use crate::error::{Error, Result};

/// Sends one request and reads the full response.
///
/// Transport failures map to `Error::Timeout` / `Error::Transport`. Every
/// HTTP status, including errors, is an `Ok(ApiResponse)`.
pub trait HttpSender: Send + Sync {
    fn execute<'a>(
        &'a self,
        descriptor: &'a RequestDescriptor,
        headers: HeaderMap,
    ) -> Pin<Box<dyn Future<Output = Result<ApiResponse>> + Send + 'a>>;
}

/// `HttpSender` over a shared reqwest client.
pub struct ReqwestSender {
    client: reqwest::Client,
    base_url: String,
    default_timeout: Duration,
}

impl ReqwestSender {
    /// `default_timeout` applies to descriptors without their own timeout.
    pub fn new(client: reqwest::Client, base_url: impl Into<String>, default_timeout: Duration) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            default_timeout,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url_for(&self, descriptor: &RequestDescriptor) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), descriptor.path())
    }

    async fn send(&self, descriptor: &RequestDescriptor, headers: HeaderMap) -> Result<ApiResponse> {
        let timeout = descriptor.timeout().unwrap_or(self.default_timeout);
        let mut request = self
            .client
            .request(descriptor.method().clone(), self.url_for(descriptor))
            .headers(headers)
            .timeout(timeout);
        if let Some(body) = descriptor.body() {
            request = request.body(body.clone());
        }

        let response = request.send().await.map_err(|e| classify(e, timeout))?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await.map_err(|e| classify(e, timeout))?;

        debug!(status = status.as_u16(), bytes = body.len(), "backend responded");
        Ok(ApiResponse::new(status, headers, body))
    }
}

impl HttpSender for ReqwestSender {
    fn execute<'a>(
        &'a self,
        descriptor: &'a RequestDescriptor,
        headers: HeaderMap,
    ) -> Pin<Box<dyn Future<Output = Result<ApiResponse>> + Send + 'a>> {
        Box::pin(self.send(descriptor, headers))
    }
}

fn classify(e: reqwest::Error, timeout: Duration) -> Error {
    if e.is_timeout() {
        Error::Timeout(format!("no response within {}s: {e}", timeout.as_secs_f64()))
    } else {
        Error::Transport(format!("backend request failed: {e}"))
    }
}

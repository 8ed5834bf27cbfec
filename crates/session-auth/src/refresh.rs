//! Access token refresh
//!
//! The refresh endpoint exchanges ambient session context (the dashboard's
//! session cookie) for a new access token. It never sees the expired access
//! token. Repeating the call with the same session is harmless.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use common::Secret;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::credentials::Credential;

/// Why a refresh did not produce a credential.
///
/// `Clone` so a single outcome can be delivered to every waiting request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RefreshFailure {
    /// The endpoint refused the session (401/403). The user must sign in again.
    #[error("session rejected by refresh endpoint: {0}")]
    Rejected(String),

    /// Network error, unexpected status, or malformed response body.
    #[error("refresh transport error: {0}")]
    Transport(String),

    #[error("refresh timed out after {0:?}")]
    TimedOut(Duration),

    /// The refresh task ended without reporting an outcome.
    #[error("refresh aborted: {0}")]
    Aborted(String),
}

/// Body returned by the refresh endpoint.
#[derive(Debug, Deserialize, Serialize)]
pub struct RefreshResponse {
    #[serde(alias = "accessToken")]
    pub access_token: String,
}

/// One idempotent refresh exchange.
pub trait RefreshTransport: Send + Sync {
    fn refresh(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Credential, RefreshFailure>> + Send + '_>>;
}

/// Refresh over HTTP against a fixed endpoint.
pub struct HttpRefreshTransport {
    client: reqwest::Client,
    endpoint: String,
    session_cookie: Option<Secret<String>>,
}

impl HttpRefreshTransport {
    /// `endpoint` is the absolute refresh URL. `session_cookie` is sent
    /// verbatim as the `Cookie` header when present.
    pub fn new(
        client: reqwest::Client,
        endpoint: impl Into<String>,
        session_cookie: Option<Secret<String>>,
    ) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            session_cookie,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn exchange(&self) -> Result<Credential, RefreshFailure> {
        let mut request = self
            .client
            .post(&self.endpoint)
            .header(reqwest::header::ACCEPT, "application/json");
        if let Some(cookie) = &self.session_cookie {
            request = request.header(reqwest::header::COOKIE, cookie.expose().as_str());
        }

        let response = request
            .send()
            .await
            .map_err(|e| RefreshFailure::Transport(format!("token refresh request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| String::from("<no body>"));

            // 401/403 means the session behind the cookie is gone
            if status.as_u16() == 401 || status.as_u16() == 403 {
                return Err(RefreshFailure::Rejected(format!(
                    "refresh endpoint returned {status}: {body}"
                )));
            }

            return Err(RefreshFailure::Transport(format!(
                "refresh endpoint returned {status}: {body}"
            )));
        }

        let body = response
            .json::<RefreshResponse>()
            .await
            .map_err(|e| RefreshFailure::Transport(format!("invalid refresh response: {e}")))?;

        if body.access_token.is_empty() {
            return Err(RefreshFailure::Transport(
                "refresh response carried an empty access token".into(),
            ));
        }

        debug!(endpoint = %self.endpoint, "refresh endpoint issued a new access token");
        Ok(Credential::issued_now(body.access_token))
    }
}

impl RefreshTransport for HttpRefreshTransport {
    fn refresh(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Credential, RefreshFailure>> + Send + '_>> {
        Box::pin(self.exchange())
    }
}

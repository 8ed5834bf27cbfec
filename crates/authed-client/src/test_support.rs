//! Fakes shared by the coordinator and pipeline tests.

use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::header::{AUTHORIZATION, HeaderMap};
use session_auth::{
    Credential, CredentialStore, MemoryCredentialStore, RefreshFailure, RefreshTransport,
    SessionObserver,
};

use crate::descriptor::{ApiResponse, RequestDescriptor};
use crate::error::{Error, Result};
use crate::sender::HttpSender;

/// Refresh transport that sleeps, then returns a fixed outcome.
pub struct StubTransport {
    pub calls: AtomicUsize,
    delay: Duration,
    outcome: std::result::Result<Credential, RefreshFailure>,
}

impl StubTransport {
    pub fn succeeding(token: &str, delay: Duration) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            delay,
            outcome: Ok(Credential::new(token, 2)),
        }
    }

    pub fn failing(failure: RefreshFailure, delay: Duration) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            delay,
            outcome: Err(failure),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl RefreshTransport for StubTransport {
    fn refresh(
        &self,
    ) -> Pin<Box<dyn Future<Output = std::result::Result<Credential, RefreshFailure>> + Send + '_>>
    {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move {
            tokio::time::sleep(self.delay).await;
            self.outcome.clone()
        })
    }
}

/// Memory store that counts writes.
#[derive(Default)]
pub struct CountingStore {
    inner: MemoryCredentialStore,
    pub persists: AtomicUsize,
    pub invalidations: AtomicUsize,
}

impl CountingStore {
    pub fn with_token(token: &str) -> Self {
        Self {
            inner: MemoryCredentialStore::with_credential(Credential::new(token, 1)),
            ..Self::default()
        }
    }

    pub fn persists(&self) -> usize {
        self.persists.load(Ordering::SeqCst)
    }

    pub fn invalidations(&self) -> usize {
        self.invalidations.load(Ordering::SeqCst)
    }
}

impl CredentialStore for CountingStore {
    fn current(&self) -> Pin<Box<dyn Future<Output = Option<Credential>> + Send + '_>> {
        self.inner.current()
    }

    fn persist(
        &self,
        credential: Credential,
    ) -> Pin<Box<dyn Future<Output = session_auth::Result<()>> + Send + '_>> {
        self.persists.fetch_add(1, Ordering::SeqCst);
        self.inner.persist(credential)
    }

    fn invalidate(&self) -> Pin<Box<dyn Future<Output = session_auth::Result<()>> + Send + '_>> {
        self.invalidations.fetch_add(1, Ordering::SeqCst);
        self.inner.invalidate()
    }
}

#[derive(Default)]
pub struct CountingObserver {
    pub ended: AtomicUsize,
}

impl CountingObserver {
    pub fn ended(&self) -> usize {
        self.ended.load(Ordering::SeqCst)
    }
}

impl SessionObserver for CountingObserver {
    fn session_ended(&self, _reason: &RefreshFailure) {
        self.ended.fetch_add(1, Ordering::SeqCst);
    }
}

/// One request as seen by the fake backend.
#[derive(Debug, Clone)]
pub struct SentRequest {
    pub path: String,
    pub attempt: u32,
    pub authorization: Option<String>,
}

type Responder = dyn Fn(&SentRequest) -> Result<StatusCode> + Send + Sync;

/// Backend that answers from a closure and records every call.
pub struct ScriptedSender {
    sent: Mutex<Vec<SentRequest>>,
    respond: Box<Responder>,
}

impl ScriptedSender {
    pub fn new(respond: impl Fn(&SentRequest) -> Result<StatusCode> + Send + Sync + 'static) -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            respond: Box::new(respond),
        }
    }

    /// 200 for `Bearer {token}`, 401 for anything else.
    pub fn accepting(token: &str) -> Self {
        let expected = format!("Bearer {token}");
        Self::new(move |request| {
            if request.authorization.as_deref() == Some(expected.as_str()) {
                Ok(StatusCode::OK)
            } else {
                Ok(StatusCode::UNAUTHORIZED)
            }
        })
    }

    pub fn sent(&self) -> Vec<SentRequest> {
        self.sent.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

impl HttpSender for ScriptedSender {
    fn execute<'a>(
        &'a self,
        descriptor: &'a RequestDescriptor,
        headers: HeaderMap,
    ) -> Pin<Box<dyn Future<Output = Result<ApiResponse>> + Send + 'a>> {
        let request = SentRequest {
            path: descriptor.path().to_string(),
            attempt: descriptor.attempt(),
            authorization: headers
                .get(AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
        };
        self.sent.lock().unwrap().push(request.clone());
        let outcome = (self.respond)(&request);
        Box::pin(async move {
            // Yield so concurrent requests interleave like real I/O
            tokio::task::yield_now().await;
            let status = outcome?;
            Ok(ApiResponse::new(status, HeaderMap::new(), request.path))
        })
    }
}

pub fn network_down(_: &SentRequest) -> Result<StatusCode> {
    Err(Error::Transport("connection refused".into()))
}

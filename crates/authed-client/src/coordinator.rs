//! Single-flight credential refresh
//!
//! However many requests discover an expired credential at once, the refresh
//! endpoint is called once and every one of them receives the same outcome.
//!
//! State machine:
//! - Idle → Refreshing: first caller becomes the initiator and starts the refresh
//! - Refreshing: later callers register a waiter and suspend on it
//! - Refreshing → Idle: outcome persisted (or store invalidated), every waiter
//!   resolved in one step, session-ended raised once on failure
//!
//! The initiator/waiter decision and the Idle → Refreshing transition happen
//! under one mutex with no suspension point inside it. The refresh itself
//! runs on a spawned task so a cancelled initiator cannot strand waiters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use session_auth::{Credential, CredentialStore, RefreshFailure, RefreshTransport, SessionObserver};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::telemetry;

type RefreshOutcome = Result<Credential, RefreshFailure>;

enum CoordinatorState {
    Idle,
    Refreshing {
        waiters: Vec<oneshot::Sender<RefreshOutcome>>,
    },
}

enum Role {
    Initiator,
    Waiter(oneshot::Receiver<RefreshOutcome>),
}

struct Inner {
    state: Mutex<CoordinatorState>,
    store: Arc<dyn CredentialStore>,
    transport: Arc<dyn RefreshTransport>,
    observer: Arc<dyn SessionObserver>,
    refresh_timeout: Duration,
    refreshes: AtomicU64,
}

/// Cheap to clone; clones share one state machine.
#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<Inner>,
}

impl RefreshCoordinator {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        transport: Arc<dyn RefreshTransport>,
        observer: Arc<dyn SessionObserver>,
        refresh_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(CoordinatorState::Idle),
                store,
                transport,
                observer,
                refresh_timeout,
                refreshes: AtomicU64::new(0),
            }),
        }
    }

    /// Obtain a new credential, joining a refresh already in flight if there
    /// is one.
    pub async fn ensure_fresh_credential(&self) -> RefreshOutcome {
        match self.inner.claim() {
            Role::Waiter(rx) => {
                debug!("refresh already in flight, waiting for its outcome");
                rx.await.unwrap_or_else(|_| {
                    Err(RefreshFailure::Aborted(
                        "refresh ended without reporting an outcome".into(),
                    ))
                })
            }
            Role::Initiator => {
                debug!("starting credential refresh");
                let inner = Arc::clone(&self.inner);
                let task = tokio::spawn(async move { inner.run_refresh().await });
                task.await.unwrap_or_else(|e| {
                    Err(RefreshFailure::Aborted(format!("refresh task failed: {e}")))
                })
            }
        }
    }

    pub fn is_refreshing(&self) -> bool {
        matches!(*self.inner.lock_state(), CoordinatorState::Refreshing { .. })
    }

    /// Callers currently suspended on the in-flight refresh, initiator excluded.
    pub fn pending_waiters(&self) -> usize {
        match &*self.inner.lock_state() {
            CoordinatorState::Idle => 0,
            CoordinatorState::Refreshing { waiters } => waiters.len(),
        }
    }

    /// Refresh calls issued since creation.
    pub fn refresh_count(&self) -> u64 {
        self.inner.refreshes.load(Ordering::Relaxed)
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, CoordinatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Decide initiator vs waiter. The only critical section.
    fn claim(&self) -> Role {
        let mut state = self.lock_state();
        if let CoordinatorState::Refreshing { waiters } = &mut *state {
            let (tx, rx) = oneshot::channel();
            waiters.push(tx);
            return Role::Waiter(rx);
        }
        *state = CoordinatorState::Refreshing {
            waiters: Vec::new(),
        };
        Role::Initiator
    }

    async fn run_refresh(&self) -> RefreshOutcome {
        self.refreshes.fetch_add(1, Ordering::Relaxed);
        let outcome = self.exchange().await;

        match &outcome {
            Ok(credential) => {
                if let Err(e) = self.store.persist(credential.clone()).await {
                    warn!(error = %e, "failed to persist refreshed credential");
                }
                info!(issued_at = credential.issued_at, "credential refreshed");
                telemetry::record_refresh(Ok(()));
            }
            Err(failure) => {
                if let Err(e) = self.store.invalidate().await {
                    warn!(error = %e, "failed to invalidate credential store");
                }
                warn!(error = %failure, "credential refresh failed");
                telemetry::record_refresh(Err(failure));
            }
        }

        let waiters = match std::mem::replace(&mut *self.lock_state(), CoordinatorState::Idle) {
            CoordinatorState::Refreshing { waiters } => waiters,
            CoordinatorState::Idle => Vec::new(),
        };
        debug!(waiters = waiters.len(), "releasing refresh waiters");
        for waiter in waiters {
            // A waiter whose request was cancelled has dropped its receiver
            let _ = waiter.send(outcome.clone());
        }

        if let Err(failure) = &outcome {
            self.observer.session_ended(failure);
            telemetry::record_session_ended();
        }

        outcome
    }

    /// Run the transport on its own task, bounded by `refresh_timeout`.
    async fn exchange(&self) -> RefreshOutcome {
        let transport = Arc::clone(&self.transport);
        let mut task = tokio::spawn(async move { transport.refresh().await });

        match tokio::time::timeout(self.refresh_timeout, &mut task).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => Err(RefreshFailure::Aborted(format!("refresh transport failed: {e}"))),
            Err(_) => {
                task.abort();
                Err(RefreshFailure::TimedOut(self.refresh_timeout))
            }
        }
    }
}

//! Authenticated request pipeline
//!
//! Attaches the current credential, sends, and on the credential-expired
//! status of an original attempt asks the coordinator for a fresh credential
//! and replays once. When another request's refresh already replaced the
//! credential that was sent, the replay uses that one without refreshing. A request that never sees that status never touches the
//! coordinator or the store beyond reading the current credential.

use std::sync::Arc;

use session_auth::{Credential, CredentialStore};
use tracing::{debug, instrument, warn};

use crate::coordinator::RefreshCoordinator;
use crate::descriptor::{ApiResponse, RequestDescriptor};
use crate::error::{Error, Result};
use crate::policy::RetryPolicy;
use crate::sender::HttpSender;
use crate::telemetry;

pub struct RequestPipeline {
    sender: Arc<dyn HttpSender>,
    store: Arc<dyn CredentialStore>,
    coordinator: RefreshCoordinator,
    policy: RetryPolicy,
}

impl RequestPipeline {
    /// `store` must be the same store the coordinator writes to.
    pub fn new(
        sender: Arc<dyn HttpSender>,
        store: Arc<dyn CredentialStore>,
        coordinator: RefreshCoordinator,
    ) -> Self {
        Self {
            sender,
            store,
            coordinator,
            policy: RetryPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn coordinator(&self) -> &RefreshCoordinator {
        &self.coordinator
    }

    /// Send one logical request: at most one original call and one replay.
    #[instrument(skip_all, fields(method = %descriptor.method(), path = %descriptor.path()))]
    pub async fn send(&self, descriptor: RequestDescriptor) -> Result<ApiResponse> {
        let credential = self.store.current().await;
        let response = self.dispatch(&descriptor, credential.as_ref()).await?;
        let status = response.status();

        if !self.policy.is_auth_failure(status) {
            return Ok(response);
        }

        if !self.policy.should_replay(&descriptor, status) {
            warn!(attempt = descriptor.attempt(), "credential rejected, replay not allowed");
            telemetry::record_terminal("unauthorized");
            return Err(Error::Unauthorized {
                attempt: descriptor.attempt(),
            });
        }

        let fresh = match self.renewed_since(credential.as_ref()).await {
            Some(renewed) => {
                debug!("credential already renewed by another request");
                renewed
            }
            None => {
                debug!("credential rejected, awaiting a fresh one");
                match self.coordinator.ensure_fresh_credential().await {
                    Ok(credential) => credential,
                    Err(failure) => {
                        warn!(error = %failure, "refresh failed, request abandoned");
                        telemetry::record_terminal("refresh_failed");
                        return Err(Error::RefreshFailed(failure));
                    }
                }
            }
        };

        let replay = descriptor.replay();
        telemetry::record_replay();
        debug!(attempt = replay.attempt(), "replaying with refreshed credential");
        let response = self.dispatch(&replay, Some(&fresh)).await?;

        if self.policy.is_auth_failure(response.status()) {
            warn!(attempt = replay.attempt(), "refreshed credential rejected");
            telemetry::record_terminal("unauthorized");
            return Err(Error::Unauthorized {
                attempt: replay.attempt(),
            });
        }
        Ok(response)
    }

    /// The stored credential, if a refresh completed after `sent` was read.
    ///
    /// The store only changes through the coordinator, so a different stored
    /// credential is one a refresh already produced. An empty store means the
    /// session was invalidated and does not count.
    async fn renewed_since(&self, sent: Option<&Credential>) -> Option<Credential> {
        self.store
            .current()
            .await
            .filter(|current| Some(current) != sent)
    }

    async fn dispatch(
        &self,
        descriptor: &RequestDescriptor,
        credential: Option<&Credential>,
    ) -> Result<ApiResponse> {
        let headers = descriptor.authorized_headers(credential)?;
        self.sender.execute(descriptor, headers).await
    }
}

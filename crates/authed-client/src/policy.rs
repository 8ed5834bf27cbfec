//! Replay decision
//!
//! Only the credential-expired status on an original attempt is replayed.
//! Everything else (network errors, 5xx, validation errors, a second auth
//! failure) propagates as-is. A logical request therefore costs at most
//! `1 + MAX_REPLAYS` network calls.

use reqwest::StatusCode;

use crate::descriptor::RequestDescriptor;

/// Replays allowed per logical request.
pub const MAX_REPLAYS: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    auth_failure_status: StatusCode,
}

impl RetryPolicy {
    pub fn new(auth_failure_status: StatusCode) -> Self {
        Self {
            auth_failure_status,
        }
    }

    /// Whether `status` is the backend's expired-credential signal.
    pub fn is_auth_failure(&self, status: StatusCode) -> bool {
        status == self.auth_failure_status
    }

    pub fn should_replay(&self, descriptor: &RequestDescriptor, status: StatusCode) -> bool {
        self.is_auth_failure(status) && descriptor.attempt() < MAX_REPLAYS
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(StatusCode::UNAUTHORIZED)
    }
}

//! Client-side counters
//!
//! - `auth_refresh_total` (counter): label `outcome`
//! - `auth_replays_total` (counter)
//! - `auth_session_ended_total` (counter)
//! - `auth_terminal_failures_total` (counter): label `reason`
//!
//! No-ops until the host installs a recorder.

use session_auth::RefreshFailure;

pub(crate) fn record_refresh(outcome: Result<(), &RefreshFailure>) {
    let label = match outcome {
        Ok(()) => "success",
        Err(RefreshFailure::Rejected(_)) => "rejected",
        Err(RefreshFailure::Transport(_)) => "transport",
        Err(RefreshFailure::TimedOut(_)) => "timeout",
        Err(RefreshFailure::Aborted(_)) => "aborted",
    };
    metrics::counter!("auth_refresh_total", "outcome" => label).increment(1);
}

pub(crate) fn record_replay() {
    metrics::counter!("auth_replays_total").increment(1);
}

pub(crate) fn record_session_ended() {
    metrics::counter!("auth_session_ended_total").increment(1);
}

pub(crate) fn record_terminal(reason: &'static str) {
    metrics::counter!("auth_terminal_failures_total", "reason" => reason).increment(1);
}

//! Session protocol constants

use std::time::Duration;

/// Path of the refresh endpoint relative to the backend base URL
pub const DEFAULT_REFRESH_PATH: &str = "/auth/refresh";

/// Upper bound on a single refresh exchange. Waiters are released with a
/// timeout failure once this elapses.
pub const DEFAULT_REFRESH_TIMEOUT: Duration = Duration::from_secs(10);

/// Scheme prefix for the Authorization header
pub const BEARER_PREFIX: &str = "Bearer ";

/// Buffered session events per subscriber before lagging
pub const SESSION_EVENT_CAPACITY: usize = 16;

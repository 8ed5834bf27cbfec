//! Session credentials for the dashboard REST client
//!
//! Owns everything the request pipeline needs from the identity side:
//! the `Credential` value, the `CredentialStore` seam that holds it, the
//! `RefreshTransport` that exchanges ambient session context (a cookie) for
//! a new access token, and the session-ended signal raised when that
//! exchange fails for good.
//!
//! Credential flow:
//! 1. Pipeline reads `CredentialStore::current()` and attaches the bearer token
//! 2. Backend answers 401, coordinator calls `RefreshTransport::refresh()`
//! 3. New credential saved via `CredentialStore::persist()`
//! 4. Refresh rejected: `CredentialStore::invalidate()` and
//!    `SessionObserver::session_ended()`

pub mod constants;
pub mod credentials;
pub mod error;
pub mod refresh;
pub mod session;

pub use constants::*;
pub use credentials::{Credential, CredentialStore, FileCredentialStore, MemoryCredentialStore};
pub use error::{Error, Result};
pub use refresh::{HttpRefreshTransport, RefreshFailure, RefreshResponse, RefreshTransport};
pub use session::{SessionEvent, SessionObserver, SessionSignal};

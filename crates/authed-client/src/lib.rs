//! Authenticated REST client for the dashboard backend
//!
//! Every request goes through `RequestPipeline::send`, which attaches the
//! current bearer credential and handles an expired credential once:
//!
//! 1. Backend answers 401 on a first attempt
//! 2. `RefreshCoordinator` runs a single refresh shared by every request that
//!    hit the same expiry
//! 3. The request is replayed once with the new credential
//! 4. A 401 on the replay, or a failed refresh, is terminal
//!
//! Other statuses and transport errors are returned untouched.

pub mod coordinator;
pub mod descriptor;
pub mod error;
pub mod pipeline;
pub mod policy;
pub mod sender;
mod telemetry;

#[cfg(test)]
mod test_support;

pub use coordinator::RefreshCoordinator;
pub use descriptor::{ApiResponse, RequestDescriptor};
pub use error::{Error, Result};
pub use pipeline::RequestPipeline;
pub use policy::{MAX_REPLAYS, RetryPolicy};
pub use sender::{HttpSender, ReqwestSender};

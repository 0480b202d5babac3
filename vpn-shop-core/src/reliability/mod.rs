//! Reliability patterns for outbound calls.
//!
//! Provides the backoff policy and the status taxonomy used by the resilient
//! client core when talking to the panel, the tax service and payment
//! providers.

mod classify;
mod retry;

pub use classify::StatusClass;
pub use retry::RetryPolicy;

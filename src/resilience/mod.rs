//! Resilience patterns for backend and storage calls
//!
//! Provides exponential-backoff retry and run-level cancellation.

pub mod cancel;
pub mod retry;

pub use cancel::{CancelHandle, CancelSignal};
pub use retry::{ExponentialBackoff, RetryConfig, RetryOutcome, RetryPolicy};

//! Cooperative cancellation.
//!
//! A termination signal cancels the orchestrator's token; startup, probes
//! and backoff sleeps observe it and fall into the teardown path.

mod token;

pub use token::CancellationToken;

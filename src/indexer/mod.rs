//! Upstream block-explorer integration.
//!
//! This module provides the client and types for talking to an Etherscan-compatible explorer:
//! the chain height oracle, the paginated token-transfer source, and the rate limiting and
//! retry policy both of them share.

/// HTTP client implementing both upstream traits
mod client;
/// Request spacing
mod rate_limiter;
/// Bounded exponential retry
mod retry;
/// Traits the reconciliation engine depends on
mod source;
/// Type definitions for explorer payloads and errors
mod types;

pub use client::{ExplorerClient, ExplorerConfig};
pub use retry::RetryPolicy;
pub use source::{ChainHeightSource, TransferSource};
pub use types::*;

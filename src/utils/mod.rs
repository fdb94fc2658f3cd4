//!
//! Shared helpers for token amounts and account addresses.
/// Formatting and normalization functions
pub mod index;

pub use index::{format_token_amount, normalize_address};

//! Identity registry integration: providers to track and the accounts allowed to pay them.

mod namespace;
mod types;

pub use namespace::{IdentityRegistry, SqliteNamespaceRegistry};
pub use types::*;

#[cfg(test)]
pub(crate) use namespace::tests::seed_registry;

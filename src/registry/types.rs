use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A registered payment recipient discovered in the namespace registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provider {
	/// Stable unique identifier of the registry entry.
	pub namehash: String,
	/// Full registry path, e.g. `weather.grid.hypr`.
	pub display_name: String,
	/// Logical provider id; several entries may share one.
	pub provider_id: String,
	/// Lower-case `0x` wallet receiving payments.
	pub wallet_address: String,
}

/// Sender allow-list: normalized member address to registry display name.
#[derive(Debug, Clone, Default)]
pub struct AllowList {
	members: HashMap<String, String>,
}

impl AllowList {
	pub fn new() -> Self {
		Self::default()
	}

	/// Insert a member, keeping the first name seen for an address. Returns false on a duplicate.
	pub fn insert(&mut self, address: String, display_name: String) -> bool {
		if self.members.contains_key(&address) {
			return false;
		}
		self.members.insert(address, display_name);
		true
	}

	/// Display name of a sender, if it is a registered member.
	pub fn resolve(&self, address: &str) -> Option<&str> {
		self.members.get(address).map(String::as_str)
	}

	pub fn len(&self) -> usize {
		self.members.len()
	}

	pub fn is_empty(&self) -> bool {
		self.members.is_empty()
	}
}

impl FromIterator<(String, String)> for AllowList {
	fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
		let mut list = AllowList::new();
		for (address, name) in iter {
			list.insert(address, name);
		}
		list
	}
}

/// Errors raised while reading the namespace registry
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
	#[error("Namespace not found: {0}")]
	NamespaceNotFound(String),

	#[error("Registry database error: {0}")]
	DatabaseError(#[from] rusqlite::Error),

	#[error("Registry connection lock poisoned")]
	LockPoisoned,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn first_name_wins_for_duplicate_addresses() {
		let mut list = AllowList::new();
		assert!(list.is_empty());
		assert!(list.insert("0xabc".to_string(), "alice.hypr".to_string()));
		assert!(!list.insert("0xabc".to_string(), "bob.hypr".to_string()));
		assert!(!list.is_empty());
		assert_eq!(list.len(), 1);
		assert_eq!(list.resolve("0xabc"), Some("alice.hypr"));
		assert_eq!(list.resolve("0xdef"), None);
	}
}

//! Read-only adapter over the SQLite index of the hierarchical namespace.
//!
//! The index mirrors the on-chain name registry: every entry has a `namehash`, the hash of
//! its parent, a label, its full dotted name and optionally a token-bound account (`tba`).
//! Key/value notes such as `~wallet` and `~provider-id` hang off entries.

use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use rusqlite::{Connection, OpenFlags, OptionalExtension, params};
use tracing::{debug, info, warn};

use super::types::{AllowList, Provider, RegistryError};
use crate::utils::normalize_address;

pub const WALLET_NOTE: &str = "~wallet";
pub const PROVIDER_ID_NOTE: &str = "~provider-id";

/// Identity lookups the orchestrator needs from the registry.
#[async_trait]
pub trait IdentityRegistry: Send + Sync {
	/// Direct children of `namespace_root` that publish a payment wallet.
	async fn list_providers(&self, namespace_root: &str) -> Result<Vec<Provider>, RegistryError>;

	/// Every member account allowed to appear as a sender.
	async fn build_allow_list(&self) -> Result<AllowList, RegistryError>;
}

/// Registry backed by a namespace index database, opened read-only.
pub struct SqliteNamespaceRegistry {
	conn: Mutex<Connection>,
	member_root: Option<String>,
}

impl SqliteNamespaceRegistry {
	/// Open the index at `path`. With `member_root`, only accounts below that entry are members.
	pub fn open(path: impl AsRef<Path>, member_root: Option<String>) -> Result<Self, RegistryError> {
		let conn = Connection::open_with_flags(
			path.as_ref(),
			OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
		)?;
		info!("Opened namespace registry at {:?}", path.as_ref());
		Ok(Self::from_connection(conn, member_root))
	}

	pub fn from_connection(conn: Connection, member_root: Option<String>) -> Self {
		Self {
			conn: Mutex::new(conn),
			member_root,
		}
	}

	fn namehash_of(conn: &Connection, full_name: &str) -> Result<String, RegistryError> {
		conn.query_row(
			"SELECT namehash FROM entries WHERE full_name = ?1",
			params![full_name],
			|row| row.get(0),
		)
		.optional()?
		.ok_or_else(|| RegistryError::NamespaceNotFound(full_name.to_string()))
	}

	fn load_providers(&self, namespace_root: &str) -> Result<Vec<Provider>, RegistryError> {
		let conn = self.conn.lock().map_err(|_| RegistryError::LockPoisoned)?;
		let root_hash = Self::namehash_of(&conn, namespace_root)?;

		let mut stmt = conn.prepare(
			r#"
			SELECT e.namehash, e.label, e.full_name,
				(SELECT n.value FROM notes n WHERE n.namehash = e.namehash AND n.key = ?2),
				(SELECT n.value FROM notes n WHERE n.namehash = e.namehash AND n.key = ?3)
			FROM entries e
			WHERE e.parent_hash = ?1
			ORDER BY e.full_name
			"#,
		)?;

		let rows = stmt.query_map(params![root_hash, WALLET_NOTE, PROVIDER_ID_NOTE], |row| {
			Ok((
				row.get::<_, String>(0)?,
				row.get::<_, String>(1)?,
				row.get::<_, String>(2)?,
				row.get::<_, Option<String>>(3)?,
				row.get::<_, Option<String>>(4)?,
			))
		})?;

		let mut providers = Vec::new();
		for row in rows {
			let (namehash, label, full_name, wallet, provider_id) = row?;
			let Some(wallet) = wallet else {
				debug!("Skipping {}: no {} note", full_name, WALLET_NOTE);
				continue;
			};
			let Some(wallet_address) = normalize_address(&wallet) else {
				warn!("Skipping {}: invalid wallet '{}'", full_name, wallet);
				continue;
			};
			let provider_id = provider_id
				.map(|id| id.trim().to_string())
				.filter(|id| !id.is_empty())
				.unwrap_or(label);

			providers.push(Provider {
				namehash,
				display_name: full_name,
				provider_id,
				wallet_address,
			});
		}

		Ok(providers)
	}

	fn load_members(&self) -> Result<Vec<(String, String)>, RegistryError> {
		let conn = self.conn.lock().map_err(|_| RegistryError::LockPoisoned)?;

		let mapper = |row: &rusqlite::Row<'_>| -> rusqlite::Result<(String, String)> {
			Ok((row.get(0)?, row.get(1)?))
		};

		let members = match &self.member_root {
			Some(root) => {
				let root_hash = Self::namehash_of(&conn, root)?;
				let mut stmt = conn.prepare(
					r#"
					WITH RECURSIVE members(namehash) AS (
						SELECT ?1
						UNION
						SELECT e.namehash FROM entries e JOIN members m ON e.parent_hash = m.namehash
					)
					SELECT e.tba, e.full_name
					FROM entries e JOIN members m ON e.namehash = m.namehash
					WHERE e.tba IS NOT NULL
					ORDER BY e.full_name
					"#,
				)?;
				let rows = stmt
					.query_map(params![root_hash], mapper)?
					.collect::<Result<Vec<_>, _>>()?;
				rows
			}
			None => {
				let mut stmt = conn.prepare(
					"SELECT tba, full_name FROM entries WHERE tba IS NOT NULL ORDER BY full_name",
				)?;
				let rows = stmt
					.query_map([], mapper)?
					.collect::<Result<Vec<_>, _>>()?;
				rows
			}
		};

		Ok(members)
	}
}

#[async_trait]
impl IdentityRegistry for SqliteNamespaceRegistry {
	async fn list_providers(&self, namespace_root: &str) -> Result<Vec<Provider>, RegistryError> {
		let providers = self.load_providers(namespace_root)?;
		info!(
			"Discovered {} providers under {}",
			providers.len(),
			namespace_root
		);
		Ok(providers)
	}

	async fn build_allow_list(&self) -> Result<AllowList, RegistryError> {
		let mut allow_list = AllowList::new();
		for (tba, full_name) in self.load_members()? {
			let Some(address) = normalize_address(&tba) else {
				warn!("Ignoring member {} with invalid account '{}'", full_name, tba);
				continue;
			};
			if !allow_list.insert(address.clone(), full_name.clone()) {
				warn!(
					"Account {} already registered; ignoring duplicate entry {}",
					address, full_name
				);
			}
		}
		info!("Built sender allow-list with {} members", allow_list.len());
		Ok(allow_list)
	}
}

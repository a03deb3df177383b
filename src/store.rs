//! Transactional access to the gateway's relational schema: entities,
//! users, connections, parameters, and permissions.

use std::collections::{HashMap, HashSet};

use rand::RngCore;
use sha2::{Digest, Sha256};
use sqlx::{FromRow, PgPool, Postgres, Transaction};

use crate::error::GatewayStoreError;

/// The permission the operator grants/revokes on connections.
const READ_PERMISSION: &str = "READ";

/// Attributes tracked on a gateway user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserAttrs {
	/// Full name, as sourced from the directory.
	pub fullname: Option<String>,
	/// Email address, as sourced from the directory.
	pub email: Option<String>,
	/// Organization tag. Managed users carry `"MANAGED-BY: {service_account}"`.
	pub organization: String,
	/// Role tag. Managed users carry `"MANAGED USER"`.
	pub role: String,
}

/// A gateway connection row and its parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
	/// Server-assigned connection ID.
	pub id: i32,
	/// The connection's unique name.
	pub name: String,
	/// The connection protocol.
	pub protocol: String,
	/// Parent connection group ID, if any.
	pub parent_id: Option<i32>,
	/// The `hostname` parameter.
	pub hostname: String,
	/// The `port` parameter, stored as a string per the gateway schema.
	pub port: String,
}

#[derive(FromRow)]
struct EntityIdRow {
	entity_id: i32,
}

#[derive(FromRow)]
struct UserRow {
	name: String,
}

#[derive(FromRow)]
struct UserEntityRow {
	entity_id: i32,
	name: String,
}

#[derive(FromRow)]
struct UserAttributeRow {
	user_id: i32,
	attribute_name: String,
	attribute_value: Option<String>,
}

#[derive(FromRow)]
struct ConnectionRow {
	connection_id: i32,
	connection_name: String,
	protocol: String,
	parent_id: Option<i32>,
}

#[derive(FromRow)]
struct ConnectionParameterRow {
	connection_id: i32,
	parameter_name: String,
	parameter_value: String,
}

/// A pool-backed handle to the gateway database.
#[derive(Debug, Clone)]
pub struct GatewayStore {
	/// The underlying connection pool.
	pool: PgPool,
}

impl GatewayStore {
	/// Connect to the database at `database_url`.
	pub async fn connect(database_url: &str) -> Result<Self, GatewayStoreError> {
		let pool = PgPool::connect(database_url).await?;
		Ok(Self { pool })
	}

	/// Wrap an existing pool.
	#[must_use]
	pub fn from_pool(pool: PgPool) -> Self {
		Self { pool }
	}

	/// Start a new transaction, the unit of atomicity for one reconcile.
	pub async fn begin(&self) -> Result<GatewayTransaction<'_>, GatewayStoreError> {
		Ok(GatewayTransaction { txn: self.pool.begin().await? })
	}

	/// Create or idempotently re-assert the operator's own privileged
	/// account. Runs in its own transaction, separate from reconciles,
	/// since it happens exactly once at startup.
	pub async fn create_service_account(
		&self,
		username: &str,
		password: &str,
	) -> Result<(), GatewayStoreError> {
		let mut txn = self.pool.begin().await?;

		let entity_id = upsert_entity(&mut txn, username).await?;
		let (hash, salt) = hash_password(password);

		sqlx::query(
			"INSERT INTO guacamole_user (entity_id, password_hash, password_salt, password_date) \
			 VALUES ($1, $2, $3, now()) \
			 ON CONFLICT (entity_id) DO UPDATE SET \
			 password_hash = EXCLUDED.password_hash, \
			 password_salt = EXCLUDED.password_salt, \
			 password_date = EXCLUDED.password_date",
		)
		.bind(entity_id)
		.bind(hash)
		.bind(salt)
		.execute(&mut *txn)
		.await?;

		for permission in
			["CREATE_CONNECTION", "CREATE_USER", "CREATE_CONNECTION_GROUP", "ADMINISTER"]
		{
			sqlx::query(
				"INSERT INTO guacamole_system_permission (entity_id, permission) VALUES ($1, $2) \
				 ON CONFLICT DO NOTHING",
			)
			.bind(entity_id)
			.bind(permission)
			.execute(&mut *txn)
			.await?;
		}

		txn.commit().await?;
		Ok(())
	}
}

/// Hash a password the way the gateway expects: `SHA-256(password || salt)`,
/// with a freshly generated 32-byte uppercase hex salt, both stored as
/// decoded byte strings.
fn hash_password(password: &str) -> (Vec<u8>, Vec<u8>) {
	let mut salt_bytes = [0u8; 32];
	rand::thread_rng().fill_bytes(&mut salt_bytes);
	let salt_hex = hex_encode_upper(&salt_bytes);

	let mut hasher = Sha256::new();
	hasher.update(password.as_bytes());
	hasher.update(salt_hex.as_bytes());
	let digest = hasher.finalize();

	(digest.to_vec(), salt_bytes.to_vec())
}

/// Upper-case hex encoding, matching the gateway's own salt format.
fn hex_encode_upper(bytes: &[u8]) -> String {
	bytes.iter().map(|b| format!("{b:02X}")).collect()
}

/// Insert an entity row if one doesn't already exist for `name`, returning
/// its ID either way.
async fn upsert_entity(
	txn: &mut Transaction<'_, Postgres>,
	name: &str,
) -> Result<i32, GatewayStoreError> {
	if let Some(row) = sqlx::query_as::<Postgres, EntityIdRow>(
		"SELECT entity_id FROM guacamole_entity WHERE name = $1 AND type = 'USER'",
	)
	.bind(name)
	.fetch_optional(&mut **txn)
	.await?
	{
		return Ok(row.entity_id);
	}

	let row = sqlx::query_as::<Postgres, EntityIdRow>(
		"INSERT INTO guacamole_entity (name, type) VALUES ($1, 'USER') RETURNING entity_id",
	)
	.bind(name)
	.fetch_one(&mut **txn)
	.await?;
	Ok(row.entity_id)
}

/// One reconcile's worth of database work, committed or rolled back as a
/// single unit.
#[derive(Debug)]
pub struct GatewayTransaction<'t> {
	/// The underlying sqlx transaction.
	txn: Transaction<'t, Postgres>,
}

impl<'t> GatewayTransaction<'t> {
	/// Refuse to act on the service account through the ordinary
	/// user-management entry points; defense in depth alongside the
	/// reconciler's own filtering.
	fn guard_not_service_account(
		username: &str,
		service_account: &str,
	) -> Result<(), GatewayStoreError> {
		if username == service_account {
			return Err(GatewayStoreError::ServiceAccountCollision(username.to_owned()));
		}
		Ok(())
	}

	/// List every managed gateway user and its attributes. Identity and
	/// attributes are correlated through a single query keyed by
	/// `entity_id` rather than zipping two independently-ordered result
	/// sets, since Postgres gives no cross-statement ordering guarantee.
	pub async fn list_users(&mut self) -> Result<HashMap<String, UserAttrs>, GatewayStoreError> {
		let users = sqlx::query_as::<Postgres, UserEntityRow>(
			"SELECT e.entity_id, e.name FROM guacamole_entity e \
			 JOIN guacamole_user u ON u.entity_id = e.entity_id \
			 WHERE e.type = 'USER'",
		)
		.fetch_all(&mut *self.txn)
		.await?;

		let attrs = sqlx::query_as::<Postgres, UserAttributeRow>(
			"SELECT ua.user_id, ua.attribute_name, ua.attribute_value FROM guacamole_user_attribute ua",
		)
		.fetch_all(&mut *self.txn)
		.await?;

		let mut by_entity: HashMap<i32, HashMap<String, String>> = HashMap::new();
		for row in attrs {
			by_entity.entry(row.user_id).or_default().insert(
				row.attribute_name,
				row.attribute_value.unwrap_or_default(),
			);
		}

		let mut result = HashMap::new();
		for user in users {
			let fields = by_entity.get(&user.entity_id).cloned().unwrap_or_default();
			result.insert(
				user.name,
				UserAttrs {
					fullname: fields.get("guac-full-name").cloned(),
					email: fields.get("guac-email-address").cloned(),
					organization: fields.get("guac-organization").cloned().unwrap_or_default(),
					role: fields.get("guac-organizational-role").cloned().unwrap_or_default(),
				},
			);
		}
		Ok(result)
	}

	/// Look up one user's attributes.
	pub async fn get_user(&mut self, username: &str) -> Result<UserAttrs, GatewayStoreError> {
		self.list_users()
			.await?
			.remove(username)
			.ok_or_else(|| GatewayStoreError::UserNotFound(username.to_owned()))
	}

	/// Create a gateway user with a NULL password (authentication is
	/// delegated to the directory).
	pub async fn create_user(
		&mut self,
		username: &str,
		attrs: &UserAttrs,
		service_account: &str,
	) -> Result<(), GatewayStoreError> {
		Self::guard_not_service_account(username, service_account)?;

		let entity_id = upsert_entity(&mut self.txn, username).await?;

		sqlx::query(
			"INSERT INTO guacamole_user (entity_id, password_hash, password_salt, password_date) \
			 VALUES ($1, NULL, NULL, NULL) ON CONFLICT DO NOTHING",
		)
		.bind(entity_id)
		.execute(&mut *self.txn)
		.await?;

		self.upsert_attributes(entity_id, attrs).await
	}

	/// Update a user's attribute rows.
	pub async fn update_user(
		&mut self,
		username: &str,
		attrs: &UserAttrs,
		service_account: &str,
	) -> Result<(), GatewayStoreError> {
		Self::guard_not_service_account(username, service_account)?;

		let entity_id = sqlx::query_as::<Postgres, EntityIdRow>(
			"SELECT entity_id FROM guacamole_entity WHERE name = $1 AND type = 'USER'",
		)
		.bind(username)
		.fetch_optional(&mut *self.txn)
		.await?
		.ok_or_else(|| GatewayStoreError::UserNotFound(username.to_owned()))?
		.entity_id;

		self.upsert_attributes(entity_id, attrs).await
	}

	/// Upsert the four attribute rows backing [`UserAttrs`].
	async fn upsert_attributes(
		&mut self,
		entity_id: i32,
		attrs: &UserAttrs,
	) -> Result<(), GatewayStoreError> {
		let pairs = [
			("guac-full-name", attrs.fullname.clone().unwrap_or_default()),
			("guac-email-address", attrs.email.clone().unwrap_or_default()),
			("guac-organization", attrs.organization.clone()),
			("guac-organizational-role", attrs.role.clone()),
		];
		for (name, value) in pairs {
			sqlx::query(
				"INSERT INTO guacamole_user_attribute (user_id, attribute_name, attribute_value) \
				 VALUES ($1, $2, $3) \
				 ON CONFLICT (user_id, attribute_name) DO UPDATE SET attribute_value = EXCLUDED.attribute_value",
			)
			.bind(entity_id)
			.bind(name)
			.bind(value)
			.execute(&mut *self.txn)
			.await?;
		}
		Ok(())
	}

	/// Delete a user and everything that references it.
	pub async fn delete_user(
		&mut self,
		username: &str,
		service_account: &str,
	) -> Result<(), GatewayStoreError> {
		Self::guard_not_service_account(username, service_account)?;

		let entity_id = sqlx::query_as::<Postgres, EntityIdRow>(
			"SELECT entity_id FROM guacamole_entity WHERE name = $1 AND type = 'USER'",
		)
		.bind(username)
		.fetch_optional(&mut *self.txn)
		.await?
		.ok_or_else(|| GatewayStoreError::UserNotFound(username.to_owned()))?
		.entity_id;

		sqlx::query("DELETE FROM guacamole_user_attribute WHERE user_id = $1")
			.bind(entity_id)
			.execute(&mut *self.txn)
			.await?;
		sqlx::query("DELETE FROM guacamole_connection_permission WHERE entity_id = $1")
			.bind(entity_id)
			.execute(&mut *self.txn)
			.await?;
		sqlx::query("DELETE FROM guacamole_user WHERE entity_id = $1")
			.bind(entity_id)
			.execute(&mut *self.txn)
			.await?;
		sqlx::query("DELETE FROM guacamole_entity WHERE entity_id = $1")
			.bind(entity_id)
			.execute(&mut *self.txn)
			.await?;
		Ok(())
	}

	/// List every managed connection, keyed by ID.
	pub async fn list_connections(&mut self) -> Result<HashMap<i32, ConnectionInfo>, GatewayStoreError> {
		let connections = sqlx::query_as::<Postgres, ConnectionRow>(
			"SELECT connection_id, connection_name, protocol, parent_id FROM guacamole_connection",
		)
		.fetch_all(&mut *self.txn)
		.await?;
		let parameters = sqlx::query_as::<Postgres, ConnectionParameterRow>(
			"SELECT connection_id, parameter_name, parameter_value FROM guacamole_connection_parameter",
		)
		.fetch_all(&mut *self.txn)
		.await?;

		let mut params_by_conn: HashMap<i32, HashMap<String, String>> = HashMap::new();
		for row in parameters {
			params_by_conn.entry(row.connection_id).or_default().insert(row.parameter_name, row.parameter_value);
		}

		Ok(connections
			.into_iter()
			.map(|row| {
				let params = params_by_conn.get(&row.connection_id).cloned().unwrap_or_default();
				(
					row.connection_id,
					ConnectionInfo {
						id: row.connection_id,
						name: row.connection_name,
						protocol: row.protocol,
						parent_id: row.parent_id,
						hostname: params.get("hostname").cloned().unwrap_or_default(),
						port: params.get("port").cloned().unwrap_or_default(),
					},
				)
			})
			.collect())
	}

	/// Look up a connection's ID by its unique name.
	pub async fn get_connection_id_by_name(
		&mut self,
		name: &str,
	) -> Result<Option<i32>, GatewayStoreError> {
		let row = sqlx::query_as::<Postgres, EntityIdRow>(
			"SELECT connection_id AS entity_id FROM guacamole_connection WHERE connection_name = $1",
		)
		.bind(name)
		.fetch_optional(&mut *self.txn)
		.await?;
		Ok(row.map(|r| r.entity_id))
	}

	/// Resolve a parent connection group name to its ID. `"ROOT"`, and any
	/// name that doesn't exist, resolve to `None` (the root group).
	pub async fn resolve_parent_id(&mut self, parent: &str) -> Result<Option<i32>, GatewayStoreError> {
		if parent == "ROOT" {
			return Ok(None);
		}
		let row = sqlx::query_as::<Postgres, EntityIdRow>(
			"SELECT connection_group_id AS entity_id FROM guacamole_connection_group WHERE connection_group_name = $1",
		)
		.bind(parent)
		.fetch_optional(&mut *self.txn)
		.await?;
		Ok(row.map(|r| r.entity_id))
	}

	/// Create a connection, or update it in place if one with the same name
	/// already exists (so a resource surviving a rename in its own metadata
	/// doesn't produce a duplicate row).
	pub async fn create_connection(
		&mut self,
		name: &str,
		protocol: &str,
		parent_id: Option<i32>,
		hostname: &str,
		port: &str,
	) -> Result<i32, GatewayStoreError> {
		if let Some(id) = self.get_connection_id_by_name(name).await? {
			self.update_connection(id, name, protocol, parent_id, hostname, port).await?;
			return Ok(id);
		}

		let row = sqlx::query_as::<Postgres, EntityIdRow>(
			"INSERT INTO guacamole_connection (connection_name, protocol, parent_id) \
			 VALUES ($1, $2, $3) RETURNING connection_id AS entity_id",
		)
		.bind(name)
		.bind(protocol)
		.bind(parent_id)
		.fetch_one(&mut *self.txn)
		.await?;
		let id = row.entity_id;
		self.upsert_connection_parameters(id, hostname, port).await?;
		Ok(id)
	}

	/// Overwrite an existing connection's fields unconditionally.
	pub async fn update_connection(
		&mut self,
		id: i32,
		name: &str,
		protocol: &str,
		parent_id: Option<i32>,
		hostname: &str,
		port: &str,
	) -> Result<(), GatewayStoreError> {
		sqlx::query(
			"UPDATE guacamole_connection SET connection_name = $2, protocol = $3, parent_id = $4 \
			 WHERE connection_id = $1",
		)
		.bind(id)
		.bind(name)
		.bind(protocol)
		.bind(parent_id)
		.execute(&mut *self.txn)
		.await?;
		self.upsert_connection_parameters(id, hostname, port).await
	}

	/// Upsert the `hostname`/`port` parameter rows for a connection.
	async fn upsert_connection_parameters(
		&mut self,
		connection_id: i32,
		hostname: &str,
		port: &str,
	) -> Result<(), GatewayStoreError> {
		for (name, value) in [("hostname", hostname), ("port", port)] {
			sqlx::query(
				"INSERT INTO guacamole_connection_parameter (connection_id, parameter_name, parameter_value) \
				 VALUES ($1, $2, $3) \
				 ON CONFLICT (connection_id, parameter_name) DO UPDATE SET parameter_value = EXCLUDED.parameter_value",
			)
			.bind(connection_id)
			.bind(name)
			.bind(value)
			.execute(&mut *self.txn)
			.await?;
		}
		Ok(())
	}

	/// Delete a connection and everything that references it.
	pub async fn delete_connection(&mut self, id: i32) -> Result<(), GatewayStoreError> {
		sqlx::query("DELETE FROM guacamole_connection_parameter WHERE connection_id = $1")
			.bind(id)
			.execute(&mut *self.txn)
			.await?;
		sqlx::query("DELETE FROM guacamole_connection_permission WHERE connection_id = $1")
			.bind(id)
			.execute(&mut *self.txn)
			.await?;
		sqlx::query("DELETE FROM guacamole_connection WHERE connection_id = $1")
			.bind(id)
			.execute(&mut *self.txn)
			.await?;
		Ok(())
	}

	/// Every username currently holding READ on `connection_id`.
	pub async fn list_connection_users(
		&mut self,
		connection_id: i32,
	) -> Result<HashSet<String>, GatewayStoreError> {
		let rows = sqlx::query_as::<Postgres, UserRow>(
			"SELECT e.name FROM guacamole_connection_permission p \
			 JOIN guacamole_entity e ON e.entity_id = p.entity_id \
			 WHERE p.connection_id = $1 AND p.permission = $2",
		)
		.bind(connection_id)
		.bind(READ_PERMISSION)
		.fetch_all(&mut *self.txn)
		.await?;
		Ok(rows.into_iter().map(|r| r.name).collect())
	}

	/// Grant READ on `connection_id` to `username`. Idempotent.
	pub async fn grant(&mut self, username: &str, connection_id: i32) -> Result<(), GatewayStoreError> {
		let entity_id = sqlx::query_as::<Postgres, EntityIdRow>(
			"SELECT entity_id FROM guacamole_entity WHERE name = $1 AND type = 'USER'",
		)
		.bind(username)
		.fetch_optional(&mut *self.txn)
		.await?
		.ok_or_else(|| GatewayStoreError::UserNotFound(username.to_owned()))?
		.entity_id;

		sqlx::query(
			"INSERT INTO guacamole_connection_permission (entity_id, connection_id, permission) \
			 VALUES ($1, $2, $3) ON CONFLICT DO NOTHING",
		)
		.bind(entity_id)
		.bind(connection_id)
		.bind(READ_PERMISSION)
		.execute(&mut *self.txn)
		.await?;
		Ok(())
	}

	/// Revoke READ on `connection_id` from `username`.
	pub async fn revoke(&mut self, username: &str, connection_id: i32) -> Result<(), GatewayStoreError> {
		sqlx::query(
			"DELETE FROM guacamole_connection_permission WHERE connection_id = $1 AND permission = $2 \
			 AND entity_id = (SELECT entity_id FROM guacamole_entity WHERE name = $3 AND type = 'USER')",
		)
		.bind(connection_id)
		.bind(READ_PERMISSION)
		.bind(username)
		.execute(&mut *self.txn)
		.await?;
		Ok(())
	}

	/// Commit every write made on this transaction.
	pub async fn commit(self) -> Result<(), GatewayStoreError> {
		self.txn.commit().await?;
		Ok(())
	}
}

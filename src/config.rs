//! Operator configuration: one nested struct per component, loaded from
//! environment variables (with an optional YAML file as a base layer, which
//! is mostly useful for tests).

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use url::Url;

/// Top-level configuration for the operator.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
	/// Gateway database connection parameters.
	pub database: DatabaseConfig,
	/// The operator's own privileged gateway account.
	pub service_account: ServiceAccountConfig,
	/// LDAP connection and search parameters.
	pub directory: DirectoryConfig,
	/// The Kubernetes namespace to watch for `GuacamoleConnection`s.
	pub namespace: String,
	/// Log verbosity, e.g. `"debug"`. Defaults to `DEBUG` per the operator's
	/// usual deployment posture.
	#[serde(default = "default_log_level")]
	pub log_level: String,
}

/// Default log level when none is configured.
fn default_log_level() -> String {
	"debug".to_owned()
}

/// Gateway database connection parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
	/// Database host.
	pub host: String,
	/// Database port.
	pub port: u16,
	/// Database name.
	pub name: String,
	/// Database user.
	pub user: String,
	/// Database password.
	pub password: String,
}

impl DatabaseConfig {
	/// Build a `postgres://` connection string from the parts above.
	#[must_use]
	pub fn connection_url(&self) -> String {
		format!(
			"postgres://{}:{}@{}:{}/{}",
			self.user, self.password, self.host, self.port, self.name
		)
	}
}

/// The operator's own privileged gateway account, created/refreshed once at
/// startup and excluded from every reconcile's sync and cull passes.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccountConfig {
	/// The service account's gateway username.
	pub username: String,
	/// The service account's password. Re-asserted (not rotated) on every
	/// startup; see the design notes on bootstrap idempotency.
	pub password: String,
}

/// LDAP connection and search parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct DirectoryConfig {
	/// The LDAP server URL, e.g. `ldaps://directory.example.org`.
	pub url: Url,
	/// The DN to bind as for searches.
	pub bind_dn: String,
	/// The password for `bind_dn`.
	pub bind_password: String,
	/// Base DN under which user objects are searched.
	pub user_base: String,
	/// Filter all user searches must additionally satisfy, e.g.
	/// `"(objectClass=person)"`.
	pub user_filter: String,
	/// Attribute holding the username.
	pub username_attr: String,
	/// Attribute holding the full name.
	pub fullname_attr: String,
	/// Attribute holding the email address.
	pub email_attr: String,
	/// Base DN under which group objects are searched.
	pub group_base: String,
	/// Filter all group searches must additionally satisfy, e.g.
	/// `"(objectClass=group)"`.
	pub group_filter: String,
	/// Attribute on a group object listing member DNs.
	pub member_attr: String,
	/// Page size for paged LDAP searches.
	#[serde(default = "default_page_size")]
	pub page_size: i32,
}

/// Default LDAP search page size.
fn default_page_size() -> i32 {
	100
}

impl Config {
	/// Load configuration from environment variables. Nested fields use a
	/// `__` separator, e.g. `DATABASE__HOST`, `DIRECTORY__BIND_DN`.
	pub fn from_env() -> Result<Self> {
		let raw = config::Config::builder()
			.add_source(config::Environment::default().separator("__"))
			.build()
			.context("failed to assemble configuration from the environment")?;
		raw.try_deserialize().context("configuration is missing required fields")
	}

	/// Load configuration from a YAML file, used by tests and local runs
	/// that prefer a single file over a wall of environment variables.
	pub async fn from_file(path: &Path) -> Result<Self> {
		let contents = tokio::fs::read_to_string(path)
			.await
			.with_context(|| format!("failed to read config file at {}", path.display()))?;
		serde_yaml::from_str(&contents).context("failed to parse config file")
	}
}

//! A trimmed-down `testcontainers` image wrapping `bitnamilegacy/openldap`,
//! exposing only the knobs the integration tests here actually need. See
//! the `testcontainers-modules` `openldap` module for the full-featured
//! version this one is cut down from.

use std::borrow::Cow;
use std::collections::HashMap;

use testcontainers::core::{ContainerPort, WaitFor};
use testcontainers::Image;

const NAME: &str = "bitnamilegacy/openldap";
const TAG: &str = "2.6.10";
const OPENLDAP_PORT: ContainerPort = ContainerPort::Tcp(1389);

#[derive(Debug, Clone)]
struct User {
	username: String,
	password: String,
}

/// Builder for a throwaway OpenLDAP server, seeded with a handful of user
/// accounts under `ou=users,dc=example,dc=org`.
#[derive(Debug, Clone, Default)]
pub struct OpenLDAP {
	env_vars: HashMap<String, String>,
	users: Vec<User>,
}

impl OpenLDAP {
	/// Allow anonymous binds, which is all these tests need since group
	/// expansion binds with whatever `bind_dn`/`bind_password` the caller
	/// configures (here, empty).
	#[must_use]
	pub fn with_allow_anon_binding(mut self, allow: bool) -> Self {
		self.env_vars
			.insert("LDAP_ALLOW_ANON_BINDING".to_owned(), if allow { "yes" } else { "no" }.to_owned());
		self
	}

	/// Seed a user account (creates `cn=<username>,ou=users,dc=example,dc=org`).
	#[must_use]
	pub fn with_user(mut self, username: impl ToString, password: impl ToString) -> Self {
		self.users.push(User { username: username.to_string(), password: password.to_string() });
		self
	}
}

impl Image for OpenLDAP {
	fn name(&self) -> &str {
		NAME
	}

	fn tag(&self) -> &str {
		TAG
	}

	fn ready_conditions(&self) -> Vec<WaitFor> {
		vec![WaitFor::message_on_stderr("** Starting slapd **"), WaitFor::seconds(2)]
	}

	fn env_vars(&self) -> impl IntoIterator<Item = (impl Into<Cow<'_, str>>, impl Into<Cow<'_, str>>)> {
		let mut vars = self.env_vars.clone();
		let usernames: Vec<_> = self.users.iter().map(|u| u.username.clone()).collect();
		let passwords: Vec<_> = self.users.iter().map(|u| u.password.clone()).collect();
		vars.insert("LDAP_USERS".to_owned(), usernames.join(", "));
		vars.insert("LDAP_PASSWORDS".to_owned(), passwords.join(", "));
		vars
	}

	fn expose_ports(&self) -> &[ContainerPort] {
		&[OPENLDAP_PORT]
	}
}

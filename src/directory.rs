//! LDAP group membership traversal.
//!
//! Recursively expands a group filter into the set of user entries it
//! (transitively) contains, tracking visited distinguished names so that
//! cyclic group graphs still terminate.

use std::collections::{HashMap, HashSet};

use ldap3::adapters::{Adapter, EntriesOnly, PagedResults};
use ldap3::{LdapConnAsync, LdapConnSettings, Scope, SearchEntry};

use crate::config::DirectoryConfig;
use crate::error::DirectoryError;

/// A single user entry produced by group expansion, keyed by the
/// configured attribute names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryRecord {
	/// The entry's distinguished name.
	pub dn: String,
	/// The resolved username.
	pub username: String,
	/// The resolved full name, if the attribute was present.
	pub fullname: Option<String>,
	/// The resolved email, if the attribute was present.
	pub email: Option<String>,
}

/// The set of attribute names the caller wants read off each user entry.
#[derive(Debug, Clone)]
pub struct WantedAttributes {
	/// The attribute holding the username.
	pub username_attr: String,
	/// The attribute holding the full name.
	pub fullname_attr: String,
	/// The attribute holding the email address.
	pub email_attr: String,
}

impl WantedAttributes {
	/// The attribute list to request from the server.
	fn as_list(&self) -> Vec<&str> {
		vec![&self.username_attr, &self.fullname_attr, &self.email_attr]
	}
}

/// A bound LDAP connection plus the search parameters needed to resolve
/// group membership.
#[derive(Debug, Clone)]
pub struct DirectoryClient {
	/// Connection and search configuration.
	config: DirectoryConfig,
}

impl DirectoryClient {
	/// Construct a client from configuration. Does not connect yet.
	#[must_use]
	pub fn new(config: DirectoryConfig) -> Self {
		Self { config }
	}

	/// Bind and run one search, returning the raw paged/streaming results.
	async fn search(
		&self,
		ldap: &mut ldap3::Ldap,
		base: &str,
		filter: &str,
		attrs: &[&str],
	) -> Result<Vec<SearchEntry>, DirectoryError> {
		let adapters: Vec<Box<dyn Adapter<_, _>>> =
			vec![Box::new(EntriesOnly::new()), Box::new(PagedResults::new(self.config.page_size))];
		let mut stream =
			ldap.streaming_search_with(adapters, base, Scope::Subtree, filter, attrs).await?;
		let mut entries = Vec::new();
		while let Some(entry) = stream.next().await? {
			entries.push(SearchEntry::construct(entry));
		}
		stream.finish().await.success()?;
		Ok(entries)
	}

	/// Expand `group_filter` into the set of user records it transitively
	/// contains. Cycles in the group graph are broken by tracking every DN
	/// already visited.
	pub async fn iterate_group_members(
		&self,
		group_filter: &str,
		wanted: &WantedAttributes,
	) -> Result<Vec<DirectoryRecord>, DirectoryError> {
		validate_filter(group_filter)?;

		let (conn, mut ldap) =
			LdapConnAsync::with_settings(LdapConnSettings::new(), self.config.url.as_str()).await?;
		ldap3::drive!(conn);
		ldap.simple_bind(&self.config.bind_dn, &self.config.bind_password).await?.success()?;

		let mut visited = HashSet::new();
		let mut members = HashMap::new();
		let group_query = and_filter(&self.config.group_filter, group_filter);
		self.expand_group(&mut ldap, &group_query, wanted, &mut visited, &mut members).await?;

		ldap.unbind().await?;
		Ok(members.into_values().collect())
	}

	/// Search for groups matching `group_query`, and for each hit, recurse
	/// into its member attribute values.
	async fn expand_group(
		&self,
		ldap: &mut ldap3::Ldap,
		group_query: &str,
		wanted: &WantedAttributes,
		visited: &mut HashSet<String>,
		members: &mut HashMap<String, DirectoryRecord>,
	) -> Result<(), DirectoryError> {
		let groups = self
			.search(ldap, &self.config.group_base, group_query, &[self.config.member_attr.as_str()])
			.await?;

		for group in groups {
			if !visited.insert(group.dn.clone()) {
				continue;
			}

			let Some(member_dns) = group.attrs.get(&self.config.member_attr).cloned() else {
				continue;
			};

			for member_dn in member_dns {
				if visited.contains(&member_dn) {
					continue;
				}

				let dn_query = and_filter(&self.config.group_filter, &dn_equals(&member_dn));
				Box::pin(self.expand_group(ldap, &dn_query, wanted, visited, members)).await?;

				if visited.contains(&member_dn) {
					// The DN turned out to be a group; it's already handled.
					continue;
				}

				let user_query = and_filter(&self.config.user_filter, &dn_equals(&member_dn));
				let users =
					self.search(ldap, &self.config.user_base, &user_query, &wanted.as_list()).await?;

				for user in users {
					visited.insert(user.dn.clone());
					match record_from_entry(user, wanted) {
						Ok(record) => {
							members.insert(record.dn.clone(), record);
						}
						Err(DirectoryError::MissingAttribute { dn, attribute }) => {
							tracing::warn!(dn, attribute, "skipping directory entry missing attribute");
						}
						Err(err) => return Err(err),
					}
				}
			}
		}

		Ok(())
	}
}

/// Build a record from a search entry, reading the configured attributes.
fn record_from_entry(
	entry: SearchEntry,
	wanted: &WantedAttributes,
) -> Result<DirectoryRecord, DirectoryError> {
	let username = first_attr(&entry, &wanted.username_attr)
		.ok_or_else(|| DirectoryError::MissingAttribute {
			dn: entry.dn.clone(),
			attribute: wanted.username_attr.clone(),
		})?
		.to_owned();
	let fullname = first_attr(&entry, &wanted.fullname_attr).map(ToOwned::to_owned);
	let email = first_attr(&entry, &wanted.email_attr).map(ToOwned::to_owned);

	Ok(DirectoryRecord { dn: entry.dn, username, fullname, email })
}

/// Return the first value of `attr` on `entry`, if any.
fn first_attr<'e>(entry: &'e SearchEntry, attr: &str) -> Option<&'e str> {
	entry.attrs.get(attr).and_then(|values| values.first()).map(String::as_str)
}

/// Combine two filters with a logical AND. Both are assumed already valid.
fn and_filter(a: &str, b: &str) -> String {
	format!("(&{a}{b})")
}

/// Build a `(distinguishedName=...)` filter fragment for an exact DN match.
fn dn_equals(dn: &str) -> String {
	format!("(distinguishedName={})", escape_filter_value(dn))
}

/// Escape the characters RFC 4515 requires escaping in a filter value.
fn escape_filter_value(value: &str) -> String {
	let mut escaped = String::with_capacity(value.len());
	for c in value.chars() {
		match c {
			'*' => escaped.push_str("\\2a"),
			'(' => escaped.push_str("\\28"),
			')' => escaped.push_str("\\29"),
			'\\' => escaped.push_str("\\5c"),
			'\0' => escaped.push_str("\\00"),
			_ => escaped.push(c),
		}
	}
	escaped
}

/// Reject filters that don't parse as a well-formed LDAP filter expression.
fn validate_filter(filter: &str) -> Result<(), DirectoryError> {
	if filter.trim().is_empty() || !filter.starts_with('(') || !filter.ends_with(')') {
		return Err(DirectoryError::InvalidQuery(filter.to_owned()));
	}
	let mut depth = 0i32;
	for c in filter.chars() {
		match c {
			'(' => depth += 1,
			')' => {
				depth -= 1;
				if depth < 0 {
					return Err(DirectoryError::InvalidQuery(filter.to_owned()));
				}
			}
			_ => {}
		}
	}
	if depth != 0 {
		return Err(DirectoryError::InvalidQuery(filter.to_owned()));
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn escapes_special_characters() {
		assert_eq!(escape_filter_value("cn=a*b(c)d\\e"), "cn=a\\2ab\\28c\\29d\\5ce");
	}

	#[test]
	fn validates_balanced_parens() {
		assert!(validate_filter("(cn=g1)").is_ok());
		assert!(validate_filter("(&(cn=g1)(ou=x))").is_ok());
		assert!(validate_filter("cn=g1").is_err());
		assert!(validate_filter("(cn=g1").is_err());
		assert!(validate_filter("cn=g1)").is_err());
		assert!(validate_filter("").is_err());
	}

	#[test]
	fn and_filter_wraps_both_sides() {
		assert_eq!(and_filter("(a=1)", "(b=2)"), "(&(a=1)(b=2))");
	}
}

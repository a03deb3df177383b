//! The reconcile algorithm: a full desired-state sweep over every
//! `GuacamoleConnection` in the namespace.

use std::collections::{HashMap, HashSet};

use kube::ResourceExt;
use tracing::{debug, info, warn};

use crate::config::ServiceAccountConfig;
use crate::directory::{DirectoryClient, DirectoryRecord, WantedAttributes};
use crate::error::ReconcileError;
use crate::resource::{connection_name, partition_by_ldap_enabled, GuacamoleConnection};
use crate::store::{GatewayStore, UserAttrs};

/// Everything the reconciler needs to perform one sweep over a given set of
/// resources. Listing those resources from Kubernetes is the caller's job
/// (see [`crate::resource::ResourceSource::list`]), which keeps this type
/// testable against a hand-built resource list and no live cluster.
#[derive(Debug, Clone)]
pub struct Reconciler {
	/// Directory client for group expansion.
	directory: DirectoryClient,
	/// Gateway database handle.
	store: GatewayStore,
	/// The operator's own account, excluded from every sync/cull pass.
	service_account: ServiceAccountConfig,
	/// Attribute names to request from the directory.
	wanted_attrs: WantedAttributes,
}

/// Outcome of one reconcile sweep, used by the controller to decide on a
/// retry.
#[derive(Debug)]
pub struct ReconcileSummary {
	/// Resources whose connection was created or updated.
	pub connections_synced: usize,
	/// Resources skipped due to a per-resource error (their connection was
	/// still synced, but membership wasn't touched, and they're excluded
	/// from culling).
	pub resources_with_errors: usize,
	/// Users created, updated, or deleted this sweep.
	pub users_created: usize,
	/// Users deleted this sweep.
	pub users_deleted: usize,
	/// Connections deleted this sweep.
	pub connections_deleted: usize,
}

impl Reconciler {
	/// Construct a reconciler.
	#[must_use]
	pub fn new(
		directory: DirectoryClient,
		store: GatewayStore,
		service_account: ServiceAccountConfig,
		wanted_attrs: WantedAttributes,
	) -> Self {
		Self { directory, store, service_account, wanted_attrs }
	}

	/// Perform one full desired-state sweep over `resources`.
	pub async fn reconcile(
		&self,
		resources: &[GuacamoleConnection],
	) -> Result<ReconcileSummary, ReconcileError> {
		let mut memberships: HashMap<String, Vec<DirectoryRecord>> = HashMap::new();
		// Invalid LDAP group filter: the connection is still synced below,
		// only its membership sync is skipped.
		let mut excluded = HashSet::new();
		// Invalid resource spec: the whole resource is skipped, connection
		// included, since there's nothing sane to write for it.
		let mut skipped = HashSet::new();

		let (ldap_managed, _unmanaged) = partition_by_ldap_enabled(resources);
		for resource in ldap_managed {
			let name = connection_name(resource);
			if let Err(err) = validate_resource_spec(resource) {
				warn!(resource = %resource.name_any(), error = %err, "skipping resource with an invalid spec");
				skipped.insert(name);
				continue;
			}
			match self.directory.iterate_group_members(&resource.spec.ldap.group_filter, &self.wanted_attrs).await {
				Ok(records) => {
					memberships.insert(name, records);
				}
				Err(err) if matches!(err, crate::error::DirectoryError::InvalidQuery(_)) => {
					warn!(resource = %resource.name_any(), error = %err, "skipping resource with invalid group filter");
					excluded.insert(name);
				}
				Err(err) => return Err(ReconcileError::Directory(err)),
			}
		}

		let desired_users = unique_users(memberships.values());

		let mut txn = self.store.begin().await?;
		let mut summary = ReconcileSummary {
			connections_synced: 0,
			resources_with_errors: 0,
			users_created: 0,
			users_deleted: 0,
			connections_deleted: 0,
		};

		sync_users(&mut txn, &desired_users, &self.service_account.username, &mut summary).await?;

		let mut expected_connections = HashSet::new();
		for resource in resources {
			let name = connection_name(resource);
			if skipped.contains(&name) {
				continue;
			}
			if let Err(err) = validate_resource_spec(resource) {
				warn!(resource = %resource.name_any(), error = %err, "skipping resource with an invalid spec");
				skipped.insert(name);
				continue;
			}

			// Connection management always proceeds; only membership sync
			// is skipped below for a resource with an invalid filter.
			let parent_id = txn.resolve_parent_id("ROOT").await?;
			let id = txn
				.create_connection(
					&name,
					&resource.spec.protocol,
					parent_id,
					&resource.spec.hostname,
					&resource.spec.port.to_string(),
				)
				.await?;
			expected_connections.insert(id);
			summary.connections_synced += 1;

			if resource.spec.ldap.enabled && !excluded.contains(&name) {
				let members = memberships.get(&name).cloned().unwrap_or_default();
				sync_permissions(&mut txn, id, &members, &self.service_account.username).await?;
			}
		}

		summary.resources_with_errors = excluded.len() + skipped.len();

		if excluded.is_empty() && skipped.is_empty() {
			let observed_connections = txn.list_connections().await?;
			for (id, _) in observed_connections {
				if !expected_connections.contains(&id) {
					txn.delete_connection(id).await?;
					summary.connections_deleted += 1;
				}
			}

			let observed_users = txn.list_users().await?;
			for username in observed_users.keys() {
				if username == &self.service_account.username {
					continue;
				}
				if !desired_users.contains_key(username) {
					txn.delete_user(username, &self.service_account.username).await?;
					summary.users_deleted += 1;
				}
			}
		} else {
			info!(
				excluded = summary.resources_with_errors,
				"skipping cull this sweep because at least one resource was excluded due to a transient or invalid-spec error"
			);
		}

		txn.commit().await?;
		debug!(?summary, "reconcile sweep complete");
		Ok(summary)
	}
}

/// Sanity-check a resource's spec beyond what the CRD's own type system
/// enforces: a spec can deserialize cleanly and still be nonsensical.
fn validate_resource_spec(resource: &GuacamoleConnection) -> Result<(), ReconcileError> {
	let invalid = |reason: &str| ReconcileError::InvalidResourceSpec {
		namespace: resource.namespace().unwrap_or_default(),
		name: resource.name_any(),
		reason: reason.to_owned(),
	};
	if resource.spec.protocol.trim().is_empty() {
		return Err(invalid("protocol must not be empty"));
	}
	if resource.spec.hostname.trim().is_empty() {
		return Err(invalid("hostname must not be empty"));
	}
	if resource.spec.ldap.enabled && resource.spec.ldap.group_filter.trim().is_empty() {
		return Err(invalid("ldap.groupFilter must not be empty when ldap.enabled is true"));
	}
	Ok(())
}

/// Union the per-resource membership maps into one desired-user set,
/// keyed by username. Collisions resolve last-wins; they're not expected
/// in a well-formed directory and aren't treated as an error.
fn unique_users<'a>(
	memberships: impl Iterator<Item = &'a Vec<DirectoryRecord>>,
) -> HashMap<String, DirectoryRecord> {
	let mut result = HashMap::new();
	for records in memberships {
		for record in records {
			result.insert(record.username.clone(), record.clone());
		}
	}
	result
}

/// Create or update every desired user's attributes.
async fn sync_users(
	txn: &mut crate::store::GatewayTransaction<'_>,
	desired: &HashMap<String, DirectoryRecord>,
	service_account: &str,
	summary: &mut ReconcileSummary,
) -> Result<(), ReconcileError> {
	let observed = txn.list_users().await?;

	for (username, record) in desired {
		if username == service_account {
			// The service account is never touched by the member sync path;
			// this would only trigger if the directory itself contains an
			// entry with the same username, which is a misconfiguration.
			return Err(ReconcileError::ServiceAccountProtected(username.clone()));
		}

		let attrs = UserAttrs {
			fullname: record.fullname.clone(),
			email: record.email.clone(),
			organization: format!("MANAGED-BY: {service_account}"),
			role: "MANAGED USER".to_owned(),
		};

		match observed.get(username) {
			None => {
				txn.create_user(username, &attrs, service_account).await?;
				summary.users_created += 1;
			}
			Some(existing) if existing != &attrs => {
				txn.update_user(username, &attrs, service_account).await?;
			}
			Some(_) => {}
		}
	}

	Ok(())
}

/// Grant/revoke READ on one connection so its permission set matches
/// `members` exactly, excluding the service account from revocation.
async fn sync_permissions(
	txn: &mut crate::store::GatewayTransaction<'_>,
	connection_id: i32,
	members: &[DirectoryRecord],
	service_account: &str,
) -> Result<(), ReconcileError> {
	let desired: HashSet<&str> = members.iter().map(|r| r.username.as_str()).collect();
	let observed = txn.list_connection_users(connection_id).await?;

	for username in &desired {
		if !observed.contains(*username) {
			txn.grant(username, connection_id).await?;
		}
	}
	for username in &observed {
		if username != service_account && !desired.contains(username.as_str()) {
			txn.revoke(username, connection_id).await?;
		}
	}
	Ok(())
}

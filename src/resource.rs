//! The `GuacamoleConnection` custom resource and the watcher that tracks it.

use std::collections::BTreeMap;

use futures::StreamExt;
use kube::runtime::watcher::{self, Event};
use kube::{Api, Client, CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::ResourceSourceError;

/// Declares one gateway connection and the LDAP group that should be
/// granted access to it.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
#[kube(
	kind = "GuacamoleConnection",
	group = "guacamole.ukserp.ac.uk",
	version = "v1",
	namespaced,
	plural = "guacamoleconnections"
)]
#[kube(shortname = "gconn", doc = "A gateway connection backed by an LDAP group membership")]
#[serde(rename_all = "camelCase")]
pub struct GuacamoleConnectionSpec {
	/// The connection protocol, e.g. `"rdp"` or `"ssh"`.
	pub protocol: String,
	/// The target host.
	pub hostname: String,
	/// The target port.
	pub port: u16,
	/// Directory-membership binding for this connection.
	pub ldap: LdapBinding,
}

/// Whether and how a connection's membership is sourced from the directory.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LdapBinding {
	/// Whether membership lookup is enabled for this resource. The
	/// connection itself is still managed when this is `false`.
	pub enabled: bool,
	/// The LDAP filter selecting the group(s) whose members should be
	/// granted access, e.g. `"(cn=rdp-admins)"`.
	pub group_filter: String,
}

/// A watch-driven change to the set of `GuacamoleConnection` resources.
#[derive(Debug, Clone)]
pub enum ResourceEvent {
	/// A resource was observed for the first time.
	Added(GuacamoleConnection),
	/// A previously-tracked resource changed, or a restart revealed it was
	/// already present and may have drifted.
	Modified(GuacamoleConnection),
	/// A tracked resource is gone.
	Deleted(GuacamoleConnection),
}

/// Identity of a resource, stable across list/watch cycles.
type ResourceKey = (String, String);

fn resource_key(resource: &GuacamoleConnection) -> ResourceKey {
	(resource.namespace().unwrap_or_default(), resource.name_any())
}

/// Watches `GuacamoleConnection` resources in a namespace and emits
/// [`ResourceEvent`]s, re-listing transparently whenever the underlying
/// watch stream is invalidated (e.g. on an HTTP 410 Gone).
#[derive(Debug, Clone)]
pub struct ResourceSource {
	/// Namespaced API handle for the custom resource.
	api: Api<GuacamoleConnection>,
}

impl ResourceSource {
	/// Create a source watching `GuacamoleConnection`s in `namespace`.
	#[must_use]
	pub fn new(client: Client, namespace: &str) -> Self {
		Self { api: Api::namespaced(client, namespace) }
	}

	/// List the currently-stored resources directly, for a reconcile sweep
	/// that doesn't want to wait on the watch stream's own view.
	pub async fn list(&self) -> Result<Vec<GuacamoleConnection>, ResourceSourceError> {
		Ok(self.api.list(&kube::api::ListParams::default()).await?.items)
	}

	/// Run the watch loop forever, invoking `handler` for each event.
	///
	/// This never returns under normal operation. A watch-stream error (a
	/// failed list/watch HTTP call, or a single resource that fails to
	/// deserialize) is logged and the stream is left running rather than
	/// aborted: `kube::runtime::watcher` already retries the underlying
	/// list/watch call on its own, so one bad poll — or one malformed
	/// manifest — must not bring down the whole operator. Only a genuine
	/// invariant violation (a duplicate resource identity) is returned as
	/// fatal.
	pub async fn run<F>(&self, mut handler: F) -> Result<(), ResourceSourceError>
	where
		F: FnMut(ResourceEvent),
	{
		let mut tracked: BTreeMap<ResourceKey, GuacamoleConnection> = BTreeMap::new();
		let mut stream = Box::pin(watcher::watcher(self.api.clone(), watcher::Config::default()));

		while let Some(event) = stream.next().await {
			let event = match event {
				Ok(event) => event,
				Err(err) => {
					warn!(error = %ResourceSourceError::Unavailable(err.into()), "watch stream error, relying on the watcher's own retry");
					continue;
				}
			};
			match event {
				Event::Applied(resource) => {
					let key = resource_key(&resource);
					let is_new = !tracked.contains_key(&key);
					tracked.insert(key, resource.clone());
					if is_new {
						debug!(name = resource.name_any(), "resource added");
						handler(ResourceEvent::Added(resource));
					} else {
						debug!(name = resource.name_any(), "resource modified");
						handler(ResourceEvent::Modified(resource));
					}
				}
				Event::Deleted(resource) => {
					let key = resource_key(&resource);
					tracked.remove(&key);
					debug!(name = resource.name_any(), "resource deleted");
					handler(ResourceEvent::Deleted(resource));
				}
				Event::Restarted(listed) => {
					// List-then-reconcile against the tracked set: anything
					// listed that wasn't tracked is new, anything tracked
					// that the list didn't reconfirm is gone.
					debug!(count = listed.len(), "watch restarted, resyncing against fresh list");
					let mut fresh: BTreeMap<ResourceKey, GuacamoleConnection> = BTreeMap::new();
					for resource in listed {
						let key = resource_key(&resource);
						if let Some(previous) = fresh.insert(key.clone(), resource) {
							return Err(ResourceSourceError::DuplicateResource(format!(
								"{}/{}",
								key.0,
								previous.name_any()
							)));
						}
					}

					for (key, resource) in &fresh {
						if tracked.contains_key(key) {
							handler(ResourceEvent::Modified(resource.clone()));
						} else {
							handler(ResourceEvent::Added(resource.clone()));
						}
					}
					for (key, resource) in &tracked {
						if !fresh.contains_key(key) {
							handler(ResourceEvent::Deleted(resource.clone()));
						}
					}
					tracked = fresh;
				}
			}
		}

		warn!("watch stream ended without error; this should not happen under normal operation");
		Ok(())
	}
}

/// All `GuacamoleConnection` resources currently known, grouped by whether
/// they opted into directory-membership management.
#[must_use]
pub fn partition_by_ldap_enabled(
	resources: &[GuacamoleConnection],
) -> (Vec<&GuacamoleConnection>, Vec<&GuacamoleConnection>) {
	resources.iter().partition(|r| r.spec.ldap.enabled)
}

/// The deterministic gateway connection name for a resource, per the
/// `"{namespace}/{name} - {protocol}"` convention.
#[must_use]
pub fn connection_name(resource: &GuacamoleConnection) -> String {
	format!(
		"{}/{} - {}",
		resource.namespace().unwrap_or_default(),
		resource.name_any(),
		resource.spec.protocol
	)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn sample(namespace: &str, name: &str) -> GuacamoleConnection {
		let mut resource = GuacamoleConnection::new(
			name,
			GuacamoleConnectionSpec {
				protocol: "rdp".to_owned(),
				hostname: "host".to_owned(),
				port: 3389,
				ldap: LdapBinding { enabled: true, group_filter: "(cn=g1)".to_owned() },
			},
		);
		resource.meta_mut().namespace = Some(namespace.to_owned());
		resource
	}

	#[test]
	fn connection_name_matches_convention() {
		let resource = sample("ns", "r1");
		assert_eq!(connection_name(&resource), "ns/r1 - rdp");
	}

	#[test]
	fn partition_splits_on_ldap_enabled() {
		let mut disabled = sample("ns", "r2");
		disabled.spec.ldap.enabled = false;
		let resources = vec![sample("ns", "r1"), disabled];
		let (enabled, disabled) = partition_by_ldap_enabled(&resources);
		assert_eq!(enabled.len(), 1);
		assert_eq!(disabled.len(), 1);
	}
}

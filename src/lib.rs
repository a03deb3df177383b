//! A Kubernetes operator that reconciles `GuacamoleConnection` resources
//! against an LDAP directory and a Guacamole gateway database: for every
//! resource, the members of its declared LDAP group are granted access to
//! its declared connection, and anything no longer referenced is cleaned
//! up.

pub mod config;
pub mod controller;
pub mod directory;
pub mod error;
pub mod reconcile;
pub mod resource;
pub mod store;

pub use config::Config;
pub use controller::Controller;

/// Run the operator to completion (which, barring a fatal error, is never).
pub async fn run(config: Config) -> anyhow::Result<()> {
	Controller::new(config).run().await
}

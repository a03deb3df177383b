#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::collections::HashSet;

use guacamole_connection_operator::config::DirectoryConfig;
use guacamole_connection_operator::directory::{DirectoryClient, WantedAttributes};
use guacamole_connection_operator::store::UserAttrs;
use ldap3::LdapConnAsync;
use sqlx::PgPool;
use test_log::test;
use testcontainers::runners::AsyncRunner;

mod support;
use support::db::gateway_store;
use support::openldap::OpenLDAP;

const BASE_DN: &str = "dc=example,dc=org";

#[test(tokio::test)]
async fn service_account_bootstrap_is_idempotent() {
	let (store, url, _container) = gateway_store().await;

	store.create_service_account("operator", "hunter2").await.expect("first bootstrap");
	store.create_service_account("operator", "hunter2").await.expect("second bootstrap");

	// The store's own pool is private, so assert through a second connection
	// to the same throwaway database rather than reaching into its internals.
	let pool = PgPool::connect(&url).await.expect("second connection");
	let count: (i64,) =
		sqlx::query_as("SELECT count(*) FROM guacamole_entity WHERE name = 'operator'")
			.fetch_one(&pool)
			.await
			.expect("count query");
	assert_eq!(count.0, 1);
}

#[test(tokio::test)]
async fn user_lifecycle_create_grant_revoke_delete() {
	let (store, _url, _container) = gateway_store().await;
	store.create_service_account("operator", "hunter2").await.expect("bootstrap");

	let mut txn = store.begin().await.expect("begin");

	let attrs = UserAttrs {
		fullname: Some("Alice Example".to_owned()),
		email: Some("alice@example.org".to_owned()),
		organization: "MANAGED-BY: operator".to_owned(),
		role: "MANAGED USER".to_owned(),
	};
	txn.create_user("alice", &attrs, "operator").await.expect("create_user");

	let conn_id = txn
		.create_connection("ns/r1 - rdp", "rdp", None, "10.0.0.5", "3389")
		.await
		.expect("create_connection");
	txn.grant("alice", conn_id).await.expect("grant");

	let members = txn.list_connection_users(conn_id).await.expect("list_connection_users");
	assert_eq!(members, HashSet::from(["alice".to_owned()]));

	txn.revoke("alice", conn_id).await.expect("revoke");
	let members = txn.list_connection_users(conn_id).await.expect("list_connection_users after revoke");
	assert!(members.is_empty());

	txn.delete_user("alice", "operator").await.expect("delete_user");
	let users = txn.list_users().await.expect("list_users after delete");
	assert!(!users.contains_key("alice"));

	txn.commit().await.expect("commit");
}

#[test(tokio::test)]
async fn service_account_is_protected_from_user_mutations() {
	let (store, _url, _container) = gateway_store().await;
	store.create_service_account("operator", "hunter2").await.expect("bootstrap");

	let mut txn = store.begin().await.expect("begin");
	let attrs = UserAttrs {
		fullname: None,
		email: None,
		organization: "MANAGED-BY: operator".to_owned(),
		role: "MANAGED USER".to_owned(),
	};
	let result = txn.create_user("operator", &attrs, "operator").await;
	assert!(result.is_err(), "creating a user with the service account's name must be refused");
}

#[test(tokio::test)]
#[test_log(default_log_filter = "debug")]
async fn group_expansion_breaks_cycles_and_dedups() {
	let ldap_image = OpenLDAP::default()
		.with_allow_anon_binding(true)
		.with_user("alice", "pw1")
		.with_user("bob", "pw2");
	let node = ldap_image.start().await.expect("openldap container should start");
	let port = node.get_host_port_ipv4(1389).await.expect("openldap should expose 1389");
	let url = format!("ldap://127.0.0.1:{port}");

	seed_nested_groups(&url).await;

	let config = DirectoryConfig {
		url: url.parse().expect("valid ldap url"),
		bind_dn: String::new(),
		bind_password: String::new(),
		user_base: format!("ou=users,{BASE_DN}"),
		user_filter: "(objectClass=inetOrgPerson)".to_owned(),
		username_attr: "cn".to_owned(),
		fullname_attr: "cn".to_owned(),
		email_attr: "mail".to_owned(),
		group_base: format!("ou=groups,{BASE_DN}"),
		group_filter: "(objectClass=groupOfNames)".to_owned(),
		member_attr: "member".to_owned(),
		page_size: 100,
	};
	let client = DirectoryClient::new(config);
	let wanted = WantedAttributes {
		username_attr: "cn".to_owned(),
		fullname_attr: "cn".to_owned(),
		email_attr: "mail".to_owned(),
	};

	let members = client
		.iterate_group_members("(cn=g1)", &wanted)
		.await
		.expect("group expansion should succeed despite the g1<->g2 cycle");

	let usernames: HashSet<_> = members.into_iter().map(|m| m.username).collect();
	assert_eq!(usernames, HashSet::from(["bob".to_owned()]));
}

/// Seed `ou=groups` with `g1 -> {g2}`, `g2 -> {g1, bob}`, i.e. a two-cycle
/// with a single real user hanging off the far side.
async fn seed_nested_groups(url: &str) {
	let (conn, mut ldap) = LdapConnAsync::new(url).await.expect("ldap connection");
	ldap3::drive!(conn);

	for ou in ["users", "groups"] {
		let _ = ldap
			.add(
				&format!("ou={ou},{BASE_DN}"),
				vec![("objectClass", HashSet::from(["organizationalUnit"])), ("ou", HashSet::from([ou]))],
			)
			.await;
	}

	let g1_dn = format!("cn=g1,ou=groups,{BASE_DN}");
	let g2_dn = format!("cn=g2,ou=groups,{BASE_DN}");
	let bob_dn = format!("cn=bob,ou=users,{BASE_DN}");

	ldap.add(
		&g2_dn,
		vec![
			("objectClass", HashSet::from(["groupOfNames"])),
			("cn", HashSet::from(["g2"])),
			("member", HashSet::from([g1_dn.as_str(), bob_dn.as_str()])),
		],
	)
	.await
	.expect("create g2")
	.success()
	.expect("create g2 should succeed");

	ldap.add(
		&g1_dn,
		vec![
			("objectClass", HashSet::from(["groupOfNames"])),
			("cn", HashSet::from(["g1"])),
			("member", HashSet::from([g2_dn.as_str()])),
		],
	)
	.await
	.expect("create g1")
	.success()
	.expect("create g1 should succeed");

	ldap.unbind().await.expect("unbind");
}

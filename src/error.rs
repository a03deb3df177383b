//! Error kinds shared across the operator's components.

/// Errors raised while talking to the directory service.
#[derive(thiserror::Error, Debug)]
pub enum DirectoryError {
	/// The bind or an underlying search failed to even talk to the server.
	#[error("directory service unavailable: {0}")]
	Unavailable(#[from] ldap3::LdapError),
	/// A caller-supplied filter failed to parse.
	#[error("invalid directory query: {0}")]
	InvalidQuery(String),
	/// A search result was missing a required attribute.
	#[error("directory entry {dn} missing attribute `{attribute}`")]
	MissingAttribute {
		/// The distinguished name of the offending entry.
		dn: String,
		/// The attribute that was expected.
		attribute: String,
	},
}

/// Errors raised while talking to the gateway database.
#[derive(thiserror::Error, Debug)]
pub enum GatewayStoreError {
	/// The database connection or a query against it failed.
	#[error("gateway database unavailable: {0}")]
	Unavailable(#[from] sqlx::Error),
	/// The requested user does not exist.
	#[error("no such gateway user: {0}")]
	UserNotFound(String),
	/// The requested connection does not exist.
	#[error("no such gateway connection: {0}")]
	ConnectionNotFound(String),
	/// Something tried to mutate the operator's own service account through
	/// the ordinary user-management entry points.
	#[error("refusing to modify the protected service account `{0}`")]
	ServiceAccountCollision(String),
}

/// Errors raised by the resource watcher.
#[derive(thiserror::Error, Debug)]
pub enum ResourceSourceError {
	/// The Kubernetes API could not be reached or rejected a request.
	#[error("kubernetes api unavailable: {0}")]
	Unavailable(#[from] kube::Error),
	/// The initial list and the in-memory tracked set both claimed the same
	/// resource identity, which can only happen if the API server returned
	/// duplicate objects.
	#[error("duplicate resource identity observed: {0}")]
	DuplicateResource(String),
}

/// Errors raised while computing or applying a reconcile.
#[derive(thiserror::Error, Debug)]
pub enum ReconcileError {
	/// A resource's spec could not be interpreted (missing/invalid fields).
	#[error("invalid resource spec for {namespace}/{name}: {reason}")]
	InvalidResourceSpec {
		/// The resource's namespace.
		namespace: String,
		/// The resource's name.
		name: String,
		/// Why the spec was rejected.
		reason: String,
	},
	/// The directory service could not be reached; the whole reconcile
	/// aborts and is retried later.
	#[error(transparent)]
	Directory(#[from] DirectoryError),
	/// The gateway database could not be reached, or a write failed.
	#[error(transparent)]
	Store(#[from] GatewayStoreError),
	/// Listing the resources to reconcile failed.
	#[error(transparent)]
	Resources(#[from] ResourceSourceError),
	/// The reconciler tried to create, update, or delete the service
	/// account through the normal user-sync path. This is always a
	/// programming error: the service account must be filtered out of the
	/// desired-user set before it reaches this point.
	#[error("reconcile attempted to mutate the protected service account `{0}`")]
	ServiceAccountProtected(String),
}

impl ReconcileError {
	/// Whether this error should trigger a fixed-delay retry rather than
	/// propagating as fatal.
	#[must_use]
	pub fn is_transient(&self) -> bool {
		matches!(
			self,
			Self::Directory(DirectoryError::Unavailable(_))
				| Self::Store(GatewayStoreError::Unavailable(_))
				| Self::Resources(ResourceSourceError::Unavailable(_))
		)
	}
}

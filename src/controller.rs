//! Top-level lifecycle: bootstrap, own the resource watch, and serialize
//! reconciles triggered by events or the periodic timer.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use kube::Client;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::directory::{DirectoryClient, WantedAttributes};
use crate::reconcile::Reconciler;
use crate::resource::ResourceSource;
use crate::store::GatewayStore;

/// How often the controller reconciles even without a watch event, to
/// repair drift the watch can't see (e.g. a row edited out of band).
const PERIODIC_INTERVAL: Duration = Duration::from_secs(300);

/// Fixed backoff applied after a reconcile that failed transiently.
const RETRY_BACKOFF: Duration = Duration::from_secs(60);

/// Runs the operator: bootstrap, then an event loop that collapses
/// concurrent triggers into at most one queued follow-up reconcile.
#[derive(Debug)]
pub struct Controller {
	/// Loaded configuration.
	config: Config,
}

impl Controller {
	/// Build a controller from configuration.
	#[must_use]
	pub fn new(config: Config) -> Self {
		Self { config }
	}

	/// Run the operator until a fatal error occurs.
	pub async fn run(self) -> Result<()> {
		let store = GatewayStore::connect(&self.config.database.connection_url())
			.await
			.context("failed to connect to the gateway database")?;

		info!("asserting operator service account");
		store
			.create_service_account(
				&self.config.service_account.username,
				&self.config.service_account.password,
			)
			.await
			.context("failed to bootstrap the operator's service account")?;

		let directory = DirectoryClient::new(self.config.directory.clone());
		let wanted_attrs = WantedAttributes {
			username_attr: self.config.directory.username_attr.clone(),
			fullname_attr: self.config.directory.fullname_attr.clone(),
			email_attr: self.config.directory.email_attr.clone(),
		};

		let client = Client::try_default().await.context("failed to build kubernetes client")?;
		let reconciler =
			Arc::new(Reconciler::new(directory, store, self.config.service_account.clone(), wanted_attrs));

		let source = ResourceSource::new(client, &self.config.namespace);
		let (trigger_tx, trigger_rx) = mpsc::unbounded_channel::<()>();
		let retry_tx = trigger_tx.clone();

		let watch_handle = {
			let trigger_tx = trigger_tx.clone();
			let watch_source = source.clone();
			tokio::spawn(async move {
				watch_source
					.run(move |_event| {
						// Every event collapses to the same whole-namespace
						// reconcile trigger; the watcher has already done the
						// work of turning API churn into a debounced signal.
						let _ = trigger_tx.send(());
					})
					.await
			})
		};

		let timer_handle = {
			let trigger_tx = trigger_tx.clone();
			tokio::spawn(async move {
				let mut interval = tokio::time::interval(PERIODIC_INTERVAL);
				loop {
					interval.tick().await;
					let _ = trigger_tx.send(());
				}
			})
		};
		drop(trigger_tx);

		let reconcile_loop = reconcile_loop(reconciler, source, trigger_rx, retry_tx);

		tokio::select! {
			result = watch_handle => {
				result.context("resource watch task panicked")?
					.context("resource watch failed fatally")?;
			}
			() = reconcile_loop => {
				unreachable!("reconcile loop runs forever");
			}
		}

		timer_handle.abort();
		Ok(())
	}
}

/// Drain reconcile triggers, collapsing any that arrive while a reconcile
/// is in flight into at most one queued follow-up (the "dirty bit"). A
/// transient failure re-enqueues itself after a fixed backoff via
/// `retry_tx`.
async fn reconcile_loop(
	reconciler: Arc<Reconciler>,
	source: ResourceSource,
	mut triggers: mpsc::UnboundedReceiver<()>,
	retry_tx: mpsc::UnboundedSender<()>,
) {
	loop {
		if triggers.recv().await.is_none() {
			warn!("all trigger senders dropped; reconcile loop exiting");
			return;
		}

		// Drain any triggers that piled up while we weren't looking; they
		// all collapse into the one sweep we're about to run.
		while triggers.try_recv().is_ok() {}

		let outcome = match source.list().await {
			Ok(resources) => reconciler.reconcile(&resources).await,
			Err(err) => Err(err.into()),
		};

		match outcome {
			Ok(summary) => {
				info!(?summary, "reconcile succeeded");
			}
			Err(err) if err.is_transient() => {
				warn!(
					error = %err,
					backoff_secs = RETRY_BACKOFF.as_secs(),
					"transient reconcile failure, retrying after backoff"
				);
				let retry_tx = retry_tx.clone();
				tokio::spawn(async move {
					tokio::time::sleep(RETRY_BACKOFF).await;
					let _ = retry_tx.send(());
				});
			}
			Err(err) => {
				error!(error = %err, "non-recoverable reconcile failure");
			}
		}
	}
}

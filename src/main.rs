//! Guacamole connection operator entrypoint.
use std::path::Path;
use std::process::ExitCode;
use std::str::FromStr;

use anyhow::Context;
use guacamole_connection_operator::{run, Config};
use tracing::level_filters::LevelFilter;

/// Env var naming a YAML config file to load instead of reading every field
/// from its own environment variable.
const CONFIG_PATH_VAR: &str = "GUACAMOLE_OPERATOR_CONFIG";

#[tokio::main]
async fn main() -> ExitCode {
	match load_config_and_run().await {
		Ok(()) => ExitCode::SUCCESS,
		Err(e) => {
			tracing::error!("{}", e);
			ExitCode::FAILURE
		}
	}
}

/// Load configuration, set up logging, and run. If `GUACAMOLE_OPERATOR_CONFIG`
/// names a file, it's loaded from there; otherwise configuration is assembled
/// from individual environment variables.
async fn load_config_and_run() -> anyhow::Result<()> {
	let config = match std::env::var(CONFIG_PATH_VAR) {
		Ok(path) => Config::from_file(Path::new(&path))
			.await
			.with_context(|| format!("failed to load configuration from {path}"))?,
		Err(_) => Config::from_env().context("failed to load configuration from the environment")?,
	};

	let subscriber = tracing_subscriber::FmtSubscriber::builder()
		.with_max_level(LevelFilter::from_str(&config.log_level).unwrap_or(LevelFilter::DEBUG))
		.finish();
	tracing::subscriber::set_global_default(subscriber)
		.context("Setting default tracing subscriber failed")?;

	run(config).await
}

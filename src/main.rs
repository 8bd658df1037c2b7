pub(crate) mod config;
pub(crate) mod dimse;
pub(crate) mod emr;
pub(crate) mod mpps;
pub(crate) mod orders;
pub(crate) mod service;
pub(crate) mod store;
pub(crate) mod sync;
pub(crate) mod transliterate;
pub(crate) mod types;
pub(crate) mod worklist;

use crate::config::{AppConfig, ModalityDevices};
use crate::dimse::WorklistServiceClassProvider;
use crate::emr::EmrOrderSource;
use crate::orders::OrderSource;
use crate::service::WorklistService;
use crate::store::Store;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, level_filters::LevelFilter, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

fn init_logger(level: tracing::Level) {
	tracing_subscriber::registry()
		.with(
			tracing_subscriber::fmt::layer()
				.compact()
				.with_ansi(true)
				.with_file(false)
				.with_line_number(false)
				.with_target(false),
		)
		.with(
			EnvFilter::builder()
				.with_default_directive(LevelFilter::from_level(level).into())
				.from_env_lossy(),
		)
		.with(sentry::integrations::tracing::layer())
		.init();
}

fn init_sentry(config: &AppConfig) -> sentry::ClientInitGuard {
	let guard = sentry::init((
		// An empty string will disable Sentry
		config.telemetry.sentry.as_deref().unwrap_or_default(),
		sentry::ClientOptions {
			release: sentry::release_name!(),
			traces_sample_rate: 1.0,
			..Default::default()
		},
	));

	if let Some(dsn) = &config.telemetry.sentry {
		info!(dsn, "Enabled Sentry for tracing and error tracking");
	};

	guard
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
	let config = AppConfig::new()?;
	init_logger(config.telemetry.level);

	// Manually create the Tokio runtime because the Sentry client needs to be created *before* the
	// Tokio runtime, which prevents us from using the #[tokio::main] macro.
	// See https://docs.sentry.io/platforms/rust/#async-main-function
	let _sentry = init_sentry(&config);

	tokio::runtime::Builder::new_multi_thread()
		.enable_all()
		.build()?
		.block_on(async move {
			if let Err(error) = run(config).await {
				error!("Failed to start application due to error: {error}");
			}
		});
	Ok(())
}

async fn run(config: AppConfig) -> anyhow::Result<()> {
	let store = Store::open(&config.store).await?;

	let devices = ModalityDevices::from_env();
	if devices.is_empty() {
		warn!(
			"No {}<MODALITY> variables set, scheduled items get no station AE title",
			ModalityDevices::ENV_PREFIX
		);
	}
	let modalities = devices.len();
	let stations = store.replace_modality_devices(devices).await?;
	info!(modalities, stations, "Loaded modality station AE titles");

	let source = config.orders.as_ref().map(|orders| {
		info!(
			host = %orders.host,
			port = orders.port,
			database = %orders.database,
			"Pulling orders from the EMR database"
		);
		Arc::new(EmrOrderSource::new(orders)) as Arc<dyn OrderSource>
	});
	let service = Arc::new(WorklistService::new(store, source));
	let (shutdown_tx, shutdown_rx) = watch::channel(false);

	let sync = match service.sync_engine() {
		Some(engine) => Some(tokio::spawn(engine.run(config.sync, shutdown_rx.clone()))),
		None => {
			warn!("No order source configured, order synchronization is disabled");
			None
		}
	};

	let scp = WorklistServiceClassProvider::new(Arc::clone(&service), config.server.clone());
	let scp_shutdown = shutdown_rx.clone();
	let scp = tokio::spawn(async move {
		if let Err(err) = scp.spawn(scp_shutdown).await {
			error!("Failed to spawn WORKLIST-SCP: {err}");
			// Unrecoverable error - exit the process
			std::process::exit(-1);
		}
	});

	shutdown_signal().await;
	info!("Received shutdown signal, stopping");
	// All receivers may already be gone if every task has finished.
	let _ = shutdown_tx.send(true);

	if let Err(err) = scp.await {
		error!("WORKLIST-SCP task failed: {err}");
	}
	if let Some(sync) = sync {
		if let Err(err) = sync.await {
			error!("Order synchronization task failed: {err}");
		}
	}

	Ok(())
}

async fn shutdown_signal() {
	let ctrl_c = async {
		if let Err(err) = signal::ctrl_c().await {
			error!("Failed to listen for Ctrl+C: {err}");
			std::future::pending::<()>().await;
		}
	};

	#[cfg(unix)]
	let terminate = async {
		match signal::unix::signal(signal::unix::SignalKind::terminate()) {
			Ok(mut terminate) => {
				terminate.recv().await;
			}
			Err(err) => {
				error!("Failed to listen for SIGTERM: {err}");
				std::future::pending::<()>().await;
			}
		}
	};

	#[cfg(not(unix))]
	let terminate = std::future::pending::<()>();

	tokio::select! {
		() = ctrl_c => {},
		() = terminate => {},
	}
}

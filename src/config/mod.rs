use crate::types::AE;
use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter};
use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::Level;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
	pub telemetry: TelemetryConfig,
	pub server: ServerConfig,
	pub store: StoreConfig,
	pub sync: SyncConfig,
	/// Connection to the EMR database. Order synchronization is disabled without it.
	pub orders: Option<OrdersConfig>,
}

impl AppConfig {
	pub fn new() -> Result<Self, config::ConfigError> {
		use config::Config;
		let s = Config::builder()
			.add_source(config::File::from_str(
				include_str!("defaults.toml"),
				config::FileFormat::Toml,
			))
			.add_source(config::File::with_name("config.toml").required(false))
			.add_source(config::Environment::with_prefix("DICOM_MWL").separator("_"))
			.build()?;

		s.try_deserialize()
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
	// Also configurable via env vars RUST_LOG and DICOM_MWL_TELEMETRY_LEVEL
	#[serde(deserialize_with = "deserialize_level")]
	pub level: Level,
	/// Sentry DSN. Sentry stays disabled if absent.
	pub sentry: Option<String>,
}

fn deserialize_level<'de, D>(deserializer: D) -> Result<Level, D::Error>
where
	D: Deserializer<'de>,
{
	let value = String::deserialize(deserializer)?;
	Level::from_str(&value).map_err(serde::de::Error::custom)
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
	/// The application entity title this provider advertises.
	pub aet: AE,
	pub interface: IpAddr,
	pub port: u16,
	/// Timeout in milliseconds for writing a single DIMSE message.
	pub timeout: u64,
}

impl ServerConfig {
	pub const fn write_timeout(&self) -> Duration {
		Duration::from_millis(self.timeout)
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
	/// Location of the SQLite database file.
	pub path: PathBuf,
	/// Maximum number of pooled connections.
	pub connections: usize,
	/// Timeout in milliseconds for acquiring a pooled connection.
	pub timeout: u64,
}

/// Schedule of the background order synchronization. All values are seconds.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct SyncConfig {
	/// Grace period before the first run.
	pub delay: u64,
	/// Pause between two successful runs.
	pub interval: u64,
	/// Pause after a failed run.
	pub backoff: u64,
}

/// SQL Server database of the EMR that holds the orders.
#[derive(Clone, Deserialize)]
pub struct OrdersConfig {
	pub host: String,
	#[serde(default = "default_orders_port")]
	pub port: u16,
	pub database: String,
	pub user: String,
	pub password: String,
	/// Number of orders pulled by the first synchronization, when no order was seen yet.
	#[serde(default = "default_orders_batch")]
	pub batch: u32,
	/// Require TLS. The server certificate is trusted as presented.
	#[serde(default)]
	pub encrypt: bool,
}

impl Debug for OrdersConfig {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("OrdersConfig")
			.field("host", &self.host)
			.field("port", &self.port)
			.field("database", &self.database)
			.field("user", &self.user)
			.field("batch", &self.batch)
			.field("encrypt", &self.encrypt)
			.finish_non_exhaustive()
	}
}

const fn default_orders_port() -> u16 {
	1433
}

const fn default_orders_batch() -> u32 {
	5
}

/// Candidate station AE titles per modality, seeded from `MODALITY_AET_<MODALITY>` variables.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModalityDevices(BTreeMap<String, Vec<AE>>);

impl ModalityDevices {
	pub const ENV_PREFIX: &'static str = "MODALITY_AET_";

	pub fn from_env() -> Self {
		Self::from_vars(std::env::vars())
	}

	pub fn from_vars(vars: impl IntoIterator<Item = (String, String)>) -> Self {
		let mut devices = BTreeMap::new();
		for (key, value) in vars {
			let Some(modality) = key.strip_prefix(Self::ENV_PREFIX) else {
				continue;
			};
			let modality = modality.trim();
			if modality.is_empty() {
				continue;
			}
			let aets: Vec<AE> = value
				.split(',')
				.map(str::trim)
				.filter(|aet| !aet.is_empty())
				.map(AE::from)
				.collect();
			devices.insert(modality.to_owned(), aets);
		}
		Self(devices)
	}

	pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<AE>)> {
		self.0.iter()
	}

	pub fn len(&self) -> usize {
		self.0.len()
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}
}

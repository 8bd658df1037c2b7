//! SQLite-backed persistence for patients, worklist items, performed procedure steps and the
//! modality to station AE title mapping.
//!
//! Every public operation checks out a pooled connection, runs on Tokio's blocking thread pool
//! and returns the connection once the operation finishes, regardless of its outcome.

pub mod models;
mod pool;
pub mod queries;

use crate::config::{ModalityDevices, StoreConfig};
use crate::types::UI;
use chrono::NaiveDateTime;
use models::{ItemFilter, ScheduledRow, StartedStep, StepTransition};
#[cfg(test)]
use {
	crate::types::AE,
	models::{Patient, ProcedureStep, WorklistItem},
};
use pool::{Manager, Pool};
pub use pool::PoolError;
use rusqlite::{Connection, Transaction, TransactionBehavior};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, instrument, trace};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const MIGRATIONS: &[(i64, &str)] = &[(1, include_str!("migrations/001_initial.sql"))];

#[derive(Debug, Error)]
pub enum StoreError {
	#[error("SQLite error: {0}")]
	Sqlite(#[from] rusqlite::Error),
	#[error("Failed to acquire a connection: {0}")]
	Pool(#[from] PoolError<rusqlite::Error>),
	#[error("Migration failed at version {version}: {reason}")]
	MigrationFailed { version: i64, reason: String },
	#[error("Invalid value in column {column}: {value}")]
	InvalidValue { column: &'static str, value: String },
	#[error("Store operation was aborted: {0}")]
	Task(#[from] tokio::task::JoinError),
	#[error(transparent)]
	Io(#[from] std::io::Error),
}

struct SqliteManager {
	path: PathBuf,
}

impl Manager for SqliteManager {
	type Object = Connection;
	type Error = rusqlite::Error;

	async fn create(&self) -> Result<Self::Object, PoolError<Self::Error>> {
		let conn = Connection::open(&self.path)?;
		conn.busy_timeout(BUSY_TIMEOUT)?;
		conn.execute_batch(
			"PRAGMA journal_mode=WAL;
			 PRAGMA foreign_keys=ON;",
		)?;
		Ok(conn)
	}

	async fn recycle(&self, conn: &mut Self::Object) -> Result<(), String> {
		conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
			.map(|_| ())
			.map_err(|err| format!("Connection is no longer usable: {err}"))
	}
}

#[derive(Clone)]
pub struct Store {
	pool: Pool<SqliteManager>,
}

impl Store {
	/// Opens (and creates, if necessary) the database and applies pending migrations.
	pub async fn open(config: &StoreConfig) -> Result<Self, StoreError> {
		if let Some(parent) = config.path.parent() {
			if !parent.as_os_str().is_empty() {
				std::fs::create_dir_all(parent)?;
			}
		}

		let manager = SqliteManager {
			path: config.path.clone(),
		};
		let store = Self {
			pool: Pool::new(
				manager,
				config.connections.max(1),
				Duration::from_millis(config.timeout),
			),
		};

		store.with_connection(|conn| run_migrations(conn)).await?;
		info!(path = %config.path.display(), "Opened worklist store");
		Ok(store)
	}

	async fn with_connection<T, F>(&self, f: F) -> Result<T, StoreError>
	where
		T: Send + 'static,
		F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
	{
		let mut connection = self.pool.get().await?;
		trace!(
			recycled = connection.metrics().map(|metrics| metrics.recycle_count),
			"Checked out store connection"
		);
		tokio::task::spawn_blocking(move || f(&mut connection)).await?
	}

	/// Runs `f` inside a single write transaction. The transaction is committed if `f`
	/// succeeds and rolled back otherwise.
	pub async fn write<T, F>(&self, f: F) -> Result<T, StoreError>
	where
		T: Send + 'static,
		F: FnOnce(&mut Transaction<'_>) -> Result<T, StoreError> + Send + 'static,
	{
		self.with_connection(|conn| {
			let mut tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
			let value = f(&mut tx)?;
			tx.commit()?;
			Ok(value)
		})
		.await
	}

	/// Replaces the whole modality to station AE title mapping.
	#[instrument(skip_all)]
	pub async fn replace_modality_devices(
		&self,
		devices: ModalityDevices,
	) -> Result<usize, StoreError> {
		self.write(move |tx| queries::replace_modality_devices(tx, &devices))
			.await
	}

	#[cfg(test)]
	pub async fn devices_for_modality(&self, modality: &str) -> Result<Vec<AE>, StoreError> {
		let modality = modality.to_owned();
		self.with_connection(move |conn| queries::devices_for_modality(conn, &modality))
			.await
	}

	/// The highest order sequence number absorbed so far.
	pub async fn latest_order_seq(&self) -> Result<Option<i64>, StoreError> {
		self.with_connection(|conn| queries::latest_order_seq(conn))
			.await
	}

	pub async fn scheduled_items(&self, filter: ItemFilter) -> Result<Vec<ScheduledRow>, StoreError> {
		self.with_connection(move |conn| queries::scheduled_items(conn, &filter))
			.await
	}

	pub async fn set_study_instance_uid(
		&self,
		accession_number: &str,
		study_instance_uid: &str,
	) -> Result<bool, StoreError> {
		let accession_number = accession_number.to_owned();
		let study_instance_uid = UI::from(study_instance_uid);
		self.write(move |tx| {
			queries::set_study_instance_uid(tx, &accession_number, &study_instance_uid)
		})
		.await
	}

	pub async fn record_step_started(
		&self,
		step: StartedStep,
	) -> Result<Option<StepTransition>, StoreError> {
		self.write(move |tx| queries::record_step_started(tx, &step))
			.await
	}

	pub async fn record_step_completed(
		&self,
		sop_instance_uid: &str,
		end_time: NaiveDateTime,
	) -> Result<Option<StepTransition>, StoreError> {
		let sop_instance_uid = UI::from(sop_instance_uid);
		self.write(move |tx| queries::record_step_completed(tx, &sop_instance_uid, end_time))
			.await
	}

	#[cfg(test)]
	pub async fn worklist_item(
		&self,
		accession_number: &str,
	) -> Result<Option<WorklistItem>, StoreError> {
		let accession_number = accession_number.to_owned();
		self.with_connection(move |conn| queries::worklist_item(conn, &accession_number))
			.await
	}

	#[cfg(test)]
	pub async fn patient(&self, patient_id: &str) -> Result<Option<Patient>, StoreError> {
		let patient_id = patient_id.to_owned();
		self.with_connection(move |conn| queries::find_patient(conn, &patient_id))
			.await
	}

	#[cfg(test)]
	pub async fn procedure_step(
		&self,
		sop_instance_uid: &str,
	) -> Result<Option<ProcedureStep>, StoreError> {
		let sop_instance_uid = UI::from(sop_instance_uid);
		self.with_connection(move |conn| queries::procedure_step(conn, &sop_instance_uid))
			.await
	}

	#[cfg(test)]
	pub async fn procedure_steps_for_accession(
		&self,
		accession_number: &str,
	) -> Result<Vec<ProcedureStep>, StoreError> {
		let accession_number = accession_number.to_owned();
		self.with_connection(move |conn| {
			queries::procedure_steps_for_accession(conn, &accession_number)
		})
		.await
	}
}

fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
	let current_version = current_schema_version(conn);

	for (version, sql) in MIGRATIONS {
		if *version > current_version {
			info!("Running migration v{version}");
			conn.execute_batch(sql)
				.map_err(|err| StoreError::MigrationFailed {
					version: *version,
					reason: err.to_string(),
				})?;
		}
	}
	Ok(())
}

/// 0 if no schema exists yet.
fn current_schema_version(conn: &Connection) -> i64 {
	conn.query_row("SELECT MAX(version) FROM schema_version", [], |row| {
		row.get::<_, Option<i64>>(0)
	})
	.ok()
	.flatten()
	.unwrap_or(0)
}

//! Synchronization of the worklist with the external order system.

use crate::config::SyncConfig;
use crate::orders::{Order, OrderSource, OrderSourceError, OrderTimestamp, DEFAULT_MODALITY};
use crate::orders::ORDER_TIMESTAMP_FORMAT;
use crate::store::models::{Patient, WorklistItem};
use crate::store::{queries, Store, StoreError};
use crate::transliterate::transliterate;
use crate::types::{ItemStatus, DA, TM};
use chrono::{Local, NaiveDateTime};
use rusqlite::{Connection, Transaction};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, instrument, warn};

#[derive(Debug, Error)]
pub enum SyncError {
	#[error(transparent)]
	Store(#[from] StoreError),
	#[error("Failed to fetch orders: {0}")]
	Source(#[from] OrderSourceError),
}

/// Pulls new orders from an [`OrderSource`] into the worklist store.
///
/// Overlapping calls to [`SyncEngine::sync`] are serialized, so two concurrent runs never
/// derive the same cursor.
pub struct SyncEngine {
	store: Store,
	source: Arc<dyn OrderSource>,
	running: Mutex<()>,
}

impl SyncEngine {
	pub fn new(store: Store, source: Arc<dyn OrderSource>) -> Self {
		Self {
			store,
			source,
			running: Mutex::new(()),
		}
	}

	/// Absorbs all orders newer than the current cursor and returns the number of worklist
	/// items created.
	#[instrument(skip_all)]
	pub async fn sync(&self) -> Result<usize, SyncError> {
		let _running = self.running.lock().await;

		let cursor = self.store.latest_order_seq().await?;
		debug!(?cursor, "Last processed order sequence");

		let orders = self.source.fetch_new_orders(cursor).await?;
		if orders.is_empty() {
			debug!("No new orders");
			return Ok(0);
		}
		info!("Fetched {} new orders", orders.len());

		let created = self
			.store
			.write(move |tx| absorb_orders(tx, &orders))
			.await?;
		if created > 0 {
			info!(created, "Added new orders to the worklist");
		}
		Ok(created)
	}

	/// Runs [`SyncEngine::sync`] periodically until `shutdown` turns `true` or its sender is
	/// dropped. Failed runs are logged and retried after the backoff pause.
	pub async fn run(self: Arc<Self>, schedule: SyncConfig, mut shutdown: watch::Receiver<bool>) {
		info!("Starting background order synchronization");

		let mut pause = Duration::from_secs(schedule.delay);
		while wait_or_shutdown(pause, &mut shutdown).await {
			pause = match self.sync().await {
				Ok(_) => Duration::from_secs(schedule.interval),
				Err(err) => {
					error!("Background order synchronization failed: {err}");
					Duration::from_secs(schedule.backoff)
				}
			};
		}

		info!("Stopped background order synchronization");
	}
}

/// Sleeps for `duration`. Returns `false` if shutdown was signalled before or during the wait.
async fn wait_or_shutdown(duration: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
	if *shutdown.borrow_and_update() {
		return false;
	}
	tokio::select! {
		() = tokio::time::sleep(duration) => true,
		changed = shutdown.changed() => changed.is_ok() && !*shutdown.borrow(),
	}
}

/// An order with all mandatory fields present.
struct ValidOrder<'a> {
	order_seq: i64,
	chart_number: &'a str,
	patient_name: &'a str,
	ordered_at: &'a OrderTimestamp,
	modality: &'a str,
	birth_date: &'a str,
	sex: &'a str,
}

impl<'a> ValidOrder<'a> {
	fn new(order: &'a Order) -> Option<Self> {
		let present = |value: &'a Option<String>| {
			value
				.as_deref()
				.map(str::trim)
				.filter(|value| !value.is_empty())
		};

		Some(Self {
			order_seq: order.order_seq?,
			chart_number: present(&order.chart_number)?,
			patient_name: present(&order.patient_name)?,
			ordered_at: order.ordered_at.as_ref()?,
			modality: present(&order.unit_code).unwrap_or(DEFAULT_MODALITY),
			birth_date: order.birth_date.as_deref().unwrap_or_default(),
			sex: order.sex.as_deref().unwrap_or_default(),
		})
	}
}

/// Accession numbers are the order sequence, zero-padded to eight digits.
pub fn accession_number(order_seq: i64) -> String {
	format!("{order_seq:08}")
}

fn appointment(ordered_at: &OrderTimestamp, now: NaiveDateTime) -> (DA, TM) {
	let timestamp = match ordered_at {
		OrderTimestamp::DateTime(timestamp) => *timestamp,
		OrderTimestamp::Text(text) => {
			NaiveDateTime::parse_from_str(text.trim(), ORDER_TIMESTAMP_FORMAT).unwrap_or_else(
				|err| {
					warn!("Could not parse order timestamp '{text}': {err}");
					now
				},
			)
		}
	};
	(
		timestamp.format("%Y%m%d").to_string(),
		timestamp.format("%H%M%S").to_string(),
	)
}

/// Absorbs each order in its own savepoint so a broken record only discards itself.
fn absorb_orders(tx: &mut Transaction<'_>, orders: &[Order]) -> Result<usize, StoreError> {
	let now = Local::now().naive_local();
	let mut created = 0;

	for order in orders {
		let Some(order) = ValidOrder::new(order) else {
			warn!(?order, "Skipping order with incomplete data");
			continue;
		};

		let savepoint = tx.savepoint()?;
		match absorb_order(&savepoint, &order, now) {
			Ok(Some(accession_number)) => {
				savepoint.commit()?;
				created += 1;
				info!(%accession_number, "Added new order");
			}
			Ok(None) => {
				savepoint.commit()?;
				debug!(order_seq = order.order_seq, "Skipping existing order");
			}
			Err(err) => {
				// Dropping the savepoint rolls back this order only.
				error!(order_seq = order.order_seq, "Error processing order: {err}");
			}
		}
	}

	Ok(created)
}

/// Returns the accession number of the created item, or `None` if it already existed.
fn absorb_order(
	conn: &Connection,
	order: &ValidOrder<'_>,
	now: NaiveDateTime,
) -> Result<Option<String>, StoreError> {
	if queries::find_patient(conn, order.chart_number)?.is_none() {
		queries::insert_patient(
			conn,
			&Patient {
				patient_id: order.chart_number.to_owned(),
				patient_name: order.patient_name.to_owned(),
				patient_eng_name: Some(transliterate(order.patient_name)),
				birth_date: order.birth_date.to_owned(),
				sex: order.sex.to_owned(),
			},
		)?;
	}

	let (appointment_date, appointment_time) = appointment(order.ordered_at, now);
	let accession_number = accession_number(order.order_seq);
	if queries::accession_exists(conn, &accession_number)? {
		return Ok(None);
	}

	let aet = queries::devices_for_modality(conn, order.modality)?
		.into_iter()
		.next();

	queries::insert_worklist_item(
		conn,
		&WorklistItem {
			patient_id: order.chart_number.to_owned(),
			accession_number: accession_number.clone(),
			appointment_date,
			appointment_time,
			modality: order.modality.to_owned(),
			aet,
			study_instance_uid: None,
			status: ItemStatus::Scheduled,
			emr_order_seq: Some(order.order_seq),
		},
	)?;

	Ok(Some(accession_number))
}

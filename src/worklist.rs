//! Modality worklist queries.
//!
//! A query first pulls new orders (best effort), then streams every matching `SCHEDULED`
//! item as a [`WorklistRecord`]. Items without a Study Instance UID receive one, which is
//! stored before the record is handed out.

use crate::store::models::{ItemFilter, ScheduledRow};
use crate::store::Store;
use crate::sync::SyncEngine;
use crate::types::{AE, DA, TM, UI, US};
use async_stream::stream;
use dicom::core::value::DataSetSequence;
use dicom::core::{DataElement, PrimitiveValue, Tag, VR};
use dicom::dictionary_std::tags;
use dicom::object::mem::InMemElement;
use dicom::object::InMemDicomObject;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Modalities that display the romanized patient name instead of the local one.
pub const ROMANIZED_NAME_MODALITIES: &[&str] = &["US"];

/// Character set announced in every worklist record.
pub const SPECIFIC_CHARACTER_SET: &str = "ISO_IR 192";

/// Universal matching value for string keys.
const WILDCARD: &str = "*";

/// Generates a Study Instance UID below the UUID-derived root `2.25`.
pub fn generate_study_instance_uid() -> UI {
	format!("2.25.{}", Uuid::new_v4().as_u128())
}

/// Extracts the supported matching keys from a C-FIND identifier.
///
/// Modality and Scheduled Procedure Step Start Date are read from the first item of the
/// Scheduled Procedure Step Sequence, the Accession Number from the top level. Empty values
/// and the universal wildcard do not constrain the result.
pub fn filter_from_identifier(identifier: &InMemDicomObject) -> ItemFilter {
	let step = identifier
		.get(tags::SCHEDULED_PROCEDURE_STEP_SEQUENCE)
		.and_then(|sequence| sequence.value().items())
		.and_then(<[InMemDicomObject]>::first);

	ItemFilter {
		modality: step.and_then(|step| matching_key(step, tags::MODALITY)),
		date: step.and_then(|step| matching_key(step, tags::SCHEDULED_PROCEDURE_STEP_START_DATE)),
		accession_number: matching_key(identifier, tags::ACCESSION_NUMBER),
	}
}

fn matching_key(object: &InMemDicomObject, tag: Tag) -> Option<String> {
	object
		.get(tag)
		.map(InMemElement::to_str)
		.and_then(Result::ok)
		.map(|value| value.trim_end_matches('\0').trim().to_owned())
		.filter(|value| !value.is_empty() && value != WILDCARD)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledStep {
	pub modality: String,
	pub station_aet: Option<AE>,
	pub start_date: DA,
	pub start_time: TM,
}

/// A worklist entry as reported to modalities.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorklistRecord {
	pub patient_name: String,
	pub patient_id: String,
	pub birth_date: DA,
	pub sex: String,
	pub scheduled_step: ScheduledStep,
	pub accession_number: String,
	pub study_instance_uid: UI,
}

impl WorklistRecord {
	fn new(row: ScheduledRow, study_instance_uid: UI) -> Self {
		let patient_name = if ROMANIZED_NAME_MODALITIES.contains(&row.modality.as_str()) {
			row.patient_eng_name
				.filter(|name| !name.is_empty())
				.unwrap_or(row.patient_name)
		} else {
			row.patient_name
		};

		Self {
			patient_name,
			patient_id: row.patient_id,
			birth_date: row.birth_date,
			sex: row.sex,
			scheduled_step: ScheduledStep {
				modality: row.modality,
				station_aet: row.aet,
				start_date: row.appointment_date,
				start_time: row.appointment_time,
			},
			study_instance_uid,
			accession_number: row.accession_number,
		}
	}
}

impl From<ScheduledStep> for InMemDicomObject {
	#[rustfmt::skip]
	fn from(step: ScheduledStep) -> Self {
		Self::from_element_iter([
			DataElement::new(tags::MODALITY, VR::CS, PrimitiveValue::from(step.modality)),
			DataElement::new(tags::SCHEDULED_STATION_AE_TITLE, VR::AE, step.station_aet.map_or(PrimitiveValue::Empty, PrimitiveValue::from)),
			DataElement::new(tags::SCHEDULED_PROCEDURE_STEP_START_DATE, VR::DA, PrimitiveValue::from(step.start_date)),
			DataElement::new(tags::SCHEDULED_PROCEDURE_STEP_START_TIME, VR::TM, PrimitiveValue::from(step.start_time)),
			DataElement::new(tags::SCHEDULED_PERFORMING_PHYSICIAN_NAME, VR::PN, PrimitiveValue::Empty),
			DataElement::new(tags::SCHEDULED_PROCEDURE_STEP_DESCRIPTION, VR::LO, PrimitiveValue::Empty),
		])
	}
}

impl From<WorklistRecord> for InMemDicomObject {
	#[rustfmt::skip]
	fn from(record: WorklistRecord) -> Self {
		let step = Self::from(record.scheduled_step);
		Self::from_element_iter([
			DataElement::new(tags::SPECIFIC_CHARACTER_SET, VR::CS, PrimitiveValue::from(SPECIFIC_CHARACTER_SET)),
			DataElement::new(tags::PATIENT_NAME, VR::PN, PrimitiveValue::from(record.patient_name)),
			DataElement::new(tags::PATIENT_ID, VR::LO, PrimitiveValue::from(record.patient_id)),
			DataElement::new(tags::PATIENT_BIRTH_DATE, VR::DA, PrimitiveValue::from(record.birth_date)),
			DataElement::new(tags::PATIENT_SEX, VR::CS, PrimitiveValue::from(record.sex)),
			DataElement::new(tags::SCHEDULED_PROCEDURE_STEP_SEQUENCE, VR::SQ, DataSetSequence::from(vec![step])),
			DataElement::new(tags::ACCESSION_NUMBER, VR::SH, PrimitiveValue::from(record.accession_number.clone())),
			DataElement::new(tags::STUDY_INSTANCE_UID, VR::UI, PrimitiveValue::from(record.study_instance_uid)),
			DataElement::new(tags::STUDY_ID, VR::SH, PrimitiveValue::from(record.accession_number)),
		])
	}
}

/// One element of a worklist query result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FindResponse {
	Pending(Box<WorklistRecord>),
	Cancelled,
	Success,
	/// The store could not be queried.
	Failure,
}

impl FindResponse {
	pub const STATUS_PENDING: US = 0xFF00;
	pub const STATUS_CANCELLED: US = 0xFE00;
	pub const STATUS_SUCCESS: US = 0x0000;
	pub const STATUS_UNABLE_TO_PROCESS: US = 0xC000;

	pub const fn status(&self) -> US {
		match self {
			Self::Pending(_) => Self::STATUS_PENDING,
			Self::Cancelled => Self::STATUS_CANCELLED,
			Self::Success => Self::STATUS_SUCCESS,
			Self::Failure => Self::STATUS_UNABLE_TO_PROCESS,
		}
	}
}

pub struct WorklistQuery {
	store: Store,
	sync: Option<Arc<SyncEngine>>,
}

impl WorklistQuery {
	pub const fn new(store: Store, sync: Option<Arc<SyncEngine>>) -> Self {
		Self { store, sync }
	}

	/// Streams the `SCHEDULED` items matching `filter`, terminated by a final status.
	///
	/// `cancel` is checked before every record. Once it reads `true` the stream ends with
	/// [`FindResponse::Cancelled`]; records that were not yet produced keep their state.
	pub fn find(
		&self,
		filter: ItemFilter,
		cancel: watch::Receiver<bool>,
	) -> BoxStream<'_, FindResponse> {
		stream! {
			if let Some(sync) = &self.sync {
				match sync.sync().await {
					Ok(0) => {}
					Ok(created) => info!(created, "Synchronized orders before worklist query"),
					Err(err) => error!("Order synchronization before worklist query failed: {err}"),
				}
			}

			let rows = match self.store.scheduled_items(filter).await {
				Ok(rows) => rows,
				Err(err) => {
					error!("Failed to query worklist items: {err}");
					yield FindResponse::Failure;
					return;
				}
			};
			info!("Found {} worklist items", rows.len());

			for row in rows {
				if *cancel.borrow() {
					info!("Worklist query was cancelled");
					yield FindResponse::Cancelled;
					return;
				}
				let record = self.resolve(row).await;
				yield FindResponse::Pending(Box::new(record));
			}

			yield FindResponse::Success;
		}
		.boxed()
	}

	/// Builds the record for `row`, assigning and storing a Study Instance UID if needed.
	async fn resolve(&self, row: ScheduledRow) -> WorklistRecord {
		let study_instance_uid = match row.study_instance_uid.as_deref() {
			Some(uid) if !uid.is_empty() => uid.to_owned(),
			_ => {
				let uid = generate_study_instance_uid();
				match self
					.store
					.set_study_instance_uid(&row.accession_number, &uid)
					.await
				{
					Ok(true) => debug!(
						accession_number = %row.accession_number,
						study_instance_uid = %uid,
						"Assigned Study Instance UID"
					),
					Ok(false) => warn!(
						accession_number = %row.accession_number,
						"Worklist item vanished before its Study Instance UID could be stored"
					),
					Err(err) => warn!(
						accession_number = %row.accession_number,
						"Failed to store Study Instance UID: {err}"
					),
				}
				uid
			}
		};

		WorklistRecord::new(row, study_instance_uid)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::orders::testing::{order, ScriptedOrderSource};
	use crate::orders::OrderSource;
	use crate::store::testing::{item, patient, seed, seed_with_patients, temp_store};

	fn identifier(modality: &str, date: &str, accession_number: &str) -> InMemDicomObject {
		let step = InMemDicomObject::from_element_iter([
			DataElement::new(tags::MODALITY, VR::CS, PrimitiveValue::from(modality)),
			DataElement::new(
				tags::SCHEDULED_PROCEDURE_STEP_START_DATE,
				VR::DA,
				PrimitiveValue::from(date),
			),
		]);
		InMemDicomObject::from_element_iter([
			DataElement::new(
				tags::SCHEDULED_PROCEDURE_STEP_SEQUENCE,
				VR::SQ,
				DataSetSequence::from(vec![step]),
			),
			DataElement::new(
				tags::ACCESSION_NUMBER,
				VR::SH,
				PrimitiveValue::from(accession_number),
			),
		])
	}

	fn no_cancel() -> watch::Receiver<bool> {
		let (tx, rx) = watch::channel(false);
		// A closed channel keeps its last value.
		drop(tx);
		rx
	}

	async fn collect(query: &WorklistQuery, filter: ItemFilter) -> Vec<FindResponse> {
		query.find(filter, no_cancel()).collect().await
	}

	fn records(responses: &[FindResponse]) -> Vec<&WorklistRecord> {
		responses
			.iter()
			.filter_map(|response| match response {
				FindResponse::Pending(record) => Some(record.as_ref()),
				_ => None,
			})
			.collect()
	}

	#[test]
	fn identifier_keys_become_filter() {
		let filter = filter_from_identifier(&identifier("CT", "20250101", "*"));
		assert_eq!(
			filter,
			ItemFilter {
				modality: Some(String::from("CT")),
				date: Some(String::from("20250101")),
				accession_number: None,
			}
		);
	}

	#[test]
	fn empty_identifier_matches_everything() {
		assert_eq!(
			filter_from_identifier(&InMemDicomObject::new_empty()),
			ItemFilter::default()
		);
		assert_eq!(
			filter_from_identifier(&identifier("", "", "")),
			ItemFilter::default()
		);
	}

	#[test]
	fn study_instance_uids_use_uuid_root() {
		let uid = generate_study_instance_uid();
		assert!(uid.starts_with("2.25."));
		assert!(uid.len() <= 64);
		assert_ne!(uid, generate_study_instance_uid());
	}

	#[test]
	fn status_codes() {
		assert_eq!(FindResponse::Success.status(), 0x0000);
		assert_eq!(FindResponse::Cancelled.status(), 0xFE00);
		assert_eq!(FindResponse::Failure.status(), 0xC000);
	}

	#[test]
	fn record_maps_to_data_set() {
		let record = WorklistRecord {
			patient_name: String::from("DOE^JOHN"),
			patient_id: String::from("P1"),
			birth_date: String::from("19800101"),
			sex: String::from("M"),
			scheduled_step: ScheduledStep {
				modality: String::from("CT"),
				station_aet: Some(AE::from("CT01")),
				start_date: String::from("20250101"),
				start_time: String::from("100000"),
			},
			accession_number: String::from("00000042"),
			study_instance_uid: UI::from("2.25.1"),
		};

		let object = InMemDicomObject::from(record);
		let text = |object: &InMemDicomObject, tag| {
			object.get(tag).unwrap().to_str().unwrap().trim().to_owned()
		};
		assert_eq!(text(&object, tags::SPECIFIC_CHARACTER_SET), "ISO_IR 192");
		assert_eq!(text(&object, tags::PATIENT_NAME), "DOE^JOHN");
		assert_eq!(text(&object, tags::STUDY_ID), "00000042");
		assert_eq!(text(&object, tags::ACCESSION_NUMBER), "00000042");
		assert_eq!(text(&object, tags::STUDY_INSTANCE_UID), "2.25.1");

		let step = &object
			.get(tags::SCHEDULED_PROCEDURE_STEP_SEQUENCE)
			.unwrap()
			.value()
			.items()
			.unwrap()[0];
		assert_eq!(text(step, tags::MODALITY), "CT");
		assert_eq!(text(step, tags::SCHEDULED_STATION_AE_TITLE), "CT01");
		assert_eq!(text(step, tags::SCHEDULED_PROCEDURE_STEP_START_TIME), "100000");
		assert_eq!(text(step, tags::SCHEDULED_PERFORMING_PHYSICIAN_NAME), "");
	}

	#[tokio::test]
	async fn unfiltered_query_returns_all_scheduled_items() {
		let (store, _dir) = temp_store().await;
		seed(
			&store,
			vec![
				item("P1", "A1", "CT", "20250101"),
				item("P2", "A2", "MR", "20250102"),
			],
		)
		.await;
		let query = WorklistQuery::new(store, None);

		let responses = collect(&query, ItemFilter::default()).await;
		assert_eq!(responses.len(), 3);
		assert_eq!(responses.last(), Some(&FindResponse::Success));
		let accessions: Vec<_> = records(&responses)
			.iter()
			.map(|record| record.accession_number.as_str())
			.collect();
		assert_eq!(accessions, vec!["A1", "A2"]);
	}

	#[tokio::test]
	async fn modality_filter_is_exact() {
		let (store, _dir) = temp_store().await;
		seed(
			&store,
			vec![
				item("P1", "A1", "CT", "20250101"),
				item("P2", "A2", "MR", "20250101"),
			],
		)
		.await;
		let query = WorklistQuery::new(store, None);

		let filter = filter_from_identifier(&identifier("MR", "", "*"));
		let responses = collect(&query, filter).await;
		let records = records(&responses);
		assert_eq!(records.len(), 1);
		assert_eq!(records[0].scheduled_step.modality, "MR");
	}

	#[tokio::test]
	async fn study_instance_uid_is_assigned_once() {
		let (store, _dir) = temp_store().await;
		seed(&store, vec![item("P1", "A1", "CT", "20250101")]).await;
		let query = WorklistQuery::new(store.clone(), None);

		let first = collect(&query, ItemFilter::default()).await;
		let uid = records(&first)[0].study_instance_uid.clone();
		assert!(uid.starts_with("2.25."));

		let stored = store.worklist_item("A1").await.unwrap().unwrap();
		assert_eq!(stored.study_instance_uid.as_deref(), Some(uid.as_str()));

		let second = collect(&query, ItemFilter::default()).await;
		assert_eq!(records(&second)[0].study_instance_uid, uid);
	}

	#[tokio::test]
	async fn ultrasound_uses_romanized_name() {
		let (store, _dir) = temp_store().await;
		seed_with_patients(
			&store,
			vec![patient("P1", "홍길동")],
			vec![
				item("P1", "A1", "US", "20250101"),
				item("P1", "A2", "CT", "20250101"),
			],
		)
		.await;
		let query = WorklistQuery::new(store, None);

		let responses = collect(&query, ItemFilter::default()).await;
		let records = records(&responses);
		assert_eq!(records[0].patient_name, "HONG GIL DONG");
		assert_eq!(records[1].patient_name, "홍길동");
	}

	#[tokio::test]
	async fn cancelled_query_stops_before_next_record() {
		let (store, _dir) = temp_store().await;
		seed(
			&store,
			vec![
				item("P1", "A1", "CT", "20250101"),
				item("P2", "A2", "CT", "20250102"),
			],
		)
		.await;
		let query = WorklistQuery::new(store.clone(), None);
		let (cancel_tx, cancel_rx) = watch::channel(false);

		let mut responses = query.find(ItemFilter::default(), cancel_rx);
		let first = responses.next().await.unwrap();
		assert_eq!(first.status(), FindResponse::STATUS_PENDING);

		cancel_tx.send(true).unwrap();
		assert_eq!(responses.next().await, Some(FindResponse::Cancelled));
		assert_eq!(responses.next().await, None);

		let untouched = store.worklist_item("A2").await.unwrap().unwrap();
		assert_eq!(untouched.study_instance_uid, None);
	}

	#[tokio::test]
	async fn query_pulls_new_orders_first() {
		let (store, _dir) = temp_store().await;
		let source = Arc::new(ScriptedOrderSource::with_orders(vec![order(
			42, "CT", "P1", "JOHN DOE",
		)]));
		let sync = Arc::new(SyncEngine::new(
			store.clone(),
			source as Arc<dyn OrderSource>,
		));
		let query = WorklistQuery::new(store, Some(sync));

		let responses = collect(&query, ItemFilter::default()).await;
		let records = records(&responses);
		assert_eq!(records.len(), 1);
		assert_eq!(records[0].accession_number, "00000042");
		assert_eq!(records[0].patient_name, "JOHN DOE");
	}

	#[tokio::test]
	async fn failed_sync_does_not_block_query() {
		let (store, _dir) = temp_store().await;
		seed(&store, vec![item("P1", "A1", "CT", "20250101")]).await;
		let source = Arc::new(ScriptedOrderSource::failing_fetch());
		let sync = Arc::new(SyncEngine::new(
			store.clone(),
			source as Arc<dyn OrderSource>,
		));
		let query = WorklistQuery::new(store, Some(sync));

		let responses = collect(&query, ItemFilter::default()).await;
		assert_eq!(records(&responses).len(), 1);
		assert_eq!(responses.last(), Some(&FindResponse::Success));
	}
}

//! Modality Performed Procedure Step tracking.
//!
//! Steps go from `IN PROGRESS` (N-CREATE) to `COMPLETED` (N-SET). Every transition is mirrored
//! onto the worklist item and, if the item came from the order system, pushed back to it.

use crate::orders::{OrderSource, OrderStatus};
use crate::store::models::{StartedStep, StepTransition};
use crate::store::Store;
use crate::types::{UI, US};
use chrono::Local;
use dicom::core::{DataElement, PrimitiveValue, Tag, VR};
use dicom::dictionary_std::{tags, uids};
use dicom::object::mem::InMemElement;
use dicom::object::InMemDicomObject;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::{error, info, instrument, warn};

/// The only Performed Procedure Step Status accepted by N-CREATE.
const STATUS_IN_PROGRESS: &str = "IN PROGRESS";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StepError {
	#[error("Invalid request: {0}")]
	InvalidRequest(String),
	#[error("Procedure step {0} already exists")]
	DuplicateInstance(UI),
	#[error("Missing attribute {0}")]
	MissingAttribute(Tag),
	#[error("Procedure step {0} is unknown")]
	NotFound(UI),
}

impl StepError {
	/// DIMSE status code reported to the modality.
	pub const fn status(&self) -> US {
		match self {
			Self::InvalidRequest(_) => 0x0106,
			Self::DuplicateInstance(_) => 0x0111,
			Self::MissingAttribute(_) => 0x0120,
			Self::NotFound(_) => 0x0112,
		}
	}
}

/// Tracks performed procedure steps created by modalities.
///
/// Step records are kept in memory for the lifetime of the process. The store only holds the
/// tracking rows needed to drive worklist item transitions.
pub struct ProcedureStepManager {
	store: Store,
	source: Option<Arc<dyn OrderSource>>,
	instances: Mutex<HashMap<UI, InMemDicomObject>>,
}

impl ProcedureStepManager {
	pub fn new(store: Store, source: Option<Arc<dyn OrderSource>>) -> Self {
		Self {
			store,
			source,
			instances: Mutex::new(HashMap::new()),
		}
	}

	fn instances(&self) -> MutexGuard<'_, HashMap<UI, InMemDicomObject>> {
		// The table holds no invariants spanning several entries.
		self.instances
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
	}

	/// Handles N-CREATE: registers a new step and moves its worklist item to `IN_PROGRESS`.
	#[instrument(skip(self, attributes))]
	pub async fn start(
		&self,
		sop_instance_uid: Option<UI>,
		attributes: InMemDicomObject,
	) -> Result<InMemDicomObject, StepError> {
		let sop_instance_uid = sop_instance_uid
			.map(|uid| trim_uid(&uid))
			.filter(|uid| !uid.is_empty())
			.ok_or_else(|| {
				StepError::InvalidRequest(String::from("Affected SOP Instance UID is missing"))
			})?;

		let record = {
			let mut instances = self.instances();
			if instances.contains_key(&sop_instance_uid) {
				return Err(StepError::DuplicateInstance(sop_instance_uid));
			}

			// A present but empty status is a wrong value, not a missing attribute.
			let status = attributes
				.get(tags::PERFORMED_PROCEDURE_STEP_STATUS)
				.ok_or(StepError::MissingAttribute(tags::PERFORMED_PROCEDURE_STEP_STATUS))?
				.to_str()
				.map(|status| status.trim().to_owned())
				.unwrap_or_default();
			if !status.eq_ignore_ascii_case(STATUS_IN_PROGRESS) {
				return Err(StepError::InvalidRequest(format!(
					"Performed Procedure Step Status must be {STATUS_IN_PROGRESS}, got '{status}'"
				)));
			}

			let record = step_record(&sop_instance_uid, attributes);
			instances.insert(sop_instance_uid.clone(), record.clone());
			record
		};

		let modality = text(&record, tags::MODALITY).unwrap_or_default();
		let scheduled = record
			.get(tags::SCHEDULED_STEP_ATTRIBUTES_SEQUENCE)
			.and_then(|sequence| sequence.value().items())
			.and_then(<[InMemDicomObject]>::first);
		let accession_number = scheduled.and_then(|item| text(item, tags::ACCESSION_NUMBER));
		let study_instance_uid = scheduled
			.and_then(|item| text(item, tags::STUDY_INSTANCE_UID))
			.map(|uid| trim_uid(&uid))
			.unwrap_or_default();

		let Some(accession_number) = accession_number else {
			warn!("Procedure step does not reference an accession number");
			return Ok(record);
		};
		info!(%accession_number, %modality, "Procedure step started");

		let step = StartedStep {
			sop_instance_uid,
			accession_number: accession_number.clone(),
			study_instance_uid,
			modality,
			start_time: Local::now().naive_local(),
		};
		match self.store.record_step_started(step).await {
			Ok(Some(transition)) => {
				info!(%accession_number, "Worklist item is in progress");
				self.push_status(&transition, OrderStatus::InProgress).await;
			}
			Ok(None) => warn!(%accession_number, "No worklist item for procedure step"),
			Err(err) => error!(%accession_number, "Failed to record procedure step start: {err}"),
		}

		Ok(record)
	}

	/// Handles N-SET: completes a known step and applies `modifications` to its record.
	///
	/// Only an unknown SOP Instance UID is an error. Failures to update the store are logged
	/// and the modifications are applied regardless.
	#[instrument(skip(self, modifications))]
	pub async fn complete(
		&self,
		sop_instance_uid: &str,
		modifications: InMemDicomObject,
	) -> Result<InMemDicomObject, StepError> {
		let sop_instance_uid = trim_uid(sop_instance_uid);
		if !self.instances().contains_key(&sop_instance_uid) {
			return Err(StepError::NotFound(sop_instance_uid));
		}

		match self
			.store
			.record_step_completed(&sop_instance_uid, Local::now().naive_local())
			.await
		{
			Ok(Some(transition)) => {
				info!(accession_number = %transition.accession_number, "Procedure step completed");
				self.push_status(&transition, OrderStatus::Completed).await;
			}
			Ok(None) => warn!("Procedure step is not tracked in the store"),
			Err(err) => warn!("Failed to record procedure step completion: {err}"),
		}

		let mut instances = self.instances();
		let record = instances
			.get_mut(&sop_instance_uid)
			.ok_or_else(|| StepError::NotFound(sop_instance_uid.clone()))?;
		for element in modifications {
			record.put(element);
		}
		Ok(record.clone())
	}

	/// The current record of a step, if it is managed by this provider.
	#[cfg(test)]
	pub fn record(&self, sop_instance_uid: &str) -> Option<InMemDicomObject> {
		self.instances().get(sop_instance_uid).cloned()
	}

	async fn push_status(&self, transition: &StepTransition, status: OrderStatus) {
		let (Some(source), Some(order_seq)) = (&self.source, transition.emr_order_seq) else {
			return;
		};

		match source.update_order_status(order_seq, status).await {
			Ok(true) => info!(order_seq, %status, "Updated order status"),
			Ok(false) => warn!(order_seq, %status, "Order system did not update the order"),
			Err(err) => error!(order_seq, %status, "Failed to update order status: {err}"),
		}
	}
}

/// The N-CREATE attribute list extended by the SOP Common module.
fn step_record(sop_instance_uid: &str, attributes: InMemDicomObject) -> InMemDicomObject {
	let mut record = InMemDicomObject::from_element_iter([
		DataElement::new(
			tags::SOP_CLASS_UID,
			VR::UI,
			PrimitiveValue::from(uids::MODALITY_PERFORMED_PROCEDURE_STEP),
		),
		DataElement::new(
			tags::SOP_INSTANCE_UID,
			VR::UI,
			PrimitiveValue::from(sop_instance_uid),
		),
	]);
	for element in attributes {
		record.put(element);
	}
	record
}

fn text(object: &InMemDicomObject, tag: Tag) -> Option<String> {
	object
		.get(tag)
		.map(InMemElement::to_str)
		.and_then(Result::ok)
		.map(|value| value.trim().to_owned())
		.filter(|value| !value.is_empty())
}

fn trim_uid(uid: &str) -> UI {
	UI::from(uid.trim_end_matches('\0').trim())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::orders::testing::ScriptedOrderSource;
	use crate::store::testing::{item, seed, temp_store};
	use crate::types::{ItemStatus, StepStatus};
	use dicom::core::value::DataSetSequence;

	fn attributes(status: Option<&str>, accession_number: &str) -> InMemDicomObject {
		let scheduled = InMemDicomObject::from_element_iter([
			DataElement::new(
				tags::ACCESSION_NUMBER,
				VR::SH,
				PrimitiveValue::from(accession_number),
			),
			DataElement::new(
				tags::STUDY_INSTANCE_UID,
				VR::UI,
				PrimitiveValue::from("1.2.3.4"),
			),
		]);
		let mut attributes = InMemDicomObject::from_element_iter([
			DataElement::new(tags::MODALITY, VR::CS, PrimitiveValue::from("CT")),
			DataElement::new(
				tags::SCHEDULED_STEP_ATTRIBUTES_SEQUENCE,
				VR::SQ,
				DataSetSequence::from(vec![scheduled]),
			),
		]);
		if let Some(status) = status {
			attributes.put(DataElement::new(
				tags::PERFORMED_PROCEDURE_STEP_STATUS,
				VR::CS,
				PrimitiveValue::from(status),
			));
		}
		attributes
	}

	fn completed() -> InMemDicomObject {
		InMemDicomObject::from_element_iter([DataElement::new(
			tags::PERFORMED_PROCEDURE_STEP_STATUS,
			VR::CS,
			PrimitiveValue::from("COMPLETED"),
		)])
	}

	async fn synced_item(store: &Store, accession_number: &str, order_seq: i64) {
		let mut scheduled = item("P1", accession_number, "CT", "20250101");
		scheduled.emr_order_seq = Some(order_seq);
		seed(store, vec![scheduled]).await;
	}

	#[test]
	fn error_status_codes() {
		assert_eq!(StepError::InvalidRequest(String::new()).status(), 0x0106);
		assert_eq!(StepError::DuplicateInstance(UI::new()).status(), 0x0111);
		assert_eq!(
			StepError::MissingAttribute(tags::PERFORMED_PROCEDURE_STEP_STATUS).status(),
			0x0120
		);
		assert_eq!(StepError::NotFound(UI::new()).status(), 0x0112);
	}

	#[tokio::test]
	async fn lifecycle_moves_item_through_states() {
		let (store, _dir) = temp_store().await;
		synced_item(&store, "00000042", 42).await;
		let source = Arc::new(ScriptedOrderSource::default());
		let manager = ProcedureStepManager::new(
			store.clone(),
			Some(Arc::clone(&source) as Arc<dyn OrderSource>),
		);

		let record = manager
			.start(
				Some(UI::from("1.2.840.1")),
				attributes(Some("in progress"), "00000042"),
			)
			.await
			.unwrap();
		assert_eq!(
			text(&record, tags::SOP_CLASS_UID).as_deref(),
			Some(uids::MODALITY_PERFORMED_PROCEDURE_STEP)
		);
		assert_eq!(text(&record, tags::SOP_INSTANCE_UID).as_deref(), Some("1.2.840.1"));
		assert_eq!(
			store.worklist_item("00000042").await.unwrap().unwrap().status,
			ItemStatus::InProgress
		);

		let record = manager.complete("1.2.840.1", completed()).await.unwrap();
		assert_eq!(
			text(&record, tags::PERFORMED_PROCEDURE_STEP_STATUS).as_deref(),
			Some("COMPLETED")
		);
		assert_eq!(
			store.worklist_item("00000042").await.unwrap().unwrap().status,
			ItemStatus::Completed
		);

		let step = store.procedure_step("1.2.840.1").await.unwrap().unwrap();
		assert_eq!(step.status, StepStatus::Completed);
		assert_eq!(step.study_instance_uid, "1.2.3.4");
		assert_eq!(step.modality, "CT");
		assert_eq!(
			source.updates(),
			vec![(42, OrderStatus::InProgress), (42, OrderStatus::Completed)]
		);
	}

	#[tokio::test]
	async fn missing_instance_uid_is_rejected() {
		let (store, _dir) = temp_store().await;
		let manager = ProcedureStepManager::new(store, None);

		let result = manager
			.start(None, attributes(Some("IN PROGRESS"), "A1"))
			.await;
		assert_eq!(result.unwrap_err().status(), 0x0106);
	}

	#[tokio::test]
	async fn duplicate_instance_is_rejected() {
		let (store, _dir) = temp_store().await;
		synced_item(&store, "A1", 1).await;
		let manager = ProcedureStepManager::new(store.clone(), None);

		manager
			.start(Some(UI::from("1.2.3")), attributes(Some("IN PROGRESS"), "A1"))
			.await
			.unwrap();
		let duplicate = manager
			.start(Some(UI::from("1.2.3")), attributes(Some("IN PROGRESS"), "A1"))
			.await;
		assert_eq!(
			duplicate.unwrap_err(),
			StepError::DuplicateInstance(UI::from("1.2.3"))
		);
		assert_eq!(
			store.procedure_steps_for_accession("A1").await.unwrap().len(),
			1
		);
	}

	#[tokio::test]
	async fn status_is_validated() {
		let (store, _dir) = temp_store().await;
		let manager = ProcedureStepManager::new(store, None);

		let missing = manager
			.start(Some(UI::from("1.2.3")), attributes(None, "A1"))
			.await;
		assert_eq!(missing.unwrap_err().status(), 0x0120);

		let wrong = manager
			.start(Some(UI::from("1.2.3")), attributes(Some("COMPLETED"), "A1"))
			.await;
		assert_eq!(wrong.unwrap_err().status(), 0x0106);

		let empty = manager
			.start(Some(UI::from("1.2.3")), attributes(Some(""), "A1"))
			.await;
		assert!(matches!(empty, Err(StepError::InvalidRequest(_))));

		// Rejected requests do not register the instance.
		assert!(manager.record("1.2.3").is_none());
	}

	#[tokio::test]
	async fn unknown_instance_cannot_complete() {
		let (store, _dir) = temp_store().await;
		let manager = ProcedureStepManager::new(store, None);

		let result = manager.complete("9.9.9", completed()).await;
		assert_eq!(result.unwrap_err(), StepError::NotFound(UI::from("9.9.9")));
	}

	#[tokio::test]
	async fn unknown_accession_is_acknowledged() {
		let (store, _dir) = temp_store().await;
		let manager = ProcedureStepManager::new(store.clone(), None);

		manager
			.start(Some(UI::from("1.2.3")), attributes(Some("IN PROGRESS"), "NOPE"))
			.await
			.unwrap();
		assert!(store.procedure_step("1.2.3").await.unwrap().is_none());

		// The step is managed even though nothing was tracked.
		let record = manager.complete("1.2.3", completed()).await.unwrap();
		assert_eq!(
			text(&record, tags::PERFORMED_PROCEDURE_STEP_STATUS).as_deref(),
			Some("COMPLETED")
		);
	}

	#[tokio::test]
	async fn failed_status_push_keeps_local_transition() {
		let (store, _dir) = temp_store().await;
		synced_item(&store, "00000007", 7).await;
		let source = Arc::new(ScriptedOrderSource::failing_update());
		let manager = ProcedureStepManager::new(
			store.clone(),
			Some(source as Arc<dyn OrderSource>),
		);

		manager
			.start(Some(UI::from("1.2.3")), attributes(Some("IN PROGRESS"), "00000007"))
			.await
			.unwrap();
		assert_eq!(
			store.worklist_item("00000007").await.unwrap().unwrap().status,
			ItemStatus::InProgress
		);
	}

	#[tokio::test]
	async fn manual_items_are_not_pushed() {
		let (store, _dir) = temp_store().await;
		seed(&store, vec![item("P1", "MANUAL", "CT", "20250101")]).await;
		let source = Arc::new(ScriptedOrderSource::default());
		let manager = ProcedureStepManager::new(
			store,
			Some(Arc::clone(&source) as Arc<dyn OrderSource>),
		);

		manager
			.start(Some(UI::from("1.2.3")), attributes(Some("IN PROGRESS"), "MANUAL"))
			.await
			.unwrap();
		assert!(source.updates().is_empty());
	}
}

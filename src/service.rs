use crate::mpps::{ProcedureStepManager, StepError};
use crate::orders::OrderSource;
use crate::store::Store;
use crate::sync::SyncEngine;
use crate::types::{UI, US};
use crate::worklist::{filter_from_identifier, FindResponse, WorklistQuery};
use dicom::object::InMemDicomObject;
use futures::stream::BoxStream;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

/// Status of a successful C-ECHO.
pub const STATUS_SUCCESS: US = 0x0000;

/// The worklist and procedure step handlers shared by all associations.
pub struct WorklistService {
	sync: Option<Arc<SyncEngine>>,
	query: WorklistQuery,
	steps: ProcedureStepManager,
}

impl WorklistService {
	/// Without an order source the worklist only contains what is already stored and
	/// procedure step transitions are not reported anywhere.
	pub fn new(store: Store, source: Option<Arc<dyn OrderSource>>) -> Self {
		let sync = source
			.as_ref()
			.map(|source| Arc::new(SyncEngine::new(store.clone(), Arc::clone(source))));

		Self {
			query: WorklistQuery::new(store.clone(), sync.clone()),
			steps: ProcedureStepManager::new(store, source),
			sync,
		}
	}

	/// The engine driving the background synchronization, if an order source is configured.
	pub fn sync_engine(&self) -> Option<Arc<SyncEngine>> {
		self.sync.clone()
	}

	pub fn echo(&self) -> US {
		debug!("Received echo request");
		STATUS_SUCCESS
	}

	pub fn find(
		&self,
		identifier: &InMemDicomObject,
		cancel: watch::Receiver<bool>,
	) -> BoxStream<'_, FindResponse> {
		let filter = filter_from_identifier(identifier);
		debug!(?filter, "Received worklist query");
		self.query.find(filter, cancel)
	}

	pub async fn create_step(
		&self,
		sop_instance_uid: Option<UI>,
		attributes: InMemDicomObject,
	) -> Result<InMemDicomObject, StepError> {
		self.steps.start(sop_instance_uid, attributes).await
	}

	/// A request without Requested SOP Instance UID is rejected like an N-CREATE without one.
	pub async fn update_step(
		&self,
		sop_instance_uid: Option<&str>,
		modifications: InMemDicomObject,
	) -> Result<InMemDicomObject, StepError> {
		let sop_instance_uid = sop_instance_uid.ok_or_else(|| {
			StepError::InvalidRequest(String::from("Requested SOP Instance UID is missing"))
		})?;
		self.steps.complete(sop_instance_uid, modifications).await
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::orders::testing::{order, ScriptedOrderSource};
	use crate::orders::OrderStatus;
	use crate::store::testing::temp_store;
	use crate::types::ItemStatus;
	use crate::worklist::WorklistRecord;
	use dicom::core::value::DataSetSequence;
	use dicom::core::{DataElement, PrimitiveValue, VR};
	use dicom::dictionary_std::tags;
	use futures::StreamExt;

	async fn scheduled(service: &WorklistService) -> Vec<WorklistRecord> {
		let (_cancel_tx, cancel_rx) = watch::channel(false);
		service
			.find(&InMemDicomObject::new_empty(), cancel_rx)
			.filter_map(|response| async move {
				match response {
					FindResponse::Pending(record) => Some(*record),
					_ => None,
				}
			})
			.collect()
			.await
	}

	fn started(accession_number: &str, study_instance_uid: &str) -> InMemDicomObject {
		let scheduled = InMemDicomObject::from_element_iter([
			DataElement::new(
				tags::ACCESSION_NUMBER,
				VR::SH,
				PrimitiveValue::from(accession_number),
			),
			DataElement::new(
				tags::STUDY_INSTANCE_UID,
				VR::UI,
				PrimitiveValue::from(study_instance_uid),
			),
		]);
		InMemDicomObject::from_element_iter([
			DataElement::new(tags::MODALITY, VR::CS, PrimitiveValue::from("CT")),
			DataElement::new(
				tags::PERFORMED_PROCEDURE_STEP_STATUS,
				VR::CS,
				PrimitiveValue::from("IN PROGRESS"),
			),
			DataElement::new(
				tags::SCHEDULED_STEP_ATTRIBUTES_SEQUENCE,
				VR::SQ,
				DataSetSequence::from(vec![scheduled]),
			),
		])
	}

	#[tokio::test]
	async fn echo_succeeds() {
		let (store, _dir) = temp_store().await;
		assert_eq!(WorklistService::new(store, None).echo(), 0x0000);
	}

	#[tokio::test]
	async fn order_flows_from_schedule_to_completion() {
		let (store, _dir) = temp_store().await;
		let source = Arc::new(ScriptedOrderSource::with_orders(vec![order(
			42, "CT", "P1", "JOHN DOE",
		)]));
		let service = WorklistService::new(
			store.clone(),
			Some(Arc::clone(&source) as Arc<dyn OrderSource>),
		);

		let records = scheduled(&service).await;
		assert_eq!(records.len(), 1);
		let record = &records[0];
		assert_eq!(record.accession_number, "00000042");
		assert_eq!(record.patient_id, "P1");
		assert_eq!(record.scheduled_step.start_date, "20250101");
		assert_eq!(record.scheduled_step.start_time, "100000");
		assert_eq!(
			store.worklist_item("00000042").await.unwrap().unwrap().status,
			ItemStatus::Scheduled
		);

		service
			.create_step(
				Some(UI::from("1.2.826.0.1")),
				started(&record.accession_number, &record.study_instance_uid),
			)
			.await
			.unwrap();
		assert_eq!(
			store.worklist_item("00000042").await.unwrap().unwrap().status,
			ItemStatus::InProgress
		);
		assert!(scheduled(&service).await.is_empty());

		service
			.update_step(Some("1.2.826.0.1"), InMemDicomObject::new_empty())
			.await
			.unwrap();
		assert_eq!(
			store.worklist_item("00000042").await.unwrap().unwrap().status,
			ItemStatus::Completed
		);
		assert_eq!(
			source.updates(),
			vec![(42, OrderStatus::InProgress), (42, OrderStatus::Completed)]
		);
	}

	#[tokio::test]
	async fn update_without_instance_uid_is_rejected() {
		let (store, _dir) = temp_store().await;
		let service = WorklistService::new(store, None);

		let missing = service
			.update_step(None, InMemDicomObject::new_empty())
			.await;
		assert_eq!(missing.unwrap_err().status(), 0x0106);

		let unknown = service
			.update_step(Some("1.2.3"), InMemDicomObject::new_empty())
			.await;
		assert_eq!(unknown.unwrap_err().status(), 0x0112);
	}

	#[tokio::test]
	async fn sync_engine_requires_order_source() {
		let (store, _dir) = temp_store().await;
		assert!(WorklistService::new(store.clone(), None)
			.sync_engine()
			.is_none());

		let source: Arc<dyn OrderSource> = Arc::new(ScriptedOrderSource::default());
		assert!(WorklistService::new(store, Some(source))
			.sync_engine()
			.is_some());
	}
}

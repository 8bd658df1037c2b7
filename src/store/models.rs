use crate::types::{ItemStatus, StepStatus, AE, DA, TM, UI};
use chrono::NaiveDateTime;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Patient {
	pub patient_id: String,
	/// Display name as received from the order system (local script).
	pub patient_name: String,
	/// Romanized display name.
	pub patient_eng_name: Option<String>,
	pub birth_date: String,
	pub sex: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorklistItem {
	pub patient_id: String,
	pub accession_number: String,
	pub appointment_date: DA,
	pub appointment_time: TM,
	pub modality: String,
	pub aet: Option<AE>,
	pub study_instance_uid: Option<UI>,
	pub status: ItemStatus,
	pub emr_order_seq: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcedureStep {
	pub sop_instance_uid: UI,
	pub accession_number: String,
	pub study_instance_uid: UI,
	pub modality: String,
	pub status: StepStatus,
	pub start_time: NaiveDateTime,
	pub end_time: Option<NaiveDateTime>,
}

/// A `SCHEDULED` worklist item joined with its patient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledRow {
	pub accession_number: String,
	pub appointment_date: DA,
	pub appointment_time: TM,
	pub modality: String,
	pub study_instance_uid: Option<UI>,
	pub aet: Option<AE>,
	pub patient_id: String,
	pub patient_name: String,
	pub patient_eng_name: Option<String>,
	pub birth_date: String,
	pub sex: String,
}

/// Matching keys for [`ScheduledRow`]s. `None` matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ItemFilter {
	pub modality: Option<String>,
	pub date: Option<DA>,
	pub accession_number: Option<String>,
}

/// Data written when a performed procedure step starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartedStep {
	pub sop_instance_uid: UI,
	pub accession_number: String,
	pub study_instance_uid: UI,
	pub modality: String,
	pub start_time: NaiveDateTime,
}

/// The worklist item touched by a procedure step transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepTransition {
	pub accession_number: String,
	pub emr_order_seq: Option<i64>,
}

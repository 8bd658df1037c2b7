use chrono::NaiveDateTime;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};

use super::models::{
	ItemFilter, Patient, ProcedureStep, ScheduledRow, StartedStep, StepTransition, WorklistItem,
};
use super::StoreError;
use crate::config::ModalityDevices;
use crate::types::{ItemStatus, StepStatus, AE};

pub fn latest_order_seq(conn: &Connection) -> Result<Option<i64>, StoreError> {
	let seq = conn.query_row(
		"SELECT MAX(emr_order_seq) FROM worklist_items WHERE emr_order_seq IS NOT NULL",
		[],
		|row| row.get::<_, Option<i64>>(0),
	)?;
	Ok(seq)
}

pub fn find_patient(conn: &Connection, patient_id: &str) -> Result<Option<Patient>, StoreError> {
	let patient = conn
		.query_row(
			"SELECT patient_id, patient_name, patient_eng_name, birth_date, sex
			 FROM patients WHERE patient_id = ?1",
			params![patient_id],
			|row| {
				Ok(Patient {
					patient_id: row.get(0)?,
					patient_name: row.get(1)?,
					patient_eng_name: row.get(2)?,
					birth_date: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
					sex: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
				})
			},
		)
		.optional()?;
	Ok(patient)
}

pub fn insert_patient(conn: &Connection, patient: &Patient) -> Result<(), StoreError> {
	conn.execute(
		"INSERT INTO patients (patient_id, patient_name, patient_eng_name, birth_date, sex)
		 VALUES (?1, ?2, ?3, ?4, ?5)",
		params![
			patient.patient_id,
			patient.patient_name,
			patient.patient_eng_name,
			patient.birth_date,
			patient.sex,
		],
	)?;
	Ok(())
}

pub fn accession_exists(conn: &Connection, accession_number: &str) -> Result<bool, StoreError> {
	let exists = conn.query_row(
		"SELECT EXISTS(SELECT 1 FROM worklist_items WHERE accession_number = ?1)",
		params![accession_number],
		|row| row.get::<_, bool>(0),
	)?;
	Ok(exists)
}

pub fn insert_worklist_item(conn: &Connection, item: &WorklistItem) -> Result<(), StoreError> {
	conn.execute(
		"INSERT INTO worklist_items (patient_id, accession_number, appointment_date,
		 appointment_time, modality, aet, study_instance_uid, status, emr_order_seq)
		 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
		params![
			item.patient_id,
			item.accession_number,
			item.appointment_date,
			item.appointment_time,
			item.modality,
			item.aet,
			item.study_instance_uid,
			item.status.as_str(),
			item.emr_order_seq,
		],
	)?;
	Ok(())
}

pub fn worklist_item(
	conn: &Connection,
	accession_number: &str,
) -> Result<Option<WorklistItem>, StoreError> {
	let row = conn
		.query_row(
			"SELECT patient_id, accession_number, appointment_date, appointment_time, modality,
			 aet, study_instance_uid, status, emr_order_seq
			 FROM worklist_items WHERE accession_number = ?1",
			params![accession_number],
			|row| {
				Ok((
					WorklistItem {
						patient_id: row.get(0)?,
						accession_number: row.get(1)?,
						appointment_date: row.get(2)?,
						appointment_time: row.get(3)?,
						modality: row.get(4)?,
						aet: row.get(5)?,
						study_instance_uid: row.get(6)?,
						status: ItemStatus::Scheduled,
						emr_order_seq: row.get(8)?,
					},
					row.get::<_, String>(7)?,
				))
			},
		)
		.optional()?;

	row.map(|(mut item, status)| {
		item.status = ItemStatus::try_from(status.as_str()).map_err(|value| {
			StoreError::InvalidValue {
				column: "worklist_items.status",
				value,
			}
		})?;
		Ok(item)
	})
	.transpose()
}

fn set_item_status(
	conn: &Connection,
	accession_number: &str,
	status: ItemStatus,
) -> Result<usize, StoreError> {
	let updated = conn.execute(
		"UPDATE worklist_items SET status = ?1 WHERE accession_number = ?2",
		params![status.as_str(), accession_number],
	)?;
	Ok(updated)
}

pub fn set_study_instance_uid(
	conn: &Connection,
	accession_number: &str,
	study_instance_uid: &str,
) -> Result<bool, StoreError> {
	let updated = conn.execute(
		"UPDATE worklist_items SET study_instance_uid = ?1 WHERE accession_number = ?2",
		params![study_instance_uid, accession_number],
	)?;
	Ok(updated > 0)
}

pub fn scheduled_items(
	conn: &Connection,
	filter: &ItemFilter,
) -> Result<Vec<ScheduledRow>, StoreError> {
	let mut sql = String::from(
		"SELECT wi.accession_number, wi.appointment_date, wi.appointment_time, wi.modality,
		 wi.study_instance_uid, wi.aet, p.patient_id, p.patient_name, p.patient_eng_name,
		 p.birth_date, p.sex
		 FROM worklist_items wi
		 JOIN patients p ON p.patient_id = wi.patient_id
		 WHERE wi.status = ?1",
	);
	let mut values = vec![ItemStatus::Scheduled.as_str().to_owned()];

	let predicates = [
		("wi.accession_number", &filter.accession_number),
		("wi.appointment_date", &filter.date),
		("wi.modality", &filter.modality),
	];
	for (column, value) in predicates {
		if let Some(value) = value {
			values.push(value.clone());
			sql.push_str(&format!(" AND {column} = ?{}", values.len()));
		}
	}
	sql.push_str(" ORDER BY wi.appointment_date, wi.appointment_time, wi.id");

	let mut stmt = conn.prepare(&sql)?;
	let rows = stmt.query_map(params_from_iter(values.iter()), map_scheduled_row)?;
	let rows = rows.collect::<Result<Vec<_>, _>>()?;
	Ok(rows)
}

fn map_scheduled_row(row: &Row<'_>) -> rusqlite::Result<ScheduledRow> {
	Ok(ScheduledRow {
		accession_number: row.get(0)?,
		appointment_date: row.get(1)?,
		appointment_time: row.get(2)?,
		modality: row.get(3)?,
		study_instance_uid: row.get(4)?,
		aet: row.get(5)?,
		patient_id: row.get(6)?,
		patient_name: row.get(7)?,
		patient_eng_name: row.get(8)?,
		birth_date: row.get::<_, Option<String>>(9)?.unwrap_or_default(),
		sex: row.get::<_, Option<String>>(10)?.unwrap_or_default(),
	})
}

pub fn replace_modality_devices(
	conn: &Connection,
	devices: &ModalityDevices,
) -> Result<usize, StoreError> {
	conn.execute("DELETE FROM modality_aets", [])?;

	let mut stmt = conn.prepare("INSERT INTO modality_aets (modality, aet) VALUES (?1, ?2)")?;
	let mut inserted = 0;
	for (modality, aets) in devices.iter() {
		for aet in aets {
			inserted += stmt.execute(params![modality, aet])?;
		}
	}
	Ok(inserted)
}

pub fn devices_for_modality(conn: &Connection, modality: &str) -> Result<Vec<AE>, StoreError> {
	let mut stmt = conn.prepare("SELECT aet FROM modality_aets WHERE modality = ?1 ORDER BY id")?;
	let aets = stmt
		.query_map(params![modality], |row| row.get::<_, AE>(0))?
		.collect::<Result<Vec<_>, _>>()?;
	Ok(aets)
}

/// Moves the referenced worklist item to `IN_PROGRESS` and starts tracking the step.
/// Returns `None` if no worklist item carries the accession number.
pub fn record_step_started(
	conn: &Connection,
	step: &StartedStep,
) -> Result<Option<StepTransition>, StoreError> {
	let Some(item) = worklist_item(conn, &step.accession_number)? else {
		return Ok(None);
	};

	set_item_status(conn, &item.accession_number, ItemStatus::InProgress)?;
	conn.execute(
		"INSERT INTO mpps_tracking (sop_instance_uid, accession_number, study_instance_uid,
		 modality, status, start_time)
		 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
		params![
			step.sop_instance_uid,
			step.accession_number,
			step.study_instance_uid,
			step.modality,
			StepStatus::InProgress.as_str(),
			step.start_time,
		],
	)?;

	Ok(Some(StepTransition {
		accession_number: item.accession_number,
		emr_order_seq: item.emr_order_seq,
	}))
}

/// Marks the tracked step and its worklist item as `COMPLETED`.
/// Returns `None` if the step is not tracked.
pub fn record_step_completed(
	conn: &Connection,
	sop_instance_uid: &str,
	end_time: NaiveDateTime,
) -> Result<Option<StepTransition>, StoreError> {
	let Some(step) = procedure_step(conn, sop_instance_uid)? else {
		return Ok(None);
	};

	conn.execute(
		"UPDATE mpps_tracking SET status = ?1, end_time = ?2 WHERE sop_instance_uid = ?3",
		params![StepStatus::Completed.as_str(), end_time, sop_instance_uid],
	)?;

	let emr_order_seq = match worklist_item(conn, &step.accession_number)? {
		Some(item) => {
			set_item_status(conn, &item.accession_number, ItemStatus::Completed)?;
			item.emr_order_seq
		}
		None => None,
	};

	Ok(Some(StepTransition {
		accession_number: step.accession_number,
		emr_order_seq,
	}))
}

pub fn procedure_step(
	conn: &Connection,
	sop_instance_uid: &str,
) -> Result<Option<ProcedureStep>, StoreError> {
	procedure_steps(conn, "sop_instance_uid", sop_instance_uid).map(|mut steps| steps.pop())
}

#[cfg(test)]
pub fn procedure_steps_for_accession(
	conn: &Connection,
	accession_number: &str,
) -> Result<Vec<ProcedureStep>, StoreError> {
	procedure_steps(conn, "accession_number", accession_number)
}

fn procedure_steps(
	conn: &Connection,
	column: &'static str,
	value: &str,
) -> Result<Vec<ProcedureStep>, StoreError> {
	let mut stmt = conn.prepare(&format!(
		"SELECT sop_instance_uid, accession_number, study_instance_uid, modality, status,
		 start_time, end_time
		 FROM mpps_tracking WHERE {column} = ?1 ORDER BY id"
	))?;

	let rows = stmt
		.query_map(params![value], |row| {
			Ok((
				row.get::<_, String>(0)?,
				row.get::<_, String>(1)?,
				row.get::<_, String>(2)?,
				row.get::<_, String>(3)?,
				row.get::<_, String>(4)?,
				row.get::<_, NaiveDateTime>(5)?,
				row.get::<_, Option<NaiveDateTime>>(6)?,
			))
		})?
		.collect::<Result<Vec<_>, _>>()?;

	let mut steps = Vec::with_capacity(rows.len());
	for (sop_instance_uid, accession_number, study_instance_uid, modality, status, start, end) in
		rows
	{
		steps.push(ProcedureStep {
			sop_instance_uid,
			accession_number,
			study_instance_uid,
			modality,
			status: StepStatus::try_from(status.as_str()).map_err(|value| {
				StoreError::InvalidValue {
					column: "mpps_tracking.status",
					value,
				}
			})?,
			start_time: start,
			end_time: end,
		});
	}
	Ok(steps)
}

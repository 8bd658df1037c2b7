use super::{int_attribute, uid_attribute, DicomMessage, ReadError};
use super::{DATA_SET_EXISTS, DATA_SET_MISSING};
use crate::types::{UI, US};
use dicom::core::{DataElement, VR};
use dicom::dicom_value;
use dicom::dictionary_std::{tags, uids};
use dicom::object::InMemDicomObject;

// Magic numbers defined by the DICOM specification.
pub const COMMAND_FIELD_COMPOSITE_FIND_REQUEST: US = 0x0020;
pub const COMMAND_FIELD_COMPOSITE_FIND_RESPONSE: US = 0x8020;
pub const COMMAND_FIELD_COMPOSITE_CANCEL_REQUEST: US = 0x0FFF;

/// C-FIND-RQ
/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part07/chapter_9.html#table_9.1-2>
pub struct CompositeFindRequest {
	pub message_id: US,
	pub affected_sop_class_uid: UI,
	/// The query keys. An absent identifier matches everything.
	pub identifier: InMemDicomObject,
}

impl TryFrom<DicomMessage> for CompositeFindRequest {
	type Error = ReadError;

	fn try_from(message: DicomMessage) -> Result<Self, Self::Error> {
		Ok(Self {
			message_id: int_attribute(&message.command, tags::MESSAGE_ID)?,
			affected_sop_class_uid: uid_attribute(&message.command, tags::AFFECTED_SOP_CLASS_UID)
				.unwrap_or_else(|| UI::from(uids::MODALITY_WORKLIST_INFORMATION_MODEL_FIND)),
			identifier: message.data.unwrap_or_else(InMemDicomObject::new_empty),
		})
	}
}

/// C-CANCEL-RQ
/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part07/chapter_9.html#table_9.3-3>
#[derive(Debug)]
pub struct CompositeCancelRequest {
	pub message_id_being_responded_to: US,
}

impl TryFrom<DicomMessage> for CompositeCancelRequest {
	type Error = ReadError;

	fn try_from(message: DicomMessage) -> Result<Self, Self::Error> {
		Ok(Self {
			message_id_being_responded_to: int_attribute(
				&message.command,
				tags::MESSAGE_ID_BEING_RESPONDED_TO,
			)?,
		})
	}
}

/// C-FIND-RSP
/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part07/chapter_9.html#table_9.1-3>
#[derive(Debug)]
pub struct CompositeFindResponse {
	pub message_id: US,
	pub affected_sop_class_uid: UI,
	pub status: US,
	/// Only present for pending responses.
	pub identifier: Option<InMemDicomObject>,
}

impl From<CompositeFindResponse> for DicomMessage {
	#[rustfmt::skip]
	fn from(response: CompositeFindResponse) -> Self {
		let data_set_type = if response.identifier.is_some() { DATA_SET_EXISTS } else { DATA_SET_MISSING };
		let command = InMemDicomObject::command_from_element_iter([
			DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, response.affected_sop_class_uid)),
			DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_COMPOSITE_FIND_RESPONSE])),
			DataElement::new(tags::MESSAGE_ID_BEING_RESPONDED_TO, VR::US, dicom_value!(U16, [response.message_id])),
			DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [data_set_type])),
			DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [response.status])),
		]);

		Self {
			command,
			data: response.identifier,
			presentation_context_id: None,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use dicom::core::PrimitiveValue;
	use dicom::object::mem::InMemElement;

	#[test]
	fn request_without_identifier_matches_everything() {
		let message = DicomMessage {
			command: InMemDicomObject::command_from_element_iter([
				DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_COMPOSITE_FIND_REQUEST])),
				DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [5])),
			]),
			data: None,
			presentation_context_id: Some(1),
		};

		let request = CompositeFindRequest::try_from(message).unwrap();
		assert_eq!(request.message_id, 5);
		assert_eq!(
			request.affected_sop_class_uid,
			uids::MODALITY_WORKLIST_INFORMATION_MODEL_FIND
		);
		assert_eq!(request.identifier.iter().count(), 0);
	}

	#[test]
	fn request_requires_message_id() {
		let message = DicomMessage {
			command: InMemDicomObject::command_from_element_iter([DataElement::new(
				tags::COMMAND_FIELD,
				VR::US,
				dicom_value!(U16, [COMMAND_FIELD_COMPOSITE_FIND_REQUEST]),
			)]),
			data: None,
			presentation_context_id: Some(1),
		};

		assert!(matches!(
			CompositeFindRequest::try_from(message),
			Err(ReadError::MissingAttribute(tag)) if tag == tags::MESSAGE_ID
		));
	}

	#[test]
	fn pending_response_carries_identifier() {
		let identifier = InMemDicomObject::from_element_iter([DataElement::new(
			tags::ACCESSION_NUMBER,
			VR::SH,
			PrimitiveValue::from("00000042"),
		)]);
		let message = DicomMessage::from(CompositeFindResponse {
			message_id: 5,
			affected_sop_class_uid: UI::from(uids::MODALITY_WORKLIST_INFORMATION_MODEL_FIND),
			status: 0xFF00,
			identifier: Some(identifier),
		});

		let data_set_type = message
			.command
			.get(tags::COMMAND_DATA_SET_TYPE)
			.map(InMemElement::to_int::<US>)
			.and_then(Result::ok);
		assert_eq!(data_set_type, Some(DATA_SET_EXISTS));
		assert!(message.data.is_some());
	}

	#[test]
	fn final_response_has_no_data_set() {
		let message = DicomMessage::from(CompositeFindResponse {
			message_id: 5,
			affected_sop_class_uid: UI::from(uids::MODALITY_WORKLIST_INFORMATION_MODEL_FIND),
			status: 0x0000,
			identifier: None,
		});

		let data_set_type = message
			.command
			.get(tags::COMMAND_DATA_SET_TYPE)
			.map(InMemElement::to_int::<US>)
			.and_then(Result::ok);
		assert_eq!(data_set_type, Some(DATA_SET_MISSING));
		assert!(message.data.is_none());
	}

	#[test]
	fn cancel_names_the_running_query() {
		let message = DicomMessage {
			command: InMemDicomObject::command_from_element_iter([
				DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_COMPOSITE_CANCEL_REQUEST])),
				DataElement::new(tags::MESSAGE_ID_BEING_RESPONDED_TO, VR::US, dicom_value!(U16, [5])),
				DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [DATA_SET_MISSING])),
			]),
			data: None,
			presentation_context_id: Some(1),
		};

		let request = CompositeCancelRequest::try_from(message).unwrap();
		assert_eq!(request.message_id_being_responded_to, 5);
	}
}

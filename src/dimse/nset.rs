use super::{int_attribute, uid_attribute, DicomMessage, ReadError};
use super::{DATA_SET_EXISTS, DATA_SET_MISSING};
use crate::types::{UI, US};
use dicom::core::{DataElement, VR};
use dicom::dicom_value;
use dicom::dictionary_std::{tags, uids};
use dicom::object::InMemDicomObject;

pub const COMMAND_FIELD_NORMALIZED_SET_REQUEST: US = 0x0120;
pub const COMMAND_FIELD_NORMALIZED_SET_RESPONSE: US = 0x8120;

/// N-SET-RQ
/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part07/sect_10.3.3.html>
pub struct NormalizedSetRequest {
	pub message_id: US,
	pub requested_sop_class_uid: UI,
	/// Required by the standard. Its absence is answered with an error status.
	pub requested_sop_instance_uid: Option<UI>,
	pub modifications: InMemDicomObject,
}

impl TryFrom<DicomMessage> for NormalizedSetRequest {
	type Error = ReadError;

	fn try_from(message: DicomMessage) -> Result<Self, Self::Error> {
		Ok(Self {
			message_id: int_attribute(&message.command, tags::MESSAGE_ID)?,
			requested_sop_class_uid: uid_attribute(&message.command, tags::REQUESTED_SOP_CLASS_UID)
				.unwrap_or_else(|| UI::from(uids::MODALITY_PERFORMED_PROCEDURE_STEP)),
			requested_sop_instance_uid: uid_attribute(
				&message.command,
				tags::REQUESTED_SOP_INSTANCE_UID,
			),
			modifications: message.data.unwrap_or_else(InMemDicomObject::new_empty),
		})
	}
}

/// N-SET-RSP
#[derive(Debug)]
pub struct NormalizedSetResponse {
	pub message_id: US,
	pub affected_sop_class_uid: UI,
	pub affected_sop_instance_uid: Option<UI>,
	pub status: US,
	pub attributes: Option<InMemDicomObject>,
}

impl From<NormalizedSetResponse> for DicomMessage {
	#[rustfmt::skip]
	fn from(response: NormalizedSetResponse) -> Self {
		let data_set_type = if response.attributes.is_some() { DATA_SET_EXISTS } else { DATA_SET_MISSING };
		let mut elements = vec![
			DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, response.affected_sop_class_uid)),
			DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_NORMALIZED_SET_RESPONSE])),
			DataElement::new(tags::MESSAGE_ID_BEING_RESPONDED_TO, VR::US, dicom_value!(U16, [response.message_id])),
			DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [data_set_type])),
			DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [response.status])),
		];
		if let Some(sop_instance_uid) = response.affected_sop_instance_uid {
			elements.push(DataElement::new(tags::AFFECTED_SOP_INSTANCE_UID, VR::UI, dicom_value!(Str, sop_instance_uid)));
		}
		let command = InMemDicomObject::command_from_element_iter(elements);

		Self {
			command,
			data: response.attributes,
			presentation_context_id: None,
		}
	}
}

//! DIMSE command set construction and interpretation
//!
//! A command set is a collection of tagged data elements in group 0000H,
//! always encoded in Implicit VR Little Endian
//! regardless of the transfer syntax negotiated for the data sets
//! of its presentation context (PS3.7 §6.3.1).
//! [`CommandSet`] wraps the in-memory object,
//! offers typed accessors over the command fields,
//! and computes the Command Group Length element on encoding.

use dicom_core::{dicom_value, DataElement, PrimitiveValue, Tag, VR};
use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;
use dicom_transfer_syntax_registry::entries;
use snafu::{OptionExt, ResultExt};

use super::{
    CommandField, DecodeSetSnafu, EncodeSetSnafu, InvalidFieldSnafu, MissingFieldSnafu, Priority,
    Result,
};

/// Command data set type value declaring that no data set follows.
const DATA_SET_ABSENT: u16 = 0x0101;
/// Command data set type value declaring that a data set follows.
const DATA_SET_PRESENT: u16 = 0x0001;

/// Sub-operation progress counts
/// reported by C-GET and C-MOVE responses.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct SubOperations {
    pub remaining: Option<u16>,
    pub completed: Option<u16>,
    pub failed: Option<u16>,
    pub warning: Option<u16>,
}

/// A DIMSE command set.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandSet {
    obj: InMemDicomObject,
}

impl CommandSet {
    /// Wrap an existing command data set.
    pub fn from_object(obj: InMemDicomObject) -> Self {
        CommandSet { obj }
    }

    /// Access the underlying data elements.
    pub fn object(&self) -> &InMemDicomObject {
        &self.obj
    }

    /// Decode a command set from Implicit VR Little Endian bytes.
    pub fn read(data: &[u8]) -> Result<Self> {
        let ts = entries::IMPLICIT_VR_LITTLE_ENDIAN.erased();
        let mut obj = InMemDicomObject::read_dataset_with_ts(data, &ts)
            .context(DecodeSetSnafu)?;
        // group length is re-derived on write
        obj.remove_element(tags::COMMAND_GROUP_LENGTH);
        Ok(CommandSet { obj })
    }

    /// Encode the command set in Implicit VR Little Endian,
    /// prepending the Command Group Length element (0000,0000)
    /// computed over the remaining elements.
    pub fn write(&self) -> Result<Vec<u8>> {
        let ts = entries::IMPLICIT_VR_LITTLE_ENDIAN.erased();
        let mut body = Vec::new();
        self.obj
            .write_dataset_with_ts(&mut body, &ts)
            .context(EncodeSetSnafu)?;

        let mut data = Vec::with_capacity(body.len() + 12);
        // (0000,0000) UL, implicit VR: tag, length 4, group length value
        data.extend_from_slice(&[0x00, 0x00, 0x00, 0x00, 0x04, 0x00, 0x00, 0x00]);
        data.extend_from_slice(&(body.len() as u32).to_le_bytes());
        data.extend_from_slice(&body);
        Ok(data)
    }

    fn uint16(&self, tag: Tag, name: &'static str) -> Result<u16> {
        self.obj
            .get(tag)
            .context(MissingFieldSnafu { name })?
            .to_int::<u16>()
            .context(InvalidFieldSnafu { name })
    }

    fn uint16_opt(&self, tag: Tag) -> Option<u16> {
        self.obj.get(tag).and_then(|e| e.to_int::<u16>().ok())
    }

    fn str_opt(&self, tag: Tag) -> Option<String> {
        self.obj.get(tag).and_then(|e| e.to_str().ok()).map(|s| {
            s.trim_end_matches(|c: char| c.is_whitespace() || c == '\0')
                .to_string()
        })
    }

    /// The kind of operation this command set conveys.
    pub fn command_field(&self) -> Result<CommandField> {
        CommandField::from_code(self.uint16(tags::COMMAND_FIELD, "Command Field")?)
    }

    /// The message identifier of a request.
    pub fn message_id(&self) -> Result<u16> {
        self.uint16(tags::MESSAGE_ID, "Message ID")
    }

    /// The message identifier a response refers to.
    pub fn message_id_being_responded_to(&self) -> Result<u16> {
        self.uint16(
            tags::MESSAGE_ID_BEING_RESPONDED_TO,
            "Message ID Being Responded To",
        )
    }

    /// The status of a response.
    pub fn status(&self) -> Result<u16> {
        self.uint16(tags::STATUS, "Status")
    }

    /// Whether the command declares an accompanying data set.
    pub fn has_data_set(&self) -> Result<bool> {
        Ok(self.uint16(tags::COMMAND_DATA_SET_TYPE, "Command Data Set Type")? != DATA_SET_ABSENT)
    }

    /// Declare whether a data set accompanies this command.
    pub fn set_data_set_present(&mut self, present: bool) {
        self.obj.put(DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(
                U16,
                [if present { DATA_SET_PRESENT } else { DATA_SET_ABSENT }]
            ),
        ));
    }

    pub fn affected_sop_class_uid(&self) -> Option<String> {
        self.str_opt(tags::AFFECTED_SOP_CLASS_UID)
    }

    pub fn affected_sop_instance_uid(&self) -> Option<String> {
        self.str_opt(tags::AFFECTED_SOP_INSTANCE_UID)
    }

    pub fn requested_sop_class_uid(&self) -> Option<String> {
        self.str_opt(tags::REQUESTED_SOP_CLASS_UID)
    }

    pub fn requested_sop_instance_uid(&self) -> Option<String> {
        self.str_opt(tags::REQUESTED_SOP_INSTANCE_UID)
    }

    pub fn move_destination(&self) -> Option<String> {
        self.str_opt(tags::MOVE_DESTINATION)
    }

    pub fn move_originator_ae_title(&self) -> Option<String> {
        self.str_opt(tags::MOVE_ORIGINATOR_APPLICATION_ENTITY_TITLE)
    }

    pub fn move_originator_message_id(&self) -> Option<u16> {
        self.uint16_opt(tags::MOVE_ORIGINATOR_MESSAGE_ID)
    }

    pub fn event_type_id(&self) -> Option<u16> {
        self.uint16_opt(tags::EVENT_TYPE_ID)
    }

    pub fn action_type_id(&self) -> Option<u16> {
        self.uint16_opt(tags::ACTION_TYPE_ID)
    }

    /// The sub-operation progress counts of a C-GET or C-MOVE response.
    pub fn sub_operations(&self) -> SubOperations {
        SubOperations {
            remaining: self.uint16_opt(tags::NUMBER_OF_REMAINING_SUBOPERATIONS),
            completed: self.uint16_opt(tags::NUMBER_OF_COMPLETED_SUBOPERATIONS),
            failed: self.uint16_opt(tags::NUMBER_OF_FAILED_SUBOPERATIONS),
            warning: self.uint16_opt(tags::NUMBER_OF_WARNING_SUBOPERATIONS),
        }
    }

    // request builders

    pub fn c_echo_rq(message_id: u16, sop_class_uid: &str) -> Self {
        Self::from_object(InMemDicomObject::from_element_iter([
            DataElement::new(
                tags::AFFECTED_SOP_CLASS_UID,
                VR::UI,
                dicom_value!(Str, sop_class_uid),
            ),
            DataElement::new(
                tags::COMMAND_FIELD,
                VR::US,
                dicom_value!(U16, [CommandField::CEchoRq as u16]),
            ),
            DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [message_id])),
            DataElement::new(
                tags::COMMAND_DATA_SET_TYPE,
                VR::US,
                dicom_value!(U16, [DATA_SET_ABSENT]),
            ),
        ]))
    }

    pub fn c_echo_rsp(message_id_being_responded_to: u16, sop_class_uid: &str, status: u16) -> Self {
        Self::from_object(InMemDicomObject::from_element_iter([
            DataElement::new(
                tags::AFFECTED_SOP_CLASS_UID,
                VR::UI,
                dicom_value!(Str, sop_class_uid),
            ),
            DataElement::new(
                tags::COMMAND_FIELD,
                VR::US,
                dicom_value!(U16, [CommandField::CEchoRsp as u16]),
            ),
            DataElement::new(
                tags::MESSAGE_ID_BEING_RESPONDED_TO,
                VR::US,
                dicom_value!(U16, [message_id_being_responded_to]),
            ),
            DataElement::new(
                tags::COMMAND_DATA_SET_TYPE,
                VR::US,
                dicom_value!(U16, [DATA_SET_ABSENT]),
            ),
            DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [status])),
        ]))
    }

    pub fn c_store_rq(
        message_id: u16,
        sop_class_uid: &str,
        sop_instance_uid: &str,
        priority: Priority,
        move_originator: Option<(&str, u16)>,
    ) -> Self {
        let mut obj = InMemDicomObject::from_element_iter([
            DataElement::new(
                tags::AFFECTED_SOP_CLASS_UID,
                VR::UI,
                dicom_value!(Str, sop_class_uid),
            ),
            DataElement::new(
                tags::COMMAND_FIELD,
                VR::US,
                dicom_value!(U16, [CommandField::CStoreRq as u16]),
            ),
            DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [message_id])),
            DataElement::new(tags::PRIORITY, VR::US, dicom_value!(U16, [priority as u16])),
            DataElement::new(
                tags::COMMAND_DATA_SET_TYPE,
                VR::US,
                dicom_value!(U16, [DATA_SET_PRESENT]),
            ),
            DataElement::new(
                tags::AFFECTED_SOP_INSTANCE_UID,
                VR::UI,
                dicom_value!(Str, sop_instance_uid),
            ),
        ]);
        if let Some((originator_aet, originator_id)) = move_originator {
            obj.put(DataElement::new(
                tags::MOVE_ORIGINATOR_APPLICATION_ENTITY_TITLE,
                VR::AE,
                dicom_value!(Str, originator_aet),
            ));
            obj.put(DataElement::new(
                tags::MOVE_ORIGINATOR_MESSAGE_ID,
                VR::US,
                dicom_value!(U16, [originator_id]),
            ));
        }
        Self::from_object(obj)
    }

    pub fn c_store_rsp(
        message_id_being_responded_to: u16,
        sop_class_uid: &str,
        sop_instance_uid: &str,
        status: u16,
    ) -> Self {
        Self::from_object(InMemDicomObject::from_element_iter([
            DataElement::new(
                tags::AFFECTED_SOP_CLASS_UID,
                VR::UI,
                dicom_value!(Str, sop_class_uid),
            ),
            DataElement::new(
                tags::COMMAND_FIELD,
                VR::US,
                dicom_value!(U16, [CommandField::CStoreRsp as u16]),
            ),
            DataElement::new(
                tags::MESSAGE_ID_BEING_RESPONDED_TO,
                VR::US,
                dicom_value!(U16, [message_id_being_responded_to]),
            ),
            DataElement::new(
                tags::COMMAND_DATA_SET_TYPE,
                VR::US,
                dicom_value!(U16, [DATA_SET_ABSENT]),
            ),
            DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [status])),
            DataElement::new(
                tags::AFFECTED_SOP_INSTANCE_UID,
                VR::UI,
                dicom_value!(Str, sop_instance_uid),
            ),
        ]))
    }

    pub fn c_find_rq(message_id: u16, sop_class_uid: &str, priority: Priority) -> Self {
        Self::from_object(InMemDicomObject::from_element_iter([
            DataElement::new(
                tags::AFFECTED_SOP_CLASS_UID,
                VR::UI,
                dicom_value!(Str, sop_class_uid),
            ),
            DataElement::new(
                tags::COMMAND_FIELD,
                VR::US,
                dicom_value!(U16, [CommandField::CFindRq as u16]),
            ),
            DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [message_id])),
            DataElement::new(tags::PRIORITY, VR::US, dicom_value!(U16, [priority as u16])),
            DataElement::new(
                tags::COMMAND_DATA_SET_TYPE,
                VR::US,
                dicom_value!(U16, [DATA_SET_PRESENT]),
            ),
        ]))
    }

    pub fn c_find_rsp(message_id_being_responded_to: u16, sop_class_uid: &str, status: u16) -> Self {
        Self::from_object(InMemDicomObject::from_element_iter([
            DataElement::new(
                tags::AFFECTED_SOP_CLASS_UID,
                VR::UI,
                dicom_value!(Str, sop_class_uid),
            ),
            DataElement::new(
                tags::COMMAND_FIELD,
                VR::US,
                dicom_value!(U16, [CommandField::CFindRsp as u16]),
            ),
            DataElement::new(
                tags::MESSAGE_ID_BEING_RESPONDED_TO,
                VR::US,
                dicom_value!(U16, [message_id_being_responded_to]),
            ),
            DataElement::new(
                tags::COMMAND_DATA_SET_TYPE,
                VR::US,
                dicom_value!(U16, [DATA_SET_ABSENT]),
            ),
            DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [status])),
        ]))
    }

    pub fn c_get_rq(message_id: u16, sop_class_uid: &str, priority: Priority) -> Self {
        let mut command = Self::c_find_rq(message_id, sop_class_uid, priority);
        command.obj.put(DataElement::new(
            tags::COMMAND_FIELD,
            VR::US,
            dicom_value!(U16, [CommandField::CGetRq as u16]),
        ));
        command
    }

    pub fn c_get_rsp(
        message_id_being_responded_to: u16,
        sop_class_uid: &str,
        status: u16,
        sub_operations: SubOperations,
    ) -> Self {
        let mut command = Self::c_find_rsp(message_id_being_responded_to, sop_class_uid, status);
        command.obj.put(DataElement::new(
            tags::COMMAND_FIELD,
            VR::US,
            dicom_value!(U16, [CommandField::CGetRsp as u16]),
        ));
        command.put_sub_operations(sub_operations);
        command
    }

    pub fn c_move_rq(
        message_id: u16,
        sop_class_uid: &str,
        priority: Priority,
        move_destination: &str,
    ) -> Self {
        let mut command = Self::c_find_rq(message_id, sop_class_uid, priority);
        command.obj.put(DataElement::new(
            tags::COMMAND_FIELD,
            VR::US,
            dicom_value!(U16, [CommandField::CMoveRq as u16]),
        ));
        command.obj.put(DataElement::new(
            tags::MOVE_DESTINATION,
            VR::AE,
            dicom_value!(Str, move_destination),
        ));
        command
    }

    pub fn c_move_rsp(
        message_id_being_responded_to: u16,
        sop_class_uid: &str,
        status: u16,
        sub_operations: SubOperations,
    ) -> Self {
        let mut command = Self::c_find_rsp(message_id_being_responded_to, sop_class_uid, status);
        command.obj.put(DataElement::new(
            tags::COMMAND_FIELD,
            VR::US,
            dicom_value!(U16, [CommandField::CMoveRsp as u16]),
        ));
        command.put_sub_operations(sub_operations);
        command
    }

    /// Build a C-CANCEL request
    /// for the operation with the given message identifier.
    pub fn c_cancel_rq(message_id_being_responded_to: u16) -> Self {
        Self::from_object(InMemDicomObject::from_element_iter([
            DataElement::new(
                tags::COMMAND_FIELD,
                VR::US,
                dicom_value!(U16, [CommandField::CCancelRq as u16]),
            ),
            DataElement::new(
                tags::MESSAGE_ID_BEING_RESPONDED_TO,
                VR::US,
                dicom_value!(U16, [message_id_being_responded_to]),
            ),
            DataElement::new(
                tags::COMMAND_DATA_SET_TYPE,
                VR::US,
                dicom_value!(U16, [DATA_SET_ABSENT]),
            ),
        ]))
    }

    fn put_sub_operations(&mut self, sub_operations: SubOperations) {
        let fields = [
            (tags::NUMBER_OF_REMAINING_SUBOPERATIONS, sub_operations.remaining),
            (tags::NUMBER_OF_COMPLETED_SUBOPERATIONS, sub_operations.completed),
            (tags::NUMBER_OF_FAILED_SUBOPERATIONS, sub_operations.failed),
            (tags::NUMBER_OF_WARNING_SUBOPERATIONS, sub_operations.warning),
        ];
        for (tag, value) in fields {
            if let Some(value) = value {
                self.obj
                    .put(DataElement::new(tag, VR::US, dicom_value!(U16, [value])));
            }
        }
    }

    // normalized service builders

    fn n_rq_base(command_field: CommandField, message_id: u16) -> InMemDicomObject {
        InMemDicomObject::from_element_iter([
            DataElement::new(
                tags::COMMAND_FIELD,
                VR::US,
                dicom_value!(U16, [command_field as u16]),
            ),
            DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [message_id])),
            DataElement::new(
                tags::COMMAND_DATA_SET_TYPE,
                VR::US,
                dicom_value!(U16, [DATA_SET_ABSENT]),
            ),
        ])
    }

    fn n_rsp_base(
        command_field: CommandField,
        message_id_being_responded_to: u16,
        sop_class_uid: &str,
        status: u16,
    ) -> InMemDicomObject {
        InMemDicomObject::from_element_iter([
            DataElement::new(
                tags::AFFECTED_SOP_CLASS_UID,
                VR::UI,
                dicom_value!(Str, sop_class_uid),
            ),
            DataElement::new(
                tags::COMMAND_FIELD,
                VR::US,
                dicom_value!(U16, [command_field as u16]),
            ),
            DataElement::new(
                tags::MESSAGE_ID_BEING_RESPONDED_TO,
                VR::US,
                dicom_value!(U16, [message_id_being_responded_to]),
            ),
            DataElement::new(
                tags::COMMAND_DATA_SET_TYPE,
                VR::US,
                dicom_value!(U16, [DATA_SET_ABSENT]),
            ),
            DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [status])),
        ])
    }

    fn put_requested_sop(obj: &mut InMemDicomObject, sop_class_uid: &str, sop_instance_uid: &str) {
        obj.put(DataElement::new(
            tags::REQUESTED_SOP_CLASS_UID,
            VR::UI,
            dicom_value!(Str, sop_class_uid),
        ));
        obj.put(DataElement::new(
            tags::REQUESTED_SOP_INSTANCE_UID,
            VR::UI,
            dicom_value!(Str, sop_instance_uid),
        ));
    }

    pub fn n_event_report_rq(
        message_id: u16,
        sop_class_uid: &str,
        sop_instance_uid: &str,
        event_type_id: u16,
    ) -> Self {
        let mut obj = Self::n_rq_base(CommandField::NEventReportRq, message_id);
        obj.put(DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            dicom_value!(Str, sop_class_uid),
        ));
        obj.put(DataElement::new(
            tags::AFFECTED_SOP_INSTANCE_UID,
            VR::UI,
            dicom_value!(Str, sop_instance_uid),
        ));
        obj.put(DataElement::new(
            tags::EVENT_TYPE_ID,
            VR::US,
            dicom_value!(U16, [event_type_id]),
        ));
        Self::from_object(obj)
    }

    pub fn n_event_report_rsp(
        message_id_being_responded_to: u16,
        sop_class_uid: &str,
        status: u16,
    ) -> Self {
        Self::from_object(Self::n_rsp_base(
            CommandField::NEventReportRsp,
            message_id_being_responded_to,
            sop_class_uid,
            status,
        ))
    }

    pub fn n_get_rq(
        message_id: u16,
        sop_class_uid: &str,
        sop_instance_uid: &str,
        attribute_list: &[Tag],
    ) -> Self {
        let mut obj = Self::n_rq_base(CommandField::NGetRq, message_id);
        Self::put_requested_sop(&mut obj, sop_class_uid, sop_instance_uid);
        if !attribute_list.is_empty() {
            obj.put(DataElement::new(
                tags::ATTRIBUTE_IDENTIFIER_LIST,
                VR::AT,
                PrimitiveValue::Tags(attribute_list.iter().copied().collect()),
            ));
        }
        Self::from_object(obj)
    }

    pub fn n_get_rsp(
        message_id_being_responded_to: u16,
        sop_class_uid: &str,
        status: u16,
    ) -> Self {
        Self::from_object(Self::n_rsp_base(
            CommandField::NGetRsp,
            message_id_being_responded_to,
            sop_class_uid,
            status,
        ))
    }

    pub fn n_set_rq(message_id: u16, sop_class_uid: &str, sop_instance_uid: &str) -> Self {
        let mut obj = Self::n_rq_base(CommandField::NSetRq, message_id);
        Self::put_requested_sop(&mut obj, sop_class_uid, sop_instance_uid);
        Self::from_object(obj)
    }

    pub fn n_set_rsp(
        message_id_being_responded_to: u16,
        sop_class_uid: &str,
        status: u16,
    ) -> Self {
        Self::from_object(Self::n_rsp_base(
            CommandField::NSetRsp,
            message_id_being_responded_to,
            sop_class_uid,
            status,
        ))
    }

    pub fn n_action_rq(
        message_id: u16,
        sop_class_uid: &str,
        sop_instance_uid: &str,
        action_type_id: u16,
    ) -> Self {
        let mut obj = Self::n_rq_base(CommandField::NActionRq, message_id);
        Self::put_requested_sop(&mut obj, sop_class_uid, sop_instance_uid);
        obj.put(DataElement::new(
            tags::ACTION_TYPE_ID,
            VR::US,
            dicom_value!(U16, [action_type_id]),
        ));
        Self::from_object(obj)
    }

    pub fn n_action_rsp(
        message_id_being_responded_to: u16,
        sop_class_uid: &str,
        status: u16,
    ) -> Self {
        Self::from_object(Self::n_rsp_base(
            CommandField::NActionRsp,
            message_id_being_responded_to,
            sop_class_uid,
            status,
        ))
    }

    pub fn n_create_rq(
        message_id: u16,
        sop_class_uid: &str,
        sop_instance_uid: Option<&str>,
    ) -> Self {
        let mut obj = Self::n_rq_base(CommandField::NCreateRq, message_id);
        obj.put(DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            dicom_value!(Str, sop_class_uid),
        ));
        if let Some(sop_instance_uid) = sop_instance_uid {
            obj.put(DataElement::new(
                tags::AFFECTED_SOP_INSTANCE_UID,
                VR::UI,
                dicom_value!(Str, sop_instance_uid),
            ));
        }
        Self::from_object(obj)
    }

    pub fn n_create_rsp(
        message_id_being_responded_to: u16,
        sop_class_uid: &str,
        status: u16,
    ) -> Self {
        Self::from_object(Self::n_rsp_base(
            CommandField::NCreateRsp,
            message_id_being_responded_to,
            sop_class_uid,
            status,
        ))
    }

    pub fn n_delete_rq(message_id: u16, sop_class_uid: &str, sop_instance_uid: &str) -> Self {
        let mut obj = Self::n_rq_base(CommandField::NDeleteRq, message_id);
        Self::put_requested_sop(&mut obj, sop_class_uid, sop_instance_uid);
        Self::from_object(obj)
    }

    pub fn n_delete_rsp(
        message_id_being_responded_to: u16,
        sop_class_uid: &str,
        status: u16,
    ) -> Self {
        Self::from_object(Self::n_rsp_base(
            CommandField::NDeleteRsp,
            message_id_being_responded_to,
            sop_class_uid,
            status,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_set_roundtrip() {
        let command = CommandSet::c_echo_rq(5, "1.2.840.10008.1.1");
        let bytes = command.write().unwrap();
        let decoded = CommandSet::read(&bytes).unwrap();
        assert_eq!(decoded.command_field().unwrap(), CommandField::CEchoRq);
        assert_eq!(decoded.message_id().unwrap(), 5);
        assert_eq!(
            decoded.affected_sop_class_uid().as_deref(),
            Some("1.2.840.10008.1.1")
        );
        assert!(!decoded.has_data_set().unwrap());
    }

    #[test]
    fn group_length_covers_the_remaining_elements() {
        let command = CommandSet::c_echo_rsp(1, "1.2.840.10008.1.1", 0x0000);
        let bytes = command.write().unwrap();
        // (0000,0000) comes first with a 4-byte value
        assert_eq!(&bytes[..8], &[0, 0, 0, 0, 4, 0, 0, 0]);
        let group_length = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
        assert_eq!(group_length as usize, bytes.len() - 12);
    }

    #[test]
    fn store_request_carries_instance_and_originator() {
        let command = CommandSet::c_store_rq(
            9,
            "1.2.840.10008.5.1.4.1.1.4",
            "1.2.3.4.5",
            Priority::Medium,
            Some(("MOVE-SCU", 2)),
        );
        let bytes = command.write().unwrap();
        let decoded = CommandSet::read(&bytes).unwrap();
        assert_eq!(decoded.command_field().unwrap(), CommandField::CStoreRq);
        assert_eq!(decoded.affected_sop_instance_uid().as_deref(), Some("1.2.3.4.5"));
        assert!(decoded.has_data_set().unwrap());
    }

    #[test]
    fn data_set_type_can_be_flipped() {
        let mut command = CommandSet::c_find_rsp(1, "1.2.840.10008.5.1.4.1.2.2.1", 0xFF00);
        assert!(!command.has_data_set().unwrap());
        command.set_data_set_present(true);
        assert!(command.has_data_set().unwrap());
    }

    #[test]
    fn cancel_request_refers_to_the_original_message() {
        let command = CommandSet::c_cancel_rq(17);
        let bytes = command.write().unwrap();
        let decoded = CommandSet::read(&bytes).unwrap();
        assert_eq!(decoded.command_field().unwrap(), CommandField::CCancelRq);
        assert_eq!(decoded.message_id_being_responded_to().unwrap(), 17);
    }
}

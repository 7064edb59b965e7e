//! DIMSE command set messages, as per the standard, part 7.
//!
//! The ten C-service messages are represented by the [`Message`] enum.
//! A message encodes to a sequence of data elements in implicit VR
//! little endian, led by a `CommandGroupLength` element; decoding is
//! tolerant, keeping unrecognized elements in the message's `extra`
//! object so that a decoded message re-encodes without loss.

pub mod assembler;

use dicom_core::header::Header;
use dicom_core::value::ConvertValueError;
use dicom_core::{dicom_value, DataElement, Tag, VR};
use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;
use dicom_transfer_syntax_registry::entries;
use snafu::{Backtrace, OptionExt, ResultExt, Snafu};

pub use assembler::{CommandAssembler, DimseMessage};

/// An identifier correlating a DIMSE request with its response.
pub type MessageId = u16;

/// The `CommandDataSetType` value declaring that no data set
/// follows the command set.
pub const COMMAND_DATA_SET_TYPE_NULL: u16 = 0x0101;

/// A conventional `CommandDataSetType` value declaring that a data set
/// follows the command set (any value other than the null marker will do).
pub const COMMAND_DATA_SET_TYPE_NON_NULL: u16 = 0x0001;

/// DIMSE priority field values.
pub mod priority {
    pub const MEDIUM: u16 = 0x0000;
    pub const HIGH: u16 = 0x0001;
    pub const LOW: u16 = 0x0002;
}

/// DIMSE status codes, as per the standard, part 7, annex C
/// and the service definitions of part 4.
pub mod status {
    pub const SUCCESS: u16 = 0x0000;
    pub const CANCEL: u16 = 0xFE00;
    pub const PENDING: u16 = 0xFF00;
    pub const PENDING_WARNING: u16 = 0xFF01;

    pub const SOP_CLASS_NOT_SUPPORTED: u16 = 0x0122;
    pub const INVALID_ATTRIBUTE_VALUE: u16 = 0x0106;
    pub const INVALID_ARGUMENT_VALUE: u16 = 0x0115;
    pub const INVALID_OBJECT_INSTANCE: u16 = 0x0117;
    pub const NOT_AUTHORIZED: u16 = 0x0124;
    pub const UNRECOGNIZED_OPERATION: u16 = 0x0211;
    pub const UNABLE_TO_PROCESS: u16 = 0xC000;

    // C-STORE, part 4, annex GG
    pub const STORE_OUT_OF_RESOURCES: u16 = 0xA700;
    pub const STORE_DATA_SET_DOES_NOT_MATCH_SOP_CLASS: u16 = 0xA900;

    // C-GET/C-MOVE, part 4, annex C
    pub const RETRIEVE_OUT_OF_RESOURCES_MATCHES: u16 = 0xA701;
    pub const RETRIEVE_OUT_OF_RESOURCES_SUB_OPERATIONS: u16 = 0xA702;
    pub const MOVE_DESTINATION_UNKNOWN: u16 = 0xA801;
    pub const SUB_OPERATIONS_COMPLETE_WITH_FAILURES: u16 = 0xB000;
}

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("could not read command set: {}", source))]
    ReadCommand {
        #[snafu(source(from(dicom_object::ReadError, Box::new)))]
        source: Box<dicom_object::ReadError>,
    },

    #[snafu(display("could not write command set: {}", source))]
    WriteCommand {
        #[snafu(source(from(dicom_object::WriteError, Box::new)))]
        source: Box<dicom_object::WriteError>,
    },

    #[snafu(display("missing required command element {}", tag))]
    MissingField { tag: Tag, backtrace: Backtrace },

    #[snafu(display("invalid value in command element {}: {}", tag, source))]
    InvalidField {
        tag: Tag,
        source: ConvertValueError,
        backtrace: Backtrace,
    },

    #[snafu(display("unknown DIMSE command field {:#06x}", value))]
    UnknownCommandField { value: u16, backtrace: Backtrace },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The result of a DIMSE operation, carried in every response message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub code: u16,
    /// optional error payload, encoded as _ErrorComment_ (0000,0902)
    pub error_comment: Option<String>,
}

impl Status {
    pub fn success() -> Self {
        Status {
            code: status::SUCCESS,
            error_comment: None,
        }
    }

    pub fn from_code(code: u16) -> Self {
        Status {
            code,
            error_comment: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == status::SUCCESS
    }

    pub fn is_pending(&self) -> bool {
        self.code == status::PENDING || self.code == status::PENDING_WARNING
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CStoreRq {
    pub affected_sop_class_uid: String,
    pub message_id: MessageId,
    pub priority: u16,
    pub command_data_set_type: u16,
    pub affected_sop_instance_uid: String,
    pub move_originator_ae_title: Option<String>,
    pub move_originator_message_id: Option<MessageId>,
    pub extra: InMemDicomObject,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CStoreRsp {
    pub affected_sop_class_uid: String,
    pub message_id_being_responded_to: MessageId,
    pub command_data_set_type: u16,
    pub affected_sop_instance_uid: String,
    pub status: Status,
    pub extra: InMemDicomObject,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CFindRq {
    pub affected_sop_class_uid: String,
    pub message_id: MessageId,
    pub priority: u16,
    pub command_data_set_type: u16,
    pub extra: InMemDicomObject,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CFindRsp {
    pub affected_sop_class_uid: String,
    pub message_id_being_responded_to: MessageId,
    pub command_data_set_type: u16,
    pub status: Status,
    pub extra: InMemDicomObject,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CGetRq {
    pub affected_sop_class_uid: String,
    pub message_id: MessageId,
    pub priority: u16,
    pub command_data_set_type: u16,
    pub extra: InMemDicomObject,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CGetRsp {
    pub affected_sop_class_uid: String,
    pub message_id_being_responded_to: MessageId,
    pub command_data_set_type: u16,
    pub remaining_sub_operations: u16,
    pub completed_sub_operations: u16,
    pub failed_sub_operations: u16,
    pub warning_sub_operations: u16,
    pub status: Status,
    pub extra: InMemDicomObject,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CMoveRq {
    pub affected_sop_class_uid: String,
    pub message_id: MessageId,
    pub priority: u16,
    pub move_destination: String,
    pub command_data_set_type: u16,
    pub extra: InMemDicomObject,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CMoveRsp {
    pub affected_sop_class_uid: String,
    pub message_id_being_responded_to: MessageId,
    pub command_data_set_type: u16,
    pub remaining_sub_operations: u16,
    pub completed_sub_operations: u16,
    pub failed_sub_operations: u16,
    pub warning_sub_operations: u16,
    pub status: Status,
    pub extra: InMemDicomObject,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CEchoRq {
    pub message_id: MessageId,
    pub command_data_set_type: u16,
    pub extra: InMemDicomObject,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CEchoRsp {
    pub message_id_being_responded_to: MessageId,
    pub command_data_set_type: u16,
    pub status: Status,
    pub extra: InMemDicomObject,
}

/// A DIMSE command set message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    CStoreRq(CStoreRq),
    CStoreRsp(CStoreRsp),
    CFindRq(CFindRq),
    CFindRsp(CFindRsp),
    CGetRq(CGetRq),
    CGetRsp(CGetRsp),
    CMoveRq(CMoveRq),
    CMoveRsp(CMoveRsp),
    CEchoRq(CEchoRq),
    CEchoRsp(CEchoRsp),
}

impl Message {
    /// The _CommandField_ (0000,0100) code of this message.
    pub fn command_field(&self) -> u16 {
        match self {
            Message::CStoreRq(_) => 0x0001,
            Message::CStoreRsp(_) => 0x8001,
            Message::CGetRq(_) => 0x0010,
            Message::CGetRsp(_) => 0x8010,
            Message::CFindRq(_) => 0x0020,
            Message::CFindRsp(_) => 0x8020,
            Message::CMoveRq(_) => 0x0021,
            Message::CMoveRsp(_) => 0x8021,
            Message::CEchoRq(_) => 0x0030,
            Message::CEchoRsp(_) => 0x8030,
        }
    }

    /// The message identifier: _MessageID_ for requests,
    /// _MessageIDBeingRespondedTo_ for responses.
    pub fn message_id(&self) -> MessageId {
        match self {
            Message::CStoreRq(v) => v.message_id,
            Message::CStoreRsp(v) => v.message_id_being_responded_to,
            Message::CFindRq(v) => v.message_id,
            Message::CFindRsp(v) => v.message_id_being_responded_to,
            Message::CGetRq(v) => v.message_id,
            Message::CGetRsp(v) => v.message_id_being_responded_to,
            Message::CMoveRq(v) => v.message_id,
            Message::CMoveRsp(v) => v.message_id_being_responded_to,
            Message::CEchoRq(v) => v.message_id,
            Message::CEchoRsp(v) => v.message_id_being_responded_to,
        }
    }

    /// Whether a data set follows this command set on the association.
    pub fn has_data(&self) -> bool {
        let command_data_set_type = match self {
            Message::CStoreRq(v) => v.command_data_set_type,
            Message::CStoreRsp(v) => v.command_data_set_type,
            Message::CFindRq(v) => v.command_data_set_type,
            Message::CFindRsp(v) => v.command_data_set_type,
            Message::CGetRq(v) => v.command_data_set_type,
            Message::CGetRsp(v) => v.command_data_set_type,
            Message::CMoveRq(v) => v.command_data_set_type,
            Message::CMoveRsp(v) => v.command_data_set_type,
            Message::CEchoRq(v) => v.command_data_set_type,
            Message::CEchoRsp(v) => v.command_data_set_type,
        };
        command_data_set_type != COMMAND_DATA_SET_TYPE_NULL
    }

    /// The response status, `None` for request messages.
    pub fn status(&self) -> Option<&Status> {
        match self {
            Message::CStoreRsp(v) => Some(&v.status),
            Message::CFindRsp(v) => Some(&v.status),
            Message::CGetRsp(v) => Some(&v.status),
            Message::CMoveRsp(v) => Some(&v.status),
            Message::CEchoRsp(v) => Some(&v.status),
            _ => None,
        }
    }

    fn extra_mut(&mut self) -> &mut InMemDicomObject {
        match self {
            Message::CStoreRq(v) => &mut v.extra,
            Message::CStoreRsp(v) => &mut v.extra,
            Message::CFindRq(v) => &mut v.extra,
            Message::CFindRsp(v) => &mut v.extra,
            Message::CGetRq(v) => &mut v.extra,
            Message::CGetRsp(v) => &mut v.extra,
            Message::CMoveRq(v) => &mut v.extra,
            Message::CMoveRsp(v) => &mut v.extra,
            Message::CEchoRq(v) => &mut v.extra,
            Message::CEchoRsp(v) => &mut v.extra,
        }
    }

    fn extra(&self) -> &InMemDicomObject {
        match self {
            Message::CStoreRq(v) => &v.extra,
            Message::CStoreRsp(v) => &v.extra,
            Message::CFindRq(v) => &v.extra,
            Message::CFindRsp(v) => &v.extra,
            Message::CGetRq(v) => &v.extra,
            Message::CGetRsp(v) => &v.extra,
            Message::CMoveRq(v) => &v.extra,
            Message::CMoveRsp(v) => &v.extra,
            Message::CEchoRq(v) => &v.extra,
            Message::CEchoRsp(v) => &v.extra,
        }
    }
}

/// Serialize a message into its implicit VR little endian form,
/// led by the _CommandGroupLength_ element.
pub fn write_message(message: &Message) -> Result<Vec<u8>> {
    let ts = entries::IMPLICIT_VR_LITTLE_ENDIAN.erased();
    let obj = command_object(message);

    let mut body = Vec::new();
    obj.write_dataset_with_ts(&mut body, &ts)
        .context(WriteCommandSnafu)?;

    let mut group = InMemDicomObject::new_empty();
    group.put(DataElement::new(
        tags::COMMAND_GROUP_LENGTH,
        VR::UL,
        dicom_value!(U32, [body.len() as u32]),
    ));
    let mut bytes = Vec::with_capacity(body.len() + 12);
    group
        .write_dataset_with_ts(&mut bytes, &ts)
        .context(WriteCommandSnafu)?;
    bytes.extend_from_slice(&body);
    Ok(bytes)
}

/// Decode a message from its implicit VR little endian form.
pub fn read_message(bytes: &[u8]) -> Result<Message> {
    let ts = entries::IMPLICIT_VR_LITTLE_ENDIAN.erased();
    let obj = InMemDicomObject::read_dataset_with_ts(bytes, &ts).context(ReadCommandSnafu)?;

    let mut decoder = MessageDecoder::new(obj);
    let command_field = decoder.require_u16(tags::COMMAND_FIELD)?;

    let mut message = match command_field {
        0x0001 => Message::CStoreRq(CStoreRq {
            affected_sop_class_uid: decoder.require_str(tags::AFFECTED_SOP_CLASS_UID)?,
            message_id: decoder.require_u16(tags::MESSAGE_ID)?,
            priority: decoder.require_u16(tags::PRIORITY)?,
            command_data_set_type: decoder.require_u16(tags::COMMAND_DATA_SET_TYPE)?,
            affected_sop_instance_uid: decoder.require_str(tags::AFFECTED_SOP_INSTANCE_UID)?,
            move_originator_ae_title: decoder
                .optional_str(tags::MOVE_ORIGINATOR_APPLICATION_ENTITY_TITLE)?,
            move_originator_message_id: decoder.optional_u16(tags::MOVE_ORIGINATOR_MESSAGE_ID)?,
            extra: InMemDicomObject::new_empty(),
        }),
        0x8001 => Message::CStoreRsp(CStoreRsp {
            affected_sop_class_uid: decoder.require_str(tags::AFFECTED_SOP_CLASS_UID)?,
            message_id_being_responded_to: decoder
                .require_u16(tags::MESSAGE_ID_BEING_RESPONDED_TO)?,
            command_data_set_type: decoder.require_u16(tags::COMMAND_DATA_SET_TYPE)?,
            affected_sop_instance_uid: decoder.require_str(tags::AFFECTED_SOP_INSTANCE_UID)?,
            status: decoder.status()?,
            extra: InMemDicomObject::new_empty(),
        }),
        0x0020 => Message::CFindRq(CFindRq {
            affected_sop_class_uid: decoder.require_str(tags::AFFECTED_SOP_CLASS_UID)?,
            message_id: decoder.require_u16(tags::MESSAGE_ID)?,
            priority: decoder.require_u16(tags::PRIORITY)?,
            command_data_set_type: decoder.require_u16(tags::COMMAND_DATA_SET_TYPE)?,
            extra: InMemDicomObject::new_empty(),
        }),
        0x8020 => Message::CFindRsp(CFindRsp {
            affected_sop_class_uid: decoder.require_str(tags::AFFECTED_SOP_CLASS_UID)?,
            message_id_being_responded_to: decoder
                .require_u16(tags::MESSAGE_ID_BEING_RESPONDED_TO)?,
            command_data_set_type: decoder.require_u16(tags::COMMAND_DATA_SET_TYPE)?,
            status: decoder.status()?,
            extra: InMemDicomObject::new_empty(),
        }),
        0x0010 => Message::CGetRq(CGetRq {
            affected_sop_class_uid: decoder.require_str(tags::AFFECTED_SOP_CLASS_UID)?,
            message_id: decoder.require_u16(tags::MESSAGE_ID)?,
            priority: decoder.require_u16(tags::PRIORITY)?,
            command_data_set_type: decoder.require_u16(tags::COMMAND_DATA_SET_TYPE)?,
            extra: InMemDicomObject::new_empty(),
        }),
        0x8010 => Message::CGetRsp(CGetRsp {
            affected_sop_class_uid: decoder.require_str(tags::AFFECTED_SOP_CLASS_UID)?,
            message_id_being_responded_to: decoder
                .require_u16(tags::MESSAGE_ID_BEING_RESPONDED_TO)?,
            command_data_set_type: decoder.require_u16(tags::COMMAND_DATA_SET_TYPE)?,
            remaining_sub_operations: decoder
                .optional_u16(tags::NUMBER_OF_REMAINING_SUBOPERATIONS)?
                .unwrap_or(0),
            completed_sub_operations: decoder
                .optional_u16(tags::NUMBER_OF_COMPLETED_SUBOPERATIONS)?
                .unwrap_or(0),
            failed_sub_operations: decoder
                .optional_u16(tags::NUMBER_OF_FAILED_SUBOPERATIONS)?
                .unwrap_or(0),
            warning_sub_operations: decoder
                .optional_u16(tags::NUMBER_OF_WARNING_SUBOPERATIONS)?
                .unwrap_or(0),
            status: decoder.status()?,
            extra: InMemDicomObject::new_empty(),
        }),
        0x0021 => Message::CMoveRq(CMoveRq {
            affected_sop_class_uid: decoder.require_str(tags::AFFECTED_SOP_CLASS_UID)?,
            message_id: decoder.require_u16(tags::MESSAGE_ID)?,
            priority: decoder.require_u16(tags::PRIORITY)?,
            move_destination: decoder.require_str(tags::MOVE_DESTINATION)?,
            command_data_set_type: decoder.require_u16(tags::COMMAND_DATA_SET_TYPE)?,
            extra: InMemDicomObject::new_empty(),
        }),
        0x8021 => Message::CMoveRsp(CMoveRsp {
            affected_sop_class_uid: decoder.require_str(tags::AFFECTED_SOP_CLASS_UID)?,
            message_id_being_responded_to: decoder
                .require_u16(tags::MESSAGE_ID_BEING_RESPONDED_TO)?,
            command_data_set_type: decoder.require_u16(tags::COMMAND_DATA_SET_TYPE)?,
            remaining_sub_operations: decoder
                .optional_u16(tags::NUMBER_OF_REMAINING_SUBOPERATIONS)?
                .unwrap_or(0),
            completed_sub_operations: decoder
                .optional_u16(tags::NUMBER_OF_COMPLETED_SUBOPERATIONS)?
                .unwrap_or(0),
            failed_sub_operations: decoder
                .optional_u16(tags::NUMBER_OF_FAILED_SUBOPERATIONS)?
                .unwrap_or(0),
            warning_sub_operations: decoder
                .optional_u16(tags::NUMBER_OF_WARNING_SUBOPERATIONS)?
                .unwrap_or(0),
            status: decoder.status()?,
            extra: InMemDicomObject::new_empty(),
        }),
        0x0030 => Message::CEchoRq(CEchoRq {
            message_id: decoder.require_u16(tags::MESSAGE_ID)?,
            command_data_set_type: decoder.require_u16(tags::COMMAND_DATA_SET_TYPE)?,
            extra: InMemDicomObject::new_empty(),
        }),
        0x8030 => Message::CEchoRsp(CEchoRsp {
            message_id_being_responded_to: decoder
                .require_u16(tags::MESSAGE_ID_BEING_RESPONDED_TO)?,
            command_data_set_type: decoder.require_u16(tags::COMMAND_DATA_SET_TYPE)?,
            status: decoder.status()?,
            extra: InMemDicomObject::new_empty(),
        }),
        value => return UnknownCommandFieldSnafu { value }.fail(),
    };

    *message.extra_mut() = decoder.finish();
    Ok(message)
}

fn command_object(message: &Message) -> InMemDicomObject {
    let mut obj = InMemDicomObject::new_empty();
    obj.put(DataElement::new(
        tags::COMMAND_FIELD,
        VR::US,
        dicom_value!(U16, [message.command_field()]),
    ));

    match message {
        Message::CStoreRq(v) => {
            put_str(&mut obj, tags::AFFECTED_SOP_CLASS_UID, VR::UI, &v.affected_sop_class_uid);
            put_u16(&mut obj, tags::MESSAGE_ID, v.message_id);
            put_u16(&mut obj, tags::PRIORITY, v.priority);
            put_u16(&mut obj, tags::COMMAND_DATA_SET_TYPE, v.command_data_set_type);
            put_str(&mut obj, tags::AFFECTED_SOP_INSTANCE_UID, VR::UI, &v.affected_sop_instance_uid);
            if let Some(ae_title) = &v.move_originator_ae_title {
                put_str(&mut obj, tags::MOVE_ORIGINATOR_APPLICATION_ENTITY_TITLE, VR::AE, ae_title);
            }
            if let Some(message_id) = v.move_originator_message_id {
                put_u16(&mut obj, tags::MOVE_ORIGINATOR_MESSAGE_ID, message_id);
            }
        }
        Message::CStoreRsp(v) => {
            put_str(&mut obj, tags::AFFECTED_SOP_CLASS_UID, VR::UI, &v.affected_sop_class_uid);
            put_u16(&mut obj, tags::MESSAGE_ID_BEING_RESPONDED_TO, v.message_id_being_responded_to);
            put_u16(&mut obj, tags::COMMAND_DATA_SET_TYPE, v.command_data_set_type);
            put_str(&mut obj, tags::AFFECTED_SOP_INSTANCE_UID, VR::UI, &v.affected_sop_instance_uid);
            put_status(&mut obj, &v.status);
        }
        Message::CFindRq(v) => {
            put_str(&mut obj, tags::AFFECTED_SOP_CLASS_UID, VR::UI, &v.affected_sop_class_uid);
            put_u16(&mut obj, tags::MESSAGE_ID, v.message_id);
            put_u16(&mut obj, tags::PRIORITY, v.priority);
            put_u16(&mut obj, tags::COMMAND_DATA_SET_TYPE, v.command_data_set_type);
        }
        Message::CFindRsp(v) => {
            put_str(&mut obj, tags::AFFECTED_SOP_CLASS_UID, VR::UI, &v.affected_sop_class_uid);
            put_u16(&mut obj, tags::MESSAGE_ID_BEING_RESPONDED_TO, v.message_id_being_responded_to);
            put_u16(&mut obj, tags::COMMAND_DATA_SET_TYPE, v.command_data_set_type);
            put_status(&mut obj, &v.status);
        }
        Message::CGetRq(v) => {
            put_str(&mut obj, tags::AFFECTED_SOP_CLASS_UID, VR::UI, &v.affected_sop_class_uid);
            put_u16(&mut obj, tags::MESSAGE_ID, v.message_id);
            put_u16(&mut obj, tags::PRIORITY, v.priority);
            put_u16(&mut obj, tags::COMMAND_DATA_SET_TYPE, v.command_data_set_type);
        }
        Message::CGetRsp(v) => {
            put_str(&mut obj, tags::AFFECTED_SOP_CLASS_UID, VR::UI, &v.affected_sop_class_uid);
            put_u16(&mut obj, tags::MESSAGE_ID_BEING_RESPONDED_TO, v.message_id_being_responded_to);
            put_u16(&mut obj, tags::COMMAND_DATA_SET_TYPE, v.command_data_set_type);
            put_sub_operations(
                &mut obj,
                v.remaining_sub_operations,
                v.completed_sub_operations,
                v.failed_sub_operations,
                v.warning_sub_operations,
            );
            put_status(&mut obj, &v.status);
        }
        Message::CMoveRq(v) => {
            put_str(&mut obj, tags::AFFECTED_SOP_CLASS_UID, VR::UI, &v.affected_sop_class_uid);
            put_u16(&mut obj, tags::MESSAGE_ID, v.message_id);
            put_u16(&mut obj, tags::PRIORITY, v.priority);
            put_str(&mut obj, tags::MOVE_DESTINATION, VR::AE, &v.move_destination);
            put_u16(&mut obj, tags::COMMAND_DATA_SET_TYPE, v.command_data_set_type);
        }
        Message::CMoveRsp(v) => {
            put_str(&mut obj, tags::AFFECTED_SOP_CLASS_UID, VR::UI, &v.affected_sop_class_uid);
            put_u16(&mut obj, tags::MESSAGE_ID_BEING_RESPONDED_TO, v.message_id_being_responded_to);
            put_u16(&mut obj, tags::COMMAND_DATA_SET_TYPE, v.command_data_set_type);
            put_sub_operations(
                &mut obj,
                v.remaining_sub_operations,
                v.completed_sub_operations,
                v.failed_sub_operations,
                v.warning_sub_operations,
            );
            put_status(&mut obj, &v.status);
        }
        Message::CEchoRq(v) => {
            put_u16(&mut obj, tags::MESSAGE_ID, v.message_id);
            put_u16(&mut obj, tags::COMMAND_DATA_SET_TYPE, v.command_data_set_type);
        }
        Message::CEchoRsp(v) => {
            put_u16(&mut obj, tags::MESSAGE_ID_BEING_RESPONDED_TO, v.message_id_being_responded_to);
            put_u16(&mut obj, tags::COMMAND_DATA_SET_TYPE, v.command_data_set_type);
            put_status(&mut obj, &v.status);
        }
    }

    for element in message.extra() {
        obj.put(element.clone());
    }
    obj
}

fn put_u16(obj: &mut InMemDicomObject, tag: Tag, value: u16) {
    obj.put(DataElement::new(tag, VR::US, dicom_value!(U16, [value])));
}

fn put_str(obj: &mut InMemDicomObject, tag: Tag, vr: VR, value: &str) {
    obj.put(DataElement::new(tag, vr, dicom_value!(Str, value)));
}

fn put_status(obj: &mut InMemDicomObject, status: &Status) {
    put_u16(obj, tags::STATUS, status.code);
    if let Some(comment) = &status.error_comment {
        put_str(obj, tags::ERROR_COMMENT, VR::LO, comment);
    }
}

/// Sub-operation counters are omitted when zero.
fn put_sub_operations(
    obj: &mut InMemDicomObject,
    remaining: u16,
    completed: u16,
    failed: u16,
    warning: u16,
) {
    if remaining != 0 {
        put_u16(obj, tags::NUMBER_OF_REMAINING_SUBOPERATIONS, remaining);
    }
    if completed != 0 {
        put_u16(obj, tags::NUMBER_OF_COMPLETED_SUBOPERATIONS, completed);
    }
    if failed != 0 {
        put_u16(obj, tags::NUMBER_OF_FAILED_SUBOPERATIONS, failed);
    }
    if warning != 0 {
        put_u16(obj, tags::NUMBER_OF_WARNING_SUBOPERATIONS, warning);
    }
}

/// Pulls typed values out of a decoded command object,
/// remembering which elements were consumed so that the rest
/// can be preserved verbatim.
struct MessageDecoder {
    obj: InMemDicomObject,
    taken: Vec<Tag>,
}

impl MessageDecoder {
    fn new(obj: InMemDicomObject) -> Self {
        MessageDecoder {
            obj,
            taken: Vec::new(),
        }
    }

    fn require_u16(&mut self, tag: Tag) -> Result<u16> {
        let element = self.obj.get(tag).context(MissingFieldSnafu { tag })?;
        let value = element.to_int::<u16>().context(InvalidFieldSnafu { tag })?;
        self.taken.push(tag);
        Ok(value)
    }

    fn optional_u16(&mut self, tag: Tag) -> Result<Option<u16>> {
        match self.obj.get(tag) {
            None => Ok(None),
            Some(element) => {
                let value = element.to_int::<u16>().context(InvalidFieldSnafu { tag })?;
                self.taken.push(tag);
                Ok(Some(value))
            }
        }
    }

    fn require_str(&mut self, tag: Tag) -> Result<String> {
        let element = self.obj.get(tag).context(MissingFieldSnafu { tag })?;
        let value = element.to_str().context(InvalidFieldSnafu { tag })?;
        self.taken.push(tag);
        Ok(trim_value(&value))
    }

    fn optional_str(&mut self, tag: Tag) -> Result<Option<String>> {
        match self.obj.get(tag) {
            None => Ok(None),
            Some(element) => {
                let value = element.to_str().context(InvalidFieldSnafu { tag })?;
                self.taken.push(tag);
                Ok(Some(trim_value(&value)))
            }
        }
    }

    fn status(&mut self) -> Result<Status> {
        let code = self.require_u16(tags::STATUS)?;
        let error_comment = self.optional_str(tags::ERROR_COMMENT)?;
        Ok(Status {
            code,
            error_comment,
        })
    }

    /// The remaining elements, excluding the group length prefix.
    fn finish(self) -> InMemDicomObject {
        let MessageDecoder { obj, taken } = self;
        let mut extra = InMemDicomObject::new_empty();
        for element in obj {
            let tag = element.tag();
            if tag == tags::COMMAND_GROUP_LENGTH || taken.contains(&tag) {
                continue;
            }
            extra.put(element);
        }
        extra
    }
}

fn trim_value(value: &str) -> String {
    value
        .trim_matches(|c: char| c == ' ' || c == '\0')
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use matches::matches;

    #[test]
    fn store_request_roundtrip() {
        let message = Message::CStoreRq(CStoreRq {
            affected_sop_class_uid: "1.2.840.10008.5.1.4.1.1.2".to_string(),
            message_id: 7,
            priority: priority::MEDIUM,
            command_data_set_type: COMMAND_DATA_SET_TYPE_NON_NULL,
            affected_sop_instance_uid: "1.2.3.4".to_string(),
            move_originator_ae_title: None,
            move_originator_message_id: None,
            extra: InMemDicomObject::new_empty(),
        });

        let bytes = write_message(&message).unwrap();
        let decoded = read_message(&bytes).unwrap();
        assert_eq!(decoded, message);
        assert!(decoded.has_data());
        assert_eq!(decoded.message_id(), 7);
        assert_eq!(decoded.command_field(), 0x0001);
    }

    #[test]
    fn store_sub_operation_roundtrip_keeps_move_originator() {
        let message = Message::CStoreRq(CStoreRq {
            affected_sop_class_uid: "1.2.840.10008.5.1.4.1.1.2".to_string(),
            message_id: 9,
            priority: priority::MEDIUM,
            command_data_set_type: COMMAND_DATA_SET_TYPE_NON_NULL,
            affected_sop_instance_uid: "1.2.3.4.5".to_string(),
            move_originator_ae_title: Some("MOVE-SCU".to_string()),
            move_originator_message_id: Some(4),
            extra: InMemDicomObject::new_empty(),
        });

        let bytes = write_message(&message).unwrap();
        assert_eq!(read_message(&bytes).unwrap(), message);
    }

    #[test]
    fn store_response_roundtrip_with_error_comment() {
        let message = Message::CStoreRsp(CStoreRsp {
            affected_sop_class_uid: "1.2.840.10008.5.1.4.1.1.2".to_string(),
            message_id_being_responded_to: 7,
            command_data_set_type: COMMAND_DATA_SET_TYPE_NULL,
            affected_sop_instance_uid: "1.2.3.4".to_string(),
            status: Status {
                code: status::STORE_OUT_OF_RESOURCES,
                error_comment: Some("disk full".to_string()),
            },
            extra: InMemDicomObject::new_empty(),
        });

        let bytes = write_message(&message).unwrap();
        let decoded = read_message(&bytes).unwrap();
        assert_eq!(decoded, message);
        assert!(!decoded.has_data());
        assert!(!decoded.status().unwrap().is_success());
    }

    #[test]
    fn echo_roundtrip() {
        let request = Message::CEchoRq(CEchoRq {
            message_id: 1,
            command_data_set_type: COMMAND_DATA_SET_TYPE_NULL,
            extra: InMemDicomObject::new_empty(),
        });
        let bytes = write_message(&request).unwrap();
        assert_eq!(read_message(&bytes).unwrap(), request);

        let response = Message::CEchoRsp(CEchoRsp {
            message_id_being_responded_to: 1,
            command_data_set_type: COMMAND_DATA_SET_TYPE_NULL,
            status: Status::success(),
            extra: InMemDicomObject::new_empty(),
        });
        let bytes = write_message(&response).unwrap();
        let decoded = read_message(&bytes).unwrap();
        assert_eq!(decoded, response);
        assert!(decoded.status().unwrap().is_success());
    }

    #[test]
    fn get_response_omits_zero_counters() {
        let message = Message::CGetRsp(CGetRsp {
            affected_sop_class_uid: "1.2.840.10008.5.1.4.1.2.2.3".to_string(),
            message_id_being_responded_to: 2,
            command_data_set_type: COMMAND_DATA_SET_TYPE_NULL,
            remaining_sub_operations: 0,
            completed_sub_operations: 3,
            failed_sub_operations: 0,
            warning_sub_operations: 0,
            status: Status::success(),
            extra: InMemDicomObject::new_empty(),
        });

        let bytes = write_message(&message).unwrap();
        let decoded = read_message(&bytes).unwrap();
        assert_eq!(decoded, message);

        // the zero counters must not appear on the wire
        let ts = entries::IMPLICIT_VR_LITTLE_ENDIAN.erased();
        let obj = InMemDicomObject::read_dataset_with_ts(&bytes[..], &ts).unwrap();
        assert!(obj.get(tags::NUMBER_OF_REMAINING_SUBOPERATIONS).is_none());
        assert!(obj.get(tags::NUMBER_OF_COMPLETED_SUBOPERATIONS).is_some());
    }

    #[test]
    fn move_request_roundtrip() {
        let message = Message::CMoveRq(CMoveRq {
            affected_sop_class_uid: "1.2.840.10008.5.1.4.1.2.2.2".to_string(),
            message_id: 11,
            priority: priority::MEDIUM,
            move_destination: "OTHER-SCP".to_string(),
            command_data_set_type: COMMAND_DATA_SET_TYPE_NON_NULL,
            extra: InMemDicomObject::new_empty(),
        });

        let bytes = write_message(&message).unwrap();
        assert_eq!(read_message(&bytes).unwrap(), message);
    }

    #[test]
    fn missing_required_field_is_reported() {
        // a C-FIND-RSP without a status element
        let mut obj = InMemDicomObject::new_empty();
        put_u16(&mut obj, tags::COMMAND_FIELD, 0x8020);
        put_str(&mut obj, tags::AFFECTED_SOP_CLASS_UID, VR::UI, "1.2.840.10008.1.1");
        put_u16(&mut obj, tags::MESSAGE_ID_BEING_RESPONDED_TO, 1);
        put_u16(&mut obj, tags::COMMAND_DATA_SET_TYPE, COMMAND_DATA_SET_TYPE_NULL);

        let ts = entries::IMPLICIT_VR_LITTLE_ENDIAN.erased();
        let mut bytes = Vec::new();
        obj.write_dataset_with_ts(&mut bytes, &ts).unwrap();

        let result = read_message(&bytes);
        assert!(matches!(
            result,
            Err(Error::MissingField { tag, .. }) if tag == tags::STATUS
        ));
    }

    #[test]
    fn unknown_command_field_is_reported() {
        let mut obj = InMemDicomObject::new_empty();
        put_u16(&mut obj, tags::COMMAND_FIELD, 0x0150);
        let ts = entries::IMPLICIT_VR_LITTLE_ENDIAN.erased();
        let mut bytes = Vec::new();
        obj.write_dataset_with_ts(&mut bytes, &ts).unwrap();

        assert!(matches!(
            read_message(&bytes),
            Err(Error::UnknownCommandField { value: 0x0150, .. })
        ));
    }

    #[test]
    fn unparsed_elements_are_preserved() {
        let mut extra = InMemDicomObject::new_empty();
        // an element this codec does not interpret for C-ECHO;
        // even-length value so the wire form needs no padding
        put_str(&mut extra, tags::AFFECTED_SOP_CLASS_UID, VR::UI, "1.2.840.10008.31");

        let message = Message::CEchoRsp(CEchoRsp {
            message_id_being_responded_to: 5,
            command_data_set_type: COMMAND_DATA_SET_TYPE_NULL,
            status: Status::success(),
            extra,
        });

        let bytes = write_message(&message).unwrap();
        let decoded = read_message(&bytes).unwrap();
        assert_eq!(decoded, message);

        // and it survives a second encode unchanged
        let bytes_again = write_message(&decoded).unwrap();
        assert_eq!(bytes_again, bytes);
    }
}

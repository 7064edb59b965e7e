//! Decoding of upper layer PDUs from their big-endian wire form.

use crate::io::DulReader;
use crate::pdu::*;
use byteordered::Endianness;
use snafu::{ensure, Backtrace, OptionExt, ResultExt, Snafu};
use std::io::{ErrorKind, Read};

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("invalid max PDU length {}", max_pdu_length))]
    InvalidMaxPdu {
        max_pdu_length: u32,
        backtrace: Backtrace,
    },

    #[snafu(display("no PDU available"))]
    NoPduAvailable { backtrace: Backtrace },

    #[snafu(display("could not read PDU header: {}", source))]
    ReadHeader {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("could not read PDU field `{}`: {}", field, source))]
    ReadPduField {
        field: &'static str,
        #[snafu(backtrace)]
        source: crate::io::Error,
    },

    #[snafu(display(
        "incoming PDU was too large: length {}, maximum admitted is {}",
        pdu_length,
        max_pdu_length
    ))]
    PduTooLarge {
        pdu_length: u32,
        max_pdu_length: u32,
        backtrace: Backtrace,
    },

    #[snafu(display("unknown PDU type {:#04x}", pdu_type))]
    UnknownPduType { pdu_type: u8, backtrace: Backtrace },

    #[snafu(display("presentation context ID {} is not odd", id))]
    EvenPresentationContextId { id: u8, backtrace: Backtrace },

    #[snafu(display("field `{}` is empty", field))]
    MissingAeTitle {
        field: &'static str,
        backtrace: Backtrace,
    },

    #[snafu(display("PDU contained a misplaced variable item {:?}", var_item))]
    InvalidPduVariable {
        var_item: PduVariableItem,
        backtrace: Backtrace,
    },

    #[snafu(display("invalid presentation data value length {}", length))]
    InvalidPdvLength { length: u32, backtrace: Backtrace },

    #[snafu(display("invalid reject source or reason"))]
    InvalidRejectSourceOrReason { backtrace: Backtrace },

    #[snafu(display("invalid abort source or reason"))]
    InvalidAbortSourceOrReason { backtrace: Backtrace },

    #[snafu(display("invalid presentation context result reason"))]
    InvalidPresentationContextResultReason { backtrace: Backtrace },

    #[snafu(display("unknown presentation context sub-item {:#04x}", item_type))]
    UnknownPresentationContextSubItem { item_type: u8, backtrace: Backtrace },

    #[snafu(display("invalid transfer syntax sub-item {:#04x}", item_type))]
    InvalidTransferSyntaxSubItem { item_type: u8, backtrace: Backtrace },

    #[snafu(display("multiple transfer syntaxes were accepted"))]
    MultipleTransferSyntaxesAccepted { backtrace: Backtrace },

    #[snafu(display("missing application context name"))]
    MissingApplicationContextName { backtrace: Backtrace },

    #[snafu(display("missing abstract syntax"))]
    MissingAbstractSyntax { backtrace: Backtrace },

    #[snafu(display("missing transfer syntax"))]
    MissingTransferSyntax { backtrace: Backtrace },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Read one PDU from the given byte source.
///
/// A PDU whose declared length exceeds twice `max_pdu_length`
/// is rejected before any payload is allocated.
/// A clean end of stream before the first header byte
/// is reported as [`Error::NoPduAvailable`].
pub fn read_pdu<R>(reader: &mut R, max_pdu_length: u32) -> Result<Pdu>
where
    R: Read,
{
    ensure!(
        (MINIMUM_PDU_SIZE..=MAXIMUM_PDU_SIZE).contains(&max_pdu_length),
        InvalidMaxPduSnafu { max_pdu_length }
    );

    // Failing to read these 2 bytes means that no PDU has begun,
    // which callers treat differently from a truncated PDU.
    let mut head = [0; 2];
    if let Err(e) = reader.read_exact(&mut head) {
        ensure!(e.kind() != ErrorKind::UnexpectedEof, NoPduAvailableSnafu);
        return Err(e).context(ReadHeaderSnafu);
    }
    let pdu_type = head[0];

    let mut reader = DulReader::new(reader.by_ref(), Endianness::Big);
    let pdu_length = reader
        .read_u32()
        .context(ReadPduFieldSnafu { field: "PDU-length" })?;
    ensure!(
        pdu_length <= max_pdu_length.saturating_mul(2),
        PduTooLargeSnafu {
            pdu_length,
            max_pdu_length,
        }
    );
    reader
        .push_limit(u64::from(pdu_length))
        .context(ReadPduFieldSnafu { field: "PDU-length" })?;

    let pdu = match pdu_type {
        0x01 => read_association_rq(&mut reader)?,
        0x02 => read_association_ac(&mut reader)?,
        0x03 => read_association_rj(&mut reader)?,
        0x04 => read_p_data_tf(&mut reader)?,
        0x05 => {
            reader
                .skip(4)
                .context(ReadPduFieldSnafu { field: "Reserved" })?;
            Pdu::ReleaseRQ
        }
        0x06 => {
            reader
                .skip(4)
                .context(ReadPduFieldSnafu { field: "Reserved" })?;
            Pdu::ReleaseRP
        }
        0x07 => read_abort(&mut reader)?,
        pdu_type => return UnknownPduTypeSnafu { pdu_type }.fail(),
    };

    // any unread payload remainder is skipped
    reader
        .pop_limit()
        .context(ReadPduFieldSnafu { field: "PDU-length" })?;
    Ok(pdu)
}

fn read_ae_title<R>(reader: &mut DulReader<R>, field: &'static str) -> Result<String>
where
    R: Read,
{
    let title = reader
        .read_string(16)
        .context(ReadPduFieldSnafu { field })?
        .trim()
        .to_string();
    ensure!(!title.is_empty(), MissingAeTitleSnafu { field });
    Ok(title)
}

fn read_uid<R>(reader: &mut DulReader<R>, length: u64, field: &'static str) -> Result<String>
where
    R: Read,
{
    let value = reader
        .read_string(length)
        .context(ReadPduFieldSnafu { field })?;
    Ok(value
        .trim_matches(|c: char| c == ' ' || c == '\0')
        .to_string())
}

fn read_association_rq<R>(reader: &mut DulReader<R>) -> Result<Pdu>
where
    R: Read,
{
    // protocol version, 2 reserved bytes,
    // called and calling AE titles, 32 reserved bytes
    let protocol_version = reader.read_u16().context(ReadPduFieldSnafu {
        field: "Protocol-version",
    })?;
    reader
        .skip(2)
        .context(ReadPduFieldSnafu { field: "Reserved" })?;
    let called_ae_title = read_ae_title(reader, "Called-AE-title")?;
    let calling_ae_title = read_ae_title(reader, "Calling-AE-title")?;
    reader
        .skip(32)
        .context(ReadPduFieldSnafu { field: "Reserved" })?;

    let mut application_context_name = None;
    let mut presentation_contexts = Vec::new();
    let mut user_variables = Vec::new();

    while !reader.is_limit_exhausted() {
        match read_variable_item(reader)? {
            PduVariableItem::ApplicationContext(name) => {
                application_context_name = Some(name);
            }
            PduVariableItem::PresentationContextProposed(pc) => {
                presentation_contexts.push(pc);
            }
            PduVariableItem::UserVariables(vars) => {
                user_variables = vars;
            }
            var_item => return InvalidPduVariableSnafu { var_item }.fail(),
        }
    }

    Ok(Pdu::AssociationRQ {
        protocol_version,
        calling_ae_title,
        called_ae_title,
        application_context_name: application_context_name
            .context(MissingApplicationContextNameSnafu)?,
        presentation_contexts,
        user_variables,
    })
}

fn read_association_ac<R>(reader: &mut DulReader<R>) -> Result<Pdu>
where
    R: Read,
{
    let protocol_version = reader.read_u16().context(ReadPduFieldSnafu {
        field: "Protocol-version",
    })?;
    reader
        .skip(2)
        .context(ReadPduFieldSnafu { field: "Reserved" })?;
    // officially reserved, but echoed from the request by every
    // known implementation, so they are surfaced to the caller
    let called_ae_title = read_ae_title(reader, "Called-AE-title")?;
    let calling_ae_title = read_ae_title(reader, "Calling-AE-title")?;
    reader
        .skip(32)
        .context(ReadPduFieldSnafu { field: "Reserved" })?;

    let mut application_context_name = None;
    let mut presentation_contexts = Vec::new();
    let mut user_variables = Vec::new();

    while !reader.is_limit_exhausted() {
        match read_variable_item(reader)? {
            PduVariableItem::ApplicationContext(name) => {
                application_context_name = Some(name);
            }
            PduVariableItem::PresentationContextResult(pc) => {
                presentation_contexts.push(pc);
            }
            PduVariableItem::UserVariables(vars) => {
                user_variables = vars;
            }
            var_item => return InvalidPduVariableSnafu { var_item }.fail(),
        }
    }

    Ok(Pdu::AssociationAC {
        protocol_version,
        calling_ae_title,
        called_ae_title,
        application_context_name: application_context_name
            .context(MissingApplicationContextNameSnafu)?,
        presentation_contexts,
        user_variables,
    })
}

fn read_association_rj<R>(reader: &mut DulReader<R>) -> Result<Pdu>
where
    R: Read,
{
    reader
        .skip(1)
        .context(ReadPduFieldSnafu { field: "Reserved" })?;
    let result = AssociationRJResult::from(
        reader
            .read_u8()
            .context(ReadPduFieldSnafu { field: "Result" })?,
    )
    .context(InvalidRejectSourceOrReasonSnafu)?;
    let source_code = reader
        .read_u8()
        .context(ReadPduFieldSnafu { field: "Source" })?;
    let reason_code = reader.read_u8().context(ReadPduFieldSnafu {
        field: "Reason/Diag.",
    })?;
    let source = AssociationRJSource::from(source_code, reason_code)
        .context(InvalidRejectSourceOrReasonSnafu)?;
    Ok(Pdu::AssociationRJ { result, source })
}

fn read_abort<R>(reader: &mut DulReader<R>) -> Result<Pdu>
where
    R: Read,
{
    reader
        .skip(2)
        .context(ReadPduFieldSnafu { field: "Reserved" })?;
    let source_code = reader
        .read_u8()
        .context(ReadPduFieldSnafu { field: "Source" })?;
    let reason_code = reader.read_u8().context(ReadPduFieldSnafu {
        field: "Reason/Diag.",
    })?;
    let source =
        AbortRQSource::from(source_code, reason_code).context(InvalidAbortSourceOrReasonSnafu)?;
    Ok(Pdu::AbortRQ { source })
}

fn read_p_data_tf<R>(reader: &mut DulReader<R>) -> Result<Pdu>
where
    R: Read,
{
    let mut values = Vec::new();
    while !reader.is_limit_exhausted() {
        let length = reader
            .read_u32()
            .context(ReadPduFieldSnafu { field: "Item-length" })?;
        // context ID and message control header are part of the length
        ensure!(length >= 2, InvalidPdvLengthSnafu { length });
        let presentation_context_id = reader.read_u8().context(ReadPduFieldSnafu {
            field: "Presentation-context-ID",
        })?;
        let header = reader.read_u8().context(ReadPduFieldSnafu {
            field: "Message Control Header",
        })?;
        let data = reader
            .read_bytes(u64::from(length) - 2)
            .context(ReadPduFieldSnafu {
                field: "Presentation-data-value",
            })?;

        values.push(PDataValue {
            presentation_context_id,
            value_type: if header & 0x01 != 0 {
                PDataValueType::Command
            } else {
                PDataValueType::Data
            },
            is_last: header & 0x02 != 0,
            data,
        });
    }
    Ok(Pdu::PData { data: values })
}

fn read_variable_item<R>(reader: &mut DulReader<R>) -> Result<PduVariableItem>
where
    R: Read,
{
    let item_type = reader
        .read_u8()
        .context(ReadPduFieldSnafu { field: "Item-type" })?;
    reader
        .skip(1)
        .context(ReadPduFieldSnafu { field: "Reserved" })?;
    let item_length = reader
        .read_u16()
        .context(ReadPduFieldSnafu { field: "Item-length" })?;
    reader
        .push_limit(u64::from(item_length))
        .context(ReadPduFieldSnafu { field: "Item-length" })?;

    let item = match item_type {
        0x10 => PduVariableItem::ApplicationContext(read_uid(
            reader,
            u64::from(item_length),
            "Application-context-name",
        )?),
        0x20 => {
            PduVariableItem::PresentationContextProposed(read_presentation_context_rq(reader)?)
        }
        0x21 => PduVariableItem::PresentationContextResult(read_presentation_context_ac(reader)?),
        0x50 => PduVariableItem::UserVariables(read_user_information(reader)?),
        item_type => PduVariableItem::Unknown(item_type),
    };

    // drop any unread tail of the item
    reader
        .pop_limit()
        .context(ReadPduFieldSnafu { field: "Item-length" })?;
    Ok(item)
}

fn read_presentation_context_rq<R>(
    reader: &mut DulReader<R>,
) -> Result<PresentationContextProposed>
where
    R: Read,
{
    let id = reader.read_u8().context(ReadPduFieldSnafu {
        field: "Presentation-context-ID",
    })?;
    ensure!(id % 2 == 1, EvenPresentationContextIdSnafu { id });
    reader
        .skip(3)
        .context(ReadPduFieldSnafu { field: "Reserved" })?;

    let mut abstract_syntax = None;
    let mut transfer_syntaxes = Vec::new();

    while !reader.is_limit_exhausted() {
        let item_type = reader
            .read_u8()
            .context(ReadPduFieldSnafu { field: "Item-type" })?;
        reader
            .skip(1)
            .context(ReadPduFieldSnafu { field: "Reserved" })?;
        let item_length = reader
            .read_u16()
            .context(ReadPduFieldSnafu { field: "Item-length" })?;

        match item_type {
            0x30 => {
                abstract_syntax = Some(read_uid(
                    reader,
                    u64::from(item_length),
                    "Abstract-syntax-name",
                )?);
            }
            0x40 => {
                transfer_syntaxes.push(read_uid(
                    reader,
                    u64::from(item_length),
                    "Transfer-syntax-name",
                )?);
            }
            item_type => {
                return UnknownPresentationContextSubItemSnafu { item_type }.fail();
            }
        }
    }

    Ok(PresentationContextProposed {
        id,
        abstract_syntax: abstract_syntax.context(MissingAbstractSyntaxSnafu)?,
        transfer_syntaxes,
    })
}

fn read_presentation_context_ac<R>(reader: &mut DulReader<R>) -> Result<PresentationContextResult>
where
    R: Read,
{
    let id = reader.read_u8().context(ReadPduFieldSnafu {
        field: "Presentation-context-ID",
    })?;
    ensure!(id % 2 == 1, EvenPresentationContextIdSnafu { id });
    reader
        .skip(1)
        .context(ReadPduFieldSnafu { field: "Reserved" })?;
    let reason = PresentationContextResultReason::from(
        reader.read_u8().context(ReadPduFieldSnafu {
            field: "Result/Reason",
        })?,
    )
    .context(InvalidPresentationContextResultReasonSnafu)?;
    reader
        .skip(1)
        .context(ReadPduFieldSnafu { field: "Reserved" })?;

    let mut transfer_syntax = None;

    while !reader.is_limit_exhausted() {
        let item_type = reader
            .read_u8()
            .context(ReadPduFieldSnafu { field: "Item-type" })?;
        reader
            .skip(1)
            .context(ReadPduFieldSnafu { field: "Reserved" })?;
        let item_length = reader
            .read_u16()
            .context(ReadPduFieldSnafu { field: "Item-length" })?;

        match item_type {
            0x40 => {
                ensure!(
                    transfer_syntax.is_none(),
                    MultipleTransferSyntaxesAcceptedSnafu
                );
                transfer_syntax = Some(read_uid(
                    reader,
                    u64::from(item_length),
                    "Transfer-syntax-name",
                )?);
            }
            item_type => {
                return InvalidTransferSyntaxSubItemSnafu { item_type }.fail();
            }
        }
    }

    Ok(PresentationContextResult {
        id,
        reason,
        transfer_syntax: transfer_syntax.context(MissingTransferSyntaxSnafu)?,
    })
}

fn read_user_information<R>(reader: &mut DulReader<R>) -> Result<Vec<UserVariableItem>>
where
    R: Read,
{
    let mut user_variables = Vec::new();

    while !reader.is_limit_exhausted() {
        let item_type = reader
            .read_u8()
            .context(ReadPduFieldSnafu { field: "Item-type" })?;
        reader
            .skip(1)
            .context(ReadPduFieldSnafu { field: "Reserved" })?;
        let item_length = reader
            .read_u16()
            .context(ReadPduFieldSnafu { field: "Item-length" })?;
        reader
            .push_limit(u64::from(item_length))
            .context(ReadPduFieldSnafu { field: "Item-length" })?;

        match item_type {
            0x51 => {
                user_variables.push(UserVariableItem::MaxLength(
                    reader.read_u32().context(ReadPduFieldSnafu {
                        field: "Maximum-length-received",
                    })?,
                ));
            }
            0x52 => {
                user_variables.push(UserVariableItem::ImplementationClassUID(read_uid(
                    reader,
                    u64::from(item_length),
                    "Implementation-class-uid",
                )?));
            }
            0x53 => {
                let max_operations_invoked = reader.read_u16().context(ReadPduFieldSnafu {
                    field: "Maximum-number-operations-invoked",
                })?;
                let max_operations_performed = reader.read_u16().context(ReadPduFieldSnafu {
                    field: "Maximum-number-operations-performed",
                })?;
                user_variables.push(UserVariableItem::AsyncOperationsWindow {
                    max_operations_invoked,
                    max_operations_performed,
                });
            }
            0x54 => {
                let uid_length = reader.read_u16().context(ReadPduFieldSnafu {
                    field: "UID-length",
                })?;
                let sop_class_uid = read_uid(reader, u64::from(uid_length), "SOP-class-uid")?;
                let scu_role = reader
                    .read_u8()
                    .context(ReadPduFieldSnafu { field: "SCU-role" })?;
                let scp_role = reader
                    .read_u8()
                    .context(ReadPduFieldSnafu { field: "SCP-role" })?;
                user_variables.push(UserVariableItem::RoleSelection(RoleSelection {
                    sop_class_uid,
                    scu_role: scu_role != 0,
                    scp_role: scp_role != 0,
                }));
            }
            0x55 => {
                user_variables.push(UserVariableItem::ImplementationVersionName(
                    reader
                        .read_string(u64::from(item_length))
                        .context(ReadPduFieldSnafu {
                            field: "Implementation-version-name",
                        })?
                        .trim()
                        .to_string(),
                ));
            }
            item_type => {
                user_variables.push(UserVariableItem::Unknown(
                    item_type,
                    reader
                        .read_bytes(u64::from(item_length))
                        .context(ReadPduFieldSnafu { field: "User-data" })?,
                ));
            }
        }

        reader
            .pop_limit()
            .context(ReadPduFieldSnafu { field: "Item-length" })?;
    }

    Ok(user_variables)
}

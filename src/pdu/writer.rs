//! Encoding of upper layer PDUs into their big-endian wire form.

use crate::io::DulWriter;
use crate::pdu::*;
use byteordered::Endianness;
use snafu::{Backtrace, ResultExt, Snafu};
use std::io::Write;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("failed to write PDU to output: {}", source))]
    WriteOutput {
        source: std::io::Error,
        backtrace: Backtrace,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Write one PDU in its wire form to the given output.
///
/// The payload length field is filled with the exact
/// length of the encoded payload.
pub fn write_pdu<W>(writer: &mut W, pdu: &Pdu) -> Result<()>
where
    W: Write,
{
    let (pdu_type, payload) = encode_payload(pdu);

    let mut header = DulWriter::with_capacity(Endianness::Big, PDU_HEADER_SIZE as usize);
    header.write_u8(pdu_type);
    header.write_u8(0);
    header.write_u32(payload.len() as u32);

    writer.write_all(header.as_slice()).context(WriteOutputSnafu)?;
    writer.write_all(payload.as_slice()).context(WriteOutputSnafu)?;
    Ok(())
}

fn encode_payload(pdu: &Pdu) -> (u8, DulWriter) {
    let mut payload = DulWriter::new(Endianness::Big);
    match pdu {
        Pdu::AssociationRQ {
            protocol_version,
            calling_ae_title,
            called_ae_title,
            application_context_name,
            presentation_contexts,
            user_variables,
        } => {
            payload.write_u16(*protocol_version);
            payload.write_zeros(2);
            payload.write_ae_title(called_ae_title);
            payload.write_ae_title(calling_ae_title);
            payload.write_zeros(32);

            write_application_context(&mut payload, application_context_name);
            for pc in presentation_contexts {
                write_presentation_context_rq(&mut payload, pc);
            }
            write_user_information(&mut payload, user_variables);
            (0x01, payload)
        }
        Pdu::AssociationAC {
            protocol_version,
            calling_ae_title,
            called_ae_title,
            application_context_name,
            presentation_contexts,
            user_variables,
        } => {
            payload.write_u16(*protocol_version);
            payload.write_zeros(2);
            // reserved fields, echoed from the association request
            payload.write_ae_title(called_ae_title);
            payload.write_ae_title(calling_ae_title);
            payload.write_zeros(32);

            write_application_context(&mut payload, application_context_name);
            for pc in presentation_contexts {
                write_presentation_context_ac(&mut payload, pc);
            }
            write_user_information(&mut payload, user_variables);
            (0x02, payload)
        }
        Pdu::AssociationRJ { result, source } => {
            let (source_code, reason_code) = source.codes();
            payload.write_u8(0);
            payload.write_u8(result.code());
            payload.write_u8(source_code);
            payload.write_u8(reason_code);
            (0x03, payload)
        }
        Pdu::PData { data } => {
            for pdv in data {
                payload.write_u32(pdv.data.len() as u32 + 2);
                payload.write_u8(pdv.presentation_context_id);
                let mut header = 0x00;
                if let PDataValueType::Command = pdv.value_type {
                    header |= 0x01;
                }
                if pdv.is_last {
                    header |= 0x02;
                }
                payload.write_u8(header);
                payload.write_bytes(&pdv.data);
            }
            (0x04, payload)
        }
        Pdu::ReleaseRQ => {
            payload.write_zeros(4);
            (0x05, payload)
        }
        Pdu::ReleaseRP => {
            payload.write_zeros(4);
            (0x06, payload)
        }
        Pdu::AbortRQ { source } => {
            let (source_code, reason_code) = source.codes();
            payload.write_zeros(2);
            payload.write_u8(source_code);
            payload.write_u8(reason_code);
            (0x07, payload)
        }
    }
}

/// Write a length-prefixed item: type byte, reserved byte,
/// then the item body behind its 2-byte length.
fn write_item<F>(writer: &mut DulWriter, item_type: u8, write_body: F)
where
    F: FnOnce(&mut DulWriter),
{
    let mut body = DulWriter::new(Endianness::Big);
    write_body(&mut body);

    writer.write_u8(item_type);
    writer.write_u8(0);
    writer.write_u16(body.len() as u16);
    writer.write_bytes(body.as_slice());
}

fn write_application_context(writer: &mut DulWriter, name: &str) {
    write_item(writer, 0x10, |body| body.write_string(name));
}

fn write_presentation_context_rq(writer: &mut DulWriter, pc: &PresentationContextProposed) {
    write_item(writer, 0x20, |body| {
        body.write_u8(pc.id);
        body.write_zeros(3);
        write_item(body, 0x30, |sub| sub.write_string(&pc.abstract_syntax));
        for transfer_syntax in &pc.transfer_syntaxes {
            write_item(body, 0x40, |sub| sub.write_string(transfer_syntax));
        }
    });
}

fn write_presentation_context_ac(writer: &mut DulWriter, pc: &PresentationContextResult) {
    write_item(writer, 0x21, |body| {
        body.write_u8(pc.id);
        body.write_u8(0);
        body.write_u8(pc.reason as u8);
        body.write_u8(0);
        write_item(body, 0x40, |sub| sub.write_string(&pc.transfer_syntax));
    });
}

fn write_user_information(writer: &mut DulWriter, user_variables: &[UserVariableItem]) {
    if user_variables.is_empty() {
        return;
    }

    write_item(writer, 0x50, |body| {
        for item in user_variables {
            match item {
                UserVariableItem::MaxLength(max_length) => {
                    write_item(body, 0x51, |sub| sub.write_u32(*max_length));
                }
                UserVariableItem::ImplementationClassUID(uid) => {
                    write_item(body, 0x52, |sub| sub.write_string(uid));
                }
                UserVariableItem::AsyncOperationsWindow {
                    max_operations_invoked,
                    max_operations_performed,
                } => {
                    write_item(body, 0x53, |sub| {
                        sub.write_u16(*max_operations_invoked);
                        sub.write_u16(*max_operations_performed);
                    });
                }
                UserVariableItem::RoleSelection(role_selection) => {
                    write_item(body, 0x54, |sub| {
                        sub.write_u16(role_selection.sop_class_uid.len() as u16);
                        sub.write_string(&role_selection.sop_class_uid);
                        sub.write_u8(role_selection.scu_role.into());
                        sub.write_u8(role_selection.scp_role.into());
                    });
                }
                UserVariableItem::ImplementationVersionName(name) => {
                    write_item(body, 0x55, |sub| sub.write_string(name));
                }
                UserVariableItem::Unknown(item_type, data) => {
                    write_item(body, *item_type, |sub| sub.write_bytes(data));
                }
            }
        }
    });
}

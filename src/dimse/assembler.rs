//! Reassembly of DIMSE messages from P-DATA-TF fragments.

use bytes::{Bytes, BytesMut};
use snafu::{ensure, Backtrace, ResultExt, Snafu};

use crate::dimse::{self, Message};
use crate::pdu::{PDataValue, PDataValueType};

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display(
        "mixed presentation contexts in message: expected {}, got {}",
        expected,
        got
    ))]
    MixedPresentationContexts {
        expected: u8,
        got: u8,
        backtrace: Backtrace,
    },

    #[snafu(display("more than one command fragment with the last flag set"))]
    CommandStreamReuse { backtrace: Backtrace },

    #[snafu(display("more than one data fragment with the last flag set"))]
    DataStreamReuse { backtrace: Backtrace },

    #[snafu(display("could not decode command set: {}", source))]
    DecodeCommand {
        #[snafu(backtrace)]
        source: dimse::Error,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// One logical DIMSE exchange unit,
/// reassembled from a sequence of P-DATA-TF fragments.
#[derive(Debug, Clone, PartialEq)]
pub struct DimseMessage {
    pub presentation_context_id: u8,
    pub command: Message,
    /// the accompanying data set bytes, empty when the command
    /// declares no data
    pub data: Bytes,
}

/// Rebuilds `(context, command, data)` triples from the
/// presentation data values of incoming P-DATA-TF PDUs.
///
/// Command and data fragments are buffered separately until each
/// stream sees its final fragment; the command set is then decoded
/// and, once any declared data set is complete as well, the whole
/// message is emitted and the assembler resets. Fragments following
/// a completed message in the same PDU begin the next message.
#[derive(Debug, Default)]
pub struct CommandAssembler {
    presentation_context_id: Option<u8>,
    command_bytes: BytesMut,
    data_bytes: BytesMut,
    command: Option<Message>,
    command_complete: bool,
    data_complete: bool,
}

impl CommandAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the presentation data values of one P-DATA-TF PDU,
    /// collecting any messages that become complete.
    pub fn add_pdata<I>(&mut self, values: I) -> Result<Vec<DimseMessage>>
    where
        I: IntoIterator<Item = PDataValue>,
    {
        let mut complete = Vec::new();
        for value in values {
            if let Some(message) = self.add_value(value)? {
                complete.push(message);
            }
        }
        Ok(complete)
    }

    fn add_value(&mut self, value: PDataValue) -> Result<Option<DimseMessage>> {
        match self.presentation_context_id {
            None => self.presentation_context_id = Some(value.presentation_context_id),
            Some(expected) => {
                ensure!(
                    expected == value.presentation_context_id,
                    MixedPresentationContextsSnafu {
                        expected,
                        got: value.presentation_context_id,
                    }
                );
            }
        }

        match value.value_type {
            PDataValueType::Command => {
                self.command_bytes.extend_from_slice(&value.data);
                if value.is_last {
                    ensure!(!self.command_complete, CommandStreamReuseSnafu);
                    self.command_complete = true;
                }
            }
            PDataValueType::Data => {
                self.data_bytes.extend_from_slice(&value.data);
                if value.is_last {
                    ensure!(!self.data_complete, DataStreamReuseSnafu);
                    self.data_complete = true;
                }
            }
        }

        if !self.command_complete {
            return Ok(None);
        }
        if self.command.is_none() {
            self.command =
                Some(dimse::read_message(&self.command_bytes).context(DecodeCommandSnafu)?);
        }
        let has_data = self
            .command
            .as_ref()
            .map(Message::has_data)
            .unwrap_or(false);
        if has_data && !self.data_complete {
            return Ok(None);
        }

        let message = DimseMessage {
            presentation_context_id: self.presentation_context_id.take().unwrap_or_default(),
            command: self.command.take().expect("command was just decoded"),
            data: std::mem::take(&mut self.data_bytes).freeze(),
        };
        self.command_bytes.clear();
        self.command_complete = false;
        self.data_complete = false;
        Ok(Some(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dimse::{
        status, CEchoRq, CStoreRq, CStoreRsp, Status, COMMAND_DATA_SET_TYPE_NON_NULL,
        COMMAND_DATA_SET_TYPE_NULL,
    };
    use dicom_object::InMemDicomObject;
    use matches::matches;

    fn store_rq() -> Message {
        Message::CStoreRq(CStoreRq {
            affected_sop_class_uid: "1.2.840.10008.5.1.4.1.1.2".to_string(),
            message_id: 1,
            priority: 0,
            command_data_set_type: COMMAND_DATA_SET_TYPE_NON_NULL,
            affected_sop_instance_uid: "1.2.3.4".to_string(),
            move_originator_ae_title: None,
            move_originator_message_id: None,
            extra: InMemDicomObject::new_empty(),
        })
    }

    fn echo_rq() -> Message {
        Message::CEchoRq(CEchoRq {
            message_id: 2,
            command_data_set_type: COMMAND_DATA_SET_TYPE_NULL,
            extra: InMemDicomObject::new_empty(),
        })
    }

    fn pdv(context_id: u8, value_type: PDataValueType, is_last: bool, data: Vec<u8>) -> PDataValue {
        PDataValue {
            presentation_context_id: context_id,
            value_type,
            is_last,
            data,
        }
    }

    #[test]
    fn assembles_fragmented_command_and_data() {
        let command_bytes = dimse::write_message(&store_rq()).unwrap();
        let (head, tail) = command_bytes.split_at(command_bytes.len() / 2);
        let payload: Vec<u8> = (0..=255).cycle().take(5000).map(|b: u16| b as u8).collect();

        let mut assembler = CommandAssembler::new();
        assert_eq!(
            assembler
                .add_pdata(vec![pdv(1, PDataValueType::Command, false, head.to_vec())])
                .unwrap(),
            vec![]
        );
        assert_eq!(
            assembler
                .add_pdata(vec![pdv(1, PDataValueType::Command, true, tail.to_vec())])
                .unwrap(),
            vec![]
        );
        assert_eq!(
            assembler
                .add_pdata(vec![pdv(1, PDataValueType::Data, false, payload[..2000].to_vec())])
                .unwrap(),
            vec![]
        );
        let complete = assembler
            .add_pdata(vec![pdv(1, PDataValueType::Data, true, payload[2000..].to_vec())])
            .unwrap();

        assert_eq!(complete.len(), 1);
        let message = &complete[0];
        assert_eq!(message.presentation_context_id, 1);
        assert_eq!(message.command, store_rq());
        assert_eq!(&message.data[..], &payload[..]);
    }

    #[test]
    fn command_without_data_completes_immediately() {
        let command_bytes = dimse::write_message(&echo_rq()).unwrap();
        let mut assembler = CommandAssembler::new();
        let complete = assembler
            .add_pdata(vec![pdv(5, PDataValueType::Command, true, command_bytes)])
            .unwrap();
        assert_eq!(complete.len(), 1);
        assert_eq!(complete[0].command, echo_rq());
        assert!(complete[0].data.is_empty());
    }

    #[test]
    fn rejects_mixed_presentation_contexts() {
        let command_bytes = dimse::write_message(&store_rq()).unwrap();
        let mut assembler = CommandAssembler::new();
        assembler
            .add_pdata(vec![pdv(1, PDataValueType::Command, true, command_bytes)])
            .unwrap();
        // the store command declares data, so the assembler is still open
        let result = assembler.add_pdata(vec![pdv(3, PDataValueType::Data, true, vec![0; 8])]);
        assert!(matches!(
            result,
            Err(Error::MixedPresentationContexts {
                expected: 1,
                got: 3,
                ..
            })
        ));
    }

    #[test]
    fn rejects_second_last_flag() {
        let command_bytes = dimse::write_message(&store_rq()).unwrap();
        let mut assembler = CommandAssembler::new();
        assembler
            .add_pdata(vec![pdv(1, PDataValueType::Command, true, command_bytes)])
            .unwrap();
        let result = assembler.add_pdata(vec![pdv(1, PDataValueType::Command, true, vec![])]);
        assert!(matches!(result, Err(Error::CommandStreamReuse { .. })));
    }

    #[test]
    fn trailing_values_begin_the_next_message() {
        let echo_bytes = dimse::write_message(&echo_rq()).unwrap();

        // two echo commands packed into a single PDU,
        // on different presentation contexts
        let mut assembler = CommandAssembler::new();
        let complete = assembler
            .add_pdata(vec![
                pdv(1, PDataValueType::Command, true, echo_bytes.clone()),
                pdv(3, PDataValueType::Command, true, echo_bytes),
            ])
            .unwrap();

        assert_eq!(complete.len(), 2);
        assert_eq!(complete[0].presentation_context_id, 1);
        assert_eq!(complete[1].presentation_context_id, 3);
    }

    #[test]
    fn concatenation_preserves_fragment_order() {
        let response = Message::CStoreRsp(CStoreRsp {
            affected_sop_class_uid: "1.2.840.10008.5.1.4.1.1.2".to_string(),
            message_id_being_responded_to: 1,
            command_data_set_type: COMMAND_DATA_SET_TYPE_NULL,
            affected_sop_instance_uid: "1.2.3.4".to_string(),
            status: Status::from_code(status::SUCCESS),
            extra: InMemDicomObject::new_empty(),
        });
        let command_bytes = dimse::write_message(&response).unwrap();

        // single-byte command fragments, in order
        let mut assembler = CommandAssembler::new();
        let mut complete = Vec::new();
        for (i, byte) in command_bytes.iter().enumerate() {
            let is_last = i == command_bytes.len() - 1;
            complete.extend(
                assembler
                    .add_pdata(vec![pdv(1, PDataValueType::Command, is_last, vec![*byte])])
                    .unwrap(),
            );
        }
        assert_eq!(complete.len(), 1);
        assert_eq!(complete[0].command, response);
    }
}

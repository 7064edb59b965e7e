use crate::pdu::reader::{read_pdu, Error};
use crate::pdu::writer::write_pdu;
use crate::pdu::*;
use matches::matches;
use std::io::Cursor;

type Result<T> = std::result::Result<T, Box<dyn std::error::Error>>;

fn roundtrip(pdu: &Pdu) -> Result<Pdu> {
    let mut bytes = Vec::new();
    write_pdu(&mut bytes, pdu)?;
    Ok(read_pdu(&mut Cursor::new(&bytes), DEFAULT_MAX_PDU)?)
}

#[test]
fn can_read_write_associate_rq() -> Result<()> {
    let association_rq = Pdu::AssociationRQ {
        protocol_version: 1,
        calling_ae_title: "STORE-SCU".to_string(),
        called_ae_title: "MAIN-STORAGE".to_string(),
        application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
        presentation_contexts: vec![
            PresentationContextProposed {
                id: 1,
                abstract_syntax: "1.2.840.10008.1.1".to_string(),
                transfer_syntaxes: vec![
                    "1.2.840.10008.1.2".to_string(),
                    "1.2.840.10008.1.2.1".to_string(),
                ],
            },
            PresentationContextProposed {
                id: 3,
                abstract_syntax: "1.2.840.10008.5.1.4.1.1.2".to_string(),
                transfer_syntaxes: vec!["1.2.840.10008.1.2".to_string()],
            },
        ],
        user_variables: vec![
            UserVariableItem::MaxLength(16_384),
            UserVariableItem::ImplementationClassUID("1.2.826.0.1.3680043.10.786.1.1.1".to_string()),
            UserVariableItem::ImplementationVersionName("DICOM-DUL 0.1".to_string()),
        ],
    };

    assert_eq!(roundtrip(&association_rq)?, association_rq);
    Ok(())
}

#[test]
fn can_read_write_associate_ac() -> Result<()> {
    let association_ac = Pdu::AssociationAC {
        protocol_version: 1,
        calling_ae_title: "STORE-SCU".to_string(),
        called_ae_title: "MAIN-STORAGE".to_string(),
        application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
        presentation_contexts: vec![
            PresentationContextResult {
                id: 1,
                reason: PresentationContextResultReason::Acceptance,
                transfer_syntax: "1.2.840.10008.1.2".to_string(),
            },
            PresentationContextResult {
                id: 3,
                reason: PresentationContextResultReason::TransferSyntaxesNotSupported,
                transfer_syntax: "1.2.840.10008.1.2".to_string(),
            },
        ],
        user_variables: vec![UserVariableItem::MaxLength(32_768)],
    };

    assert_eq!(roundtrip(&association_ac)?, association_ac);
    Ok(())
}

#[test]
fn can_read_write_associate_rj() -> Result<()> {
    let association_rj = Pdu::AssociationRJ {
        result: AssociationRJResult::Permanent,
        source: AssociationRJSource::ServiceUser(
            AssociationRJServiceUserReason::ApplicationContextNameNotSupported,
        ),
    };

    assert_eq!(roundtrip(&association_rj)?, association_rj);
    Ok(())
}

#[test]
fn can_read_write_pdata() -> Result<()> {
    let pdata = Pdu::PData {
        data: vec![
            PDataValue {
                presentation_context_id: 3,
                value_type: PDataValueType::Command,
                is_last: true,
                data: vec![8; 32],
            },
            PDataValue {
                presentation_context_id: 3,
                value_type: PDataValueType::Data,
                is_last: false,
                data: vec![16; 1024],
            },
        ],
    };

    assert_eq!(roundtrip(&pdata)?, pdata);
    Ok(())
}

#[test]
fn can_read_write_release_and_abort() -> Result<()> {
    assert_eq!(roundtrip(&Pdu::ReleaseRQ)?, Pdu::ReleaseRQ);
    assert_eq!(roundtrip(&Pdu::ReleaseRP)?, Pdu::ReleaseRP);

    let abort = Pdu::AbortRQ {
        source: AbortRQSource::ServiceProvider(AbortRQServiceProviderReason::UnexpectedPdu),
    };
    assert_eq!(roundtrip(&abort)?, abort);

    let abort = Pdu::AbortRQ {
        source: AbortRQSource::ServiceUser,
    };
    assert_eq!(roundtrip(&abort)?, abort);
    Ok(())
}

#[test]
fn preserves_role_selection_and_unknown_user_items() -> Result<()> {
    let association_rq = Pdu::AssociationRQ {
        protocol_version: 1,
        calling_ae_title: "GET-SCU".to_string(),
        called_ae_title: "ARCHIVE".to_string(),
        application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
        presentation_contexts: vec![PresentationContextProposed {
            id: 1,
            abstract_syntax: "1.2.840.10008.5.1.4.1.2.2.3".to_string(),
            transfer_syntaxes: vec!["1.2.840.10008.1.2".to_string()],
        }],
        user_variables: vec![
            UserVariableItem::RoleSelection(RoleSelection {
                sop_class_uid: "1.2.840.10008.5.1.4.1.1.2".to_string(),
                scu_role: false,
                scp_role: true,
            }),
            UserVariableItem::AsyncOperationsWindow {
                max_operations_invoked: 1,
                max_operations_performed: 1,
            },
            UserVariableItem::Unknown(0x56, vec![0xCA, 0xFE]),
        ],
    };

    assert_eq!(roundtrip(&association_rq)?, association_rq);
    Ok(())
}

#[test]
fn rejects_oversized_pdu_declarations() -> Result<()> {
    // 6-byte header declaring a payload far beyond 2x the maximum
    let bytes = [0x04, 0x00, 0x7F, 0xFF, 0xFF, 0xFF];
    let result = read_pdu(&mut Cursor::new(&bytes), MINIMUM_PDU_SIZE);
    assert!(matches!(result, Err(Error::PduTooLarge { .. })));
    Ok(())
}

#[test]
fn rejects_unknown_pdu_type() -> Result<()> {
    let bytes = [0x7F, 0x00, 0x00, 0x00, 0x00, 0x04, 0, 0, 0, 0];
    let result = read_pdu(&mut Cursor::new(&bytes), DEFAULT_MAX_PDU);
    assert!(matches!(result, Err(Error::UnknownPduType { pdu_type: 0x7F, .. })));
    Ok(())
}

#[test]
fn rejects_even_presentation_context_id() -> Result<()> {
    let mut bytes = Vec::new();
    write_pdu(
        &mut bytes,
        &Pdu::AssociationRQ {
            protocol_version: 1,
            calling_ae_title: "A".to_string(),
            called_ae_title: "B".to_string(),
            application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
            presentation_contexts: vec![PresentationContextProposed {
                id: 2,
                abstract_syntax: "1.2.840.10008.1.1".to_string(),
                transfer_syntaxes: vec!["1.2.840.10008.1.2".to_string()],
            }],
            user_variables: vec![],
        },
    )?;

    let result = read_pdu(&mut Cursor::new(&bytes), DEFAULT_MAX_PDU);
    assert!(matches!(
        result,
        Err(Error::EvenPresentationContextId { id: 2, .. })
    ));
    Ok(())
}

#[test]
fn rejects_blank_ae_titles() -> Result<()> {
    let mut bytes = Vec::new();
    write_pdu(
        &mut bytes,
        &Pdu::AssociationRQ {
            protocol_version: 1,
            calling_ae_title: "SOME-SCU".to_string(),
            called_ae_title: "    ".to_string(),
            application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
            presentation_contexts: vec![],
            user_variables: vec![],
        },
    )?;

    let result = read_pdu(&mut Cursor::new(&bytes), DEFAULT_MAX_PDU);
    assert!(matches!(
        result,
        Err(Error::MissingAeTitle {
            field: "Called-AE-title",
            ..
        })
    ));
    Ok(())
}

#[test]
fn truncates_long_ae_titles_on_encode() -> Result<()> {
    let pdu = Pdu::AssociationRQ {
        protocol_version: 1,
        calling_ae_title: "A-VERY-LONG-CALLING-AE-TITLE".to_string(),
        called_ae_title: "PEER".to_string(),
        application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
        presentation_contexts: vec![],
        user_variables: vec![],
    };

    match roundtrip(&pdu)? {
        Pdu::AssociationRQ {
            calling_ae_title, ..
        } => assert_eq!(calling_ae_title, "A-VERY-LONG-CALL"),
        other => panic!("unexpected PDU {:?}", other),
    }
    Ok(())
}

#[test]
fn no_pdu_available_on_clean_eof() {
    let result = read_pdu(&mut Cursor::new(&[]), DEFAULT_MAX_PDU);
    assert!(matches!(result, Err(Error::NoPduAvailable { .. })));
}

#[test]
fn header_length_matches_payload() -> Result<()> {
    let mut bytes = Vec::new();
    write_pdu(
        &mut bytes,
        &Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id: 1,
                value_type: PDataValueType::Data,
                is_last: true,
                data: vec![0; 100],
            }],
        },
    )?;

    let declared = u32::from_be_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]);
    assert_eq!(declared as usize, bytes.len() - PDU_HEADER_SIZE as usize);
    Ok(())
}

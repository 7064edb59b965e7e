use std::net::TcpListener;

use dicom_core::{DataElement, PrimitiveValue, VR};
use dicom_dictionary_std::tags;
use dicom_dul::pdu::{
    read_pdu, write_pdu, AbortRQServiceProviderReason, AbortRQSource, Pdu,
    PresentationContextResult, PresentationContextResultReason, UserVariableItem,
    DEFAULT_MAX_PDU,
};
use dicom_dul::service::{Error, ServiceUserOptions};
use dicom_object::InMemDicomObject;
use matches::matches;

type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync + 'static>>;

static CT_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.2";
static IMPLICIT_VR_LE: &str = "1.2.840.10008.1.2";

/// A peer that accepts the association and then aborts
/// in the middle of the C-STORE transfer.
#[test]
fn peer_abort_mid_transfer_fails_the_operation() -> Result<()> {
    let listener = TcpListener::bind("localhost:0")?;
    let addr = listener.local_addr()?;

    let scp = std::thread::spawn(move || -> Result<()> {
        let (mut stream, _) = listener.accept()?;

        // accept whatever was proposed, in implicit VR little endian
        let (contexts, calling_ae_title, called_ae_title) =
            match read_pdu(&mut stream, DEFAULT_MAX_PDU)? {
                Pdu::AssociationRQ {
                    presentation_contexts,
                    calling_ae_title,
                    called_ae_title,
                    ..
                } => (presentation_contexts, calling_ae_title, called_ae_title),
                other => panic!("unexpected PDU {:?}", other),
            };
        let response = Pdu::AssociationAC {
            protocol_version: 1,
            calling_ae_title,
            called_ae_title,
            application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
            presentation_contexts: contexts
                .iter()
                .map(|pc| PresentationContextResult {
                    id: pc.id,
                    reason: PresentationContextResultReason::Acceptance,
                    transfer_syntax: IMPLICIT_VR_LE.to_string(),
                })
                .collect(),
            user_variables: vec![UserVariableItem::MaxLength(DEFAULT_MAX_PDU)],
        };
        write_pdu(&mut stream, &response)?;

        // let the transfer begin, then pull the plug
        let first = read_pdu(&mut stream, DEFAULT_MAX_PDU)?;
        assert!(matches!(first, Pdu::PData { .. }));
        write_pdu(
            &mut stream,
            &Pdu::AbortRQ {
                source: AbortRQSource::ServiceProvider(
                    AbortRQServiceProviderReason::UnrecognizedPduParameter,
                ),
            },
        )?;
        Ok(())
    });

    let mut object = InMemDicomObject::new_empty();
    object.put(DataElement::new(
        tags::SOP_CLASS_UID,
        VR::UI,
        PrimitiveValue::from(CT_IMAGE_STORAGE),
    ));
    object.put(DataElement::new(
        tags::SOP_INSTANCE_UID,
        VR::UI,
        PrimitiveValue::from("1.2.3.4"),
    ));
    object.put(DataElement::new(
        tags::PIXEL_DATA,
        VR::OB,
        PrimitiveValue::from(vec![0x11_u8; 256 * 1024]),
    ));

    let mut scu = ServiceUserOptions::new()
        .calling_ae_title("STORE-SCU")
        .called_ae_title("FLAKY-SCP")
        .with_presentation_context(CT_IMAGE_STORAGE, vec![IMPLICIT_VR_LE])
        .connect(addr)?;

    let outcome = scu.c_store(&object);
    match outcome {
        Err(Error::Aborted { source }) => {
            assert_eq!(
                source,
                AbortRQSource::ServiceProvider(
                    AbortRQServiceProviderReason::UnrecognizedPduParameter
                )
            );
        }
        other => panic!("expected abort, got {:?}", other.err()),
    }

    // the association is unusable from here on
    assert!(scu.c_store(&object).is_err());

    scp.join().unwrap()?;
    Ok(())
}
